//! The agent loop (C5 §4.5): the single long-lived state machine that owns
//! one session — its [`crate::log::MessageLog`], its [`crate::engine::Engine`],
//! and the queue of user messages waiting to be turned into turns.
//!
//! `Agent` is the thing a binary (CLI or HTTP server) actually holds: it
//! exposes the handful of verbs a caller needs (`init`, `user_message`,
//! `cancel`, subscribe-from-index, usage) and hides the turn-loop plumbing
//! behind a background task, generalizing the teacher's one-shot
//! `Client::query` into a resident, cancellable, multi-turn session.

use crate::config::{Provider, get_base_url, get_model};
use crate::dispatch::{Dispatcher, ToolRegistry};
use crate::engine::Engine;
use crate::hooks::Hooks;
use crate::llm::{LlmService, OpenAiCompatibleService};
use crate::log::{LogEvent, MessageLog};
use crate::message::{ConversationId, Usage};
use crate::retry::RetryConfig;
use crate::review::ReviewContext;
use crate::tools::{bash_tool, codereview_tool};
use crate::types::ModelOptions;
use crate::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Configuration needed to bring an [`Agent`] from `Uninitialised` to
/// `Idle` (§4.5 `Init`).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub system_prompt: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub provider: Option<Provider>,
    pub api_key: Option<String>,
    pub max_dollars: f64,
    pub workspace: PathBuf,
    pub bash_fast_timeout: Duration,
    pub bash_slow_timeout: Duration,
    pub bash_background_timeout: Duration,
    pub context_window: u32,
    pub one_shot: bool,
    /// Base ref the `codereview` tool compares `HEAD` against.
    pub review_base: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            model: None,
            base_url: None,
            provider: None,
            api_key: None,
            max_dollars: 0.0,
            workspace: PathBuf::from("."),
            bash_fast_timeout: Duration::from_secs(30),
            bash_slow_timeout: Duration::from_secs(600),
            bash_background_timeout: Duration::from_secs(3600),
            context_window: 128_000,
            one_shot: false,
            review_base: "HEAD".to_string(),
        }
    }
}

/// The agent's externally-observable lifecycle (§4.5 "State machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialised,
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

struct Queued {
    text: String,
    done: Option<tokio::sync::oneshot::Sender<Result<()>>>,
}

struct Initialised {
    engine: Arc<Engine>,
    dispatcher: Arc<Dispatcher>,
    conversation_id: ConversationId,
    queue_tx: mpsc::UnboundedSender<Queued>,
    worker: tokio::task::JoinHandle<()>,
    turn_token: Arc<Mutex<Option<CancellationToken>>>,
}

/// The resident session state machine.
///
/// Cheap to clone: everything lives behind `Arc`. `init` is idempotent (R2):
/// calling it again on an already-initialised agent is a no-op that returns
/// `Ok(())` without resetting the log or re-spawning the worker.
pub struct Agent {
    state: watch::Sender<AgentState>,
    inner: Mutex<Option<Initialised>>,
}

impl Agent {
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(AgentState::Uninitialised);
        Arc::new(Self {
            state,
            inner: Mutex::new(None),
        })
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn ready(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Bring the agent up: construct the LLM backend, tool registry, log,
    /// and engine, then spawn the background worker that drains the user
    /// message queue one turn at a time (§4.5 `Init`, R2 idempotence).
    pub async fn init(self: &Arc<Self>, cfg: AgentConfig) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let model = cfg
            .model
            .clone()
            .or_else(|| get_model(None, true))
            .ok_or_else(|| Error::config("no model configured"))?;
        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| get_base_url(cfg.provider, None));

        let mut options_builder = ModelOptions::builder()
            .system_prompt(cfg.system_prompt.clone())
            .model(model)
            .base_url(base_url)
            .timeout(cfg.bash_slow_timeout.as_secs().max(60));
        if let Some(key) = &cfg.api_key {
            options_builder = options_builder.api_key(key.clone());
        }
        let options = options_builder.build()?;

        let llm: Arc<dyn LlmService> = Arc::new(
            OpenAiCompatibleService::new(options, cfg.context_window)?
                .with_retry_config(RetryConfig::default()),
        );

        let review_ctx = Arc::new(ReviewContext::new(cfg.workspace.clone(), cfg.review_base.clone()));

        let mut registry = ToolRegistry::new();
        registry.register(bash_tool(
            cfg.workspace.clone(),
            cfg.bash_fast_timeout,
            cfg.bash_slow_timeout,
            cfg.bash_background_timeout,
        ));
        registry.register(codereview_tool(review_ctx));
        let registry = Arc::new(registry);

        let hooks = Arc::new(Hooks::new());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            hooks,
            cfg.bash_background_timeout,
        ));
        let log = Arc::new(MessageLog::new(Uuid::new_v4()));
        let engine = Arc::new(Engine::new(
            llm,
            registry,
            dispatcher.clone(),
            log.clone(),
            cfg.max_dollars,
        ));

        let conversation_id = Uuid::new_v4();
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<Queued>();
        let turn_token: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));

        let worker_engine = engine.clone();
        let worker_state = self.state.clone();
        let worker_token = turn_token.clone();
        let system_prompt = cfg.system_prompt.clone();
        let one_shot = cfg.one_shot;

        let worker = tokio::spawn(async move {
            while let Some(item) = queue_rx.recv().await {
                if *worker_state.borrow() == AgentState::ShuttingDown {
                    if let Some(done) = item.done {
                        let _ = done.send(Err(Error::cancelled("agent shutting down")));
                    }
                    continue;
                }

                let _ = worker_state.send(AgentState::Running);
                let token = CancellationToken::new();
                *worker_token.lock().await = Some(token.clone());

                let result = worker_engine
                    .run_turn(conversation_id, &system_prompt, &item.text, &token)
                    .await
                    .map(|_| ());

                *worker_token.lock().await = None;
                if *worker_state.borrow() != AgentState::ShuttingDown {
                    let _ = worker_state.send(AgentState::Idle);
                }

                if let Some(done) = item.done {
                    let _ = done.send(result);
                }

                if one_shot {
                    break;
                }
            }
        });

        *guard = Some(Initialised {
            engine,
            dispatcher,
            conversation_id,
            queue_tx,
            worker,
            turn_token,
        });
        drop(guard);

        let _ = self.state.send(AgentState::Idle);
        Ok(())
    }

    /// Enqueue a user message; returns once the resulting turn has
    /// finished (or failed — turn errors are surfaced here *and* already
    /// logged by the engine, per §7). Rejected once the agent has begun
    /// shutting down (§4.5 state machine).
    pub async fn user_message(&self, text: impl Into<String>) -> Result<()> {
        if self.state() == AgentState::ShuttingDown || self.state() == AgentState::Stopped {
            return Err(Error::cancelled("agent is not accepting new messages"));
        }
        let guard = self.inner.lock().await;
        let Some(initialised) = guard.as_ref() else {
            return Err(Error::config("agent not initialised"));
        };

        let (tx, rx) = tokio::sync::oneshot::channel();
        initialised
            .queue_tx
            .send(Queued {
                text: text.into(),
                done: Some(tx),
            })
            .map_err(|_| Error::fatal("agent worker is gone"))?;
        drop(guard);

        rx.await.map_err(|_| Error::fatal("agent worker dropped the response channel"))?
    }

    /// Cancel the in-flight turn (if any) and, when `tool_call_id` is
    /// given, only that one tool call rather than the whole turn (§4.5
    /// `Cancel`).
    pub async fn cancel(&self, tool_call_id: Option<&str>) -> Result<()> {
        let guard = self.inner.lock().await;
        let Some(initialised) = guard.as_ref() else {
            return Err(Error::config("agent not initialised"));
        };

        if let Some(id) = tool_call_id {
            initialised.dispatcher.cancel_call(id);
            return Ok(());
        }

        if let Some(token) = initialised.turn_token.lock().await.as_ref() {
            token.cancel();
        }
        Ok(())
    }

    /// A fresh subscription to the log from `from_idx` (§4.5 `NewIterator`).
    pub async fn subscribe(&self, from_idx: u64) -> Result<impl futures::Stream<Item = LogEvent> + Send + 'static> {
        let guard = self.inner.lock().await;
        let Some(initialised) = guard.as_ref() else {
            return Err(Error::config("agent not initialised"));
        };
        Ok(initialised.engine.log().subscribe(from_idx).await)
    }

    /// Running total cost/tokens across the session (§4.5 `TotalUsage`).
    pub async fn total_usage(&self) -> Result<Usage> {
        let guard = self.inner.lock().await;
        let Some(initialised) = guard.as_ref() else {
            return Err(Error::config("agent not initialised"));
        };
        Ok(initialised.engine.log().state().await.total_usage)
    }

    pub async fn conversation_id(&self) -> Result<ConversationId> {
        let guard = self.inner.lock().await;
        guard
            .as_ref()
            .map(|i| i.conversation_id)
            .ok_or_else(|| Error::config("agent not initialised"))
    }

    pub async fn log(&self) -> Result<Arc<MessageLog>> {
        let guard = self.inner.lock().await;
        guard
            .as_ref()
            .map(|i| i.engine.log().clone())
            .ok_or_else(|| Error::config("agent not initialised"))
    }

    /// Begin shutdown: stop accepting new messages, cancel any in-flight
    /// turn, drain the worker, and mark the log session ended (§4.5
    /// `ShuttingDown` -> `Stopped`).
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        let _ = self.state.send(AgentState::ShuttingDown);
        let mut guard = self.inner.lock().await;
        let Some(initialised) = guard.take() else {
            let _ = self.state.send(AgentState::Stopped);
            return Ok(());
        };

        if let Some(token) = initialised.turn_token.lock().await.as_ref() {
            token.cancel();
        }
        drop(initialised.queue_tx);
        let _ = initialised.worker.await;
        initialised.engine.log().end_session().await;

        let _ = self.state.send(AgentState::Stopped);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_zero_budget_meaning_unlimited() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.max_dollars, 0.0);
    }

    #[tokio::test]
    async fn fresh_agent_starts_uninitialised() {
        let agent = Agent::new();
        assert_eq!(agent.state(), AgentState::Uninitialised);
    }

    #[tokio::test]
    async fn operations_before_init_return_config_error() {
        let agent = Agent::new();
        let err = agent.user_message("hi").await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)) || matches!(err, Error::Config(_)));
        assert!(agent.total_usage().await.is_err());
        assert!(agent.cancel(None).await.is_err());
    }

    #[tokio::test]
    async fn shutdown_without_init_is_a_noop_transition() {
        let agent = Agent::new();
        agent.shutdown().await.unwrap();
        assert_eq!(agent.state(), AgentState::Stopped);
    }
}

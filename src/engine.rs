//! The conversation engine (C4 §4.4): drives one turn at a time, composing
//! requests from the durable log, calling the LLM, dispatching any tool
//! calls it asks for, and looping until the turn naturally ends.
//!
//! This generalizes the teacher's `Client::auto_execute_loop` (collect
//! blocks → split text/tool-use → dispatch → push results → loop), swapping
//! its sequential manual dispatch for [`crate::dispatch::Dispatcher`]'s
//! parallel `JoinSet` execution and adding budget pre-flight, retry (via
//! [`crate::llm::LlmService::do_request`], which already embeds the retry
//! policy), and a context-window compaction branch.

use crate::dispatch::{Dispatcher, ToolRegistry};
use crate::hooks::Hooks;
use crate::llm::{LlmRequest, LlmService, StopReason};
use crate::log::MessageLog;
use crate::message::{Budget, ConversationId, Message, MessageType, ToolCall};
use crate::types::{ChatMessage, ContentBlock, MessageRole, TextBlock, ToolResultBlock, ToolUseBlock};
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// How a call to [`Engine::run_turn`] or [`Engine::run_sub_conversation`]
/// concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The model reached `stop_reason = end_turn` with no pending tool calls.
    Ended,
    /// A tool marked `ends_turn` completed successfully.
    EndedByTool,
}

/// Drives turns against a shared [`MessageLog`], [`ToolRegistry`], and
/// [`LlmService`]. Cheap to clone (everything behind `Arc`); safe to share
/// across conversations, since turns within one `conversation_id` are the
/// only thing required to be serialised, and callers are expected to not
/// run two turns concurrently on the same id (§5).
pub struct Engine {
    llm: Arc<dyn LlmService>,
    registry: Arc<ToolRegistry>,
    dispatcher: Arc<Dispatcher>,
    log: Arc<MessageLog>,
    max_dollars: f64,
}

impl Engine {
    pub fn new(
        llm: Arc<dyn LlmService>,
        registry: Arc<ToolRegistry>,
        dispatcher: Arc<Dispatcher>,
        log: Arc<MessageLog>,
        max_dollars: f64,
    ) -> Self {
        Self {
            llm,
            registry,
            dispatcher,
            log,
            max_dollars,
        }
    }

    pub fn log(&self) -> &Arc<MessageLog> {
        &self.log
    }

    /// Run one top-level turn for `conversation_id`: append the user
    /// message, then drive LLM round-trips and tool dispatch until the turn
    /// ends. On any error the failure is appended to the log as an `error`
    /// message before being returned (§7: "every failure path must append a
    /// message to the log").
    pub async fn run_turn(
        &self,
        conversation_id: ConversationId,
        system_prompt: &str,
        user_text: &str,
        turn_token: &CancellationToken,
    ) -> Result<TurnOutcome> {
        self.run_turn_scoped(conversation_id, None, system_prompt, user_text, None, turn_token)
            .await
    }

    /// Spawn and run a sub-conversation: its own `conversation_id`, its own
    /// system prompt and tool visibility, `parent_id` recorded on every
    /// message it produces. Shares the parent's budget and log (§4.4).
    pub async fn run_sub_conversation(
        &self,
        parent_id: ConversationId,
        system_prompt: &str,
        visible_tools: &[String],
        user_text: &str,
        turn_token: &CancellationToken,
    ) -> Result<(ConversationId, TurnOutcome)> {
        let conversation_id = Uuid::new_v4();
        let outcome = self
            .run_turn_scoped(
                conversation_id,
                Some(parent_id),
                system_prompt,
                user_text,
                Some(visible_tools),
                turn_token,
            )
            .await?;
        Ok((conversation_id, outcome))
    }

    async fn run_turn_scoped(
        &self,
        conversation_id: ConversationId,
        parent: Option<ConversationId>,
        system_prompt: &str,
        user_text: &str,
        visible_tools: Option<&[String]>,
        turn_token: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let mut user_msg = Message::user(conversation_id, user_text);
        if let Some(parent_id) = parent {
            user_msg = user_msg.with_parent(parent_id);
        }
        self.log.append(user_msg).await;

        match self
            .drive_turn(conversation_id, system_prompt, visible_tools, turn_token)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let error_msg = Message::error(conversation_id, err.to_string()).with_end_of_turn(true);
                self.log.append(error_msg).await;
                Err(err)
            }
        }
    }

    async fn drive_turn(
        &self,
        conversation_id: ConversationId,
        system_prompt: &str,
        visible_tools: Option<&[String]>,
        turn_token: &CancellationToken,
    ) -> Result<TurnOutcome> {
        let mut compacted = false;
        // The preflight budget check (P4) compares cumulative spend so far
        // against the cost we expect the *next* request to add. We have no
        // way to know that in advance, so we use the most recently observed
        // per-request cost within this turn as the projection (zero before
        // the turn's first request).
        let mut projected_cost = 0.0_f64;

        loop {
            if turn_token.is_cancelled() {
                return Err(Error::cancelled("turn cancelled"));
            }

            let log_state = self.log.state().await;
            let budget = Budget {
                max_dollars: self.max_dollars,
                current_usage: log_state.total_usage.cost_usd,
            };
            if budget.would_exceed(projected_cost) {
                return Err(Error::budget_exceeded(
                    log_state.total_usage.cost_usd + projected_cost,
                    self.max_dollars,
                ));
            }

            let conversation_log: Vec<Message> = self
                .log
                .slice(0, None)
                .await
                .into_iter()
                .filter(|m| m.conversation_id == conversation_id)
                .collect();

            let history_source = if compacted {
                compact_messages(&conversation_log)
            } else {
                conversation_log
            };
            let chat_history = to_chat_messages(&history_source);

            let tools = self.registry.to_openai_tools(visible_tools);
            let request = LlmRequest::new(system_prompt, chat_history.clone()).with_tools(tools);

            let response = tokio::select! {
                biased;
                _ = turn_token.cancelled() => return Err(Error::cancelled("turn cancelled")),
                result = self.llm.do_request(request) => result,
            };

            let response = match response {
                Ok(response) => response,
                Err(Error::ContextWindowExceeded) if !compacted => {
                    compacted = true;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let tool_uses = response.tool_uses();
            let end_of_turn = response.stop_reason == StopReason::EndTurn && tool_uses.is_empty();
            let tool_calls: Vec<ToolCall> = tool_uses
                .iter()
                .map(|tool_use| ToolCall {
                    tool_call_id: tool_use.id.clone(),
                    name: tool_use.name.clone(),
                    input: tool_use.input.clone(),
                })
                .collect();

            let assistant_msg = Message::agent(conversation_id, response.text(), tool_calls.clone())
                .with_usage(response.usage)
                .with_end_of_turn(end_of_turn);
            self.log.append(assistant_msg).await;
            projected_cost = response.usage.cost_usd;

            if tool_calls.is_empty() {
                if end_of_turn {
                    return Ok(TurnOutcome::Ended);
                }
                // No tool calls but not end_turn either (e.g. max_tokens):
                // loop back and ask the model to continue.
                continue;
            }

            let history_json: Vec<Value> = chat_history
                .iter()
                .filter_map(|m| serde_json::to_value(m).ok())
                .collect();
            let results = self.dispatcher.dispatch(&tool_calls, history_json, turn_token).await;

            let mut ended_by_tool = false;
            for (call, result) in tool_calls.iter().zip(results.iter()) {
                let tool_ends_turn = self
                    .registry
                    .get(&call.name)
                    .map(|tool| tool.ends_turn())
                    .unwrap_or(false)
                    && !result.is_error();
                let tool_msg = Message::tool(conversation_id, call, result).with_end_of_turn(tool_ends_turn);
                self.log.append(tool_msg).await;
                if tool_ends_turn {
                    ended_by_tool = true;
                }
            }

            if ended_by_tool {
                return Ok(TurnOutcome::EndedByTool);
            }
        }
    }
}

/// Project a conversation's durable log entries into the wire-level history
/// sent to the model. `Commit` and `External` entries are bookkeeping, not
/// conversation content, and are dropped here.
fn to_chat_messages(messages: &[Message]) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.kind {
            MessageType::User => out.push(ChatMessage::user(msg.content.clone())),
            MessageType::Agent => {
                let mut blocks = Vec::new();
                if !msg.content.is_empty() {
                    blocks.push(ContentBlock::Text(TextBlock::new(msg.content.clone())));
                }
                for call in &msg.tool_calls {
                    blocks.push(ContentBlock::ToolUse(ToolUseBlock::new(
                        call.tool_call_id.clone(),
                        call.name.clone(),
                        call.input.clone(),
                    )));
                }
                if !blocks.is_empty() {
                    out.push(ChatMessage::assistant(blocks));
                }
            }
            MessageType::Tool => {
                if let Some(tool_call_id) = &msg.tool_call_id {
                    let content = msg
                        .tool_result
                        .clone()
                        .map(serde_json::Value::String)
                        .unwrap_or(Value::Null);
                    out.push(ChatMessage::new(
                        MessageRole::Tool,
                        vec![ContentBlock::ToolResult(ToolResultBlock::new(
                            tool_call_id.clone(),
                            content,
                        ))],
                    ));
                }
            }
            MessageType::Auto => {
                out.push(ChatMessage::assistant(vec![ContentBlock::Text(TextBlock::new(
                    msg.content.clone(),
                ))]));
            }
            MessageType::Error => out.push(ChatMessage::system(format!("[error] {}", msg.content))),
            MessageType::Budget => out.push(ChatMessage::system(format!("[budget] {}", msg.content))),
            MessageType::Commit | MessageType::External => {}
        }
    }
    out
}

/// Replace contiguous runs of 2+ `tool` messages older than the last two
/// user turns with a single synthetic `auto` summary. Operates on an
/// in-memory copy of the log's entries for one conversation — the log
/// itself is never mutated (P1's append-only, dense-index guarantee must
/// hold regardless of what the engine sends the model).
fn compact_messages(messages: &[Message]) -> Vec<Message> {
    let user_turn_starts: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.kind == MessageType::User)
        .map(|(i, _)| i)
        .collect();

    let boundary = if user_turn_starts.len() >= 2 {
        user_turn_starts[user_turn_starts.len() - 2]
    } else {
        0
    };

    let mut out = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        if i < boundary && messages[i].kind == MessageType::Tool {
            let start = i;
            let mut end = i;
            while end < boundary && messages[end].kind == MessageType::Tool {
                end += 1;
            }
            let run_len = end - start;
            if run_len >= 2 {
                let names: Vec<String> = messages[start..end]
                    .iter()
                    .filter_map(|m| m.tool_name.clone())
                    .collect();
                let summary = format!("{run_len} earlier tool calls summarized: {}", names.join(", "));
                out.push(Message::auto(messages[start].conversation_id, summary));
                i = end;
                continue;
            }
        }
        out.push(messages[i].clone());
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmResponse;
    use crate::message::Usage;
    use crate::tools::tool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedLlm {
        responses: std::sync::Mutex<Vec<Result<LlmResponse>>>,
        calls: AtomicUsize,
    }

    impl ScriptedLlm {
        fn new(mut responses: Vec<Result<LlmResponse>>) -> Self {
            responses.reverse();
            Self {
                responses: std::sync::Mutex::new(responses),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmService for ScriptedLlm {
        async fn do_request(&self, _request: LlmRequest) -> Result<LlmResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(Error::other("scripted LLM ran out of responses")))
        }

        fn token_context_window(&self) -> u32 {
            8192
        }
    }

    fn text_response(text: &str, usage: Usage) -> Result<LlmResponse> {
        Ok(LlmResponse {
            content: vec![ContentBlock::Text(TextBlock::new(text))],
            stop_reason: StopReason::EndTurn,
            usage,
        })
    }

    fn tool_call_response(id: &str, name: &str, input: Value) -> Result<LlmResponse> {
        Ok(LlmResponse {
            content: vec![ContentBlock::ToolUse(ToolUseBlock::new(id, name, input))],
            stop_reason: StopReason::ToolUse,
            usage: Usage::default(),
        })
    }

    fn engine_with(
        llm: ScriptedLlm,
        registry: ToolRegistry,
        max_dollars: f64,
    ) -> Engine {
        let registry = Arc::new(registry);
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            Arc::new(Hooks::new()),
            Duration::from_secs(5),
        ));
        let log = Arc::new(MessageLog::new(Uuid::new_v4()));
        Engine::new(Arc::new(llm), registry, dispatcher, log, max_dollars)
    }

    #[tokio::test]
    async fn simple_qa_ends_turn_on_first_response() {
        let llm = ScriptedLlm::new(vec![text_response("hi there", Usage::default())]);
        let engine = engine_with(llm, ToolRegistry::new(), 0.0);
        let token = CancellationToken::new();

        let outcome = engine
            .run_turn(Uuid::new_v4(), "be helpful", "hello", &token)
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Ended);

        let state = engine.log().state().await;
        assert_eq!(state.message_count, 2); // user + assistant
    }

    #[tokio::test]
    async fn single_tool_call_loops_then_ends() {
        let mut registry = ToolRegistry::new();
        registry.register(
            tool("lookup", "looks something up")
                .build(|_| async move { Ok(json!({"result": "found it"})) }),
        );

        let llm = ScriptedLlm::new(vec![
            tool_call_response("call_1", "lookup", json!({})),
            text_response("here's what I found", Usage::default()),
        ]);
        let engine = engine_with(llm, registry, 0.0);
        let token = CancellationToken::new();

        let outcome = engine
            .run_turn(Uuid::new_v4(), "be helpful", "look it up", &token)
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Ended);

        let state = engine.log().state().await;
        // user, assistant(tool_use), tool, assistant(final)
        assert_eq!(state.message_count, 4);
    }

    #[tokio::test]
    async fn ends_turn_tool_stops_the_loop_without_returning_to_model() {
        let mut registry = ToolRegistry::new();
        registry.register(
            tool("finish", "ends the turn")
                .ends_turn(true)
                .build(|_| async move { Ok(json!({"done": true})) }),
        );

        let llm = ScriptedLlm::new(vec![tool_call_response("call_1", "finish", json!({}))]);
        let engine = engine_with(llm, registry, 0.0);
        let token = CancellationToken::new();

        let outcome = engine
            .run_turn(Uuid::new_v4(), "be helpful", "wrap up", &token)
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::EndedByTool);

        let state = engine.log().state().await;
        assert_eq!(state.message_count, 3); // user, assistant(tool_use), tool result
    }

    #[tokio::test]
    async fn zero_budget_never_blocks() {
        let llm = ScriptedLlm::new(vec![text_response(
            "ok",
            Usage::new(10, 10, 0, 0, 1_000_000.0),
        )]);
        let engine = engine_with(llm, ToolRegistry::new(), 0.0);
        let token = CancellationToken::new();

        let outcome = engine
            .run_turn(Uuid::new_v4(), "be helpful", "hi", &token)
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Ended);
    }

    #[tokio::test]
    async fn budget_exceeded_is_logged_and_returned() {
        // First response is expensive; the second request's preflight check
        // (using the first response's cost as the projection) should reject
        // before a second call is ever made.
        let mut registry = ToolRegistry::new();
        registry.register(
            tool("lookup", "looks something up")
                .build(|_| async move { Ok(json!({"result": "x"})) }),
        );
        let llm = ScriptedLlm::new(vec![Ok(LlmResponse {
            content: vec![ContentBlock::ToolUse(ToolUseBlock::new(
                "call_1",
                "lookup",
                json!({}),
            ))],
            stop_reason: StopReason::ToolUse,
            usage: Usage::new(0, 0, 0, 0, 5.0),
        })]);
        let engine = engine_with(llm, registry, 1.0);
        let token = CancellationToken::new();

        let result = engine
            .run_turn(Uuid::new_v4(), "be helpful", "look it up", &token)
            .await;
        assert!(matches!(result, Err(Error::BudgetExceeded { .. })));

        let state = engine.log().state().await;
        let entries = engine.log().slice(0, None).await;
        assert!(entries.iter().any(|m| m.kind == MessageType::Error));
        assert!(state.message_count >= 1);
    }

    #[test]
    fn compact_messages_summarizes_old_tool_runs_only() {
        let conv = Uuid::new_v4();
        let mut msgs = Vec::new();
        msgs.push(Message::user(conv, "turn 1"));
        msgs.push(Message::agent(conv, "", vec![]));
        for name in ["a", "b", "c"] {
            let call = ToolCall {
                tool_call_id: format!("call_{name}"),
                name: name.to_string(),
                input: json!({}),
            };
            let result = crate::message::ToolResult::ok(&call.tool_call_id, "ok");
            msgs.push(Message::tool(conv, &call, &result));
        }
        msgs.push(Message::user(conv, "turn 2"));
        msgs.push(Message::user(conv, "turn 3"));

        let compacted = compact_messages(&msgs);
        let auto_count = compacted.iter().filter(|m| m.kind == MessageType::Auto).count();
        assert_eq!(auto_count, 1);
        assert!(compacted.len() < msgs.len());
    }
}

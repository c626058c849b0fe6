//! Tool registry and parallel dispatcher (C2 §4.2).
//!
//! [`ToolRegistry`] holds the set of tools the engine can advertise to the
//! model; [`Dispatcher`] is what actually runs them when an assistant
//! response comes back with one or more `tool_use` blocks. Calls run
//! concurrently on a [`tokio::task::JoinSet`], each under its own child of
//! the turn's [`CancellationToken`], and results are reassembled in the
//! original `tool_use` order regardless of completion order (§5 ordering
//! guarantee).

use crate::hooks::{Hooks, PostToolUseEvent, PreToolUseEvent};
use crate::message::{ToolCall, ToolResult};
use crate::tools::Tool;
use crate::{Error, Result};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Named collection of tools available to a conversation.
///
/// Built once at startup (`Init`); tools may be hidden per-conversation by
/// passing a visibility allow-list to [`ToolRegistry::to_openai_tools`]
/// rather than mutating the registry itself.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool of the same name.
    pub fn register(&mut self, tool: Tool) -> &mut Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// OpenAI-format tool schemas for this registry, restricted to `visible`
    /// when given (sub-conversations advertise a smaller tool set than their
    /// parent).
    pub fn to_openai_tools(&self, visible: Option<&[String]>) -> Vec<Value> {
        self.tools
            .values()
            .filter(|tool| match visible {
                Some(names) => names.iter().any(|n| n == tool.name()),
                None => true,
            })
            .map(Tool::to_openai_format)
            .collect()
    }
}

/// Minimal JSON-schema validation: checks `type: object`'s `required` array
/// is satisfied and that present properties match their declared coarse
/// type. Intentionally not a full JSON Schema implementation — the tool
/// schemas produced by [`crate::tools`] only ever use a small, known subset
/// (object/string/number/integer/boolean/array) so hand validation covers
/// everything the dispatcher needs to reject before invoking a handler.
fn validate_against_schema(schema: &Value, input: &Value) -> std::result::Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if !input.is_object() {
        return Err("tool input must be a JSON object".to_string());
    }
    let input_obj = input.as_object().unwrap();

    if let Some(required) = schema_obj.get("required").and_then(|v| v.as_array()) {
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if !input_obj.contains_key(name) {
                return Err(format!("missing required field '{name}'"));
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(|v| v.as_object()) {
        for (name, value) in input_obj {
            let Some(prop_type) = properties
                .get(name)
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str())
            else {
                continue;
            };
            let matches = match prop_type {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(format!(
                    "field '{name}' expected type '{prop_type}', got {value}"
                ));
            }
        }
    }

    Ok(())
}

/// Dispatches tool_use blocks against a [`ToolRegistry`], running the calls
/// of a single assistant response concurrently.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    hooks: Arc<Hooks>,
    /// Outer timeout backstop applied to every call. Tools that classify
    /// their own timeout (e.g. `bash`, via `BashTimeoutClass`) should be
    /// configured with a backstop at least as long as their slowest class;
    /// this is the dispatcher's half of the contract, not a replacement for
    /// the tool's own enforcement.
    default_timeout: Duration,
    in_flight: Mutex<HashMap<String, CancellationToken>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, hooks: Arc<Hooks>, default_timeout: Duration) -> Self {
        Self {
            registry,
            hooks,
            default_timeout,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Cancel one outstanding tool call by id. Sibling calls are unaffected
    /// (P6). Returns `false` if no call with that id is currently running.
    pub fn cancel_call(&self, tool_call_id: &str) -> bool {
        let guard = self.in_flight.lock().unwrap();
        match guard.get(tool_call_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every call currently dispatched. Used when the enclosing turn
    /// is cancelled.
    pub fn cancel_all(&self) {
        let guard = self.in_flight.lock().unwrap();
        for token in guard.values() {
            token.cancel();
        }
    }

    /// Run every call in `calls` concurrently and return their results in
    /// the same order `calls` was given in (the order the model emitted the
    /// `tool_use` blocks), regardless of which call finishes first.
    pub async fn dispatch(
        &self,
        calls: &[ToolCall],
        history: Vec<Value>,
        turn_token: &CancellationToken,
    ) -> Vec<ToolResult> {
        let mut set = JoinSet::new();

        for (position, call) in calls.iter().cloned().enumerate() {
            let child_token = turn_token.child_token();
            self.in_flight
                .lock()
                .unwrap()
                .insert(call.tool_call_id.clone(), child_token.clone());

            let registry = self.registry.clone();
            let hooks = self.hooks.clone();
            let history = history.clone();
            let default_timeout = self.default_timeout;

            set.spawn(async move {
                let result = Self::dispatch_one(
                    &registry,
                    &hooks,
                    &call,
                    history,
                    child_token,
                    default_timeout,
                )
                .await;
                (position, call.tool_call_id, result)
            });
        }

        let mut slots: Vec<Option<ToolResult>> = (0..calls.len()).map(|_| None).collect();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((position, tool_call_id, result)) => {
                    self.in_flight.lock().unwrap().remove(&tool_call_id);
                    slots[position] = Some(result);
                }
                Err(join_err) => {
                    // A task was aborted or panicked outside our own
                    // catch_unwind (e.g. the runtime shutting down). We
                    // can't recover which position it was, so there's
                    // nothing better to do than drop it; the `unwrap_or_else`
                    // below fills any resulting gap.
                    tracing::error!(error = %join_err, "tool dispatch task did not complete");
                }
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(idx, slot)| {
                slot.unwrap_or_else(|| {
                    ToolResult::failed(
                        calls
                            .get(idx)
                            .map(|c| c.tool_call_id.as_str())
                            .unwrap_or("unknown"),
                        "tool dispatch task did not complete",
                    )
                })
            })
            .collect()
    }

    async fn dispatch_one(
        registry: &ToolRegistry,
        hooks: &Hooks,
        call: &ToolCall,
        history: Vec<Value>,
        token: CancellationToken,
        default_timeout: Duration,
    ) -> ToolResult {
        let start = Utc::now();

        let Some(tool) = registry.get(&call.name).cloned() else {
            return ToolResult::failed(
                &call.tool_call_id,
                format!("unknown tool: {}", call.name),
            )
            .with_timing(start, Utc::now());
        };

        let mut input = call.input.clone();

        let pre_event = PreToolUseEvent::new(
            call.name.clone(),
            input.clone(),
            call.tool_call_id.clone(),
            history.clone(),
        );
        if let Some(decision) = hooks.execute_pre_tool_use(pre_event).await {
            if let Some(modified) = decision.modified_input {
                input = modified;
            }
            if !decision.continue_execution {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "blocked by pre_tool_use hook".to_string());
                return ToolResult::failed(&call.tool_call_id, reason)
                    .with_timing(start, Utc::now());
            }
        }

        if let Err(reason) = validate_against_schema(tool.input_schema(), &input) {
            return Self::finish(
                call,
                Err(Error::tool_validation(reason)),
                start,
                hooks,
                history,
            )
            .await;
        }

        let run = std::panic::AssertUnwindSafe(tool.execute(input)).catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::cancelled("tool call cancelled")),
            timed = tokio::time::timeout(default_timeout, run) => match timed {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(err))) => Err(err),
                Ok(Err(_panic)) => Err(Error::fatal(format!("tool '{}' panicked", call.name))),
                Err(_elapsed) => Err(Error::cancelled(format!("tool '{}' timed out", call.name))),
            },
        };

        Self::finish(call, outcome, start, hooks, history).await
    }

    async fn finish(
        call: &ToolCall,
        outcome: Result<Value>,
        start: chrono::DateTime<Utc>,
        hooks: &Hooks,
        history: Vec<Value>,
    ) -> ToolResult {
        let end = Utc::now();
        let mut result = match outcome {
            Ok(value) => {
                let content = match &value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                ToolResult::ok(&call.tool_call_id, content).with_display(value)
            }
            Err(err) => ToolResult::failed(&call.tool_call_id, err.to_string()),
        };
        result = result.with_timing(start, end);

        let post_event = PostToolUseEvent::new(
            call.name.clone(),
            call.input.clone(),
            call.tool_call_id.clone(),
            Value::String(result.llm_content.clone()),
            history,
        );
        if let Some(decision) = hooks.execute_post_tool_use(post_event).await {
            if let Some(modified) = decision.modified_input {
                result.llm_content = match &modified {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
            }
            if !decision.continue_execution {
                result.error = Some(
                    decision
                        .reason
                        .unwrap_or_else(|| "blocked by post_tool_use hook".to_string()),
                );
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tool;
    use serde_json::json;

    fn call(id: &str, name: &str, input: Value) -> ToolCall {
        ToolCall {
            tool_call_id: id.to_string(),
            name: name.to_string(),
            input,
        }
    }

    #[test]
    fn registry_round_trips_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("echo", "echoes").build(|args| async move { Ok(args) }));
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn schema_validation_catches_missing_required_and_wrong_type() {
        let schema = json!({
            "type": "object",
            "properties": {"q": {"type": "string"}},
            "required": ["q"]
        });
        assert!(validate_against_schema(&schema, &json!({"q": "hi"})).is_ok());
        assert!(validate_against_schema(&schema, &json!({})).is_err());
        assert!(validate_against_schema(&schema, &json!({"q": 5})).is_err());
    }

    #[tokio::test]
    async fn dispatch_preserves_original_order_regardless_of_completion_order() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("slow", "sleeps then answers").param("ms", "integer").build(
            |args| async move {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({"ms": ms}))
            },
        ));
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(Hooks::new()),
            Duration::from_secs(5),
        );

        let calls = vec![
            call("call_1", "slow", json!({"ms": 40})),
            call("call_2", "slow", json!({"ms": 0})),
        ];

        let turn_token = CancellationToken::new();
        let results = dispatcher.dispatch(&calls, vec![], &turn_token).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].tool_call_id, "call_1");
        assert_eq!(results[1].tool_call_id, "call_2");
    }

    #[tokio::test]
    async fn unknown_tool_produces_tool_error_without_panicking() {
        let dispatcher = Dispatcher::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(Hooks::new()),
            Duration::from_secs(5),
        );
        let calls = vec![call("call_1", "nonexistent", json!({}))];
        let turn_token = CancellationToken::new();
        let results = dispatcher.dispatch(&calls, vec![], &turn_token).await;
        assert!(results[0].is_error());
    }

    #[tokio::test]
    async fn cancelling_one_call_does_not_affect_sibling() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("waits", "waits for cancellation").build(|_| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!({}))
        }));
        registry.register(tool("fast", "returns immediately").build(|_| async move {
            Ok(json!({"ok": true}))
        }));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(registry),
            Arc::new(Hooks::new()),
            Duration::from_secs(5),
        ));

        let calls = vec![
            call("call_1", "waits", json!({})),
            call("call_2", "fast", json!({})),
        ];
        let turn_token = CancellationToken::new();

        let d = dispatcher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            d.cancel_call("call_1");
        });

        let results = dispatcher.dispatch(&calls, vec![], &turn_token).await;
        assert!(results[0].is_error());
        assert!(!results[1].is_error());
    }
}

//! The append-only log's data model (C3 §3): [`Message`], [`ToolCall`],
//! [`ToolResult`], [`Usage`], and [`Budget`].
//!
//! A [`Message`] is one entry in the agent's event log. Unlike [`crate::types::ChatMessage`]
//! (the wire-level turn history sent to the model), a `Message` is a durable,
//! never-mutated record of something that happened: a user prompt, an assistant
//! reply, a tool invocation and its result, a commit, an error, or a budget
//! notice. `idx` is assigned by [`crate::log::MessageLog::append`] and is dense
//! and monotonic from zero (P1).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique id for a conversation. Sub-conversations get their own id and carry
/// their parent's id in [`Message::parent_conversation_id`].
pub type ConversationId = Uuid;

/// Rolling token/dollar accounting for a single LLM response or a sum of many.
///
/// Addition is commutative and associative; [`Usage::default`] is the
/// identity element (P9).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
}

impl Usage {
    pub fn new(
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        cache_creation_tokens: u64,
        cost_usd: f64,
    ) -> Self {
        Self {
            input_tokens,
            output_tokens,
            cache_read_tokens,
            cache_creation_tokens,
            cost_usd,
        }
    }

    /// Combine two usages field-wise.
    pub fn add(&self, other: &Usage) -> Usage {
        Usage {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cache_read_tokens: self.cache_read_tokens + other.cache_read_tokens,
            cache_creation_tokens: self.cache_creation_tokens + other.cache_creation_tokens,
            cost_usd: self.cost_usd + other.cost_usd,
        }
    }
}

impl std::ops::Add for Usage {
    type Output = Usage;
    fn add(self, rhs: Usage) -> Usage {
        Usage::add(&self, &rhs)
    }
}

impl std::iter::Sum for Usage {
    fn sum<I: Iterator<Item = Usage>>(iter: I) -> Self {
        iter.fold(Usage::default(), |acc, u| acc + u)
    }
}

/// Per-turn dollar ceiling and rolling spend (§3, P4).
///
/// `max_dollars == 0.0` disables enforcement entirely: [`Budget::would_exceed`]
/// always returns `false` in that case, matching the "Zero `max_dollars`"
/// boundary behaviour.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    pub max_dollars: f64,
    pub current_usage: f64,
}

impl Budget {
    pub fn new(max_dollars: f64) -> Self {
        Self {
            max_dollars,
            current_usage: 0.0,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0.0)
    }

    /// Whether issuing a request with the given projected cost would push
    /// cumulative spend past `max_dollars`. Disabled (always `false`) when
    /// `max_dollars` is zero.
    pub fn would_exceed(&self, projected_cost: f64) -> bool {
        self.max_dollars > 0.0 && self.current_usage + projected_cost > self.max_dollars
    }

    pub fn record(&mut self, cost: f64) {
        self.current_usage += cost;
    }
}

/// One entry in the append-only log's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Agent,
    Tool,
    Commit,
    Error,
    External,
    Budget,
    Auto,
}

/// A request the assistant made to invoke a named tool, bound to a
/// `tool_call_id` unique within its turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub name: String,
    pub input: Value,
}

/// The outcome of dispatching one [`ToolCall`] (C2 §3).
///
/// `llm_content` is what gets fed back to the model; `display` is arbitrary
/// structured data for a UI to render (diffs, screenshots, tables) without
/// constraining what the model sees. P3 requires `start_time <= end_time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub llm_content: String,
    #[serde(default)]
    pub display: Option<Value>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ToolResult {
    pub fn ok(tool_call_id: impl Into<String>, llm_content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            tool_call_id: tool_call_id.into(),
            llm_content: llm_content.into(),
            display: None,
            error: None,
            start_time: now,
            end_time: now,
        }
    }

    pub fn failed(tool_call_id: impl Into<String>, error: impl Into<String>) -> Self {
        let now = Utc::now();
        let error = error.into();
        Self {
            tool_call_id: tool_call_id.into(),
            llm_content: error.clone(),
            display: None,
            error: Some(error),
            start_time: now,
            end_time: now,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn with_timing(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_time = start;
        self.end_time = end;
        self
    }

    pub fn with_display(mut self, display: Value) -> Self {
        self.display = Some(display);
        self
    }
}

/// A commit produced during a turn (e.g. by a `git_commit` tool). `pushed_branch`
/// is the one field a [`Message`] may still attach after being appended,
/// per the data-model invariant in §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub subject: String,
    pub body: String,
    pub pushed_branch: Option<String>,
}

/// One entry in the agent's append-only event log.
///
/// `idx` is assigned on [`crate::log::MessageLog::append`] and is never
/// reused; every other field is set at construction time and never mutated
/// afterwards, except `commits[..].pushed_branch` which may be attached once
/// a commit is pushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub idx: u64,
    pub timestamp: DateTime<Utc>,
    pub end_of_turn: bool,
    pub conversation_id: ConversationId,
    pub parent_conversation_id: Option<ConversationId>,

    #[serde(rename = "type")]
    pub kind: MessageType,

    pub content: String,
    pub tool_name: Option<String>,
    pub tool_call_id: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_result: Option<String>,
    pub tool_error: bool,
    pub tool_calls: Vec<ToolCall>,

    pub commits: Vec<CommitInfo>,

    pub usage: Usage,
    pub elapsed_ns: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,

    pub hide_output: bool,
}

impl Message {
    /// A builder-less constructor producing a minimal, otherwise-default
    /// message. `idx`/`timestamp` are placeholders overwritten by the log on
    /// append; every other field defaults to its empty/zero value.
    fn blank(conversation_id: ConversationId, kind: MessageType, content: impl Into<String>) -> Self {
        Self {
            idx: 0,
            timestamp: Utc::now(),
            end_of_turn: false,
            conversation_id,
            parent_conversation_id: None,
            kind,
            content: content.into(),
            tool_name: None,
            tool_call_id: None,
            tool_input: None,
            tool_result: None,
            tool_error: false,
            tool_calls: Vec::new(),
            commits: Vec::new(),
            usage: Usage::default(),
            elapsed_ns: 0,
            start_time: None,
            end_time: None,
            hide_output: false,
        }
    }

    pub fn user(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::blank(conversation_id, MessageType::User, content)
    }

    pub fn agent(
        conversation_id: ConversationId,
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        let mut msg = Self::blank(conversation_id, MessageType::Agent, content);
        msg.tool_calls = tool_calls;
        msg
    }

    pub fn tool(conversation_id: ConversationId, call: &ToolCall, result: &ToolResult) -> Self {
        let mut msg = Self::blank(conversation_id, MessageType::Tool, result.llm_content.clone());
        msg.tool_name = Some(call.name.clone());
        msg.tool_call_id = Some(call.tool_call_id.clone());
        msg.tool_input = Some(call.input.clone());
        msg.tool_result = Some(result.llm_content.clone());
        msg.tool_error = result.is_error();
        msg.start_time = Some(result.start_time);
        msg.end_time = Some(result.end_time);
        msg.elapsed_ns = (result.end_time - result.start_time)
            .num_nanoseconds()
            .unwrap_or(0)
            .max(0) as u64;
        msg
    }

    pub fn error(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::blank(conversation_id, MessageType::Error, content)
    }

    pub fn auto(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::blank(conversation_id, MessageType::Auto, content)
    }

    pub fn budget(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::blank(conversation_id, MessageType::Budget, content)
    }

    pub fn external(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self::blank(conversation_id, MessageType::External, content)
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_end_of_turn(mut self, end_of_turn: bool) -> Self {
        self.end_of_turn = end_of_turn;
        self
    }

    pub fn with_parent(mut self, parent: ConversationId) -> Self {
        self.parent_conversation_id = Some(parent);
        self
    }

    pub fn with_hide_output(mut self, hide: bool) -> Self {
        self.hide_output = hide;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_add_is_identity_and_commutative() {
        let a = Usage::new(10, 20, 0, 0, 0.01);
        let zero = Usage::default();
        assert_eq!(a.add(&zero), a);
        let b = Usage::new(5, 5, 1, 1, 0.02);
        assert_eq!(a.add(&b), b.add(&a));
    }

    #[test]
    fn budget_zero_never_blocks() {
        let budget = Budget::unlimited();
        assert!(!budget.would_exceed(1_000_000.0));
    }

    #[test]
    fn budget_blocks_once_projected_exceeds_max() {
        let mut budget = Budget::new(1.0);
        budget.record(0.9);
        assert!(!budget.would_exceed(0.05));
        assert!(budget.would_exceed(0.2));
    }

    #[test]
    fn tool_message_copies_error_flag_and_timing() {
        let conv = ConversationId::new_v4();
        let call = ToolCall {
            tool_call_id: "call_1".into(),
            name: "bash".into(),
            input: serde_json::json!({"command": "ls"}),
        };
        let result = ToolResult::failed("call_1", "boom");
        let msg = Message::tool(conv, &call, &result);
        assert!(msg.tool_error);
        assert_eq!(msg.tool_name.as_deref(), Some("bash"));
        assert!(msg.start_time <= msg.end_time);
    }
}

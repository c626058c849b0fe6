//! # Agent Core
//!
//! Core engine for an autonomous coding agent: an LLM service abstraction
//! over OpenAI-compatible backends, a parallel tool dispatcher, an
//! append-only message log with live subscriptions, a turn-driving
//! conversation engine, a resident agent loop, an HTTP control-plane
//! surface, and a git-based code review differential that flags
//! regressions introduced since a base commit.
//!
//! ## Architecture
//!
//! - **llm**: provider-agnostic request/response types plus the
//!   OpenAI-compatible backend (streaming, retry, cost accounting).
//! - **dispatch**: the tool registry and the parallel, cancellable,
//!   order-preserving tool-call dispatcher.
//! - **log**: the single-writer/many-reader append-only message log, with
//!   index-based reconnect and heartbeats for live subscribers.
//! - **message**: the durable log entry data model — messages, tool
//!   calls/results, usage and budget accounting.
//! - **engine**: drives one turn at a time: compose a request from the log,
//!   call the model, dispatch any tool calls, loop until the turn ends.
//! - **agent**: the resident session state machine wrapping the engine in a
//!   message queue, lifecycle states, and cancellation.
//! - **review**: the code-review differential engine — enumerates changed
//!   files, resolves packages, runs codegen/tests/static analysis at `HEAD`
//!   and a cached base-commit worktree, and reports regressions.
//! - **server**: the HTTP control-plane surface (`/init`, `/chat`,
//!   `/cancel`, `/stream`, `/messages`, `/diff`, `/download`, ...).
//! - **hooks**: lifecycle hooks for intercepting tool use and user input.
//! - **config**: provider configuration helpers (LM Studio, Ollama,
//!   llama.cpp, vLLM) with environment variable overrides.
//! - **context**: token estimation and history truncation over wire-level
//!   chat messages.
//! - **retry**: exponential backoff with jitter, used by the LLM backend.
//! - **tools**: tool definition system with schema generation, plus the
//!   concrete `bash` tool.
//! - **types**: wire-level chat message / content block / OpenAI payload
//!   types, and model configuration.

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// The resident agent loop: init, enqueue user messages, cancel, subscribe.
pub mod agent;

/// Provider configuration helpers for LM Studio, Ollama, llama.cpp, and vLLM.
mod config;

/// Context window management utilities for token estimation and history truncation.
mod context;

/// Parallel, cancellable, order-preserving tool-call dispatch.
mod dispatch;

/// The turn-driving conversation engine.
mod engine;

/// Error types and conversions used across every component.
mod error;

/// Lifecycle hooks system for intercepting and controlling execution at key points.
mod hooks;

/// Provider-agnostic LLM request/response types and the OpenAI-compatible
/// backend implementation (streaming, retry, cost accounting).
mod llm;

/// The append-only message log: single writer, many readers, index-based reconnect.
mod log;

/// The durable log entry data model: messages, tool calls/results, usage, budget.
mod message;

/// The git-based code review differential engine.
pub mod review;

/// The HTTP control-plane surface.
pub mod server;

/// Tool definition and execution system with automatic JSON schema generation.
pub mod tools;

/// Core type definitions for wire-level messages, content blocks, and model configuration.
pub mod types;

/// Internal utilities for Server-Sent Events (SSE) parsing and tool call aggregation.
mod utils;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Retry utilities with exponential backoff and jitter.
pub mod retry;

// --- Provider Configuration ---

pub use config::{Provider, get_base_url, get_model};

// --- Context Management ---

pub use context::{estimate_tokens, is_approaching_limit, truncate_messages};

// --- Tool Dispatch ---

pub use dispatch::{Dispatcher, ToolRegistry};

// --- Conversation Engine ---

pub use engine::{Engine, TurnOutcome};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Lifecycle Hooks ---

pub use hooks::{
    HOOK_POST_TOOL_USE, HOOK_PRE_TOOL_USE, HOOK_USER_PROMPT_SUBMIT, HookDecision, Hooks,
    PostToolUseEvent, PreToolUseEvent, UserPromptSubmitEvent,
};

// --- LLM Service ---

pub use llm::{LlmRequest, LlmResponse, LlmService, OpenAiCompatibleService, StopReason};

// --- Message Log ---

pub use log::{LogEvent, LogState, MessageLog, parse_ndjson};

// --- Durable Message Model ---

pub use message::{
    Budget, CommitInfo, ConversationId, Message, MessageType, ToolCall, ToolResult, Usage,
};

// --- Tool System ---

pub use tools::{Tool, ToolBuilder, tool};

// --- Wire-Level Types ---

pub use types::{
    BaseUrl, ChatMessage, ContentBlock, ImageBlock, ImageDetail, MessageRole, ModelName,
    ModelOptions, ModelOptionsBuilder, TextBlock, Temperature, ThinkingBlock, ToolResultBlock,
    ToolUseBlock,
};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types and functions.
/// Import with `use open_agent::prelude::*;`.
pub mod prelude {
    pub use crate::agent::{Agent, AgentConfig, AgentState};
    pub use crate::{
        ChatMessage, ContentBlock, Dispatcher, Engine, Error, HookDecision, Hooks, Message,
        MessageLog, MessageType, Result, TextBlock, Tool, ToolRegistry, ToolResult, ToolUseBlock,
        TurnOutcome, tool,
    };
    pub use crate::review::{ReviewContext, ReviewEngine, ReviewOutput};
    pub use crate::server::{self, AppState};
}

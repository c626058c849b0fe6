//! Error types for the agent core.
//!
//! One [`Error`] enum spans every component (C1-C6); each variant maps to a
//! row in the error-handling design: transient network/rate-limit/overload
//! errors are retryable (see [`crate::retry`]), the rest are terminal for the
//! turn or tool call that produced them. Every variant that reaches the
//! message log is rendered through `Display` into the log entry's `content`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the agent core
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error talking to an LLM backend.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Git repository error raised by the code review differential engine.
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// I/O error (subprocess spawn, worktree filesystem operations, log persistence).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// API error from the model server (non-network failure response)
    #[error("API error: {0}")]
    Api(String),

    /// Streaming error
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Tool execution error
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// The LLM backend is rate-limiting requests; retryable after the given delay if present.
    #[error("Rate limited{}", retry_after.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited {
        /// Seconds to wait before retrying, if the backend advertised one.
        retry_after: Option<u64>,
    },

    /// The LLM backend reported itself overloaded (e.g. HTTP 503).
    #[error("Model backend overloaded")]
    Overloaded,

    /// The request exceeded the model's context window.
    #[error("Context window exceeded")]
    ContextWindowExceeded,

    /// Authentication with the LLM backend failed.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// The LLM backend refused to answer (content policy, etc).
    #[error("Model refused: {0}")]
    Refused(String),

    /// A turn or tool call was cancelled.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A turn aborted because projected cost would exceed the budget.
    #[error("Budget exceeded: projected cost {projected:.4} > max {max:.4}")]
    BudgetExceeded {
        /// Projected cost in USD of the next request.
        projected: f64,
        /// Configured dollar ceiling.
        max: f64,
    },

    /// Tool input failed schema validation before dispatch.
    #[error("Tool validation error: {0}")]
    ToolValidation(String),

    /// A code-review pre-condition (clean tree, HEAD ancestry) was not met.
    #[error("Review precondition failed: {0}")]
    PreCondition(String),

    /// An unexpected panic inside a turn or tool task, caught at the join boundary.
    #[error("Fatal internal error: {0}")]
    Fatal(String),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error
    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Create a cancelled error
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Error::Cancelled(reason.into())
    }

    /// Create a budget-exceeded error
    pub fn budget_exceeded(projected: f64, max: f64) -> Self {
        Error::BudgetExceeded { projected, max }
    }

    /// Create a tool-validation error
    pub fn tool_validation(msg: impl Into<String>) -> Self {
        Error::ToolValidation(msg.into())
    }

    /// Create a review precondition error
    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::PreCondition(msg.into())
    }

    /// Create a fatal error from a caught panic payload
    pub fn fatal(msg: impl Into<String>) -> Self {
        Error::Fatal(msg.into())
    }

    /// Whether this error should be retried by [`crate::retry`]'s conditional helpers.
    ///
    /// Only the three transient classes named in the design (`TransientNetwork`,
    /// `RateLimited`, `Overloaded`) are retryable; everything else — including
    /// budget, validation and cancellation errors — is terminal for the call
    /// that produced it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Http(_) | Error::Timeout | Error::RateLimited { .. } | Error::Overloaded
        ) || matches!(self, Error::Api(msg) if ["500", "502", "503", "504"].iter().any(|c| msg.contains(c)))
    }
}

/// Render an `Error` as an HTTP response for the control-plane surface
/// (`src/server.rs`). Status codes follow the same shape the teacher's
/// `SerialAgent` uses: 4xx for caller mistakes, 5xx/502 for upstream or
/// internal failures.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Api(_) => StatusCode::BAD_GATEWAY,
            Error::Stream(_) => StatusCode::BAD_GATEWAY,
            Error::Tool(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Error::ContextWindowExceeded => StatusCode::PAYLOAD_TOO_LARGE,
            Error::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            Error::Refused(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::Cancelled(_) => StatusCode::CONFLICT,
            Error::BudgetExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::ToolValidation(_) => StatusCode::BAD_REQUEST,
            Error::PreCondition(_) => StatusCode::CONFLICT,
            Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Http(_) => StatusCode::BAD_GATEWAY,
            Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::Git(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

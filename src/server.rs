//! HTTP control-plane surface (§6), grounded in the teacher's ambient
//! axum + `tower-http` router style (`AppState`, a `router()` builder,
//! one handler module per concern). Everything here is a thin translation
//! layer over [`crate::agent::Agent`] — no business logic lives here.

use crate::agent::{Agent, AgentConfig};
use crate::log::LogEvent;
use crate::message::Message;
use crate::review::ReviewContext;
use crate::{Error, Result};
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Shared server state, handed to every handler via axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    pub repo_root: PathBuf,
    pub review: Arc<ReviewContext>,
}

/// Build the full HTTP router (§6). `/screenshot/{id}`, `/terminal/events/{n}`
/// and `/terminal/input/{n}` are out-of-scope collaborators (§1 Non-goals)
/// and are stubbed with `501 Not Implemented` so clients get a clear signal
/// rather than a 404.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/init", post(init))
        .route("/chat", post(chat))
        .route("/cancel", post(cancel))
        .route("/state", get(state))
        .route("/stream", get(stream))
        .route("/messages", get(messages))
        .route("/diff", get(diff))
        .route("/download", get(download))
        .route("/screenshot/:id", get(not_implemented))
        .route("/terminal/events/:n", get(not_implemented))
        .route("/terminal/input/:n", post(not_implemented))
}

async fn not_implemented() -> impl IntoResponse {
    (
        axum::http::StatusCode::NOT_IMPLEMENTED,
        Json(json!({ "error": "out of scope for this deployment" })),
    )
}

#[derive(Debug, Deserialize)]
pub struct InitRequest {
    pub system_prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Provider name ("lmstudio", "ollama", "llamacpp", "vllm"); parsed via
    /// [`crate::config::Provider`]'s `FromStr` impl. Unrecognised values are
    /// ignored rather than rejected, falling back to `base_url`/env defaults.
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub max_dollars: Option<f64>,
    #[serde(default)]
    pub one_shot: bool,
}

/// POST /init — bring the resident agent up (§4.5 `Init`, idempotent).
pub async fn init(State(state): State<AppState>, Json(req): Json<InitRequest>) -> impl IntoResponse {
    let cfg = AgentConfig {
        system_prompt: req.system_prompt,
        model: req.model,
        base_url: req.base_url,
        provider: req.provider.and_then(|p| p.parse().ok()),
        api_key: None,
        max_dollars: req.max_dollars.unwrap_or(0.0),
        workspace: state.repo_root.clone(),
        one_shot: req.one_shot,
        ..AgentConfig::default()
    };

    match state.agent.init(cfg).await {
        Ok(()) => Json(json!({ "state": format!("{:?}", state.agent.state()) })).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

/// POST /chat — enqueue a user message and wait for its turn to finish.
pub async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> impl IntoResponse {
    match state.agent.user_message(req.message).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub tool_call_id: Option<String>,
}

/// POST /cancel — cancel the in-flight turn, or a single tool call (§4.5 `Cancel`).
pub async fn cancel(State(state): State<AppState>, Json(req): Json<CancelRequest>) -> impl IntoResponse {
    match state.agent.cancel(req.tool_call_id.as_deref()).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(err) => err.into_response(),
    }
}

/// GET /state — current lifecycle state and running usage.
pub async fn state(State(state): State<AppState>) -> impl IntoResponse {
    let agent_state = format!("{:?}", state.agent.state());
    let usage = state.agent.total_usage().await.ok();
    Json(json!({ "state": agent_state, "usage": usage.map(|u| json!({
        "input_tokens": u.input_tokens,
        "output_tokens": u.output_tokens,
        "cache_read_tokens": u.cache_read_tokens,
        "cache_creation_tokens": u.cache_creation_tokens,
        "cost_usd": u.cost_usd,
    })) }))
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    pub from: u64,
}

/// GET /stream?from=N — SSE: message / heartbeat / session_ended events,
/// one connection per subscriber (§4.3, §6). Reconnect-by-index: a client
/// that sees its connection drop (including on `Lagged`) reconnects with
/// `from` set to the last `idx` it observed.
pub async fn stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let log_stream = state.agent.subscribe(params.from).await?;
    let sse_stream = log_stream.map(|event| {
        let sse_event = match event {
            LogEvent::Message(msg) => Event::default()
                .event("message")
                .json_data(&*msg)
                .unwrap_or_else(|_| Event::default().event("message").data("{}")),
            LogEvent::Heartbeat => Event::default().event("heartbeat").data(""),
            LogEvent::Lagged => Event::default().event("lagged").data(""),
            LogEvent::SessionEnded => Event::default().event("session_ended").data(""),
        };
        Ok(sse_event)
    });

    Ok(Sse::new(sse_stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("heartbeat"),
    ))
}

#[derive(Debug, Deserialize)]
pub struct MessagesParams {
    #[serde(default)]
    pub from: u64,
    #[serde(default)]
    pub to: Option<u64>,
}

/// GET /messages?from=&to= — a durable slice of the log (no subscription).
pub async fn messages(
    State(state): State<AppState>,
    Query(params): Query<MessagesParams>,
) -> Result<impl IntoResponse> {
    let log = state.agent.log().await?;
    let slice: Vec<Message> = log.slice(params.from, params.to).await;
    Ok(Json(slice))
}

#[derive(Debug, Deserialize)]
pub struct DiffParams {
    #[serde(default)]
    pub commit: Option<String>,
}

/// GET /diff?commit=hash — raw unified diff of `HEAD` vs `commit`, defaulting
/// to the review context's base ref when `commit` is omitted (§6).
pub async fn diff(State(state): State<AppState>, Query(params): Query<DiffParams>) -> impl IntoResponse {
    let base = params.commit.as_deref().unwrap_or_else(|| state.review.base_ref());
    match crate::review::raw_diff(&state.repo_root, base, "HEAD").await {
        Ok(patch) => (
            [(axum::http::header::CONTENT_TYPE, "text/x-diff")],
            patch,
        )
            .into_response(),
        Err(err) => err.into_response(),
    }
}

/// GET /download — the full session log as newline-delimited JSON (§6
/// "Persisted state").
pub async fn download(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let log = state.agent.log().await?;
    let ndjson = log.to_ndjson().await.map_err(Error::from)?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/x-ndjson")],
        ndjson,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_builds_without_panicking() {
        let _router: Router<AppState> = router();
    }
}

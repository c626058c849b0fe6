//! Agent binary: wires an [`open_agent::agent::Agent`] to either a one-shot
//! prompt or a resident HTTP server, using `clap`'s derive API for the flag
//! surface (§6) per the corpus's `sblanchard-SerialAgent`-style CLIs.

use clap::Parser;
use open_agent::agent::{Agent, AgentConfig};
use open_agent::config::Provider;
use open_agent::review::ReviewContext;
use open_agent::server::{self, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

/// Autonomous coding agent core: drives one resident session, either for a
/// single prompt (`--one-shot`) or behind the HTTP control-plane surface.
#[derive(Parser, Debug)]
#[command(name = "agent", version, about)]
struct Args {
    /// Initial user prompt. Required in `--one-shot` mode; otherwise it's
    /// optional seed input sent once the server comes up.
    #[arg(long = "prompt")]
    prompt: Option<String>,

    /// Run a single turn for `--prompt` then exit, instead of starting the
    /// HTTP server.
    #[arg(long = "one-shot", default_value_t = false)]
    one_shot: bool,

    /// Model name; falls back to `OPEN_AGENT_MODEL` / provider defaults.
    #[arg(long = "model")]
    model: Option<String>,

    /// Backend base URL; falls back to `OPEN_AGENT_BASE_URL` / provider defaults.
    #[arg(long = "base-url")]
    base_url: Option<String>,

    /// Named provider preset (lmstudio, ollama, llamacpp, vllm).
    #[arg(long = "provider")]
    provider: Option<String>,

    /// Dollar budget ceiling for the session. `0` disables the check.
    #[arg(long = "max-dollars", default_value_t = 0.0)]
    max_dollars: f64,

    /// Working directory the `bash` tool and code-review engine operate in.
    #[arg(long = "workspace", default_value = ".")]
    workspace: PathBuf,

    /// Ceiling for `timeout_class: "fast"` bash calls, in seconds.
    #[arg(long = "bash-fast-timeout", default_value_t = 30)]
    bash_fast_timeout: u64,

    /// Ceiling for `timeout_class: "slow"` bash calls, in seconds.
    #[arg(long = "bash-slow-timeout", default_value_t = 600)]
    bash_slow_timeout: u64,

    /// Ceiling for `timeout_class: "background"` bash calls, in seconds.
    #[arg(long = "bash-background-timeout", default_value_t = 3600)]
    bash_background_timeout: u64,

    /// Prefix used when the engine creates a branch for committed work.
    #[arg(long = "branch-prefix", default_value = "agent/")]
    #[allow(dead_code)]
    branch_prefix: String,

    /// MCP server URLs to make available as additional tools (repeatable).
    #[arg(long = "mcp")]
    #[allow(dead_code)]
    mcp: Vec<String>,

    /// Base-commit ref the code-review differential compares against.
    #[arg(long = "review-base", default_value = "HEAD")]
    review_base: String,

    /// HTTP listen address when not running in `--one-shot` mode.
    #[arg(long = "listen", default_value = "127.0.0.1:8420")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() {
    let exit_code = run().await;
    std::process::exit(exit_code);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agent=info")),
        )
        .init();

    let args = Args::parse();

    let agent = Agent::new();
    let cfg = AgentConfig {
        system_prompt: "You are an autonomous coding agent.".to_string(),
        model: args.model.clone(),
        base_url: args.base_url.clone(),
        provider: args.provider.as_deref().and_then(|p| Provider::from_str(p).ok()),
        api_key: None,
        max_dollars: args.max_dollars,
        workspace: args.workspace.clone(),
        bash_fast_timeout: Duration::from_secs(args.bash_fast_timeout),
        bash_slow_timeout: Duration::from_secs(args.bash_slow_timeout),
        bash_background_timeout: Duration::from_secs(args.bash_background_timeout),
        context_window: 128_000,
        one_shot: args.one_shot,
    };

    if let Err(err) = agent.init(cfg).await {
        tracing::error!(error = %err, "agent init failed");
        return 1;
    }

    if args.one_shot {
        let Some(prompt) = args.prompt.clone() else {
            tracing::error!("--one-shot requires --prompt");
            return 1;
        };
        return match agent.user_message(prompt).await {
            Ok(()) => 0,
            Err(open_agent::Error::BudgetExceeded { .. }) => 2,
            Err(err) => {
                tracing::error!(error = %err, "turn failed");
                1
            }
        };
    }

    let review = Arc::new(ReviewContext::new(args.workspace.clone(), args.review_base.clone()));
    let state = AppState {
        agent: agent.clone(),
        repo_root: args.workspace.clone(),
        review,
    };

    if let Some(prompt) = args.prompt.clone() {
        let agent = agent.clone();
        tokio::spawn(async move {
            if let Err(err) = agent.user_message(prompt).await {
                tracing::error!(error = %err, "seed prompt failed");
            }
        });
    }

    let app = server::router()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = match tokio::net::TcpListener::bind(args.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, "failed to bind listener");
            return 1;
        }
    };

    tracing::info!(addr = %args.listen, "listening");
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!(error = %err, "server error");
        return 1;
    }

    0
}

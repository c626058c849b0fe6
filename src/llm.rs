//! The LLM service abstraction (C1 §2): a single `do_request` operation that
//! turns a provider-agnostic [`LlmRequest`] into an [`LlmResponse`], hiding
//! streaming, SSE framing, and retry behind one call. [`OpenAiCompatibleService`]
//! is the concrete implementation against LM Studio / Ollama / llama.cpp / vLLM
//! style `/v1/chat/completions` endpoints; anything speaking that wire format
//! can sit behind [`LlmService`] without the rest of the agent caring.

use crate::message::Usage;
use crate::retry::{RetryConfig, retry_with_backoff_conditional};
use crate::types::{
    ChatMessage, ContentBlock, MessageRole, ModelOptions, OpenAIContent, OpenAIContentPart,
    OpenAIFunction, OpenAIMessage, OpenAIRequest, OpenAIToolCall,
};
use crate::utils::{ToolCallAggregator, parse_sse_stream};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

/// Why the model stopped generating (C1 §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model finished its turn normally.
    EndTurn,
    /// The model wants to invoke one or more tools before continuing.
    ToolUse,
    /// Generation was cut off by `max_tokens`.
    MaxTokens,
    /// Generation stopped at a configured stop sequence.
    StopSequence,
    /// The model declined to answer (content policy or safety refusal).
    Refusal,
}

impl StopReason {
    fn from_finish_reason(reason: Option<&str>) -> Self {
        match reason {
            Some("tool_calls") => StopReason::ToolUse,
            Some("length") => StopReason::MaxTokens,
            Some("stop_sequence") => StopReason::StopSequence,
            Some("content_filter") => StopReason::Refusal,
            _ => StopReason::EndTurn,
        }
    }
}

/// A provider-agnostic request: history plus the tool schemas and tool-choice
/// hint for this turn. `system_prompt` is kept separate from `messages` so a
/// service implementation can place it wherever its wire format expects
/// (a leading `system` message, for the OpenAI-compatible case).
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    /// Tool schemas in OpenAI `{"type": "function", "function": {...}}` shape,
    /// as produced by [`crate::tools::Tool::to_openai_format`].
    pub tools: Vec<serde_json::Value>,
    /// "auto", "none", "required", or a named-function object; `None` defers
    /// to the provider's own default.
    pub tool_choice: Option<serde_json::Value>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl LlmRequest {
    pub fn new(system_prompt: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages,
            tools: Vec::new(),
            tool_choice: None,
            max_tokens: None,
            temperature: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<serde_json::Value>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: serde_json::Value) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }
}

/// The model's answer to one [`LlmRequest`]: the content it produced, why it
/// stopped, and the token/dollar accounting for this call.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl LlmResponse {
    /// Tool-use blocks in the order the model emitted them. Empty unless
    /// `stop_reason == StopReason::ToolUse`.
    pub fn tool_uses(&self) -> Vec<&crate::types::ToolUseBlock> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse(tool_use) => Some(tool_use),
                _ => None,
            })
            .collect()
    }

    /// Concatenation of every text block, in order. Empty if the model only
    /// emitted tool calls.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => Some(text.text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// A backend capable of turning one [`LlmRequest`] into one [`LlmResponse`].
///
/// Implementations own their own retry policy: callers treat `do_request` as
/// a single logical operation and don't retry it themselves (C4 relies on
/// this - see the turn algorithm's "call the LLM" step).
#[async_trait]
pub trait LlmService: Send + Sync {
    async fn do_request(&self, request: LlmRequest) -> Result<LlmResponse>;

    /// The model's context window in tokens, used by C4's pre-flight
    /// compaction check.
    fn token_context_window(&self) -> u32;

    /// Whether this backend wants tool results expressed as a unified diff
    /// patch rather than full file contents. Most local OpenAI-compatible
    /// servers don't distinguish; `false` is the sane default.
    fn use_simplified_patch(&self) -> bool {
        false
    }
}

/// Rough $/1K-token price table used only when a response carries no cost
/// header of its own. Entries are matched by substring against the model
/// name; local models not listed here cost nothing, which fits this SDK's
/// usual LM Studio / Ollama / llama.cpp targets.
const PRICE_TABLE_USD_PER_1K: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.00015, 0.0006),
    ("gpt-4o", 0.0025, 0.01),
    ("gpt-4-turbo", 0.01, 0.03),
    ("gpt-4", 0.03, 0.06),
    ("gpt-3.5", 0.0005, 0.0015),
];

fn price_per_1k_tokens(model: &str) -> (f64, f64) {
    let lower = model.to_lowercase();
    PRICE_TABLE_USD_PER_1K
        .iter()
        .find(|(prefix, _, _)| lower.contains(prefix))
        .map(|(_, input, output)| (*input, *output))
        .unwrap_or((0.0, 0.0))
}

/// Header some OpenAI-compatible gateways (LiteLLM and similar proxies)
/// attach with the authoritative dollar cost of a response.
const COST_HEADER: &str = "x-litellm-response-cost";

/// Splits history into wire-level OpenAI messages. A single [`ChatMessage`]
/// carrying tool results expands into one `tool`-role message per result,
/// since the wire format requires that; everything else maps one-to-one.
fn to_openai_messages(system_prompt: &str, messages: &[ChatMessage]) -> Vec<OpenAIMessage> {
    let mut out = Vec::with_capacity(messages.len() + 1);

    if !system_prompt.is_empty() {
        out.push(OpenAIMessage {
            role: "system".to_string(),
            content: Some(OpenAIContent::Text(system_prompt.to_string())),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for message in messages {
        let role = match message.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };

        let mut text_parts = String::new();
        let mut content_parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();

        for block in &message.content {
            match block {
                ContentBlock::Text(text) => {
                    text_parts.push_str(&text.text);
                }
                ContentBlock::Thinking(_) => {
                    // Reasoning traces stay out of the wire transcript.
                }
                ContentBlock::Image(image) => {
                    content_parts
                        .push(OpenAIContentPart::image_url(image.url(), image.detail()));
                }
                ContentBlock::ToolUse(tool_use) => {
                    tool_calls.push(OpenAIToolCall {
                        id: tool_use.id.clone(),
                        call_type: "function".to_string(),
                        function: OpenAIFunction {
                            name: tool_use.name.clone(),
                            arguments: tool_use.input.to_string(),
                        },
                    });
                }
                ContentBlock::ToolResult(tool_result) => {
                    tool_results.push(tool_result);
                }
            }
        }

        if !tool_results.is_empty() {
            for result in tool_results {
                let content = match &result.content {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push(OpenAIMessage {
                    role: "tool".to_string(),
                    content: Some(OpenAIContent::Text(content)),
                    tool_calls: None,
                    tool_call_id: Some(result.tool_use_id.clone()),
                });
            }
            continue;
        }

        if text_parts.is_empty() && content_parts.is_empty() && tool_calls.is_empty() {
            continue;
        }

        let content = if content_parts.is_empty() {
            if text_parts.is_empty() {
                None
            } else {
                Some(OpenAIContent::Text(text_parts))
            }
        } else {
            let mut parts = content_parts;
            if !text_parts.is_empty() {
                parts.insert(0, OpenAIContentPart::text(text_parts));
            }
            Some(OpenAIContent::Parts(parts))
        };

        out.push(OpenAIMessage {
            role: role.to_string(),
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            tool_call_id: None,
        });
    }

    out
}

/// Character-based token estimate for a response. Consistent with
/// [`crate::context::estimate_tokens`]'s approximation (~4 chars/token) so
/// estimated input and output counts are on the same scale.
fn estimate_response_tokens(content: &[ContentBlock]) -> u64 {
    let mut chars = 0usize;
    for block in content {
        match block {
            ContentBlock::Text(text) => chars += text.text.len(),
            ContentBlock::ToolUse(tool_use) => {
                chars += tool_use.name.len() + tool_use.input.to_string().len()
            }
            ContentBlock::Thinking(thinking) => chars += thinking.thinking.len(),
            ContentBlock::Image(_) => chars += 400,
            ContentBlock::ToolResult(result) => chars += result.content.to_string().len(),
        }
    }
    ((chars + 3) / 4) as u64
}

/// One OpenAI-compatible backend reached over HTTP (LM Studio, Ollama,
/// llama.cpp, vLLM, or any server speaking the same `/chat/completions`
/// wire format). Retries transient failures internally per
/// [`RetryConfig::default`], so a single `do_request` call already embodies
/// the turn-level retry policy.
pub struct OpenAiCompatibleService {
    http: reqwest::Client,
    options: ModelOptions,
    context_window: u32,
    retry_config: RetryConfig,
}

impl OpenAiCompatibleService {
    pub fn new(options: ModelOptions, context_window: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.timeout()))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            http,
            options,
            context_window,
            retry_config: RetryConfig::default(),
        })
    }

    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    fn classify_http_error(status: reqwest::StatusCode, body: &str) -> Error {
        let lower = body.to_lowercase();
        match status.as_u16() {
            429 => Error::RateLimited { retry_after: None },
            503 => Error::Overloaded,
            401 | 403 => Error::AuthFailed(body.to_string()),
            400 if lower.contains("context") && lower.contains("length") => {
                Error::ContextWindowExceeded
            }
            400 => Error::invalid_input(body.to_string()),
            _ if lower.contains("context_length_exceeded")
                || lower.contains("maximum context length") =>
            {
                Error::ContextWindowExceeded
            }
            500..=599 => Error::api(format!("{status}: {body}")),
            _ => Error::api(format!("{status}: {body}")),
        }
    }

    async fn do_request_once(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let messages = to_openai_messages(&request.system_prompt, &request.messages);

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.clone())
        };

        let wire_request = OpenAIRequest {
            model: self.options.model().to_string(),
            messages,
            stream: true,
            max_tokens: request.max_tokens.or(self.options.max_tokens()),
            temperature: Some(request.temperature.unwrap_or(self.options.temperature())),
            tools,
            tool_choice: request.tool_choice.clone(),
        };

        let url = format!(
            "{}/chat/completions",
            self.options.base_url().trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.options.api_key()))
            .json(&wire_request)
            .send()
            .await
            .map_err(Error::Http)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(Self::classify_http_error(status, &body));
        }

        let cost_header = response
            .headers()
            .get(COST_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());

        let mut sse_stream = parse_sse_stream(response);
        let mut aggregator = ToolCallAggregator::new();
        let mut content = Vec::new();
        let mut finish_reason: Option<String> = None;

        while let Some(chunk) = sse_stream.next().await {
            let chunk = chunk?;
            if let Some(choice) = chunk.choices.first() {
                if choice.finish_reason.is_some() {
                    finish_reason = choice.finish_reason.clone();
                }
            }
            let blocks = aggregator.process_chunk(chunk)?;
            content.extend(blocks);
        }

        let stop_reason = StopReason::from_finish_reason(finish_reason.as_deref());

        let input_tokens = crate::context::estimate_tokens(&request.messages) as u64;
        let output_tokens = estimate_response_tokens(&content);
        let cost_usd = match cost_header {
            Some(cost) => cost,
            None => {
                let (input_price, output_price) = price_per_1k_tokens(self.options.model());
                (input_tokens as f64 / 1000.0) * input_price
                    + (output_tokens as f64 / 1000.0) * output_price
            }
        };

        Ok(LlmResponse {
            content,
            stop_reason,
            usage: Usage::new(input_tokens, output_tokens, 0, 0, cost_usd),
        })
    }
}

#[async_trait]
impl LlmService for OpenAiCompatibleService {
    async fn do_request(&self, request: LlmRequest) -> Result<LlmResponse> {
        retry_with_backoff_conditional(self.retry_config.clone(), || {
            self.do_request_once(&request)
        })
        .await
    }

    fn token_context_window(&self) -> u32 {
        self.context_window
    }
}

//! Chat-completion transport layer.
//!
//! Defines the [`ChatTransport`] trait and the shared message types used
//! everywhere a conversation is shaped: the model client, the token
//! budgeter and the iteration loop. The single concrete implementation,
//! [`HttpChatTransport`], speaks the OpenAI-compatible
//! `/chat/completions` wire format, which is what the configured gateway
//! (OpenRouter by default) expects.
//!
//! Responses are returned as raw text plus usage numbers; all JSON
//! interpretation happens downstream in [`crate::jsonish`].

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::types::Role;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// A message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role.
    pub role: Role,
    /// Text or structured multimodal parts.
    pub content: MessageContent,
}

impl ChatMessage {
    /// Plain-text system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Plain-text user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Plain-text assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Plain-text tool message.
    pub fn tool(text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(text.into()),
        }
    }
}

/// Message content: plain text or a sequence of multimodal parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content.
    Text(String),
    /// Structured content blocks (text and images).
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Extract plain text, joining all text parts.
    pub fn text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect(),
        }
    }

    /// All image references in this content.
    pub fn images(&self) -> Vec<&ImageRef> {
        match self {
            Self::Text(_) => Vec::new(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ImageUrl { image_url } => Some(image_url),
                    ContentPart::Text { .. } => None,
                })
                .collect(),
        }
    }
}

/// A single structured content part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An image, inline (`data:` URL) or remote.
    ImageUrl {
        /// The image reference.
        image_url: ImageRef,
    },
}

/// Reference to an image with an optional detail hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    /// `data:<mime>;base64,<payload>` or an `http(s)` URL.
    pub url: String,
    /// Requested detail level; affects token accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ImageDetail>,
}

/// Image detail level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    /// Flat-rate thumbnail processing.
    Low,
    /// Full tiled processing.
    High,
    /// Backend decides.
    Auto,
}

// ---------------------------------------------------------------------------
// Request / Response
// ---------------------------------------------------------------------------

/// A request to a chat transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation, system message first.
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature.
    pub temperature: Option<f64>,
    /// Response token cap.
    pub max_tokens: Option<u32>,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Token usage reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens generated in the reply.
    pub output_tokens: u64,
    /// Input plus output.
    pub total_tokens: u64,
}

/// The response from a chat transport.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// Raw assistant text.
    pub content: String,
    /// Usage numbers when the backend reports them.
    pub usage: Option<TokenUsage>,
    /// The model that served the response.
    pub model: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by chat transports.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// HTTP transport failure.
    #[error("transport request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Response did not match the expected wire shape.
    #[error("transport response parse error: {0}")]
    Parse(String),
    /// Upstream responded with an error status.
    #[error("transport returned non-success status {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Sanitised response body.
        body: String,
    },
    /// The request exceeded its deadline.
    #[error("transport request timed out after {seconds}s")]
    Timeout {
        /// Timeout budget in seconds.
        seconds: u64,
    },
}

impl TransportError {
    /// Whether retrying the request could plausibly succeed.
    ///
    /// Rate limits and server errors are transient; other client errors and
    /// malformed responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) | Self::Timeout { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Parse(_) => false,
        }
    }
}

/// Check HTTP response status and return body text or a structured error.
///
/// # Errors
///
/// Returns `TransportError::Request` on transport failure,
/// `TransportError::HttpStatus` on non-2xx.
pub async fn check_http_response(response: reqwest::Response) -> Result<String, TransportError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(TransportError::HttpStatus {
            status: status.as_u16(),
            body: sanitize_http_error_body(&body),
        });
    }
    Ok(body)
}

fn sanitize_http_error_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut sanitized = collapsed;
    for pattern in [
        r"sk-ant-[A-Za-z0-9_\-]{10,}",
        r"sk-or-[A-Za-z0-9_\-]{10,}",
        r"sk-[A-Za-z0-9]{32,}",
        r"Bearer [A-Za-z0-9_\-\.]{16,}",
    ] {
        if let Ok(regex) = Regex::new(pattern) {
            sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
        }
    }

    const MAX_ERROR_BODY_CHARS: usize = 256;
    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }

    sanitized
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Chat transport interface.
///
/// Implementations must be `Send + Sync`: the model client issues
/// concurrent calls from QA batch workers.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Request a completion.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on network, status or wire-shape failure.
    async fn complete(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;

    /// Short name of the transport, for logging.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// OpenAI-compatible `/chat/completions` transport.
#[derive(Debug, Clone)]
pub struct HttpChatTransport {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpChatTransport {
    /// Create a transport for the given gateway.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn complete(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let messages: Vec<Value> = request.messages.iter().map(wire_message).collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }

        let timeout_secs = request.timeout.as_secs();
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout {
                        seconds: timeout_secs,
                    }
                } else {
                    TransportError::Request(e)
                }
            })?;

        let payload = check_http_response(response).await?;
        let parsed: Value =
            serde_json::from_str(&payload).map_err(|e| TransportError::Parse(e.to_string()))?;

        let content = parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Parse("missing choices[0].message.content".to_owned()))?
            .to_owned();

        let usage = parse_usage(&parsed);
        let model = parsed
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&request.model)
            .to_owned();

        Ok(TransportResponse {
            content,
            usage,
            model,
        })
    }

    fn name(&self) -> &str {
        "http-chat"
    }
}

/// Serialise a [`ChatMessage`] into the chat-completions wire shape.
fn wire_message(message: &ChatMessage) -> Value {
    let content = match &message.content {
        MessageContent::Text(text) => json!(text),
        MessageContent::Parts(parts) => {
            let wire_parts: Vec<Value> = parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::ImageUrl { image_url } => {
                        let mut image = json!({"url": image_url.url});
                        if let Some(detail) = image_url.detail {
                            image["detail"] = json!(detail_label(detail));
                        }
                        json!({"type": "image_url", "image_url": image})
                    }
                })
                .collect();
            json!(wire_parts)
        }
    };

    json!({
        "role": message.role.as_str(),
        "content": content,
    })
}

fn detail_label(detail: ImageDetail) -> &'static str {
    match detail {
        ImageDetail::Low => "low",
        ImageDetail::High => "high",
        ImageDetail::Auto => "auto",
    }
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let input_tokens = usage
        .get("prompt_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = usage
        .get("completion_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(TokenUsage {
        input_tokens,
        output_tokens,
        total_tokens: input_tokens.saturating_add(output_tokens),
    })
}

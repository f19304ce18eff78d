//! Typed wrapper around the chat transport.
//!
//! [`ModelClient::ask`] shapes messages, enforces the context window,
//! retries transient transport failures with exponential backoff, accounts
//! tokens and cost, and coerces the response through [`crate::jsonish`].
//! When an [`OutputSpec`] is given and the parsed value does not satisfy
//! it, the client re-asks once with the schema hint appended; a second
//! mismatch is a [`ModelError::Schema`] carrying request/response
//! breadcrumbs.
//!
//! The client is stateless between calls; concurrent use is expected.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tracing::{debug, warn};

use crate::budget::{BudgetError, CheckOpts, CostBreakdown, TokenBudgeter};
use crate::config::{RequestConfig, RetryConfig};
use crate::jsonish;
use crate::providers::{
    ChatMessage, ChatTransport, TokenUsage, TransportError, TransportRequest, TransportResponse,
};

/// Expected shape of a model answer.
#[derive(Debug, Clone, Default)]
pub struct OutputSpec {
    /// Prose description shown to the model in the schema hint.
    pub description: String,
    /// Keys (kebab-case) that must be present on the answer object.
    pub required_keys: Vec<String>,
}

impl OutputSpec {
    /// Spec that only requires the listed keys.
    pub fn with_keys(keys: &[&str]) -> Self {
        Self {
            description: String::new(),
            required_keys: keys.iter().map(|k| (*k).to_owned()).collect(),
        }
    }

    fn satisfied_by(&self, value: &Value) -> Result<(), String> {
        if self.required_keys.is_empty() {
            return Ok(());
        }
        let Value::Object(map) = value else {
            return Err(format!("expected a JSON object, got {}", kind_label(value)));
        };
        let missing: Vec<&str> = self
            .required_keys
            .iter()
            .map(String::as_str)
            .filter(|k| !map.contains_key(*k))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required keys: {}", missing.join(", ")))
        }
    }

    fn hint(&self) -> String {
        let keys = self.required_keys.join(", ");
        let mut hint = format!(
            "Your previous reply did not match the expected shape. \
             Respond with a single JSON object containing the keys: {keys}."
        );
        if !self.description.is_empty() {
            hint.push(' ');
            hint.push_str(&self.description);
        }
        hint
    }
}

fn kind_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A question for the model.
#[derive(Debug, Clone)]
pub struct AskRequest {
    /// Conversation, system message first.
    pub messages: Vec<ChatMessage>,
    /// Model identifier.
    pub model: String,
    /// Optional output schema for coercion.
    pub spec: Option<OutputSpec>,
    /// Whether to pre-check the context window (default true).
    pub check_context: bool,
    /// Per-request timeout override.
    pub timeout: Option<Duration>,
}

impl AskRequest {
    /// A plain request with the defaults.
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: model.into(),
            spec: None,
            check_context: true,
            timeout: None,
        }
    }

    /// Attach an output spec.
    pub fn with_spec(mut self, spec: OutputSpec) -> Self {
        self.spec = Some(spec);
        self
    }
}

/// The answer, with accounting.
#[derive(Debug, Clone)]
pub struct AskResponse {
    /// Parsed (and spec-coerced, when requested) value.
    pub value: Value,
    /// Raw assistant text.
    pub raw: String,
    /// Jsonish confidence score for the winning parse.
    pub parse_score: u8,
    /// Jsonish repair log.
    pub warnings: Vec<String>,
    /// Token usage across every call made for this ask.
    pub tokens: TokenUsage,
    /// Cost estimate across every call made for this ask.
    pub cost: CostBreakdown,
    /// Wall-clock duration.
    pub duration: Duration,
}

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Transport failed after exhausting the retry policy, or failed
    /// non-transiently.
    #[error("model call to {model} failed after {attempts} attempt(s): {source}")]
    Transport {
        /// Model that was asked.
        model: String,
        /// Attempts made, retries included.
        attempts: u32,
        /// The final transport error.
        #[source]
        source: TransportError,
    },
    /// The response could not be coerced to the requested spec, even after
    /// a re-ask with the schema hint.
    #[error("model {model} response did not match schema: {detail} (response: {snippet})")]
    Schema {
        /// Model that was asked.
        model: String,
        /// Why coercion failed, both attempts.
        detail: String,
        /// Truncated raw response for debugging.
        snippet: String,
    },
    /// The model returned nothing parseable at all.
    #[error("model {model} returned an empty response")]
    EmptyResponse {
        /// Model that was asked.
        model: String,
    },
    /// The conversation does not fit the context window.
    #[error(transparent)]
    Context(#[from] BudgetError),
}

/// Typed model client shared by the engine and the QA pipeline.
#[derive(Clone)]
pub struct ModelClient {
    transport: Arc<dyn ChatTransport>,
    budgeter: TokenBudgeter,
    retry: RetryConfig,
    request: RequestConfig,
}

impl std::fmt::Debug for ModelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelClient")
            .field("transport", &self.transport.name())
            .finish_non_exhaustive()
    }
}

impl ModelClient {
    /// Build a client over a transport.
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        budgeter: TokenBudgeter,
        retry: RetryConfig,
        request: RequestConfig,
    ) -> Self {
        Self {
            transport,
            budgeter,
            retry,
            request,
        }
    }

    /// The budgeter used for accounting.
    pub fn budgeter(&self) -> &TokenBudgeter {
        &self.budgeter
    }

    /// Ask the model and coerce the answer.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] on context overflow (when checking), on
    /// exhausted or non-transient transport failure, and on final schema
    /// mismatch.
    pub async fn ask(&self, request: AskRequest) -> Result<AskResponse, ModelError> {
        let started = Instant::now();

        if request.check_context {
            self.budgeter
                .check_context_limit(
                    &request.model,
                    &request.messages,
                    CheckOpts {
                        reserve_output: self.request.max_response_tokens,
                        throw: true,
                    },
                )
                .await?;
        }

        let mut tokens = TokenUsage::default();
        let response = self
            .complete_with_retry(&request.model, request.messages.clone(), request.timeout)
            .await?;
        accumulate_usage(&mut tokens, &self.usage_for(&request.model, &request.messages, &response).await);

        let parsed = match jsonish::parse(&response.content) {
            Ok(p) => p,
            Err(_) => {
                return Err(ModelError::EmptyResponse {
                    model: request.model,
                })
            }
        };

        let (value, raw, score, warnings) = match &request.spec {
            None => (
                parsed.value,
                response.content,
                parsed.score,
                parsed.warnings,
            ),
            Some(spec) => match spec.satisfied_by(&parsed.value) {
                Ok(()) => (
                    parsed.value,
                    response.content,
                    parsed.score,
                    parsed.warnings,
                ),
                Err(first_failure) => {
                    debug!(model = %request.model, %first_failure, "schema mismatch, re-asking with hint");
                    self.re_ask_with_hint(&request, spec, &response.content, &mut tokens, first_failure)
                        .await?
                }
            },
        };

        let cost = self
            .budgeter
            .estimate_cost(&request.model, tokens.input_tokens, tokens.output_tokens);

        Ok(AskResponse {
            value,
            raw,
            parse_score: score,
            warnings,
            tokens,
            cost,
            duration: started.elapsed(),
        })
    }

    /// One corrective round-trip with the schema hint appended.
    async fn re_ask_with_hint(
        &self,
        request: &AskRequest,
        spec: &OutputSpec,
        previous_reply: &str,
        tokens: &mut TokenUsage,
        first_failure: String,
    ) -> Result<(Value, String, u8, Vec<String>), ModelError> {
        let mut messages = request.messages.clone();
        messages.push(ChatMessage::assistant(previous_reply));
        messages.push(ChatMessage::user(spec.hint()));

        let response = self
            .complete_with_retry(&request.model, messages.clone(), request.timeout)
            .await?;
        accumulate_usage(tokens, &self.usage_for(&request.model, &messages, &response).await);

        let parsed = jsonish::parse(&response.content).map_err(|_| ModelError::EmptyResponse {
            model: request.model.clone(),
        })?;

        match spec.satisfied_by(&parsed.value) {
            Ok(()) => Ok((
                parsed.value,
                response.content,
                parsed.score,
                parsed.warnings,
            )),
            Err(second_failure) => Err(ModelError::Schema {
                model: request.model.clone(),
                detail: format!("{first_failure}; after hint: {second_failure}"),
                snippet: snippet_of(&response.content),
            }),
        }
    }

    /// Call the transport, retrying transient failures per policy.
    async fn complete_with_retry(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        timeout: Option<Duration>,
    ) -> Result<TransportResponse, ModelError> {
        let timeout = timeout.unwrap_or_else(|| self.request.timeout());
        let mut attempt = 0u32;

        loop {
            let transport_request = TransportRequest {
                model: model.to_owned(),
                messages: messages.clone(),
                temperature: None,
                max_tokens: Some(self.request.max_response_tokens),
                timeout,
            };

            match self.transport.complete(transport_request).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = jittered(self.retry.delay_for_attempt(attempt));
                    warn!(
                        model,
                        attempt = attempt.saturating_add(1),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "transient model failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    return Err(ModelError::Transport {
                        model: model.to_owned(),
                        attempts: attempt.saturating_add(1),
                        source: e,
                    })
                }
            }
        }
    }

    /// Backend-reported usage, or a local count when the backend is silent.
    async fn usage_for(
        &self,
        model: &str,
        messages: &[ChatMessage],
        response: &TransportResponse,
    ) -> TokenUsage {
        if let Some(usage) = response.usage {
            return usage;
        }
        let input = u64::from(self.budgeter.count_messages(model, messages).await);
        let output = u64::from(self.budgeter.count_text(model, &response.content));
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input.saturating_add(output),
        }
    }
}

fn accumulate_usage(total: &mut TokenUsage, call: &TokenUsage) {
    total.input_tokens = total.input_tokens.saturating_add(call.input_tokens);
    total.output_tokens = total.output_tokens.saturating_add(call.output_tokens);
    total.total_tokens = total.total_tokens.saturating_add(call.total_tokens);
}

/// Add up to 25% random jitter so concurrent retries do not stampede.
fn jittered(delay: Duration) -> Duration {
    let jitter_cap = delay.as_millis() / 4;
    if jitter_cap == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
    delay.saturating_add(Duration::from_millis(u64::try_from(jitter).unwrap_or(0)))
}

fn snippet_of(text: &str) -> String {
    const CAP: usize = 200;
    if text.chars().count() <= CAP {
        return text.to_owned();
    }
    let cut: String = text.chars().take(CAP).collect();
    format!("{cut}...")
}

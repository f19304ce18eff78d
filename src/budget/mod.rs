//! Token budgeting: counting, pricing and context-window fitting.
//!
//! Counting uses real BPE tokenisation via `tiktoken-rs` (o200k_base for
//! the gpt-4o / o-series family, cl100k_base for everything else, including
//! unknown models). Encoders are process-wide singletons behind
//! [`OnceLock`]s — loading one costs tens of milliseconds.
//!
//! Message counting adds a per-message overhead from a family table plus a
//! fixed 3-token chat priming. Image parts are billed by tile count (see
//! [`image`]), which needs pixel dimensions from the injectable
//! [`ImageDimensionProbe`].

pub mod image;

use std::sync::{Arc, OnceLock};

use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};
use tracing::warn;

use crate::providers::{ChatMessage, ImageDetail, MessageContent};

pub use image::{HeaderProbe, ImageDimensionProbe, StaticProbe};

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

/// Which BPE vocabulary a model uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    O200k,
    Cl100k,
}

fn o200k() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| o200k_base().expect("failed to load o200k_base tokeniser"))
}

fn cl100k() -> &'static CoreBPE {
    static BPE: OnceLock<CoreBPE> = OnceLock::new();
    BPE.get_or_init(|| cl100k_base().expect("failed to load cl100k_base tokeniser"))
}

/// Model-to-encoding routing. Unknown models fall back to cl100k_base.
fn encoding_for(model: &str) -> Encoding {
    const O200K_FAMILIES: &[&str] = &["gpt-4o", "gpt-4.1", "o1", "o3", "o4", "chatgpt-4o"];
    let bare = model.rsplit('/').next().unwrap_or(model);
    if O200K_FAMILIES.iter().any(|family| bare.starts_with(family)) {
        Encoding::O200k
    } else {
        Encoding::Cl100k
    }
}

fn bpe_for(model: &str) -> &'static CoreBPE {
    match encoding_for(model) {
        Encoding::O200k => o200k(),
        Encoding::Cl100k => cl100k(),
    }
}

// ---------------------------------------------------------------------------
// Model tables
// ---------------------------------------------------------------------------

/// Context window sizes by model-name prefix. First match wins.
const CONTEXT_LIMITS: &[(&str, u32)] = &[
    ("gpt-4o-mini", 128_000),
    ("gpt-4o", 128_000),
    ("gpt-4.1", 1_047_576),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("o1", 200_000),
    ("o3", 200_000),
    ("claude-3-5", 200_000),
    ("claude-3", 200_000),
    ("claude", 200_000),
    ("gemini-1.5-pro", 2_097_152),
    ("gemini", 1_048_576),
    ("llama", 128_000),
];

/// Conservative window assumed for models not in the table.
const DEFAULT_CONTEXT_LIMIT: u32 = 8_192;

/// Per-message token overhead by model family.
const MESSAGE_OVERHEAD: &[(&str, u32)] = &[
    ("gpt-", 3),
    ("o1", 3),
    ("o3", 3),
    ("chatgpt", 3),
    ("claude", 4),
];

/// Overhead assumed for unknown families.
const DEFAULT_MESSAGE_OVERHEAD: u32 = 4;

/// Fixed priming cost of a chat completion.
const CHAT_PRIMING_TOKENS: u32 = 3;

/// USD per million input/output tokens, by model-name prefix.
const PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1", 2.00, 8.00),
    ("gpt-4-turbo", 10.00, 30.00),
    ("gpt-4", 30.00, 60.00),
    ("gpt-3.5-turbo", 0.50, 1.50),
    ("o1-mini", 1.10, 4.40),
    ("o1", 15.00, 60.00),
    ("o3-mini", 1.10, 4.40),
    ("claude-3-5-haiku", 0.80, 4.00),
    ("claude-3-5-sonnet", 3.00, 15.00),
    ("claude-3-opus", 15.00, 75.00),
    ("claude", 3.00, 15.00),
    ("gemini-1.5-flash", 0.075, 0.30),
    ("gemini", 1.25, 5.00),
];

/// Deliberately expensive assumption for unknown models, so budget checks
/// err on the side of caution.
const DEFAULT_PRICING: (f64, f64) = (10.00, 30.00);

fn lookup<'a, T: Copy>(table: &'a [(&'a str, T)], model: &str) -> Option<T> {
    let bare = model.rsplit('/').next().unwrap_or(model);
    table
        .iter()
        .find(|(prefix, _)| bare.starts_with(prefix))
        .map(|(_, v)| *v)
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Errors surfaced by the budgeter.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    /// The conversation does not fit the model's context window.
    #[error("context overflow: {tokens} tokens against a limit of {limit}")]
    ContextOverflow {
        /// Counted tokens including reserved output.
        tokens: u32,
        /// Usable context limit.
        limit: u32,
    },
}

/// Cost estimate in USD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostBreakdown {
    /// Input-token cost.
    pub input: f64,
    /// Output-token cost.
    pub output: f64,
    /// Input plus output.
    pub total: f64,
}

/// Result of a context-limit check.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextCheck {
    /// Whether the messages (plus reserve) fit.
    pub ok: bool,
    /// Tokens over the limit; zero when `ok`.
    pub overflow: u32,
    /// Human-readable error when not ok.
    pub error: Option<String>,
}

/// Which end of the text to cut when truncating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TruncateFrom {
    /// Cut from the start, keeping the tail.
    Start,
    /// Cut from the end, keeping the head.
    #[default]
    End,
}

/// Options for [`TokenBudgeter::truncate_text`].
#[derive(Debug, Clone, Default)]
pub struct TruncateOpts {
    /// Which side to cut.
    pub from: TruncateFrom,
    /// Marker inserted at the cut side (e.g. `"..."`).
    pub marker: Option<String>,
}

/// Options for [`TokenBudgeter::check_context_limit`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOpts {
    /// Output tokens to reserve on top of the input count.
    pub reserve_output: u32,
    /// Surface overflow as an error instead of data.
    pub throw: bool,
}

// ---------------------------------------------------------------------------
// TokenBudgeter
// ---------------------------------------------------------------------------

/// Model-aware token counter, cost estimator and context fitter.
#[derive(Clone)]
pub struct TokenBudgeter {
    probe: Arc<dyn ImageDimensionProbe>,
}

impl std::fmt::Debug for TokenBudgeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBudgeter").finish_non_exhaustive()
    }
}

impl Default for TokenBudgeter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenBudgeter {
    /// Budgeter with the production header probe.
    pub fn new() -> Self {
        Self {
            probe: Arc::new(HeaderProbe::new()),
        }
    }

    /// Budgeter with an injected dimension probe (tests, offline use).
    pub fn with_probe(probe: Arc<dyn ImageDimensionProbe>) -> Self {
        Self { probe }
    }

    /// Count tokens in a plain string for the given model.
    pub fn count_text(&self, model: &str, text: &str) -> u32 {
        let tokens = bpe_for(model).encode_with_special_tokens(text).len();
        u32::try_from(tokens).unwrap_or(u32::MAX)
    }

    /// Count tokens across chat messages, including per-message overhead,
    /// chat priming, and image parts.
    pub async fn count_messages(&self, model: &str, messages: &[ChatMessage]) -> u32 {
        let overhead = lookup(MESSAGE_OVERHEAD, model).unwrap_or(DEFAULT_MESSAGE_OVERHEAD);
        let mut total = CHAT_PRIMING_TOKENS;
        for message in messages {
            total = total
                .saturating_add(overhead)
                .saturating_add(self.count_text(model, message.role.as_str()))
                .saturating_add(self.count_text(model, &message.content.text()));
            total = total.saturating_add(self.count_images(model, &message.content).await);
        }
        total
    }

    async fn count_images(&self, _model: &str, content: &MessageContent) -> u32 {
        let mut total = 0u32;
        for image in content.images() {
            if image.detail == Some(ImageDetail::Low) {
                total = total.saturating_add(image::LOW_DETAIL_TOKENS);
                continue;
            }
            let cost = match self.probe.dimensions(&image.url).await {
                Some((w, h)) => image::image_tokens(w, h),
                None => {
                    warn!("image dimensions unavailable, assuming fallback token cost");
                    image::FALLBACK_IMAGE_TOKENS
                }
            };
            total = total.saturating_add(cost);
        }
        total
    }

    /// Input-plus-expected-output count: the sum of an independent
    /// [`Self::count_messages`] and [`Self::count_text`] on the output.
    pub async fn count_and_estimate(
        &self,
        model: &str,
        messages: &[ChatMessage],
        expected_output: &str,
    ) -> u32 {
        self.count_messages(model, messages)
            .await
            .saturating_add(self.count_text(model, expected_output))
    }

    /// USD cost estimate for a call.
    pub fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> CostBreakdown {
        let (price_in, price_out) = lookup_pricing(model);
        let input = tokens_to_millions(input_tokens) * price_in;
        let output = tokens_to_millions(output_tokens) * price_out;
        CostBreakdown {
            input,
            output,
            total: input + output,
        }
    }

    /// Context window size for the model.
    pub fn context_limit(&self, model: &str) -> u32 {
        lookup(CONTEXT_LIMITS, model).unwrap_or(DEFAULT_CONTEXT_LIMIT)
    }

    /// Usable input budget after reserving output tokens.
    pub fn max_input_tokens(&self, model: &str, reserve_output: u32) -> u32 {
        self.context_limit(model).saturating_sub(reserve_output)
    }

    /// Truncate text to at most `max_tokens`, cutting from the configured
    /// side and placing the marker at the cut.
    pub fn truncate_text(
        &self,
        model: &str,
        text: &str,
        max_tokens: u32,
        opts: &TruncateOpts,
    ) -> String {
        if self.count_text(model, text) <= max_tokens {
            return text.to_owned();
        }

        let marker = opts.marker.as_deref().unwrap_or("");
        let marker_tokens = if marker.is_empty() {
            0
        } else {
            self.count_text(model, marker)
        };
        let budget = max_tokens.saturating_sub(marker_tokens);

        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        let kept = match opts.from {
            TruncateFrom::End => {
                let cut = self.longest_fitting(model, text, &boundaries, budget, true);
                format!("{}{marker}", &text[..cut])
            }
            TruncateFrom::Start => {
                let cut = self.longest_fitting(model, text, &boundaries, budget, false);
                format!("{marker}{}", &text[cut..])
            }
        };
        kept
    }

    /// Binary-search the longest prefix (or suffix) that fits `budget`
    /// tokens. The empty slice always fits, so the search cannot fail; a
    /// final correction loop guards the rare non-monotone BPE boundary.
    fn longest_fitting(
        &self,
        model: &str,
        text: &str,
        boundaries: &[usize],
        budget: u32,
        prefix: bool,
    ) -> usize {
        let fits = |idx: usize| {
            let slice = if prefix {
                &text[..boundaries[idx]]
            } else {
                &text[boundaries[idx]..]
            };
            self.count_text(model, slice) <= budget
        };

        let last = boundaries.len().saturating_sub(1);
        let mut lo = 0usize;
        let mut hi = last;
        if prefix {
            // Largest index whose prefix fits.
            while lo < hi {
                let mid = lo.saturating_add(hi).saturating_add(1) / 2;
                if fits(mid) {
                    lo = mid;
                } else {
                    hi = mid.saturating_sub(1);
                }
            }
            while lo > 0 && !fits(lo) {
                lo = lo.saturating_sub(1);
            }
        } else {
            // Smallest index whose suffix fits.
            while lo < hi {
                let mid = lo.saturating_add(hi) / 2;
                if fits(mid) {
                    hi = mid;
                } else {
                    lo = mid.saturating_add(1);
                }
            }
            while lo < last && !fits(lo) {
                lo = lo.saturating_add(1);
            }
        }
        boundaries[lo]
    }

    /// Trim a conversation to `max_tokens`, preserving the first system
    /// message and the last user message, dropping middle messages oldest
    /// first.
    pub async fn truncate_messages(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Vec<ChatMessage> {
        if messages.is_empty() {
            return Vec::new();
        }
        if self.count_messages(model, messages).await <= max_tokens {
            return messages.to_vec();
        }

        let system_idx = messages
            .iter()
            .position(|m| m.role == crate::types::Role::System);
        let last_user_idx = messages
            .iter()
            .rposition(|m| m.role == crate::types::Role::User);

        let mut pinned: Vec<usize> = Vec::new();
        if let Some(i) = system_idx {
            pinned.push(i);
        }
        if let Some(i) = last_user_idx {
            if !pinned.contains(&i) {
                pinned.push(i);
            }
        }

        let mut kept: Vec<usize> = pinned.clone();
        let pinned_msgs: Vec<ChatMessage> = pinned.iter().map(|&i| messages[i].clone()).collect();
        let mut used = self.count_messages(model, &pinned_msgs).await;

        // Fill remaining budget newest-first from the unpinned middle.
        for (i, message) in messages.iter().enumerate().rev() {
            if pinned.contains(&i) {
                continue;
            }
            let cost = self.count_messages(model, std::slice::from_ref(message)).await;
            // Single-message counts re-pay the priming cost; discount it.
            let cost = cost.saturating_sub(CHAT_PRIMING_TOKENS);
            if used.saturating_add(cost) > max_tokens {
                continue;
            }
            used = used.saturating_add(cost);
            kept.push(i);
        }

        kept.sort_unstable();
        kept.into_iter().map(|i| messages[i].clone()).collect()
    }

    /// Check whether messages (plus a reserve) fit the model's window.
    ///
    /// # Errors
    ///
    /// With `opts.throw`, returns [`BudgetError::ContextOverflow`] on
    /// overflow instead of reporting it as data.
    pub async fn check_context_limit(
        &self,
        model: &str,
        messages: &[ChatMessage],
        opts: CheckOpts,
    ) -> Result<ContextCheck, BudgetError> {
        let counted = self
            .count_messages(model, messages)
            .await
            .saturating_add(opts.reserve_output);
        let limit = self.context_limit(model);

        if counted <= limit {
            return Ok(ContextCheck {
                ok: true,
                overflow: 0,
                error: None,
            });
        }

        let overflow = counted.saturating_sub(limit);
        if opts.throw {
            return Err(BudgetError::ContextOverflow {
                tokens: counted,
                limit,
            });
        }
        Ok(ContextCheck {
            ok: false,
            overflow,
            error: Some(format!(
                "messages need {counted} tokens but {model} allows {limit}"
            )),
        })
    }
}

fn lookup_pricing(model: &str) -> (f64, f64) {
    let bare = model.rsplit('/').next().unwrap_or(model);
    PRICING
        .iter()
        .find(|(prefix, _, _)| bare.starts_with(prefix))
        .map_or(DEFAULT_PRICING, |(_, input, output)| (*input, *output))
}

#[allow(clippy::cast_precision_loss)] // token counts are far below 2^52
fn tokens_to_millions(tokens: u64) -> f64 {
    tokens as f64 / 1_000_000.0
}

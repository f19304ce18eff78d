//! Schemaless-adaptive parsing of model output into JSON values.
//!
//! Model responses arrive as strict JSON, fenced JSON, narrative text with
//! embedded JSON, or something that merely resembles JSON. The cascade here
//! tries progressively more forgiving strategies and reports which one won
//! via a score, together with a log of every repair that was applied:
//!
//! 1. strict parse (score 100)
//! 2. fenced code block extraction (90)
//! 3. balanced `{...}` / `[...]` span extraction (70-80)
//! 4. fixing parser: unquoted keys, single quotes, trailing commas,
//!    `True`/`False`/`None`, bare-word strings (10-50)
//! 5. the raw input as a string (0)
//!
//! Object keys are normalised from snake_case to kebab-case before the value
//! is exposed, so downstream `serde` types use kebab-case field names.

mod fixing;

use serde::de::DeserializeOwned;
use serde_json::Value;

pub use fixing::{fix_parse, Fix};

/// Result of a cascade parse.
#[derive(Debug, Clone, PartialEq)]
pub struct Parsed {
    /// The recovered value, keys normalised to kebab-case.
    pub value: Value,
    /// One entry per repair or extraction step that was needed.
    pub warnings: Vec<String>,
    /// Confidence score of the winning strategy (0-100).
    pub score: u8,
}

/// Errors from the cascade. Everything except empty input degrades to a
/// raw-string parse, so this is deliberately small.
#[derive(Debug, thiserror::Error)]
pub enum JsonishError {
    /// The input was empty or whitespace-only.
    #[error("cannot parse empty input")]
    EmptyInput,
}

/// Parse possibly-malformed model output into a JSON value.
///
/// Never fails on non-empty input: the last cascade stage returns the raw
/// text as a JSON string with score 0.
///
/// # Errors
///
/// Returns [`JsonishError::EmptyInput`] when `input` is empty or blank.
pub fn parse(input: &str) -> Result<Parsed, JsonishError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(JsonishError::EmptyInput);
    }

    // 1. Strict JSON.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(Parsed {
            value: normalise_keys(value),
            warnings: Vec::new(),
            score: 100,
        });
    }

    // 2. Fenced code blocks, language tag irrelevant.
    for block in extract_fenced_blocks(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block.trim()) {
            return Ok(Parsed {
                value: normalise_keys(value),
                warnings: vec!["extracted JSON from fenced code block".to_owned()],
                score: 90,
            });
        }
    }

    // 3. Balanced spans embedded in narrative text.
    if let Some((value, span_len)) = best_balanced_span(trimmed) {
        let score = span_score(span_len, trimmed.len());
        return Ok(Parsed {
            value: normalise_keys(value),
            warnings: vec![format!(
                "extracted balanced JSON span ({span_len} of {} chars)",
                trimmed.len()
            )],
            score,
        });
    }

    // 4. Fixing parser, preferring fenced content when present.
    let fix_candidates: Vec<&str> = {
        let mut cands = extract_fenced_blocks(trimmed);
        cands.push(trimmed);
        cands
    };
    for candidate in fix_candidates {
        if let Some((value, fixes)) = fix_parse(candidate.trim()) {
            let warnings: Vec<String> = fixes.iter().map(Fix::describe).collect();
            let score = fix_score(fixes.len());
            return Ok(Parsed {
                value: normalise_keys(value),
                warnings,
                score,
            });
        }
    }

    // 5. Raw input as a string.
    Ok(Parsed {
        value: Value::String(trimmed.to_owned()),
        warnings: vec!["no JSON found; returning raw input as string".to_owned()],
        score: 0,
    })
}

/// Parse and deserialise into a concrete type in one step.
///
/// # Errors
///
/// Returns [`JsonishError::EmptyInput`] for blank input; deserialisation
/// failure is reported through the inner `serde_json::Error`.
pub fn parse_typed<T: DeserializeOwned>(
    input: &str,
) -> Result<Result<T, serde_json::Error>, JsonishError> {
    let parsed = parse(input)?;
    Ok(serde_json::from_value(parsed.value))
}

/// Score for a balanced-span extraction: 70 base, up to +10 when the span
/// covers most of the input.
fn span_score(span_len: usize, total_len: usize) -> u8 {
    if total_len == 0 {
        return 70;
    }
    let ratio = span_len.saturating_mul(10).checked_div(total_len).unwrap_or(0);
    let bonus = u8::try_from(ratio.min(10)).unwrap_or(10);
    70u8.saturating_add(bonus)
}

/// Score for a fixed parse: starts at 50 and drops with every repair.
fn fix_score(fix_count: usize) -> u8 {
    let penalty = u8::try_from(fix_count.saturating_mul(8)).unwrap_or(u8::MAX);
    50u8.saturating_sub(penalty).max(10)
}

// ---------------------------------------------------------------------------
// Fenced block extraction
// ---------------------------------------------------------------------------

/// Return the contents of every triple-backtick fenced block, in order.
/// An optional language tag on the opening fence is skipped.
pub fn extract_fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_fence = &rest[open.saturating_add(3)..];
        // Skip the language tag: everything up to the first newline.
        let body_start = after_fence.find('\n').map_or(after_fence.len(), |i| {
            i.saturating_add(1)
        });
        let body = &after_fence[body_start..];
        match body.find("```") {
            Some(close) => {
                blocks.push(&body[..close]);
                rest = &body[close.saturating_add(3)..];
            }
            None => break,
        }
    }
    blocks
}

// ---------------------------------------------------------------------------
// Balanced span extraction
// ---------------------------------------------------------------------------

/// Find every balanced `{...}` or `[...]` span in the text, parse each, and
/// return the longest successfully parsed one with its length.
fn best_balanced_span(text: &str) -> Option<(Value, usize)> {
    let bytes = text.as_bytes();
    let mut best: Option<(Value, usize)> = None;
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'{' || b == b'[' {
            if let Some(end) = matching_close(text, i) {
                let span = &text[i..=end];
                if let Ok(value) = serde_json::from_str::<Value>(span) {
                    let len = span.len();
                    let better = best.as_ref().is_none_or(|(_, l)| len > *l);
                    if better {
                        best = Some((value, len));
                    }
                    // Continue past this span to consider later candidates.
                    i = end;
                }
            }
        }
        i = i.saturating_add(1);
    }
    best
}

/// Index of the close bracket matching the open bracket at `start`, honouring
/// string literals and escapes. Returns `None` when unbalanced.
fn matching_close(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            _ if b == open => depth = depth.saturating_add(1),
            _ if b == close => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(start.saturating_add(offset));
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Key normalisation
// ---------------------------------------------------------------------------

/// Recursively rewrite object keys from snake_case to kebab-case.
pub fn normalise_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let normalised = map
                .into_iter()
                .map(|(k, v)| (k.replace('_', "-"), normalise_keys(v)))
                .collect();
            Value::Object(normalised)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalise_keys).collect()),
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! The fixing parser: a small, data-driven repair pass for almost-JSON.
//!
//! Each repair is a named reduction over the character stream. The stream is
//! rewritten into strict JSON, every applied fix is logged, and the result
//! is handed to `serde_json`. If the rewritten text still does not parse,
//! the candidate is rejected and the cascade falls through.

use serde_json::Value;

/// A named repair applied by [`fix_parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fix {
    /// `'single quoted'` rewritten to double quotes.
    SingleQuotes,
    /// An unquoted object key was quoted.
    UnquotedKey,
    /// A trailing comma before `}` or `]` was removed.
    TrailingComma,
    /// `True` / `False` / `None` normalised to JSON literals.
    PythonLiteral,
    /// A bare word in value position was quoted as a string.
    BareWordValue,
}

impl Fix {
    /// Human-readable log line for the fix.
    pub fn describe(&self) -> String {
        match self {
            Self::SingleQuotes => "rewrote single-quoted string to double quotes".to_owned(),
            Self::UnquotedKey => "quoted an unquoted object key".to_owned(),
            Self::TrailingComma => "removed a trailing comma".to_owned(),
            Self::PythonLiteral => "normalised True/False/None literal".to_owned(),
            Self::BareWordValue => "quoted a bare word as a string value".to_owned(),
        }
    }
}

/// Attempt to repair `input` into strict JSON.
///
/// Returns the parsed value and the ordered list of fixes, or `None` when
/// the text is beyond repair.
pub fn fix_parse(input: &str) -> Option<(Value, Vec<Fix>)> {
    let mut out = String::with_capacity(input.len().saturating_add(16));
    let mut fixes: Vec<Fix> = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                i = copy_string(&chars, i, &mut out)?;
            }
            '\'' => {
                i = rewrite_single_quoted(&chars, i, &mut out)?;
                fixes.push(Fix::SingleQuotes);
            }
            ',' => {
                // Trailing comma: skip when the next significant char closes
                // the container.
                let next = next_significant(&chars, i.saturating_add(1));
                match next {
                    Some((_, '}')) | Some((_, ']')) => {
                        fixes.push(Fix::TrailingComma);
                        i = i.saturating_add(1);
                    }
                    _ => {
                        out.push(',');
                        i = i.saturating_add(1);
                    }
                }
            }
            '{' | '}' | '[' | ']' | ':' => {
                out.push(c);
                i = i.saturating_add(1);
            }
            c if c.is_whitespace() => {
                out.push(c);
                i = i.saturating_add(1);
            }
            c if c.is_ascii_digit() || c == '-' => {
                i = copy_number(&chars, i, &mut out);
            }
            c if c.is_alphabetic() || c == '_' => {
                i = rewrite_word(&chars, i, &mut out, &mut fixes);
            }
            _ => return None,
        }
    }

    let value: Value = serde_json::from_str(&out).ok()?;
    Some((value, fixes))
}

/// Copy a double-quoted string literal verbatim, honouring escapes.
/// Returns the index just past the closing quote.
fn copy_string(chars: &[char], start: usize, out: &mut String) -> Option<usize> {
    out.push('"');
    let mut i = start.saturating_add(1);
    let mut escaped = false;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            return Some(i.saturating_add(1));
        }
        i = i.saturating_add(1);
    }
    None
}

/// Rewrite a single-quoted string into a double-quoted one, escaping any
/// embedded double quotes.
fn rewrite_single_quoted(chars: &[char], start: usize, out: &mut String) -> Option<usize> {
    out.push('"');
    let mut i = start.saturating_add(1);
    let mut escaped = false;
    while i < chars.len() {
        let c = chars[i];
        if escaped {
            // Preserve \' as a literal apostrophe; JSON has no such escape.
            if c == '\'' {
                out.push('\'');
            } else {
                out.push('\\');
                out.push(c);
            }
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '\'' {
            out.push('"');
            return Some(i.saturating_add(1));
        } else if c == '"' {
            out.push('\\');
            out.push('"');
        } else {
            out.push(c);
        }
        i = i.saturating_add(1);
    }
    None
}

/// Copy a JSON number token.
fn copy_number(chars: &[char], start: usize, out: &mut String) -> usize {
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
            out.push(c);
            i = i.saturating_add(1);
        } else {
            break;
        }
    }
    i
}

/// Handle a bare word: JSON literal, Python literal, unquoted key, or a
/// bare-word string value.
fn rewrite_word(chars: &[char], start: usize, out: &mut String, fixes: &mut Vec<Fix>) -> usize {
    let mut i = start;
    let mut word = String::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
            i = i.saturating_add(1);
        } else {
            break;
        }
    }

    match word.as_str() {
        "true" | "false" | "null" => out.push_str(&word),
        "True" => {
            out.push_str("true");
            fixes.push(Fix::PythonLiteral);
        }
        "False" => {
            out.push_str("false");
            fixes.push(Fix::PythonLiteral);
        }
        "None" => {
            out.push_str("null");
            fixes.push(Fix::PythonLiteral);
        }
        _ => {
            // Key position when the next significant char is a colon.
            let is_key = matches!(next_significant(chars, i), Some((_, ':')));
            out.push('"');
            out.push_str(&word);
            out.push('"');
            fixes.push(if is_key {
                Fix::UnquotedKey
            } else {
                Fix::BareWordValue
            });
        }
    }
    i
}

/// The next non-whitespace character at or after `from`.
fn next_significant(chars: &[char], from: usize) -> Option<(usize, char)> {
    let mut i = from;
    while i < chars.len() {
        if !chars[i].is_whitespace() {
            return Some((i, chars[i]));
        }
        i = i.saturating_add(1);
    }
    None
}

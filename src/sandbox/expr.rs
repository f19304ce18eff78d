//! Reader for model-emitted code snippets.
//!
//! Snippets are s-expressions: the shape models reliably produce when told
//! to call tools. The reader lexes, parses into [`Expr`] trees, and then
//! rejects any operator outside the allow-list before evaluation starts.
//! Commas are whitespace and `;` starts a line comment.

use std::collections::HashSet;

use chrono::NaiveDate;

use super::value::Value;
use super::SandboxError;

/// A parsed form.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Self-evaluating literal.
    Literal(Value),
    /// Symbol reference, resolved against scopes at eval time.
    Symbol(String),
    /// `(op args...)` call or special form.
    List(Vec<Expr>),
    /// `[a b c]` vector literal.
    Vector(Vec<Expr>),
    /// `{:k v ...}` map literal.
    MapLit(Vec<(Expr, Expr)>),
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Str(String),
    Int(i64),
    Float(f64),
    Keyword(String),
    Symbol(String),
}

fn lex(source: &str) -> Result<Vec<Token>, SandboxError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ';' => {
                while i < chars.len() && chars[i] != '\n' {
                    i = i.saturating_add(1);
                }
            }
            '(' => {
                tokens.push(Token::LParen);
                i = i.saturating_add(1);
            }
            ')' => {
                tokens.push(Token::RParen);
                i = i.saturating_add(1);
            }
            '[' => {
                tokens.push(Token::LBracket);
                i = i.saturating_add(1);
            }
            ']' => {
                tokens.push(Token::RBracket);
                i = i.saturating_add(1);
            }
            '{' => {
                tokens.push(Token::LBrace);
                i = i.saturating_add(1);
            }
            '}' => {
                tokens.push(Token::RBrace);
                i = i.saturating_add(1);
            }
            '"' => {
                let (s, next) = lex_string(&chars, i)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            ':' => {
                let mut j = i.saturating_add(1);
                let mut name = String::new();
                while j < chars.len() && is_symbol_char(chars[j]) {
                    name.push(chars[j]);
                    j = j.saturating_add(1);
                }
                if name.is_empty() {
                    return Err(SandboxError::Parse("bare ':' is not a keyword".to_owned()));
                }
                tokens.push(Token::Keyword(name));
                i = j;
            }
            c if c.is_whitespace() || c == ',' => {
                i = i.saturating_add(1);
            }
            c if c.is_ascii_digit()
                || (c == '-'
                    && chars
                        .get(i.saturating_add(1))
                        .is_some_and(|n| n.is_ascii_digit())) =>
            {
                let (token, next) = lex_number(&chars, i)?;
                tokens.push(token);
                i = next;
            }
            c if is_symbol_start(c) => {
                let mut j = i;
                let mut name = String::new();
                while j < chars.len() && is_symbol_char(chars[j]) {
                    name.push(chars[j]);
                    j = j.saturating_add(1);
                }
                tokens.push(Token::Symbol(name));
                i = j;
            }
            other => {
                return Err(SandboxError::Parse(format!(
                    "unexpected character {other:?}"
                )))
            }
        }
    }
    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize), SandboxError> {
    let mut s = String::new();
    let mut i = start.saturating_add(1);
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            let next = chars.get(i.saturating_add(1)).copied();
            match next {
                Some('n') => s.push('\n'),
                Some('t') => s.push('\t'),
                Some('r') => s.push('\r'),
                Some('"') => s.push('"'),
                Some('\\') => s.push('\\'),
                Some(other) => s.push(other),
                None => return Err(SandboxError::Parse("dangling escape".to_owned())),
            }
            i = i.saturating_add(2);
        } else if c == '"' {
            return Ok((s, i.saturating_add(1)));
        } else {
            s.push(c);
            i = i.saturating_add(1);
        }
    }
    Err(SandboxError::Parse("unterminated string literal".to_owned()))
}

fn lex_number(chars: &[char], start: usize) -> Result<(Token, usize), SandboxError> {
    let mut j = start;
    let mut text = String::new();
    if chars[j] == '-' {
        text.push('-');
        j = j.saturating_add(1);
    }
    let mut is_float = false;
    while j < chars.len() {
        let c = chars[j];
        if c.is_ascii_digit() {
            text.push(c);
        } else if c == '.' && !is_float {
            is_float = true;
            text.push(c);
        } else {
            break;
        }
        j = j.saturating_add(1);
    }
    let token = if is_float {
        Token::Float(
            text.parse()
                .map_err(|_| SandboxError::Parse(format!("bad float literal {text}")))?,
        )
    } else {
        Token::Int(
            text.parse()
                .map_err(|_| SandboxError::Parse(format!("bad int literal {text}")))?,
        )
    };
    Ok((token, j))
}

fn is_symbol_start(c: char) -> bool {
    c.is_alphabetic() || "+-*/<>=!?_%&".contains(c)
}

fn is_symbol_char(c: char) -> bool {
    c.is_alphanumeric() || "+-*/<>=!?_%&.'".contains(c)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a snippet into top-level forms.
///
/// # Errors
///
/// Returns [`SandboxError::Parse`] on lexical or structural problems.
pub fn parse_forms(source: &str) -> Result<Vec<Expr>, SandboxError> {
    let tokens = lex(source)?;
    let mut forms = Vec::new();
    let mut pos = 0usize;
    while pos < tokens.len() {
        let (expr, next) = parse_expr(&tokens, pos)?;
        forms.push(expr);
        pos = next;
    }
    Ok(forms)
}

fn parse_expr(tokens: &[Token], pos: usize) -> Result<(Expr, usize), SandboxError> {
    let Some(token) = tokens.get(pos) else {
        return Err(SandboxError::Parse("unexpected end of input".to_owned()));
    };
    match token {
        Token::LParen => parse_seq(tokens, pos.saturating_add(1), &Token::RParen)
            .map(|(items, next)| (Expr::List(items), next)),
        Token::LBracket => parse_seq(tokens, pos.saturating_add(1), &Token::RBracket)
            .map(|(items, next)| (Expr::Vector(items), next)),
        Token::LBrace => {
            let (items, next) = parse_seq(tokens, pos.saturating_add(1), &Token::RBrace)?;
            if items.len() % 2 != 0 {
                return Err(SandboxError::Parse(
                    "map literal needs an even number of forms".to_owned(),
                ));
            }
            let mut pairs = Vec::with_capacity(items.len() / 2);
            let mut iter = items.into_iter();
            while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                pairs.push((k, v));
            }
            Ok((Expr::MapLit(pairs), next))
        }
        Token::RParen | Token::RBracket | Token::RBrace => {
            Err(SandboxError::Parse("unbalanced closing delimiter".to_owned()))
        }
        Token::Str(s) => Ok((
            Expr::Literal(Value::Str(s.clone())),
            pos.saturating_add(1),
        )),
        Token::Int(i) => Ok((Expr::Literal(Value::Int(*i)), pos.saturating_add(1))),
        Token::Float(f) => Ok((Expr::Literal(Value::Float(*f)), pos.saturating_add(1))),
        Token::Keyword(k) => Ok((
            Expr::Literal(Value::Keyword(k.clone())),
            pos.saturating_add(1),
        )),
        Token::Symbol(name) => {
            let expr = match name.as_str() {
                "nil" => Expr::Literal(Value::Nil),
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                _ => Expr::Symbol(name.clone()),
            };
            Ok((expr, pos.saturating_add(1)))
        }
    }
}

fn parse_seq(
    tokens: &[Token],
    mut pos: usize,
    close: &Token,
) -> Result<(Vec<Expr>, usize), SandboxError> {
    let mut items = Vec::new();
    loop {
        match tokens.get(pos) {
            Some(t) if t == close => return Ok((items, pos.saturating_add(1))),
            Some(_) => {
                let (expr, next) = parse_expr(tokens, pos)?;
                items.push(expr);
                pos = next;
            }
            None => {
                return Err(SandboxError::Parse(
                    "unterminated form; missing closing delimiter".to_owned(),
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Allow-list check
// ---------------------------------------------------------------------------

/// Special forms evaluated lazily by the interpreter.
pub const SPECIAL_FORMS: &[&str] = &["if", "do", "let", "def", "fn", "FINAL-VAR"];

/// Built-in operations available to snippets.
pub const BUILTINS: &[&str] = &[
    // arithmetic
    "+", "-", "*", "/", "mod",
    // comparison and logic
    "=", "not=", "<", ">", "<=", ">=", "not", "and", "or",
    // collections
    "count", "first", "rest", "nth", "get", "assoc", "conj", "keys", "vals", "range", "sort",
    "reverse", "distinct",
    // higher-order
    "map", "filter", "reduce",
    // strings
    "str", "upper-case", "lower-case", "trim", "split", "join", "replace", "includes?",
    "starts-with?", "ends-with?", "subs",
    // regex
    "re-find", "re-matches", "re-seq",
    // dates
    "date-parse", "date-add-days", "date-sub-days", "days-between", "date-format", "today",
    // sets
    "set", "union", "intersection", "difference", "subset?", "superset?", "contains?",
    // atoms
    "atom", "deref", "reset!", "swap!",
    // output
    "print", "println",
    // citations and termination
    "CITE", "CITE-UNVERIFIED", "FINAL",
];

/// Reject any call whose head symbol is not a special form, builtin, tool,
/// or locally bound name. This runs before evaluation so a disallowed
/// operation never executes, even behind an `if`.
///
/// # Errors
///
/// Returns [`SandboxError::Disallowed`] naming the first offending symbol.
pub fn check_allowed(forms: &[Expr], tool_names: &HashSet<String>) -> Result<(), SandboxError> {
    let mut bound: HashSet<String> = HashSet::new();
    for form in forms {
        check_expr(form, tool_names, &mut bound)?;
    }
    Ok(())
}

fn check_expr(
    expr: &Expr,
    tools: &HashSet<String>,
    bound: &mut HashSet<String>,
) -> Result<(), SandboxError> {
    match expr {
        Expr::Literal(_) | Expr::Symbol(_) => Ok(()),
        Expr::Vector(items) => {
            for item in items {
                check_expr(item, tools, bound)?;
            }
            Ok(())
        }
        Expr::MapLit(pairs) => {
            for (k, v) in pairs {
                check_expr(k, tools, bound)?;
                check_expr(v, tools, bound)?;
            }
            Ok(())
        }
        Expr::List(items) => check_call(items, tools, bound),
    }
}

fn check_call(
    items: &[Expr],
    tools: &HashSet<String>,
    bound: &mut HashSet<String>,
) -> Result<(), SandboxError> {
    let Some(head) = items.first() else {
        return Ok(()); // () evaluates to nil
    };

    match head {
        Expr::Symbol(name) => {
            let known = SPECIAL_FORMS.contains(&name.as_str())
                || BUILTINS.contains(&name.as_str())
                || tools.contains(name)
                || bound.contains(name);
            if !known {
                return Err(SandboxError::Disallowed(name.clone()));
            }

            match name.as_str() {
                "def" => {
                    // (def name expr): check the value first, then bind.
                    if let Some(Expr::Symbol(binding)) = items.get(1) {
                        for arg in items.iter().skip(2) {
                            check_expr(arg, tools, bound)?;
                        }
                        bound.insert(binding.clone());
                        return Ok(());
                    }
                }
                "let" => {
                    // (let [a 1 b 2] body...): bindings extend the scope.
                    if let Some(Expr::Vector(bindings)) = items.get(1) {
                        let mut scope = bound.clone();
                        let mut iter = bindings.iter();
                        while let (Some(name_expr), Some(value_expr)) = (iter.next(), iter.next()) {
                            check_expr(value_expr, tools, &mut scope)?;
                            if let Expr::Symbol(n) = name_expr {
                                scope.insert(n.clone());
                            }
                        }
                        for body in items.iter().skip(2) {
                            check_expr(body, tools, &mut scope)?;
                        }
                        return Ok(());
                    }
                }
                "fn" => {
                    // (fn [params...] body...): params extend the scope.
                    if let Some(Expr::Vector(params)) = items.get(1) {
                        let mut scope = bound.clone();
                        for p in params {
                            if let Expr::Symbol(n) = p {
                                scope.insert(n.clone());
                            }
                        }
                        for body in items.iter().skip(2) {
                            check_expr(body, tools, &mut scope)?;
                        }
                        return Ok(());
                    }
                }
                "FINAL-VAR" => return Ok(()), // takes a symbol, not a call
                _ => {}
            }

            for arg in items.iter().skip(1) {
                check_expr(arg, tools, bound)?;
            }
            Ok(())
        }
        // Calling a computed head, e.g. ((fn [x] x) 1).
        _ => {
            for item in items {
                check_expr(item, tools, bound)?;
            }
            Ok(())
        }
    }
}

/// Parse an ISO-8601 date used by the date builtins.
pub fn parse_iso_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

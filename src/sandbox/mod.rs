//! Safe evaluator for model-emitted code snippets.
//!
//! Each [`Sandbox`] belongs to one query (or one QA batch worker): it owns
//! the mutable locals and the claims accumulator, and shares the knowledge
//! store. Snippets are s-expressions checked against an operation
//! allow-list at parse time and interpreted with a step budget and an
//! optional wall deadline. Nothing escapes: parse errors, evaluation
//! errors and budget exhaustion all come back as data in the
//! [`SandboxOutcome`].
//!
//! Sub-queries (`rlm-query`) bridge back into the async engine through a
//! [`SubQueryRunner`]; the interpreter itself never blocks on anything
//! else.

pub mod expr;
pub mod tools;
pub mod value;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use tracing::debug;

use crate::types::Claim;

use self::expr::{check_allowed, parse_forms, parse_iso_date, Expr};
use self::tools::{error_value, SandboxStore};
use self::value::{Lambda, Value};

/// Evaluation step budget per snippet.
const MAX_STEPS: u64 = 500_000;
/// How often the wall deadline is polled, in steps.
const DEADLINE_POLL_STEPS: u64 = 1_024;
/// Collections larger than this are summarised by `list-locals`.
const LOCALS_SUMMARY_THRESHOLD: usize = 10;
/// Default confidence attached by `CITE` when none is given.
const DEFAULT_CITE_CONFIDENCE: f64 = 0.9;

// ---------------------------------------------------------------------------
// Errors and outcome
// ---------------------------------------------------------------------------

/// Errors raised inside the sandbox. They never propagate past
/// [`Sandbox::run`]; the outcome carries them as strings.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The snippet did not lex or parse.
    #[error("parse error: {0}")]
    Parse(String),
    /// An operation outside the allow-list was referenced.
    #[error("operation '{0}' is not allowed")]
    Disallowed(String),
    /// A runtime evaluation failure.
    #[error("eval error: {0}")]
    Eval(String),
    /// The step budget ran out.
    #[error("evaluation budget exceeded")]
    Budget,
    /// The wall deadline elapsed.
    #[error("evaluation timed out")]
    Timeout,
}

/// The result of running one snippet.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    /// Value of the last form, or `Nil` on error.
    pub result: Value,
    /// Captured `print`/`println` output.
    pub stdout: String,
    /// Error description, if evaluation failed.
    pub error: Option<String>,
    /// Whether failure was a deadline, not a fault.
    pub timed_out: bool,
    /// Set when a `FINAL` form executed.
    pub final_answer: Option<Value>,
}

/// Bridge for `rlm-query`: runs a sub-query against the engine.
#[async_trait]
pub trait SubQueryRunner: Send + Sync {
    /// Answer a sub-query, returning a JSON value.
    async fn run_sub_query(&self, query: String) -> serde_json::Value;
}

// ---------------------------------------------------------------------------
// Sandbox
// ---------------------------------------------------------------------------

/// Per-query evaluation environment.
///
/// Locals persist across [`Sandbox::run`] calls (code blocks within one
/// query build on each other); forking for a parallel worker means
/// constructing a fresh sandbox against the same store.
pub struct Sandbox {
    store: Arc<dyn SandboxStore>,
    query_id: String,
    locals: HashMap<String, Value>,
    claims: Vec<Claim>,
    depth: Arc<AtomicU32>,
    max_depth: u32,
    sub_query: Option<Arc<dyn SubQueryRunner>>,
    runtime: Option<tokio::runtime::Handle>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("query_id", &self.query_id)
            .field("locals", &self.locals.len())
            .field("claims", &self.claims.len())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create a sandbox bound to a store and a query id.
    pub fn new(store: Arc<dyn SandboxStore>, query_id: impl Into<String>) -> Self {
        Self {
            store,
            query_id: query_id.into(),
            locals: HashMap::new(),
            claims: Vec::new(),
            depth: Arc::new(AtomicU32::new(0)),
            max_depth: 3,
            sub_query: None,
            runtime: None,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Attach the sub-query bridge and the shared recursion depth counter.
    ///
    /// `runtime` must be a handle the interpreter may block on — callers
    /// run snippets on blocking threads (`spawn_blocking`), never directly
    /// on an async worker.
    pub fn with_sub_query(
        mut self,
        runner: Arc<dyn SubQueryRunner>,
        depth: Arc<AtomicU32>,
        max_depth: u32,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        self.sub_query = Some(runner);
        self.depth = depth;
        self.max_depth = max_depth;
        self.runtime = Some(runtime);
        self
    }

    /// Override the per-snippet wall deadline (`None` disables it).
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Claims accumulated by `CITE` forms so far.
    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }

    /// Take the accumulated claims, leaving the accumulator empty.
    pub fn take_claims(&mut self) -> Vec<Claim> {
        std::mem::take(&mut self.claims)
    }

    /// Evaluate one snippet. Never panics, never raises: every failure
    /// mode is data on the returned outcome.
    pub fn run(&mut self, source: &str) -> SandboxOutcome {
        let deadline = self.timeout.and_then(|t| Instant::now().checked_add(t));

        let forms = match parse_forms(source).and_then(|forms| {
            check_allowed(&forms, tools::tool_names())?;
            Ok(forms)
        }) {
            Ok(forms) => forms,
            Err(e) => {
                return SandboxOutcome {
                    result: Value::Nil,
                    stdout: String::new(),
                    error: Some(e.to_string()),
                    timed_out: false,
                    final_answer: None,
                }
            }
        };

        let Self {
            store,
            query_id,
            locals,
            claims,
            depth,
            max_depth,
            sub_query,
            runtime,
            ..
        } = self;

        let mut interp = Interp {
            store: store.as_ref(),
            query_id,
            locals,
            claims,
            depth,
            max_depth: *max_depth,
            sub_query: sub_query.as_ref(),
            runtime: runtime.as_ref(),
            scopes: Vec::new(),
            stdout: String::new(),
            final_answer: None,
            steps: 0,
            deadline,
        };

        let mut result = Value::Nil;
        let mut error = None;
        let mut timed_out = false;
        for form in &forms {
            match interp.eval(form) {
                Ok(v) => result = v,
                Err(e) => {
                    timed_out = matches!(e, SandboxError::Timeout);
                    error = Some(e.to_string());
                    result = Value::Nil;
                    break;
                }
            }
            if interp.final_answer.is_some() {
                break;
            }
        }

        let stdout = std::mem::take(&mut interp.stdout);
        let final_answer = interp.final_answer.take();
        drop(interp);

        debug!(
            query_id = %self.query_id,
            error = error.is_some(),
            has_final = final_answer.is_some(),
            "snippet evaluated"
        );

        SandboxOutcome {
            result,
            stdout,
            error,
            timed_out,
            final_answer,
        }
    }
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

struct Interp<'a> {
    store: &'a dyn SandboxStore,
    query_id: &'a str,
    locals: &'a mut HashMap<String, Value>,
    claims: &'a mut Vec<Claim>,
    depth: &'a Arc<AtomicU32>,
    max_depth: u32,
    sub_query: Option<&'a Arc<dyn SubQueryRunner>>,
    runtime: Option<&'a tokio::runtime::Handle>,
    scopes: Vec<HashMap<String, Value>>,
    stdout: String,
    final_answer: Option<Value>,
    steps: u64,
    deadline: Option<Instant>,
}

impl Interp<'_> {
    fn tick(&mut self) -> Result<(), SandboxError> {
        self.steps = self.steps.saturating_add(1);
        if self.steps > MAX_STEPS {
            return Err(SandboxError::Budget);
        }
        if self.steps.checked_rem(DEADLINE_POLL_STEPS) == Some(0) {
            if let Some(deadline) = self.deadline {
                if Instant::now() > deadline {
                    return Err(SandboxError::Timeout);
                }
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        for scope in self.scopes.iter().rev() {
            if let Some(v) = scope.get(name) {
                return Some(v.clone());
            }
        }
        self.locals.get(name).cloned()
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, SandboxError> {
        self.tick()?;
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Symbol(name) => self
                .lookup(name)
                .ok_or_else(|| SandboxError::Eval(format!("unresolved symbol {name}"))),
            Expr::Vector(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval(item)?);
                }
                Ok(Value::List(out))
            }
            Expr::MapLit(pairs) => {
                let mut map = BTreeMap::new();
                for (k, v) in pairs {
                    let key = match self.eval(k)? {
                        Value::Str(s) => s,
                        Value::Keyword(s) => s,
                        other => {
                            return Err(SandboxError::Eval(format!(
                                "map keys must be strings or keywords, got {}",
                                other.type_name()
                            )))
                        }
                    };
                    map.insert(key, self.eval(v)?);
                }
                Ok(Value::Map(map))
            }
            Expr::List(items) => self.eval_call(items),
        }
    }

    fn eval_call(&mut self, items: &[Expr]) -> Result<Value, SandboxError> {
        let Some(head) = items.first() else {
            return Ok(Value::Nil);
        };

        if let Expr::Symbol(name) = head {
            match name.as_str() {
                "if" => return self.special_if(items),
                "do" => return self.special_do(items),
                "let" => return self.special_let(items),
                "def" => return self.special_def(items),
                "fn" => return self.special_fn(items),
                "FINAL-VAR" => return self.special_final_var(items),
                _ => {}
            }

            // Locally bound lambdas shadow tools and builtins.
            if let Some(value) = self.lookup(name) {
                let args = self.eval_args(&items[1..])?;
                return self.apply_function(&value, args);
            }

            let args = self.eval_args(&items[1..])?;
            if tools::STORE_TOOLS.contains(&name.as_str()) {
                return tools::dispatch(self.store, name, &args);
            }
            return match name.as_str() {
                "list-locals" => Ok(self.tool_list_locals()),
                "get-local" => Ok(self.tool_get_local(&args)),
                "rlm-query" => self.tool_rlm_query(&args),
                _ => self.apply_builtin(name, args),
            };
        }

        // Computed head, e.g. ((fn [x] (* x x)) 3).
        let func = self.eval(head)?;
        let args = self.eval_args(&items[1..])?;
        self.apply_function(&func, args)
    }

    fn eval_args(&mut self, exprs: &[Expr]) -> Result<Vec<Value>, SandboxError> {
        let mut args = Vec::with_capacity(exprs.len());
        for expr in exprs {
            args.push(self.eval(expr)?);
        }
        Ok(args)
    }

    // -- special forms -------------------------------------------------------

    fn special_if(&mut self, items: &[Expr]) -> Result<Value, SandboxError> {
        let cond = items
            .get(1)
            .ok_or_else(|| SandboxError::Eval("if needs a condition".to_owned()))?;
        if self.eval(cond)?.is_truthy() {
            items.get(2).map_or(Ok(Value::Nil), |e| self.eval(e))
        } else {
            items.get(3).map_or(Ok(Value::Nil), |e| self.eval(e))
        }
    }

    fn special_do(&mut self, items: &[Expr]) -> Result<Value, SandboxError> {
        let mut result = Value::Nil;
        for expr in &items[1..] {
            result = self.eval(expr)?;
            if self.final_answer.is_some() {
                break;
            }
        }
        Ok(result)
    }

    fn special_let(&mut self, items: &[Expr]) -> Result<Value, SandboxError> {
        let Some(Expr::Vector(bindings)) = items.get(1) else {
            return Err(SandboxError::Eval(
                "let needs a binding vector: (let [name value ...] body)".to_owned(),
            ));
        };
        if bindings.len() % 2 != 0 {
            return Err(SandboxError::Eval(
                "let bindings need an even number of forms".to_owned(),
            ));
        }

        self.scopes.push(HashMap::new());
        let result = (|| {
            let mut iter = bindings.iter();
            while let (Some(name_expr), Some(value_expr)) = (iter.next(), iter.next()) {
                let Expr::Symbol(name) = name_expr else {
                    return Err(SandboxError::Eval(
                        "let binding names must be symbols".to_owned(),
                    ));
                };
                let value = self.eval(value_expr)?;
                if let Some(scope) = self.scopes.last_mut() {
                    scope.insert(name.clone(), value);
                }
            }
            let mut result = Value::Nil;
            for body in &items[2..] {
                result = self.eval(body)?;
            }
            Ok(result)
        })();
        self.scopes.pop();
        result
    }

    fn special_def(&mut self, items: &[Expr]) -> Result<Value, SandboxError> {
        let Some(Expr::Symbol(name)) = items.get(1) else {
            return Err(SandboxError::Eval("def needs a symbol name".to_owned()));
        };
        let value = items
            .get(2)
            .map_or(Ok(Value::Nil), |expr| self.eval(expr))?;
        self.locals.insert(name.clone(), value.clone());
        Ok(value)
    }

    fn special_fn(&mut self, items: &[Expr]) -> Result<Value, SandboxError> {
        let Some(Expr::Vector(param_exprs)) = items.get(1) else {
            return Err(SandboxError::Eval(
                "fn needs a parameter vector: (fn [x y] body)".to_owned(),
            ));
        };
        let mut params = Vec::with_capacity(param_exprs.len());
        for p in param_exprs {
            let Expr::Symbol(name) = p else {
                return Err(SandboxError::Eval("fn parameters must be symbols".to_owned()));
            };
            params.push(name.clone());
        }
        Ok(Value::Lambda(Arc::new(Lambda {
            params,
            body: items[2..].to_vec(),
        })))
    }

    fn special_final_var(&mut self, items: &[Expr]) -> Result<Value, SandboxError> {
        let Some(Expr::Symbol(name)) = items.get(1) else {
            return Err(SandboxError::Eval("FINAL-VAR needs a symbol".to_owned()));
        };
        let value = self
            .lookup(name)
            .ok_or_else(|| SandboxError::Eval(format!("unresolved symbol {name}")))?;
        Ok(self.make_final(value))
    }

    fn make_final(&mut self, value: Value) -> Value {
        self.final_answer = Some(value.clone());
        let mut map = BTreeMap::new();
        map.insert("final".to_owned(), Value::Bool(true));
        map.insert("answer".to_owned(), value);
        Value::Map(map)
    }

    // -- function application ------------------------------------------------

    fn apply_function(&mut self, func: &Value, args: Vec<Value>) -> Result<Value, SandboxError> {
        self.tick()?;
        match func {
            Value::Lambda(lambda) => {
                if lambda.params.len() != args.len() {
                    return Err(SandboxError::Eval(format!(
                        "fn expects {} arguments, got {}",
                        lambda.params.len(),
                        args.len()
                    )));
                }
                let scope: HashMap<String, Value> = lambda
                    .params
                    .iter()
                    .cloned()
                    .zip(args)
                    .collect();
                self.scopes.push(scope);
                let mut result = Value::Nil;
                let body_result = (|| {
                    for expr in &lambda.body {
                        result = self.eval(expr)?;
                    }
                    Ok(result)
                })();
                self.scopes.pop();
                body_result
            }
            // Keywords act as map accessors: (:name entity).
            Value::Keyword(key) => match args.first() {
                Some(Value::Map(map)) => Ok(map.get(key).cloned().unwrap_or(Value::Nil)),
                _ => Ok(Value::Nil),
            },
            other => Err(SandboxError::Eval(format!(
                "cannot call a {}",
                other.type_name()
            ))),
        }
    }

    // -- interpreter-local tools ---------------------------------------------

    fn tool_list_locals(&self) -> Value {
        let mut out = BTreeMap::new();
        for (name, value) in self.locals.iter() {
            out.insert(name.clone(), summarise(value));
        }
        Value::Map(out)
    }

    fn tool_get_local(&self, args: &[Value]) -> Value {
        match args.first() {
            Some(Value::Str(name)) => self.locals.get(name).cloned().unwrap_or(Value::Nil),
            Some(Value::Keyword(name)) => self.locals.get(name).cloned().unwrap_or(Value::Nil),
            _ => Value::Nil,
        }
    }

    fn tool_rlm_query(&mut self, args: &[Value]) -> Result<Value, SandboxError> {
        let Some(Value::Str(query)) = args.first() else {
            return Err(SandboxError::Eval(
                "rlm-query expects a query string".to_owned(),
            ));
        };

        // Depth guard comes first: at the cap we answer without any model
        // involvement at all.
        if self.depth.load(Ordering::SeqCst) >= self.max_depth {
            return Ok(error_value("max recursion depth"));
        }
        let (Some(runner), Some(handle)) = (self.sub_query, self.runtime) else {
            return Ok(error_value("sub-query unavailable in this context"));
        };

        self.depth.fetch_add(1, Ordering::SeqCst);
        let result = handle.block_on(runner.run_sub_query(query.clone()));
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Ok(Value::from_json(&result))
    }

    // -- builtins ------------------------------------------------------------

    #[allow(clippy::too_many_lines)]
    fn apply_builtin(&mut self, name: &str, args: Vec<Value>) -> Result<Value, SandboxError> {
        match name {
            "+" => fold_numeric(name, &args, NumFold::Int(0), |a, b| a.checked_add(b), |a, b| a + b),
            "*" => fold_numeric(name, &args, NumFold::Int(1), |a, b| a.checked_mul(b), |a, b| a * b),
            "-" => numeric_sub(&args),
            "/" => numeric_div(&args),
            "mod" => numeric_mod(&args),
            "=" => Ok(Value::Bool(chain_equal(&args))),
            "not=" => Ok(Value::Bool(!chain_equal(&args))),
            "<" => chain_compare(&args, |o| o == std::cmp::Ordering::Less),
            ">" => chain_compare(&args, |o| o == std::cmp::Ordering::Greater),
            "<=" => chain_compare(&args, |o| o != std::cmp::Ordering::Greater),
            ">=" => chain_compare(&args, |o| o != std::cmp::Ordering::Less),
            "not" => Ok(Value::Bool(!args.first().is_some_and(Value::is_truthy))),
            "and" => Ok(args
                .iter()
                .find(|v| !v.is_truthy())
                .cloned()
                .unwrap_or_else(|| args.last().cloned().unwrap_or(Value::Bool(true)))),
            "or" => Ok(args
                .iter()
                .find(|v| v.is_truthy())
                .cloned()
                .unwrap_or_else(|| args.last().cloned().unwrap_or(Value::Nil))),
            "count" => builtin_count(&args),
            "first" => Ok(as_items(&args, 0)?.first().cloned().unwrap_or(Value::Nil)),
            "rest" => Ok(Value::List(
                as_items(&args, 0)?.iter().skip(1).cloned().collect(),
            )),
            "nth" => builtin_nth(&args),
            "get" => builtin_get(&args),
            "assoc" => builtin_assoc(&args),
            "conj" => builtin_conj(&args),
            "keys" => builtin_keys(&args),
            "vals" => builtin_vals(&args),
            "range" => builtin_range(&args),
            "sort" => {
                let mut items = as_items(&args, 0)?;
                items.sort();
                Ok(Value::List(items))
            }
            "reverse" => {
                let mut items = as_items(&args, 0)?;
                items.reverse();
                Ok(Value::List(items))
            }
            "distinct" => {
                let items = as_items(&args, 0)?;
                let mut seen = BTreeSet::new();
                let mut out = Vec::new();
                for item in items {
                    if seen.insert(item.clone()) {
                        out.push(item);
                    }
                }
                Ok(Value::List(out))
            }
            "map" => self.builtin_map(&args),
            "filter" => self.builtin_filter(&args),
            "reduce" => self.builtin_reduce(&args),
            "str" => Ok(Value::Str(
                args.iter().map(Value::render_raw).collect::<String>(),
            )),
            "upper-case" => string_op(&args, |s| s.to_uppercase()),
            "lower-case" => string_op(&args, |s| s.to_lowercase()),
            "trim" => string_op(&args, |s| s.trim().to_owned()),
            "split" => builtin_split(&args),
            "join" => builtin_join(&args),
            "replace" => builtin_replace(&args),
            "includes?" => two_strings(&args, |s, sub| Value::Bool(s.contains(sub))),
            "starts-with?" => two_strings(&args, |s, sub| Value::Bool(s.starts_with(sub))),
            "ends-with?" => two_strings(&args, |s, sub| Value::Bool(s.ends_with(sub))),
            "subs" => builtin_subs(&args),
            "re-find" => builtin_regex(&args, RegexMode::Find),
            "re-matches" => builtin_regex(&args, RegexMode::Matches),
            "re-seq" => builtin_regex(&args, RegexMode::Seq),
            "date-parse" => Ok(match args.first() {
                Some(Value::Str(s)) => parse_iso_date(s).map_or(Value::Nil, Value::Date),
                _ => Value::Nil,
            }),
            "date-add-days" => date_shift(&args, 1),
            "date-sub-days" => date_shift(&args, -1),
            "days-between" => builtin_days_between(&args),
            "date-format" => builtin_date_format(&args),
            "today" => Ok(Value::Date(chrono::Utc::now().date_naive())),
            "set" => Ok(Value::Set(as_items(&args, 0)?.into_iter().collect())),
            "union" => set_fold(&args, |a, b| a.union(b).cloned().collect()),
            "intersection" => set_fold(&args, |a, b| a.intersection(b).cloned().collect()),
            "difference" => set_fold(&args, |a, b| a.difference(b).cloned().collect()),
            "subset?" => two_sets(&args, |a, b| a.is_subset(b)),
            "superset?" => two_sets(&args, |a, b| a.is_superset(b)),
            "contains?" => builtin_contains(&args),
            "atom" => Ok(Value::Cell(Arc::new(Mutex::new(
                args.first().cloned().unwrap_or(Value::Nil),
            )))),
            "deref" => match args.first() {
                Some(Value::Cell(cell)) => Ok(cell
                    .lock()
                    .map(|v| v.clone())
                    .unwrap_or(Value::Nil)),
                _ => Err(SandboxError::Eval("deref expects an atom".to_owned())),
            },
            "reset!" => match args.first() {
                Some(Value::Cell(cell)) => {
                    let new = args.get(1).cloned().unwrap_or(Value::Nil);
                    if let Ok(mut slot) = cell.lock() {
                        *slot = new.clone();
                    }
                    Ok(new)
                }
                _ => Err(SandboxError::Eval("reset! expects an atom".to_owned())),
            },
            "swap!" => self.builtin_swap(&args),
            "print" => {
                self.write_stdout(&args, false);
                Ok(Value::Nil)
            }
            "println" => {
                self.write_stdout(&args, true);
                Ok(Value::Nil)
            }
            "CITE" => self.builtin_cite(&args),
            "CITE-UNVERIFIED" => {
                let Some(Value::Str(text)) = args.first() else {
                    return Err(SandboxError::Eval(
                        "CITE-UNVERIFIED expects a text string".to_owned(),
                    ));
                };
                self.claims
                    .push(Claim::unverified(text.clone(), self.query_id.to_owned()));
                let mut map = BTreeMap::new();
                map.insert("cited".to_owned(), Value::Str(text.clone()));
                map.insert("verified".to_owned(), Value::Bool(false));
                Ok(Value::Map(map))
            }
            "FINAL" => {
                let value = args.first().cloned().unwrap_or(Value::Nil);
                Ok(self.make_final(value))
            }
            other => Err(SandboxError::Eval(format!("unknown operation {other}"))),
        }
    }

    fn builtin_map(&mut self, args: &[Value]) -> Result<Value, SandboxError> {
        let func = args
            .first()
            .ok_or_else(|| SandboxError::Eval("map needs a function".to_owned()))?
            .clone();
        let items = as_items(args, 1)?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(self.apply_function(&func, vec![item])?);
        }
        Ok(Value::List(out))
    }

    fn builtin_filter(&mut self, args: &[Value]) -> Result<Value, SandboxError> {
        let func = args
            .first()
            .ok_or_else(|| SandboxError::Eval("filter needs a function".to_owned()))?
            .clone();
        let items = as_items(args, 1)?;
        let mut out = Vec::new();
        for item in items {
            if self.apply_function(&func, vec![item.clone()])?.is_truthy() {
                out.push(item);
            }
        }
        Ok(Value::List(out))
    }

    fn builtin_reduce(&mut self, args: &[Value]) -> Result<Value, SandboxError> {
        let func = args
            .first()
            .ok_or_else(|| SandboxError::Eval("reduce needs a function".to_owned()))?
            .clone();
        let (mut acc, items) = if args.len() >= 3 {
            (args[1].clone(), as_items(args, 2)?)
        } else {
            let items = as_items(args, 1)?;
            let mut iter = items.into_iter();
            let first = iter
                .next()
                .ok_or_else(|| SandboxError::Eval("reduce of empty collection".to_owned()))?;
            (first, iter.collect())
        };
        for item in items {
            acc = self.apply_function(&func, vec![acc, item])?;
        }
        Ok(acc)
    }

    fn builtin_swap(&mut self, args: &[Value]) -> Result<Value, SandboxError> {
        let Some(Value::Cell(cell)) = args.first() else {
            return Err(SandboxError::Eval("swap! expects an atom".to_owned()));
        };
        let func = args
            .get(1)
            .ok_or_else(|| SandboxError::Eval("swap! needs a function".to_owned()))?
            .clone();
        let current = cell.lock().map(|v| v.clone()).unwrap_or(Value::Nil);
        let mut call_args = vec![current];
        call_args.extend(args.iter().skip(2).cloned());
        let next = self.apply_function(&func, call_args)?;
        if let Ok(mut slot) = cell.lock() {
            *slot = next.clone();
        }
        Ok(next)
    }

    fn builtin_cite(&mut self, args: &[Value]) -> Result<Value, SandboxError> {
        let text = cite_str(args, 0, "text")?;
        let document = cite_str(args, 1, "document-id")?;
        let page = match args.get(2) {
            Some(Value::Int(i)) if *i >= 0 => u32::try_from(*i).unwrap_or(0),
            _ => {
                return Err(SandboxError::Eval(
                    "CITE: page must be a non-negative integer".to_owned(),
                ))
            }
        };
        let section = cite_str(args, 3, "section")?;
        let quote = cite_str(args, 4, "quote")?;
        let confidence = match args.get(5) {
            Some(v) => v.as_f64().ok_or_else(|| {
                SandboxError::Eval("CITE: confidence must be a number".to_owned())
            })?,
            None => DEFAULT_CITE_CONFIDENCE,
        };

        let claim = Claim::cited(
            text.clone(),
            document,
            page,
            section,
            quote,
            confidence,
            self.query_id.to_owned(),
        );
        self.claims.push(claim);

        let mut map = BTreeMap::new();
        map.insert("cited".to_owned(), Value::Str(text));
        map.insert("verified".to_owned(), Value::Bool(true));
        Ok(Value::Map(map))
    }

    fn write_stdout(&mut self, args: &[Value], newline: bool) {
        let line: Vec<String> = args.iter().map(Value::render_raw).collect();
        self.stdout.push_str(&line.join(" "));
        if newline {
            self.stdout.push('\n');
        }
    }
}

// ---------------------------------------------------------------------------
// Builtin helpers (free functions; no interpreter state)
// ---------------------------------------------------------------------------

fn summarise(value: &Value) -> Value {
    let (len, preview): (usize, Vec<Value>) = match value {
        Value::List(items) => (items.len(), items.iter().take(3).cloned().collect()),
        Value::Set(items) => (items.len(), items.iter().take(3).cloned().collect()),
        Value::Map(map) => (map.len(), Vec::new()),
        _ => return value.clone(),
    };
    if len <= LOCALS_SUMMARY_THRESHOLD {
        return value.clone();
    }
    let mut summary = BTreeMap::new();
    summary.insert("type".to_owned(), Value::Str(value.type_name().to_owned()));
    summary.insert("count".to_owned(), Value::Int(i64::try_from(len).unwrap_or(i64::MAX)));
    if !preview.is_empty() {
        summary.insert("preview".to_owned(), Value::List(preview));
    }
    Value::Map(summary)
}

fn cite_str(args: &[Value], index: usize, field: &str) -> Result<String, SandboxError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.clone()),
        _ => Err(SandboxError::Eval(format!(
            "CITE: {field} must be a string"
        ))),
    }
}

enum NumFold {
    Int(i64),
    Float(f64),
}

fn fold_numeric(
    name: &str,
    args: &[Value],
    init: NumFold,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, SandboxError> {
    let mut acc = init;
    for arg in args {
        acc = match (acc, arg) {
            (NumFold::Int(a), Value::Int(b)) => NumFold::Int(
                int_op(a, *b)
                    .ok_or_else(|| SandboxError::Eval(format!("{name}: integer overflow")))?,
            ),
            (acc, value) => {
                let a = match acc {
                    #[allow(clippy::cast_precision_loss)]
                    NumFold::Int(i) => i as f64,
                    NumFold::Float(f) => f,
                };
                let b = value.as_f64().ok_or_else(|| {
                    SandboxError::Eval(format!("{name}: expected a number, got {}", value.type_name()))
                })?;
                NumFold::Float(float_op(a, b))
            }
        };
    }
    Ok(match acc {
        NumFold::Int(i) => Value::Int(i),
        NumFold::Float(f) => Value::Float(f),
    })
}

fn numeric_sub(args: &[Value]) -> Result<Value, SandboxError> {
    match args {
        [] => Err(SandboxError::Eval("- needs at least one argument".to_owned())),
        [Value::Int(i)] => i
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| SandboxError::Eval("-: integer overflow".to_owned())),
        [single] => single
            .as_f64()
            .map(|f| Value::Float(-f))
            .ok_or_else(|| SandboxError::Eval("-: expected a number".to_owned())),
        [first, rest @ ..] => {
            let init = match first {
                Value::Int(i) => NumFold::Int(*i),
                other => NumFold::Float(other.as_f64().ok_or_else(|| {
                    SandboxError::Eval("-: expected a number".to_owned())
                })?),
            };
            fold_numeric("-", rest, init, |a, b| a.checked_sub(b), |a, b| a - b)
        }
    }
}

fn numeric_div(args: &[Value]) -> Result<Value, SandboxError> {
    let [a, b] = args else {
        return Err(SandboxError::Eval("/ expects two arguments".to_owned()));
    };
    match (a, b) {
        (Value::Int(_), Value::Int(0)) => Err(SandboxError::Eval("division by zero".to_owned())),
        (Value::Int(x), Value::Int(y)) if x.checked_rem(*y) == Some(0) => x
            .checked_div(*y)
            .map(Value::Int)
            .ok_or_else(|| SandboxError::Eval("/: integer overflow".to_owned())),
        _ => {
            let x = a
                .as_f64()
                .ok_or_else(|| SandboxError::Eval("/: expected numbers".to_owned()))?;
            let y = b
                .as_f64()
                .ok_or_else(|| SandboxError::Eval("/: expected numbers".to_owned()))?;
            if y == 0.0 {
                return Err(SandboxError::Eval("division by zero".to_owned()));
            }
            Ok(Value::Float(x / y))
        }
    }
}

fn numeric_mod(args: &[Value]) -> Result<Value, SandboxError> {
    let [Value::Int(a), Value::Int(b)] = args else {
        return Err(SandboxError::Eval("mod expects two integers".to_owned()));
    };
    a.checked_rem_euclid(*b)
        .map(Value::Int)
        .ok_or_else(|| SandboxError::Eval("division by zero".to_owned()))
}

fn chain_equal(args: &[Value]) -> bool {
    args.windows(2).all(|pair| values_equal(&pair[0], &pair[1]))
}

/// Equality with cross-type numeric comparison (`(= 1 1.0)` is true).
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn chain_compare(
    args: &[Value],
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value, SandboxError> {
    for pair in args.windows(2) {
        let ordering = match (pair[0].as_f64(), pair[1].as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => match (&pair[0], &pair[1]) {
                (Value::Str(x), Value::Str(y)) => x.cmp(y),
                (Value::Date(x), Value::Date(y)) => x.cmp(y),
                _ => {
                    return Err(SandboxError::Eval(
                        "comparison needs numbers, strings or dates".to_owned(),
                    ))
                }
            },
        };
        if !accept(ordering) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn as_items(args: &[Value], index: usize) -> Result<Vec<Value>, SandboxError> {
    match args.get(index) {
        Some(Value::List(items)) => Ok(items.clone()),
        Some(Value::Set(items)) => Ok(items.iter().cloned().collect()),
        Some(Value::Nil) | None => Ok(Vec::new()),
        Some(Value::Str(s)) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Some(other) => Err(SandboxError::Eval(format!(
            "expected a collection, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_count(args: &[Value]) -> Result<Value, SandboxError> {
    let len = match args.first() {
        Some(Value::List(items)) => items.len(),
        Some(Value::Set(items)) => items.len(),
        Some(Value::Map(map)) => map.len(),
        Some(Value::Str(s)) => s.chars().count(),
        Some(Value::Nil) | None => 0,
        Some(other) => {
            return Err(SandboxError::Eval(format!(
                "count: expected a collection, got {}",
                other.type_name()
            )))
        }
    };
    Ok(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
}

fn builtin_nth(args: &[Value]) -> Result<Value, SandboxError> {
    let items = as_items(args, 0)?;
    let Some(Value::Int(index)) = args.get(1) else {
        return Err(SandboxError::Eval("nth expects an integer index".to_owned()));
    };
    usize::try_from(*index)
        .ok()
        .and_then(|i| items.get(i).cloned())
        .map_or_else(
            || Err(SandboxError::Eval(format!("nth: index {index} out of bounds"))),
            Ok,
        )
}

fn builtin_get(args: &[Value]) -> Result<Value, SandboxError> {
    let default = args.get(2).cloned().unwrap_or(Value::Nil);
    let result = match (args.first(), args.get(1)) {
        (Some(Value::Map(map)), Some(Value::Str(k))) => map.get(k).cloned(),
        (Some(Value::Map(map)), Some(Value::Keyword(k))) => map.get(k).cloned(),
        (Some(Value::List(items)), Some(Value::Int(i))) => {
            usize::try_from(*i).ok().and_then(|i| items.get(i).cloned())
        }
        _ => None,
    };
    Ok(result.unwrap_or(default))
}

fn builtin_assoc(args: &[Value]) -> Result<Value, SandboxError> {
    let Some(Value::Map(map)) = args.first() else {
        return Err(SandboxError::Eval("assoc expects a map".to_owned()));
    };
    let key = match args.get(1) {
        Some(Value::Str(s)) => s.clone(),
        Some(Value::Keyword(k)) => k.clone(),
        _ => return Err(SandboxError::Eval("assoc key must be a string or keyword".to_owned())),
    };
    let value = args.get(2).cloned().unwrap_or(Value::Nil);
    let mut next = map.clone();
    next.insert(key, value);
    Ok(Value::Map(next))
}

fn builtin_conj(args: &[Value]) -> Result<Value, SandboxError> {
    match args.first() {
        Some(Value::List(items)) => {
            let mut next = items.clone();
            next.extend(args.iter().skip(1).cloned());
            Ok(Value::List(next))
        }
        Some(Value::Set(items)) => {
            let mut next = items.clone();
            for item in args.iter().skip(1) {
                next.insert(item.clone());
            }
            Ok(Value::Set(next))
        }
        Some(Value::Nil) | None => Ok(Value::List(args.iter().skip(1).cloned().collect())),
        Some(other) => Err(SandboxError::Eval(format!(
            "conj: expected a collection, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_keys(args: &[Value]) -> Result<Value, SandboxError> {
    let Some(Value::Map(map)) = args.first() else {
        return Err(SandboxError::Eval("keys expects a map".to_owned()));
    };
    Ok(Value::List(
        map.keys().map(|k| Value::Keyword(k.clone())).collect(),
    ))
}

fn builtin_vals(args: &[Value]) -> Result<Value, SandboxError> {
    let Some(Value::Map(map)) = args.first() else {
        return Err(SandboxError::Eval("vals expects a map".to_owned()));
    };
    Ok(Value::List(map.values().cloned().collect()))
}

fn builtin_range(args: &[Value]) -> Result<Value, SandboxError> {
    let (start, end) = match args {
        [Value::Int(end)] => (0, *end),
        [Value::Int(start), Value::Int(end)] => (*start, *end),
        _ => return Err(SandboxError::Eval("range expects integer bounds".to_owned())),
    };
    if end.saturating_sub(start) > 100_000 {
        return Err(SandboxError::Eval("range too large".to_owned()));
    }
    Ok(Value::List((start..end).map(Value::Int).collect()))
}

fn string_op(args: &[Value], op: impl Fn(&str) -> String) -> Result<Value, SandboxError> {
    match args.first() {
        Some(Value::Str(s)) => Ok(Value::Str(op(s))),
        _ => Err(SandboxError::Eval("expected a string".to_owned())),
    }
}

fn two_strings(
    args: &[Value],
    op: impl Fn(&str, &str) -> Value,
) -> Result<Value, SandboxError> {
    match (args.first(), args.get(1)) {
        (Some(Value::Str(a)), Some(Value::Str(b))) => Ok(op(a, b)),
        _ => Err(SandboxError::Eval("expected two strings".to_owned())),
    }
}

fn builtin_split(args: &[Value]) -> Result<Value, SandboxError> {
    two_strings(args, |s, sep| {
        Value::List(s.split(sep).map(|p| Value::Str(p.to_owned())).collect())
    })
}

fn builtin_join(args: &[Value]) -> Result<Value, SandboxError> {
    let Some(Value::Str(sep)) = args.first() else {
        return Err(SandboxError::Eval("join expects a separator string".to_owned()));
    };
    let items = as_items(args, 1)?;
    let parts: Vec<String> = items.iter().map(Value::render_raw).collect();
    Ok(Value::Str(parts.join(sep)))
}

fn builtin_replace(args: &[Value]) -> Result<Value, SandboxError> {
    match (args.first(), args.get(1), args.get(2)) {
        (Some(Value::Str(s)), Some(Value::Str(from)), Some(Value::Str(to))) => {
            Ok(Value::Str(s.replace(from.as_str(), to)))
        }
        _ => Err(SandboxError::Eval("replace expects three strings".to_owned())),
    }
}

fn builtin_subs(args: &[Value]) -> Result<Value, SandboxError> {
    let Some(Value::Str(s)) = args.first() else {
        return Err(SandboxError::Eval("subs expects a string".to_owned()));
    };
    let chars: Vec<char> = s.chars().collect();
    let start = match args.get(1) {
        Some(Value::Int(i)) if *i >= 0 => usize::try_from(*i).unwrap_or(0),
        _ => return Err(SandboxError::Eval("subs expects a start index".to_owned())),
    };
    let end = match args.get(2) {
        Some(Value::Int(i)) if *i >= 0 => usize::try_from(*i).unwrap_or(chars.len()),
        _ => chars.len(),
    };
    let start = start.min(chars.len());
    let end = end.clamp(start, chars.len());
    Ok(Value::Str(chars[start..end].iter().collect()))
}

enum RegexMode {
    Find,
    Matches,
    Seq,
}

fn builtin_regex(args: &[Value], mode: RegexMode) -> Result<Value, SandboxError> {
    let (Some(Value::Str(pattern)), Some(Value::Str(text))) = (args.first(), args.get(1)) else {
        return Err(SandboxError::Eval(
            "regex operations expect (op pattern text)".to_owned(),
        ));
    };
    let regex =
        Regex::new(pattern).map_err(|e| SandboxError::Eval(format!("bad regex: {e}")))?;
    Ok(match mode {
        RegexMode::Find => regex
            .find(text)
            .map_or(Value::Nil, |m| Value::Str(m.as_str().to_owned())),
        RegexMode::Matches => {
            match regex.find(text) {
                Some(m) if m.start() == 0 && m.end() == text.len() => {
                    Value::Str(m.as_str().to_owned())
                }
                _ => Value::Nil,
            }
        }
        RegexMode::Seq => Value::List(
            regex
                .find_iter(text)
                .map(|m| Value::Str(m.as_str().to_owned()))
                .collect(),
        ),
    })
}

fn coerce_date(value: Option<&Value>) -> Option<NaiveDate> {
    match value {
        Some(Value::Date(d)) => Some(*d),
        Some(Value::Str(s)) => parse_iso_date(s),
        _ => None,
    }
}

fn date_shift(args: &[Value], sign: i64) -> Result<Value, SandboxError> {
    let date = coerce_date(args.first())
        .ok_or_else(|| SandboxError::Eval("expected a date".to_owned()))?;
    let Some(Value::Int(days)) = args.get(1) else {
        return Err(SandboxError::Eval("expected a day count".to_owned()));
    };
    let delta = days.saturating_mul(sign);
    date.checked_add_signed(chrono::Duration::days(delta))
        .map(Value::Date)
        .ok_or_else(|| SandboxError::Eval("date out of range".to_owned()))
}

fn builtin_days_between(args: &[Value]) -> Result<Value, SandboxError> {
    let a = coerce_date(args.first())
        .ok_or_else(|| SandboxError::Eval("days-between expects two dates".to_owned()))?;
    let b = coerce_date(args.get(1))
        .ok_or_else(|| SandboxError::Eval("days-between expects two dates".to_owned()))?;
    Ok(Value::Int(b.signed_duration_since(a).num_days()))
}

fn builtin_date_format(args: &[Value]) -> Result<Value, SandboxError> {
    let date = coerce_date(args.first())
        .ok_or_else(|| SandboxError::Eval("date-format expects a date".to_owned()))?;
    let Some(Value::Str(fmt)) = args.get(1) else {
        return Err(SandboxError::Eval("date-format expects a format string".to_owned()));
    };
    Ok(Value::Str(date.format(fmt).to_string()))
}

fn as_set(value: Option<&Value>) -> Result<BTreeSet<Value>, SandboxError> {
    match value {
        Some(Value::Set(s)) => Ok(s.clone()),
        Some(Value::List(items)) => Ok(items.iter().cloned().collect()),
        _ => Err(SandboxError::Eval("expected a set".to_owned())),
    }
}

fn set_fold(
    args: &[Value],
    op: impl Fn(&BTreeSet<Value>, &BTreeSet<Value>) -> BTreeSet<Value>,
) -> Result<Value, SandboxError> {
    let mut acc = as_set(args.first())?;
    for arg in args.iter().skip(1) {
        let next = as_set(Some(arg))?;
        acc = op(&acc, &next);
    }
    Ok(Value::Set(acc))
}

fn two_sets(
    args: &[Value],
    op: impl Fn(&BTreeSet<Value>, &BTreeSet<Value>) -> bool,
) -> Result<Value, SandboxError> {
    let a = as_set(args.first())?;
    let b = as_set(args.get(1))?;
    Ok(Value::Bool(op(&a, &b)))
}

fn builtin_contains(args: &[Value]) -> Result<Value, SandboxError> {
    let needle = args.get(1).cloned().unwrap_or(Value::Nil);
    let found = match args.first() {
        Some(Value::Set(items)) => items.contains(&needle),
        Some(Value::List(items)) => items.contains(&needle),
        Some(Value::Map(map)) => match &needle {
            Value::Str(k) | Value::Keyword(k) => map.contains_key(k),
            _ => false,
        },
        _ => false,
    };
    Ok(Value::Bool(found))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

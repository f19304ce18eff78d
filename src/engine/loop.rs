//! The iteration loop: one query, many reasoning turns.
//!
//! Each turn asks the model, extracts the fenced code blocks from its
//! reply, runs them in the query's sandbox (on a blocking thread: snippet
//! evaluation may block on sub-queries), and feeds the execution results
//! back as a tool message. The loop ends when a snippet executes `FINAL`,
//! when the model stops emitting code, when the iteration budget runs out,
//! or when the deadline passes. The last two are non-fault terminations
//! carrying the trace collected so far.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::{AskRequest, OutputSpec};
use crate::jsonish;
use crate::providers::{ChatMessage, TokenUsage};
use crate::sandbox::SubQueryRunner;
use crate::types::{Claim, Role};

use super::refine::{default_criteria, RefineEvaluator};
use super::{EngineError, Environment};

// ---------------------------------------------------------------------------
// Options and outcome
// ---------------------------------------------------------------------------

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    /// Caller-supplied context appended to the query.
    pub context: Option<String>,
    /// Schema the final answer must satisfy.
    pub output_spec: Option<OutputSpec>,
    /// Iteration cap; config default when absent.
    pub max_iterations: Option<u32>,
    /// Run the refine loop on the final answer.
    pub refine: bool,
    /// Collect the sandbox's claims into the result.
    pub verify: bool,
    /// Persist an insight learning after answering.
    pub learn: bool,
    /// Retrieval results injected ahead of the first turn.
    pub pre_fetched_context: Option<String>,
    /// Wall deadline for the whole query.
    pub deadline: Option<Instant>,
    /// Model override; config default when absent.
    pub model: Option<String>,
}

/// How the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    /// A `FINAL` sentinel was executed.
    Final,
    /// The model answered without code; the parsed reply is tentative.
    NoCode,
    /// The iteration budget ran out without `FINAL`.
    MaxIterations,
    /// The deadline elapsed.
    Deadline,
}

/// One executed code block.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    /// Block index within the turn.
    pub id: usize,
    /// Rendered result value.
    pub result: String,
    /// Captured stdout.
    pub stdout: String,
    /// Error, if the block failed.
    pub error: Option<String>,
}

/// One model turn with its executions.
#[derive(Debug, Clone)]
pub struct IterationTrace {
    /// Turn number, starting at 1.
    pub iteration: u32,
    /// Raw model reply.
    pub response: String,
    /// Per-block execution records.
    pub executions: Vec<ExecutionRecord>,
}

/// The result of a query.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// Final (or tentative) answer as JSON.
    pub answer: Value,
    /// How the loop terminated.
    pub status: LoopStatus,
    /// Turns used.
    pub iterations: u32,
    /// Refine passes applied (0 when refinement was off or unneeded).
    pub refinement_count: u32,
    /// Rubric scores from each refine pass, in order.
    pub eval_scores: Vec<f64>,
    /// Accumulated claims; present only when `verify` was requested.
    pub verified_claims: Option<Vec<Claim>>,
    /// Full turn-by-turn trace.
    pub trace: Vec<IterationTrace>,
    /// Token usage across every model call in the query.
    pub tokens: TokenUsage,
}

// ---------------------------------------------------------------------------
// System prompt
// ---------------------------------------------------------------------------

const TOOL_GUIDE: &str = "\
Knowledge tools (call like any function):
  (list-documents)                          documents in the store
  (list-toc-entries [doc-id])               flat table of contents
  (search-toc-entries query [doc-id])       TOC substring search
  (get-toc-entry id)                        one TOC entry
  (list-page-nodes [doc-id [page]])         page nodes (text fields truncated)
  (search-page-nodes query [doc-id [page]]) node substring search
  (get-page-node id)                        one node, full text
  (search-entities query [doc-id])          entity search
  (get-entity id) (list-entities [doc-id]) (list-relationships [doc-id]) (entity-stats)
  (get-history n) (search-history query n) (history-stats)
  (store-learning insight [context]) (search-learnings query [limit])
  (vote-learning id useful?) (learning-stats)
  (search-examples) (list-claims)
  (list-locals) (get-local \"name\")
  (rlm-query \"sub-question\")              ask a bounded sub-query

Cite evidence with (CITE text doc-id page section quote [confidence]) or
(CITE-UNVERIFIED text) when you cannot ground a statement.";

const FINAL_CONTRACT: &str = "\
When you have the answer, emit a code block whose last form is
(FINAL answer) or (FINAL-VAR name). Until then, emit code blocks that
gather evidence; each block's results come back in <result_i> tags.
Define intermediate values with (def name value); they persist between
turns.";

/// Build the system prompt for a query.
fn build_system_prompt(output_spec: Option<&OutputSpec>) -> String {
    let mut sections = vec![
        "You answer questions by writing short code snippets against a \
         knowledge store. Snippets are s-expressions; only the operations \
         and tools listed below are available."
            .to_owned(),
        TOOL_GUIDE.to_owned(),
        FINAL_CONTRACT.to_owned(),
    ];
    if let Some(spec) = output_spec {
        let mut section = String::from("## Answer shape\n");
        if !spec.required_keys.is_empty() {
            section.push_str(&format!(
                "The FINAL answer must be a map with the keys: {}.\n",
                spec.required_keys.join(", ")
            ));
        }
        if !spec.description.is_empty() {
            section.push_str(&spec.description);
        }
        sections.push(section);
    }
    sections.join("\n\n")
}

// ---------------------------------------------------------------------------
// The loop
// ---------------------------------------------------------------------------

/// Drive one query to completion.
///
/// # Errors
///
/// Returns [`EngineError`] on store/model faults. Budget and deadline
/// exhaustion are statuses on the outcome, not errors.
pub(crate) async fn run_query(
    env: &Environment,
    runner: Arc<dyn SubQueryRunner>,
    query: &str,
    opts: QueryOpts,
) -> Result<QueryOutcome, EngineError> {
    let model = opts
        .model
        .clone()
        .unwrap_or_else(|| env.config().models.default.clone());
    let max_iterations = opts
        .max_iterations
        .unwrap_or(env.config().limits.max_iterations);
    let query_id = env.next_query_id();

    let system_prompt = build_system_prompt(opts.output_spec.as_ref());
    let mut user_message = query.to_owned();
    if let Some(context) = &opts.context {
        user_message.push_str("\n\n## Context\n");
        user_message.push_str(context);
    }
    if let Some(prefetched) = &opts.pre_fetched_context {
        user_message.push_str("\n\n## Retrieved context\n");
        user_message.push_str(prefetched);
    }

    let mut messages = vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(user_message.clone()),
    ];
    record_message(env, &model, Role::User, &user_message, None);

    let mut sandbox = Some(env.make_sandbox(&query_id, Some(runner)));
    let mut trace: Vec<IterationTrace> = Vec::new();
    let mut tokens = TokenUsage::default();
    let mut answer = Value::Null;
    let mut status = LoopStatus::MaxIterations;
    let mut iterations = 0u32;

    for iteration in 1..=max_iterations {
        if deadline_passed(opts.deadline) {
            status = LoopStatus::Deadline;
            break;
        }

        iterations = iteration;
        let response = match env
            .client()
            .ask(AskRequest::new(model.clone(), messages.clone()))
            .await
        {
            Ok(r) => r,
            Err(e) if deadline_passed(opts.deadline) => {
                // An aborted in-flight call at the deadline is not a fault.
                debug!(error = %e, "model call cut off by deadline");
                status = LoopStatus::Deadline;
                break;
            }
            Err(e) => return Err(e.into()),
        };
        accumulate(&mut tokens, &response.tokens);
        record_message(env, &model, Role::Assistant, &response.raw, Some(iteration));

        let blocks: Vec<String> = jsonish::extract_fenced_blocks(&response.raw)
            .into_iter()
            .map(str::to_owned)
            .collect();

        if blocks.is_empty() {
            // No code: the parsed reply is the tentative answer.
            answer = response.value.clone();
            status = LoopStatus::NoCode;
            trace.push(IterationTrace {
                iteration,
                response: response.raw,
                executions: Vec::new(),
            });
            break;
        }

        // Execute blocks in emission order on a blocking thread; snippet
        // evaluation may block on sub-queries.
        let mut sb = sandbox.take().unwrap_or_else(|| env.make_sandbox(&query_id, None));
        let joined = tokio::task::spawn_blocking(move || {
            let outcomes: Vec<crate::sandbox::SandboxOutcome> =
                blocks.iter().map(|block| sb.run(block)).collect();
            (sb, outcomes)
        })
        .await
        .map_err(|e| EngineError::Execution(e.to_string()))?;
        let (sb, outcomes) = joined;
        sandbox = Some(sb);

        let mut executions = Vec::with_capacity(outcomes.len());
        let mut final_answer = None;
        for (id, outcome) in outcomes.iter().enumerate() {
            executions.push(ExecutionRecord {
                id,
                result: outcome.result.render(),
                stdout: outcome.stdout.clone(),
                error: outcome.error.clone(),
            });
            if final_answer.is_none() {
                final_answer = outcome.final_answer.clone();
            }
        }

        trace.push(IterationTrace {
            iteration,
            response: response.raw,
            executions,
        });

        if let Some(value) = final_answer {
            answer = value.to_json();
            status = LoopStatus::Final;
            break;
        }

        let results_message = match trace.last() {
            Some(turn) => format_results(&turn.executions),
            None => String::new(),
        };
        record_message(env, &model, Role::Tool, &results_message, Some(iteration));
        messages.push(ChatMessage::tool(results_message));
    }

    info!(
        query_id,
        ?status,
        iterations,
        total_tokens = tokens.total_tokens,
        "query loop finished"
    );

    // Claims: persist and surface when verification was requested.
    let verified_claims = if opts.verify {
        let claims = sandbox.as_mut().map(crate::sandbox::Sandbox::take_claims).unwrap_or_default();
        for claim in &claims {
            env.store().append_claim(claim.clone());
        }
        Some(claims)
    } else {
        None
    };

    // Refinement: re-ask against rubric criteria until the score clears
    // the threshold.
    let mut eval_scores = Vec::new();
    let mut refinement_count = 0u32;
    if opts.refine && status == LoopStatus::Final {
        let evaluator = RefineEvaluator::new(env.client(), &model);
        match evaluator.refine(query, answer.clone(), &default_criteria()).await {
            Ok(refined) => {
                eval_scores = refined.scores.clone();
                refinement_count = refined.iterations_used.saturating_sub(1);
                answer = refined.result;
                env.store().append_example(crate::types::ExampleRecord {
                    query: query.to_owned(),
                    answer: answer.to_string(),
                    score: refined.final_score,
                    good: refined.converged,
                    timestamp: chrono::Utc::now(),
                });
            }
            Err(e) => warn!(error = %e, "refinement failed, keeping unrefined answer"),
        }
    }

    // Learning: distil one insight from the exchange, best-effort.
    if opts.learn && status == LoopStatus::Final {
        persist_insight(env, query, &answer).await;
    }

    Ok(QueryOutcome {
        answer,
        status,
        iterations,
        refinement_count,
        eval_scores,
        verified_claims,
        trace,
        tokens,
    })
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

fn accumulate(total: &mut TokenUsage, call: &TokenUsage) {
    total.input_tokens = total.input_tokens.saturating_add(call.input_tokens);
    total.output_tokens = total.output_tokens.saturating_add(call.output_tokens);
    total.total_tokens = total.total_tokens.saturating_add(call.total_tokens);
}

fn record_message(env: &Environment, model: &str, role: Role, content: &str, iteration: Option<u32>) {
    let tokens = env.client().budgeter().count_text(model, content);
    env.store().append_message(role, content.to_owned(), tokens, iteration);
}

/// Render execution records as `<result_i>` blocks for the next turn.
fn format_results(executions: &[ExecutionRecord]) -> String {
    let mut out = String::new();
    for record in executions {
        out.push_str(&format!("<result_{}>\n", record.id));
        match &record.error {
            Some(error) => out.push_str(&format!("error: {error}\n")),
            None => {
                if !record.stdout.is_empty() {
                    out.push_str(&record.stdout);
                    if !record.stdout.ends_with('\n') {
                        out.push('\n');
                    }
                }
                out.push_str(&record.result);
                out.push('\n');
            }
        }
        out.push_str(&format!("</result_{}>\n", record.id));
    }
    out
}

async fn persist_insight(env: &Environment, query: &str, answer: &Value) {
    let model = env.config().models.fast.clone();
    let prompt = format!(
        "In one sentence, state a reusable insight about how to answer \
         questions like this one against this document store. Reply with \
         JSON: {{\"insight\": \"...\"}}.\n\nQuestion: {query}\nAnswer: {answer}"
    );
    let request = AskRequest::new(model, vec![ChatMessage::user(prompt)])
        .with_spec(OutputSpec::with_keys(&["insight"]));
    match env.client().ask(request).await {
        Ok(response) => {
            if let Some(insight) = response.value.get("insight").and_then(Value::as_str) {
                env.store()
                    .store_learning(insight.to_owned(), Some(query.to_owned()));
            }
        }
        Err(e) => debug!(error = %e, "insight extraction skipped"),
    }
}

//! Decompose → verify → refine: rubric evaluation of answers.
//!
//! The evaluator asks the model to grade an output against weighted
//! criteria and, while the overall score stays under the threshold,
//! re-asks the original model with the evaluator's issues appended. The
//! loop converges when the score clears the threshold or when the
//! iteration budget runs out.

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::client::{AskRequest, ModelClient, ModelError, OutputSpec};
use crate::providers::ChatMessage;

/// Default convergence threshold on the overall score.
const DEFAULT_THRESHOLD: f64 = 0.8;
/// Default refine iteration budget.
const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// A weighted rubric criterion.
#[derive(Debug, Clone)]
pub struct Criterion {
    /// Short criterion name.
    pub name: String,
    /// Relative weight in the overall score.
    pub weight: f64,
    /// What the evaluator should check.
    pub description: String,
}

impl Criterion {
    /// Convenience constructor.
    pub fn new(name: &str, weight: f64, description: &str) -> Self {
        Self {
            name: name.to_owned(),
            weight,
            description: description.to_owned(),
        }
    }
}

/// The standard criteria used when the caller does not supply any.
pub fn default_criteria() -> Vec<Criterion> {
    vec![
        Criterion::new("correctness", 0.5, "The answer is factually right for the question."),
        Criterion::new("grounding", 0.3, "Every claim is supported by the cited evidence."),
        Criterion::new("completeness", 0.2, "No part of the question is left unanswered."),
    ]
}

/// Per-criterion score from the evaluator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CriterionScore {
    /// Criterion name as echoed by the evaluator.
    #[serde(default)]
    pub name: String,
    /// Score in `[0, 1]`.
    #[serde(default)]
    pub score: f64,
    /// Optional evaluator notes.
    #[serde(default)]
    pub notes: Option<String>,
}

/// A rubric evaluation of one output.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RubricEvaluation {
    /// Whether the evaluator considers the output correct.
    #[serde(default)]
    pub correct: bool,
    /// Weighted overall score in `[0, 1]`.
    #[serde(default)]
    pub overall_score: f64,
    /// One-line assessment.
    #[serde(default)]
    pub summary: String,
    /// Per-criterion breakdown.
    #[serde(default)]
    pub criteria: Vec<CriterionScore>,
    /// Concrete problems to fix.
    #[serde(default)]
    pub issues: Vec<String>,
}

/// The result of a refine run.
#[derive(Debug, Clone)]
pub struct RefineOutcome {
    /// The (possibly rewritten) output.
    pub result: Value,
    /// Score of the final evaluation.
    pub final_score: f64,
    /// Whether the threshold was reached.
    pub converged: bool,
    /// Evaluations performed (1 means the first output already converged).
    pub iterations_used: u32,
    /// Every overall score, in order.
    pub scores: Vec<f64>,
}

/// Rubric evaluator bound to a client and model.
#[derive(Debug)]
pub struct RefineEvaluator<'a> {
    client: &'a ModelClient,
    model: String,
    threshold: f64,
    max_iterations: u32,
}

impl<'a> RefineEvaluator<'a> {
    /// Evaluator with the default threshold (0.8) and budget (3).
    pub fn new(client: &'a ModelClient, model: &str) -> Self {
        Self {
            client,
            model: model.to_owned(),
            threshold: DEFAULT_THRESHOLD,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    /// Override the convergence threshold.
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Override the iteration budget.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Grade one output against the criteria.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] when the evaluation call fails or cannot be
    /// coerced.
    pub async fn evaluate(
        &self,
        task: &str,
        output: &Value,
        criteria: &[Criterion],
    ) -> Result<RubricEvaluation, ModelError> {
        let rubric: Vec<String> = criteria
            .iter()
            .map(|c| format!("- {} (weight {}): {}", c.name, c.weight, c.description))
            .collect();
        let prompt = format!(
            "Evaluate the output below against the rubric. Score each \
             criterion in [0,1], compute the weighted overall score, and \
             list concrete issues.\n\n\
             ## Task\n{task}\n\n## Output\n{output}\n\n## Rubric\n{}\n\n\
             Reply with JSON: {{\"correct\": bool, \"overall-score\": 0.0, \
             \"summary\": \"...\", \"criteria\": [{{\"name\": \"...\", \
             \"score\": 0.0, \"notes\": \"...\"}}], \"issues\": [\"...\"]}}",
            rubric.join("\n")
        );

        let request = AskRequest::new(self.model.clone(), vec![ChatMessage::user(prompt)])
            .with_spec(OutputSpec::with_keys(&["overall-score"]));
        let response = self.client.ask(request).await?;

        let evaluation: RubricEvaluation =
            serde_json::from_value(response.value.clone()).unwrap_or_else(|_| {
                // Lenient fallback: keep whatever score is recoverable.
                RubricEvaluation {
                    correct: false,
                    overall_score: response
                        .value
                        .get("overall-score")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0),
                    summary: String::new(),
                    criteria: Vec::new(),
                    issues: Vec::new(),
                }
            });
        Ok(evaluation)
    }

    /// Evaluate, then re-ask with the issues until converged or exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError`] when an evaluation or rewrite call fails.
    pub async fn refine(
        &self,
        task: &str,
        initial: Value,
        criteria: &[Criterion],
    ) -> Result<RefineOutcome, ModelError> {
        let mut current = initial;
        let mut scores = Vec::new();
        let mut iterations_used = 0u32;

        loop {
            iterations_used = iterations_used.saturating_add(1);
            let evaluation = self.evaluate(task, &current, criteria).await?;
            scores.push(evaluation.overall_score);
            debug!(
                score = evaluation.overall_score,
                iteration = iterations_used,
                "rubric evaluation"
            );

            if evaluation.overall_score >= self.threshold {
                return Ok(RefineOutcome {
                    result: current,
                    final_score: evaluation.overall_score,
                    converged: true,
                    iterations_used,
                    scores,
                });
            }
            if iterations_used >= self.max_iterations {
                return Ok(RefineOutcome {
                    final_score: evaluation.overall_score,
                    converged: false,
                    iterations_used,
                    scores,
                    result: current,
                });
            }

            current = self.rewrite(task, &current, &evaluation).await?;
        }
    }

    /// One corrective rewrite incorporating the evaluator's issues.
    async fn rewrite(
        &self,
        task: &str,
        output: &Value,
        evaluation: &RubricEvaluation,
    ) -> Result<Value, ModelError> {
        let issues = if evaluation.issues.is_empty() {
            evaluation.summary.clone()
        } else {
            evaluation
                .issues
                .iter()
                .map(|i| format!("- {i}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let prompt = format!(
            "Your previous answer had issues. Produce an improved answer \
             with the same shape.\n\n## Task\n{task}\n\n\
             ## Previous answer\n{output}\n\n## Issues\n{issues}\n\n\
             Reply with only the improved answer as JSON."
        );
        let request = AskRequest::new(self.model.clone(), vec![ChatMessage::user(prompt)]);
        let response = self.client.ask(request).await?;
        Ok(response.value)
    }
}

//! Multi-phase question/answer generation over the knowledge store.
//!
//! Six phases: TOC routing (one fast-model call), parallel passage-batch
//! generation (a bounded worker pipeline), sliding-window deduplication,
//! verification, revision of flagged questions, and assembly. Question
//! lifecycle is an explicit state machine; only pass states reach the
//! final `questions` list, everything else lands in `dropped` with its
//! terminal state intact.
//!
//! The whole pipeline honours a deadline: when it elapses, the phases shut
//! down and whatever was completed is assembled and returned with
//! [`QaStatus::Deadline`].

pub mod save;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::{AskRequest, OutputSpec};
use crate::engine::{EngineError, Environment};
use crate::providers::ChatMessage;
use crate::store::NodeFilter;

// ---------------------------------------------------------------------------
// Vocabulary
// ---------------------------------------------------------------------------

/// Bloom-style difficulty bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    /// Recall a stated fact.
    Remember,
    /// Explain or paraphrase.
    Understand,
    /// Use the material in a new situation.
    Apply,
    /// Break the material apart and relate pieces.
    Analyze,
    /// Judge against criteria.
    Evaluate,
    /// Produce something new from the material.
    Create,
}

impl Difficulty {
    /// All bands in order.
    pub const ALL: [Self; 6] = [
        Self::Remember,
        Self::Understand,
        Self::Apply,
        Self::Analyze,
        Self::Evaluate,
        Self::Create,
    ];

    /// Label used in prompts and stats keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Remember => "remember",
            Self::Understand => "understand",
            Self::Apply => "apply",
            Self::Analyze => "analyze",
            Self::Evaluate => "evaluate",
            Self::Create => "create",
        }
    }

    /// Lenient parse; unknown labels default to `remember`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "understand" => Self::Understand,
            "apply" => Self::Apply,
            "analyze" | "analyse" => Self::Analyze,
            "evaluate" => Self::Evaluate,
            "create" => Self::Create,
            _ => Self::Remember,
        }
    }
}

/// Question categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Answered directly by a stated fact.
    Factual,
    /// Requires a step of inference over the text.
    Inferential,
    /// Contrasts two or more things in the text.
    Comparative,
    /// Applies the text to a scenario.
    Application,
    /// Combines material from several places.
    Synthesis,
}

impl Category {
    /// All categories in order.
    pub const ALL: [Self; 5] = [
        Self::Factual,
        Self::Inferential,
        Self::Comparative,
        Self::Application,
        Self::Synthesis,
    ];

    /// Label used in prompts and stats keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Factual => "factual",
            Self::Inferential => "inferential",
            Self::Comparative => "comparative",
            Self::Application => "application",
            Self::Synthesis => "synthesis",
        }
    }

    /// Lenient parse; unknown labels default to `factual`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "inferential" => Self::Inferential,
            "comparative" => Self::Comparative,
            "application" => Self::Application,
            "synthesis" => Self::Synthesis,
            _ => Self::Factual,
        }
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Pipeline options.
#[derive(Debug, Clone)]
pub struct QaOptions {
    /// Target question count.
    pub count: usize,
    /// Difficulty bands to draw from.
    pub difficulty: Vec<Difficulty>,
    /// Categories to draw from.
    pub categories: Vec<Category>,
    /// Generation worker count and input-channel capacity.
    pub parallelism: usize,
    /// Candidate questions generated per passage.
    pub k_candidates: usize,
    /// Also generate cross-section questions from passage pairs.
    pub multi_hop: bool,
    /// Style instruction prepended to the generation prompt.
    pub persona: Option<String>,
    /// Sliding dedup window size.
    pub dedup_window: usize,
    /// Re-verification rounds after a revision (the revision itself is
    /// always verified once).
    pub reverify_limit: u32,
    /// Fast model for routing and dedup; falls back to config.
    pub selection_model: Option<String>,
    /// Generation/verification model; falls back to config.
    pub model: Option<String>,
    /// Wall deadline for the whole pipeline.
    pub deadline: Option<Instant>,
}

impl Default for QaOptions {
    fn default() -> Self {
        Self {
            count: 10,
            difficulty: vec![Difficulty::Remember, Difficulty::Understand, Difficulty::Apply],
            categories: vec![Category::Factual, Category::Inferential],
            parallelism: 3,
            k_candidates: 1,
            multi_hop: false,
            persona: None,
            dedup_window: 20,
            reverify_limit: 1,
            selection_model: None,
            model: None,
            deadline: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A passage selected by TOC routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Passage {
    /// Source document.
    pub document_id: String,
    /// Source page.
    pub page: u32,
    /// Title of the section the passage sits in.
    #[serde(default)]
    pub section_title: String,
    /// Router's one-line summary of the content.
    #[serde(default)]
    pub content_summary: String,
    /// Difficulty the router suggested for this passage.
    #[serde(default)]
    pub suggested_difficulty: Option<String>,
    /// Category the router suggested for this passage.
    #[serde(default)]
    pub suggested_category: Option<String>,
}

/// Question lifecycle states. Terminal states: `VerifiedPass`,
/// `RevisedPass`, `DedupDropped`, `VerifiedFail`, `RevisedFail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuestionState {
    /// Fresh out of generation.
    Generated,
    /// Survived its dedup window.
    DedupKept,
    /// Dropped as a duplicate.
    DedupDropped,
    /// Passed verification directly.
    VerifiedPass,
    /// Failed verification outright.
    VerifiedFail,
    /// Flagged for revision with a note.
    NeedsRevision,
    /// Passed verification after revision.
    RevisedPass,
    /// Still failing after the revision budget.
    RevisedFail,
}

impl QuestionState {
    /// Whether the state admits the question into the final list.
    pub fn is_pass(self) -> bool {
        matches!(self, Self::VerifiedPass | Self::RevisedPass)
    }
}

/// A generated question with its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QaQuestion {
    /// Stable identifier.
    pub id: Uuid,
    /// The question text.
    pub question: String,
    /// The expected answer.
    pub answer: String,
    /// Difficulty band.
    pub difficulty: Difficulty,
    /// Question category.
    pub category: Category,
    /// Document the question is grounded in.
    pub source_document: String,
    /// Page the question is grounded in.
    pub source_page: u32,
    /// Section title of the source passage.
    pub section_title: String,
    /// Verbatim substring of the source page grounding the answer.
    pub evidence_span: String,
    /// Index of the originating passage, for stable assembly order.
    pub passage_index: usize,
    /// Current lifecycle state.
    pub state: QuestionState,
    /// Reviewer note attached when revision was requested.
    #[serde(default)]
    pub revision_note: Option<String>,
}

/// Aggregate pipeline numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QaStats {
    /// Questions produced by generation (after span validation).
    pub total_generated: usize,
    /// Questions in a pass state after verification/revision.
    pub passed_verification: usize,
    /// Questions dropped by the dedup windows.
    pub duplicates_removed: usize,
    /// Questions in the final list.
    pub final_count: usize,
    /// Final-list counts per difficulty band.
    pub by_difficulty: BTreeMap<String, usize>,
    /// Final-list counts per category.
    pub by_category: BTreeMap<String, usize>,
}

/// How the pipeline terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QaStatus {
    /// Every phase ran to completion.
    Complete,
    /// The deadline elapsed; the result is partial.
    Deadline,
}

/// The assembled output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct QaResult {
    /// Questions in a pass state, ordered by passage index.
    pub questions: Vec<QaQuestion>,
    /// Questions that terminated in a non-pass state.
    pub dropped_questions: Vec<QaQuestion>,
    /// Aggregate numbers.
    pub stats: QaStats,
    /// How the pipeline terminated.
    pub status: QaStatus,
}

// ---------------------------------------------------------------------------
// Distribution
// ---------------------------------------------------------------------------

/// Divide `count` over the category × difficulty grid. The remainder goes
/// to the first cells in order.
pub fn compute_distribution(
    count: usize,
    difficulties: &[Difficulty],
    categories: &[Category],
) -> Vec<(Difficulty, Category, usize)> {
    let mut cells: Vec<(Difficulty, Category, usize)> = Vec::new();
    for category in categories {
        for difficulty in difficulties {
            cells.push((*difficulty, *category, 0));
        }
    }
    if cells.is_empty() {
        return cells;
    }
    let base = count.checked_div(cells.len()).unwrap_or(0);
    let remainder = count.checked_rem(cells.len()).unwrap_or(0);
    for (index, cell) in cells.iter_mut().enumerate() {
        cell.2 = if index < remainder {
            base.saturating_add(1)
        } else {
            base
        };
    }
    cells
}

// ---------------------------------------------------------------------------
// Pipeline entry
// ---------------------------------------------------------------------------

/// Run the full pipeline against an environment's store.
///
/// # Errors
///
/// Returns [`EngineError`] on model/store faults during routing; later
/// phases degrade per-item (failed generations and verifications are
/// logged and skipped) and a deadline produces a partial
/// [`QaStatus::Deadline`] result instead of an error.
pub async fn generate_qa(env: &Environment, opts: QaOptions) -> Result<QaResult, EngineError> {
    let fast_model = opts
        .selection_model
        .clone()
        .unwrap_or_else(|| env.config().models.fast.clone());
    let gen_model = opts
        .model
        .clone()
        .unwrap_or_else(|| env.config().models.default.clone());

    if deadline_passed(opts.deadline) {
        return Ok(assemble(Vec::new(), 0, QaStatus::Deadline));
    }

    // Phase 1: routing.
    let passages = route_passages(env, &fast_model, &opts).await?;
    info!(passages = passages.len(), "TOC routing complete");
    if passages.is_empty() {
        return Ok(assemble(Vec::new(), 0, QaStatus::Complete));
    }

    // Phase 2: generation over a bounded worker pipeline.
    let (mut questions, generation_cut_short) =
        generation_phase(env, &gen_model, passages, &opts).await;
    let total_generated = questions.len();
    info!(total_generated, "generation complete");

    if generation_cut_short {
        return Ok(assemble(questions, total_generated, QaStatus::Deadline));
    }

    // Phase 3: sliding-window dedup.
    let duplicates_removed = dedup_phase(env, &fast_model, &mut questions, &opts).await;
    info!(duplicates_removed, "deduplication complete");

    // Phases 4 and 5: verification and revision.
    for question in &mut questions {
        if question.state != QuestionState::DedupKept {
            continue;
        }
        if deadline_passed(opts.deadline) {
            return Ok(assemble(questions, total_generated, QaStatus::Deadline));
        }
        verify_and_revise(env, &gen_model, question, &opts).await;
    }

    Ok(assemble(questions, total_generated, QaStatus::Complete))
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

// ---------------------------------------------------------------------------
// Phase 1: routing
// ---------------------------------------------------------------------------

async fn route_passages(
    env: &Environment,
    model: &str,
    opts: &QaOptions,
) -> Result<Vec<Passage>, EngineError> {
    let toc_lines: Vec<String> = env
        .store()
        .list_toc_entries(None)
        .iter()
        .map(|t| {
            format!(
                "- [{}] p{} {} — {}",
                t.document_id,
                t.entry.target_page.unwrap_or(0),
                t.entry.title,
                t.entry.description.clone().unwrap_or_default()
            )
        })
        .collect();
    let documents: Vec<String> = env
        .store()
        .list_documents()
        .iter()
        .map(|d| format!("- {} ({} pages, {} nodes)", d.document_id, d.pages, d.nodes))
        .collect();

    let distribution = compute_distribution(opts.count, &opts.difficulty, &opts.categories);
    let distribution_lines: Vec<String> = distribution
        .iter()
        .filter(|(_, _, n)| *n > 0)
        .map(|(d, c, n)| format!("- {n} x {} / {}", c.as_str(), d.as_str()))
        .collect();

    let prompt = format!(
        "Select passages for question generation (CHUNK_SELECTION_SPEC).\n\n\
         ## Documents\n{}\n\n## Table of contents\n{}\n\n\
         ## Target distribution\n{}\n\n\
         Pick one passage per target question, spreading across sections. \
         Reply with JSON: {{\"passages\": [{{\"document-id\": \"...\", \
         \"page\": 0, \"section-title\": \"...\", \"content-summary\": \
         \"...\", \"suggested-difficulty\": \"...\", \
         \"suggested-category\": \"...\"}}]}}",
        documents.join("\n"),
        toc_lines.join("\n"),
        distribution_lines.join("\n"),
    );

    let request = AskRequest::new(model, vec![ChatMessage::user(prompt)])
        .with_spec(OutputSpec::with_keys(&["passages"]));
    let response = env.client().ask(request).await?;

    let passages: Vec<Passage> = response
        .value
        .get("passages")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    Ok(passages)
}

// ---------------------------------------------------------------------------
// Phase 2: generation
// ---------------------------------------------------------------------------

/// Batch size derived from parallelism: every worker gets roughly one
/// batch.
fn batch_size(passage_count: usize, parallelism: usize) -> usize {
    passage_count.div_ceil(parallelism.max(1)).max(1)
}

async fn generation_phase(
    env: &Environment,
    model: &str,
    passages: Vec<Passage>,
    opts: &QaOptions,
) -> (Vec<QaQuestion>, bool) {
    let parallelism = opts.parallelism.max(1);
    let size = batch_size(passages.len(), parallelism);
    let indexed: Vec<(usize, Passage)> = passages.into_iter().enumerate().collect();
    let batches: Vec<Vec<(usize, Passage)>> =
        indexed.chunks(size).map(<[(usize, Passage)]>::to_vec).collect();
    let batch_count = batches.len();

    // Bounded pipeline: input capacity equals the worker count, workers
    // share both channels, output is reassembled by batch index.
    let (in_tx, in_rx) = mpsc::channel::<(usize, Vec<(usize, Passage)>)>(parallelism);
    let in_rx = Arc::new(Mutex::new(in_rx));
    let (out_tx, mut out_rx) = mpsc::channel::<(usize, Vec<QaQuestion>)>(batch_count.max(1));

    let mut workers = tokio::task::JoinSet::new();
    for worker_id in 0..parallelism {
        let in_rx = in_rx.clone();
        let out_tx = out_tx.clone();
        // Forked handle: shared store and client, exclusive locals slot.
        let env = env.clone();
        let model = model.to_owned();
        let opts = opts.clone();
        workers.spawn(async move {
            loop {
                let next = { in_rx.lock().await.recv().await };
                let Some((batch_index, batch)) = next else { break };
                debug!(worker_id, batch_index, passages = batch.len(), "worker picked up batch");
                let questions = generate_batch(&env, &model, &batch, &opts).await;
                if out_tx.send((batch_index, questions)).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(out_tx);

    let mut cut_short = false;
    for (index, batch) in batches.into_iter().enumerate() {
        if deadline_passed(opts.deadline) {
            cut_short = true;
            break;
        }
        if in_tx.send((index, batch)).await.is_err() {
            break;
        }
    }
    drop(in_tx);

    let mut by_batch: BTreeMap<usize, Vec<QaQuestion>> = BTreeMap::new();
    while let Some((index, questions)) = out_rx.recv().await {
        by_batch.insert(index, questions);
    }
    while workers.join_next().await.is_some() {}

    let mut questions: Vec<QaQuestion> = by_batch.into_values().flatten().collect();
    questions.sort_by_key(|q| q.passage_index);
    (questions, cut_short)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct GeneratedQuestion {
    question: String,
    answer: String,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default)]
    category: Option<String>,
    evidence_span: String,
}

async fn generate_batch(
    env: &Environment,
    model: &str,
    batch: &[(usize, Passage)],
    opts: &QaOptions,
) -> Vec<QaQuestion> {
    let mut questions = Vec::new();

    for (passage_index, passage) in batch {
        if deadline_passed(opts.deadline) {
            break;
        }
        let page_text = load_page_text(env, passage);
        if page_text.trim().is_empty() {
            warn!(document = %passage.document_id, page = passage.page, "empty passage, skipping");
            continue;
        }
        let generated =
            generate_for_passage(env, model, passage, &page_text, opts, None).await;
        questions.extend(into_questions(generated, *passage_index, passage, &page_text));
    }

    // Multi-hop: cross-section questions from adjacent passage pairs.
    if opts.multi_hop && batch.len() >= 2 {
        for pair in batch.windows(2) {
            if deadline_passed(opts.deadline) {
                break;
            }
            let (left_index, left) = &pair[0];
            let (right_index, right) = &pair[1];
            let left_text = load_page_text(env, left);
            let right_text = load_page_text(env, right);
            if left_text.trim().is_empty() || right_text.trim().is_empty() {
                continue;
            }
            let combined = format!(
                "## Section A: {}\n{left_text}\n\n## Section B: {}\n{right_text}",
                left.section_title, right.section_title
            );
            let generated =
                generate_for_passage(env, model, left, &combined, opts, Some(right)).await;
            // Multi-hop spans must still be verbatim in one of the pages.
            for g in generated {
                let span_home = if left_text.contains(&g.evidence_span) {
                    Some((left_index, left, &left_text))
                } else if right_text.contains(&g.evidence_span) {
                    Some((right_index, right, &right_text))
                } else {
                    None
                };
                if let Some((index, source, _)) = span_home {
                    questions.extend(into_questions(vec![g], *index, source, &combined));
                } else {
                    warn!("multi-hop evidence span not verbatim in either section, dropping");
                }
            }
        }
    }

    questions
}

fn load_page_text(env: &Environment, passage: &Passage) -> String {
    let nodes = env.store().list_page_nodes(&NodeFilter {
        document_id: Some(passage.document_id.clone()),
        page: Some(passage.page),
    });
    nodes
        .iter()
        .filter_map(|n| n.node.content_text())
        .collect::<Vec<_>>()
        .join("\n")
}

async fn generate_for_passage(
    env: &Environment,
    model: &str,
    passage: &Passage,
    page_text: &str,
    opts: &QaOptions,
    hop_target: Option<&Passage>,
) -> Vec<GeneratedQuestion> {
    let difficulty = passage
        .suggested_difficulty
        .as_deref()
        .map_or(Difficulty::Remember, Difficulty::parse);
    let category = passage
        .suggested_category
        .as_deref()
        .map_or(Category::Factual, Category::parse);

    let mut prompt = String::new();
    if let Some(persona) = &opts.persona {
        prompt.push_str(&format!("Adopt this persona when writing: {persona}\n\n"));
    }
    let hop_note = hop_target.map_or(String::new(), |target| {
        format!(
            " The question must require connecting Section A with Section B \
             ({}).",
            target.section_title
        )
    });
    prompt.push_str(&format!(
        "Write {count} question/answer pair(s) of difficulty '{}' and \
         category '{}' grounded ONLY in the passage below.{hop_note} \
         Each pair must carry an evidence-span: a VERBATIM substring of \
         the passage that contains the answer.\n\n\
         ## Passage ({} p{}, {})\n{page_text}\n\n\
         Reply with JSON: {{\"questions\": [{{\"question\": \"...\", \
         \"answer\": \"...\", \"difficulty\": \"{}\", \"category\": \
         \"{}\", \"evidence-span\": \"...\"}}]}}",
        difficulty.as_str(),
        category.as_str(),
        passage.document_id,
        passage.page,
        passage.section_title,
        difficulty.as_str(),
        category.as_str(),
        count = opts.k_candidates.max(1),
    ));

    let request = AskRequest::new(model, vec![ChatMessage::user(prompt)])
        .with_spec(OutputSpec::with_keys(&["questions"]));
    match env.client().ask(request).await {
        Ok(response) => response
            .value
            .get("questions")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default(),
        Err(e) => {
            warn!(document = %passage.document_id, page = passage.page, error = %e,
                "generation failed for passage");
            Vec::new()
        }
    }
}

/// Convert raw generations into state-machine records, enforcing the
/// verbatim evidence-span invariant.
fn into_questions(
    generated: Vec<GeneratedQuestion>,
    passage_index: usize,
    passage: &Passage,
    page_text: &str,
) -> Vec<QaQuestion> {
    generated
        .into_iter()
        .filter_map(|g| {
            if !page_text.contains(&g.evidence_span) {
                warn!(
                    document = %passage.document_id,
                    page = passage.page,
                    "evidence span is not verbatim in the passage, dropping"
                );
                return None;
            }
            Some(QaQuestion {
                id: Uuid::new_v4(),
                question: g.question,
                answer: g.answer,
                difficulty: g
                    .difficulty
                    .as_deref()
                    .map_or(Difficulty::Remember, Difficulty::parse),
                category: g
                    .category
                    .as_deref()
                    .map_or(Category::Factual, Category::parse),
                source_document: passage.document_id.clone(),
                source_page: passage.page,
                section_title: passage.section_title.clone(),
                evidence_span: g.evidence_span,
                passage_index,
                state: QuestionState::Generated,
                revision_note: None,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Phase 3: dedup
// ---------------------------------------------------------------------------

async fn dedup_phase(
    env: &Environment,
    model: &str,
    questions: &mut [QaQuestion],
    opts: &QaOptions,
) -> usize {
    let window = opts.dedup_window.max(1);
    let mut removed = 0usize;

    let mut start = 0usize;
    while start < questions.len() {
        let end = start.saturating_add(window).min(questions.len());
        if deadline_passed(opts.deadline) {
            // Unprocessed windows keep everything.
            for question in &mut questions[start..] {
                question.state = QuestionState::DedupKept;
            }
            break;
        }

        let listing: Vec<String> = questions[start..end]
            .iter()
            .enumerate()
            .map(|(i, q)| format!("{i}: {}", q.question))
            .collect();
        let prompt = format!(
            "These generated questions may contain near-duplicates. Return \
             the indices to KEEP (drop rephrasings of the same question).\n\n\
             {}\n\nReply with JSON: {{\"keep\": [0, 1, ...]}}",
            listing.join("\n")
        );

        let request = AskRequest::new(model, vec![ChatMessage::user(prompt)])
            .with_spec(OutputSpec::with_keys(&["keep"]));
        let keep: Option<Vec<usize>> = match env.client().ask(request).await {
            Ok(response) => response
                .value
                .get("keep")
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_u64)
                        .filter_map(|i| usize::try_from(i).ok())
                        .collect()
                }),
            Err(e) => {
                warn!(error = %e, "dedup window failed, keeping all");
                None
            }
        };

        match keep {
            // An empty keep-list means the model failed to answer; fall
            // back to keeping the whole window.
            Some(indices) if !indices.is_empty() => {
                for (i, question) in questions[start..end].iter_mut().enumerate() {
                    if indices.contains(&i) {
                        question.state = QuestionState::DedupKept;
                    } else {
                        question.state = QuestionState::DedupDropped;
                        removed = removed.saturating_add(1);
                    }
                }
            }
            _ => {
                for question in &mut questions[start..end] {
                    question.state = QuestionState::DedupKept;
                }
            }
        }
        start = end;
    }
    removed
}

// ---------------------------------------------------------------------------
// Phases 4 and 5: verification and revision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Verdict {
    #[serde(default)]
    verdict: String,
    #[serde(default)]
    revision_note: Option<String>,
}

async fn verify_question(env: &Environment, model: &str, question: &QaQuestion) -> Verdict {
    let prompt = format!(
        "Verify this generated question against its evidence span. Checks: \
         grounded-in-evidence, non-trivial, self-contained, answerable from \
         the span alone, answer consistent with the span.\n\n\
         Question: {}\nAnswer: {}\nEvidence span: {}\n\n\
         Reply with JSON: {{\"verdict\": \"pass\" | \"fail\" | \
         \"needs-revision\", \"revision-note\": \"...\"}}",
        question.question, question.answer, question.evidence_span
    );
    let request = AskRequest::new(model, vec![ChatMessage::user(prompt)])
        .with_spec(OutputSpec::with_keys(&["verdict"]));
    match env.client().ask(request).await {
        Ok(response) => serde_json::from_value(response.value).unwrap_or(Verdict {
            verdict: "fail".to_owned(),
            revision_note: None,
        }),
        Err(e) => {
            warn!(error = %e, "verification call failed, treating as fail");
            Verdict {
                verdict: "fail".to_owned(),
                revision_note: None,
            }
        }
    }
}

async fn verify_and_revise(
    env: &Environment,
    model: &str,
    question: &mut QaQuestion,
    opts: &QaOptions,
) {
    let verdict = verify_question(env, model, question).await;
    match verdict.verdict.trim().to_lowercase().as_str() {
        "pass" => {
            question.state = QuestionState::VerifiedPass;
            return;
        }
        "needs-revision" | "needs_revision" => {
            question.state = QuestionState::NeedsRevision;
            question.revision_note = verdict.revision_note.clone();
        }
        _ => {
            question.state = QuestionState::VerifiedFail;
            return;
        }
    }

    // Revision: regenerate with the note, then re-verify up to the limit.
    for _ in 0..opts.reverify_limit.max(1) {
        let Some(revised) = revise_question(env, model, question).await else {
            question.state = QuestionState::RevisedFail;
            return;
        };
        question.question = revised.question;
        question.answer = revised.answer;
        question.evidence_span = revised.evidence_span;

        let verdict = verify_question(env, model, question).await;
        if verdict.verdict.trim().eq_ignore_ascii_case("pass") {
            question.state = QuestionState::RevisedPass;
            return;
        }
        question.revision_note = verdict.revision_note;
    }
    question.state = QuestionState::RevisedFail;
}

async fn revise_question(
    env: &Environment,
    model: &str,
    question: &QaQuestion,
) -> Option<GeneratedQuestion> {
    let note = question
        .revision_note
        .clone()
        .unwrap_or_else(|| "improve grounding and self-containment".to_owned());
    let prompt = format!(
        "Revise this question/answer pair. Reviewer note: {note}\n\n\
         Question: {}\nAnswer: {}\nEvidence span: {}\n\n\
         Keep the evidence-span a verbatim quote of the source. Reply with \
         JSON: {{\"question\": \"...\", \"answer\": \"...\", \
         \"evidence-span\": \"...\"}}",
        question.question, question.answer, question.evidence_span
    );
    let request = AskRequest::new(model, vec![ChatMessage::user(prompt)])
        .with_spec(OutputSpec::with_keys(&["question", "answer", "evidence-span"]));
    match env.client().ask(request).await {
        Ok(response) => serde_json::from_value(response.value).ok(),
        Err(e) => {
            warn!(error = %e, "revision call failed");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Phase 6: assembly
// ---------------------------------------------------------------------------

fn assemble(questions: Vec<QaQuestion>, total_generated: usize, status: QaStatus) -> QaResult {
    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    let mut stats = QaStats {
        total_generated,
        ..QaStats::default()
    };

    for question in questions {
        match question.state {
            state if state.is_pass() => {
                stats.passed_verification = stats.passed_verification.saturating_add(1);
                let d = stats
                    .by_difficulty
                    .entry(question.difficulty.as_str().to_owned())
                    .or_insert(0);
                *d = d.saturating_add(1);
                let c = stats
                    .by_category
                    .entry(question.category.as_str().to_owned())
                    .or_insert(0);
                *c = c.saturating_add(1);
                kept.push(question);
            }
            QuestionState::DedupDropped => {
                stats.duplicates_removed = stats.duplicates_removed.saturating_add(1);
                dropped.push(question);
            }
            _ => dropped.push(question),
        }
    }

    kept.sort_by_key(|q| q.passage_index);
    stats.final_count = kept.len();

    QaResult {
        questions: kept,
        dropped_questions: dropped,
        stats,
        status,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

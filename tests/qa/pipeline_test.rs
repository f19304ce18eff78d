//! The QA pipeline end to end, driven by scripted model replies.
//!
//! Phase order with `parallelism = 1` is deterministic: routing,
//! generation (one call per passage), dedup windows, then one
//! verification call per kept question, plus revision calls as needed.

use std::time::Instant;

use straylight::engine::IngestOptions;
use straylight::qa::{generate_qa, QaOptions, QaStatus};

use crate::common::{fixture_document, make_engine, ScriptedTransport};

const ROUTING_ONE_PASSAGE: &str = r#"{"passages": [{
    "document-id": "contract-a", "page": 0,
    "section-title": "Payment", "content-summary": "payment terms",
    "suggested-difficulty": "remember", "suggested-category": "factual"}]}"#;

fn serial_opts(count: usize) -> QaOptions {
    QaOptions {
        count,
        parallelism: 1,
        ..QaOptions::default()
    }
}

fn question_json(question: &str, span: &str) -> String {
    format!(
        r#"{{"question": "{question}", "answer": "net thirty days",
            "difficulty": "remember", "category": "factual",
            "evidence-span": "{span}"}}"#
    )
}

#[tokio::test(flavor = "multi_thread")]
async fn verification_verdicts_route_the_state_machine() {
    let generation = format!(
        r#"{{"questions": [{}, {}, {}]}}"#,
        question_json("When are invoices due?", "net thirty (30) days"),
        question_json("What is the payment method?", "payable net thirty"),
        question_json("How long is the payment window?", "thirty (30) days from receipt"),
    );
    let transport = ScriptedTransport::new(vec![
        ROUTING_ONE_PASSAGE.to_owned(),
        generation,
        // Dedup: keep all three.
        r#"{"keep": [0, 1, 2]}"#.to_owned(),
        // Verdicts: pass, fail, needs-revision.
        r#"{"verdict": "pass"}"#.to_owned(),
        r#"{"verdict": "fail"}"#.to_owned(),
        r#"{"verdict": "needs-revision", "revision-note": "not self-contained"}"#.to_owned(),
        // Revision of the third question, then its re-verification.
        question_json("How long after receipt are invoices payable?", "net thirty (30) days"),
        r#"{"verdict": "pass"}"#.to_owned(),
    ]);
    let (engine, env) = make_engine(transport.clone());
    engine
        .ingest(&env, vec![fixture_document()], IngestOptions::default())
        .await
        .expect("ingest");

    let mut opts = serial_opts(3);
    opts.k_candidates = 3;
    let result = generate_qa(&env, opts).await.expect("pipeline");

    assert_eq!(result.status, QaStatus::Complete);
    assert_eq!(result.stats.total_generated, 3);
    assert_eq!(result.stats.passed_verification, 2);
    assert_eq!(result.stats.final_count, 2);
    assert_eq!(result.questions.len(), 2);
    assert_eq!(result.dropped_questions.len(), 1);
    assert_eq!(transport.call_count(), 8);

    // The revised question carries its rewritten text.
    assert!(result
        .questions
        .iter()
        .any(|q| q.question.contains("after receipt")));
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn dedup_windows_drop_duplicates_across_windows() {
    // 25 generated questions, window of 20: drop 5 in the first window
    // and 2 in the second.
    let questions: Vec<String> = (0..25)
        .map(|i| {
            question_json(
                &format!("Question number {i} about payment?"),
                "net thirty (30) days",
            )
        })
        .collect();
    let generation = format!(r#"{{"questions": [{}]}}"#, questions.join(", "));

    let keep_first: Vec<String> = (0..15).map(|i| i.to_string()).collect();
    let transport = ScriptedTransport::new(vec![
        ROUTING_ONE_PASSAGE.to_owned(),
        generation,
        format!(r#"{{"keep": [{}]}}"#, keep_first.join(", ")),
        r#"{"keep": [0, 1, 2]}"#.to_owned(),
        // All surviving questions verify as pass (reply repeats).
        r#"{"verdict": "pass"}"#.to_owned(),
    ]);
    let (engine, env) = make_engine(transport);
    engine
        .ingest(&env, vec![fixture_document()], IngestOptions::default())
        .await
        .expect("ingest");

    let mut opts = serial_opts(25);
    opts.k_candidates = 25;
    let result = generate_qa(&env, opts).await.expect("pipeline");

    assert_eq!(result.stats.total_generated, 25);
    assert_eq!(result.stats.duplicates_removed, 7);
    assert_eq!(result.stats.final_count, 18);
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_dedup_reply_keeps_everything() {
    let generation = format!(
        r#"{{"questions": [{}, {}]}}"#,
        question_json("Q one?", "net thirty"),
        question_json("Q two?", "thirty (30) days"),
    );
    let transport = ScriptedTransport::new(vec![
        ROUTING_ONE_PASSAGE.to_owned(),
        generation,
        r#"{"keep": []}"#.to_owned(),
        r#"{"verdict": "pass"}"#.to_owned(),
    ]);
    let (engine, env) = make_engine(transport);
    engine
        .ingest(&env, vec![fixture_document()], IngestOptions::default())
        .await
        .expect("ingest");

    let mut opts = serial_opts(2);
    opts.k_candidates = 2;
    let result = generate_qa(&env, opts).await.expect("pipeline");

    assert_eq!(result.stats.duplicates_removed, 0);
    assert_eq!(result.stats.final_count, 2);
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn non_verbatim_evidence_spans_are_dropped_at_generation() {
    let generation = format!(
        r#"{{"questions": [{}, {}]}}"#,
        question_json("Good span?", "net thirty (30) days"),
        question_json("Bad span?", "this text appears nowhere in the document"),
    );
    let transport = ScriptedTransport::new(vec![
        ROUTING_ONE_PASSAGE.to_owned(),
        generation,
        r#"{"keep": [0]}"#.to_owned(),
        r#"{"verdict": "pass"}"#.to_owned(),
    ]);
    let (engine, env) = make_engine(transport);
    engine
        .ingest(&env, vec![fixture_document()], IngestOptions::default())
        .await
        .expect("ingest");

    let mut opts = serial_opts(2);
    opts.k_candidates = 2;
    let result = generate_qa(&env, opts).await.expect("pipeline");

    // Only the grounded question survived generation at all.
    assert_eq!(result.stats.total_generated, 1);
    assert_eq!(result.stats.final_count, 1);

    // The retained span really is a verbatim substring of the cited page.
    let question = &result.questions[0];
    let page_nodes = env.store().list_page_nodes(&straylight::store::NodeFilter {
        document_id: Some(question.source_document.clone()),
        page: Some(question.source_page),
    });
    let page_text: String = page_nodes
        .iter()
        .filter_map(|n| n.node.content_text())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(page_text.contains(&question.evidence_span));
    assert!(!question.source_document.is_empty());
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_deadline_yields_a_partial_result() {
    let transport = ScriptedTransport::new(vec![ROUTING_ONE_PASSAGE]);
    let (engine, env) = make_engine(transport);
    engine
        .ingest(&env, vec![fixture_document()], IngestOptions::default())
        .await
        .expect("ingest");

    let mut opts = serial_opts(5);
    // A deadline of "now" is already expired by the first check.
    opts.deadline = Some(Instant::now());
    let result = generate_qa(&env, opts).await.expect("pipeline");

    assert_eq!(result.status, QaStatus::Deadline);
    assert!(result.questions.is_empty());
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_routing_short_circuits_the_pipeline() {
    let transport = ScriptedTransport::new(vec![r#"{"passages": []}"#]);
    let (engine, env) = make_engine(transport.clone());

    let result = generate_qa(&env, serial_opts(5)).await.expect("pipeline");

    assert_eq!(result.status, QaStatus::Complete);
    assert!(result.questions.is_empty());
    assert_eq!(result.stats.total_generated, 0);
    // Only the routing call happened.
    assert_eq!(transport.call_count(), 1);
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_generation_preserves_passage_order_in_assembly() {
    // Three passages across two pages; three workers race, but assembly
    // must come back in passage order.
    let routing = r#"{"passages": [
        {"document-id": "contract-a", "page": 0, "section-title": "Payment",
         "content-summary": "s", "suggested-difficulty": "remember",
         "suggested-category": "factual"},
        {"document-id": "contract-a", "page": 1, "section-title": "Termination",
         "content-summary": "s", "suggested-difficulty": "remember",
         "suggested-category": "factual"},
        {"document-id": "contract-a", "page": 0, "section-title": "Payment",
         "content-summary": "s", "suggested-difficulty": "remember",
         "suggested-category": "factual"}]}"#;
    // Every generation call returns a question grounded on both pages'
    // shared word "days", so any worker's reply fits its passage.
    let generation = r#"{"questions": [{"question": "About days?",
        "answer": "days", "difficulty": "remember", "category": "factual",
        "evidence-span": "days"}]}"#;
    let transport = ScriptedTransport::new(vec![
        routing.to_owned(),
        generation.to_owned(),
        generation.to_owned(),
        generation.to_owned(),
        r#"{"keep": [0, 1, 2]}"#.to_owned(),
        r#"{"verdict": "pass"}"#.to_owned(),
    ]);
    let (engine, env) = make_engine(transport);
    engine
        .ingest(&env, vec![fixture_document()], IngestOptions::default())
        .await
        .expect("ingest");

    let mut opts = serial_opts(3);
    opts.parallelism = 3;
    let result = generate_qa(&env, opts).await.expect("pipeline");

    assert_eq!(result.stats.final_count, 3);
    let indices: Vec<usize> = result.questions.iter().map(|q| q.passage_index).collect();
    let mut sorted = indices.clone();
    sorted.sort_unstable();
    assert_eq!(indices, sorted);
    engine.dispose_env(env).expect("dispose");
}

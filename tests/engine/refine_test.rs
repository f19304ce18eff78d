//! Rubric evaluation and the refine loop.

use serde_json::json;

use straylight::engine::refine::{default_criteria, RefineEvaluator};

use crate::common::{make_client, ScriptedTransport};

#[tokio::test]
async fn evaluate_parses_a_rubric_reply() {
    let transport = ScriptedTransport::new(vec![
        r#"{"correct": true, "overall_score": 0.92, "summary": "solid",
            "criteria": [{"name": "correctness", "score": 0.95}],
            "issues": []}"#,
    ]);
    let client = make_client(transport);
    let evaluator = RefineEvaluator::new(&client, "gpt-4o");

    let evaluation = evaluator
        .evaluate("summarise terms", &json!("net 30"), &default_criteria())
        .await
        .expect("evaluate");

    assert!(evaluation.correct);
    assert!((evaluation.overall_score - 0.92).abs() < 1e-9);
    assert_eq!(evaluation.criteria.len(), 1);
}

#[tokio::test]
async fn refine_converges_immediately_above_threshold() {
    let transport = ScriptedTransport::new(vec![
        r#"{"correct": true, "overall_score": 0.9, "summary": "fine", "issues": []}"#,
    ]);
    let client = make_client(transport.clone());
    let evaluator = RefineEvaluator::new(&client, "gpt-4o");

    let outcome = evaluator
        .refine("task", json!({"answer": "net 30"}), &default_criteria())
        .await
        .expect("refine");

    assert!(outcome.converged);
    assert_eq!(outcome.iterations_used, 1);
    assert_eq!(outcome.scores, vec![0.9]);
    assert_eq!(outcome.result, json!({"answer": "net 30"}));
    // One evaluation call, no rewrite.
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn refine_rewrites_until_the_score_clears() {
    let transport = ScriptedTransport::new(vec![
        // Evaluation 1: under threshold, with issues.
        r#"{"correct": false, "overall_score": 0.5, "summary": "thin",
            "issues": ["missing the notice period"]}"#,
        // Rewrite.
        r#"{"answer": "net 30, terminable on 60 days notice"}"#,
        // Evaluation 2: converged.
        r#"{"correct": true, "overall_score": 0.9, "summary": "better", "issues": []}"#,
    ]);
    let client = make_client(transport.clone());
    let evaluator = RefineEvaluator::new(&client, "gpt-4o");

    let outcome = evaluator
        .refine("task", json!({"answer": "net 30"}), &default_criteria())
        .await
        .expect("refine");

    assert!(outcome.converged);
    assert_eq!(outcome.iterations_used, 2);
    assert_eq!(outcome.scores, vec![0.5, 0.9]);
    assert_eq!(
        outcome.result,
        json!({"answer": "net 30, terminable on 60 days notice"})
    );
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test]
async fn refine_gives_up_after_the_iteration_budget() {
    // Every evaluation scores low; every rewrite changes nothing.
    let transport = ScriptedTransport::new(vec![
        r#"{"overall_score": 0.3, "issues": ["vague"]}"#,
        r#"{"answer": "still vague"}"#,
        r#"{"overall_score": 0.35, "issues": ["vague"]}"#,
        r#"{"answer": "still vague"}"#,
        r#"{"overall_score": 0.4, "issues": ["vague"]}"#,
    ]);
    let client = make_client(transport);
    let evaluator = RefineEvaluator::new(&client, "gpt-4o").with_max_iterations(3);

    let outcome = evaluator
        .refine("task", json!("vague"), &default_criteria())
        .await
        .expect("refine");

    assert!(!outcome.converged);
    assert_eq!(outcome.iterations_used, 3);
    assert_eq!(outcome.scores.len(), 3);
    assert!((outcome.final_score - 0.4).abs() < 1e-9);
}

#[tokio::test]
async fn custom_threshold_is_honoured() {
    let transport = ScriptedTransport::new(vec![r#"{"overall_score": 0.6, "issues": []}"#]);
    let client = make_client(transport);
    let evaluator = RefineEvaluator::new(&client, "gpt-4o").with_threshold(0.5);

    let outcome = evaluator
        .refine("task", json!("ok"), &default_criteria())
        .await
        .expect("refine");
    assert!(outcome.converged);
}

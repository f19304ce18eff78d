//! Iteration loop scenarios: FINAL, max iterations, deadlines, claims,
//! retry behaviour.

use std::time::Instant;

use serde_json::json;

use straylight::client::AskRequest;
use straylight::engine::{LoopStatus, QueryOpts, StoreTarget};
use straylight::providers::ChatMessage;

use crate::common::{fixture_document, make_client, make_engine, FlakyTransport, ScriptedTransport};

#[tokio::test(flavor = "multi_thread")]
async fn final_in_first_iteration_answers_immediately() {
    let transport = ScriptedTransport::new(vec![
        "The context says 2 + 2 = 4.\n```\n(FINAL \"4\")\n```",
    ]);
    let (engine, env) = make_engine(transport.clone());

    let outcome = engine
        .query(
            &env,
            "What is 2+2?",
            QueryOpts {
                context: Some("2 + 2 = 4".to_owned()),
                max_iterations: Some(1),
                ..QueryOpts::default()
            },
        )
        .await
        .expect("query");

    assert_eq!(outcome.status, LoopStatus::Final);
    assert_eq!(outcome.answer, json!("4"));
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.refinement_count, 0);
    assert!(outcome.verified_claims.is_none());
    assert_eq!(transport.call_count(), 1);
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn model_that_never_finalises_hits_max_iterations() {
    let transport = ScriptedTransport::new(vec![
        "Still thinking.\n```\n(+ 1 1)\n```",
    ]);
    let (engine, env) = make_engine(transport.clone());

    let outcome = engine
        .query(
            &env,
            "unanswerable",
            QueryOpts {
                max_iterations: Some(3),
                ..QueryOpts::default()
            },
        )
        .await
        .expect("query");

    assert_eq!(outcome.status, LoopStatus::MaxIterations);
    assert_eq!(outcome.iterations, 3);
    assert_eq!(outcome.trace.len(), 3);
    assert_eq!(transport.call_count(), 3);
    // Every turn executed its block and got a result record.
    for turn in &outcome.trace {
        assert_eq!(turn.executions.len(), 1);
        assert_eq!(turn.executions[0].result, "2");
    }
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn reply_without_code_is_a_tentative_answer() {
    let transport = ScriptedTransport::new(vec![r#"{"answer": "net thirty days"}"#]);
    let (engine, env) = make_engine(transport);

    let outcome = engine
        .query(&env, "payment terms?", QueryOpts::default())
        .await
        .expect("query");

    assert_eq!(outcome.status, LoopStatus::NoCode);
    assert_eq!(outcome.answer["answer"], json!("net thirty days"));
    assert_eq!(outcome.iterations, 1);
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn verify_collects_and_persists_claims() {
    let transport = ScriptedTransport::new(vec![
        "Citing then answering.\n```\n(CITE \"payment is net 30\" \"contract-a\" 0 \"Payment\" \
         \"net thirty (30) days\")\n(FINAL \"net 30\")\n```",
    ]);
    let (engine, env) = make_engine(transport);
    engine
        .ingest(&env, vec![fixture_document()], Default::default())
        .await
        .expect("ingest");

    let outcome = engine
        .query(
            &env,
            "payment terms?",
            QueryOpts {
                verify: true,
                ..QueryOpts::default()
            },
        )
        .await
        .expect("query");

    let claims = outcome.verified_claims.expect("claims present");
    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].document_id, "contract-a");
    assert!((claims[0].confidence - 0.9).abs() < 1e-9);
    // Claims are persisted in the store too.
    assert_eq!(env.store().list_claims(None).len(), 1);
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn locals_persist_between_iterations() {
    let transport = ScriptedTransport::new(vec![
        "Setting up.\n```\n(def total (+ 20 10))\n```",
        "Using it.\n```\n(FINAL-VAR total)\n```",
    ]);
    let (engine, env) = make_engine(transport);

    let outcome = engine
        .query(&env, "compute", QueryOpts::default())
        .await
        .expect("query");

    assert_eq!(outcome.status, LoopStatus::Final);
    assert_eq!(outcome.answer, json!(30));
    assert_eq!(outcome.iterations, 2);
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_deadline_returns_deadline_status() {
    let transport = ScriptedTransport::new(vec!["never reached"]);
    let (engine, env) = make_engine(transport.clone());

    let outcome = engine
        .query(
            &env,
            "anything",
            QueryOpts {
                // A deadline of "now" is already expired by the first check.
                deadline: Some(Instant::now()),
                ..QueryOpts::default()
            },
        )
        .await
        .expect("query");

    assert_eq!(outcome.status, LoopStatus::Deadline);
    assert_eq!(outcome.iterations, 0);
    assert!(outcome.trace.is_empty());
    assert_eq!(transport.call_count(), 0);
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn sandbox_errors_are_fed_back_not_raised() {
    let transport = ScriptedTransport::new(vec![
        "Dividing.\n```\n(/ 1 0)\n```",
        "Recovering.\n```\n(FINAL \"recovered\")\n```",
    ]);
    let (engine, env) = make_engine(transport);

    let outcome = engine
        .query(&env, "divide", QueryOpts::default())
        .await
        .expect("query");

    assert_eq!(outcome.status, LoopStatus::Final);
    assert_eq!(outcome.answer, json!("recovered"));
    let first_turn = &outcome.trace[0];
    assert!(first_turn.executions[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("division by zero")));
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn query_history_is_recorded_in_the_store() {
    let transport = ScriptedTransport::new(vec!["Done.\n```\n(FINAL 1)\n```"]);
    let (engine, env) = make_engine(transport);

    engine
        .query(&env, "record me", QueryOpts::default())
        .await
        .expect("query");

    let stats = env.store().history_stats();
    // One user message and one assistant message, at minimum.
    assert!(stats.by_role.get("user").copied().unwrap_or(0) >= 1);
    assert!(stats.by_role.get("assistant").copied().unwrap_or(0) >= 1);
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_transport_failures_are_retried() {
    let transport = FlakyTransport::new(2, "ok\n```\n(FINAL \"after retries\")\n```");
    let (engine, env) = make_engine(transport.clone());

    let outcome = engine
        .query(&env, "flaky?", QueryOpts::default())
        .await
        .expect("query");

    assert_eq!(outcome.answer, json!("after retries"));
    assert_eq!(transport.attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn schema_coercion_re_asks_once_with_hint() {
    let transport = ScriptedTransport::new(vec![
        // First reply misses the required key entirely.
        r#"{"wrong": true}"#,
        r#"{"insight": "always check the dates"}"#,
    ]);
    let client = make_client(transport.clone());

    let response = client
        .ask(
            AskRequest::new("gpt-4o", vec![ChatMessage::user("extract an insight")])
                .with_spec(straylight::client::OutputSpec::with_keys(&["insight"])),
        )
        .await
        .expect("coerced on second try");

    assert_eq!(response.value["insight"], json!("always check the dates"));
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn schema_coercion_gives_up_after_the_hint() {
    let transport = ScriptedTransport::new(vec![r#"{"wrong": 1}"#, r#"{"still-wrong": 2}"#]);
    let client = make_client(transport);

    let err = client
        .ask(
            AskRequest::new("gpt-4o", vec![ChatMessage::user("extract")])
                .with_spec(straylight::client::OutputSpec::with_keys(&["insight"])),
        )
        .await
        .expect_err("schema failure");
    assert!(err.to_string().contains("did not match schema"));
}

#[tokio::test(flavor = "multi_thread")]
async fn sub_query_recursion_is_depth_guarded() {
    // The outer query immediately asks a sub-query; the sub-query (same
    // scripted reply) would recurse again, so the depth cap must cut it
    // off without further model calls.
    let transport = ScriptedTransport::new(vec![
        "Asking a sub-question.\n```\n(def sub (rlm-query \"inner\"))\n(FINAL-VAR sub)\n```",
    ]);
    let (engine, env) = make_engine(transport.clone());

    let mut opts = QueryOpts::default();
    opts.max_iterations = Some(2);
    let outcome = engine.query(&env, "outer", opts).await.expect("query");

    // The chain bottoms out with the recursion-limit error value.
    let rendered = outcome.answer.to_string();
    assert!(rendered.contains("max recursion depth"), "got {rendered}");
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn disposable_environment_cleans_up_on_dispose() {
    let transport = ScriptedTransport::new(vec!["unused"]);
    let config = std::sync::Arc::new(straylight::config::StraylightConfig::default());
    let engine = straylight::engine::KnowledgeEngine::new(make_client(transport), config);

    let env = engine.create_env(StoreTarget::Disposable).expect("env");
    let path = env.store().base_path().to_path_buf();
    assert!(path.exists());
    engine.dispose_env(env).expect("dispose");
    assert!(!path.exists());
}

//! Cascade behaviour of the tolerant parser.

use serde_json::{json, Value};

use straylight::jsonish::{normalise_keys, parse, parse_typed, JsonishError};

#[test]
fn strict_round_trip_preserves_value_and_reports_no_warnings() {
    let cases = [
        r#"{"a": 1, "b": [true, null], "c": {"d": "e"}}"#,
        r#"[1, 2.5, "three"]"#,
        r#""just a string""#,
        "42",
    ];
    for case in cases {
        let parsed = parse(case).expect("strict parse");
        assert_eq!(parsed.score, 100, "case {case}");
        assert!(parsed.warnings.is_empty(), "case {case}");
        let strict: Value = serde_json::from_str(case).expect("serde parse");
        assert_eq!(parsed.value, normalise_keys(strict), "case {case}");
    }
}

#[test]
fn keys_are_normalised_snake_to_kebab_recursively() {
    let parsed = parse(r#"{"outer_key": {"inner_key": [{"deep_key": 1}]}}"#).expect("parse");
    assert_eq!(
        parsed.value,
        json!({"outer-key": {"inner-key": [{"deep-key": 1}]}})
    );
}

#[test]
fn fenced_block_beats_fixing_parser() {
    let input = "Sure! Here is the data:\n```json\n{\"answer\": 4}\n```";
    let parsed = parse(input).expect("parse");
    assert_eq!(parsed.score, 90);
    assert_eq!(parsed.value["answer"], 4);
}

#[test]
fn fenced_block_without_language_tag_works() {
    let input = "```\n[1, 2, 3]\n```";
    let parsed = parse(input).expect("parse");
    assert_eq!(parsed.score, 90);
    assert_eq!(parsed.value, json!([1, 2, 3]));
}

#[test]
fn balanced_span_is_pulled_out_of_narrative() {
    let input = "After careful thought, the verdict is {\"pass\": true, \"score\": 0.9} overall.";
    let parsed = parse(input).expect("parse");
    assert!((70..=80).contains(&parsed.score));
    assert_eq!(parsed.value["pass"], json!(true));
    assert_eq!(parsed.warnings.len(), 1);
}

#[test]
fn fixing_parser_recovers_sloppy_json_and_logs_each_fix() {
    let parsed = parse("{status: 'ok', retries: 3, flags: [True, False,], note: None}")
        .expect("parse");
    assert!((10..=50).contains(&parsed.score));
    assert_eq!(
        parsed.value,
        json!({"status": "ok", "retries": 3, "flags": [true, false], "note": null})
    );
    assert!(!parsed.warnings.is_empty());
}

#[test]
fn raw_fallback_never_loses_the_input() {
    let input = "The contract does not specify a notice period.";
    let parsed = parse(input).expect("parse");
    assert_eq!(parsed.score, 0);
    assert_eq!(parsed.value, Value::String(input.to_owned()));
}

#[test]
fn empty_and_blank_inputs_error() {
    assert!(matches!(parse(""), Err(JsonishError::EmptyInput)));
    assert!(matches!(parse("  \n\t "), Err(JsonishError::EmptyInput)));
}

#[test]
fn parse_typed_deserialises_through_kebab_keys() {
    #[derive(serde::Deserialize)]
    #[serde(rename_all = "kebab-case")]
    struct Verdict {
        overall_score: f64,
        correct: bool,
    }

    // Model replied with snake_case keys; normalisation bridges them.
    let verdict: Verdict = parse_typed("{\"overall_score\": 0.85, \"correct\": true}")
        .expect("parse")
        .expect("deserialise");
    assert!((verdict.overall_score - 0.85).abs() < 1e-9);
    assert!(verdict.correct);
}

#[test]
fn score_orders_strategies() {
    let strict = parse(r#"{"a": 1}"#).expect("parse").score;
    let fenced = parse("```\n{\"a\": 1}\n```").expect("parse").score;
    let span = parse("text {\"a\": 1} text").expect("parse").score;
    let fixed = parse("{a: 1}").expect("parse").score;
    let raw = parse("nothing here").expect("parse").score;
    assert!(strict > fenced && fenced > span && span > fixed && fixed > raw);
}

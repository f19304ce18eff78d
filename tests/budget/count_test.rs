//! Counting, pricing and context checks.

use std::sync::Arc;

use straylight::budget::{CheckOpts, StaticProbe, TokenBudgeter};
use straylight::providers::{
    ChatMessage, ContentPart, ImageDetail, ImageRef, MessageContent,
};
use straylight::types::Role;

const MODEL: &str = "gpt-4o";

fn budgeter_with(dims: Option<(u32, u32)>) -> TokenBudgeter {
    TokenBudgeter::with_probe(Arc::new(StaticProbe(dims)))
}

fn image_message(detail: Option<ImageDetail>) -> ChatMessage {
    ChatMessage {
        role: Role::User,
        content: MessageContent::Parts(vec![
            ContentPart::Text {
                text: "what does this show".to_owned(),
            },
            ContentPart::ImageUrl {
                image_url: ImageRef {
                    url: "https://example.org/figure.png".to_owned(),
                    detail,
                },
            },
        ]),
    }
}

#[test]
fn count_text_is_stable_and_nonzero() {
    let budgeter = budgeter_with(None);
    let count = budgeter.count_text(MODEL, "The quick brown fox jumps over the lazy dog.");
    assert!(count > 0);
    assert_eq!(
        count,
        budgeter.count_text(MODEL, "The quick brown fox jumps over the lazy dog.")
    );
}

#[test]
fn unknown_models_still_count() {
    let budgeter = budgeter_with(None);
    assert!(budgeter.count_text("some-model-nobody-knows", "hello world") > 0);
}

#[tokio::test]
async fn count_and_estimate_is_the_sum_of_its_parts() {
    let budgeter = budgeter_with(None);
    let messages = vec![
        ChatMessage::system("You are helpful."),
        ChatMessage::user("Summarise the payment terms."),
    ];
    let output = "Invoices are payable net thirty days.";

    let combined = budgeter.count_and_estimate(MODEL, &messages, output).await;
    let separate = budgeter.count_messages(MODEL, &messages).await
        + budgeter.count_text(MODEL, output);
    assert_eq!(combined, separate);
}

#[tokio::test]
async fn low_detail_images_cost_a_flat_85() {
    let budgeter = budgeter_with(Some((4096, 4096)));
    let with_image = budgeter
        .count_messages(MODEL, &[image_message(Some(ImageDetail::Low))])
        .await;
    let text_only = budgeter
        .count_messages(
            MODEL,
            &[ChatMessage::user("what does this show")],
        )
        .await;
    assert_eq!(with_image.saturating_sub(text_only), 85);
}

#[tokio::test]
async fn full_detail_images_are_billed_by_tiles() {
    // 512x512 -> a single tile: 170 + 85.
    let budgeter = budgeter_with(Some((512, 512)));
    let single_tile = budgeter
        .count_messages(MODEL, &[image_message(None)])
        .await;

    // 4096x4096 -> scaled to 768x768 -> 2x2 tiles: 170*4 + 85.
    let budgeter = budgeter_with(Some((4096, 4096)));
    let four_tiles = budgeter
        .count_messages(MODEL, &[image_message(None)])
        .await;

    assert_eq!(four_tiles.saturating_sub(single_tile), 170 * 3);
}

#[tokio::test]
async fn unknown_dimensions_fall_back_to_765() {
    let budgeter = budgeter_with(None);
    let with_image = budgeter
        .count_messages(MODEL, &[image_message(None)])
        .await;
    let text_only = budgeter
        .count_messages(
            MODEL,
            &[ChatMessage::user("what does this show")],
        )
        .await;
    assert_eq!(with_image.saturating_sub(text_only), 765);
}

#[test]
fn cost_estimate_has_consistent_total() {
    let budgeter = budgeter_with(None);
    let cost = budgeter.estimate_cost(MODEL, 123_456, 7_890);
    assert!(cost.input > 0.0);
    assert!(cost.output > 0.0);
    assert!((cost.total - (cost.input + cost.output)).abs() < 1e-12);
}

#[test]
fn context_limits_differ_by_model_family() {
    let budgeter = budgeter_with(None);
    assert_eq!(budgeter.context_limit("gpt-4o"), 128_000);
    assert_eq!(budgeter.context_limit("anthropic/claude-3-5-sonnet"), 200_000);
    assert_eq!(budgeter.context_limit("weird-model"), 8_192);
    assert_eq!(budgeter.max_input_tokens("gpt-4o", 28_000), 100_000);
}

#[tokio::test]
async fn context_check_reports_overflow_as_data() {
    let budgeter = budgeter_with(None);
    let big = "lorem ipsum ".repeat(4_000);
    let messages = vec![ChatMessage::user(big)];

    // "gpt-4" has an 8k window; ~12k tokens overflow it.
    let check = budgeter
        .check_context_limit("gpt-4", &messages, CheckOpts::default())
        .await
        .expect("data, not error");
    assert!(!check.ok);
    assert!(check.overflow > 0);
    assert!(check.error.is_some());
}

#[tokio::test]
async fn context_check_throws_when_asked() {
    let budgeter = budgeter_with(None);
    let big = "lorem ipsum ".repeat(4_000);
    let messages = vec![ChatMessage::user(big)];

    let err = budgeter
        .check_context_limit(
            "gpt-4",
            &messages,
            CheckOpts {
                reserve_output: 0,
                throw: true,
            },
        )
        .await
        .expect_err("must throw");
    let message = err.to_string();
    assert!(message.contains("context overflow"));
    assert!(message.contains("8192"));
}

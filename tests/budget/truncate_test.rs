//! Token-aware truncation of text and conversations.

use straylight::budget::{TokenBudgeter, TruncateFrom, TruncateOpts};
use straylight::providers::ChatMessage;
use straylight::types::Role;

const MODEL: &str = "gpt-4o";

#[test]
fn short_text_is_returned_unchanged() {
    let budgeter = TokenBudgeter::new();
    let text = "already short";
    assert_eq!(
        budgeter.truncate_text(MODEL, text, 100, &TruncateOpts::default()),
        text
    );
}

#[test]
fn truncated_text_fits_the_budget() {
    let budgeter = TokenBudgeter::new();
    let text = "All work and no play makes Jack a dull boy. ".repeat(200);
    for max in [10u32, 50, 200] {
        let cut = budgeter.truncate_text(MODEL, &text, max, &TruncateOpts::default());
        assert!(
            budgeter.count_text(MODEL, &cut) <= max,
            "budget {max} exceeded"
        );
    }
}

#[test]
fn marker_lands_on_the_cut_side() {
    let budgeter = TokenBudgeter::new();
    let text = "word ".repeat(500);

    let tail_cut = budgeter.truncate_text(
        MODEL,
        &text,
        50,
        &TruncateOpts {
            from: TruncateFrom::End,
            marker: Some("[...]".to_owned()),
        },
    );
    assert!(tail_cut.ends_with("[...]"));
    assert!(budgeter.count_text(MODEL, &tail_cut) <= 50);

    let head_cut = budgeter.truncate_text(
        MODEL,
        &text,
        50,
        &TruncateOpts {
            from: TruncateFrom::Start,
            marker: Some("[...]".to_owned()),
        },
    );
    assert!(head_cut.starts_with("[...]"));
    assert!(budgeter.count_text(MODEL, &head_cut) <= 50);
}

#[tokio::test]
async fn truncate_messages_preserves_system_and_last_user() {
    let budgeter = TokenBudgeter::new();

    // A system prompt, ten middling turns, and a final user message.
    let mut messages = vec![ChatMessage::system(
        "You answer questions about contracts concisely and accurately.",
    )];
    for i in 0..5 {
        messages.push(ChatMessage::user(format!(
            "Question {i}: what does section {i} say about liability and indemnification?"
        )));
        messages.push(ChatMessage::assistant(format!(
            "Answer {i}: section {i} limits liability to direct damages and requires notice."
        )));
    }
    messages.push(ChatMessage::user(
        "Final question: summarise the termination rights across all sections.",
    ));

    let total = budgeter.count_messages(MODEL, &messages).await;
    assert!(total > 300, "fixture should overflow the budget");

    let trimmed = budgeter.truncate_messages(MODEL, &messages, 300).await;
    assert!(budgeter.count_messages(MODEL, &trimmed).await <= 300);

    let first = trimmed.first().expect("non-empty");
    assert_eq!(first.role, Role::System);
    let last = trimmed.last().expect("non-empty");
    assert_eq!(last.role, Role::User);
    assert!(last.content.text().contains("Final question"));
    assert!(trimmed.len() < messages.len());
}

#[tokio::test]
async fn truncate_messages_is_identity_under_budget() {
    let budgeter = TokenBudgeter::new();
    let messages = vec![
        ChatMessage::system("short"),
        ChatMessage::user("also short"),
    ];
    let trimmed = budgeter.truncate_messages(MODEL, &messages, 10_000).await;
    assert_eq!(trimmed.len(), messages.len());
}

#[tokio::test]
async fn middle_is_dropped_oldest_first() {
    let budgeter = TokenBudgeter::new();
    let mut messages = vec![ChatMessage::system("sys")];
    for i in 0..6 {
        messages.push(ChatMessage::assistant(format!(
            "turn {i}: some moderately long filler content for the conversation history"
        )));
    }
    messages.push(ChatMessage::user("last"));

    let full = budgeter.count_messages(MODEL, &messages).await;
    let trimmed = budgeter
        .truncate_messages(MODEL, &messages, full.saturating_sub(20))
        .await;

    // The oldest middle turn goes first.
    let texts: Vec<String> = trimmed.iter().map(|m| m.content.text()).collect();
    assert!(!texts.iter().any(|t| t.starts_with("turn 0")));
    assert!(texts.iter().any(|t| t.starts_with("turn 5")));
}

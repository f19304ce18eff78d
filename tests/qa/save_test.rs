//! Saving assembled results: JSON, Markdown, and the images/ directory.

use std::collections::BTreeMap;

use base64::Engine as _;
use uuid::Uuid;

use straylight::qa::save::{save_qa, SaveFormat};
use straylight::qa::{Category, Difficulty, QaQuestion, QaResult, QaStats, QaStatus, QuestionState};
use straylight::store::KnowledgeStore;
use straylight::types::{BBox, PageNode};

fn question_on(doc: &str, page: u32, section: &str) -> QaQuestion {
    QaQuestion {
        id: Uuid::new_v4(),
        question: "When are invoices due?".to_owned(),
        answer: "Net thirty days.".to_owned(),
        difficulty: Difficulty::Remember,
        category: Category::Factual,
        source_document: doc.to_owned(),
        source_page: page,
        section_title: section.to_owned(),
        evidence_span: "net thirty (30) days".to_owned(),
        passage_index: 0,
        state: QuestionState::VerifiedPass,
        revision_note: None,
    }
}

fn result_with(questions: Vec<QaQuestion>) -> QaResult {
    let final_count = questions.len();
    QaResult {
        questions,
        dropped_questions: Vec::new(),
        stats: QaStats {
            total_generated: final_count,
            passed_verification: final_count,
            duplicates_removed: 0,
            final_count,
            by_difficulty: BTreeMap::new(),
            by_category: BTreeMap::new(),
        },
        status: QaStatus::Complete,
    }
}

#[test]
fn json_round_trips_through_the_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = dir.path().join("dataset");
    let result = result_with(vec![question_on("contract-a", 0, "Payment")]);

    save_qa(&result, &base, &[SaveFormat::Json], None).expect("save");

    let loaded: QaResult = serde_json::from_str(
        &std::fs::read_to_string(base.with_extension("json")).expect("read"),
    )
    .expect("parse");
    assert_eq!(loaded.questions.len(), 1);
    assert_eq!(loaded.questions[0].source_document, "contract-a");
    assert_eq!(loaded.status, QaStatus::Complete);
}

#[test]
fn markdown_contains_citation_and_evidence() {
    let dir = tempfile::tempdir().expect("tempdir");
    let base = dir.path().join("dataset");
    let result = result_with(vec![
        question_on("contract-a", 0, "Payment"),
        question_on("contract-b", 3, "Delivery"),
    ]);

    save_qa(&result, &base, &[SaveFormat::Markdown], None).expect("save");
    let rendered = std::fs::read_to_string(base.with_extension("md")).expect("read");

    assert!(rendered.contains("## contract-a"));
    assert!(rendered.contains("## contract-b"));
    assert!(rendered.contains("### Payment"));
    assert!(rendered.contains("citation: contract-b p3"));
    assert!(rendered.contains("> net thirty (30) days"));
}

#[test]
fn images_from_cited_pages_land_in_a_sibling_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = KnowledgeStore::create_disposable().expect("store");
    store.append_page_nodes(
        "contract-a",
        0,
        vec![PageNode::Image {
            id: "fig-1".to_owned(),
            parent_id: None,
            kind: "figure".to_owned(),
            bbox: BBox {
                xmin: 0,
                ymin: 0,
                xmax: 10,
                ymax: 10,
            },
            caption: None,
            description: "payment schedule chart".to_owned(),
            image_bytes: Some(
                base64::engine::general_purpose::STANDARD.encode([0x89, 0x50, 0x4E, 0x47]),
            ),
            continuation: false,
        }],
    );

    let base = dir.path().join("dataset");
    let result = result_with(vec![question_on("contract-a", 0, "Payment")]);
    save_qa(
        &result,
        &base,
        &[SaveFormat::Markdown],
        Some(&store),
    )
    .expect("save");

    let image_path = dir.path().join("images").join("fig-1.png");
    assert!(image_path.exists());

    // Markdown links the image with a relative path.
    let rendered = std::fs::read_to_string(base.with_extension("md")).expect("read");
    assert!(rendered.contains("(images/fig-1.png)"));

    store.dispose().expect("dispose");
}

#[test]
fn uncited_pages_contribute_no_images() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = KnowledgeStore::create_disposable().expect("store");
    store.append_page_nodes(
        "contract-a",
        7,
        vec![PageNode::Image {
            id: "fig-unrelated".to_owned(),
            parent_id: None,
            kind: "figure".to_owned(),
            bbox: BBox {
                xmin: 0,
                ymin: 0,
                xmax: 10,
                ymax: 10,
            },
            caption: None,
            description: "unrelated".to_owned(),
            image_bytes: Some(base64::engine::general_purpose::STANDARD.encode([1, 2, 3])),
            continuation: false,
        }],
    );

    let base = dir.path().join("dataset");
    // The only accepted question cites page 0, not page 7.
    let result = result_with(vec![question_on("contract-a", 0, "Payment")]);
    save_qa(&result, &base, &[SaveFormat::Markdown], Some(&store)).expect("save");

    assert!(!dir.path().join("images").join("fig-unrelated.png").exists());
    store.dispose().expect("dispose");
}

//! Ingestion: integrity fixes, reports, entity extraction, vision rescan.

use std::sync::Arc;

use async_trait::async_trait;

use straylight::engine::{IngestOptions, VisionBackend};
use straylight::store::{EntityFilter, NodeFilter};
use straylight::types::{BBox, Document, Page, PageNode, ParagraphKind};

use crate::common::{fixture_document, make_engine, ScriptedTransport};

#[tokio::test(flavor = "multi_thread")]
async fn plain_ingest_reports_counts() {
    let transport = ScriptedTransport::new(vec!["unused"]);
    let (engine, env) = make_engine(transport.clone());

    let reports = engine
        .ingest(&env, vec![fixture_document()], IngestOptions::default())
        .await
        .expect("ingest");

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].document_id, "contract-a");
    assert_eq!(reports[0].nodes_stored, 5);
    assert_eq!(reports[0].toc_entries_stored, 2);
    assert_eq!(reports[0].extraction_errors, 0);
    // No extraction requested: the model was never consulted.
    assert_eq!(transport.call_count(), 0);

    // Parent integrity holds for everything stored.
    for stored in env.store().list_page_nodes(&NodeFilter::default()) {
        if let Some(parent) = stored.node.parent_id() {
            let parent_node = env.store().get_page_node(parent).expect("parent exists");
            assert!(parent_node.node.is_section());
        }
    }
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn dangling_parents_are_cleared_during_ingest() {
    let transport = ScriptedTransport::new(vec!["unused"]);
    let (engine, env) = make_engine(transport);

    let doc = Document {
        id: "doc-x".to_owned(),
        pages: vec![Page {
            index: 0,
            nodes: vec![PageNode::Paragraph {
                id: "orphan".to_owned(),
                parent_id: Some("no-such-section".to_owned()),
                level: ParagraphKind::Paragraph,
                content: "text".to_owned(),
                continuation: false,
            }],
        }],
        toc: Vec::new(),
    };
    engine
        .ingest(&env, vec![doc], IngestOptions::default())
        .await
        .expect("ingest");

    let stored = env.store().get_page_node("orphan").expect("stored");
    assert_eq!(stored.node.parent_id(), None);
    engine.dispose_env(env).expect("dispose");
}

/// Base64 of a minimal PNG header declaring 100x80 pixels.
fn png_header_base64() -> String {
    use base64::Engine as _;
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    bytes.extend_from_slice(&[0, 0, 0, 13]);
    bytes.extend_from_slice(b"IHDR");
    bytes.extend_from_slice(&100u32.to_be_bytes());
    bytes.extend_from_slice(&80u32.to_be_bytes());
    bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn visual_document() -> Document {
    Document {
        id: "doc-img".to_owned(),
        pages: vec![Page {
            index: 0,
            nodes: vec![PageNode::Image {
                id: "img-1".to_owned(),
                parent_id: None,
                kind: "figure".to_owned(),
                bbox: BBox {
                    xmin: 10,
                    ymin: 10,
                    xmax: 5_000,
                    ymax: 5_000,
                },
                caption: Some("Figure 1".to_owned()),
                description: "original description".to_owned(),
                image_bytes: Some(png_header_base64()),
                continuation: false,
            }],
        }],
        toc: Vec::new(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn bboxes_are_clamped_to_image_dimensions() {
    let transport = ScriptedTransport::new(vec!["unused"]);
    let (engine, env) = make_engine(transport);

    engine
        .ingest(&env, vec![visual_document()], IngestOptions::default())
        .await
        .expect("ingest");

    let stored = env.store().get_page_node("img-1").expect("stored");
    let PageNode::Image { bbox, .. } = stored.node else {
        panic!("expected image node");
    };
    assert!(bbox.xmin < bbox.xmax && bbox.xmax <= 100);
    assert!(bbox.ymin < bbox.ymax && bbox.ymax <= 80);
    engine.dispose_env(env).expect("dispose");
}

struct FixedVision;

#[async_trait]
impl VisionBackend for FixedVision {
    async fn describe_image(&self, _image_base64: &str, _context: &str) -> anyhow::Result<String> {
        Ok("a bar chart of quarterly revenue".to_owned())
    }
}

struct FailingVision;

#[async_trait]
impl VisionBackend for FailingVision {
    async fn describe_image(&self, _image_base64: &str, _context: &str) -> anyhow::Result<String> {
        anyhow::bail!("vision backend unavailable")
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn vision_rescan_replaces_descriptions() {
    let transport = ScriptedTransport::new(vec!["unused"]);
    let config = Arc::new(straylight::config::StraylightConfig::default());
    let engine = straylight::engine::KnowledgeEngine::new(
        crate::common::make_client(transport),
        config,
    )
    .with_vision(Arc::new(FixedVision));
    let env = engine
        .create_env(straylight::engine::StoreTarget::Disposable)
        .expect("env");

    let reports = engine
        .ingest(
            &env,
            vec![visual_document()],
            IngestOptions {
                vision_rescan: true,
                ..IngestOptions::default()
            },
        )
        .await
        .expect("ingest");

    assert_eq!(reports[0].visual_nodes_scanned, 1);
    assert_eq!(reports[0].extraction_errors, 0);
    let stored = env.store().get_page_node("img-1").expect("stored");
    assert_eq!(
        stored.node.description_text(),
        Some("a bar chart of quarterly revenue")
    );
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn vision_failures_are_counted_not_raised() {
    let transport = ScriptedTransport::new(vec!["unused"]);
    let config = Arc::new(straylight::config::StraylightConfig::default());
    let engine = straylight::engine::KnowledgeEngine::new(
        crate::common::make_client(transport),
        config,
    )
    .with_vision(Arc::new(FailingVision));
    let env = engine
        .create_env(straylight::engine::StoreTarget::Disposable)
        .expect("env");

    let reports = engine
        .ingest(
            &env,
            vec![visual_document()],
            IngestOptions {
                vision_rescan: true,
                ..IngestOptions::default()
            },
        )
        .await
        .expect("never throws");

    assert_eq!(reports[0].visual_nodes_scanned, 1);
    assert_eq!(reports[0].extraction_errors, 1);
    // The original description survives.
    let stored = env.store().get_page_node("img-1").expect("stored");
    assert_eq!(stored.node.description_text(), Some("original description"));
    engine.dispose_env(env).expect("dispose");
}

#[tokio::test(flavor = "multi_thread")]
async fn entity_extraction_inserts_in_two_phases() {
    // One extraction reply per page of the fixture document.
    let page0 = r#"{"entities": [
            {"name": "Acme Corp", "type": "organization", "description": "the supplier"},
            {"name": "Payment Obligation", "type": "obligation", "description": "net 30"}
        ],
        "relationships": [
            {"type": "bound-by", "source": "Acme Corp", "target": "Payment Obligation",
             "description": "Acme must pay net 30"},
            {"type": "references", "source": "Acme Corp", "target": "Ghost Entity",
             "description": "endpoint that never resolves"}
        ]}"#;
    let page1 = r#"{"entities": [], "relationships": []}"#;
    let transport = ScriptedTransport::new(vec![page0, page1]);
    let (engine, env) = make_engine(transport);

    let reports = engine
        .ingest(
            &env,
            vec![fixture_document()],
            IngestOptions {
                extract_entities: true,
                ..IngestOptions::default()
            },
        )
        .await
        .expect("ingest");

    assert_eq!(reports[0].entities_extracted, 2);
    let entities = env.store().list_entities(&EntityFilter::default());
    assert_eq!(entities.len(), 2);

    // The resolvable relationship landed; the ghost one was dropped.
    let relationships = env.store().list_relationships(Some("contract-a"));
    assert_eq!(relationships.len(), 1);
    assert_eq!(relationships[0].kind, "bound-by");
    for rel in &relationships {
        assert!(env.store().get_entity(rel.source_entity_id).is_some());
        assert!(env.store().get_entity(rel.target_entity_id).is_some());
    }
    engine.dispose_env(env).expect("dispose");
}

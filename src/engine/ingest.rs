//! Document ingestion: integrity checks, optional vision rescan, optional
//! entity extraction.
//!
//! Ingestion never fails a whole batch because one page misbehaves:
//! per-page extraction failures are counted in the [`IngestReport`] and the
//! rest of the document proceeds. Structural fixes (bbox clamping, dangling
//! parent references) are applied silently with a warning.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::budget::image::parse_dimensions;
use crate::client::{AskRequest, OutputSpec};
use crate::providers::ChatMessage;
use crate::types::{BBox, Document, Entity, EntityKind, PageNode, Relationship};

use super::{EngineError, Environment};

// ---------------------------------------------------------------------------
// Options, report, vision backend
// ---------------------------------------------------------------------------

/// Ingestion options.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Extract entities and relationships from each text page.
    pub extract_entities: bool,
    /// Re-describe visual nodes through the vision backend.
    pub vision_rescan: bool,
    /// Cap on visual nodes rescanned per document; config default when
    /// absent.
    pub max_vision_rescan_nodes: Option<usize>,
    /// Degree of parallelism for the rescan; config default when absent.
    pub vision_parallelism: Option<usize>,
}

/// Per-document ingestion report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IngestReport {
    /// The ingested document.
    pub document_id: String,
    /// Page nodes appended to the store.
    pub nodes_stored: usize,
    /// TOC entries appended to the store.
    pub toc_entries_stored: usize,
    /// Entities inserted by extraction.
    pub entities_extracted: usize,
    /// Visual nodes sent through the vision backend.
    pub visual_nodes_scanned: usize,
    /// Per-page failures counted (never raised).
    pub extraction_errors: usize,
}

/// External vision collaborator: turns image bytes into a description.
#[async_trait]
pub trait VisionBackend: Send + Sync {
    /// Describe an image (base64 bytes) given surrounding context.
    async fn describe_image(&self, image_base64: &str, context: &str) -> anyhow::Result<String>;
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Ingest documents into the environment's store.
///
/// # Errors
///
/// Returns [`EngineError::Store`] on store faults only; page-level
/// extraction failures are counted, never raised.
pub(crate) async fn ingest(
    env: &Environment,
    vision: Option<&std::sync::Arc<dyn VisionBackend>>,
    docs: Vec<Document>,
    opts: IngestOptions,
) -> Result<Vec<IngestReport>, EngineError> {
    let mut reports = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let mut report = IngestReport {
            document_id: doc.id.clone(),
            ..IngestReport::default()
        };

        normalise_document(&mut doc);

        if opts.vision_rescan {
            if let Some(backend) = vision {
                rescan_visual_nodes(env, backend, &mut doc, &opts, &mut report).await;
            }
        }

        for page in &doc.pages {
            env.store()
                .append_page_nodes(&doc.id, page.index, page.nodes.clone());
            report.nodes_stored = report.nodes_stored.saturating_add(page.nodes.len());
        }
        env.store().append_toc_entries(&doc.id, doc.toc.clone());
        report.toc_entries_stored = doc.toc.len();

        if opts.extract_entities {
            extract_entities(env, &doc, &mut report).await;
        }

        debug!(document_id = %doc.id, ?report, "document ingested");
        reports.push(report);
    }
    Ok(reports)
}

/// Structural fixes applied before storage: bbox clamping against the
/// node's own image dimensions, and dangling parent references cleared.
fn normalise_document(doc: &mut Document) {
    let section_ids: HashSet<String> = doc
        .pages
        .iter()
        .flat_map(|p| p.nodes.iter())
        .filter(|n| n.is_section())
        .map(|n| n.id().to_owned())
        .collect();

    for page in &mut doc.pages {
        for node in &mut page.nodes {
            if let Some(parent) = node.parent_id() {
                if !section_ids.contains(parent) {
                    warn!(node = node.id(), parent, "dangling parent reference cleared");
                    node.clear_parent();
                }
            }
            clamp_node_bbox(node);
        }
    }
}

fn clamp_node_bbox(node: &mut PageNode) {
    let dims = node.image_bytes().and_then(decoded_dimensions);
    let Some((width, height)) = dims else {
        return;
    };
    let bbox = match node {
        PageNode::Image { bbox, .. } | PageNode::Table { bbox, .. } => bbox,
        _ => return,
    };
    *bbox = bbox.clamped(width, height).unwrap_or(BBox {
        xmin: 0,
        ymin: 0,
        xmax: width,
        ymax: height,
    });
}

/// Dimensions from the first few KiB of a base64 image payload.
fn decoded_dimensions(image_base64: &str) -> Option<(u32, u32)> {
    let prefix_len = image_base64.len().min(4096);
    let prefix_len = prefix_len.saturating_sub(prefix_len % 4);
    let prefix = image_base64.get(..prefix_len)?;
    let bytes = base64::engine::general_purpose::STANDARD.decode(prefix).ok()?;
    parse_dimensions(&bytes)
}

// ---------------------------------------------------------------------------
// Vision rescan
// ---------------------------------------------------------------------------

/// Replace visual-node descriptions with vision output, bounded and
/// parallel. Failures are counted, never raised.
async fn rescan_visual_nodes(
    env: &Environment,
    backend: &std::sync::Arc<dyn VisionBackend>,
    doc: &mut Document,
    opts: &IngestOptions,
    report: &mut IngestReport,
) {
    let cap = opts
        .max_vision_rescan_nodes
        .unwrap_or(env.config().limits.max_vision_rescan_nodes);
    let parallelism = opts
        .vision_parallelism
        .unwrap_or(env.config().limits.vision_parallelism)
        .max(1);

    // (page index, node index, bytes, context) for every candidate.
    let mut candidates: Vec<(usize, usize, String, String)> = Vec::new();
    for (pi, page) in doc.pages.iter().enumerate() {
        for (ni, node) in page.nodes.iter().enumerate() {
            if let Some(bytes) = node.image_bytes() {
                let context = match node {
                    PageNode::Image { caption, description, .. }
                    | PageNode::Table { caption, description, .. } => {
                        format!("{} {}", caption.clone().unwrap_or_default(), description)
                    }
                    _ => continue,
                };
                candidates.push((pi, ni, bytes.to_owned(), context));
                if candidates.len() >= cap {
                    break;
                }
            }
        }
        if candidates.len() >= cap {
            break;
        }
    }

    let mut descriptions: BTreeMap<(usize, usize), String> = BTreeMap::new();
    for chunk in candidates.chunks(parallelism) {
        let mut tasks = tokio::task::JoinSet::new();
        for (pi, ni, bytes, context) in chunk.iter().cloned() {
            let backend = backend.clone();
            tasks.spawn(async move {
                let result = backend.describe_image(&bytes, &context).await;
                (pi, ni, result)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            report.visual_nodes_scanned = report.visual_nodes_scanned.saturating_add(1);
            match joined {
                Ok((pi, ni, Ok(description))) => {
                    descriptions.insert((pi, ni), description);
                }
                Ok((pi, _, Err(e))) => {
                    warn!(page = pi, error = %e, "vision rescan failed for node");
                    report.extraction_errors = report.extraction_errors.saturating_add(1);
                }
                Err(e) => {
                    warn!(error = %e, "vision rescan task panicked");
                    report.extraction_errors = report.extraction_errors.saturating_add(1);
                }
            }
        }
    }

    for ((pi, ni), new_description) in descriptions {
        if let Some(node) = doc.pages.get_mut(pi).and_then(|p| p.nodes.get_mut(ni)) {
            match node {
                PageNode::Image { description, .. } | PageNode::Table { description, .. } => {
                    *description = new_description;
                }
                _ => {}
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entity extraction
// ---------------------------------------------------------------------------

const EXTRACTION_PROMPT: &str = "\
Extract the entities and relationships from the page below. Entity types: \
party, organization, person, obligation, clause, term, date, amount, other. \
Relationships reference entities by exact name. Reply with JSON: \
{\"entities\": [{\"name\": \"...\", \"type\": \"...\", \"description\": \
\"...\", \"section\": \"...\"}], \"relationships\": [{\"type\": \"...\", \
\"source\": \"...\", \"target\": \"...\", \"description\": \"...\"}]}";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ExtractedPage {
    #[serde(default)]
    entities: Vec<ExtractedEntity>,
    #[serde(default)]
    relationships: Vec<ExtractedRelationship>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ExtractedEntity {
    name: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    section: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ExtractedRelationship {
    #[serde(default, rename = "type")]
    kind: String,
    source: String,
    target: String,
    #[serde(default)]
    description: String,
}

/// Page-by-page extraction, then a two-phase insert: entities first
/// (building a name → id map), then relationships with resolved endpoints.
async fn extract_entities(env: &Environment, doc: &Document, report: &mut IngestReport) {
    let model = env.config().models.default.clone();
    let mut extracted: Vec<(u32, ExtractedPage)> = Vec::new();

    for page in &doc.pages {
        let text = page_text(page);
        if text.trim().is_empty() {
            continue;
        }
        let prompt = format!("{EXTRACTION_PROMPT}\n\n## Page {}\n{text}", page.index);
        let request = AskRequest::new(model.clone(), vec![ChatMessage::user(prompt)])
            .with_spec(OutputSpec::with_keys(&["entities"]));

        match env.client().ask(request).await {
            Ok(response) => match serde_json::from_value::<ExtractedPage>(response.value) {
                Ok(page_result) => extracted.push((page.index, page_result)),
                Err(e) => {
                    warn!(page = page.index, error = %e, "entity payload did not deserialise");
                    report.extraction_errors = report.extraction_errors.saturating_add(1);
                }
            },
            Err(e) => {
                warn!(page = page.index, error = %e, "entity extraction failed for page");
                report.extraction_errors = report.extraction_errors.saturating_add(1);
            }
        }
    }

    // Phase 1: entities, deduplicated by name within the document.
    let mut name_to_id: BTreeMap<String, Uuid> = BTreeMap::new();
    for (page_index, page_result) in &extracted {
        for entity in &page_result.entities {
            let key = entity.name.trim().to_lowercase();
            if key.is_empty() || name_to_id.contains_key(&key) {
                continue;
            }
            let record = Entity {
                id: Uuid::new_v4(),
                name: entity.name.trim().to_owned(),
                kind: EntityKind::parse(&entity.kind),
                description: entity.description.clone(),
                document_id: doc.id.clone(),
                page: Some(*page_index),
                section: entity.section.clone(),
                created_at: Utc::now(),
                extensions: serde_json::Map::new(),
            };
            name_to_id.insert(key, record.id);
            env.store().append_entity(record);
            report.entities_extracted = report.entities_extracted.saturating_add(1);
        }
    }

    // Phase 2: relationships with resolved endpoints; unresolvable ones
    // are dropped with a warning.
    for (_, page_result) in &extracted {
        for rel in &page_result.relationships {
            let source = name_to_id.get(&rel.source.trim().to_lowercase());
            let target = name_to_id.get(&rel.target.trim().to_lowercase());
            let (Some(&source), Some(&target)) = (source, target) else {
                warn!(
                    source = %rel.source,
                    target = %rel.target,
                    "relationship endpoint did not resolve, dropping"
                );
                continue;
            };
            let record = Relationship {
                id: Uuid::new_v4(),
                kind: rel.kind.clone(),
                source_entity_id: source,
                target_entity_id: target,
                description: rel.description.clone(),
                document_id: doc.id.clone(),
                created_at: Utc::now(),
            };
            if let Err(e) = env.store().append_relationship(record) {
                warn!(error = %e, "relationship insert failed");
            }
        }
    }
}

/// Concatenated searchable text of a page.
fn page_text(page: &crate::types::Page) -> String {
    page.nodes
        .iter()
        .filter_map(PageNode::content_text)
        .collect::<Vec<_>>()
        .join("\n")
}

//! Serialisation of assembled QA results.
//!
//! `save_qa` writes `<base>.json` (the assembled structure, verbatim) and
//! `<base>.md` (grouped by source document, then section). Visual nodes on
//! the pages cited by accepted questions are decoded into a sibling
//! `images/` directory and linked relatively from the Markdown.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use base64::Engine;
use tracing::{info, warn};

use crate::store::{KnowledgeStore, NodeFilter};

use super::{QaQuestion, QaResult};

/// Output formats for [`save_qa`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    /// The assembled structure as pretty-printed JSON.
    Json,
    /// Human-readable Markdown grouped by document and section.
    Markdown,
}

impl SaveFormat {
    /// Parse a format label (`"json"`, `"markdown"`, `"md"`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "markdown" | "md" => Some(Self::Markdown),
            _ => None,
        }
    }
}

/// Errors while writing result files.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// Filesystem failure.
    #[error("failed to write {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Serialisation failure.
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Write the result in the requested formats next to `base_path` (the path
/// without extension). Returns every file written.
///
/// When a store is given, images on cited pages are extracted into
/// `<base dir>/images/` and the Markdown links them relatively.
///
/// # Errors
///
/// Returns [`SaveError`] on the first write or encode failure.
pub fn save_qa(
    result: &QaResult,
    base_path: &Path,
    formats: &[SaveFormat],
    store: Option<&KnowledgeStore>,
) -> Result<Vec<PathBuf>, SaveError> {
    let mut written = Vec::new();
    if let Some(parent) = base_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| SaveError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }

    // Images first so Markdown can link what actually exists.
    let images = match store {
        Some(store) => extract_images(result, base_path, store)?,
        None => BTreeMap::new(),
    };

    for format in formats {
        match format {
            SaveFormat::Json => {
                let path = base_path.with_extension("json");
                let payload = serde_json::to_vec_pretty(result)?;
                std::fs::write(&path, payload).map_err(|source| SaveError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                written.push(path);
            }
            SaveFormat::Markdown => {
                let path = base_path.with_extension("md");
                let rendered = render_markdown(result, &images);
                std::fs::write(&path, rendered).map_err(|source| SaveError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                written.push(path);
            }
        }
    }

    info!(files = written.len(), base = %base_path.display(), "qa result saved");
    Ok(written)
}

/// Decode visual nodes on cited pages into `images/`. Returns
/// `(document, page) -> relative image paths` for Markdown linking.
fn extract_images(
    result: &QaResult,
    base_path: &Path,
    store: &KnowledgeStore,
) -> Result<BTreeMap<(String, u32), Vec<String>>, SaveError> {
    let cited_pages: BTreeSet<(String, u32)> = result
        .questions
        .iter()
        .map(|q| (q.source_document.clone(), q.source_page))
        .collect();
    if cited_pages.is_empty() {
        return Ok(BTreeMap::new());
    }

    let images_dir = base_path
        .parent()
        .map_or_else(|| PathBuf::from("images"), |p| p.join("images"));
    let mut links: BTreeMap<(String, u32), Vec<String>> = BTreeMap::new();
    let mut dir_created = false;

    for (document_id, page) in cited_pages {
        let nodes = store.list_page_nodes(&NodeFilter {
            document_id: Some(document_id.clone()),
            page: Some(page),
        });
        for stored in nodes {
            let Some(encoded) = stored.node.image_bytes() else {
                continue;
            };
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
                warn!(node = stored.node.id(), "image bytes are not valid base64, skipping");
                continue;
            };
            if !dir_created {
                std::fs::create_dir_all(&images_dir).map_err(|source| SaveError::Io {
                    path: images_dir.display().to_string(),
                    source,
                })?;
                dir_created = true;
            }
            let file_name = format!("{}.png", stored.node.id());
            let file_path = images_dir.join(&file_name);
            std::fs::write(&file_path, bytes).map_err(|source| SaveError::Io {
                path: file_path.display().to_string(),
                source,
            })?;
            links
                .entry((document_id.clone(), page))
                .or_default()
                .push(format!("images/{file_name}"));
        }
    }
    Ok(links)
}

/// Markdown rendering: document → section → entries.
fn render_markdown(
    result: &QaResult,
    images: &BTreeMap<(String, u32), Vec<String>>,
) -> String {
    // document -> section -> questions, preserving assembly order inside.
    let mut grouped: BTreeMap<&str, BTreeMap<&str, Vec<&QaQuestion>>> = BTreeMap::new();
    for question in &result.questions {
        grouped
            .entry(&question.source_document)
            .or_default()
            .entry(&question.section_title)
            .or_default()
            .push(question);
    }

    let mut out = String::from("# Generated Questions\n\n");
    out.push_str(&format!(
        "{} questions ({} generated, {} duplicates removed, {} dropped)\n\n",
        result.stats.final_count,
        result.stats.total_generated,
        result.stats.duplicates_removed,
        result.dropped_questions.len(),
    ));

    for (document, sections) in grouped {
        out.push_str(&format!("## {document}\n\n"));
        for (section, questions) in sections {
            let title = if section.is_empty() { "(untitled)" } else { section };
            out.push_str(&format!("### {title}\n\n"));
            for question in questions {
                out.push_str(&format!("**Q: {}**\n\n", question.question));
                out.push_str(&format!("A: {}\n\n", question.answer));
                out.push_str(&format!(
                    "- difficulty: {} | category: {}\n",
                    question.difficulty.as_str(),
                    question.category.as_str()
                ));
                out.push_str(&format!(
                    "- citation: {} p{} — {}\n",
                    question.source_document, question.source_page, title
                ));
                out.push_str(&format!("> {}\n\n", question.evidence_span.replace('\n', " ")));

                let key = (question.source_document.clone(), question.source_page);
                if let Some(links) = images.get(&key) {
                    for link in links {
                        out.push_str(&format!("![{}]({})\n", question.source_document, link));
                    }
                    out.push('\n');
                }
            }
        }
    }
    out
}

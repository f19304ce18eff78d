//! Persistent multi-collection knowledge store.
//!
//! Nine collections (page nodes, TOC entries, entities, relationships,
//! claims, messages, learnings, examples, meta) live as in-memory vectors
//! behind per-collection read/write locks. Mutations mark the collection in
//! a dirty set; [`KnowledgeStore::flush_now`] writes exactly the dirty
//! collections to disk and clears the set. Search is deliberately plain:
//! case-insensitive substring over the text fields, with optional equality
//! filters. No embeddings, no ranking model.
//!
//! Readers never block on file I/O: a flush snapshots each dirty collection
//! under its read lock, releases, and only then touches the filesystem.

pub mod persist;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{
    Claim, Entity, EntityKind, ExampleRecord, Learning, MessageRecord, PageNode, Relationship,
    Role, StoreMeta, StoredPageNode, StoredTocEntry, TocEntry,
};

/// On-disk schema version written to `meta.json`.
const STORE_VERSION: u32 = 1;

/// Cap on good and bad examples returned per retrieval.
const EXAMPLE_RETRIEVAL_CAP: usize = 3;

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

/// The store's collections. Each key maps to one file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    /// Page nodes of ingested documents.
    PageNodes,
    /// Table-of-contents entries.
    TocEntries,
    /// Extracted entities.
    Entities,
    /// Typed edges between entities.
    Relationships,
    /// Cited claims from queries.
    Claims,
    /// Append-only message history.
    Messages,
    /// Insights with vote-based decay.
    Learnings,
    /// Retained query/answer examples.
    Examples,
    /// Store version and creation metadata.
    Meta,
}

impl Collection {
    /// All collections, in flush order.
    pub const ALL: [Self; 9] = [
        Self::PageNodes,
        Self::TocEntries,
        Self::Entities,
        Self::Relationships,
        Self::Claims,
        Self::Messages,
        Self::Learnings,
        Self::Examples,
        Self::Meta,
    ];

    /// File stem of the collection on disk.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PageNodes => "page-nodes",
            Self::TocEntries => "toc-entries",
            Self::Entities => "entities",
            Self::Relationships => "relationships",
            Self::Claims => "claims",
            Self::Messages => "messages",
            Self::Learnings => "learnings",
            Self::Examples => "examples",
            Self::Meta => "meta",
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Filesystem failure while persisting a collection.
    #[error("persistence failure for collection {collection}: {source}")]
    Persistence {
        /// Collection file stem.
        collection: &'static str,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Serialisation failure (should not happen with well-formed records).
    #[error("failed to encode collection {collection}: {source}")]
    Encode {
        /// Collection file stem.
        collection: &'static str,
        /// Underlying serde error.
        source: serde_json::Error,
    },
    /// A collection file exists but does not parse.
    #[error("failed to decode {path}: {source}")]
    Decode {
        /// Offending file path.
        path: String,
        /// Underlying serde error.
        source: serde_json::Error,
    },
    /// A relationship endpoint does not resolve to a stored entity.
    #[error("relationship endpoint {endpoint} does not resolve to an entity")]
    UnresolvedEndpoint {
        /// The offending entity id.
        endpoint: Uuid,
    },
    /// A record id was not found.
    #[error("no {kind} with id {id}")]
    NotFound {
        /// Record kind label.
        kind: &'static str,
        /// The id that was looked up.
        id: String,
    },
}

// ---------------------------------------------------------------------------
// Result / stats types
// ---------------------------------------------------------------------------

/// Per-document summary derived from stored nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DocumentSummary {
    /// Document identifier.
    pub document_id: String,
    /// Page count (highest index plus one).
    pub pages: u32,
    /// Stored node count.
    pub nodes: usize,
    /// Stored TOC entry count.
    pub toc_entries: usize,
}

/// Equality filters for page-node listing and search.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    /// Restrict to one document.
    pub document_id: Option<String>,
    /// Restrict to one page.
    pub page: Option<u32>,
}

/// Equality filters for entity listing and search.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    /// Restrict to one document.
    pub document_id: Option<String>,
    /// Restrict to one entity kind.
    pub kind: Option<EntityKind>,
}

/// Aggregate entity numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EntityStats {
    /// Total entities stored.
    pub total: usize,
    /// Counts per entity kind.
    pub by_kind: BTreeMap<String, usize>,
    /// Total relationships stored.
    pub relationships: usize,
}

/// Aggregate message-history numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HistoryStats {
    /// Total messages stored.
    pub total: usize,
    /// Counts per role.
    pub by_role: BTreeMap<String, usize>,
    /// Sum of counted tokens across messages.
    pub total_tokens: u64,
}

/// Aggregate learning numbers, including vote totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LearningStats {
    /// Total learnings on record.
    pub total: usize,
    /// Learnings still retrievable.
    pub active: usize,
    /// Learnings hidden by decay.
    pub decayed: usize,
    /// Sum of positive votes.
    pub useful_votes: u64,
    /// Sum of negative votes.
    pub not_useful_votes: u64,
    /// Sum of applied counters.
    pub applied: u64,
}

/// Per-collection record counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreStats {
    /// Page nodes stored.
    pub page_nodes: usize,
    /// TOC entries stored.
    pub toc_entries: usize,
    /// Entities stored.
    pub entities: usize,
    /// Relationships stored.
    pub relationships: usize,
    /// Claims stored.
    pub claims: usize,
    /// Messages stored.
    pub messages: usize,
    /// Learnings stored.
    pub learnings: usize,
    /// Examples stored.
    pub examples: usize,
}

// ---------------------------------------------------------------------------
// KnowledgeStore
// ---------------------------------------------------------------------------

/// The persistent store. Shared-read, single-writer-per-collection.
pub struct KnowledgeStore {
    base_path: PathBuf,
    /// Owned stores remove their directory on dispose.
    owned: bool,
    page_nodes: RwLock<Vec<StoredPageNode>>,
    toc_entries: RwLock<Vec<StoredTocEntry>>,
    entities: RwLock<Vec<Entity>>,
    relationships: RwLock<Vec<Relationship>>,
    claims: RwLock<Vec<Claim>>,
    messages: RwLock<Vec<MessageRecord>>,
    learnings: RwLock<Vec<Learning>>,
    examples: RwLock<Vec<ExampleRecord>>,
    meta: RwLock<StoreMeta>,
    dirty: Mutex<BTreeSet<Collection>>,
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeStore")
            .field("base_path", &self.base_path)
            .field("owned", &self.owned)
            .finish_non_exhaustive()
    }
}

impl KnowledgeStore {
    /// Open (or create) a store at a caller-owned path. The directory is
    /// never removed on dispose.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the directory cannot be created or an
    /// existing collection file fails to decode.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::load_at(path.to_path_buf(), false)
    }

    /// Create an owned store on a fresh temporary path, removed on dispose.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Persistence`] when the directory cannot be
    /// created.
    pub fn create_disposable() -> Result<Self, StoreError> {
        let path = std::env::temp_dir().join(format!("straylight-store-{}", Uuid::new_v4()));
        Self::load_at(path, true)
    }

    fn load_at(base_path: PathBuf, owned: bool) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&base_path).map_err(|source| StoreError::Persistence {
            collection: "meta",
            source,
        })?;

        let meta: StoreMeta = persist::load(&base_path, Collection::Meta)?.unwrap_or(StoreMeta {
            version: STORE_VERSION,
            created_at: Utc::now(),
        });

        let store = Self {
            page_nodes: RwLock::new(
                persist::load(&base_path, Collection::PageNodes)?.unwrap_or_default(),
            ),
            toc_entries: RwLock::new(
                persist::load(&base_path, Collection::TocEntries)?.unwrap_or_default(),
            ),
            entities: RwLock::new(
                persist::load(&base_path, Collection::Entities)?.unwrap_or_default(),
            ),
            relationships: RwLock::new(
                persist::load(&base_path, Collection::Relationships)?.unwrap_or_default(),
            ),
            claims: RwLock::new(persist::load(&base_path, Collection::Claims)?.unwrap_or_default()),
            messages: RwLock::new(
                persist::load(&base_path, Collection::Messages)?.unwrap_or_default(),
            ),
            learnings: RwLock::new(
                persist::load(&base_path, Collection::Learnings)?.unwrap_or_default(),
            ),
            examples: RwLock::new(
                persist::load(&base_path, Collection::Examples)?.unwrap_or_default(),
            ),
            meta: RwLock::new(meta),
            dirty: Mutex::new(BTreeSet::new()),
            base_path,
            owned,
        };
        store.mark_dirty(Collection::Meta);
        info!(path = %store.base_path.display(), owned, "knowledge store opened");
        Ok(store)
    }

    /// The store's base directory.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Whether this store owns (and will remove) its directory.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    // -- dirty tracking -----------------------------------------------------

    /// Mark a collection as needing a flush.
    pub fn mark_dirty(&self, collection: Collection) {
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.insert(collection);
        }
    }

    /// Collections currently pending a flush.
    pub fn dirty_set(&self) -> BTreeSet<Collection> {
        self.dirty.lock().map(|d| d.clone()).unwrap_or_default()
    }

    /// Write exactly the dirty collections and clear the set.
    ///
    /// Snapshots are taken under read locks and released before any file
    /// I/O. On failure the unwritten collections are put back into the
    /// dirty set and the error escalates; in-memory state stays valid.
    ///
    /// # Errors
    ///
    /// Returns the first [`StoreError`] encountered while writing.
    pub fn flush_now(&self) -> Result<(), StoreError> {
        let pending: Vec<Collection> = {
            let Ok(mut dirty) = self.dirty.lock() else {
                return Ok(());
            };
            let snapshot: Vec<Collection> = dirty.iter().copied().collect();
            dirty.clear();
            snapshot
        };

        for (index, collection) in pending.iter().enumerate() {
            let result = self.flush_one(*collection);
            if let Err(e) = result {
                // Everything not yet written (this one included) stays dirty.
                if let Ok(mut dirty) = self.dirty.lock() {
                    for c in &pending[index..] {
                        dirty.insert(*c);
                    }
                }
                return Err(e);
            }
        }
        debug!(count = pending.len(), "flush complete");
        Ok(())
    }

    fn flush_one(&self, collection: Collection) -> Result<(), StoreError> {
        match collection {
            Collection::PageNodes => {
                let snapshot = read_clone(&self.page_nodes);
                persist::write_atomic(&self.base_path, collection, &snapshot)
            }
            Collection::TocEntries => {
                let snapshot = read_clone(&self.toc_entries);
                persist::write_atomic(&self.base_path, collection, &snapshot)
            }
            Collection::Entities => {
                let snapshot = read_clone(&self.entities);
                persist::write_atomic(&self.base_path, collection, &snapshot)
            }
            Collection::Relationships => {
                let snapshot = read_clone(&self.relationships);
                persist::write_atomic(&self.base_path, collection, &snapshot)
            }
            Collection::Claims => {
                let snapshot = read_clone(&self.claims);
                persist::write_atomic(&self.base_path, collection, &snapshot)
            }
            Collection::Messages => {
                let snapshot = read_clone(&self.messages);
                persist::write_atomic(&self.base_path, collection, &snapshot)
            }
            Collection::Learnings => {
                let snapshot = read_clone(&self.learnings);
                persist::write_atomic(&self.base_path, collection, &snapshot)
            }
            Collection::Examples => {
                let snapshot = read_clone(&self.examples);
                persist::write_atomic(&self.base_path, collection, &snapshot)
            }
            Collection::Meta => {
                let snapshot = self
                    .meta
                    .read()
                    .map(|m| m.clone())
                    .unwrap_or(StoreMeta {
                        version: STORE_VERSION,
                        created_at: Utc::now(),
                    });
                persist::write_atomic(&self.base_path, collection, &snapshot)
            }
        }
    }

    /// Flush and, for owned stores, remove the backing directory.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] from the final flush or the removal.
    pub fn dispose(self) -> Result<(), StoreError> {
        self.flush_now()?;
        if self.owned {
            std::fs::remove_dir_all(&self.base_path).map_err(|source| {
                StoreError::Persistence {
                    collection: "meta",
                    source,
                }
            })?;
            info!(path = %self.base_path.display(), "disposable store removed");
        }
        Ok(())
    }

    // -- page nodes ---------------------------------------------------------

    /// Append page nodes for one page of a document.
    pub fn append_page_nodes(&self, document_id: &str, page: u32, nodes: Vec<PageNode>) {
        if let Ok(mut stored) = self.page_nodes.write() {
            stored.extend(nodes.into_iter().map(|node| StoredPageNode {
                document_id: document_id.to_owned(),
                page,
                node,
            }));
        }
        self.mark_dirty(Collection::PageNodes);
    }

    /// List page nodes with optional equality filters, in stored order.
    pub fn list_page_nodes(&self, filter: &NodeFilter) -> Vec<StoredPageNode> {
        read_clone(&self.page_nodes)
            .into_iter()
            .filter(|n| {
                filter
                    .document_id
                    .as_deref()
                    .is_none_or(|d| n.document_id == d)
                    && filter.page.is_none_or(|p| n.page == p)
            })
            .collect()
    }

    /// Case-insensitive substring search over node content and description.
    /// A blank query falls back to a plain filtered list.
    pub fn search_page_nodes(&self, query: &str, filter: &NodeFilter) -> Vec<StoredPageNode> {
        let needle = query.trim().to_lowercase();
        let listed = self.list_page_nodes(filter);
        if needle.is_empty() {
            return listed;
        }
        listed
            .into_iter()
            .filter(|n| {
                n.node
                    .content_text()
                    .is_some_and(|t| t.to_lowercase().contains(&needle))
                    || n.node
                        .description_text()
                        .is_some_and(|t| t.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Look up a node by id; first match across documents.
    pub fn get_page_node(&self, id: &str) -> Option<StoredPageNode> {
        self.page_nodes
            .read()
            .ok()
            .and_then(|nodes| nodes.iter().find(|n| n.node.id() == id).cloned())
    }

    /// Summaries of every ingested document.
    pub fn list_documents(&self) -> Vec<DocumentSummary> {
        let nodes = read_clone(&self.page_nodes);
        let tocs = read_clone(&self.toc_entries);
        let mut by_doc: BTreeMap<String, (u32, usize)> = BTreeMap::new();
        for n in &nodes {
            let entry = by_doc.entry(n.document_id.clone()).or_insert((0, 0));
            entry.0 = entry.0.max(n.page.saturating_add(1));
            entry.1 = entry.1.saturating_add(1);
        }
        by_doc
            .into_iter()
            .map(|(document_id, (pages, count))| {
                let toc_entries = tocs
                    .iter()
                    .filter(|t| t.document_id == document_id)
                    .count();
                DocumentSummary {
                    document_id,
                    pages,
                    nodes: count,
                    toc_entries,
                }
            })
            .collect()
    }

    // -- TOC entries --------------------------------------------------------

    /// Append TOC entries for a document.
    pub fn append_toc_entries(&self, document_id: &str, entries: Vec<TocEntry>) {
        if let Ok(mut stored) = self.toc_entries.write() {
            stored.extend(entries.into_iter().map(|entry| StoredTocEntry {
                document_id: document_id.to_owned(),
                entry,
            }));
        }
        self.mark_dirty(Collection::TocEntries);
    }

    /// List TOC entries, optionally for a single document.
    pub fn list_toc_entries(&self, document_id: Option<&str>) -> Vec<StoredTocEntry> {
        read_clone(&self.toc_entries)
            .into_iter()
            .filter(|t| document_id.is_none_or(|d| t.document_id == d))
            .collect()
    }

    /// Substring search over TOC titles and descriptions.
    pub fn search_toc_entries(&self, query: &str, document_id: Option<&str>) -> Vec<StoredTocEntry> {
        let needle = query.trim().to_lowercase();
        let listed = self.list_toc_entries(document_id);
        if needle.is_empty() {
            return listed;
        }
        listed
            .into_iter()
            .filter(|t| {
                t.entry.title.to_lowercase().contains(&needle)
                    || t.entry
                        .description
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
            })
            .collect()
    }

    /// Look up a TOC entry by id.
    pub fn get_toc_entry(&self, id: &str) -> Option<StoredTocEntry> {
        self.toc_entries
            .read()
            .ok()
            .and_then(|entries| entries.iter().find(|t| t.entry.id == id).cloned())
    }

    // -- entities and relationships ------------------------------------------

    /// Append an entity.
    pub fn append_entity(&self, entity: Entity) {
        if let Ok(mut entities) = self.entities.write() {
            entities.push(entity);
        }
        self.mark_dirty(Collection::Entities);
    }

    /// Append a relationship after resolving both endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnresolvedEndpoint`] naming the first endpoint
    /// that does not resolve; nothing is stored in that case.
    pub fn append_relationship(&self, relationship: Relationship) -> Result<(), StoreError> {
        let resolves = |id: Uuid| {
            self.entities
                .read()
                .map(|e| e.iter().any(|entity| entity.id == id))
                .unwrap_or(false)
        };
        if !resolves(relationship.source_entity_id) {
            return Err(StoreError::UnresolvedEndpoint {
                endpoint: relationship.source_entity_id,
            });
        }
        if !resolves(relationship.target_entity_id) {
            return Err(StoreError::UnresolvedEndpoint {
                endpoint: relationship.target_entity_id,
            });
        }
        if let Ok(mut relationships) = self.relationships.write() {
            relationships.push(relationship);
        }
        self.mark_dirty(Collection::Relationships);
        Ok(())
    }

    /// List entities with optional filters.
    pub fn list_entities(&self, filter: &EntityFilter) -> Vec<Entity> {
        read_clone(&self.entities)
            .into_iter()
            .filter(|e| {
                filter
                    .document_id
                    .as_deref()
                    .is_none_or(|d| e.document_id == d)
                    && filter.kind.is_none_or(|k| e.kind == k)
            })
            .collect()
    }

    /// Substring search over entity names and descriptions.
    pub fn search_entities(&self, query: &str, filter: &EntityFilter) -> Vec<Entity> {
        let needle = query.trim().to_lowercase();
        let listed = self.list_entities(filter);
        if needle.is_empty() {
            return listed;
        }
        listed
            .into_iter()
            .filter(|e| {
                e.name.to_lowercase().contains(&needle)
                    || e.description.to_lowercase().contains(&needle)
            })
            .collect()
    }

    /// Look up an entity by id.
    pub fn get_entity(&self, id: Uuid) -> Option<Entity> {
        self.entities
            .read()
            .ok()
            .and_then(|entities| entities.iter().find(|e| e.id == id).cloned())
    }

    /// List relationships, optionally for one document.
    pub fn list_relationships(&self, document_id: Option<&str>) -> Vec<Relationship> {
        read_clone(&self.relationships)
            .into_iter()
            .filter(|r| document_id.is_none_or(|d| r.document_id == d))
            .collect()
    }

    /// Aggregate entity numbers.
    pub fn entity_stats(&self) -> EntityStats {
        let entities = read_clone(&self.entities);
        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        for e in &entities {
            let slot = by_kind.entry(e.kind.as_str().to_owned()).or_insert(0);
            *slot = slot.saturating_add(1);
        }
        EntityStats {
            total: entities.len(),
            by_kind,
            relationships: self.relationships.read().map(|r| r.len()).unwrap_or(0),
        }
    }

    // -- claims ---------------------------------------------------------------

    /// Append a claim. The unverified-confidence invariant is enforced here
    /// as a last line of defence.
    pub fn append_claim(&self, mut claim: Claim) {
        if !claim.verified && claim.confidence > 0.5 {
            claim.confidence = 0.5;
        }
        if let Ok(mut claims) = self.claims.write() {
            claims.push(claim);
        }
        self.mark_dirty(Collection::Claims);
    }

    /// List claims, optionally for one query.
    pub fn list_claims(&self, query_id: Option<&str>) -> Vec<Claim> {
        read_clone(&self.claims)
            .into_iter()
            .filter(|c| query_id.is_none_or(|q| c.query_id == q))
            .collect()
    }

    // -- messages -------------------------------------------------------------

    /// Append a message to the history.
    pub fn append_message(&self, role: Role, content: String, tokens: u32, iteration: Option<u32>) {
        let record = MessageRecord {
            id: Uuid::new_v4(),
            role,
            content,
            tokens,
            iteration,
            timestamp: Utc::now(),
        };
        if let Ok(mut messages) = self.messages.write() {
            messages.push(record);
        }
        self.mark_dirty(Collection::Messages);
    }

    /// The `n` most recent messages, oldest first.
    pub fn recent_messages(&self, n: usize) -> Vec<MessageRecord> {
        let messages = read_clone(&self.messages);
        let start = messages.len().saturating_sub(n);
        messages[start..].to_vec()
    }

    /// Substring search over message content, newest matches last, capped
    /// at `n`.
    pub fn search_messages(&self, query: &str, n: usize) -> Vec<MessageRecord> {
        let needle = query.trim().to_lowercase();
        let messages = read_clone(&self.messages);
        if needle.is_empty() {
            let start = messages.len().saturating_sub(n);
            return messages[start..].to_vec();
        }
        let matched: Vec<MessageRecord> = messages
            .into_iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .collect();
        let start = matched.len().saturating_sub(n);
        matched[start..].to_vec()
    }

    /// Aggregate history numbers.
    pub fn history_stats(&self) -> HistoryStats {
        let messages = read_clone(&self.messages);
        let mut by_role: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_tokens = 0u64;
        for m in &messages {
            let slot = by_role.entry(m.role.as_str().to_owned()).or_insert(0);
            *slot = slot.saturating_add(1);
            total_tokens = total_tokens.saturating_add(u64::from(m.tokens));
        }
        HistoryStats {
            total: messages.len(),
            by_role,
            total_tokens,
        }
    }

    // -- learnings ------------------------------------------------------------

    /// Persist a new learning and return it.
    pub fn store_learning(&self, insight: String, context: Option<String>) -> Learning {
        let learning = Learning::new(insight, context);
        if let Ok(mut learnings) = self.learnings.write() {
            learnings.push(learning.clone());
        }
        self.mark_dirty(Collection::Learnings);
        learning
    }

    /// Substring search over insights and contexts. Decayed learnings are
    /// never returned; a blank query lists recent active learnings.
    pub fn search_learnings(&self, query: &str, limit: usize) -> Vec<Learning> {
        let needle = query.trim().to_lowercase();
        let learnings = read_clone(&self.learnings);
        let active = learnings.into_iter().filter(|l| !l.decayed);
        let matched: Vec<Learning> = if needle.is_empty() {
            active.collect()
        } else {
            active
                .filter(|l| {
                    l.insight.to_lowercase().contains(&needle)
                        || l.context
                            .as_deref()
                            .is_some_and(|c| c.to_lowercase().contains(&needle))
                })
                .collect()
        };
        let start = matched.len().saturating_sub(limit);
        matched[start..].to_vec()
    }

    /// Record a usefulness vote and re-evaluate decay.
    ///
    /// Decay is one-way: a learning that has decayed stays decayed no
    /// matter how later votes land.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    pub fn vote_learning(&self, id: Uuid, useful: bool) -> Result<Learning, StoreError> {
        let updated = {
            let Ok(mut learnings) = self.learnings.write() else {
                return Err(StoreError::NotFound {
                    kind: "learning",
                    id: id.to_string(),
                });
            };
            let Some(learning) = learnings.iter_mut().find(|l| l.id == id) else {
                return Err(StoreError::NotFound {
                    kind: "learning",
                    id: id.to_string(),
                });
            };
            if useful {
                learning.useful_count = learning.useful_count.saturating_add(1);
            } else {
                learning.not_useful_count = learning.not_useful_count.saturating_add(1);
            }
            if !learning.decayed && learning.decay_due() {
                learning.decayed = true;
                warn!(id = %learning.id, "learning decayed after negative votes");
            }
            learning.clone()
        };
        self.mark_dirty(Collection::Learnings);
        Ok(updated)
    }

    /// Bump a learning's applied counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    pub fn record_learning_applied(&self, id: Uuid) -> Result<Learning, StoreError> {
        let updated = {
            let Ok(mut learnings) = self.learnings.write() else {
                return Err(StoreError::NotFound {
                    kind: "learning",
                    id: id.to_string(),
                });
            };
            let Some(learning) = learnings.iter_mut().find(|l| l.id == id) else {
                return Err(StoreError::NotFound {
                    kind: "learning",
                    id: id.to_string(),
                });
            };
            learning.applied_count = learning.applied_count.saturating_add(1);
            learning.clone()
        };
        self.mark_dirty(Collection::Learnings);
        Ok(updated)
    }

    /// Aggregate learning numbers, vote totals included.
    pub fn learning_stats(&self) -> LearningStats {
        let learnings = read_clone(&self.learnings);
        let decayed = learnings.iter().filter(|l| l.decayed).count();
        let mut useful = 0u64;
        let mut not_useful = 0u64;
        let mut applied = 0u64;
        for l in &learnings {
            useful = useful.saturating_add(u64::from(l.useful_count));
            not_useful = not_useful.saturating_add(u64::from(l.not_useful_count));
            applied = applied.saturating_add(u64::from(l.applied_count));
        }
        LearningStats {
            total: learnings.len(),
            active: learnings.len().saturating_sub(decayed),
            decayed,
            useful_votes: useful,
            not_useful_votes: not_useful,
            applied,
        }
    }

    // -- examples -------------------------------------------------------------

    /// Append a retained example.
    pub fn append_example(&self, example: ExampleRecord) {
        if let Ok(mut examples) = self.examples.write() {
            examples.push(example);
        }
        self.mark_dirty(Collection::Examples);
    }

    /// Most recent examples, at most three good and three bad.
    pub fn recent_examples(&self) -> Vec<ExampleRecord> {
        let examples = read_clone(&self.examples);
        let mut good: Vec<ExampleRecord> = Vec::new();
        let mut bad: Vec<ExampleRecord> = Vec::new();
        for example in examples.into_iter().rev() {
            if example.good && good.len() < EXAMPLE_RETRIEVAL_CAP {
                good.push(example);
            } else if !example.good && bad.len() < EXAMPLE_RETRIEVAL_CAP {
                bad.push(example);
            }
            if good.len() == EXAMPLE_RETRIEVAL_CAP && bad.len() == EXAMPLE_RETRIEVAL_CAP {
                break;
            }
        }
        let mut combined = good;
        combined.extend(bad);
        combined.sort_by_key(|e| e.timestamp);
        combined
    }

    // -- stats ----------------------------------------------------------------

    /// Record counts for every collection.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            page_nodes: self.page_nodes.read().map(|v| v.len()).unwrap_or(0),
            toc_entries: self.toc_entries.read().map(|v| v.len()).unwrap_or(0),
            entities: self.entities.read().map(|v| v.len()).unwrap_or(0),
            relationships: self.relationships.read().map(|v| v.len()).unwrap_or(0),
            claims: self.claims.read().map(|v| v.len()).unwrap_or(0),
            messages: self.messages.read().map(|v| v.len()).unwrap_or(0),
            learnings: self.learnings.read().map(|v| v.len()).unwrap_or(0),
            examples: self.examples.read().map(|v| v.len()).unwrap_or(0),
        }
    }
}

/// Snapshot a collection under its read lock.
fn read_clone<T: Clone>(lock: &RwLock<Vec<T>>) -> Vec<T> {
    lock.read().map(|v| v.clone()).unwrap_or_default()
}

//! Tool bindings exposed to sandboxed code.
//!
//! Tools are polymorphic over [`SandboxStore`] so tests can substitute a
//! fake store. Everything crosses the boundary as JSON and comes back as a
//! sandbox [`Value`]; record types keep their kebab-case serde keys, which
//! is exactly what snippets see.

use std::collections::HashSet;
use std::sync::OnceLock;

use serde::Serialize;
use uuid::Uuid;

use crate::store::{
    DocumentSummary, EntityFilter, EntityStats, HistoryStats, KnowledgeStore, LearningStats,
    NodeFilter, StoreError,
};
use crate::types::{
    Claim, Entity, ExampleRecord, Learning, MessageRecord, Relationship, StoredPageNode,
    StoredTocEntry,
};

use super::value::Value;
use super::SandboxError;

/// Listing truncates node content and description to this many characters;
/// full text is only returned by an explicit get.
const LISTING_TEXT_CAP: usize = 200;

// ---------------------------------------------------------------------------
// Store interface
// ---------------------------------------------------------------------------

/// The store surface tools depend on.
pub trait SandboxStore: Send + Sync {
    /// Summaries of every ingested document.
    fn list_documents(&self) -> Vec<DocumentSummary>;
    /// TOC entries, optionally for one document.
    fn list_toc_entries(&self, document_id: Option<&str>) -> Vec<StoredTocEntry>;
    /// Substring search over TOC titles and descriptions.
    fn search_toc_entries(&self, query: &str, document_id: Option<&str>) -> Vec<StoredTocEntry>;
    /// One TOC entry by id.
    fn get_toc_entry(&self, id: &str) -> Option<StoredTocEntry>;
    /// Page nodes under the given filters.
    fn list_page_nodes(&self, filter: &NodeFilter) -> Vec<StoredPageNode>;
    /// Substring search over node content and descriptions.
    fn search_page_nodes(&self, query: &str, filter: &NodeFilter) -> Vec<StoredPageNode>;
    /// One page node by id, full text included.
    fn get_page_node(&self, id: &str) -> Option<StoredPageNode>;
    /// Entities under the given filters.
    fn list_entities(&self, filter: &EntityFilter) -> Vec<Entity>;
    /// Substring search over entity names and descriptions.
    fn search_entities(&self, query: &str, filter: &EntityFilter) -> Vec<Entity>;
    /// One entity by id.
    fn get_entity(&self, id: Uuid) -> Option<Entity>;
    /// Relationships, optionally for one document.
    fn list_relationships(&self, document_id: Option<&str>) -> Vec<Relationship>;
    /// Aggregate entity numbers.
    fn entity_stats(&self) -> EntityStats;
    /// The `n` most recent history messages.
    fn recent_messages(&self, n: usize) -> Vec<MessageRecord>;
    /// Substring search over the message history.
    fn search_messages(&self, query: &str, n: usize) -> Vec<MessageRecord>;
    /// Aggregate history numbers.
    fn history_stats(&self) -> HistoryStats;
    /// Persist a new learning.
    fn store_learning(&self, insight: String, context: Option<String>) -> Learning;
    /// Substring search over active learnings.
    fn search_learnings(&self, query: &str, limit: usize) -> Vec<Learning>;
    /// Record a usefulness vote, re-evaluating decay.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown id.
    fn vote_learning(&self, id: Uuid, useful: bool) -> Result<Learning, StoreError>;
    /// Aggregate learning numbers.
    fn learning_stats(&self) -> LearningStats;
    /// Recent examples, capped per polarity.
    fn recent_examples(&self) -> Vec<ExampleRecord>;
    /// Claims, optionally for one query.
    fn list_claims(&self, query_id: Option<&str>) -> Vec<Claim>;
}

impl SandboxStore for KnowledgeStore {
    fn list_documents(&self) -> Vec<DocumentSummary> {
        Self::list_documents(self)
    }
    fn list_toc_entries(&self, document_id: Option<&str>) -> Vec<StoredTocEntry> {
        Self::list_toc_entries(self, document_id)
    }
    fn search_toc_entries(&self, query: &str, document_id: Option<&str>) -> Vec<StoredTocEntry> {
        Self::search_toc_entries(self, query, document_id)
    }
    fn get_toc_entry(&self, id: &str) -> Option<StoredTocEntry> {
        Self::get_toc_entry(self, id)
    }
    fn list_page_nodes(&self, filter: &NodeFilter) -> Vec<StoredPageNode> {
        Self::list_page_nodes(self, filter)
    }
    fn search_page_nodes(&self, query: &str, filter: &NodeFilter) -> Vec<StoredPageNode> {
        Self::search_page_nodes(self, query, filter)
    }
    fn get_page_node(&self, id: &str) -> Option<StoredPageNode> {
        Self::get_page_node(self, id)
    }
    fn list_entities(&self, filter: &EntityFilter) -> Vec<Entity> {
        Self::list_entities(self, filter)
    }
    fn search_entities(&self, query: &str, filter: &EntityFilter) -> Vec<Entity> {
        Self::search_entities(self, query, filter)
    }
    fn get_entity(&self, id: Uuid) -> Option<Entity> {
        Self::get_entity(self, id)
    }
    fn list_relationships(&self, document_id: Option<&str>) -> Vec<Relationship> {
        Self::list_relationships(self, document_id)
    }
    fn entity_stats(&self) -> EntityStats {
        Self::entity_stats(self)
    }
    fn recent_messages(&self, n: usize) -> Vec<MessageRecord> {
        Self::recent_messages(self, n)
    }
    fn search_messages(&self, query: &str, n: usize) -> Vec<MessageRecord> {
        Self::search_messages(self, query, n)
    }
    fn history_stats(&self) -> HistoryStats {
        Self::history_stats(self)
    }
    fn store_learning(&self, insight: String, context: Option<String>) -> Learning {
        Self::store_learning(self, insight, context)
    }
    fn search_learnings(&self, query: &str, limit: usize) -> Vec<Learning> {
        Self::search_learnings(self, query, limit)
    }
    fn vote_learning(&self, id: Uuid, useful: bool) -> Result<Learning, StoreError> {
        Self::vote_learning(self, id, useful)
    }
    fn learning_stats(&self) -> LearningStats {
        Self::learning_stats(self)
    }
    fn recent_examples(&self) -> Vec<ExampleRecord> {
        Self::recent_examples(self)
    }
    fn list_claims(&self, query_id: Option<&str>) -> Vec<Claim> {
        Self::list_claims(self, query_id)
    }
}

// ---------------------------------------------------------------------------
// Tool names
// ---------------------------------------------------------------------------

/// Store-backed tool names, as they appear in snippets.
pub const STORE_TOOLS: &[&str] = &[
    "list-documents",
    "list-toc-entries",
    "search-toc-entries",
    "get-toc-entry",
    "list-page-nodes",
    "search-page-nodes",
    "get-page-node",
    "search-entities",
    "get-entity",
    "list-entities",
    "list-relationships",
    "entity-stats",
    "get-history",
    "search-history",
    "history-stats",
    "store-learning",
    "search-learnings",
    "vote-learning",
    "learning-stats",
    "search-examples",
    "list-claims",
];

/// Tools handled inside the interpreter (they touch locals or recursion).
pub const LOCAL_TOOLS: &[&str] = &["list-locals", "get-local", "rlm-query"];

/// The full tool name set, built once.
pub fn tool_names() -> &'static HashSet<String> {
    static NAMES: OnceLock<HashSet<String>> = OnceLock::new();
    NAMES.get_or_init(|| {
        STORE_TOOLS
            .iter()
            .chain(LOCAL_TOOLS.iter())
            .map(|s| (*s).to_owned())
            .collect()
    })
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Execute a store-backed tool call.
///
/// # Errors
///
/// Returns [`SandboxError::Eval`] for bad arity or argument types; tool
/// results themselves are data, never errors.
pub fn dispatch(
    store: &dyn SandboxStore,
    name: &str,
    args: &[Value],
) -> Result<Value, SandboxError> {
    match name {
        "list-documents" => Ok(to_value(&store.list_documents())),
        "list-toc-entries" => {
            let doc = opt_str(args, 0)?;
            Ok(to_value(&store.list_toc_entries(doc.as_deref())))
        }
        "search-toc-entries" => {
            let query = req_str(name, args, 0)?;
            let doc = opt_str(args, 1)?;
            Ok(to_value(&store.search_toc_entries(&query, doc.as_deref())))
        }
        "get-toc-entry" => {
            let id = req_str(name, args, 0)?;
            Ok(option_to_value(store.get_toc_entry(&id)))
        }
        "list-page-nodes" => {
            let filter = node_filter(args, 0)?;
            let nodes = store.list_page_nodes(&filter);
            Ok(Value::List(nodes.iter().map(node_listing).collect()))
        }
        "search-page-nodes" => {
            let query = req_str(name, args, 0)?;
            let filter = node_filter(args, 1)?;
            let nodes = store.search_page_nodes(&query, &filter);
            Ok(Value::List(nodes.iter().map(node_listing).collect()))
        }
        "get-page-node" => {
            let id = req_str(name, args, 0)?;
            Ok(option_to_value(store.get_page_node(&id)))
        }
        "search-entities" => {
            let query = req_str(name, args, 0)?;
            let filter = entity_filter(args, 1)?;
            Ok(to_value(&store.search_entities(&query, &filter)))
        }
        "get-entity" => {
            let id = req_uuid(name, args, 0)?;
            Ok(option_to_value(store.get_entity(id)))
        }
        "list-entities" => {
            let filter = entity_filter(args, 0)?;
            Ok(to_value(&store.list_entities(&filter)))
        }
        "list-relationships" => {
            let doc = opt_str(args, 0)?;
            Ok(to_value(&store.list_relationships(doc.as_deref())))
        }
        "entity-stats" => Ok(to_value(&store.entity_stats())),
        "get-history" => {
            let n = req_count(name, args, 0)?;
            Ok(to_value(&store.recent_messages(n)))
        }
        "search-history" => {
            let query = req_str(name, args, 0)?;
            let n = opt_count(args, 1).unwrap_or(20);
            Ok(to_value(&store.search_messages(&query, n)))
        }
        "history-stats" => Ok(to_value(&store.history_stats())),
        "store-learning" => {
            let insight = req_str(name, args, 0)?;
            let context = opt_str(args, 1)?;
            Ok(to_value(&store.store_learning(insight, context)))
        }
        "search-learnings" => {
            let query = req_str(name, args, 0)?;
            let limit = opt_count(args, 1).unwrap_or(10);
            Ok(to_value(&store.search_learnings(&query, limit)))
        }
        "vote-learning" => {
            let id = req_uuid(name, args, 0)?;
            let useful = match args.get(1) {
                Some(Value::Bool(b)) => *b,
                _ => {
                    return Err(SandboxError::Eval(
                        "vote-learning expects (vote-learning id useful?)".to_owned(),
                    ))
                }
            };
            match store.vote_learning(id, useful) {
                Ok(learning) => Ok(to_value(&learning)),
                Err(e) => Ok(error_value(&e.to_string())),
            }
        }
        "learning-stats" => Ok(to_value(&store.learning_stats())),
        "search-examples" => Ok(to_value(&store.recent_examples())),
        "list-claims" => {
            let query_id = opt_str(args, 0)?;
            Ok(to_value(&store.list_claims(query_id.as_deref())))
        }
        other => Err(SandboxError::Eval(format!("unknown tool {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Argument and result helpers
// ---------------------------------------------------------------------------

fn to_value<T: Serialize>(record: &T) -> Value {
    match serde_json::to_value(record) {
        Ok(json) => Value::from_json(&json),
        Err(_) => Value::Nil,
    }
}

fn option_to_value<T: Serialize>(record: Option<T>) -> Value {
    record.as_ref().map_or(Value::Nil, to_value)
}

/// `{:error "..."}` — errors as data, per the execution contract.
pub fn error_value(message: &str) -> Value {
    let mut map = std::collections::BTreeMap::new();
    map.insert("error".to_owned(), Value::Str(message.to_owned()));
    Value::Map(map)
}

fn req_str(tool: &str, args: &[Value], index: usize) -> Result<String, SandboxError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(s.clone()),
        Some(other) => Err(SandboxError::Eval(format!(
            "{tool}: argument {index} must be a string, got {}",
            other.type_name()
        ))),
        None => Err(SandboxError::Eval(format!(
            "{tool}: missing string argument {index}"
        ))),
    }
}

fn opt_str(args: &[Value], index: usize) -> Result<Option<String>, SandboxError> {
    match args.get(index) {
        None | Some(Value::Nil) => Ok(None),
        Some(Value::Str(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SandboxError::Eval(format!(
            "optional argument {index} must be a string, got {}",
            other.type_name()
        ))),
    }
}

fn req_uuid(tool: &str, args: &[Value], index: usize) -> Result<Uuid, SandboxError> {
    let raw = req_str(tool, args, index)?;
    raw.parse()
        .map_err(|_| SandboxError::Eval(format!("{tool}: {raw:?} is not a valid id")))
}

fn req_count(tool: &str, args: &[Value], index: usize) -> Result<usize, SandboxError> {
    match args.get(index) {
        Some(Value::Int(i)) if *i >= 0 => usize::try_from(*i)
            .map_err(|_| SandboxError::Eval(format!("{tool}: count out of range"))),
        _ => Err(SandboxError::Eval(format!(
            "{tool}: argument {index} must be a non-negative integer"
        ))),
    }
}

fn opt_count(args: &[Value], index: usize) -> Option<usize> {
    match args.get(index) {
        Some(Value::Int(i)) if *i >= 0 => usize::try_from(*i).ok(),
        _ => None,
    }
}

fn node_filter(args: &[Value], from: usize) -> Result<NodeFilter, SandboxError> {
    let document_id = opt_str(args, from)?;
    let page = match args.get(from.saturating_add(1)) {
        Some(Value::Int(i)) if *i >= 0 => u32::try_from(*i).ok(),
        _ => None,
    };
    Ok(NodeFilter { document_id, page })
}

fn entity_filter(args: &[Value], from: usize) -> Result<EntityFilter, SandboxError> {
    let document_id = opt_str(args, from)?;
    let kind = match args.get(from.saturating_add(1)) {
        Some(Value::Str(s)) => Some(crate::types::EntityKind::parse(s)),
        Some(Value::Keyword(k)) => Some(crate::types::EntityKind::parse(k)),
        _ => None,
    };
    Ok(EntityFilter { document_id, kind })
}

/// Listing view of a stored node: full record with `content` and
/// `description` capped at 200 characters.
fn node_listing(node: &StoredPageNode) -> Value {
    let full = to_value(node);
    let Value::Map(mut outer) = full else {
        return Value::Nil;
    };
    if let Some(Value::Map(inner)) = outer.get_mut("node") {
        for field in ["content", "description", "content-ascii"] {
            if let Some(Value::Str(text)) = inner.get_mut(field) {
                if text.chars().count() > LISTING_TEXT_CAP {
                    let capped: String = text.chars().take(LISTING_TEXT_CAP).collect();
                    *text = format!("{capped}...");
                }
            }
        }
        // Never ship raw image bytes in a listing.
        inner.remove("image-bytes");
    }
    Value::Map(outer)
}

//! Core record types shared by the store, the engine and the QA pipeline.
//!
//! Everything here serialises with kebab-case keys, matching the on-disk
//! collection files and the normalised output of the jsonish parser, so a
//! model response coerced through [`crate::jsonish`] deserialises directly
//! into these types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Documents and pages
// ---------------------------------------------------------------------------

/// An ingested source document: ordered pages plus a flat table of contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Document {
    /// Stable document identifier.
    pub id: String,
    /// Ordered page sequence.
    pub pages: Vec<Page>,
    /// Flat TOC, created only from explicit TOC pages.
    #[serde(default)]
    pub toc: Vec<TocEntry>,
}

/// A single page: an integer index and its nodes in reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Page {
    /// Zero-based page index.
    pub index: u32,
    /// Nodes in reading order.
    pub nodes: Vec<PageNode>,
}

/// Pixel-space bounding box. Invariant after ingest:
/// `0 <= xmin < xmax <= width` and `0 <= ymin < ymax <= height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    /// Left edge, pixels.
    pub xmin: u32,
    /// Top edge, pixels.
    pub ymin: u32,
    /// Right edge, pixels.
    pub xmax: u32,
    /// Bottom edge, pixels.
    pub ymax: u32,
}

impl BBox {
    /// Clamp the box to image bounds. Returns `None` when the clamped box
    /// is degenerate (zero width or height).
    pub fn clamped(self, width: u32, height: u32) -> Option<Self> {
        let xmin = self.xmin.min(width);
        let ymin = self.ymin.min(height);
        let xmax = self.xmax.min(width);
        let ymax = self.ymax.min(height);
        if xmin < xmax && ymin < ymax {
            Some(Self {
                xmin,
                ymin,
                xmax,
                ymax,
            })
        } else {
            None
        }
    }
}

/// Heading depth, `h1` through `h6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadingLevel {
    /// Top-level heading.
    H1,
    /// Second-level heading.
    H2,
    /// Third-level heading.
    H3,
    /// Fourth-level heading.
    H4,
    /// Fifth-level heading.
    H5,
    /// Sixth-level heading.
    H6,
}

/// The flavour of a paragraph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParagraphKind {
    /// Ordinary body text.
    Paragraph,
    /// Bibliographic citation.
    Citation,
    /// Code listing.
    Code,
    /// Sidebar or callout.
    Aside,
    /// Document abstract.
    Abstract,
    /// Footnote text.
    Footnote,
}

/// A structural node on a page.
///
/// `parent_id`, when present, must resolve to a [`PageNode::Section`] in the
/// same document (a store-local back-reference, not an owning pointer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PageNode {
    /// Logical grouping that other nodes reference via `parent_id`.
    Section {
        /// Node identifier.
        id: String,
        #[serde(default)]
        /// Identifier of the enclosing [`PageNode::Section`], if any.
        parent_id: Option<String>,
        /// Human-readable description of the section's purpose.
        description: String,
    },
    /// Display heading at a given depth.
    Heading {
        /// Node identifier.
        id: String,
        #[serde(default)]
        /// Identifier of the enclosing [`PageNode::Section`], if any.
        parent_id: Option<String>,
        /// Heading depth.
        level: HeadingLevel,
        /// Heading text.
        content: String,
    },
    /// Text block of some [`ParagraphKind`].
    Paragraph {
        /// Node identifier.
        id: String,
        #[serde(default)]
        /// Identifier of the enclosing [`PageNode::Section`], if any.
        parent_id: Option<String>,
        /// Kind of paragraph text.
        level: ParagraphKind,
        /// Paragraph text.
        content: String,
        #[serde(default)]
        /// Whether this paragraph continues from the previous page.
        continuation: bool,
    },
    /// One item of a bulleted or numbered list.
    ListItem {
        /// Node identifier.
        id: String,
        #[serde(default)]
        /// Identifier of the enclosing [`PageNode::Section`], if any.
        parent_id: Option<String>,
        /// List item text.
        content: String,
    },
    /// Raster figure, optionally carrying its raw bytes.
    Image {
        /// Node identifier.
        id: String,
        #[serde(default)]
        /// Identifier of the enclosing [`PageNode::Section`], if any.
        parent_id: Option<String>,
        /// Free-form kind label ("figure", "chart", "photo", ...).
        kind: String,
        /// Bounding box of the image on the page.
        bbox: BBox,
        #[serde(default)]
        /// Optional caption text.
        caption: Option<String>,
        /// Human-readable description of the image contents.
        description: String,
        /// Base64-encoded raw image bytes when the source retained them.
        #[serde(default)]
        image_bytes: Option<String>,
        #[serde(default)]
        /// Whether this image continues from the previous page.
        continuation: bool,
    },
    /// Table with an ASCII rendering of the grid.
    Table {
        /// Node identifier.
        id: String,
        #[serde(default)]
        /// Identifier of the enclosing [`PageNode::Section`], if any.
        parent_id: Option<String>,
        /// Bounding box of the table on the page.
        bbox: BBox,
        #[serde(default)]
        /// Optional caption text.
        caption: Option<String>,
        /// Human-readable description of the table contents.
        description: String,
        /// Plain-text rendering of the table grid.
        content_ascii: String,
        #[serde(default)]
        /// Base64-encoded raw image bytes when the source retained them.
        image_bytes: Option<String>,
    },
    /// Running page header.
    Header {
        /// Node identifier.
        id: String,
        /// Header text.
        content: String,
    },
    /// Running page footer.
    Footer {
        /// Node identifier.
        id: String,
        /// Footer text.
        content: String,
    },
    /// Non-content page metadata.
    Metadata {
        /// Node identifier.
        id: String,
        /// Metadata text.
        content: String,
    },
}

impl PageNode {
    /// Node identifier.
    pub fn id(&self) -> &str {
        match self {
            Self::Section { id, .. }
            | Self::Heading { id, .. }
            | Self::Paragraph { id, .. }
            | Self::ListItem { id, .. }
            | Self::Image { id, .. }
            | Self::Table { id, .. }
            | Self::Header { id, .. }
            | Self::Footer { id, .. }
            | Self::Metadata { id, .. } => id,
        }
    }

    /// Parent section id, if any.
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Self::Section { parent_id, .. }
            | Self::Heading { parent_id, .. }
            | Self::Paragraph { parent_id, .. }
            | Self::ListItem { parent_id, .. }
            | Self::Image { parent_id, .. }
            | Self::Table { parent_id, .. } => parent_id.as_deref(),
            Self::Header { .. } | Self::Footer { .. } | Self::Metadata { .. } => None,
        }
    }

    /// Clear the parent back-reference (used when integrity checks find a
    /// dangling parent during ingest).
    pub fn clear_parent(&mut self) {
        match self {
            Self::Section { parent_id, .. }
            | Self::Heading { parent_id, .. }
            | Self::Paragraph { parent_id, .. }
            | Self::ListItem { parent_id, .. }
            | Self::Image { parent_id, .. }
            | Self::Table { parent_id, .. } => *parent_id = None,
            Self::Header { .. } | Self::Footer { .. } | Self::Metadata { .. } => {}
        }
    }

    /// Whether this node is a section.
    pub fn is_section(&self) -> bool {
        matches!(self, Self::Section { .. })
    }

    /// The searchable text content of the node, if it has any.
    pub fn content_text(&self) -> Option<&str> {
        match self {
            Self::Heading { content, .. }
            | Self::Paragraph { content, .. }
            | Self::ListItem { content, .. }
            | Self::Header { content, .. }
            | Self::Footer { content, .. }
            | Self::Metadata { content, .. } => Some(content),
            Self::Table { content_ascii, .. } => Some(content_ascii),
            Self::Section { .. } | Self::Image { .. } => None,
        }
    }

    /// The searchable description of the node, if it has one.
    pub fn description_text(&self) -> Option<&str> {
        match self {
            Self::Section { description, .. }
            | Self::Image { description, .. }
            | Self::Table { description, .. } => Some(description),
            _ => None,
        }
    }

    /// Raw image bytes (base64) for visual nodes.
    pub fn image_bytes(&self) -> Option<&str> {
        match self {
            Self::Image { image_bytes, .. } | Self::Table { image_bytes, .. } => {
                image_bytes.as_deref()
            }
            _ => None,
        }
    }
}

/// TOC depth, `l1` through `l6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TocLevel {
    /// Depth 1.
    L1,
    /// Depth 2.
    L2,
    /// Depth 3.
    L3,
    /// Depth 4.
    L4,
    /// Depth 5.
    L5,
    /// Depth 6.
    L6,
}

/// A table-of-contents entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TocEntry {
    /// Entry identifier.
    pub id: String,
    /// Parent entry for nested TOCs.
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Display title.
    pub title: String,
    /// Optional summary of the target.
    #[serde(default)]
    pub description: Option<String>,
    /// Page the entry points at.
    #[serde(default)]
    pub target_page: Option<u32>,
    /// Section the entry points at.
    #[serde(default)]
    pub target_section_id: Option<String>,
    /// Nesting depth.
    pub level: TocLevel,
}

// ---------------------------------------------------------------------------
// Store record wrappers
// ---------------------------------------------------------------------------

/// A page node as stored: annotated with its document and page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoredPageNode {
    /// Owning document.
    pub document_id: String,
    /// Page index within the document.
    pub page: u32,
    /// The node itself.
    pub node: PageNode,
}

/// A TOC entry as stored, annotated with its document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoredTocEntry {
    /// Owning document.
    pub document_id: String,
    /// The entry itself.
    pub entry: TocEntry,
}

// ---------------------------------------------------------------------------
// Entities, relationships, claims
// ---------------------------------------------------------------------------

/// Entity classification. The extraction prompt is open-ended, so unknown
/// labels fold into [`EntityKind::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    /// Contracting party.
    Party,
    /// Company or institution.
    Organization,
    /// Named individual.
    Person,
    /// Duty one party owes another.
    Obligation,
    /// Contract clause.
    Clause,
    /// Defined term.
    Term,
    /// Calendar date.
    Date,
    /// Monetary amount.
    Amount,
    /// Anything the extractor labelled outside the list above.
    #[serde(other)]
    Other,
}

impl EntityKind {
    /// String form used in search filters and stats.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Party => "party",
            Self::Organization => "organization",
            Self::Person => "person",
            Self::Obligation => "obligation",
            Self::Clause => "clause",
            Self::Term => "term",
            Self::Date => "date",
            Self::Amount => "amount",
            Self::Other => "other",
        }
    }

    /// Parse a label; unknown labels map to [`Self::Other`].
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "party" => Self::Party,
            "organization" | "organisation" => Self::Organization,
            "person" => Self::Person,
            "obligation" => Self::Obligation,
            "clause" => Self::Clause,
            "term" => Self::Term,
            "date" => Self::Date,
            "amount" => Self::Amount,
            _ => Self::Other,
        }
    }
}

/// An extracted entity, unique by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Entity {
    /// Stable identifier.
    pub id: Uuid,
    /// Name as extracted.
    pub name: String,
    /// Classification.
    pub kind: EntityKind,
    /// One-line description.
    pub description: String,
    /// Document the entity was extracted from.
    pub document_id: String,
    /// Page the entity first appears on.
    #[serde(default)]
    pub page: Option<u32>,
    /// Section the entity first appears in.
    #[serde(default)]
    pub section: Option<String>,
    /// Extraction timestamp.
    pub created_at: DateTime<Utc>,
    /// Domain-specific extension fields carried through verbatim.
    #[serde(default)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

/// A typed edge between two entities. Both endpoints must resolve to
/// entities in the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Relationship {
    /// Stable identifier.
    pub id: Uuid,
    /// Free-form relationship label ("supplies", "bound-by", ...).
    pub kind: String,
    /// Source endpoint.
    pub source_entity_id: Uuid,
    /// Target endpoint.
    pub target_entity_id: Uuid,
    /// One-line description.
    pub description: String,
    /// Document the relationship was extracted from.
    pub document_id: String,
    /// Extraction timestamp.
    pub created_at: DateTime<Utc>,
}

/// A model-asserted fact attached to a citation.
///
/// Invariant: `verified == false` implies `confidence <= 0.5`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Claim {
    /// Stable identifier.
    pub id: Uuid,
    /// The asserted fact.
    pub text: String,
    /// Cited document.
    pub document_id: String,
    /// Cited page.
    pub page: u32,
    /// Cited section.
    pub section: String,
    /// Supporting quote from the source.
    pub quote: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Query that produced the claim.
    pub query_id: String,
    /// Whether the claim carries a citation.
    pub verified: bool,
    /// Verification verdict, once reviewed.
    #[serde(default)]
    pub verdict: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Claim {
    /// A verified citation with explicit confidence (clamped to `[0, 1]`).
    pub fn cited(
        text: String,
        document_id: String,
        page: u32,
        section: String,
        quote: String,
        confidence: f64,
        query_id: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            document_id,
            page,
            section,
            quote,
            confidence: confidence.clamp(0.0, 1.0),
            query_id,
            verified: true,
            verdict: None,
            created_at: Utc::now(),
        }
    }

    /// An unverified claim: no citation yet, confidence capped at 0.5.
    pub fn unverified(text: String, query_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            document_id: String::new(),
            page: 0,
            section: String::new(),
            quote: String::new(),
            confidence: 0.5,
            query_id,
            verified: false,
            verdict: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Messages, learnings, examples
// ---------------------------------------------------------------------------

/// Conversation participant role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt.
    System,
    /// Human (or caller) message.
    User,
    /// Model reply.
    Assistant,
    /// Tool/execution result fed back to the model.
    Tool,
}

impl Role {
    /// Wire/string form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// One entry of the append-only per-environment message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MessageRecord {
    /// Stable identifier.
    pub id: Uuid,
    /// Author role.
    pub role: Role,
    /// Message text.
    pub content: String,
    /// Counted tokens.
    pub tokens: u32,
    /// Loop iteration that produced the message, when applicable.
    #[serde(default)]
    pub iteration: Option<u32>,
    /// Creation timestamp.
    pub timestamp: DateTime<Utc>,
}

/// An insight persisted across queries, with vote-based decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Learning {
    /// Stable identifier.
    pub id: Uuid,
    /// The insight itself.
    pub insight: String,
    /// Where the insight came from.
    #[serde(default)]
    pub context: Option<String>,
    /// Positive votes.
    pub useful_count: u32,
    /// Negative votes.
    pub not_useful_count: u32,
    /// Times the learning was applied to a query.
    pub applied_count: u32,
    /// Whether votes pushed the learning past the decay threshold.
    pub decayed: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// Minimum votes before decay is evaluated.
const DECAY_MIN_VOTES: u32 = 5;
/// Not-useful ratio above which a learning decays.
const DECAY_RATIO: f64 = 0.7;

impl Learning {
    /// Create a fresh, undecayed learning.
    pub fn new(insight: String, context: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            insight,
            context,
            useful_count: 0,
            not_useful_count: 0,
            applied_count: 0,
            decayed: false,
            created_at: Utc::now(),
        }
    }

    /// Whether the accumulated votes put this learning past the decay
    /// threshold. Decay is one-way: callers must never reset the flag.
    pub fn decay_due(&self) -> bool {
        let total = self.useful_count.saturating_add(self.not_useful_count);
        if total < DECAY_MIN_VOTES {
            return false;
        }
        f64::from(self.not_useful_count) / f64::from(total) > DECAY_RATIO
    }
}

/// A retained query/answer example, kept by recency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExampleRecord {
    /// The query as asked.
    pub query: String,
    /// The answer given.
    pub answer: String,
    /// Rubric score of the answer.
    pub score: f64,
    /// Whether the exchange is worth imitating.
    pub good: bool,
    /// Creation timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Store metadata written to `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreMeta {
    /// On-disk schema version.
    pub version: u32,
    /// When the store was first created.
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

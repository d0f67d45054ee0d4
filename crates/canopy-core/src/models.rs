//! Core data models: segments, nodes and their metadata.
//!
//! A [`Segment`] is an immutable leaf text unit assigned a sequence index
//! at ingestion. A [`Node`] is a tree vertex whose text may be rewritten
//! but whose identifier, level and child list never change after
//! creation. Nodes reference their children forward only; parent lookups
//! go through the store's parent index.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable node identifier (UUID v4 text).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Generate a fresh identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Immutable leaf text unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Sequence index, unique within a store and never reused.
    pub index: u64,
    pub text: String,
    /// Byte offset of the first character in the source text.
    pub span_start: usize,
    /// Byte offset one past the last character in the source text.
    pub span_end: usize,
    /// Precomputed vector, if the caller already has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<Vec<f32>>,
}

impl Segment {
    pub fn new(index: u64, text: impl Into<String>, span_start: usize, span_end: usize) -> Self {
        Self {
            index,
            text: text.into(),
            span_start,
            span_end,
            vector: None,
        }
    }

    /// Immutable content equality (ignores the optional cached vector).
    pub fn same_content(&self, other: &Segment) -> bool {
        self.index == other.index
            && self.text == other.text
            && self.span_start == other.span_start
            && self.span_end == other.span_end
    }
}

/// Reference from a node to one of its children.
///
/// Level-0 nodes reference segments; every higher level references nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildRef {
    Segment(u64),
    Node(NodeId),
}

impl ChildRef {
    /// Flat key used by the parent index (`s:<index>` / `n:<id>`).
    pub fn key(&self) -> String {
        match self {
            ChildRef::Segment(i) => format!("s:{}", i),
            ChildRef::Node(id) => format!("n:{}", id),
        }
    }

    pub fn parse_key(key: &str) -> Option<Self> {
        if let Some(rest) = key.strip_prefix("s:") {
            rest.parse().ok().map(ChildRef::Segment)
        } else {
            key.strip_prefix("n:")
                .map(|rest| ChildRef::Node(NodeId::from(rest)))
        }
    }

    pub fn as_node(&self) -> Option<&NodeId> {
        match self {
            ChildRef::Node(id) => Some(id),
            ChildRef::Segment(_) => None,
        }
    }
}

impl fmt::Display for ChildRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChildRef::Segment(i) => write!(f, "segment {}", i),
            ChildRef::Node(id) => write!(f, "node {}", id),
        }
    }
}

/// Abstraction classification of a node's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Raw,
    Actionable,
    Structural,
    Essential,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Raw, Tier::Actionable, Tier::Structural, Tier::Essential];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Actionable => "actionable",
            Tier::Structural => "structural",
            Tier::Essential => "essential",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Tier::Raw),
            "actionable" => Ok(Tier::Actionable),
            "structural" => Ok(Tier::Structural),
            "essential" => Ok(Tier::Essential),
            other => Err(format!(
                "unknown tier '{}': expected raw, actionable, structural or essential",
                other
            )),
        }
    }
}

/// Per-node metadata record.
///
/// Fields missing from older records take their defaults
/// (`abstraction_tier = None`, `locked = false`, `edit_log = []`).
/// Unrecognised keys are captured in `extra` and written back verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// `None` means unclassified, treated as [`Tier::Raw`].
    #[serde(default)]
    pub abstraction_tier: Option<Tier>,
    /// Set by explicit refinement; locked nodes are skipped by bulk regeneration.
    #[serde(default)]
    pub locked: bool,
    /// Append-only list of refinement instructions.
    #[serde(default)]
    pub edit_log: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl NodeMetadata {
    pub fn with_tier(tier: Tier) -> Self {
        Self {
            abstraction_tier: Some(tier),
            ..Self::default()
        }
    }

    pub fn tier(&self) -> Tier {
        self.abstraction_tier.unwrap_or(Tier::Raw)
    }
}

/// A tree vertex.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// 0 for nodes summarising segments, increasing toward the root.
    pub level: u32,
    pub text: String,
    pub children: Vec<ChildRef>,
    /// Vector of the current `text`; refreshed whenever the text changes.
    pub vector: Option<Vec<f32>>,
    pub metadata: NodeMetadata,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds.
    pub updated_at: i64,
}

impl Node {
    /// Create a new node with a fresh identifier.
    pub fn new(level: u32, text: impl Into<String>, children: Vec<ChildRef>, tier: Tier) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: NodeId::generate(),
            level,
            text: text.into(),
            children,
            vector: None,
            metadata: NodeMetadata::with_tier(tier),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_vector(mut self, vector: Vec<f32>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn is_locked(&self) -> bool {
        self.metadata.locked
    }

    pub fn tier(&self) -> Tier {
        self.metadata.tier()
    }

    /// Child node identifiers (empty for level-0 nodes).
    pub fn child_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.children.iter().filter_map(ChildRef::as_node)
    }
}

/// Registry entry written once per successful build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeRecord {
    pub root: NodeId,
    pub label: Option<String>,
    pub segment_count: usize,
    /// Number of synthesis levels (root level + 1).
    pub depth: u32,
    pub created_at: i64,
}

//! # Domain Types for SpiteGraph
//!
//! This module defines the identifiers and small value types used throughout
//! the content repository: content streams, node aggregates, workspaces,
//! node types, subtree tags and the storage-level anchor points.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Every identifier is wrapped in its own single-field struct:
//!
//! - **Type safety**: a `WorkspaceName` cannot be passed where a
//!   `ContentStreamId` is expected
//! - **Validation at the edge**: string identifiers are validated once, when
//!   constructed or deserialized, and can be trusted afterwards
//! - **Self-documenting code**: signatures say what they expect
//!
//! ## Example
//!
//! ```rust
//! use spitegraph::types::{ContentStreamId, NodeAggregateId};
//!
//! let cs = ContentStreamId::new("cs-1").unwrap();
//! let node = NodeAggregateId::new("agg-1").unwrap();
//! assert!(NodeAggregateId::new("Not Valid!").is_err());
//! # let _ = (cs, node);
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

fn is_slug(value: &str, max_len: usize, extra: &[char]) -> bool {
    !value.is_empty()
        && value.len() <= max_len
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || extra.contains(&c))
}

// =============================================================================
// Identifiers
// =============================================================================

string_id!(
    /// Identifies one configured content repository (`[a-z0-9_]{1,16}`).
    ContentRepositoryId,
    |v| is_slug(v, 16, &['_'])
);

string_id!(
    /// An opaque identifier of a content stream.
    ///
    /// # What is a Content Stream?
    ///
    /// A content stream is one branch of the content graph: an ordered event
    /// history. Workspaces point at exactly one content stream at a time, and
    /// forking a stream creates a copy-on-write overlay over its source.
    ContentStreamId,
    |v| !v.is_empty() && v.len() <= 64 && !v.chars().any(char::is_whitespace)
);

impl ContentStreamId {
    /// Generates a fresh random content stream id.
    pub fn create() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

string_id!(
    /// The stable identity of a piece of content across all of its dimension
    /// variants and across content streams (`[a-z0-9-]{1,64}`).
    NodeAggregateId,
    |v| is_slug(v, 64, &['-'])
);

impl NodeAggregateId {
    /// Generates a fresh random node aggregate id.
    pub fn create() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

string_id!(
    /// The name of a workspace (`[a-z0-9][a-z0-9-]{0,35}`).
    WorkspaceName,
    |v| v.len() <= 36
        && v.chars().next().is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && is_slug(v, 36, &['-'])
);

impl WorkspaceName {
    /// The conventional name of the root workspace.
    pub fn live() -> Self {
        Self("live".to_string())
    }
}

string_id!(
    /// The name of a node type, e.g. `Acme.Site:Document.Page`.
    NodeTypeName,
    |v| !v.is_empty() && v.len() <= 255 && !v.chars().any(char::is_whitespace)
);

impl NodeTypeName {
    /// The built-in root node type every repository knows about.
    pub const ROOT: &'static str = "Neos.ContentRepository:Root";

    /// Returns the built-in root node type name.
    pub fn root() -> Self {
        Self(Self::ROOT.to_string())
    }
}

string_id!(
    /// The name of a node below its parent, used for path lookups and
    /// tethered children (`[a-z0-9-]{1,255}`).
    NodeName,
    |v| is_slug(v, 255, &['-'])
);

string_id!(
    /// The name of a reference from one node to others, e.g.
    /// `relatedArticles` (`[a-zA-Z][a-zA-Z0-9_-]{0,254}`).
    ReferenceName,
    |v| v.len() <= 255
        && v.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && v.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
);

string_id!(
    /// A tag attached to a subtree, e.g. `disabled` (`[a-z0-9_.-]{1,36}`).
    SubtreeTag,
    |v| is_slug(v, 36, &['_', '.', '-'])
);

impl SubtreeTag {
    /// The tag used to disable a node aggregate and its descendants.
    pub fn disabled() -> Self {
        Self("disabled".to_string())
    }
}

// =============================================================================
// Positions in the Event Log
// =============================================================================

/// Position of an event in the global event log.
///
/// # Invariants
///
/// - Strictly increasing, never reused
/// - The first event has sequence number 1; 0 means "nothing processed yet"
///
/// # Rust Pattern: Copy
///
/// A single `u64` is cheap to copy, so the type derives `Copy` and is passed
/// by value everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The checkpoint of a projection that has not applied anything.
    pub const NONE: SequenceNumber = SequenceNumber(0);

    /// Creates a sequence number from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the following sequence number.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of one event stream: the 0-based index of its last event.
///
/// A stream without events has no version at all, which is why APIs return
/// `Option<Version>` rather than a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Creates a version from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the following version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Storage-Level Identity
// =============================================================================

/// Surrogate key of one physical node row.
///
/// One node aggregate has one row per occupied origin dimension space point,
/// and rows are shared between content streams until the first divergent
/// write. Anchor `0` is the virtual root every root node hangs off; it is
/// never a real row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeRelationAnchorPoint(i64);

impl NodeRelationAnchorPoint {
    /// The virtual root anchor.
    pub const ROOT: NodeRelationAnchorPoint = NodeRelationAnchorPoint(0);

    /// Creates an anchor point from a raw value.
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> i64 {
        self.0
    }

    /// Returns true for the virtual root anchor.
    pub fn is_root(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeRelationAnchorPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Status Enums
// =============================================================================

/// How a node aggregate relates to the rest of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeAggregateClassification {
    /// An ordinary node
    Regular,
    /// A root node, child of the virtual root
    Root,
    /// A node created together with its parent and bound to it
    Tethered,
}

impl NodeAggregateClassification {
    /// Returns the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::Root => "root",
            Self::Tethered => "tethered",
        }
    }

    /// Parses the stored representation.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "regular" => Ok(Self::Regular),
            "root" => Ok(Self::Root),
            "tethered" => Ok(Self::Tethered),
            other => Err(Error::Schema(format!("unknown classification '{other}'"))),
        }
    }
}

/// Lifecycle state of a content stream as tracked by the content stream
/// projection.
///
/// ```text
/// CREATED ──► IN_USE_BY_WORKSPACE ──► CLOSED ──► (reopen) previous state
///    │                │
/// FORKED ─────────────┘──► NO_LONGER_IN_USE / REBASE_ERROR ──► removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentStreamStatus {
    /// A root content stream that was just created
    Created,
    /// A stream forked from another one, not yet assigned to a workspace
    Forked,
    /// The current content stream of some workspace
    InUseByWorkspace,
    /// Closed for writes, e.g. while its workspace is rebased
    Closed,
    /// The outcome of a rebase that failed
    RebaseError,
    /// Replaced by a newer stream; candidate for pruning
    NoLongerInUse,
}

impl ContentStreamStatus {
    /// Returns the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Forked => "FORKED",
            Self::InUseByWorkspace => "IN_USE_BY_WORKSPACE",
            Self::Closed => "CLOSED",
            Self::RebaseError => "REBASE_ERROR",
            Self::NoLongerInUse => "NO_LONGER_IN_USE",
        }
    }

    /// Parses the stored representation.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "CREATED" => Ok(Self::Created),
            "FORKED" => Ok(Self::Forked),
            "IN_USE_BY_WORKSPACE" => Ok(Self::InUseByWorkspace),
            "CLOSED" => Ok(Self::Closed),
            "REBASE_ERROR" => Ok(Self::RebaseError),
            "NO_LONGER_IN_USE" => Ok(Self::NoLongerInUse),
            other => Err(Error::Schema(format!("unknown content stream status '{other}'"))),
        }
    }
}

/// Whether a workspace is in sync with its base workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    /// Based on the current state of the base workspace
    UpToDate,
    /// The base workspace changed; a rebase is needed
    Outdated,
    /// The last rebase attempt failed with conflicts
    OutdatedConflict,
}

impl WorkspaceStatus {
    /// Returns the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpToDate => "UP_TO_DATE",
            Self::Outdated => "OUTDATED",
            Self::OutdatedConflict => "OUTDATED_CONFLICT",
        }
    }

    /// Parses the stored representation.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "UP_TO_DATE" => Ok(Self::UpToDate),
            "OUTDATED" => Ok(Self::Outdated),
            "OUTDATED_CONFLICT" => Ok(Self::OutdatedConflict),
            other => Err(Error::Schema(format!("unknown workspace status '{other}'"))),
        }
    }
}

// =============================================================================
// Properties and Subtree Tags
// =============================================================================

/// Serialized property values of a node, keyed by property name.
pub type PropertyValues = BTreeMap<String, Value>;

/// The subtree tags on one hierarchy edge.
///
/// Explicit tags were set on this node aggregate itself; inherited tags come
/// from an ancestor. Storage format is a JSON object where explicit tags map
/// to `true` and inherited ones to `null`:
///
/// ```text
/// {"disabled": true, "archived": null}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubtreeTags {
    /// Tags set directly on this node aggregate
    pub explicit: BTreeSet<SubtreeTag>,
    /// Tags inherited from ancestors
    pub inherited: BTreeSet<SubtreeTag>,
}

impl SubtreeTags {
    /// Creates an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tags a new child edge receives below an edge with these
    /// tags: everything becomes inherited.
    pub fn for_child(&self) -> Self {
        Self {
            explicit: BTreeSet::new(),
            inherited: self.all(),
        }
    }

    /// Returns explicit and inherited tags together.
    pub fn all(&self) -> BTreeSet<SubtreeTag> {
        self.explicit.union(&self.inherited).cloned().collect()
    }

    /// Returns true if the tag is set explicitly or inherited.
    pub fn contains(&self, tag: &SubtreeTag) -> bool {
        self.explicit.contains(tag) || self.inherited.contains(tag)
    }

    /// Returns true if there are no tags at all.
    pub fn is_empty(&self) -> bool {
        self.explicit.is_empty() && self.inherited.is_empty()
    }

    /// Encodes the tags into the storage format.
    pub fn to_json(&self) -> String {
        let mut map = Map::new();
        for tag in &self.inherited {
            map.insert(tag.as_str().to_string(), Value::Null);
        }
        for tag in &self.explicit {
            map.insert(tag.as_str().to_string(), Value::Bool(true));
        }
        Value::Object(map).to_string()
    }

    /// Decodes the storage format.
    pub fn from_json(json: &str) -> Result<Self> {
        let map: Map<String, Value> = serde_json::from_str(json)?;
        let mut tags = Self::new();
        for (name, flag) in map {
            let tag = SubtreeTag::new(name)?;
            if flag == Value::Bool(true) {
                tags.explicit.insert(tag);
            } else {
                tags.inherited.insert(tag);
            }
        }
        Ok(tags)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(NodeAggregateId::new("agg-1").is_ok());
        assert!(NodeAggregateId::new("").is_err());
        assert!(NodeAggregateId::new("Agg 1").is_err());

        assert!(WorkspaceName::new("user-alice").is_ok());
        assert!(WorkspaceName::new("-leading-dash").is_err());
        assert!(WorkspaceName::new("a".repeat(37)).is_err());

        assert!(ContentRepositoryId::new("default").is_ok());
        assert!(ContentRepositoryId::new("way_too_long_repository").is_err());

        assert!(SubtreeTag::new("disabled").is_ok());
        assert!(SubtreeTag::new("has space").is_err());
    }

    #[test]
    fn test_generated_ids_are_valid() {
        let cs = ContentStreamId::create();
        assert!(ContentStreamId::new(cs.as_str()).is_ok());

        let id = NodeAggregateId::create();
        assert!(NodeAggregateId::new(id.as_str()).is_ok());
        assert_ne!(id, NodeAggregateId::create());
    }

    /// Deserialization runs the same validation as construction.
    #[test]
    fn test_identifier_serde_validates() {
        let ok: NodeAggregateId = serde_json::from_str("\"agg-1\"").unwrap();
        assert_eq!(ok.as_str(), "agg-1");

        let err = serde_json::from_str::<NodeAggregateId>("\"NOT VALID\"");
        assert!(err.is_err());

        assert_eq!(serde_json::to_string(&ok).unwrap(), "\"agg-1\"");
    }

    #[test]
    fn test_sequence_number_and_version() {
        assert_eq!(SequenceNumber::NONE.as_raw(), 0);
        assert_eq!(SequenceNumber::NONE.next(), SequenceNumber::from_raw(1));
        assert!(SequenceNumber::from_raw(2) > SequenceNumber::from_raw(1));
        assert_eq!(Version::from_raw(0).next().as_raw(), 1);
        assert!(NodeRelationAnchorPoint::ROOT.is_root());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            ContentStreamStatus::Created,
            ContentStreamStatus::Forked,
            ContentStreamStatus::InUseByWorkspace,
            ContentStreamStatus::Closed,
            ContentStreamStatus::RebaseError,
            ContentStreamStatus::NoLongerInUse,
        ] {
            assert_eq!(ContentStreamStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(WorkspaceStatus::parse("NOPE").is_err());
        assert_eq!(
            serde_json::to_string(&WorkspaceStatus::OutdatedConflict).unwrap(),
            "\"OUTDATED_CONFLICT\""
        );
    }

    #[test]
    fn test_subtree_tags_storage_format() {
        let mut tags = SubtreeTags::new();
        tags.explicit.insert(SubtreeTag::disabled());
        tags.inherited.insert(SubtreeTag::new("archived").unwrap());

        let json = tags.to_json();
        assert_eq!(json, r#"{"archived":null,"disabled":true}"#);
        assert_eq!(SubtreeTags::from_json(&json).unwrap(), tags);

        let child = tags.for_child();
        assert!(child.explicit.is_empty());
        assert_eq!(child.inherited.len(), 2);
        assert!(child.contains(&SubtreeTag::disabled()));
    }
}

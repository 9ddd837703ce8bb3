//! # Error Handling for SpiteGraph
//!
//! This module defines the error type used throughout the content repository.
//! Like the event store it grew out of, we use a single error enum ([`Error`])
//! for every failure mode, so callers can propagate with `?` and match where
//! they care.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Validation | Invalid identifier, wrong property type | Fix the input |
//! | Constraint | Node aggregate already exists, workspace missing | Fix the input or re-read state |
//! | Concurrency | Expected version mismatch | Re-read state and retry the command |
//! | Projection | Event references a missing node | Bug upstream, investigate |
//! | Rebase | Commands failed during rebase | Show the conflicts to the user |
//! | Domain invariant | Incomparable weights | Programming error |
//! | Internal | SQLite error, JSON error | Log and investigate |
//!
//! Validation and constraint errors are raised by the command handler *before*
//! any event is appended. Projection consistency violations are raised while
//! applying events and are fatal for the running catch-up.

use thiserror::Error;

use crate::rebase::CommandsThatFailedDuringRebase;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in content repository operations.
///
/// # Rust Pattern: Enum Variants
///
/// Each variant represents a distinct failure mode. The `#[error(...)]`
/// attribute defines the `Display` message, and [`Error::kind`] gives the
/// short, stable name that is recorded when a command fails during a rebase.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// An identifier (dimension id, node aggregate id, workspace name, ...)
    /// failed validation.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The dimension configuration is malformed (unknown values, cycles, ...).
    #[error("invalid dimension configuration: {0}")]
    InvalidDimensionConfiguration(String),

    /// The repository configuration could not be loaded or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A dimension space point outside the allowed dimension subspace was used.
    #[error("dimension space point {0} was not found in the allowed dimension subspace")]
    DimensionSpacePointNotFound(String),

    /// The requested node type is not configured.
    #[error("node type '{0}' not found")]
    NodeTypeNotFound(String),

    /// Abstract node types cannot be instantiated.
    #[error("node type '{0}' is abstract")]
    NodeTypeIsAbstract(String),

    /// A root node type was used where a regular one was expected.
    #[error("node type '{0}' is of type root")]
    NodeTypeIsOfTypeRoot(String),

    /// A regular node type was used where a root one was expected.
    #[error("node type '{0}' is not of type root")]
    NodeTypeIsNotOfTypeRoot(String),

    /// A property value does not match its declared type.
    #[error("property '{property}' of node type '{node_type}' expects a value of type {expected}")]
    InvalidPropertyType {
        /// The node type declaring the property
        node_type: String,
        /// The property name
        property: String,
        /// The declared property type
        expected: String,
    },

    /// A property that the node type does not declare was written.
    #[error("node type '{node_type}' does not declare property '{property}'")]
    UnknownProperty {
        /// The node type
        node_type: String,
        /// The undeclared property name
        property: String,
    },

    /// The node type does not declare the reference.
    #[error("node type '{node_type}' does not declare reference '{reference}'")]
    ReferenceCannotBeSet {
        /// The source node's type
        node_type: String,
        /// The undeclared reference name
        reference: String,
    },

    /// More targets than the reference declaration allows.
    #[error("reference '{reference}' of node type '{node_type}' allows at most {max_items} target(s), got {given}")]
    ReferenceCardinalityExceeded {
        node_type: String,
        reference: String,
        max_items: usize,
        given: usize,
    },

    // =========================================================================
    // Constraint Errors (state does not allow the command)
    // =========================================================================
    /// The content stream to create already exists.
    #[error("content stream '{0}' already exists")]
    ContentStreamAlreadyExists(String),

    /// The content stream does not exist (or has been removed).
    #[error("content stream '{0}' does not exist yet")]
    ContentStreamDoesNotExistYet(String),

    /// The content stream is closed and cannot receive further writes.
    #[error("content stream '{0}' is closed")]
    ContentStreamIsClosed(String),

    /// Only closed content streams can be reopened.
    #[error("content stream '{0}' is not closed")]
    ContentStreamIsNotClosed(String),

    /// A node aggregate with this id already exists in the content stream.
    #[error("node aggregate '{0}' already exists")]
    NodeAggregateCurrentlyExists(String),

    /// The node aggregate does not exist in the content stream.
    #[error("node aggregate '{0}' does not exist")]
    NodeAggregateCurrentlyDoesNotExist(String),

    /// The node aggregate does not cover the given dimension space point.
    #[error("node aggregate '{node_aggregate_id}' does not cover dimension space point {dimension_space_point}")]
    NodeAggregateDoesCurrentlyNotCoverDimensionSpacePoint {
        /// The node aggregate
        node_aggregate_id: String,
        /// The dimension space point in question
        dimension_space_point: String,
    },

    /// Root node aggregates cannot be moved, renamed or removed.
    #[error("node aggregate '{0}' is a root node aggregate")]
    NodeAggregateIsRoot(String),

    /// Tethered node aggregates are bound to their parent.
    #[error("node aggregate '{0}' is tethered")]
    NodeAggregateIsTethered(String),

    /// A move would make a node aggregate its own descendant.
    #[error("node aggregate '{node_aggregate_id}' is a descendant of '{ancestor}'")]
    NodeAggregateIsDescendant {
        /// The aggregate that would become the new parent
        node_aggregate_id: String,
        /// The aggregate being moved
        ancestor: String,
    },

    /// A sibling with the same node name already exists under the parent.
    #[error("node name '{node_name}' is already covered below parent '{parent}'")]
    NodeNameIsAlreadyCovered {
        /// The conflicting node name
        node_name: String,
        /// The parent node aggregate
        parent: String,
    },

    /// The node aggregate already occupies the target origin.
    #[error("node aggregate '{node_aggregate_id}' already occupies dimension space point {dimension_space_point}")]
    DimensionSpacePointIsAlreadyOccupied {
        /// The node aggregate
        node_aggregate_id: String,
        /// The occupied origin
        dimension_space_point: String,
    },

    /// The node aggregate does not occupy the given origin.
    #[error("node aggregate '{node_aggregate_id}' does not occupy dimension space point {dimension_space_point}")]
    DimensionSpacePointIsNotYetOccupied {
        /// The node aggregate
        node_aggregate_id: String,
        /// The origin that is not occupied
        dimension_space_point: String,
    },

    /// The subtree is already explicitly tagged.
    #[error("node aggregate '{node_aggregate_id}' is already tagged with '{tag}'")]
    SubtreeIsAlreadyTagged {
        /// The node aggregate
        node_aggregate_id: String,
        /// The tag
        tag: String,
    },

    /// The subtree is not explicitly tagged.
    #[error("node aggregate '{node_aggregate_id}' is not tagged with '{tag}'")]
    SubtreeIsNotTagged {
        /// The node aggregate
        node_aggregate_id: String,
        /// The tag
        tag: String,
    },

    /// A workspace with this name already exists.
    #[error("workspace '{0}' already exists")]
    WorkspaceAlreadyExists(String),

    /// The workspace does not exist.
    #[error("workspace '{0}' does not exist")]
    WorkspaceDoesNotExist(String),

    /// The workspace is a root workspace and has no base.
    #[error("workspace '{0}' has no base workspace")]
    WorkspaceHasNoBaseWorkspace(String),

    /// The base workspace referenced by a workspace is gone.
    #[error("base workspace of '{0}' does not exist")]
    BaseWorkspaceDoesNotExist(String),

    /// No content repository is registered under this id.
    #[error("content repository '{0}' is not registered")]
    ContentRepositoryNotFound(String),

    // =========================================================================
    // Concurrency Errors (re-read and retry)
    // =========================================================================
    /// Optimistic concurrency conflict: the event stream was appended to since
    /// it was last read.
    ///
    /// # Systems Concept: Optimistic Concurrency Control
    ///
    /// Every append states the version it expects the stream to be at. If
    /// another writer got there first, the versions disagree and the append is
    /// rejected as a whole. The issuing command must be retried against fresh
    /// state.
    #[error("conflict on stream '{stream_name}': expected version {expected}, but found {actual}")]
    Conflict {
        /// The event stream where the conflict occurred
        stream_name: String,
        /// The expected version as stated by the writer
        expected: String,
        /// The actual version of the stream
        actual: String,
    },

    /// The base content stream moved on since the workspace was forked.
    #[error("the base workspace has been modified in the meantime; please rebase (expected version {expected_version} of content stream '{content_stream_id}')")]
    BaseWorkspaceHasBeenModifiedInTheMeantime {
        /// The base content stream
        content_stream_id: String,
        /// The version recorded when the workspace was forked
        expected_version: u64,
    },

    // =========================================================================
    // Projection Errors (fatal, investigate)
    // =========================================================================
    /// An event could not be applied because the graph does not contain what
    /// the event refers to.
    #[error("projection consistency violation: {0}")]
    ProjectionConsistencyViolation(String),

    // =========================================================================
    // Rebase Errors (business outcome)
    // =========================================================================
    /// At least one command could not be replayed and the strategy was FAIL.
    #[error("workspace rebase failed: {0}")]
    WorkspaceRebaseFailed(CommandsThatFailedDuringRebase),

    // =========================================================================
    // Domain Invariant Errors (programming errors)
    // =========================================================================
    /// Two variation weights over different dimension combinations were compared.
    #[error("weights {left} and {right} are not comparable")]
    IncomparableWeights {
        /// The left weight
        left: String,
        /// The right weight
        right: String,
    },

    // =========================================================================
    // Internal Errors (investigate and fix)
    // =========================================================================
    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute generates `From<rusqlite::Error>`, so `?` on a
    /// rusqlite call converts automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization of an event, command or column failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema version mismatch, unknown event type or corrupt column.
    #[error("schema error: {0}")]
    Schema(String),

    /// The repository thread has shut down or dropped a response.
    #[error("content repository actor is gone: {0}")]
    ActorGone(String),

    /// A projection update subscriber fell behind and missed updates.
    #[error("subscription lagged behind by {0} updates")]
    SubscriptionLagged(u64),
}

impl Error {
    /// Returns the short variant name.
    ///
    /// This is the "cause class" recorded for commands that fail while a
    /// workspace is rebased.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidIdentifier(_) => "InvalidIdentifier",
            Error::InvalidDimensionConfiguration(_) => "InvalidDimensionConfiguration",
            Error::Config(_) => "Config",
            Error::DimensionSpacePointNotFound(_) => "DimensionSpacePointNotFound",
            Error::NodeTypeNotFound(_) => "NodeTypeNotFound",
            Error::NodeTypeIsAbstract(_) => "NodeTypeIsAbstract",
            Error::NodeTypeIsOfTypeRoot(_) => "NodeTypeIsOfTypeRoot",
            Error::NodeTypeIsNotOfTypeRoot(_) => "NodeTypeIsNotOfTypeRoot",
            Error::InvalidPropertyType { .. } => "InvalidPropertyType",
            Error::UnknownProperty { .. } => "UnknownProperty",
            Error::ReferenceCannotBeSet { .. } => "ReferenceCannotBeSet",
            Error::ReferenceCardinalityExceeded { .. } => "ReferenceCardinalityExceeded",
            Error::ContentStreamAlreadyExists(_) => "ContentStreamAlreadyExists",
            Error::ContentStreamDoesNotExistYet(_) => "ContentStreamDoesNotExistYet",
            Error::ContentStreamIsClosed(_) => "ContentStreamIsClosed",
            Error::ContentStreamIsNotClosed(_) => "ContentStreamIsNotClosed",
            Error::NodeAggregateCurrentlyExists(_) => "NodeAggregateCurrentlyExists",
            Error::NodeAggregateCurrentlyDoesNotExist(_) => "NodeAggregateCurrentlyDoesNotExist",
            Error::NodeAggregateDoesCurrentlyNotCoverDimensionSpacePoint { .. } => {
                "NodeAggregateDoesCurrentlyNotCoverDimensionSpacePoint"
            }
            Error::NodeAggregateIsRoot(_) => "NodeAggregateIsRoot",
            Error::NodeAggregateIsTethered(_) => "NodeAggregateIsTethered",
            Error::NodeAggregateIsDescendant { .. } => "NodeAggregateIsDescendant",
            Error::NodeNameIsAlreadyCovered { .. } => "NodeNameIsAlreadyCovered",
            Error::DimensionSpacePointIsAlreadyOccupied { .. } => {
                "DimensionSpacePointIsAlreadyOccupied"
            }
            Error::DimensionSpacePointIsNotYetOccupied { .. } => "DimensionSpacePointIsNotYetOccupied",
            Error::SubtreeIsAlreadyTagged { .. } => "SubtreeIsAlreadyTagged",
            Error::SubtreeIsNotTagged { .. } => "SubtreeIsNotTagged",
            Error::WorkspaceAlreadyExists(_) => "WorkspaceAlreadyExists",
            Error::WorkspaceDoesNotExist(_) => "WorkspaceDoesNotExist",
            Error::WorkspaceHasNoBaseWorkspace(_) => "WorkspaceHasNoBaseWorkspace",
            Error::BaseWorkspaceDoesNotExist(_) => "BaseWorkspaceDoesNotExist",
            Error::ContentRepositoryNotFound(_) => "ContentRepositoryNotFound",
            Error::Conflict { .. } => "Conflict",
            Error::BaseWorkspaceHasBeenModifiedInTheMeantime { .. } => {
                "BaseWorkspaceHasBeenModifiedInTheMeantime"
            }
            Error::ProjectionConsistencyViolation(_) => "ProjectionConsistencyViolation",
            Error::WorkspaceRebaseFailed(_) => "WorkspaceRebaseFailed",
            Error::IncomparableWeights { .. } => "IncomparableWeights",
            Error::Sqlite(_) => "Sqlite",
            Error::Json(_) => "Json",
            Error::Schema(_) => "Schema",
            Error::ActorGone(_) => "ActorGone",
            Error::SubscriptionLagged(_) => "SubscriptionLagged",
        }
    }

    /// Returns true if retrying the command against fresh state may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. } | Error::BaseWorkspaceHasBeenModifiedInTheMeantime { .. }
        )
    }

    /// Shorthand for a projection consistency violation.
    pub(crate) fn violation(message: impl Into<String>) -> Self {
        Error::ProjectionConsistencyViolation(message.into())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify error messages are formatted correctly.
    #[test]
    fn test_error_display() {
        let conflict = Error::Conflict {
            stream_name: "ContentStream:cs-1".to_string(),
            expected: "3".to_string(),
            actual: "5".to_string(),
        };
        assert_eq!(
            conflict.to_string(),
            "conflict on stream 'ContentStream:cs-1': expected version 3, but found 5"
        );

        let incomparable = Error::IncomparableWeights {
            left: "{language: 1}".to_string(),
            right: "{market: 0}".to_string(),
        };
        assert_eq!(
            incomparable.to_string(),
            "weights {language: 1} and {market: 0} are not comparable"
        );
    }

    /// Verify that rusqlite errors convert automatically.
    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();

        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
        assert_eq!(our_err.kind(), "Sqlite");
    }

    #[test]
    fn test_retryable_errors() {
        let conflict = Error::Conflict {
            stream_name: "s".to_string(),
            expected: "0".to_string(),
            actual: "1".to_string(),
        };
        assert!(conflict.is_retryable());
        assert!(!Error::violation("missing parent").is_retryable());
        assert!(!Error::NodeAggregateCurrentlyDoesNotExist("a".to_string()).is_retryable());
    }
}

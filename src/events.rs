//! # Domain Events
//!
//! Every state change of the content repository is recorded as one of the
//! [`EventKind`] variants. Events are immutable, JSON-serializable and
//! reconstructible from `(event_type, payload)`; that round trip is the
//! contract that keeps old event logs replayable, so payload field names
//! (camelCase) must never change.
//!
//! ## Event Families
//!
//! | Family | Stream | Examples |
//! |--------|--------|----------|
//! | Content stream | `ContentStream:<id>` | `ContentStreamWasForked`, `ContentStreamWasClosed` |
//! | Node | `ContentStream:<id>` | `NodeAggregateWithNodeWasCreated`, `NodePropertiesWereSet` |
//! | Workspace | `Workspace:<name>` | `WorkspaceWasRebased`, `WorkspaceWasPublished` |
//!
//! Node events are *publishable*: publishing a workspace copies them, with
//! their command metadata, onto the base workspace's content stream.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dimension::{DimensionSpacePoint, DimensionSpacePointSet};
use crate::error::Result;
use crate::event_store::{EventEnvelope, NewEvent};
use crate::types::{
    ContentStreamId, ContentStreamStatus, NodeAggregateClassification, NodeAggregateId, NodeName,
    NodeTypeName, PropertyValues, ReferenceName, SubtreeTag, Version, WorkspaceName,
};

// =============================================================================
// Shared Payload Parts
// =============================================================================

/// The succeeding sibling of a node in one covered dimension space point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterdimensionalSibling {
    /// The covered point
    pub dimension_space_point: DimensionSpacePoint,
    /// The node aggregate to insert before; `None` appends at the end
    pub node_aggregate_id: Option<NodeAggregateId>,
}

/// The succeeding siblings of a node for each point it covers.
///
/// The listed points *are* the coverage: a created or moved node is
/// connected exactly in these points.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InterdimensionalSiblings(Vec<InterdimensionalSibling>);

impl InterdimensionalSiblings {
    /// Creates the sibling list.
    pub fn new(siblings: Vec<InterdimensionalSibling>) -> Self {
        Self(siblings)
    }

    /// Uses the same succeeding sibling in every point.
    pub fn uniform(points: &DimensionSpacePointSet, sibling: Option<&NodeAggregateId>) -> Self {
        Self(
            points
                .iter()
                .map(|point| InterdimensionalSibling {
                    dimension_space_point: point.clone(),
                    node_aggregate_id: sibling.cloned(),
                })
                .collect(),
        )
    }

    /// Returns the covered points.
    pub fn points(&self) -> DimensionSpacePointSet {
        self.0.iter().map(|s| s.dimension_space_point.clone()).collect()
    }

    /// Iterates the entries.
    pub fn iter(&self) -> impl Iterator<Item = &InterdimensionalSibling> {
        self.0.iter()
    }

    /// Returns true if no point is covered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// =============================================================================
// Content Stream Events
// =============================================================================

/// A root content stream was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStreamWasCreated {
    pub content_stream_id: ContentStreamId,
}

/// A content stream was forked from a source stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStreamWasForked {
    pub new_content_stream_id: ContentStreamId,
    pub source_content_stream_id: ContentStreamId,
    /// Version of the source stream at fork time; publishing expects the
    /// source to still be at this version.
    pub version_of_source_content_stream: Version,
}

/// A content stream was closed for writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStreamWasClosed {
    pub content_stream_id: ContentStreamId,
}

/// A closed content stream was reopened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStreamWasReopened {
    pub content_stream_id: ContentStreamId,
    /// The status the stream had before it was closed
    pub previous_state: ContentStreamStatus,
}

/// A content stream was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentStreamWasRemoved {
    pub content_stream_id: ContentStreamId,
}

// =============================================================================
// Node Events
// =============================================================================

/// A root node aggregate was created below the virtual root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootNodeAggregateWithNodeWasCreated {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub node_type_name: NodeTypeName,
    pub covered_dimension_space_points: DimensionSpacePointSet,
    pub node_aggregate_classification: NodeAggregateClassification,
}

/// A node aggregate was created with its first node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAggregateWithNodeWasCreated {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub node_type_name: NodeTypeName,
    pub origin_dimension_space_point: DimensionSpacePoint,
    pub succeeding_siblings_for_coverage: InterdimensionalSiblings,
    pub parent_node_aggregate_id: NodeAggregateId,
    pub node_name: Option<NodeName>,
    pub initial_property_values: PropertyValues,
    pub node_aggregate_classification: NodeAggregateClassification,
}

/// Properties of one node variant were set and/or unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePropertiesWereSet {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub origin_dimension_space_point: DimensionSpacePoint,
    pub property_values: PropertyValues,
    #[serde(default)]
    pub properties_to_unset: BTreeSet<String>,
}

/// One reference as recorded in [`NodeReferencesWereSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedNodeReference {
    pub target_node_aggregate_id: NodeAggregateId,
    #[serde(default)]
    pub properties: Option<PropertyValues>,
}

/// The references of one name were replaced on some variants of a node
/// aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReferencesWereSet {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub affected_source_origin_dimension_space_points: DimensionSpacePointSet,
    pub reference_name: ReferenceName,
    pub references: Vec<SerializedNodeReference>,
}

/// A node aggregate was moved to a new parent and/or new siblings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAggregateWasMoved {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    /// `None` keeps the parent and only reorders
    pub new_parent_node_aggregate_id: Option<NodeAggregateId>,
    pub succeeding_siblings_for_coverage: InterdimensionalSiblings,
}

/// A node aggregate was removed from some points, with its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAggregateWasRemoved {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub affected_occupied_dimension_space_points: DimensionSpacePointSet,
    pub affected_covered_dimension_space_points: DimensionSpacePointSet,
}

/// All nodes of an aggregate got a new name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAggregateNameWasChanged {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub new_node_name: NodeName,
}

/// All nodes of an aggregate got a new node type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAggregateTypeWasChanged {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub new_node_type_name: NodeTypeName,
}

/// A node variant was created in a specialization of its source origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpecializationVariantWasCreated {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub source_origin: DimensionSpacePoint,
    pub specialization_origin: DimensionSpacePoint,
    pub specialization_siblings: InterdimensionalSiblings,
}

/// A node variant was created in a generalization of its source origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeGeneralizationVariantWasCreated {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub source_origin: DimensionSpacePoint,
    pub generalization_origin: DimensionSpacePoint,
    pub variant_succeeding_siblings: InterdimensionalSiblings,
}

/// A node variant was created in a peer of its source origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePeerVariantWasCreated {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub source_origin: DimensionSpacePoint,
    pub peer_origin: DimensionSpacePoint,
    pub peer_succeeding_siblings: InterdimensionalSiblings,
}

/// A subtree was tagged in some points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtreeWasTagged {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub affected_dimension_space_points: DimensionSpacePointSet,
    pub tag: SubtreeTag,
}

/// A subtree tag was removed in some points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtreeWasUntagged {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub affected_dimension_space_points: DimensionSpacePointSet,
    pub tag: SubtreeTag,
}

// =============================================================================
// Workspace Events
// =============================================================================

/// A root workspace (no base) was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootWorkspaceWasCreated {
    pub workspace_name: WorkspaceName,
    pub workspace_title: String,
    pub workspace_description: String,
    pub new_content_stream_id: ContentStreamId,
}

/// A workspace on top of a base workspace was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceWasCreated {
    pub workspace_name: WorkspaceName,
    pub base_workspace_name: WorkspaceName,
    pub workspace_title: String,
    pub workspace_description: String,
    pub new_content_stream_id: ContentStreamId,
}

/// A workspace now points at a rebased content stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceWasRebased {
    pub workspace_name: WorkspaceName,
    pub new_content_stream_id: ContentStreamId,
    pub previous_content_stream_id: ContentStreamId,
}

/// A rebase attempt failed; the workspace keeps its content stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRebaseFailed {
    pub workspace_name: WorkspaceName,
    pub candidate_content_stream_id: ContentStreamId,
    pub previous_content_stream_id: ContentStreamId,
}

/// All changes of a workspace were published to its base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceWasPublished {
    pub source_workspace_name: WorkspaceName,
    pub target_workspace_name: WorkspaceName,
    pub new_source_content_stream_id: ContentStreamId,
    pub previous_source_content_stream_id: ContentStreamId,
}

/// All changes of a workspace were discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceWasDiscarded {
    pub workspace_name: WorkspaceName,
    pub new_content_stream_id: ContentStreamId,
    pub previous_content_stream_id: ContentStreamId,
}

/// A workspace was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceWasRemoved {
    pub workspace_name: WorkspaceName,
}

// =============================================================================
// Event Enum
// =============================================================================

payload_enum! {
    /// Every domain event, one payload struct per variant.
    ///
    /// # Rust Pattern: Tagged Union
    ///
    /// Handlers `match` on the variant; adding a variant makes every
    /// non-exhaustive handler fail to compile until it decides what to do.
    #[derive(Debug, Clone, PartialEq)]
    pub enum EventKind {
        ContentStreamWasCreated(ContentStreamWasCreated),
        ContentStreamWasForked(ContentStreamWasForked),
        ContentStreamWasClosed(ContentStreamWasClosed),
        ContentStreamWasReopened(ContentStreamWasReopened),
        ContentStreamWasRemoved(ContentStreamWasRemoved),
        RootNodeAggregateWithNodeWasCreated(RootNodeAggregateWithNodeWasCreated),
        NodeAggregateWithNodeWasCreated(NodeAggregateWithNodeWasCreated),
        NodePropertiesWereSet(NodePropertiesWereSet),
        NodeReferencesWereSet(NodeReferencesWereSet),
        NodeAggregateWasMoved(NodeAggregateWasMoved),
        NodeAggregateWasRemoved(NodeAggregateWasRemoved),
        NodeAggregateNameWasChanged(NodeAggregateNameWasChanged),
        NodeAggregateTypeWasChanged(NodeAggregateTypeWasChanged),
        NodeSpecializationVariantWasCreated(NodeSpecializationVariantWasCreated),
        NodeGeneralizationVariantWasCreated(NodeGeneralizationVariantWasCreated),
        NodePeerVariantWasCreated(NodePeerVariantWasCreated),
        SubtreeWasTagged(SubtreeWasTagged),
        SubtreeWasUntagged(SubtreeWasUntagged),
        RootWorkspaceWasCreated(RootWorkspaceWasCreated),
        WorkspaceWasCreated(WorkspaceWasCreated),
        WorkspaceWasRebased(WorkspaceWasRebased),
        WorkspaceRebaseFailed(WorkspaceRebaseFailed),
        WorkspaceWasPublished(WorkspaceWasPublished),
        WorkspaceWasDiscarded(WorkspaceWasDiscarded),
        WorkspaceWasRemoved(WorkspaceWasRemoved),
    }
}

/// Expands `$body` for every node event variant, binding the payload as `$e`.
macro_rules! for_node_events {
    ($event:expr, $e:ident => $body:expr, _ => $otherwise:expr) => {
        match $event {
            EventKind::RootNodeAggregateWithNodeWasCreated($e) => $body,
            EventKind::NodeAggregateWithNodeWasCreated($e) => $body,
            EventKind::NodePropertiesWereSet($e) => $body,
            EventKind::NodeReferencesWereSet($e) => $body,
            EventKind::NodeAggregateWasMoved($e) => $body,
            EventKind::NodeAggregateWasRemoved($e) => $body,
            EventKind::NodeAggregateNameWasChanged($e) => $body,
            EventKind::NodeAggregateTypeWasChanged($e) => $body,
            EventKind::NodeSpecializationVariantWasCreated($e) => $body,
            EventKind::NodeGeneralizationVariantWasCreated($e) => $body,
            EventKind::NodePeerVariantWasCreated($e) => $body,
            EventKind::SubtreeWasTagged($e) => $body,
            EventKind::SubtreeWasUntagged($e) => $body,
            _ => $otherwise,
        }
    };
}

impl EventKind {
    /// Decodes a stored event.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self> {
        Self::from_json_value(&envelope.event_type, envelope.payload.clone())
    }

    /// Encodes the event for appending, with optional metadata.
    pub fn to_new_event(&self, metadata: Option<&EventMetadata>) -> Result<NewEvent> {
        let event = NewEvent::new(self.type_name(), self.to_json_value()?);
        Ok(match metadata {
            Some(metadata) => event.with_metadata(serde_json::to_value(metadata)?),
            None => event,
        })
    }

    /// The content stream this event changes, if it is stream scoped.
    ///
    /// For a fork this is the *new* stream.
    pub fn content_stream_id(&self) -> Option<&ContentStreamId> {
        match self {
            EventKind::ContentStreamWasCreated(e) => Some(&e.content_stream_id),
            EventKind::ContentStreamWasForked(e) => Some(&e.new_content_stream_id),
            EventKind::ContentStreamWasClosed(e) => Some(&e.content_stream_id),
            EventKind::ContentStreamWasReopened(e) => Some(&e.content_stream_id),
            EventKind::ContentStreamWasRemoved(e) => Some(&e.content_stream_id),
            other => for_node_events!(other, e => Some(&e.content_stream_id), _ => None),
        }
    }

    /// Returns true for node events, the ones publishing copies.
    pub fn is_publishable(&self) -> bool {
        for_node_events!(self, _e => true, _ => false)
    }

    /// Returns a copy of a node event aimed at another content stream.
    ///
    /// Returns `None` for events that are not publishable.
    pub fn with_content_stream_id(&self, content_stream_id: &ContentStreamId) -> Option<Self> {
        let mut copy = self.clone();
        let retargeted = for_node_events!(&mut copy, e => {
            e.content_stream_id = content_stream_id.clone();
            true
        }, _ => false);
        retargeted.then_some(copy)
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Metadata attached to the first event of every node command, so rebase
/// can re-issue the command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// The command's type name, e.g. `SetNodeProperties`
    pub command_class: String,
    /// The command's JSON payload
    pub command_payload: Value,
}

impl EventMetadata {
    /// Reads metadata from a stored event, if it carries a command.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Option<Self>> {
        match &envelope.metadata {
            Some(value) if value.get("commandClass").is_some() => {
                Ok(Some(serde_json::from_value(value.clone())?))
            }
            _ => Ok(None),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

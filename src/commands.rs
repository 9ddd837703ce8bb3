//! # Commands
//!
//! Commands are immutable requests named `<Verb><Noun>`. The command handler
//! validates a command against the current projected state and, if it is
//! allowed, appends the events describing its effect.
//!
//! ## Rebase Support
//!
//! Node commands carry the content stream they target. The handler stores
//! each node command in the metadata of its first event:
//!
//! ```text
//! metadata: { "commandClass": "SetNodeProperties", "commandPayload": {...} }
//! ```
//!
//! A rebase reads these back in order, retargets them onto the new content
//! stream with [`Command::with_content_stream_id`] and handles them again.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::dimension::DimensionSpacePoint;
use crate::error::Result;
use crate::events::EventMetadata;
use crate::types::{
    ContentStreamId, ContentStreamStatus, NodeAggregateId, NodeName, NodeTypeName, PropertyValues,
    ReferenceName, SubtreeTag, WorkspaceName,
};

// =============================================================================
// Strategies
// =============================================================================

/// Which variants of a node aggregate a move affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RelationDistributionStrategy {
    /// Only the given dimension space point
    Scatter,
    /// Every point the aggregate covers, across all of its variants
    GatherAll,
    /// The given point and its specializations the aggregate covers
    GatherSpecializations,
}

/// Which variants of a node aggregate a removal or tagging affects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeVariantSelectionStrategy {
    /// Every covered point of the aggregate
    AllVariants,
    /// The given point and its covered specializations
    AllSpecializations,
}

/// What a rebase does with commands that no longer apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RebaseErrorHandlingStrategy {
    /// Abort the whole rebase on the first failing command
    #[default]
    Fail,
    /// Skip failing commands and rebase anyway
    Force,
}

// =============================================================================
// Content Stream Commands
// =============================================================================

/// Creates an empty root content stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContentStream {
    pub content_stream_id: ContentStreamId,
}

/// Forks `source_content_stream_id` into a new stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkContentStream {
    pub content_stream_id: ContentStreamId,
    pub source_content_stream_id: ContentStreamId,
}

/// Closes a content stream for writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseContentStream {
    pub content_stream_id: ContentStreamId,
}

/// Reopens a closed content stream with its previous status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReopenContentStream {
    pub content_stream_id: ContentStreamId,
    pub previous_state: ContentStreamStatus,
}

/// Removes a content stream and its graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveContentStream {
    pub content_stream_id: ContentStreamId,
}

// =============================================================================
// Node Commands
// =============================================================================

/// Creates a root node aggregate covering every allowed point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRootNodeAggregateWithNode {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub node_type_name: NodeTypeName,
}

/// Creates a node aggregate with one node at `origin_dimension_space_point`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeAggregateWithNode {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub node_type_name: NodeTypeName,
    pub origin_dimension_space_point: DimensionSpacePoint,
    pub parent_node_aggregate_id: NodeAggregateId,
    #[serde(default)]
    pub succeeding_sibling_node_aggregate_id: Option<NodeAggregateId>,
    #[serde(default)]
    pub node_name: Option<NodeName>,
    #[serde(default)]
    pub initial_property_values: PropertyValues,
    /// Ids for tethered descendants, keyed by node name path (`main/column0`).
    /// Missing ids are generated and written back before the command is
    /// stored, so a rebase recreates the same ids.
    #[serde(default)]
    pub tethered_descendant_node_aggregate_ids: BTreeMap<String, NodeAggregateId>,
}

impl CreateNodeAggregateWithNode {
    /// Creates the command with no name, sibling or initial values.
    pub fn new(
        content_stream_id: ContentStreamId,
        node_aggregate_id: NodeAggregateId,
        node_type_name: NodeTypeName,
        origin_dimension_space_point: DimensionSpacePoint,
        parent_node_aggregate_id: NodeAggregateId,
    ) -> Self {
        Self {
            content_stream_id,
            node_aggregate_id,
            node_type_name,
            origin_dimension_space_point,
            parent_node_aggregate_id,
            succeeding_sibling_node_aggregate_id: None,
            node_name: None,
            initial_property_values: PropertyValues::new(),
            tethered_descendant_node_aggregate_ids: BTreeMap::new(),
        }
    }

    /// Sets the node name.
    pub fn with_node_name(mut self, node_name: NodeName) -> Self {
        self.node_name = Some(node_name);
        self
    }

    /// Inserts the node before this sibling.
    pub fn with_succeeding_sibling(mut self, sibling: NodeAggregateId) -> Self {
        self.succeeding_sibling_node_aggregate_id = Some(sibling);
        self
    }

    /// Sets the initial property values.
    pub fn with_initial_property_values(mut self, values: PropertyValues) -> Self {
        self.initial_property_values = values;
        self
    }

    /// Fixes the id of a tethered descendant.
    pub fn with_tethered_descendant(mut self, path: impl Into<String>, id: NodeAggregateId) -> Self {
        self.tethered_descendant_node_aggregate_ids.insert(path.into(), id);
        self
    }
}

/// Sets and unsets properties of one node variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetNodeProperties {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub origin_dimension_space_point: DimensionSpacePoint,
    pub property_values: PropertyValues,
    #[serde(default)]
    pub properties_to_unset: BTreeSet<String>,
}

impl SetNodeProperties {
    /// Creates the command.
    pub fn new(
        content_stream_id: ContentStreamId,
        node_aggregate_id: NodeAggregateId,
        origin_dimension_space_point: DimensionSpacePoint,
        property_values: PropertyValues,
    ) -> Self {
        Self {
            content_stream_id,
            node_aggregate_id,
            origin_dimension_space_point,
            property_values,
            properties_to_unset: BTreeSet::new(),
        }
    }

    /// Also unsets these properties.
    pub fn with_properties_to_unset<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties_to_unset.extend(names.into_iter().map(Into::into));
        self
    }
}

/// One target of a reference, with the properties of the reference edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReferenceToWrite {
    pub target_node_aggregate_id: NodeAggregateId,
    #[serde(default)]
    pub properties: Option<PropertyValues>,
}

impl NodeReferenceToWrite {
    /// A reference without properties.
    pub fn to(target_node_aggregate_id: NodeAggregateId) -> Self {
        Self {
            target_node_aggregate_id,
            properties: None,
        }
    }

    pub fn with_properties(mut self, properties: PropertyValues) -> Self {
        self.properties = Some(properties);
        self
    }
}

/// Replaces all references of one name on one node variant. An empty list
/// removes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetNodeReferences {
    pub content_stream_id: ContentStreamId,
    pub source_node_aggregate_id: NodeAggregateId,
    pub source_origin_dimension_space_point: DimensionSpacePoint,
    pub reference_name: ReferenceName,
    /// Targets in order
    pub references: Vec<NodeReferenceToWrite>,
}

/// Moves a node aggregate to a new parent and/or before a new sibling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveNodeAggregate {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub dimension_space_point: DimensionSpacePoint,
    #[serde(default)]
    pub new_parent_node_aggregate_id: Option<NodeAggregateId>,
    #[serde(default)]
    pub new_succeeding_sibling_node_aggregate_id: Option<NodeAggregateId>,
    pub relation_distribution_strategy: RelationDistributionStrategy,
}

impl MoveNodeAggregate {
    /// Creates a move that keeps parent and siblings; refine with the
    /// `with_*` methods.
    pub fn new(
        content_stream_id: ContentStreamId,
        node_aggregate_id: NodeAggregateId,
        dimension_space_point: DimensionSpacePoint,
        relation_distribution_strategy: RelationDistributionStrategy,
    ) -> Self {
        Self {
            content_stream_id,
            node_aggregate_id,
            dimension_space_point,
            new_parent_node_aggregate_id: None,
            new_succeeding_sibling_node_aggregate_id: None,
            relation_distribution_strategy,
        }
    }

    /// Moves below a new parent.
    pub fn with_new_parent(mut self, parent: NodeAggregateId) -> Self {
        self.new_parent_node_aggregate_id = Some(parent);
        self
    }

    /// Moves before a new succeeding sibling.
    pub fn with_new_succeeding_sibling(mut self, sibling: NodeAggregateId) -> Self {
        self.new_succeeding_sibling_node_aggregate_id = Some(sibling);
        self
    }
}

/// Removes a node aggregate (with descendants) from some covered points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveNodeAggregate {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub covered_dimension_space_point: DimensionSpacePoint,
    pub node_variant_selection_strategy: NodeVariantSelectionStrategy,
}

/// Renames every node of an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNodeAggregateName {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub new_node_name: NodeName,
}

/// Changes the node type of an aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNodeAggregateType {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub new_node_type_name: NodeTypeName,
}

/// Creates a variant of a node at another origin. Whether it becomes a
/// specialization, generalization or peer variant is decided by the
/// variation graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodeVariant {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub source_origin: DimensionSpacePoint,
    pub target_origin: DimensionSpacePoint,
}

/// Adds an explicit tag to a node aggregate and its descendants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSubtree {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub covered_dimension_space_point: DimensionSpacePoint,
    pub node_variant_selection_strategy: NodeVariantSelectionStrategy,
    pub tag: SubtreeTag,
}

/// Removes an explicit tag from a node aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UntagSubtree {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub covered_dimension_space_point: DimensionSpacePoint,
    pub node_variant_selection_strategy: NodeVariantSelectionStrategy,
    pub tag: SubtreeTag,
}

/// Tags a node aggregate with `disabled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisableNodeAggregate {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub covered_dimension_space_point: DimensionSpacePoint,
    pub node_variant_selection_strategy: NodeVariantSelectionStrategy,
}

/// Removes the `disabled` tag from a node aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableNodeAggregate {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub covered_dimension_space_point: DimensionSpacePoint,
    pub node_variant_selection_strategy: NodeVariantSelectionStrategy,
}

impl From<DisableNodeAggregate> for TagSubtree {
    fn from(c: DisableNodeAggregate) -> Self {
        TagSubtree {
            content_stream_id: c.content_stream_id,
            node_aggregate_id: c.node_aggregate_id,
            covered_dimension_space_point: c.covered_dimension_space_point,
            node_variant_selection_strategy: c.node_variant_selection_strategy,
            tag: SubtreeTag::disabled(),
        }
    }
}

impl From<EnableNodeAggregate> for UntagSubtree {
    fn from(c: EnableNodeAggregate) -> Self {
        UntagSubtree {
            content_stream_id: c.content_stream_id,
            node_aggregate_id: c.node_aggregate_id,
            covered_dimension_space_point: c.covered_dimension_space_point,
            node_variant_selection_strategy: c.node_variant_selection_strategy,
            tag: SubtreeTag::disabled(),
        }
    }
}

// =============================================================================
// Workspace Commands
// =============================================================================

/// Creates a root workspace with a fresh root content stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRootWorkspace {
    pub workspace_name: WorkspaceName,
    pub workspace_title: String,
    pub workspace_description: String,
    pub new_content_stream_id: ContentStreamId,
}

impl CreateRootWorkspace {
    /// Creates the command with a generated content stream id.
    pub fn new(workspace_name: WorkspaceName) -> Self {
        Self {
            workspace_title: workspace_name.to_string(),
            workspace_description: String::new(),
            workspace_name,
            new_content_stream_id: ContentStreamId::create(),
        }
    }
}

/// Creates a workspace on top of a base workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspace {
    pub workspace_name: WorkspaceName,
    pub base_workspace_name: WorkspaceName,
    pub workspace_title: String,
    pub workspace_description: String,
    pub new_content_stream_id: ContentStreamId,
}

impl CreateWorkspace {
    /// Creates the command with a generated content stream id.
    pub fn new(workspace_name: WorkspaceName, base_workspace_name: WorkspaceName) -> Self {
        Self {
            workspace_title: workspace_name.to_string(),
            workspace_description: String::new(),
            workspace_name,
            base_workspace_name,
            new_content_stream_id: ContentStreamId::create(),
        }
    }
}

/// Replays a workspace's changes on top of its base's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebaseWorkspace {
    pub workspace_name: WorkspaceName,
    pub rebased_content_stream_id: ContentStreamId,
    #[serde(default)]
    pub rebase_error_handling_strategy: RebaseErrorHandlingStrategy,
}

impl RebaseWorkspace {
    /// Creates a FAIL-strategy rebase with a generated content stream id.
    pub fn new(workspace_name: WorkspaceName) -> Self {
        Self {
            workspace_name,
            rebased_content_stream_id: ContentStreamId::create(),
            rebase_error_handling_strategy: RebaseErrorHandlingStrategy::Fail,
        }
    }

    /// Uses the given error handling strategy.
    pub fn with_strategy(mut self, strategy: RebaseErrorHandlingStrategy) -> Self {
        self.rebase_error_handling_strategy = strategy;
        self
    }
}

/// Publishes all changes of a workspace to its base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishWorkspace {
    pub workspace_name: WorkspaceName,
    pub new_content_stream_id: ContentStreamId,
}

impl PublishWorkspace {
    /// Creates the command with a generated content stream id.
    pub fn new(workspace_name: WorkspaceName) -> Self {
        Self {
            workspace_name,
            new_content_stream_id: ContentStreamId::create(),
        }
    }
}

/// Throws away all changes of a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscardWorkspace {
    pub workspace_name: WorkspaceName,
    pub new_content_stream_id: ContentStreamId,
}

impl DiscardWorkspace {
    /// Creates the command with a generated content stream id.
    pub fn new(workspace_name: WorkspaceName) -> Self {
        Self {
            workspace_name,
            new_content_stream_id: ContentStreamId::create(),
        }
    }
}

/// Deletes a workspace and its content stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteWorkspace {
    pub workspace_name: WorkspaceName,
}

// =============================================================================
// Command Enum
// =============================================================================

payload_enum! {
    /// Every command the repository handles.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Command {
        CreateContentStream(CreateContentStream),
        ForkContentStream(ForkContentStream),
        CloseContentStream(CloseContentStream),
        ReopenContentStream(ReopenContentStream),
        RemoveContentStream(RemoveContentStream),
        CreateRootNodeAggregateWithNode(CreateRootNodeAggregateWithNode),
        CreateNodeAggregateWithNode(CreateNodeAggregateWithNode),
        SetNodeProperties(SetNodeProperties),
        SetNodeReferences(SetNodeReferences),
        MoveNodeAggregate(MoveNodeAggregate),
        RemoveNodeAggregate(RemoveNodeAggregate),
        ChangeNodeAggregateName(ChangeNodeAggregateName),
        ChangeNodeAggregateType(ChangeNodeAggregateType),
        CreateNodeVariant(CreateNodeVariant),
        TagSubtree(TagSubtree),
        UntagSubtree(UntagSubtree),
        DisableNodeAggregate(DisableNodeAggregate),
        EnableNodeAggregate(EnableNodeAggregate),
        CreateRootWorkspace(CreateRootWorkspace),
        CreateWorkspace(CreateWorkspace),
        RebaseWorkspace(RebaseWorkspace),
        PublishWorkspace(PublishWorkspace),
        DiscardWorkspace(DiscardWorkspace),
        DeleteWorkspace(DeleteWorkspace),
    }
}

/// Expands `$body` for every node command variant, binding the payload.
macro_rules! for_node_commands {
    ($command:expr, $c:ident => $body:expr, _ => $otherwise:expr) => {
        match $command {
            Command::CreateRootNodeAggregateWithNode($c) => $body,
            Command::CreateNodeAggregateWithNode($c) => $body,
            Command::SetNodeProperties($c) => $body,
            Command::SetNodeReferences($c) => $body,
            Command::MoveNodeAggregate($c) => $body,
            Command::RemoveNodeAggregate($c) => $body,
            Command::ChangeNodeAggregateName($c) => $body,
            Command::ChangeNodeAggregateType($c) => $body,
            Command::CreateNodeVariant($c) => $body,
            Command::TagSubtree($c) => $body,
            Command::UntagSubtree($c) => $body,
            Command::DisableNodeAggregate($c) => $body,
            Command::EnableNodeAggregate($c) => $body,
            _ => $otherwise,
        }
    };
}

impl Command {
    /// Returns true for node commands, the ones a rebase replays.
    pub fn is_rebasable(&self) -> bool {
        for_node_commands!(self, _c => true, _ => false)
    }

    /// The content stream a node command writes to.
    pub fn content_stream_id(&self) -> Option<&ContentStreamId> {
        for_node_commands!(self, c => Some(&c.content_stream_id), _ => None)
    }

    /// Returns a copy aimed at another content stream. Commands that are not
    /// node commands are returned unchanged.
    pub fn with_content_stream_id(&self, content_stream_id: &ContentStreamId) -> Self {
        let mut copy = self.clone();
        for_node_commands!(&mut copy, c => {
            c.content_stream_id = content_stream_id.clone();
        }, _ => ());
        copy
    }

    /// Encodes the command as event metadata.
    pub fn to_metadata(&self) -> Result<EventMetadata> {
        Ok(EventMetadata {
            command_class: self.type_name().to_string(),
            command_payload: self.to_json_value()?,
        })
    }

    /// Decodes a command from event metadata.
    pub fn from_metadata(metadata: &EventMetadata) -> Result<Self> {
        Self::from_json_value(&metadata.command_class, metadata.command_payload.clone())
    }
}

// =============================================================================
// Tests
// =============================================================================

//! # Command Handler
//!
//! Validates commands against the projected state and appends the events
//! that describe their effect.
//!
//! ```text
//!   Command ──► constraint checks ──► events ──► append(expected version) ──► catch-up
//!                (read projections)               │
//!                                                 └─ Conflict if the stream moved on
//! ```
//!
//! All constraint checks run before anything is appended; a rejected command
//! leaves no trace in the log.
//!
//! ## Coverage Is Decided Here
//!
//! The projection never consults the dimension configuration. Which points a
//! new node or variant covers, which points a move, removal or tag affects,
//! and which sibling a node goes before in each point are all computed here
//! and written into the event.
//!
//! ## Node Commands Carry Themselves
//!
//! The first event of every node command carries the command as metadata
//! (see [`crate::commands`]). Before that, the handler completes the command
//! where it generated data: tethered child ids are written back into
//! `CreateNodeAggregateWithNode`, so a rebase recreates the same ids.

use std::collections::BTreeMap;

use tracing::debug;

use crate::commands::{
    ChangeNodeAggregateName, ChangeNodeAggregateType, CloseContentStream, Command, CreateContentStream,
    CreateNodeAggregateWithNode, CreateNodeVariant, CreateRootNodeAggregateWithNode, CreateRootWorkspace,
    CreateWorkspace, ForkContentStream, MoveNodeAggregate, NodeVariantSelectionStrategy, RelationDistributionStrategy,
    RemoveContentStream, RemoveNodeAggregate, ReopenContentStream, SetNodeProperties, SetNodeReferences, TagSubtree,
    UntagSubtree,
};
use crate::content_graph::{ContentGraph, NodeAggregate};
use crate::dimension::{DimensionSpacePoint, DimensionSpacePointSet, VariantType};
use crate::error::{Error, Result};
use crate::event_store::{ExpectedVersion, NewEvent, StreamName};
use crate::events::{
    ContentStreamWasClosed, ContentStreamWasCreated, ContentStreamWasForked, ContentStreamWasRemoved,
    ContentStreamWasReopened, EventKind, InterdimensionalSibling, InterdimensionalSiblings,
    NodeAggregateNameWasChanged, NodeAggregateTypeWasChanged, NodeAggregateWasMoved, NodeAggregateWasRemoved,
    NodeAggregateWithNodeWasCreated, NodeGeneralizationVariantWasCreated, NodePeerVariantWasCreated,
    NodePropertiesWereSet, NodeReferencesWereSet, NodeSpecializationVariantWasCreated,
    RootNodeAggregateWithNodeWasCreated, RootWorkspaceWasCreated, SerializedNodeReference, SubtreeWasTagged,
    SubtreeWasUntagged, WorkspaceWasCreated,
};
use crate::node_types::NodeTypeManager;
use crate::projection::content_stream::ContentStreamRecord;
use crate::projection::workspace::Workspace;
use crate::rebase::WorkspaceRebaseStatistics;
use crate::repository::ContentRepository;
use crate::types::{
    ContentStreamId, NodeAggregateClassification, NodeAggregateId, NodeName, NodeTypeName, PropertyValues,
    SequenceNumber, WorkspaceName,
};

/// Tethered children may nest, but not forever.
const MAX_TETHERED_DEPTH: usize = 16;

/// Outcome of a handled command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    /// Sequence number of the last event the command appended
    pub last_sequence_number: SequenceNumber,
    /// Set for `RebaseWorkspace`
    pub rebase_statistics: Option<WorkspaceRebaseStatistics>,
}

impl CommandResult {
    pub(crate) fn new(last_sequence_number: SequenceNumber) -> Self {
        Self {
            last_sequence_number,
            rebase_statistics: None,
        }
    }
}

impl ContentRepository {
    /// Handles one command.
    ///
    /// On success the events are appended and the projections are caught
    /// up, so queries see the command's effect right away.
    ///
    /// # Errors
    ///
    /// Validation and constraint errors before anything is appended;
    /// [`Error::Conflict`] if the target stream moved on; projection errors
    /// from the catch-up that follows the append.
    pub fn handle(&mut self, command: Command) -> Result<CommandResult> {
        let command_type = command.type_name();
        self.catch_up()?;
        let result = self.dispatch(command);
        match &result {
            Ok(outcome) => debug!(
                command = command_type,
                last_sequence_number = %outcome.last_sequence_number,
                "command handled"
            ),
            Err(e) => debug!(command = command_type, error = %e, "command rejected"),
        }
        result
    }

    fn dispatch(&mut self, command: Command) -> Result<CommandResult> {
        match command {
            Command::CreateContentStream(c) => self.create_content_stream(c),
            Command::ForkContentStream(c) => self.fork_content_stream(c),
            Command::CloseContentStream(c) => self.close_content_stream(c),
            Command::ReopenContentStream(c) => self.reopen_content_stream(c),
            Command::RemoveContentStream(c) => self.remove_content_stream(&c.content_stream_id),
            Command::CreateRootWorkspace(c) => self.create_root_workspace(c),
            Command::CreateWorkspace(c) => self.create_workspace(c),
            Command::RebaseWorkspace(c) => self.rebase_workspace(c),
            Command::PublishWorkspace(c) => self.publish_workspace(c),
            Command::DiscardWorkspace(c) => self.discard_workspace(c),
            Command::DeleteWorkspace(c) => self.delete_workspace(c),
            node_command => self.handle_node_command(node_command),
        }
    }

    /// Appends and catches up.
    pub(crate) fn commit(
        &mut self,
        stream_name: &StreamName,
        events: Vec<NewEvent>,
        expected: ExpectedVersion,
    ) -> Result<SequenceNumber> {
        let appended = self
            .event_store
            .append(self.db.connection(), stream_name, events, expected)?;
        self.catch_up()?;
        Ok(appended.last_sequence_number)
    }

    fn commit_event(
        &mut self,
        stream_name: &StreamName,
        event: EventKind,
        expected: ExpectedVersion,
    ) -> Result<CommandResult> {
        let last = self.commit(stream_name, vec![event.to_new_event(None)?], expected)?;
        Ok(CommandResult::new(last))
    }

    // =========================================================================
    // Shared Constraint Checks
    // =========================================================================

    /// The stream's projection record; removed streams count as missing.
    pub(crate) fn require_content_stream(&self, content_stream_id: &ContentStreamId) -> Result<ContentStreamRecord> {
        match self.content_streams().find_by_id(content_stream_id)? {
            Some(record) if !record.removed => Ok(record),
            _ => Err(Error::ContentStreamDoesNotExistYet(content_stream_id.to_string())),
        }
    }

    /// The version to expect when appending to the stream, read from the
    /// database so another writer's appends count.
    fn require_stream_version(&self, content_stream_id: &ContentStreamId) -> Result<ExpectedVersion> {
        self.event_store
            .read_stream_version(self.db.connection(), &StreamName::for_content_stream(content_stream_id))?
            .map(ExpectedVersion::Exact)
            .ok_or_else(|| Error::ContentStreamDoesNotExistYet(content_stream_id.to_string()))
    }

    fn require_writable_content_stream(&self, content_stream_id: &ContentStreamId) -> Result<ExpectedVersion> {
        if self.require_content_stream(content_stream_id)?.is_closed() {
            return Err(Error::ContentStreamIsClosed(content_stream_id.to_string()));
        }
        self.require_stream_version(content_stream_id)
    }

    pub(crate) fn require_workspace(&self, workspace_name: &WorkspaceName) -> Result<Workspace> {
        self.workspaces()
            .find_by_name(workspace_name)?
            .ok_or_else(|| Error::WorkspaceDoesNotExist(workspace_name.to_string()))
    }

    pub(crate) fn require_base_workspace(&self, workspace: &Workspace) -> Result<Workspace> {
        let base_name = workspace
            .base_workspace_name
            .as_ref()
            .ok_or_else(|| Error::WorkspaceHasNoBaseWorkspace(workspace.workspace_name.to_string()))?;
        self.workspaces()
            .find_by_name(base_name)?
            .ok_or_else(|| Error::BaseWorkspaceDoesNotExist(workspace.workspace_name.to_string()))
    }

    // =========================================================================
    // Content Stream Commands
    // =========================================================================

    fn create_content_stream(&mut self, command: CreateContentStream) -> Result<CommandResult> {
        let id = command.content_stream_id;
        if self.content_streams().find_by_id(&id)?.is_some() {
            return Err(Error::ContentStreamAlreadyExists(id.to_string()));
        }
        self.commit_event(
            &StreamName::for_content_stream(&id),
            ContentStreamWasCreated {
                content_stream_id: id.clone(),
            }
            .into(),
            ExpectedVersion::NoStream,
        )
    }

    fn fork_content_stream(&mut self, command: ForkContentStream) -> Result<CommandResult> {
        self.require_content_stream(&command.source_content_stream_id)?;
        if self.content_streams().find_by_id(&command.content_stream_id)?.is_some() {
            return Err(Error::ContentStreamAlreadyExists(command.content_stream_id.to_string()));
        }
        let ExpectedVersion::Exact(version) = self.require_stream_version(&command.source_content_stream_id)? else {
            return Err(Error::ContentStreamDoesNotExistYet(command.source_content_stream_id.to_string()));
        };
        self.commit_event(
            &StreamName::for_content_stream(&command.content_stream_id),
            ContentStreamWasForked {
                new_content_stream_id: command.content_stream_id.clone(),
                source_content_stream_id: command.source_content_stream_id,
                version_of_source_content_stream: version,
            }
            .into(),
            ExpectedVersion::NoStream,
        )
    }

    fn close_content_stream(&mut self, command: CloseContentStream) -> Result<CommandResult> {
        let expected = self.require_writable_content_stream(&command.content_stream_id)?;
        self.commit_event(
            &StreamName::for_content_stream(&command.content_stream_id),
            ContentStreamWasClosed {
                content_stream_id: command.content_stream_id.clone(),
            }
            .into(),
            expected,
        )
    }

    fn reopen_content_stream(&mut self, command: ReopenContentStream) -> Result<CommandResult> {
        if !self.require_content_stream(&command.content_stream_id)?.is_closed() {
            return Err(Error::ContentStreamIsNotClosed(command.content_stream_id.to_string()));
        }
        let expected = self.require_stream_version(&command.content_stream_id)?;
        self.commit_event(
            &StreamName::for_content_stream(&command.content_stream_id),
            ContentStreamWasReopened {
                content_stream_id: command.content_stream_id.clone(),
                previous_state: command.previous_state,
            }
            .into(),
            expected,
        )
    }

    pub(crate) fn remove_content_stream(&mut self, content_stream_id: &ContentStreamId) -> Result<CommandResult> {
        self.require_content_stream(content_stream_id)?;
        let expected = self.require_stream_version(content_stream_id)?;
        self.commit_event(
            &StreamName::for_content_stream(content_stream_id),
            ContentStreamWasRemoved {
                content_stream_id: content_stream_id.clone(),
            }
            .into(),
            expected,
        )
    }

    // =========================================================================
    // Workspace Creation
    // =========================================================================

    fn create_root_workspace(&mut self, command: CreateRootWorkspace) -> Result<CommandResult> {
        if self.workspaces().find_by_name(&command.workspace_name)?.is_some() {
            return Err(Error::WorkspaceAlreadyExists(command.workspace_name.to_string()));
        }
        self.handle(
            CreateContentStream {
                content_stream_id: command.new_content_stream_id.clone(),
            }
            .into(),
        )?;
        self.commit_event(
            &StreamName::for_workspace(&command.workspace_name),
            RootWorkspaceWasCreated {
                workspace_name: command.workspace_name.clone(),
                workspace_title: command.workspace_title,
                workspace_description: command.workspace_description,
                new_content_stream_id: command.new_content_stream_id,
            }
            .into(),
            ExpectedVersion::Any,
        )
    }

    fn create_workspace(&mut self, command: CreateWorkspace) -> Result<CommandResult> {
        if self.workspaces().find_by_name(&command.workspace_name)?.is_some() {
            return Err(Error::WorkspaceAlreadyExists(command.workspace_name.to_string()));
        }
        let base = self
            .workspaces()
            .find_by_name(&command.base_workspace_name)?
            .ok_or_else(|| Error::BaseWorkspaceDoesNotExist(command.workspace_name.to_string()))?;
        self.handle(
            ForkContentStream {
                content_stream_id: command.new_content_stream_id.clone(),
                source_content_stream_id: base.current_content_stream_id,
            }
            .into(),
        )?;
        self.commit_event(
            &StreamName::for_workspace(&command.workspace_name),
            WorkspaceWasCreated {
                workspace_name: command.workspace_name.clone(),
                base_workspace_name: command.base_workspace_name,
                workspace_title: command.workspace_title,
                workspace_description: command.workspace_description,
                new_content_stream_id: command.new_content_stream_id,
            }
            .into(),
            ExpectedVersion::Any,
        )
    }

    // =========================================================================
    // Node Commands
    // =========================================================================

    fn handle_node_command(&mut self, command: Command) -> Result<CommandResult> {
        let content_stream_id = command
            .content_stream_id()
            .cloned()
            .ok_or_else(|| Error::Schema(format!("'{}' is not a node command", command.type_name())))?;
        let expected = self.require_writable_content_stream(&content_stream_id)?;

        let (command, events) = self.node_events(command)?;
        let metadata = command.to_metadata()?;
        let new_events = events
            .iter()
            .enumerate()
            .map(|(index, event)| event.to_new_event((index == 0).then_some(&metadata)))
            .collect::<Result<Vec<_>>>()?;

        let last = self.commit(&StreamName::for_content_stream(&content_stream_id), new_events, expected)?;
        Ok(CommandResult::new(last))
    }

    /// Validates a node command and returns it (possibly completed) with its
    /// events.
    fn node_events(&self, command: Command) -> Result<(Command, Vec<EventKind>)> {
        let events = match &command {
            Command::CreateRootNodeAggregateWithNode(c) => self.create_root_node_aggregate(c)?,
            Command::CreateNodeAggregateWithNode(c) => {
                let (completed, events) = self.create_node_aggregate(c.clone())?;
                return Ok((completed.into(), events));
            }
            Command::SetNodeProperties(c) => self.set_node_properties(c)?,
            Command::SetNodeReferences(c) => self.set_node_references(c)?,
            Command::MoveNodeAggregate(c) => self.move_node_aggregate(c)?,
            Command::RemoveNodeAggregate(c) => self.remove_node_aggregate(c)?,
            Command::ChangeNodeAggregateName(c) => self.change_node_aggregate_name(c)?,
            Command::ChangeNodeAggregateType(c) => self.change_node_aggregate_type(c)?,
            Command::CreateNodeVariant(c) => self.create_node_variant(c)?,
            Command::TagSubtree(c) => self.tag_subtree(c)?,
            Command::UntagSubtree(c) => self.untag_subtree(c)?,
            Command::DisableNodeAggregate(c) => self.tag_subtree(&c.clone().into())?,
            Command::EnableNodeAggregate(c) => self.untag_subtree(&c.clone().into())?,
            other => return Err(Error::Schema(format!("'{}' is not a node command", other.type_name()))),
        };
        Ok((command, events))
    }

    fn create_root_node_aggregate(&self, c: &CreateRootNodeAggregateWithNode) -> Result<Vec<EventKind>> {
        self.node_types.require_root_type(&c.node_type_name)?;
        let graph = self.content_graph(c.content_stream_id.clone());
        if graph.find_node_aggregate_by_id(&c.node_aggregate_id)?.is_some() {
            return Err(Error::NodeAggregateCurrentlyExists(c.node_aggregate_id.to_string()));
        }
        if let Some(existing) = graph.find_root_node_aggregate_by_type(&c.node_type_name)? {
            return Err(Error::NodeAggregateCurrentlyExists(existing.node_aggregate_id.to_string()));
        }

        Ok(vec![RootNodeAggregateWithNodeWasCreated {
            content_stream_id: c.content_stream_id.clone(),
            node_aggregate_id: c.node_aggregate_id.clone(),
            node_type_name: c.node_type_name.clone(),
            covered_dimension_space_points: self.variation_graph.allowed_subspace().clone(),
            node_aggregate_classification: NodeAggregateClassification::Root,
        }
        .into()])
    }

    fn create_node_aggregate(
        &self,
        mut c: CreateNodeAggregateWithNode,
    ) -> Result<(CreateNodeAggregateWithNode, Vec<EventKind>)> {
        let origin = &c.origin_dimension_space_point;
        self.variation_graph.require_allowed(origin)?;
        self.node_types.require_regular_type(&c.node_type_name)?;
        self.node_types
            .validate_properties(&c.node_type_name, &c.initial_property_values)?;

        let graph = self.content_graph(c.content_stream_id.clone());
        if graph.find_node_aggregate_by_id(&c.node_aggregate_id)?.is_some() {
            return Err(Error::NodeAggregateCurrentlyExists(c.node_aggregate_id.to_string()));
        }
        let parent = require_aggregate(&graph, &c.parent_node_aggregate_id)?;
        require_coverage(&parent, origin)?;

        let coverage = self
            .variation_graph
            .specialization_set(origin, true, None)?
            .intersection(parent.covered_dimension_space_points());
        if let Some(name) = &c.node_name {
            require_name_is_free(&graph, &parent.node_aggregate_id, name, &c.node_aggregate_id, &coverage)?;
        }
        let siblings = resolve_siblings(&graph, &coverage, c.succeeding_sibling_node_aggregate_id.as_ref())?;

        let mut events: Vec<EventKind> = vec![NodeAggregateWithNodeWasCreated {
            content_stream_id: c.content_stream_id.clone(),
            node_aggregate_id: c.node_aggregate_id.clone(),
            node_type_name: c.node_type_name.clone(),
            origin_dimension_space_point: origin.clone(),
            succeeding_siblings_for_coverage: siblings,
            parent_node_aggregate_id: c.parent_node_aggregate_id.clone(),
            node_name: c.node_name.clone(),
            initial_property_values: self
                .node_types
                .values_with_defaults(&c.node_type_name, &c.initial_property_values)?,
            node_aggregate_classification: NodeAggregateClassification::Regular,
        }
        .into()];

        let mut tethered = Vec::new();
        collect_tethered_descendants(
            &self.node_types,
            &c.node_type_name,
            &c.node_aggregate_id,
            "",
            &mut c.tethered_descendant_node_aggregate_ids,
            &mut tethered,
        )?;
        for child in tethered {
            if graph.find_node_aggregate_by_id(&child.node_aggregate_id)?.is_some() {
                return Err(Error::NodeAggregateCurrentlyExists(child.node_aggregate_id.to_string()));
            }
            events.push(
                NodeAggregateWithNodeWasCreated {
                    content_stream_id: c.content_stream_id.clone(),
                    node_aggregate_id: child.node_aggregate_id,
                    initial_property_values: self
                        .node_types
                        .values_with_defaults(&child.node_type_name, &PropertyValues::new())?,
                    node_type_name: child.node_type_name,
                    origin_dimension_space_point: origin.clone(),
                    succeeding_siblings_for_coverage: InterdimensionalSiblings::uniform(&coverage, None),
                    parent_node_aggregate_id: child.parent_node_aggregate_id,
                    node_name: Some(child.node_name),
                    node_aggregate_classification: NodeAggregateClassification::Tethered,
                }
                .into(),
            );
        }

        Ok((c, events))
    }

    fn set_node_properties(&self, c: &SetNodeProperties) -> Result<Vec<EventKind>> {
        let graph = self.content_graph(c.content_stream_id.clone());
        let aggregate = require_aggregate(&graph, &c.node_aggregate_id)?;
        require_occupation(&aggregate, &c.origin_dimension_space_point)?;
        self.node_types
            .validate_properties(&aggregate.node_type_name, &c.property_values)?;
        self.node_types
            .validate_property_names(&aggregate.node_type_name, &c.properties_to_unset)?;

        Ok(vec![NodePropertiesWereSet {
            content_stream_id: c.content_stream_id.clone(),
            node_aggregate_id: c.node_aggregate_id.clone(),
            origin_dimension_space_point: c.origin_dimension_space_point.clone(),
            property_values: c.property_values.clone(),
            properties_to_unset: c.properties_to_unset.clone(),
        }
        .into()])
    }

    fn set_node_references(&self, c: &SetNodeReferences) -> Result<Vec<EventKind>> {
        let origin = &c.source_origin_dimension_space_point;
        self.variation_graph.require_allowed(origin)?;
        let graph = self.content_graph(c.content_stream_id.clone());
        let source = require_aggregate(&graph, &c.source_node_aggregate_id)?;
        if source.is_root() {
            return Err(Error::NodeAggregateIsRoot(c.source_node_aggregate_id.to_string()));
        }
        require_occupation(&source, origin)?;
        self.node_types.validate_references(
            &source.node_type_name,
            &c.reference_name,
            c.references.iter().map(|reference| reference.properties.as_ref()),
        )?;
        for reference in &c.references {
            let target = require_aggregate(&graph, &reference.target_node_aggregate_id)?;
            if target.is_root() {
                return Err(Error::NodeAggregateIsRoot(target.node_aggregate_id.to_string()));
            }
        }

        Ok(vec![NodeReferencesWereSet {
            content_stream_id: c.content_stream_id.clone(),
            node_aggregate_id: c.source_node_aggregate_id.clone(),
            affected_source_origin_dimension_space_points: DimensionSpacePointSet::from(vec![origin.clone()]),
            reference_name: c.reference_name.clone(),
            references: c
                .references
                .iter()
                .map(|reference| SerializedNodeReference {
                    target_node_aggregate_id: reference.target_node_aggregate_id.clone(),
                    properties: reference.properties.clone(),
                })
                .collect(),
        }
        .into()])
    }

    fn move_node_aggregate(&self, c: &MoveNodeAggregate) -> Result<Vec<EventKind>> {
        let point = &c.dimension_space_point;
        self.variation_graph.require_allowed(point)?;
        let graph = self.content_graph(c.content_stream_id.clone());
        let aggregate = require_aggregate(&graph, &c.node_aggregate_id)?;
        if aggregate.is_root() {
            return Err(Error::NodeAggregateIsRoot(c.node_aggregate_id.to_string()));
        }
        // Tethered nodes keep their parent and their place below it.
        if aggregate.is_tethered() {
            return Err(Error::NodeAggregateIsTethered(c.node_aggregate_id.to_string()));
        }
        require_coverage(&aggregate, point)?;

        let covered = aggregate.covered_dimension_space_points();
        let affected = match c.relation_distribution_strategy {
            RelationDistributionStrategy::Scatter => DimensionSpacePointSet::from(vec![point.clone()]),
            RelationDistributionStrategy::GatherAll => covered.clone(),
            RelationDistributionStrategy::GatherSpecializations => {
                covered.intersection(&self.variation_graph.specialization_set(point, true, None)?)
            }
        };

        if let Some(new_parent_id) = &c.new_parent_node_aggregate_id {
            let new_parent = require_aggregate(&graph, new_parent_id)?;
            for affected_point in affected.iter() {
                require_coverage(&new_parent, affected_point)?;
            }
            if new_parent_id == &c.node_aggregate_id || graph.is_descendant(&c.node_aggregate_id, new_parent_id)? {
                return Err(Error::NodeAggregateIsDescendant {
                    node_aggregate_id: new_parent_id.to_string(),
                    ancestor: c.node_aggregate_id.to_string(),
                });
            }
            if let Some(name) = &aggregate.node_name {
                require_name_is_free(&graph, new_parent_id, name, &c.node_aggregate_id, &affected)?;
            }
        }

        let siblings = resolve_siblings(&graph, &affected, c.new_succeeding_sibling_node_aggregate_id.as_ref())?;
        Ok(vec![NodeAggregateWasMoved {
            content_stream_id: c.content_stream_id.clone(),
            node_aggregate_id: c.node_aggregate_id.clone(),
            new_parent_node_aggregate_id: c.new_parent_node_aggregate_id.clone(),
            succeeding_siblings_for_coverage: siblings,
        }
        .into()])
    }

    fn remove_node_aggregate(&self, c: &RemoveNodeAggregate) -> Result<Vec<EventKind>> {
        let point = &c.covered_dimension_space_point;
        self.variation_graph.require_allowed(point)?;
        let graph = self.content_graph(c.content_stream_id.clone());
        let aggregate = require_aggregate(&graph, &c.node_aggregate_id)?;
        if aggregate.is_root() {
            return Err(Error::NodeAggregateIsRoot(c.node_aggregate_id.to_string()));
        }
        if aggregate.is_tethered() {
            return Err(Error::NodeAggregateIsTethered(c.node_aggregate_id.to_string()));
        }
        require_coverage(&aggregate, point)?;

        let (covered, occupied) = match c.node_variant_selection_strategy {
            NodeVariantSelectionStrategy::AllVariants => (
                aggregate.covered_dimension_space_points().clone(),
                aggregate.occupied_dimension_space_points().clone(),
            ),
            NodeVariantSelectionStrategy::AllSpecializations => {
                let specializations = self.variation_graph.specialization_set(point, true, None)?;
                (
                    aggregate.covered_dimension_space_points().intersection(&specializations),
                    aggregate.occupied_dimension_space_points().intersection(&specializations),
                )
            }
        };

        Ok(vec![NodeAggregateWasRemoved {
            content_stream_id: c.content_stream_id.clone(),
            node_aggregate_id: c.node_aggregate_id.clone(),
            affected_occupied_dimension_space_points: occupied,
            affected_covered_dimension_space_points: covered,
        }
        .into()])
    }

    fn change_node_aggregate_name(&self, c: &ChangeNodeAggregateName) -> Result<Vec<EventKind>> {
        let graph = self.content_graph(c.content_stream_id.clone());
        let aggregate = require_aggregate(&graph, &c.node_aggregate_id)?;
        if aggregate.is_root() {
            return Err(Error::NodeAggregateIsRoot(c.node_aggregate_id.to_string()));
        }
        if aggregate.is_tethered() {
            return Err(Error::NodeAggregateIsTethered(c.node_aggregate_id.to_string()));
        }
        for parent in graph.find_parent_node_aggregates(&c.node_aggregate_id)? {
            require_name_is_free(
                &graph,
                &parent.node_aggregate_id,
                &c.new_node_name,
                &c.node_aggregate_id,
                aggregate.covered_dimension_space_points(),
            )?;
        }

        Ok(vec![NodeAggregateNameWasChanged {
            content_stream_id: c.content_stream_id.clone(),
            node_aggregate_id: c.node_aggregate_id.clone(),
            new_node_name: c.new_node_name.clone(),
        }
        .into()])
    }

    fn change_node_aggregate_type(&self, c: &ChangeNodeAggregateType) -> Result<Vec<EventKind>> {
        let graph = self.content_graph(c.content_stream_id.clone());
        let aggregate = require_aggregate(&graph, &c.node_aggregate_id)?;
        if aggregate.is_root() {
            return Err(Error::NodeAggregateIsRoot(c.node_aggregate_id.to_string()));
        }
        self.node_types.require_regular_type(&c.new_node_type_name)?;

        Ok(vec![NodeAggregateTypeWasChanged {
            content_stream_id: c.content_stream_id.clone(),
            node_aggregate_id: c.node_aggregate_id.clone(),
            new_node_type_name: c.new_node_type_name.clone(),
        }
        .into()])
    }

    fn create_node_variant(&self, c: &CreateNodeVariant) -> Result<Vec<EventKind>> {
        self.variation_graph.require_allowed(&c.source_origin)?;
        self.variation_graph.require_allowed(&c.target_origin)?;
        let graph = self.content_graph(c.content_stream_id.clone());
        let aggregate = require_aggregate(&graph, &c.node_aggregate_id)?;
        if aggregate.is_root() {
            return Err(Error::NodeAggregateIsRoot(c.node_aggregate_id.to_string()));
        }
        require_occupation(&aggregate, &c.source_origin)?;
        if aggregate.occupies(&c.target_origin) {
            return Err(Error::DimensionSpacePointIsAlreadyOccupied {
                node_aggregate_id: c.node_aggregate_id.to_string(),
                dimension_space_point: c.target_origin.to_json(),
            });
        }

        let mut parent_coverage = DimensionSpacePointSet::new();
        for parent in graph.find_parent_node_aggregates(&c.node_aggregate_id)? {
            parent_coverage = parent_coverage.union(parent.covered_dimension_space_points());
        }
        if !parent_coverage.contains(&c.target_origin) {
            return Err(Error::NodeAggregateDoesCurrentlyNotCoverDimensionSpacePoint {
                node_aggregate_id: format!("parent of {}", c.node_aggregate_id),
                dimension_space_point: c.target_origin.to_json(),
            });
        }

        let mut events = Vec::new();
        self.variant_events(&graph, &aggregate, &c.source_origin, &c.target_origin, &parent_coverage, &mut events)?;
        Ok(events)
    }

    /// Emits the variant event of `aggregate` and, recursively, of its
    /// tethered children that still lack the target origin.
    fn variant_events(
        &self,
        graph: &ContentGraph<'_>,
        aggregate: &NodeAggregate,
        source: &DimensionSpacePoint,
        target: &DimensionSpacePoint,
        parent_coverage: &DimensionSpacePointSet,
        events: &mut Vec<EventKind>,
    ) -> Result<()> {
        let coverage = self
            .variation_graph
            .effective_coverage(target, aggregate.occupied_dimension_space_points())?
            .intersection(parent_coverage);
        let siblings = InterdimensionalSiblings::uniform(&coverage, None);
        let content_stream_id = aggregate.content_stream_id.clone();
        let node_aggregate_id = aggregate.node_aggregate_id.clone();

        let event: EventKind = match self.variation_graph.variant_type(target, source) {
            VariantType::Specialization => NodeSpecializationVariantWasCreated {
                content_stream_id,
                node_aggregate_id,
                source_origin: source.clone(),
                specialization_origin: target.clone(),
                specialization_siblings: siblings,
            }
            .into(),
            VariantType::Generalization => NodeGeneralizationVariantWasCreated {
                content_stream_id,
                node_aggregate_id,
                source_origin: source.clone(),
                generalization_origin: target.clone(),
                variant_succeeding_siblings: siblings,
            }
            .into(),
            VariantType::Peer => NodePeerVariantWasCreated {
                content_stream_id,
                node_aggregate_id,
                source_origin: source.clone(),
                peer_origin: target.clone(),
                peer_succeeding_siblings: siblings,
            }
            .into(),
            VariantType::Same => {
                return Err(Error::DimensionSpacePointIsAlreadyOccupied {
                    node_aggregate_id: aggregate.node_aggregate_id.to_string(),
                    dimension_space_point: target.to_json(),
                })
            }
        };
        events.push(event);

        for child in graph.find_tethered_child_node_aggregates(&aggregate.node_aggregate_id)? {
            if child.occupies(source) && !child.occupies(target) {
                self.variant_events(graph, &child, source, target, &coverage, events)?;
            }
        }
        Ok(())
    }

    fn tag_subtree(&self, c: &TagSubtree) -> Result<Vec<EventKind>> {
        let graph = self.content_graph(c.content_stream_id.clone());
        let aggregate = require_aggregate(&graph, &c.node_aggregate_id)?;
        let point = &c.covered_dimension_space_point;
        self.variation_graph.require_allowed(point)?;
        require_coverage(&aggregate, point)?;
        if aggregate
            .subtree_tags(point)
            .is_some_and(|tags| tags.explicit.contains(&c.tag))
        {
            return Err(Error::SubtreeIsAlreadyTagged {
                node_aggregate_id: c.node_aggregate_id.to_string(),
                tag: c.tag.to_string(),
            });
        }

        Ok(vec![SubtreeWasTagged {
            content_stream_id: c.content_stream_id.clone(),
            node_aggregate_id: c.node_aggregate_id.clone(),
            affected_dimension_space_points: self.affected_points(
                &aggregate,
                point,
                c.node_variant_selection_strategy,
            )?,
            tag: c.tag.clone(),
        }
        .into()])
    }

    fn untag_subtree(&self, c: &UntagSubtree) -> Result<Vec<EventKind>> {
        let graph = self.content_graph(c.content_stream_id.clone());
        let aggregate = require_aggregate(&graph, &c.node_aggregate_id)?;
        let point = &c.covered_dimension_space_point;
        self.variation_graph.require_allowed(point)?;
        require_coverage(&aggregate, point)?;
        if !aggregate
            .subtree_tags(point)
            .is_some_and(|tags| tags.explicit.contains(&c.tag))
        {
            return Err(Error::SubtreeIsNotTagged {
                node_aggregate_id: c.node_aggregate_id.to_string(),
                tag: c.tag.to_string(),
            });
        }

        Ok(vec![SubtreeWasUntagged {
            content_stream_id: c.content_stream_id.clone(),
            node_aggregate_id: c.node_aggregate_id.clone(),
            affected_dimension_space_points: self.affected_points(
                &aggregate,
                point,
                c.node_variant_selection_strategy,
            )?,
            tag: c.tag.clone(),
        }
        .into()])
    }

    fn affected_points(
        &self,
        aggregate: &NodeAggregate,
        point: &DimensionSpacePoint,
        strategy: NodeVariantSelectionStrategy,
    ) -> Result<DimensionSpacePointSet> {
        Ok(match strategy {
            NodeVariantSelectionStrategy::AllVariants => aggregate.covered_dimension_space_points().clone(),
            NodeVariantSelectionStrategy::AllSpecializations => aggregate
                .covered_dimension_space_points()
                .intersection(&self.variation_graph.specialization_set(point, true, None)?),
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn require_aggregate(graph: &ContentGraph<'_>, node_aggregate_id: &NodeAggregateId) -> Result<NodeAggregate> {
    graph
        .find_node_aggregate_by_id(node_aggregate_id)?
        .ok_or_else(|| Error::NodeAggregateCurrentlyDoesNotExist(node_aggregate_id.to_string()))
}

fn require_coverage(aggregate: &NodeAggregate, point: &DimensionSpacePoint) -> Result<()> {
    if aggregate.covers(point) {
        return Ok(());
    }
    Err(Error::NodeAggregateDoesCurrentlyNotCoverDimensionSpacePoint {
        node_aggregate_id: aggregate.node_aggregate_id.to_string(),
        dimension_space_point: point.to_json(),
    })
}

fn require_occupation(aggregate: &NodeAggregate, origin: &DimensionSpacePoint) -> Result<()> {
    if aggregate.occupies(origin) {
        return Ok(());
    }
    Err(Error::DimensionSpacePointIsNotYetOccupied {
        node_aggregate_id: aggregate.node_aggregate_id.to_string(),
        dimension_space_point: origin.to_json(),
    })
}

/// Fails if another child of `parent` named `name` covers one of `points`.
fn require_name_is_free(
    graph: &ContentGraph<'_>,
    parent: &NodeAggregateId,
    name: &NodeName,
    node_aggregate_id: &NodeAggregateId,
    points: &DimensionSpacePointSet,
) -> Result<()> {
    let taken = graph
        .find_child_node_aggregates_by_name(parent, name)?
        .into_iter()
        .filter(|sibling| &sibling.node_aggregate_id != node_aggregate_id)
        .any(|sibling| !sibling.covered_dimension_space_points().intersection(points).is_empty());
    if taken {
        return Err(Error::NodeNameIsAlreadyCovered {
            node_name: name.to_string(),
            parent: parent.to_string(),
        });
    }
    Ok(())
}

/// The succeeding sibling per point: the given one where it is visible,
/// the end of the child list elsewhere.
fn resolve_siblings(
    graph: &ContentGraph<'_>,
    points: &DimensionSpacePointSet,
    sibling: Option<&NodeAggregateId>,
) -> Result<InterdimensionalSiblings> {
    let Some(sibling_id) = sibling else {
        return Ok(InterdimensionalSiblings::uniform(points, None));
    };
    let sibling = require_aggregate(graph, sibling_id)?;
    Ok(InterdimensionalSiblings::new(
        points
            .iter()
            .map(|point| InterdimensionalSibling {
                dimension_space_point: point.clone(),
                node_aggregate_id: sibling.covers(point).then(|| sibling_id.clone()),
            })
            .collect(),
    ))
}

struct TetheredNode {
    node_aggregate_id: NodeAggregateId,
    parent_node_aggregate_id: NodeAggregateId,
    node_name: NodeName,
    node_type_name: NodeTypeName,
}

/// Walks the tethered children of a node type depth first, taking ids from
/// `ids` (keyed by name path) and generating the missing ones into it.
fn collect_tethered_descendants(
    node_types: &NodeTypeManager,
    node_type_name: &NodeTypeName,
    parent_id: &NodeAggregateId,
    path: &str,
    ids: &mut BTreeMap<String, NodeAggregateId>,
    out: &mut Vec<TetheredNode>,
) -> Result<()> {
    if path.split('/').count() > MAX_TETHERED_DEPTH {
        return Err(Error::Config(format!(
            "tethered child nodes of '{node_type_name}' nest deeper than {MAX_TETHERED_DEPTH} levels"
        )));
    }
    for (name, child_type) in node_types.tethered_children(node_type_name)? {
        let child_path = if path.is_empty() {
            name.to_string()
        } else {
            format!("{path}/{name}")
        };
        let id = ids
            .entry(child_path.clone())
            .or_insert_with(NodeAggregateId::create)
            .clone();
        out.push(TetheredNode {
            node_aggregate_id: id.clone(),
            parent_node_aggregate_id: parent_id.clone(),
            node_name: name.clone(),
            node_type_name: child_type.clone(),
        });
        collect_tethered_descendants(node_types, child_type, &id, &child_path, ids, out)?;
    }
    Ok(())
}

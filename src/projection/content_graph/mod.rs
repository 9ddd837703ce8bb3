//! # Content Graph Projection
//!
//! Folds content stream and node events into the hypergraph tables described
//! in [`hierarchy`]. The projection holds no state of its own: every
//! coverage decision (which points, which siblings) was made on the command
//! side and travels in the event, so replaying the log always produces the
//! same graph regardless of the dimension configuration at replay time.
//!
//! ## Event Handling
//!
//! | Event                                 | Effect                                   |
//! |---------------------------------------|------------------------------------------|
//! | `ContentStreamWasCreated`             | checks the stream has no edges yet        |
//! | `ContentStreamWasForked`              | copies the source stream's edges          |
//! | `ContentStreamWasRemoved`             | deletes the stream's edges, orphan rows   |
//! | `RootNodeAggregateWithNodeWasCreated` | row + edges to the virtual root           |
//! | `NodeAggregateWithNodeWasCreated`     | row + edges below the parent             |
//! | `NodePropertiesWereSet`               | copy on write, then merge properties      |
//! | `NodeReferencesWereSet`               | see [`referencing`]                       |
//! | `NodeAggregateNameWasChanged`         | copy on write for every variant           |
//! | `NodeAggregateTypeWasChanged`         | copy on write for every variant           |
//! | `NodeAggregateWasMoved`               | see [`moving`]                            |
//! | `NodeAggregateWasRemoved`             | see [`removal`]                           |
//! | `Node*VariantWasCreated`              | see [`variation`]                         |
//! | `SubtreeWasTagged` / `Untagged`       | see [`tagging`]                           |

use rusqlite::{params, Connection};

use crate::dimension::DimensionSpacePoint;
use crate::error::{Error, Result};
use crate::event_store::EventEnvelope;
use crate::events::{
    ContentStreamWasForked, EventKind, NodeAggregateNameWasChanged, NodeAggregateTypeWasChanged,
    NodeAggregateWithNodeWasCreated, NodePropertiesWereSet, RootNodeAggregateWithNodeWasCreated,
};
use crate::projection::Projection;
use crate::types::{ContentStreamId, NodeAggregateId, NodeRelationAnchorPoint, SubtreeTags};

pub(crate) mod hierarchy;
mod moving;
pub(crate) mod referencing;
mod removal;
mod tagging;
mod variation;

use hierarchy::NodeRecord;

/// Checkpoint name of the content graph projection.
pub const CONTENT_GRAPH_PROJECTION: &str = "content_graph";

const HANDLED_EVENTS: &[&str] = &[
    "ContentStreamWasCreated",
    "ContentStreamWasForked",
    "ContentStreamWasRemoved",
    "RootNodeAggregateWithNodeWasCreated",
    "NodeAggregateWithNodeWasCreated",
    "NodePropertiesWereSet",
    "NodeReferencesWereSet",
    "NodeAggregateWasMoved",
    "NodeAggregateWasRemoved",
    "NodeAggregateNameWasChanged",
    "NodeAggregateTypeWasChanged",
    "NodeSpecializationVariantWasCreated",
    "NodeGeneralizationVariantWasCreated",
    "NodePeerVariantWasCreated",
    "SubtreeWasTagged",
    "SubtreeWasUntagged",
];

/// The hypergraph projection.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentGraphProjection;

impl ContentGraphProjection {
    pub fn new() -> Self {
        Self
    }
}

impl Projection for ContentGraphProjection {
    fn name(&self) -> &str {
        CONTENT_GRAPH_PROJECTION
    }

    fn setup(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(hierarchy::CREATE_NODE)?;
        conn.execute_batch(hierarchy::CREATE_HIERARCHY_RELATION)?;
        conn.execute_batch(hierarchy::CREATE_DIMENSION_SPACE_POINT)?;
        conn.execute_batch(referencing::CREATE_REFERENCE_RELATION)?;
        Ok(())
    }

    fn reset(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "DELETE FROM cr_hierarchy_relation;
             DELETE FROM cr_reference_relation;
             DELETE FROM cr_node;
             DELETE FROM cr_dimension_space_point;",
        )?;
        Ok(())
    }

    fn can_handle(&self, event_type: &str) -> bool {
        HANDLED_EVENTS.contains(&event_type)
    }

    fn apply(&self, conn: &Connection, event: &EventKind, _envelope: &EventEnvelope) -> Result<()> {
        match event {
            EventKind::ContentStreamWasCreated(e) => on_content_stream_created(conn, &e.content_stream_id),
            EventKind::ContentStreamWasForked(e) => on_content_stream_forked(conn, e),
            EventKind::ContentStreamWasRemoved(e) => on_content_stream_removed(conn, &e.content_stream_id),
            EventKind::RootNodeAggregateWithNodeWasCreated(e) => on_root_node_created(conn, e),
            EventKind::NodeAggregateWithNodeWasCreated(e) => on_node_created(conn, e),
            EventKind::NodePropertiesWereSet(e) => on_properties_set(conn, e),
            EventKind::NodeReferencesWereSet(e) => referencing::on_node_references_set(conn, e),
            EventKind::NodeAggregateNameWasChanged(e) => on_name_changed(conn, e),
            EventKind::NodeAggregateTypeWasChanged(e) => on_type_changed(conn, e),
            EventKind::NodeAggregateWasMoved(e) => moving::on_node_aggregate_moved(conn, e),
            EventKind::NodeAggregateWasRemoved(e) => removal::on_node_aggregate_removed(conn, e),
            EventKind::NodeSpecializationVariantWasCreated(e) => {
                variation::on_specialization_variant_created(conn, e)
            }
            EventKind::NodeGeneralizationVariantWasCreated(e) => {
                variation::on_generalization_variant_created(conn, e)
            }
            EventKind::NodePeerVariantWasCreated(e) => variation::on_peer_variant_created(conn, e),
            EventKind::SubtreeWasTagged(e) => tagging::on_subtree_tagged(conn, e),
            EventKind::SubtreeWasUntagged(e) => tagging::on_subtree_untagged(conn, e),
            _ => Ok(()),
        }
    }
}

// =============================================================================
// Content Stream Handlers
// =============================================================================

fn stream_has_edges(conn: &Connection, content_stream_id: &ContentStreamId) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM cr_hierarchy_relation WHERE content_stream_id = ?)",
        [content_stream_id.as_str()],
        |row| row.get(0),
    )?)
}

fn on_content_stream_created(conn: &Connection, content_stream_id: &ContentStreamId) -> Result<()> {
    if stream_has_edges(conn, content_stream_id)? {
        return Err(Error::violation(format!(
            "content stream '{content_stream_id}' already has hierarchy edges"
        )));
    }
    Ok(())
}

fn on_content_stream_forked(conn: &Connection, event: &ContentStreamWasForked) -> Result<()> {
    if stream_has_edges(conn, &event.new_content_stream_id)? {
        return Err(Error::violation(format!(
            "content stream '{}' already has hierarchy edges",
            event.new_content_stream_id
        )));
    }
    let copied = conn.execute(
        "INSERT INTO cr_hierarchy_relation (parent_node_anchor, child_node_anchor, content_stream_id, \
         dimension_space_point_hash, position, subtree_tags) \
         SELECT parent_node_anchor, child_node_anchor, ?1, dimension_space_point_hash, position, subtree_tags \
         FROM cr_hierarchy_relation WHERE content_stream_id = ?2",
        params![
            event.new_content_stream_id.as_str(),
            event.source_content_stream_id.as_str()
        ],
    )?;
    tracing::debug!(
        source = %event.source_content_stream_id,
        target = %event.new_content_stream_id,
        edges = copied,
        "forked content stream"
    );
    Ok(())
}

fn on_content_stream_removed(conn: &Connection, content_stream_id: &ContentStreamId) -> Result<()> {
    conn.execute(
        "DELETE FROM cr_hierarchy_relation WHERE content_stream_id = ?",
        [content_stream_id.as_str()],
    )?;
    let orphans = conn.execute(
        "DELETE FROM cr_node WHERE NOT EXISTS \
         (SELECT 1 FROM cr_hierarchy_relation h WHERE h.child_node_anchor = cr_node.relation_anchor_point)",
        [],
    )?;
    let references = referencing::delete_orphaned_references(conn)?;
    tracing::debug!(
        content_stream_id = %content_stream_id,
        orphans,
        references,
        "removed content stream edges"
    );
    Ok(())
}

// =============================================================================
// Node Handlers
// =============================================================================

fn on_root_node_created(conn: &Connection, event: &RootNodeAggregateWithNodeWasCreated) -> Result<()> {
    let anchor = NodeRecord {
        anchor: NodeRelationAnchorPoint::ROOT,
        node_aggregate_id: event.node_aggregate_id.clone(),
        origin: DimensionSpacePoint::empty(),
        node_type_name: event.node_type_name.clone(),
        classification: event.node_aggregate_classification,
        node_name: None,
        properties: Default::default(),
    }
    .insert(conn)?;

    for point in event.covered_dimension_space_points.iter() {
        hierarchy::connect(
            conn,
            &event.content_stream_id,
            point,
            NodeRelationAnchorPoint::ROOT,
            anchor,
            None,
            SubtreeTags::new(),
        )?;
    }
    Ok(())
}

fn on_node_created(conn: &Connection, event: &NodeAggregateWithNodeWasCreated) -> Result<()> {
    let stream = &event.content_stream_id;
    let anchor = NodeRecord {
        anchor: NodeRelationAnchorPoint::ROOT,
        node_aggregate_id: event.node_aggregate_id.clone(),
        origin: event.origin_dimension_space_point.clone(),
        node_type_name: event.node_type_name.clone(),
        classification: event.node_aggregate_classification,
        node_name: event.node_name.clone(),
        properties: event.initial_property_values.clone(),
    }
    .insert(conn)?;

    for sibling in event.succeeding_siblings_for_coverage.iter() {
        let point = &sibling.dimension_space_point;
        let parent = hierarchy::require_covering_anchor(conn, stream, &event.parent_node_aggregate_id, point)?;
        let succeeding =
            hierarchy::sibling_anchor_below(conn, stream, point.hash(), parent, sibling.node_aggregate_id.as_ref())?;
        let tags = hierarchy::inherited_tags_below(conn, stream, parent, point.hash())?;
        hierarchy::connect(conn, stream, point, parent, anchor, succeeding, tags)?;
    }
    Ok(())
}

fn on_properties_set(conn: &Connection, event: &NodePropertiesWereSet) -> Result<()> {
    let anchor = hierarchy::find_anchor_by_origin(
        conn,
        &event.content_stream_id,
        &event.node_aggregate_id,
        &event.origin_dimension_space_point,
    )?
    .ok_or_else(|| {
        Error::violation(format!(
            "node aggregate '{}' has no variant at {} in content stream '{}'",
            event.node_aggregate_id, event.origin_dimension_space_point, event.content_stream_id
        ))
    })?;

    hierarchy::copy_on_write(conn, &event.content_stream_id, anchor, |node| {
        node.properties
            .extend(event.property_values.iter().map(|(k, v)| (k.clone(), v.clone())));
        for property in &event.properties_to_unset {
            node.properties.remove(property);
        }
    })?;
    Ok(())
}

fn require_variants(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    node_aggregate_id: &NodeAggregateId,
) -> Result<Vec<NodeRelationAnchorPoint>> {
    let anchors = hierarchy::find_anchors_in_stream(conn, content_stream_id, node_aggregate_id)?;
    if anchors.is_empty() {
        return Err(Error::violation(format!(
            "node aggregate '{node_aggregate_id}' does not exist in content stream '{content_stream_id}'"
        )));
    }
    Ok(anchors)
}

fn on_name_changed(conn: &Connection, event: &NodeAggregateNameWasChanged) -> Result<()> {
    for anchor in require_variants(conn, &event.content_stream_id, &event.node_aggregate_id)? {
        hierarchy::copy_on_write(conn, &event.content_stream_id, anchor, |node| {
            node.node_name = Some(event.new_node_name.clone());
        })?;
    }
    Ok(())
}

fn on_type_changed(conn: &Connection, event: &NodeAggregateTypeWasChanged) -> Result<()> {
    for anchor in require_variants(conn, &event.content_stream_id, &event.node_aggregate_id)? {
        hierarchy::copy_on_write(conn, &event.content_stream_id, anchor, |node| {
            node.node_type_name = event.new_node_type_name.clone();
        })?;
    }
    Ok(())
}

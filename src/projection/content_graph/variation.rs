//! Node variant handlers.
//!
//! Specialization, generalization and peer variants are projected the same
//! way; the event kinds differ only in how the command side computed the
//! coverage. For every point in the coverage:
//!
//! - if some variant of the aggregate already covers the point (a fallback),
//!   the new variant takes over its incoming edge and its children;
//! - otherwise the new variant is connected below the parent aggregate.
//!
//! The new variant starts out with the source variant's references.
//!
//! ```text
//!  before: de_ch shows the en variant      after: de_ch has its own variant
//!
//!   parent ──(de_ch)──► agg@en               parent ──(de_ch)──► agg@de_ch
//!                         └─(de_ch)─► c                             └─(de_ch)─► c
//! ```

use rusqlite::Connection;

use super::hierarchy::{self, NodeRecord};
use super::referencing;
use crate::dimension::DimensionSpacePoint;
use crate::error::{Error, Result};
use crate::events::{
    InterdimensionalSiblings, NodeGeneralizationVariantWasCreated, NodePeerVariantWasCreated,
    NodeSpecializationVariantWasCreated,
};
use crate::types::{ContentStreamId, NodeAggregateId, NodeRelationAnchorPoint};

pub(super) fn on_specialization_variant_created(
    conn: &Connection,
    event: &NodeSpecializationVariantWasCreated,
) -> Result<()> {
    create_variant(
        conn,
        &event.content_stream_id,
        &event.node_aggregate_id,
        &event.source_origin,
        &event.specialization_origin,
        &event.specialization_siblings,
    )
}

pub(super) fn on_generalization_variant_created(
    conn: &Connection,
    event: &NodeGeneralizationVariantWasCreated,
) -> Result<()> {
    create_variant(
        conn,
        &event.content_stream_id,
        &event.node_aggregate_id,
        &event.source_origin,
        &event.generalization_origin,
        &event.variant_succeeding_siblings,
    )
}

pub(super) fn on_peer_variant_created(conn: &Connection, event: &NodePeerVariantWasCreated) -> Result<()> {
    create_variant(
        conn,
        &event.content_stream_id,
        &event.node_aggregate_id,
        &event.source_origin,
        &event.peer_origin,
        &event.peer_succeeding_siblings,
    )
}

fn create_variant(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    node_aggregate_id: &NodeAggregateId,
    source_origin: &DimensionSpacePoint,
    target_origin: &DimensionSpacePoint,
    siblings: &InterdimensionalSiblings,
) -> Result<()> {
    let source_anchor = hierarchy::find_anchor_by_origin(conn, content_stream_id, node_aggregate_id, source_origin)?
        .ok_or_else(|| {
            Error::violation(format!(
                "source variant of '{node_aggregate_id}' at {source_origin} not found in '{content_stream_id}'"
            ))
        })?;
    let source = hierarchy::require_node(conn, source_anchor)?;
    let source_edges = hierarchy::find_incoming_edges(conn, content_stream_id, source_anchor)?;
    let Some(source_edge) = source_edges.first() else {
        return Err(Error::violation(format!("node row {source_anchor} has no incoming edge")));
    };
    let parent_id = parent_aggregate_of(conn, source_edge.parent_anchor)?;

    let variant = NodeRecord {
        origin: target_origin.clone(),
        ..source
    };
    let variant_anchor = variant.insert(conn)?;
    referencing::copy_references(conn, source_anchor, variant_anchor)?;

    for sibling in siblings.iter() {
        let point = &sibling.dimension_space_point;
        hierarchy::register_point(conn, point)?;

        let covering = hierarchy::find_covering_anchor(conn, content_stream_id, node_aggregate_id, point.hash())?;
        if let Some(previous) = covering {
            hierarchy::reassign_child(conn, content_stream_id, Some(point.hash()), previous, variant_anchor)?;
            hierarchy::reassign_parent(conn, content_stream_id, Some(point.hash()), previous, variant_anchor)?;
            hierarchy::delete_node_if_orphaned(conn, previous)?;
            continue;
        }

        let parent = match &parent_id {
            Some(parent_id) => hierarchy::require_covering_anchor(conn, content_stream_id, parent_id, point)?,
            None => NodeRelationAnchorPoint::ROOT,
        };
        let succeeding = hierarchy::sibling_anchor_below(
            conn,
            content_stream_id,
            point.hash(),
            parent,
            sibling.node_aggregate_id.as_ref(),
        )?;
        let mut tags = hierarchy::inherited_tags_below(conn, content_stream_id, parent, point.hash())?;
        tags.explicit = source_edge.subtree_tags.explicit.clone();
        hierarchy::connect(conn, content_stream_id, point, parent, variant_anchor, succeeding, tags)?;
    }
    Ok(())
}

/// The aggregate id behind a parent anchor; `None` for the virtual root.
fn parent_aggregate_of(conn: &Connection, parent: NodeRelationAnchorPoint) -> Result<Option<NodeAggregateId>> {
    if parent.is_root() {
        return Ok(None);
    }
    Ok(Some(hierarchy::require_node(conn, parent)?.node_aggregate_id))
}

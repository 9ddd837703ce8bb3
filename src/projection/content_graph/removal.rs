//! Removal handler.
//!
//! Removing a node aggregate from a point removes the edges of its whole
//! subtree in that point. Rows lose their last edge only when no stream and
//! no point uses them anymore; those rows are deleted.

use rusqlite::Connection;

use super::hierarchy;
use crate::error::Result;
use crate::events::NodeAggregateWasRemoved;
use crate::types::{ContentStreamId, NodeRelationAnchorPoint};

pub(super) fn on_node_aggregate_removed(conn: &Connection, event: &NodeAggregateWasRemoved) -> Result<()> {
    for point in event.affected_covered_dimension_space_points.iter() {
        let anchor =
            hierarchy::require_covering_anchor(conn, &event.content_stream_id, &event.node_aggregate_id, point)?;
        remove_subtree(conn, &event.content_stream_id, point.hash(), anchor)?;
    }
    Ok(())
}

/// Deletes the edges of `anchor` and all its descendants in one
/// `(stream, point)`, depth first.
fn remove_subtree(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    dimension_space_point_hash: &str,
    anchor: NodeRelationAnchorPoint,
) -> Result<()> {
    let mut stack = vec![anchor];
    let mut removed = Vec::new();

    while let Some(current) = stack.pop() {
        for child in hierarchy::find_child_edges(conn, content_stream_id, current, dimension_space_point_hash)? {
            stack.push(child.child_anchor);
        }
        if let Some(edge) = hierarchy::find_incoming_edge(conn, content_stream_id, current, dimension_space_point_hash)? {
            edge.delete(conn)?;
        }
        removed.push(current);
    }

    for anchor in removed {
        hierarchy::delete_node_if_orphaned(conn, anchor)?;
    }
    Ok(())
}

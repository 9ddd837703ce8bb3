//! Move handler.
//!
//! A move rewrites the incoming edge of the moved variant in each listed
//! point: new parent (or the old one), new position, and inherited tags
//! from the new parent. The moved node keeps its anchor; only edges change,
//! so no copy on write is needed.

use rusqlite::Connection;

use super::hierarchy;
use super::tagging;
use crate::error::{Error, Result};
use crate::events::NodeAggregateWasMoved;

pub(super) fn on_node_aggregate_moved(conn: &Connection, event: &NodeAggregateWasMoved) -> Result<()> {
    let stream = &event.content_stream_id;

    for sibling in event.succeeding_siblings_for_coverage.iter() {
        let point = &sibling.dimension_space_point;
        let anchor = hierarchy::require_covering_anchor(conn, stream, &event.node_aggregate_id, point)?;
        let mut edge = hierarchy::find_incoming_edge(conn, stream, anchor, point.hash())?
            .ok_or_else(|| Error::violation(format!("node row {anchor} has no incoming edge in {point}")))?;

        let parent = match &event.new_parent_node_aggregate_id {
            Some(parent_id) => hierarchy::require_covering_anchor(conn, stream, parent_id, point)?,
            None => edge.parent_anchor,
        };
        let succeeding = hierarchy::sibling_anchor_below(
            conn,
            stream,
            point.hash(),
            parent,
            sibling.node_aggregate_id.as_ref(),
        )?
        .filter(|sibling| *sibling != anchor);

        edge.position = hierarchy::relation_position(conn, stream, point.hash(), parent, succeeding)?;
        edge.parent_anchor = parent;
        edge.update(conn)?;
        tagging::inherit_from_parent(conn, &mut edge)?;
    }
    Ok(())
}

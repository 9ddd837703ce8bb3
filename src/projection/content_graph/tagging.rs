//! Subtree tag handlers.
//!
//! A tag is stored on the *edge* of every node of the subtree, explicit on
//! the tagged node's own edge and inherited on its descendants' edges. That
//! keeps visibility checks local to one edge at read time; the cost is paid
//! here, walking the subtree after each change.

use std::collections::VecDeque;

use rusqlite::Connection;

use super::hierarchy::{self, HierarchyRelation};
use crate::error::{Error, Result};
use crate::events::{SubtreeWasTagged, SubtreeWasUntagged};
use crate::types::{ContentStreamId, NodeRelationAnchorPoint};

pub(super) fn on_subtree_tagged(conn: &Connection, event: &SubtreeWasTagged) -> Result<()> {
    for point in event.affected_dimension_space_points.iter() {
        let anchor = hierarchy::require_covering_anchor(conn, &event.content_stream_id, &event.node_aggregate_id, point)?;
        let mut edge = require_edge(conn, &event.content_stream_id, anchor, point.hash())?;
        edge.subtree_tags.explicit.insert(event.tag.clone());
        edge.update(conn)?;
        refresh_inherited_tags(conn, &edge)?;
    }
    Ok(())
}

pub(super) fn on_subtree_untagged(conn: &Connection, event: &SubtreeWasUntagged) -> Result<()> {
    for point in event.affected_dimension_space_points.iter() {
        let anchor = hierarchy::require_covering_anchor(conn, &event.content_stream_id, &event.node_aggregate_id, point)?;
        let mut edge = require_edge(conn, &event.content_stream_id, anchor, point.hash())?;
        edge.subtree_tags.explicit.remove(&event.tag);
        edge.update(conn)?;
        refresh_inherited_tags(conn, &edge)?;
    }
    Ok(())
}

fn require_edge(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    anchor: NodeRelationAnchorPoint,
    dimension_space_point_hash: &str,
) -> Result<HierarchyRelation> {
    hierarchy::find_incoming_edge(conn, content_stream_id, anchor, dimension_space_point_hash)?
        .ok_or_else(|| Error::violation(format!("node row {anchor} has no incoming edge")))
}

/// Recomputes the inherited tags of every edge below `edge`, breadth first.
///
/// A child whose inherited tags didn't change has correct descendants
/// already, so the walk stops there.
pub(crate) fn refresh_inherited_tags(conn: &Connection, edge: &HierarchyRelation) -> Result<()> {
    let mut queue = VecDeque::from([edge.clone()]);
    while let Some(parent_edge) = queue.pop_front() {
        let expected = parent_edge.subtree_tags.all();
        let children = hierarchy::find_child_edges(
            conn,
            &parent_edge.content_stream_id,
            parent_edge.child_anchor,
            &parent_edge.dimension_space_point_hash,
        )?;
        for mut child_edge in children {
            if child_edge.subtree_tags.inherited == expected {
                continue;
            }
            child_edge.subtree_tags.inherited = expected.clone();
            child_edge.update(conn)?;
            queue.push_back(child_edge);
        }
    }
    Ok(())
}

/// Sets the inherited tags of a moved edge from its new parent, then
/// refreshes the subtree.
pub(crate) fn inherit_from_parent(conn: &Connection, edge: &mut HierarchyRelation) -> Result<()> {
    let inherited = hierarchy::inherited_tags_below(
        conn,
        &edge.content_stream_id,
        edge.parent_anchor,
        &edge.dimension_space_point_hash,
    )?
    .inherited;
    if edge.subtree_tags.inherited != inherited {
        edge.subtree_tags.inherited = inherited;
        edge.update(conn)?;
    }
    refresh_inherited_tags(conn, edge)
}

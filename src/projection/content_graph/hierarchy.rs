//! # Hypergraph Storage
//!
//! Row types and SQL helpers for the two central tables:
//!
//! ```text
//! cr_node                                   cr_hierarchy_relation
//! ┌──────────────────────────┐              ┌────────────────────────────────────┐
//! │ relation_anchor_point PK │◄─────────────│ child_node_anchor   ┐              │
//! │ node_aggregate_id        │◄──┐          │ content_stream_id   ├ PK           │
//! │ origin point (+ hash)    │   │          │ dsp hash            ┘              │
//! │ node_type_name           │   └──────────│ parent_node_anchor  (0 = virtual)  │
//! │ classification, name     │              │ position                           │
//! │ properties (JSON)        │              │ subtree_tags (JSON)                │
//! └──────────────────────────┘              └────────────────────────────────────┘
//! ```
//!
//! A node row is one variant of one aggregate. Content streams never own
//! node rows; they own *edges*, and an edge is what makes a row visible in a
//! `(content stream, dimension space point)`. Forking copies edges only, so
//! right after a fork both streams point at the same rows.
//!
//! ## Copy on Write
//!
//! Before a stream changes a row that another stream can also see,
//! [`copy_on_write`] gives the writing stream a private copy:
//!
//! ```text
//! before                          after writing through cs-2
//!
//!   cs-1 ──► anchor 7               cs-1 ──► anchor 7   (untouched)
//!   cs-2 ──► anchor 7               cs-2 ──► anchor 12  (copy, changed)
//! ```
//!
//! The copy takes the row's references along. The copy and the repointing
//! of `cs-2`'s edges (incoming *and* outgoing) run in the caller's
//! transaction, so no reader sees one without the other.
//!
//! ## Positions
//!
//! Siblings are ordered by an integer `position` with gaps of
//! [`POSITION_OFFSET`]. Inserting between two siblings takes the midpoint;
//! when the gap is used up the siblings are renumbered.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::referencing;
use crate::dimension::DimensionSpacePoint;
use crate::error::{Error, Result};
use crate::types::{
    ContentStreamId, NodeAggregateClassification, NodeAggregateId, NodeName, NodeRelationAnchorPoint,
    NodeTypeName, PropertyValues, SubtreeTags,
};

/// Gap between two sibling positions after renumbering.
pub(crate) const POSITION_OFFSET: i64 = 128;

pub(crate) const CREATE_NODE: &str = r#"
CREATE TABLE IF NOT EXISTS cr_node (
    relation_anchor_point             INTEGER PRIMARY KEY AUTOINCREMENT,
    node_aggregate_id                 TEXT NOT NULL,
    origin_dimension_space_point      TEXT NOT NULL,
    origin_dimension_space_point_hash TEXT NOT NULL,
    node_type_name                    TEXT NOT NULL,
    classification                    TEXT NOT NULL,
    node_name                         TEXT,
    properties                        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS cr_node_aggregate
ON cr_node(node_aggregate_id, origin_dimension_space_point_hash);
"#;

pub(crate) const CREATE_HIERARCHY_RELATION: &str = r#"
CREATE TABLE IF NOT EXISTS cr_hierarchy_relation (
    parent_node_anchor         INTEGER NOT NULL,
    child_node_anchor          INTEGER NOT NULL,
    content_stream_id          TEXT NOT NULL,
    dimension_space_point_hash TEXT NOT NULL,
    position                   INTEGER NOT NULL,
    subtree_tags               TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (child_node_anchor, content_stream_id, dimension_space_point_hash)
);
CREATE INDEX IF NOT EXISTS cr_hierarchy_parent
ON cr_hierarchy_relation(parent_node_anchor, content_stream_id, dimension_space_point_hash, position);
CREATE INDEX IF NOT EXISTS cr_hierarchy_stream
ON cr_hierarchy_relation(content_stream_id, dimension_space_point_hash);
"#;

/// Maps point hashes back to points for the read side.
pub(crate) const CREATE_DIMENSION_SPACE_POINT: &str = r#"
CREATE TABLE IF NOT EXISTS cr_dimension_space_point (
    hash                  TEXT PRIMARY KEY,
    dimension_space_point TEXT NOT NULL
);
"#;

/// Column list matching [`RawNode::from_row`]; the node table must be
/// aliased as `n`.
pub(crate) const NODE_COLUMNS: &str = "n.relation_anchor_point, n.node_aggregate_id, \
     n.origin_dimension_space_point, n.node_type_name, n.classification, n.node_name, n.properties";

/// Number of columns in [`NODE_COLUMNS`].
pub(crate) const NODE_COLUMN_COUNT: usize = 7;

/// Column list matching [`RawRelation::from_row`]; the edge table must be
/// aliased as `h`.
pub(crate) const RELATION_COLUMNS: &str = "h.parent_node_anchor, h.child_node_anchor, \
     h.content_stream_id, h.dimension_space_point_hash, h.position, h.subtree_tags";

// =============================================================================
// Node Rows
// =============================================================================

/// One row of `cr_node`: one variant of a node aggregate.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NodeRecord {
    pub anchor: NodeRelationAnchorPoint,
    pub node_aggregate_id: NodeAggregateId,
    pub origin: DimensionSpacePoint,
    pub node_type_name: NodeTypeName,
    pub classification: NodeAggregateClassification,
    pub node_name: Option<NodeName>,
    pub properties: PropertyValues,
}

impl NodeRecord {
    /// Inserts this row under a fresh anchor and returns the anchor.
    ///
    /// `self.anchor` is ignored, which makes this the copy operation too.
    pub fn insert(&self, conn: &Connection) -> Result<NodeRelationAnchorPoint> {
        conn.execute(
            "INSERT INTO cr_node (node_aggregate_id, origin_dimension_space_point, \
             origin_dimension_space_point_hash, node_type_name, classification, node_name, properties) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                self.node_aggregate_id.as_str(),
                self.origin.to_json(),
                self.origin.hash(),
                self.node_type_name.as_str(),
                self.classification.as_str(),
                self.node_name.as_ref().map(|n| n.as_str()),
                serde_json::to_string(&self.properties)?,
            ],
        )?;
        Ok(NodeRelationAnchorPoint::from_raw(conn.last_insert_rowid()))
    }

    /// Overwrites the row at `self.anchor`.
    pub fn update(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE cr_node SET node_type_name = ?, node_name = ?, properties = ? \
             WHERE relation_anchor_point = ?",
            params![
                self.node_type_name.as_str(),
                self.node_name.as_ref().map(|n| n.as_str()),
                serde_json::to_string(&self.properties)?,
                self.anchor.as_raw(),
            ],
        )?;
        Ok(())
    }
}

/// A node row as SQLite returns it, before identifier validation.
pub(crate) struct RawNode {
    anchor: i64,
    node_aggregate_id: String,
    origin: String,
    node_type_name: String,
    classification: String,
    node_name: Option<String>,
    properties: String,
}

impl RawNode {
    /// Reads the [`NODE_COLUMNS`] starting at column `offset`.
    pub fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            anchor: row.get(offset)?,
            node_aggregate_id: row.get(offset + 1)?,
            origin: row.get(offset + 2)?,
            node_type_name: row.get(offset + 3)?,
            classification: row.get(offset + 4)?,
            node_name: row.get(offset + 5)?,
            properties: row.get(offset + 6)?,
        })
    }

    pub fn into_record(self) -> Result<NodeRecord> {
        Ok(NodeRecord {
            anchor: NodeRelationAnchorPoint::from_raw(self.anchor),
            node_aggregate_id: NodeAggregateId::new(self.node_aggregate_id)?,
            origin: DimensionSpacePoint::from_json(&self.origin)?,
            node_type_name: NodeTypeName::new(self.node_type_name)?,
            classification: NodeAggregateClassification::parse(&self.classification)?,
            node_name: self.node_name.map(NodeName::new).transpose()?,
            properties: serde_json::from_str(&self.properties)?,
        })
    }
}

/// Loads the row at `anchor`.
pub(crate) fn load_node(conn: &Connection, anchor: NodeRelationAnchorPoint) -> Result<Option<NodeRecord>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM cr_node n WHERE n.relation_anchor_point = ?");
    conn.query_row(&sql, [anchor.as_raw()], |row| RawNode::from_row(row, 0))
        .optional()?
        .map(RawNode::into_record)
        .transpose()
}

/// Loads the row at `anchor` or reports a consistency violation.
pub(crate) fn require_node(conn: &Connection, anchor: NodeRelationAnchorPoint) -> Result<NodeRecord> {
    load_node(conn, anchor)?.ok_or_else(|| Error::violation(format!("node row {anchor} does not exist")))
}

/// Finds the variant of an aggregate at an origin that `content_stream_id`
/// can see.
pub(crate) fn find_anchor_by_origin(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    node_aggregate_id: &NodeAggregateId,
    origin: &DimensionSpacePoint,
) -> Result<Option<NodeRelationAnchorPoint>> {
    let anchor: Option<i64> = conn
        .query_row(
            "SELECT n.relation_anchor_point FROM cr_node n \
             JOIN cr_hierarchy_relation h ON h.child_node_anchor = n.relation_anchor_point \
             WHERE n.node_aggregate_id = ? AND n.origin_dimension_space_point_hash = ? \
             AND h.content_stream_id = ? LIMIT 1",
            params![node_aggregate_id.as_str(), origin.hash(), content_stream_id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(anchor.map(NodeRelationAnchorPoint::from_raw))
}

/// Finds all variants of an aggregate that `content_stream_id` can see.
pub(crate) fn find_anchors_in_stream(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    node_aggregate_id: &NodeAggregateId,
) -> Result<Vec<NodeRelationAnchorPoint>> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT n.relation_anchor_point FROM cr_node n \
         JOIN cr_hierarchy_relation h ON h.child_node_anchor = n.relation_anchor_point \
         WHERE n.node_aggregate_id = ? AND h.content_stream_id = ? \
         ORDER BY n.relation_anchor_point",
    )?;
    let anchors = stmt
        .query_map(params![node_aggregate_id.as_str(), content_stream_id.as_str()], |row| {
            row.get::<_, i64>(0)
        })?
        .map(|anchor| anchor.map(NodeRelationAnchorPoint::from_raw))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(anchors)
}

/// Finds the variant of an aggregate that covers a point in a stream.
pub(crate) fn find_covering_anchor(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    node_aggregate_id: &NodeAggregateId,
    dimension_space_point_hash: &str,
) -> Result<Option<NodeRelationAnchorPoint>> {
    let anchor: Option<i64> = conn
        .query_row(
            "SELECT n.relation_anchor_point FROM cr_node n \
             JOIN cr_hierarchy_relation h ON h.child_node_anchor = n.relation_anchor_point \
             WHERE n.node_aggregate_id = ? AND h.content_stream_id = ? \
             AND h.dimension_space_point_hash = ?",
            params![
                node_aggregate_id.as_str(),
                content_stream_id.as_str(),
                dimension_space_point_hash
            ],
            |row| row.get(0),
        )
        .optional()?;
    Ok(anchor.map(NodeRelationAnchorPoint::from_raw))
}

/// Like [`find_covering_anchor`], but a missing node is a violation.
pub(crate) fn require_covering_anchor(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    node_aggregate_id: &NodeAggregateId,
    point: &DimensionSpacePoint,
) -> Result<NodeRelationAnchorPoint> {
    find_covering_anchor(conn, content_stream_id, node_aggregate_id, point.hash())?.ok_or_else(|| {
        Error::violation(format!(
            "node aggregate '{node_aggregate_id}' does not cover {point} in content stream '{content_stream_id}'"
        ))
    })
}

/// Deletes the row at `anchor`, with its references, if no edge points at
/// it anymore.
pub(crate) fn delete_node_if_orphaned(conn: &Connection, anchor: NodeRelationAnchorPoint) -> Result<bool> {
    let deleted = conn.execute(
        "DELETE FROM cr_node WHERE relation_anchor_point = ?1 \
         AND NOT EXISTS (SELECT 1 FROM cr_hierarchy_relation WHERE child_node_anchor = ?1)",
        [anchor.as_raw()],
    )?;
    if deleted > 0 {
        referencing::delete_references_of(conn, anchor)?;
    }
    Ok(deleted > 0)
}

/// Remembers a point so the read side can map its hash back.
pub(crate) fn register_point(conn: &Connection, point: &DimensionSpacePoint) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO cr_dimension_space_point (hash, dimension_space_point) VALUES (?, ?)",
        params![point.hash(), point.to_json()],
    )?;
    Ok(())
}

// =============================================================================
// Hierarchy Edges
// =============================================================================

/// One row of `cr_hierarchy_relation`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HierarchyRelation {
    pub parent_anchor: NodeRelationAnchorPoint,
    pub child_anchor: NodeRelationAnchorPoint,
    pub content_stream_id: ContentStreamId,
    pub dimension_space_point_hash: String,
    pub position: i64,
    pub subtree_tags: SubtreeTags,
}

impl HierarchyRelation {
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO cr_hierarchy_relation (parent_node_anchor, child_node_anchor, content_stream_id, \
             dimension_space_point_hash, position, subtree_tags) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                self.parent_anchor.as_raw(),
                self.child_anchor.as_raw(),
                self.content_stream_id.as_str(),
                self.dimension_space_point_hash,
                self.position,
                self.subtree_tags.to_json(),
            ],
        )?;
        Ok(())
    }

    /// Writes parent, position and tags back; the key is unchanged.
    pub fn update(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE cr_hierarchy_relation SET parent_node_anchor = ?, position = ?, subtree_tags = ? \
             WHERE child_node_anchor = ? AND content_stream_id = ? AND dimension_space_point_hash = ?",
            params![
                self.parent_anchor.as_raw(),
                self.position,
                self.subtree_tags.to_json(),
                self.child_anchor.as_raw(),
                self.content_stream_id.as_str(),
                self.dimension_space_point_hash,
            ],
        )?;
        Ok(())
    }

    pub fn delete(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "DELETE FROM cr_hierarchy_relation \
             WHERE child_node_anchor = ? AND content_stream_id = ? AND dimension_space_point_hash = ?",
            params![
                self.child_anchor.as_raw(),
                self.content_stream_id.as_str(),
                self.dimension_space_point_hash,
            ],
        )?;
        Ok(())
    }
}

/// An edge row as SQLite returns it.
pub(crate) struct RawRelation {
    parent_anchor: i64,
    child_anchor: i64,
    content_stream_id: String,
    dimension_space_point_hash: String,
    position: i64,
    subtree_tags: String,
}

impl RawRelation {
    /// Reads the [`RELATION_COLUMNS`] starting at column `offset`.
    pub fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            parent_anchor: row.get(offset)?,
            child_anchor: row.get(offset + 1)?,
            content_stream_id: row.get(offset + 2)?,
            dimension_space_point_hash: row.get(offset + 3)?,
            position: row.get(offset + 4)?,
            subtree_tags: row.get(offset + 5)?,
        })
    }

    pub fn into_relation(self) -> Result<HierarchyRelation> {
        Ok(HierarchyRelation {
            parent_anchor: NodeRelationAnchorPoint::from_raw(self.parent_anchor),
            child_anchor: NodeRelationAnchorPoint::from_raw(self.child_anchor),
            content_stream_id: ContentStreamId::new(self.content_stream_id)?,
            dimension_space_point_hash: self.dimension_space_point_hash,
            position: self.position,
            subtree_tags: SubtreeTags::from_json(&self.subtree_tags)?,
        })
    }
}

fn query_relations(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<HierarchyRelation>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let raw = stmt
        .query_map(params, |row| RawRelation::from_row(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter().map(RawRelation::into_relation).collect()
}

/// The edge that connects `child` in one `(stream, point)`.
pub(crate) fn find_incoming_edge(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    child: NodeRelationAnchorPoint,
    dimension_space_point_hash: &str,
) -> Result<Option<HierarchyRelation>> {
    let sql = format!(
        "SELECT {RELATION_COLUMNS} FROM cr_hierarchy_relation h \
         WHERE h.child_node_anchor = ? AND h.content_stream_id = ? AND h.dimension_space_point_hash = ?"
    );
    Ok(query_relations(
        conn,
        &sql,
        params![child.as_raw(), content_stream_id.as_str(), dimension_space_point_hash],
    )?
    .into_iter()
    .next())
}

/// All edges that connect `child` in a stream, one per covered point.
pub(crate) fn find_incoming_edges(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    child: NodeRelationAnchorPoint,
) -> Result<Vec<HierarchyRelation>> {
    let sql = format!(
        "SELECT {RELATION_COLUMNS} FROM cr_hierarchy_relation h \
         WHERE h.child_node_anchor = ? AND h.content_stream_id = ?"
    );
    query_relations(conn, &sql, params![child.as_raw(), content_stream_id.as_str()])
}

/// The edges below `parent` in one `(stream, point)`, ordered by position.
pub(crate) fn find_child_edges(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    parent: NodeRelationAnchorPoint,
    dimension_space_point_hash: &str,
) -> Result<Vec<HierarchyRelation>> {
    let sql = format!(
        "SELECT {RELATION_COLUMNS} FROM cr_hierarchy_relation h \
         WHERE h.parent_node_anchor = ? AND h.content_stream_id = ? AND h.dimension_space_point_hash = ? \
         ORDER BY h.position"
    );
    query_relations(
        conn,
        &sql,
        params![parent.as_raw(), content_stream_id.as_str(), dimension_space_point_hash],
    )
}

/// The tags a new child of `parent` inherits in one `(stream, point)`.
pub(crate) fn inherited_tags_below(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    parent: NodeRelationAnchorPoint,
    dimension_space_point_hash: &str,
) -> Result<SubtreeTags> {
    if parent.is_root() {
        return Ok(SubtreeTags::new());
    }
    Ok(find_incoming_edge(conn, content_stream_id, parent, dimension_space_point_hash)?
        .map(|edge| edge.subtree_tags.for_child())
        .unwrap_or_default())
}

// =============================================================================
// Positions
// =============================================================================

/// Computes the position for a new child of `parent`, placed before
/// `succeeding_sibling` or at the end.
///
/// Renumbers the siblings first when there is no room left.
pub(crate) fn relation_position(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    dimension_space_point_hash: &str,
    parent: NodeRelationAnchorPoint,
    succeeding_sibling: Option<NodeRelationAnchorPoint>,
) -> Result<i64> {
    match position_candidate(conn, content_stream_id, dimension_space_point_hash, parent, succeeding_sibling)? {
        Some(position) => Ok(position),
        None => {
            renumber_children(conn, content_stream_id, dimension_space_point_hash, parent)?;
            position_candidate(conn, content_stream_id, dimension_space_point_hash, parent, succeeding_sibling)?
                .ok_or_else(|| Error::violation(format!("no free position below node row {parent}")))
        }
    }
}

/// Returns `None` if the candidate is odd or collides with the preceding
/// sibling.
fn position_candidate(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    dimension_space_point_hash: &str,
    parent: NodeRelationAnchorPoint,
    succeeding_sibling: Option<NodeRelationAnchorPoint>,
) -> Result<Option<i64>> {
    let Some(sibling) = succeeding_sibling else {
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(position) FROM cr_hierarchy_relation \
             WHERE parent_node_anchor = ? AND content_stream_id = ? AND dimension_space_point_hash = ?",
            params![parent.as_raw(), content_stream_id.as_str(), dimension_space_point_hash],
            |row| row.get(0),
        )?;
        return Ok(Some(max.map_or(0, |max| max + POSITION_OFFSET)));
    };

    let sibling_edge = find_incoming_edge(conn, content_stream_id, sibling, dimension_space_point_hash)?
        .filter(|edge| edge.parent_anchor == parent)
        .ok_or_else(|| Error::violation(format!("node row {sibling} is not a child of node row {parent}")))?;

    let preceding: Option<i64> = conn.query_row(
        "SELECT MAX(position) FROM cr_hierarchy_relation \
         WHERE parent_node_anchor = ? AND content_stream_id = ? AND dimension_space_point_hash = ? \
         AND position < ?",
        params![
            parent.as_raw(),
            content_stream_id.as_str(),
            dimension_space_point_hash,
            sibling_edge.position
        ],
        |row| row.get(0),
    )?;

    let position = match preceding {
        Some(preceding) => {
            let midpoint = (preceding + sibling_edge.position) / 2;
            if midpoint == preceding {
                return Ok(None);
            }
            midpoint
        }
        None => sibling_edge.position - POSITION_OFFSET,
    };

    Ok((position % 2 == 0).then_some(position))
}

/// Spreads the children of `parent` out to multiples of [`POSITION_OFFSET`].
fn renumber_children(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    dimension_space_point_hash: &str,
    parent: NodeRelationAnchorPoint,
) -> Result<()> {
    let edges = find_child_edges(conn, content_stream_id, parent, dimension_space_point_hash)?;
    for (index, mut edge) in edges.into_iter().enumerate() {
        edge.position = index as i64 * POSITION_OFFSET;
        edge.update(conn)?;
    }
    Ok(())
}

/// Connects `child` below `parent` in one `(stream, point)`.
pub(crate) fn connect(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    point: &DimensionSpacePoint,
    parent: NodeRelationAnchorPoint,
    child: NodeRelationAnchorPoint,
    succeeding_sibling: Option<NodeRelationAnchorPoint>,
    subtree_tags: SubtreeTags,
) -> Result<()> {
    register_point(conn, point)?;
    let position = relation_position(conn, content_stream_id, point.hash(), parent, succeeding_sibling)?;
    HierarchyRelation {
        parent_anchor: parent,
        child_anchor: child,
        content_stream_id: content_stream_id.clone(),
        dimension_space_point_hash: point.hash().to_string(),
        position,
        subtree_tags,
    }
    .insert(conn)
}

/// Resolves the succeeding sibling aggregate to its anchor, if it is a
/// child of `parent` in this `(stream, point)`.
pub(crate) fn sibling_anchor_below(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    dimension_space_point_hash: &str,
    parent: NodeRelationAnchorPoint,
    sibling: Option<&NodeAggregateId>,
) -> Result<Option<NodeRelationAnchorPoint>> {
    let Some(sibling) = sibling else {
        return Ok(None);
    };
    let Some(anchor) = find_covering_anchor(conn, content_stream_id, sibling, dimension_space_point_hash)? else {
        return Ok(None);
    };
    let edge = find_incoming_edge(conn, content_stream_id, anchor, dimension_space_point_hash)?;
    Ok(edge.filter(|edge| edge.parent_anchor == parent).map(|_| anchor))
}

// =============================================================================
// Copy on Write
// =============================================================================

/// Changes the node row at `anchor` as seen from `content_stream_id`.
///
/// If other streams share the row, the change lands on a private copy and
/// the writing stream's edges are repointed to it. Returns the anchor that
/// now holds the changed row.
pub(crate) fn copy_on_write(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    anchor: NodeRelationAnchorPoint,
    change: impl FnOnce(&mut NodeRecord),
) -> Result<NodeRelationAnchorPoint> {
    let mut node = require_node(conn, anchor)?;
    change(&mut node);

    let streams: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT content_stream_id) FROM cr_hierarchy_relation WHERE child_node_anchor = ?",
        [anchor.as_raw()],
        |row| row.get(0),
    )?;

    if streams <= 1 {
        node.update(conn)?;
        return Ok(anchor);
    }

    let copy = node.insert(conn)?;
    referencing::copy_references(conn, anchor, copy)?;
    reassign_child(conn, content_stream_id, None, anchor, copy)?;
    reassign_parent(conn, content_stream_id, None, anchor, copy)?;
    tracing::trace!(
        content_stream_id = %content_stream_id,
        from = anchor.as_raw(),
        to = copy.as_raw(),
        "disentangled shared node row"
    );
    Ok(copy)
}

/// Points the incoming edges of `from` at `to`, in one point or all.
pub(crate) fn reassign_child(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    dimension_space_point_hash: Option<&str>,
    from: NodeRelationAnchorPoint,
    to: NodeRelationAnchorPoint,
) -> Result<()> {
    conn.execute(
        "UPDATE cr_hierarchy_relation SET child_node_anchor = ?1 \
         WHERE child_node_anchor = ?2 AND content_stream_id = ?3 \
         AND (?4 IS NULL OR dimension_space_point_hash = ?4)",
        params![to.as_raw(), from.as_raw(), content_stream_id.as_str(), dimension_space_point_hash],
    )?;
    Ok(())
}

/// Points the outgoing edges of `from` at `to`, in one point or all.
pub(crate) fn reassign_parent(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    dimension_space_point_hash: Option<&str>,
    from: NodeRelationAnchorPoint,
    to: NodeRelationAnchorPoint,
) -> Result<()> {
    conn.execute(
        "UPDATE cr_hierarchy_relation SET parent_node_anchor = ?1 \
         WHERE parent_node_anchor = ?2 AND content_stream_id = ?3 \
         AND (?4 IS NULL OR dimension_space_point_hash = ?4)",
        params![to.as_raw(), from.as_raw(), content_stream_id.as_str(), dimension_space_point_hash],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    fn setup() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.connection().execute_batch(CREATE_NODE).unwrap();
        db.connection().execute_batch(CREATE_HIERARCHY_RELATION).unwrap();
        db.connection().execute_batch(CREATE_DIMENSION_SPACE_POINT).unwrap();
        db.connection()
            .execute_batch(referencing::CREATE_REFERENCE_RELATION)
            .unwrap();
        db
    }

    fn cs(id: &str) -> ContentStreamId {
        ContentStreamId::new(id).unwrap()
    }

    fn node(id: &str) -> NodeRecord {
        NodeRecord {
            anchor: NodeRelationAnchorPoint::ROOT,
            node_aggregate_id: NodeAggregateId::new(id).unwrap(),
            origin: DimensionSpacePoint::empty(),
            node_type_name: NodeTypeName::new("Acme:Page").unwrap(),
            classification: NodeAggregateClassification::Regular,
            node_name: None,
            properties: PropertyValues::new(),
        }
    }

    fn child_ids(conn: &Connection, stream: &ContentStreamId, parent: NodeRelationAnchorPoint) -> Vec<String> {
        let point = DimensionSpacePoint::empty();
        find_child_edges(conn, stream, parent, point.hash())
            .unwrap()
            .into_iter()
            .map(|edge| require_node(conn, edge.child_anchor).unwrap().node_aggregate_id.to_string())
            .collect()
    }

    #[test]
    fn test_positions_respect_succeeding_sibling() {
        let db = setup();
        let conn = db.connection();
        let stream = cs("cs-1");
        let point = DimensionSpacePoint::empty();
        let root = NodeRelationAnchorPoint::ROOT;

        let a = node("a").insert(conn).unwrap();
        let b = node("b").insert(conn).unwrap();
        let c = node("c").insert(conn).unwrap();

        connect(conn, &stream, &point, root, a, None, SubtreeTags::new()).unwrap();
        connect(conn, &stream, &point, root, c, None, SubtreeTags::new()).unwrap();
        connect(conn, &stream, &point, root, b, Some(c), SubtreeTags::new()).unwrap();

        assert_eq!(child_ids(conn, &stream, root), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_positions_renumber_when_gap_is_exhausted() {
        let db = setup();
        let conn = db.connection();
        let stream = cs("cs-1");
        let point = DimensionSpacePoint::empty();
        let root = NodeRelationAnchorPoint::ROOT;

        let last = node("last").insert(conn).unwrap();
        let first = node("first").insert(conn).unwrap();
        connect(conn, &stream, &point, root, first, None, SubtreeTags::new()).unwrap();
        connect(conn, &stream, &point, root, last, None, SubtreeTags::new()).unwrap();

        // Each insert halves the gap in front of `last`.
        let mut expected = vec!["first".to_string()];
        for i in 0..10 {
            let id = format!("n{i}");
            let anchor = node(&id).insert(conn).unwrap();
            connect(conn, &stream, &point, root, anchor, Some(last), SubtreeTags::new()).unwrap();
            expected.push(id);
        }
        expected.push("last".to_string());

        assert_eq!(child_ids(conn, &stream, root), expected);
    }

    #[test]
    fn test_copy_on_write_disentangles_shared_rows() {
        let db = setup();
        let conn = db.connection();
        let point = DimensionSpacePoint::empty();
        let root = NodeRelationAnchorPoint::ROOT;
        let (one, two) = (cs("cs-1"), cs("cs-2"));

        let parent = node("parent").insert(conn).unwrap();
        let child = node("child").insert(conn).unwrap();
        connect(conn, &one, &point, root, parent, None, SubtreeTags::new()).unwrap();
        connect(conn, &one, &point, parent, child, None, SubtreeTags::new()).unwrap();
        connect(conn, &two, &point, root, parent, None, SubtreeTags::new()).unwrap();
        connect(conn, &two, &point, parent, child, None, SubtreeTags::new()).unwrap();

        let copy = copy_on_write(conn, &two, parent, |n| {
            n.properties.insert("title".into(), serde_json::json!("changed"));
        })
        .unwrap();
        assert_ne!(copy, parent);

        assert!(require_node(conn, parent).unwrap().properties.is_empty());
        assert_eq!(require_node(conn, copy).unwrap().properties["title"], "changed");

        // cs-2's child now hangs below the copy, cs-1's below the original.
        let edge_two = find_incoming_edge(conn, &two, child, point.hash()).unwrap().unwrap();
        let edge_one = find_incoming_edge(conn, &one, child, point.hash()).unwrap().unwrap();
        assert_eq!(edge_two.parent_anchor, copy);
        assert_eq!(edge_one.parent_anchor, parent);

        // A second write through cs-2 changes the copy in place.
        let again = copy_on_write(conn, &two, copy, |n| n.node_name = None).unwrap();
        assert_eq!(again, copy);
    }

    #[test]
    fn test_orphaned_rows_are_deleted() {
        let db = setup();
        let conn = db.connection();
        let point = DimensionSpacePoint::empty();
        let stream = cs("cs-1");

        let anchor = node("a").insert(conn).unwrap();
        connect(conn, &stream, &point, NodeRelationAnchorPoint::ROOT, anchor, None, SubtreeTags::new()).unwrap();
        assert!(!delete_node_if_orphaned(conn, anchor).unwrap());

        find_incoming_edge(conn, &stream, anchor, point.hash())
            .unwrap()
            .unwrap()
            .delete(conn)
            .unwrap();
        assert!(delete_node_if_orphaned(conn, anchor).unwrap());
        assert!(load_node(conn, anchor).unwrap().is_none());
    }
}

//! References between nodes.
//!
//! `cr_reference_relation` holds one row per reference, keyed by the node
//! *row* it starts from:
//!
//! ```text
//! cr_reference_relation
//! ┌────────────────────────────────┐
//! │ node_anchor_point   ┐          │ ──► cr_node.relation_anchor_point
//! │ name                ├ PK       │
//! │ position            ┘          │
//! │ destination_node_aggregate_id  │ ──► any variant visible in the subgraph
//! │ properties (JSON or NULL)      │
//! └────────────────────────────────┘
//! ```
//!
//! Streams do not own references, just as they do not own node rows. A
//! stream sees the references of the rows its edges point at, so a fork
//! shares them without copying, and [`hierarchy::copy_on_write`] carries
//! them over to a private copy before the writing stream changes them.
//!
//! Targets are stored by aggregate id. Which variant of the target a
//! reference resolves to is decided by the subgraph that reads it.

use rusqlite::{params, Connection};

use super::hierarchy;
use crate::error::{Error, Result};
use crate::events::NodeReferencesWereSet;
use crate::types::{NodeAggregateId, NodeRelationAnchorPoint, PropertyValues, ReferenceName};

pub(crate) const CREATE_REFERENCE_RELATION: &str = r#"
CREATE TABLE IF NOT EXISTS cr_reference_relation (
    node_anchor_point             INTEGER NOT NULL,
    name                          TEXT NOT NULL,
    position                      INTEGER NOT NULL,
    destination_node_aggregate_id TEXT NOT NULL,
    properties                    TEXT,
    PRIMARY KEY (node_anchor_point, name, position)
);
CREATE INDEX IF NOT EXISTS cr_reference_destination
ON cr_reference_relation(destination_node_aggregate_id, name);
"#;

/// One stored reference.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReferenceRecord {
    pub source_anchor: NodeRelationAnchorPoint,
    pub name: ReferenceName,
    pub destination: NodeAggregateId,
    pub properties: Option<PropertyValues>,
}

type RawReference = (i64, String, String, Option<String>);

impl ReferenceRecord {
    fn from_raw((anchor, name, destination, properties): RawReference) -> Result<Self> {
        Ok(Self {
            source_anchor: NodeRelationAnchorPoint::from_raw(anchor),
            name: ReferenceName::new(name)?,
            destination: NodeAggregateId::new(destination)?,
            properties: properties.as_deref().map(serde_json::from_str).transpose()?,
        })
    }
}

fn query_references(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ReferenceRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| -> rusqlite::Result<RawReference> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
    })?;
    let mut references = Vec::new();
    for row in rows {
        references.push(ReferenceRecord::from_raw(row?)?);
    }
    Ok(references)
}

/// The references starting at one node row, by name then position.
pub(crate) fn find_references_from(
    conn: &Connection,
    anchor: NodeRelationAnchorPoint,
    name: Option<&ReferenceName>,
) -> Result<Vec<ReferenceRecord>> {
    query_references(
        conn,
        "SELECT node_anchor_point, name, destination_node_aggregate_id, properties \
         FROM cr_reference_relation \
         WHERE node_anchor_point = ?1 AND (?2 IS NULL OR name = ?2) \
         ORDER BY name, position",
        params![anchor.as_raw(), name.map(ReferenceName::as_str)],
    )
}

/// The references from one node row to one aggregate.
pub(crate) fn find_references_between(
    conn: &Connection,
    anchor: NodeRelationAnchorPoint,
    destination: &NodeAggregateId,
    name: Option<&ReferenceName>,
) -> Result<Vec<ReferenceRecord>> {
    query_references(
        conn,
        "SELECT node_anchor_point, name, destination_node_aggregate_id, properties \
         FROM cr_reference_relation \
         WHERE node_anchor_point = ?1 AND destination_node_aggregate_id = ?2 AND (?3 IS NULL OR name = ?3) \
         ORDER BY name, position",
        params![anchor.as_raw(), destination.as_str(), name.map(ReferenceName::as_str)],
    )
}

/// Gives the row at `to` the same references as the row at `from`.
pub(crate) fn copy_references(conn: &Connection, from: NodeRelationAnchorPoint, to: NodeRelationAnchorPoint) -> Result<()> {
    conn.execute(
        "INSERT INTO cr_reference_relation \
         (node_anchor_point, name, position, destination_node_aggregate_id, properties) \
         SELECT ?1, name, position, destination_node_aggregate_id, properties \
         FROM cr_reference_relation WHERE node_anchor_point = ?2",
        params![to.as_raw(), from.as_raw()],
    )?;
    Ok(())
}

pub(crate) fn delete_references_of(conn: &Connection, anchor: NodeRelationAnchorPoint) -> Result<()> {
    conn.execute(
        "DELETE FROM cr_reference_relation WHERE node_anchor_point = ?",
        [anchor.as_raw()],
    )?;
    Ok(())
}

/// Deletes the references of node rows that no longer exist.
pub(crate) fn delete_orphaned_references(conn: &Connection) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM cr_reference_relation WHERE NOT EXISTS \
         (SELECT 1 FROM cr_node n WHERE n.relation_anchor_point = cr_reference_relation.node_anchor_point)",
        [],
    )?)
}

pub(super) fn on_node_references_set(conn: &Connection, event: &NodeReferencesWereSet) -> Result<()> {
    let stream = &event.content_stream_id;
    for origin in event.affected_source_origin_dimension_space_points.iter() {
        let anchor = hierarchy::find_anchor_by_origin(conn, stream, &event.node_aggregate_id, origin)?
            .ok_or_else(|| {
                Error::violation(format!(
                    "node aggregate '{}' has no variant at {origin} in content stream '{stream}'",
                    event.node_aggregate_id
                ))
            })?;
        let anchor = hierarchy::copy_on_write(conn, stream, anchor, |_| {})?;

        conn.execute(
            "DELETE FROM cr_reference_relation WHERE node_anchor_point = ? AND name = ?",
            params![anchor.as_raw(), event.reference_name.as_str()],
        )?;
        for (position, reference) in event.references.iter().enumerate() {
            let properties = reference.properties.as_ref().map(serde_json::to_string).transpose()?;
            conn.execute(
                "INSERT INTO cr_reference_relation \
                 (node_anchor_point, name, position, destination_node_aggregate_id, properties) \
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    anchor.as_raw(),
                    event.reference_name.as_str(),
                    position as i64,
                    reference.target_node_aggregate_id.as_str(),
                    properties,
                ],
            )?;
        }
    }
    Ok(())
}

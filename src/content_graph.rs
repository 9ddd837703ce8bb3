//! # Content Graph (Aggregate View)
//!
//! The command side needs to see a node aggregate as a whole: all its
//! variants in one content stream, which origins they occupy and which
//! points each of them covers. [`ContentGraph`] answers that, per stream,
//! straight from the projection tables.
//!
//! ```text
//!   agg-1 in cs-1, dimension language: en ◄── de ◄── de_ch
//!
//!   occupied:  {en}        {de}
//!   covers:    {en}        {de, de_ch}
//! ```
//!
//! For subgraph traversal (one point, one variant per aggregate) see
//! [`crate::subgraph`].

use std::collections::HashMap;

use indexmap::IndexMap;
use rusqlite::{params, Connection, Params};

use crate::dimension::{DimensionSpacePoint, DimensionSpacePointSet};
use crate::error::Result;
use crate::projection::content_graph::hierarchy::{RawNode, NODE_COLUMNS, NODE_COLUMN_COUNT};
use crate::types::{
    ContentStreamId, NodeAggregateClassification, NodeAggregateId, NodeName, NodeTypeName, PropertyValues,
    SubtreeTags,
};

/// One variant of a node aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeVariant {
    pub origin_dimension_space_point: DimensionSpacePoint,
    pub node_type_name: NodeTypeName,
    pub node_name: Option<NodeName>,
    pub properties: PropertyValues,
}

/// A node aggregate as seen from one content stream.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAggregate {
    pub content_stream_id: ContentStreamId,
    pub node_aggregate_id: NodeAggregateId,
    pub node_type_name: NodeTypeName,
    pub classification: NodeAggregateClassification,
    pub node_name: Option<NodeName>,
    variants: IndexMap<String, NodeVariant>,
    occupied: DimensionSpacePointSet,
    covered: DimensionSpacePointSet,
    coverage_by_occupant: HashMap<String, DimensionSpacePointSet>,
    occupation_by_covered: HashMap<String, DimensionSpacePoint>,
    tags_by_covered: HashMap<String, SubtreeTags>,
}

impl NodeAggregate {
    pub fn is_root(&self) -> bool {
        self.classification == NodeAggregateClassification::Root
    }

    pub fn is_tethered(&self) -> bool {
        self.classification == NodeAggregateClassification::Tethered
    }

    /// Origins with a variant.
    pub fn occupied_dimension_space_points(&self) -> &DimensionSpacePointSet {
        &self.occupied
    }

    /// Points where some variant is visible.
    pub fn covered_dimension_space_points(&self) -> &DimensionSpacePointSet {
        &self.covered
    }

    pub fn occupies(&self, point: &DimensionSpacePoint) -> bool {
        self.occupied.contains(point)
    }

    pub fn covers(&self, point: &DimensionSpacePoint) -> bool {
        self.covered.contains(point)
    }

    /// The variant at an origin.
    pub fn variant(&self, origin: &DimensionSpacePoint) -> Option<&NodeVariant> {
        self.variants.get(origin.hash())
    }

    pub fn variants(&self) -> impl Iterator<Item = &NodeVariant> {
        self.variants.values()
    }

    /// Points covered by the variant at `origin`.
    pub fn coverage_by_occupant(&self, origin: &DimensionSpacePoint) -> DimensionSpacePointSet {
        self.coverage_by_occupant
            .get(origin.hash())
            .cloned()
            .unwrap_or_default()
    }

    /// Origin of the variant visible at `covered`.
    pub fn occupation_by_covered(&self, covered: &DimensionSpacePoint) -> Option<&DimensionSpacePoint> {
        self.occupation_by_covered.get(covered.hash())
    }

    /// Tags on the edge at `covered`.
    pub fn subtree_tags(&self, covered: &DimensionSpacePoint) -> Option<&SubtreeTags> {
        self.tags_by_covered.get(covered.hash())
    }
}

/// Aggregate queries for one content stream.
#[derive(Debug, Clone)]
pub struct ContentGraph<'a> {
    conn: &'a Connection,
    content_stream_id: ContentStreamId,
}

/// Selects one row per (variant, covered point); `?1` is the stream.
const AGGREGATE_SELECT: &str = "FROM cr_node n \
     JOIN cr_hierarchy_relation h ON h.child_node_anchor = n.relation_anchor_point \
     JOIN cr_dimension_space_point dsp ON dsp.hash = h.dimension_space_point_hash \
     WHERE h.content_stream_id = ?1";

impl<'a> ContentGraph<'a> {
    pub fn new(conn: &'a Connection, content_stream_id: ContentStreamId) -> Self {
        Self {
            conn,
            content_stream_id,
        }
    }

    pub fn content_stream_id(&self) -> &ContentStreamId {
        &self.content_stream_id
    }

    pub fn find_node_aggregate_by_id(&self, node_aggregate_id: &NodeAggregateId) -> Result<Option<NodeAggregate>> {
        Ok(self
            .query("AND n.node_aggregate_id = ?2", params![self.content_stream_id.as_str(), node_aggregate_id.as_str()])?
            .into_iter()
            .next())
    }

    /// Aggregates with a variant that is the parent of some variant of
    /// `child` (normally exactly one).
    pub fn find_parent_node_aggregates(&self, child: &NodeAggregateId) -> Result<Vec<NodeAggregate>> {
        self.query(
            "AND n.node_aggregate_id IN (\
                SELECT pn.node_aggregate_id FROM cr_hierarchy_relation ch \
                JOIN cr_node cn ON cn.relation_anchor_point = ch.child_node_anchor \
                JOIN cr_node pn ON pn.relation_anchor_point = ch.parent_node_anchor \
                WHERE ch.content_stream_id = ?1 AND cn.node_aggregate_id = ?2)",
            params![self.content_stream_id.as_str(), child.as_str()],
        )
    }

    /// Aggregates with a variant below some variant of `parent`.
    pub fn find_child_node_aggregates(&self, parent: &NodeAggregateId) -> Result<Vec<NodeAggregate>> {
        self.query(
            "AND n.node_aggregate_id IN (\
                SELECT cn.node_aggregate_id FROM cr_hierarchy_relation ch \
                JOIN cr_node cn ON cn.relation_anchor_point = ch.child_node_anchor \
                JOIN cr_node pn ON pn.relation_anchor_point = ch.parent_node_anchor \
                WHERE ch.content_stream_id = ?1 AND pn.node_aggregate_id = ?2)",
            params![self.content_stream_id.as_str(), parent.as_str()],
        )
    }

    pub fn find_tethered_child_node_aggregates(&self, parent: &NodeAggregateId) -> Result<Vec<NodeAggregate>> {
        Ok(self
            .find_child_node_aggregates(parent)?
            .into_iter()
            .filter(NodeAggregate::is_tethered)
            .collect())
    }

    /// Child aggregates of `parent` named `name`.
    pub fn find_child_node_aggregates_by_name(
        &self,
        parent: &NodeAggregateId,
        name: &NodeName,
    ) -> Result<Vec<NodeAggregate>> {
        Ok(self
            .find_child_node_aggregates(parent)?
            .into_iter()
            .filter(|child| child.node_name.as_ref() == Some(name))
            .collect())
    }

    pub fn find_root_node_aggregate_by_type(&self, node_type_name: &NodeTypeName) -> Result<Option<NodeAggregate>> {
        Ok(self
            .query(
                "AND h.parent_node_anchor = 0 AND n.node_type_name = ?2",
                params![self.content_stream_id.as_str(), node_type_name.as_str()],
            )?
            .into_iter()
            .next())
    }

    /// Returns true if `candidate` is below `ancestor` in any point.
    pub fn is_descendant(&self, ancestor: &NodeAggregateId, candidate: &NodeAggregateId) -> Result<bool> {
        Ok(self.conn.query_row(
            "WITH RECURSIVE ancestry(anchor) AS (\
                SELECT h.parent_node_anchor FROM cr_hierarchy_relation h \
                JOIN cr_node n ON n.relation_anchor_point = h.child_node_anchor \
                WHERE h.content_stream_id = ?1 AND n.node_aggregate_id = ?2 \
              UNION \
                SELECT h.parent_node_anchor FROM cr_hierarchy_relation h \
                JOIN ancestry a ON h.child_node_anchor = a.anchor \
                WHERE h.content_stream_id = ?1) \
             SELECT EXISTS (SELECT 1 FROM ancestry a \
                JOIN cr_node n ON n.relation_anchor_point = a.anchor \
                WHERE n.node_aggregate_id = ?3)",
            params![self.content_stream_id.as_str(), candidate.as_str(), ancestor.as_str()],
            |row| row.get(0),
        )?)
    }

    fn query(&self, condition: &str, params: impl Params) -> Result<Vec<NodeAggregate>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS}, dsp.dimension_space_point, h.subtree_tags {AGGREGATE_SELECT} {condition} \
             ORDER BY n.relation_anchor_point"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    RawNode::from_row(row, 0)?,
                    row.get::<_, String>(NODE_COLUMN_COUNT)?,
                    row.get::<_, String>(NODE_COLUMN_COUNT + 1)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut aggregates: IndexMap<NodeAggregateId, NodeAggregate> = IndexMap::new();
        for (raw, covered, tags) in rows {
            let record = raw.into_record()?;
            let covered = DimensionSpacePoint::from_json(&covered)?;
            let tags = SubtreeTags::from_json(&tags)?;

            let aggregate = aggregates
                .entry(record.node_aggregate_id.clone())
                .or_insert_with(|| NodeAggregate {
                    content_stream_id: self.content_stream_id.clone(),
                    node_aggregate_id: record.node_aggregate_id.clone(),
                    node_type_name: record.node_type_name.clone(),
                    classification: record.classification,
                    node_name: record.node_name.clone(),
                    variants: IndexMap::new(),
                    occupied: DimensionSpacePointSet::new(),
                    covered: DimensionSpacePointSet::new(),
                    coverage_by_occupant: HashMap::new(),
                    occupation_by_covered: HashMap::new(),
                    tags_by_covered: HashMap::new(),
                });

            let origin_hash = record.origin.hash().to_string();
            aggregate.occupied.insert(record.origin.clone());
            aggregate
                .coverage_by_occupant
                .entry(origin_hash.clone())
                .or_default()
                .insert(covered.clone());
            aggregate
                .occupation_by_covered
                .insert(covered.hash().to_string(), record.origin.clone());
            aggregate.tags_by_covered.insert(covered.hash().to_string(), tags);
            aggregate.covered.insert(covered);
            aggregate.variants.entry(origin_hash).or_insert_with(|| NodeVariant {
                origin_dimension_space_point: record.origin,
                node_type_name: record.node_type_name,
                node_name: record.node_name,
                properties: record.properties,
            });
        }

        Ok(aggregates.into_values().collect())
    }
}

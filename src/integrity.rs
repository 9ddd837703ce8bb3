//! # Projection Integrity Checks
//!
//! The content graph projection is built from events that the command
//! handler validated. If the projection code has a bug, the tables drift
//! into shapes no event sequence should produce. [`ProjectionIntegrityViolationDetector`]
//! looks for those shapes with plain SQL over the projection tables.
//!
//! | Check | Finds |
//! |-------|-------|
//! | Hierarchy integrity | Edges whose parent or child node row is missing |
//! | Stream integrity | Edges in removed or unknown content streams |
//! | Orphans | Node rows without any incoming edge |
//! | Multiple parents | An aggregate reachable twice in one subgraph |
//! | Ambiguous aggregates | Two node rows for one aggregate and origin in one stream |
//! | Disconnected nodes | Edges not reachable from a root edge (includes cycles) |
//! | Sibling order | Two siblings with the same position |
//! | Tethered names | Tethered nodes without a name |
//! | Typing | An aggregate with more than one node type in one stream |
//! | Reference integrity | References starting at a missing node row |
//!
//! None of the checks modify anything; run them in tests or from an admin
//! tool after a replay.

use rusqlite::{Connection, Row};

use crate::error::Result;
use crate::types::NodeAggregateClassification;

/// What kind of damage was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntegrityViolationKind {
    HierarchyIntegrityIsCompromised,
    EdgeInRemovedContentStream,
    NodeWithoutIncomingEdge,
    NodeHasMultipleParents,
    AmbiguousNodeAggregate,
    NodeIsDisconnectedFromRoot,
    SiblingsAreAmbiguouslySorted,
    TetheredNodeIsUnnamed,
    NodeAggregateIsAmbiguouslyTyped,
    ReferenceIntegrityIsCompromised,
}

/// One finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityViolation {
    pub kind: IntegrityViolationKind,
    pub message: String,
}

impl IntegrityViolation {
    fn new(kind: IntegrityViolationKind, message: String) -> Self {
        Self { kind, message }
    }
}

/// Runs the integrity checks against one database.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionIntegrityViolationDetector<'a> {
    conn: &'a Connection,
}

impl<'a> ProjectionIntegrityViolationDetector<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Runs every check; an empty list means the tables are consistent.
    pub fn run(&self) -> Result<Vec<IntegrityViolation>> {
        let mut violations = Vec::new();
        violations.extend(self.hierarchy_integrity_is_provided()?);
        violations.extend(self.edges_belong_to_live_content_streams()?);
        violations.extend(self.all_nodes_have_incoming_edges()?);
        violations.extend(self.all_nodes_have_at_most_one_parent_per_subgraph()?);
        violations.extend(self.node_aggregates_are_unambiguous_per_origin()?);
        violations.extend(self.all_nodes_are_connected_to_a_root_node()?);
        violations.extend(self.siblings_are_distinctly_sorted()?);
        violations.extend(self.tethered_nodes_are_named()?);
        violations.extend(self.node_aggregates_are_consistently_typed()?);
        violations.extend(self.reference_integrity_is_provided()?);
        Ok(violations)
    }

    pub fn hierarchy_integrity_is_provided(&self) -> Result<Vec<IntegrityViolation>> {
        let mut violations = self.collect(
            "SELECT h.content_stream_id, h.parent_node_anchor FROM cr_hierarchy_relation h \
             LEFT JOIN cr_node p ON p.relation_anchor_point = h.parent_node_anchor \
             WHERE h.parent_node_anchor != 0 AND p.relation_anchor_point IS NULL",
            |row| {
                Ok(IntegrityViolation::new(
                    IntegrityViolationKind::HierarchyIntegrityIsCompromised,
                    format!(
                        "edge in content stream '{}' references missing parent anchor {}",
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?
                    ),
                ))
            },
        )?;
        violations.extend(self.collect(
            "SELECT h.content_stream_id, h.child_node_anchor FROM cr_hierarchy_relation h \
             LEFT JOIN cr_node c ON c.relation_anchor_point = h.child_node_anchor \
             WHERE c.relation_anchor_point IS NULL",
            |row| {
                Ok(IntegrityViolation::new(
                    IntegrityViolationKind::HierarchyIntegrityIsCompromised,
                    format!(
                        "edge in content stream '{}' references missing child anchor {}",
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?
                    ),
                ))
            },
        )?);
        Ok(violations)
    }

    pub fn edges_belong_to_live_content_streams(&self) -> Result<Vec<IntegrityViolation>> {
        self.collect(
            "SELECT DISTINCT h.content_stream_id FROM cr_hierarchy_relation h \
             LEFT JOIN cr_content_stream cs ON cs.content_stream_id = h.content_stream_id \
             WHERE cs.content_stream_id IS NULL OR cs.removed = 1",
            |row| {
                Ok(IntegrityViolation::new(
                    IntegrityViolationKind::EdgeInRemovedContentStream,
                    format!(
                        "edges exist for removed or unknown content stream '{}'",
                        row.get::<_, String>(0)?
                    ),
                ))
            },
        )
    }

    pub fn all_nodes_have_incoming_edges(&self) -> Result<Vec<IntegrityViolation>> {
        self.collect(
            "SELECT n.relation_anchor_point, n.node_aggregate_id FROM cr_node n \
             WHERE NOT EXISTS (SELECT 1 FROM cr_hierarchy_relation h \
                               WHERE h.child_node_anchor = n.relation_anchor_point)",
            |row| {
                Ok(IntegrityViolation::new(
                    IntegrityViolationKind::NodeWithoutIncomingEdge,
                    format!(
                        "node {} of aggregate '{}' has no incoming edge",
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?
                    ),
                ))
            },
        )
    }

    pub fn all_nodes_have_at_most_one_parent_per_subgraph(&self) -> Result<Vec<IntegrityViolation>> {
        self.collect(
            "SELECT h.content_stream_id, h.dimension_space_point_hash, n.node_aggregate_id, COUNT(*) \
             FROM cr_hierarchy_relation h \
             JOIN cr_node n ON n.relation_anchor_point = h.child_node_anchor \
             GROUP BY h.content_stream_id, h.dimension_space_point_hash, n.node_aggregate_id \
             HAVING COUNT(*) > 1",
            |row| {
                Ok(IntegrityViolation::new(
                    IntegrityViolationKind::NodeHasMultipleParents,
                    format!(
                        "aggregate '{}' has {} incoming edges in content stream '{}' at point {}",
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?
                    ),
                ))
            },
        )
    }

    pub fn node_aggregates_are_unambiguous_per_origin(&self) -> Result<Vec<IntegrityViolation>> {
        self.collect(
            "SELECT h.content_stream_id, n.node_aggregate_id, n.origin_dimension_space_point \
             FROM cr_hierarchy_relation h \
             JOIN cr_node n ON n.relation_anchor_point = h.child_node_anchor \
             GROUP BY h.content_stream_id, n.node_aggregate_id, n.origin_dimension_space_point_hash \
             HAVING COUNT(DISTINCT n.relation_anchor_point) > 1",
            |row| {
                Ok(IntegrityViolation::new(
                    IntegrityViolationKind::AmbiguousNodeAggregate,
                    format!(
                        "aggregate '{}' has more than one node at origin {} in content stream '{}'",
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(0)?
                    ),
                ))
            },
        )
    }

    /// Edges in a cycle are never reached from a root edge, so cycles are
    /// reported here too.
    pub fn all_nodes_are_connected_to_a_root_node(&self) -> Result<Vec<IntegrityViolation>> {
        self.collect(
            "WITH RECURSIVE reachable(content_stream_id, dimension_space_point_hash, anchor) AS (\
                SELECT content_stream_id, dimension_space_point_hash, child_node_anchor \
                FROM cr_hierarchy_relation WHERE parent_node_anchor = 0 \
              UNION \
                SELECT h.content_stream_id, h.dimension_space_point_hash, h.child_node_anchor \
                FROM cr_hierarchy_relation h \
                JOIN reachable r ON h.parent_node_anchor = r.anchor \
                 AND h.content_stream_id = r.content_stream_id \
                 AND h.dimension_space_point_hash = r.dimension_space_point_hash) \
             SELECT h.content_stream_id, h.dimension_space_point_hash, h.child_node_anchor \
             FROM cr_hierarchy_relation h \
             WHERE NOT EXISTS (SELECT 1 FROM reachable r \
                               WHERE r.content_stream_id = h.content_stream_id \
                                 AND r.dimension_space_point_hash = h.dimension_space_point_hash \
                                 AND r.anchor = h.child_node_anchor)",
            |row| {
                Ok(IntegrityViolation::new(
                    IntegrityViolationKind::NodeIsDisconnectedFromRoot,
                    format!(
                        "node {} is not connected to a root node in content stream '{}' at point {}",
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?
                    ),
                ))
            },
        )
    }

    pub fn siblings_are_distinctly_sorted(&self) -> Result<Vec<IntegrityViolation>> {
        self.collect(
            "SELECT content_stream_id, dimension_space_point_hash, parent_node_anchor, position \
             FROM cr_hierarchy_relation \
             GROUP BY content_stream_id, dimension_space_point_hash, parent_node_anchor, position \
             HAVING COUNT(*) > 1",
            |row| {
                Ok(IntegrityViolation::new(
                    IntegrityViolationKind::SiblingsAreAmbiguouslySorted,
                    format!(
                        "children of node {} share position {} in content stream '{}' at point {}",
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?
                    ),
                ))
            },
        )
    }

    pub fn tethered_nodes_are_named(&self) -> Result<Vec<IntegrityViolation>> {
        let mut stmt = self.conn.prepare(
            "SELECT relation_anchor_point, node_aggregate_id FROM cr_node \
             WHERE classification = ?1 AND node_name IS NULL",
        )?;
        let violations = stmt
            .query_map([NodeAggregateClassification::Tethered.as_str()], |row| {
                Ok(IntegrityViolation::new(
                    IntegrityViolationKind::TetheredNodeIsUnnamed,
                    format!(
                        "tethered node {} of aggregate '{}' has no name",
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?
                    ),
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(violations)
    }

    pub fn node_aggregates_are_consistently_typed(&self) -> Result<Vec<IntegrityViolation>> {
        self.collect(
            "SELECT h.content_stream_id, n.node_aggregate_id, GROUP_CONCAT(DISTINCT n.node_type_name) \
             FROM cr_hierarchy_relation h \
             JOIN cr_node n ON n.relation_anchor_point = h.child_node_anchor \
             GROUP BY h.content_stream_id, n.node_aggregate_id \
             HAVING COUNT(DISTINCT n.node_type_name) > 1",
            |row| {
                Ok(IntegrityViolation::new(
                    IntegrityViolationKind::NodeAggregateIsAmbiguouslyTyped,
                    format!(
                        "aggregate '{}' has several node types ({}) in content stream '{}'",
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(0)?
                    ),
                ))
            },
        )
    }

    /// Every reference starts at an existing node row.
    pub fn reference_integrity_is_provided(&self) -> Result<Vec<IntegrityViolation>> {
        self.collect(
            "SELECT r.node_anchor_point, r.name FROM cr_reference_relation r \
             LEFT JOIN cr_node n ON n.relation_anchor_point = r.node_anchor_point \
             WHERE n.relation_anchor_point IS NULL",
            |row| {
                Ok(IntegrityViolation::new(
                    IntegrityViolationKind::ReferenceIntegrityIsCompromised,
                    format!(
                        "reference '{}' starts at missing anchor {}",
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(0)?
                    ),
                ))
            },
        )
    }

    fn collect<F>(&self, sql: &str, map: F) -> Result<Vec<IntegrityViolation>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<IntegrityViolation>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let violations = stmt.query_map([], map)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{CreateNodeAggregateWithNode, CreateRootNodeAggregateWithNode, CreateRootWorkspace};
    use crate::config::RepositoryConfig;
    use crate::dimension::DimensionSpacePoint;
    use crate::node_types::NodeTypeDefinition;
    use crate::repository::ContentRepository;
    use crate::types::{ContentRepositoryId, NodeAggregateId, NodeTypeName, WorkspaceName};

    fn populated() -> ContentRepository {
        let folder = NodeTypeName::new("Acme:Folder").unwrap();
        let config = RepositoryConfig::new(ContentRepositoryId::new("default").unwrap())
            .with_node_type(NodeTypeDefinition::new(folder.clone()));
        let mut repository = ContentRepository::open_in_memory(config).unwrap();

        let live = CreateRootWorkspace::new(WorkspaceName::live());
        let cs = live.new_content_stream_id.clone();
        repository.handle(live.into()).unwrap();
        let root = NodeAggregateId::new("root").unwrap();
        repository
            .handle(
                CreateRootNodeAggregateWithNode {
                    content_stream_id: cs.clone(),
                    node_aggregate_id: root.clone(),
                    node_type_name: NodeTypeName::root(),
                }
                .into(),
            )
            .unwrap();
        for id in ["a", "b"] {
            repository
                .handle(
                    CreateNodeAggregateWithNode::new(
                        cs.clone(),
                        NodeAggregateId::new(id).unwrap(),
                        folder.clone(),
                        DimensionSpacePoint::empty(),
                        root.clone(),
                    )
                    .into(),
                )
                .unwrap();
        }
        repository
    }

    fn kinds(violations: &[IntegrityViolation]) -> Vec<IntegrityViolationKind> {
        violations.iter().map(|v| v.kind).collect()
    }

    #[test]
    fn test_consistent_graph_has_no_violations() {
        let repository = populated();
        assert_eq!(repository.detect_integrity_violations().unwrap(), Vec::new());
    }

    #[test]
    fn test_detects_missing_parent_and_disconnected_edge() {
        let repository = populated();
        let conn = repository.db.connection();
        conn.execute(
            "UPDATE cr_hierarchy_relation SET parent_node_anchor = 9999 \
             WHERE child_node_anchor = (SELECT relation_anchor_point FROM cr_node WHERE node_aggregate_id = 'a')",
            [],
        )
        .unwrap();

        let found = kinds(&ProjectionIntegrityViolationDetector::new(conn).run().unwrap());
        assert!(found.contains(&IntegrityViolationKind::HierarchyIntegrityIsCompromised));
        assert!(found.contains(&IntegrityViolationKind::NodeIsDisconnectedFromRoot));
    }

    #[test]
    fn test_detects_ambiguous_sibling_positions() {
        let repository = populated();
        let conn = repository.db.connection();
        conn.execute("UPDATE cr_hierarchy_relation SET position = 1 WHERE parent_node_anchor != 0", [])
            .unwrap();

        let found = ProjectionIntegrityViolationDetector::new(conn)
            .siblings_are_distinctly_sorted()
            .unwrap();
        assert_eq!(kinds(&found), vec![IntegrityViolationKind::SiblingsAreAmbiguouslySorted]);
    }

    #[test]
    fn test_detects_cycles() {
        let repository = populated();
        let conn = repository.db.connection();
        // a and b become each other's parent.
        conn.execute(
            "UPDATE cr_hierarchy_relation SET parent_node_anchor = \
                (SELECT relation_anchor_point FROM cr_node WHERE node_aggregate_id = 'b') \
             WHERE child_node_anchor = (SELECT relation_anchor_point FROM cr_node WHERE node_aggregate_id = 'a')",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE cr_hierarchy_relation SET parent_node_anchor = \
                (SELECT relation_anchor_point FROM cr_node WHERE node_aggregate_id = 'a') \
             WHERE child_node_anchor = (SELECT relation_anchor_point FROM cr_node WHERE node_aggregate_id = 'b')",
            [],
        )
        .unwrap();

        let found = ProjectionIntegrityViolationDetector::new(conn)
            .all_nodes_are_connected_to_a_root_node()
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_detects_orphaned_nodes() {
        let repository = populated();
        let conn = repository.db.connection();
        conn.execute(
            "DELETE FROM cr_hierarchy_relation WHERE child_node_anchor = \
                (SELECT relation_anchor_point FROM cr_node WHERE node_aggregate_id = 'b')",
            [],
        )
        .unwrap();

        let found = ProjectionIntegrityViolationDetector::new(conn)
            .all_nodes_have_incoming_edges()
            .unwrap();
        assert_eq!(kinds(&found), vec![IntegrityViolationKind::NodeWithoutIncomingEdge]);
    }

    #[test]
    fn test_detects_references_from_missing_rows() {
        let repository = populated();
        let conn = repository.db.connection();
        conn.execute(
            "INSERT INTO cr_reference_relation \
             (node_anchor_point, name, position, destination_node_aggregate_id, properties) \
             VALUES (9999, 'related', 0, 'a', NULL)",
            [],
        )
        .unwrap();

        let found = ProjectionIntegrityViolationDetector::new(conn)
            .reference_integrity_is_provided()
            .unwrap();
        assert_eq!(kinds(&found), vec![IntegrityViolationKind::ReferenceIntegrityIsCompromised]);
    }
}

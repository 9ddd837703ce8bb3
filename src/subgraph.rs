//! # Content Subgraph
//!
//! A subgraph is the tree a reader sees at one `(content stream, dimension
//! space point)`, filtered by [`VisibilityConstraints`]. Every node
//! aggregate shows at most one variant there: the one whose edge covers the
//! point. Fallback was resolved when the edges were written, so a German
//! subgraph shows the English variant of a node with no German one without
//! any lookup at read time.
//!
//! ```text
//!   language: en ◄── de
//!
//!   agg-2 exists only at {language: en}, covering {en, de}
//!
//!   subgraph(cs-1, {language: de}).find_node_by_id(agg-2)
//!       → Node { origin: {language: en}, dimension_space_point: {language: de} }
//! ```
//!
//! ## Caching
//!
//! `find_node_by_id` results are kept in [`SubgraphCaches`], an LRU keyed by
//! `(content stream, point hash, visibility)`. [`CacheFlushHook`] drops the
//! entries of every content stream a catch-up batch touched.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use lru::LruCache;
use rusqlite::{params, Connection, Params};
use serde_json::Value;

use crate::catchup::{CatchUpHook, ProjectionUpdated};
use crate::dimension::DimensionSpacePoint;
use crate::error::Result;
use crate::projection::content_graph::hierarchy::{RawNode, NODE_COLUMNS, NODE_COLUMN_COUNT};
use crate::projection::content_graph::referencing;
use crate::types::{
    ContentStreamId, NodeAggregateClassification, NodeAggregateId, NodeName, NodeRelationAnchorPoint, NodeTypeName,
    PropertyValues, ReferenceName, SubtreeTag, SubtreeTags,
};

// =============================================================================
// Node
// =============================================================================

/// One node as seen in a subgraph.
#[derive(Debug, Clone)]
pub struct Node {
    pub node_aggregate_id: NodeAggregateId,
    pub node_type_name: NodeTypeName,
    pub classification: NodeAggregateClassification,
    pub node_name: Option<NodeName>,
    /// Where the variant was created
    pub origin_dimension_space_point: DimensionSpacePoint,
    /// The subgraph's point
    pub dimension_space_point: DimensionSpacePoint,
    pub properties: PropertyValues,
    pub subtree_tags: SubtreeTags,
    anchor: NodeRelationAnchorPoint,
    parent_anchor: NodeRelationAnchorPoint,
    position: i64,
}

impl Node {
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Returns true if the node carries the tag, explicitly or inherited.
    pub fn is_tagged(&self, tag: &SubtreeTag) -> bool {
        self.subtree_tags.contains(tag)
    }

    pub fn is_root(&self) -> bool {
        self.classification == NodeAggregateClassification::Root
    }
}

/// One end of a reference, seen from the other end.
///
/// From [`ContentSubgraph::find_references`] `node` is the target; from
/// [`ContentSubgraph::find_back_references`] it is the source.
#[derive(Debug, Clone)]
pub struct Reference {
    pub node: Node,
    pub name: ReferenceName,
    pub properties: Option<PropertyValues>,
}

// =============================================================================
// Visibility
// =============================================================================

/// Which tagged subtrees a subgraph hides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VisibilityConstraints {
    excluded_tags: BTreeSet<SubtreeTag>,
}

impl VisibilityConstraints {
    /// Hides disabled nodes, as a website visitor would see the tree.
    pub fn frontend() -> Self {
        Self::default().excluding(SubtreeTag::disabled())
    }

    /// Shows everything.
    pub fn without_restrictions() -> Self {
        Self::default()
    }

    /// Additionally hides subtrees tagged `tag`.
    pub fn excluding(mut self, tag: SubtreeTag) -> Self {
        self.excluded_tags.insert(tag);
        self
    }

    pub fn is_visible(&self, tags: &SubtreeTags) -> bool {
        !self.excluded_tags.iter().any(|tag| tags.contains(tag))
    }

    fn cache_key(&self) -> String {
        self.excluded_tags
            .iter()
            .map(SubtreeTag::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

// =============================================================================
// Caches
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubgraphKey {
    content_stream_id: ContentStreamId,
    dimension_space_point_hash: String,
    visibility: String,
}

type NodeCache = HashMap<NodeAggregateId, Option<Node>>;

/// Shared LRU of per-subgraph node lookups.
///
/// # Rust Pattern: `Arc<Mutex<_>>`
///
/// The repository and its [`CacheFlushHook`] hold clones of the same
/// cache. Both live on the repository thread, so the mutex is never
/// contended; it is there to make the type `Send`.
#[derive(Debug, Clone)]
pub struct SubgraphCaches {
    inner: Arc<Mutex<Option<LruCache<SubgraphKey, NodeCache>>>>,
}

impl SubgraphCaches {
    /// Creates caches for up to `capacity` subgraphs; `0` disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(NonZeroUsize::new(capacity).map(LruCache::new))),
        }
    }

    fn get(&self, key: &SubgraphKey, id: &NodeAggregateId) -> Option<Option<Node>> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_mut()?.get(key)?.get(id).cloned()
    }

    fn put(&self, key: SubgraphKey, id: NodeAggregateId, node: Option<Node>) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cache) = guard.as_mut() {
            cache.get_or_insert_mut(key, HashMap::new).insert(id, node);
        }
    }

    /// Drops all subgraphs of one content stream.
    pub fn flush_content_stream(&self, content_stream_id: &ContentStreamId) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(cache) = guard.as_mut() else {
            return;
        };
        let stale: Vec<SubgraphKey> = cache
            .iter()
            .filter(|(key, _)| &key.content_stream_id == content_stream_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            cache.pop(&key);
        }
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cache) = guard.as_mut() {
            cache.clear();
        }
    }

    /// Number of cached subgraphs.
    pub fn len(&self) -> usize {
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Flushes subgraph caches after every committed catch-up batch.
#[derive(Debug, Clone)]
pub struct CacheFlushHook {
    caches: SubgraphCaches,
}

impl CacheFlushHook {
    pub fn new(caches: SubgraphCaches) -> Self {
        Self { caches }
    }
}

impl CatchUpHook for CacheFlushHook {
    fn on_batch_committed(&self, update: &ProjectionUpdated) {
        for content_stream_id in &update.content_stream_ids {
            self.caches.flush_content_stream(content_stream_id);
        }
    }
}

// =============================================================================
// Subgraph
// =============================================================================

/// Read-only view of one `(content stream, point, visibility)`.
#[derive(Debug, Clone)]
pub struct ContentSubgraph<'a> {
    conn: &'a Connection,
    caches: Option<&'a SubgraphCaches>,
    content_stream_id: ContentStreamId,
    dimension_space_point: DimensionSpacePoint,
    visibility: VisibilityConstraints,
}

/// `?1` is the stream, `?2` the point hash.
const SUBGRAPH_SELECT: &str = "FROM cr_node n \
     JOIN cr_hierarchy_relation h ON h.child_node_anchor = n.relation_anchor_point \
     WHERE h.content_stream_id = ?1 AND h.dimension_space_point_hash = ?2";

impl<'a> ContentSubgraph<'a> {
    pub fn new(
        conn: &'a Connection,
        content_stream_id: ContentStreamId,
        dimension_space_point: DimensionSpacePoint,
        visibility: VisibilityConstraints,
    ) -> Self {
        Self {
            conn,
            caches: None,
            content_stream_id,
            dimension_space_point,
            visibility,
        }
    }

    /// Uses the given caches for node lookups.
    pub fn with_caches(mut self, caches: &'a SubgraphCaches) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn content_stream_id(&self) -> &ContentStreamId {
        &self.content_stream_id
    }

    pub fn dimension_space_point(&self) -> &DimensionSpacePoint {
        &self.dimension_space_point
    }

    pub fn visibility_constraints(&self) -> &VisibilityConstraints {
        &self.visibility
    }

    fn cache_key(&self) -> SubgraphKey {
        SubgraphKey {
            content_stream_id: self.content_stream_id.clone(),
            dimension_space_point_hash: self.dimension_space_point.hash().to_string(),
            visibility: self.visibility.cache_key(),
        }
    }

    /// The visible node of an aggregate, if any.
    pub fn find_node_by_id(&self, node_aggregate_id: &NodeAggregateId) -> Result<Option<Node>> {
        if let Some(cached) = self
            .caches
            .and_then(|caches| caches.get(&self.cache_key(), node_aggregate_id))
        {
            return Ok(cached);
        }
        let node = self
            .query("AND n.node_aggregate_id = ?3", params![self.stream(), self.hash(), node_aggregate_id.as_str()])?
            .into_iter()
            .next();
        if let Some(caches) = self.caches {
            caches.put(self.cache_key(), node_aggregate_id.clone(), node.clone());
        }
        Ok(node)
    }

    /// Visible children, in order. Empty if the parent is not visible.
    pub fn find_child_nodes(&self, parent: &NodeAggregateId) -> Result<Vec<Node>> {
        let Some(parent) = self.find_node_by_id(parent)? else {
            return Ok(Vec::new());
        };
        self.children_of(parent.anchor)
    }

    pub fn count_child_nodes(&self, parent: &NodeAggregateId) -> Result<usize> {
        Ok(self.find_child_nodes(parent)?.len())
    }

    pub fn find_parent_node(&self, child: &NodeAggregateId) -> Result<Option<Node>> {
        let Some(child) = self.find_node_by_id(child)? else {
            return Ok(None);
        };
        self.node_at(child.parent_anchor)
    }

    /// Ancestors from the parent up to the root node.
    pub fn find_ancestor_nodes(&self, node_aggregate_id: &NodeAggregateId) -> Result<Vec<Node>> {
        let mut ancestors = Vec::new();
        let Some(mut current) = self.find_node_by_id(node_aggregate_id)? else {
            return Ok(ancestors);
        };
        while let Some(parent) = self.node_at(current.parent_anchor)? {
            ancestors.push(parent.clone());
            current = parent;
        }
        Ok(ancestors)
    }

    /// Siblings before the node, closest first.
    pub fn find_preceding_siblings(&self, node_aggregate_id: &NodeAggregateId) -> Result<Vec<Node>> {
        let Some(node) = self.find_node_by_id(node_aggregate_id)? else {
            return Ok(Vec::new());
        };
        self.query(
            "AND h.parent_node_anchor = ?3 AND h.position < ?4 ORDER BY h.position DESC",
            params![self.stream(), self.hash(), node.parent_anchor.as_raw(), node.position],
        )
    }

    /// Siblings after the node, closest first.
    pub fn find_succeeding_siblings(&self, node_aggregate_id: &NodeAggregateId) -> Result<Vec<Node>> {
        let Some(node) = self.find_node_by_id(node_aggregate_id)? else {
            return Ok(Vec::new());
        };
        self.query(
            "AND h.parent_node_anchor = ?3 AND h.position > ?4 ORDER BY h.position",
            params![self.stream(), self.hash(), node.parent_anchor.as_raw(), node.position],
        )
    }

    /// All visible descendants, depth first, children in order.
    pub fn find_descendant_nodes(&self, node_aggregate_id: &NodeAggregateId) -> Result<Vec<Node>> {
        let Some(start) = self.find_node_by_id(node_aggregate_id)? else {
            return Ok(Vec::new());
        };
        let mut descendants = Vec::new();
        let mut stack: Vec<Node> = self.children_of(start.anchor)?.into_iter().rev().collect();
        while let Some(node) = stack.pop() {
            stack.extend(self.children_of(node.anchor)?.into_iter().rev());
            descendants.push(node);
        }
        Ok(descendants)
    }

    /// Follows child node names from `start`.
    pub fn find_node_by_path(&self, start: &NodeAggregateId, path: &[NodeName]) -> Result<Option<Node>> {
        let Some(mut current) = self.find_node_by_id(start)? else {
            return Ok(None);
        };
        for name in path {
            let next = self
                .children_of(current.anchor)?
                .into_iter()
                .find(|child| child.node_name.as_ref() == Some(name));
            match next {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    pub fn find_root_node_by_type(&self, node_type_name: &NodeTypeName) -> Result<Option<Node>> {
        Ok(self
            .query(
                "AND h.parent_node_anchor = 0 AND n.node_type_name = ?3",
                params![self.stream(), self.hash(), node_type_name.as_str()],
            )?
            .into_iter()
            .next())
    }

    /// References going out of a node, by name then position.
    ///
    /// Targets invisible in this subgraph are left out.
    pub fn find_references(&self, source: &NodeAggregateId, name: Option<&ReferenceName>) -> Result<Vec<Reference>> {
        let Some(source) = self.find_node_by_id(source)? else {
            return Ok(Vec::new());
        };
        let mut references = Vec::new();
        for record in referencing::find_references_from(self.conn, source.anchor, name)? {
            if let Some(node) = self.find_node_by_id(&record.destination)? {
                references.push(Reference {
                    node,
                    name: record.name,
                    properties: record.properties,
                });
            }
        }
        Ok(references)
    }

    /// References pointing at a node, from every visible source.
    pub fn find_back_references(
        &self,
        target: &NodeAggregateId,
        name: Option<&ReferenceName>,
    ) -> Result<Vec<Reference>> {
        if self.find_node_by_id(target)?.is_none() {
            return Ok(Vec::new());
        }
        let sources = self.query(
            "AND n.relation_anchor_point IN (SELECT node_anchor_point FROM cr_reference_relation \
             WHERE destination_node_aggregate_id = ?3 AND (?4 IS NULL OR name = ?4)) \
             ORDER BY n.node_aggregate_id",
            params![self.stream(), self.hash(), target.as_str(), name.map(ReferenceName::as_str)],
        )?;
        let mut references = Vec::new();
        for source in sources {
            for record in referencing::find_references_between(self.conn, source.anchor, target, name)? {
                references.push(Reference {
                    node: source.clone(),
                    name: record.name,
                    properties: record.properties,
                });
            }
        }
        Ok(references)
    }

    fn children_of(&self, parent: NodeRelationAnchorPoint) -> Result<Vec<Node>> {
        self.query(
            "AND h.parent_node_anchor = ?3 ORDER BY h.position",
            params![self.stream(), self.hash(), parent.as_raw()],
        )
    }

    fn node_at(&self, anchor: NodeRelationAnchorPoint) -> Result<Option<Node>> {
        if anchor.is_root() {
            return Ok(None);
        }
        Ok(self
            .query(
                "AND n.relation_anchor_point = ?3",
                params![self.stream(), self.hash(), anchor.as_raw()],
            )?
            .into_iter()
            .next())
    }

    fn stream(&self) -> &str {
        self.content_stream_id.as_str()
    }

    fn hash(&self) -> &str {
        self.dimension_space_point.hash()
    }

    /// Runs a node query and drops invisible nodes.
    fn query(&self, condition: &str, params: impl Params) -> Result<Vec<Node>> {
        let sql = format!(
            "SELECT {NODE_COLUMNS}, h.subtree_tags, h.parent_node_anchor, h.position {SUBGRAPH_SELECT} {condition}"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    RawNode::from_row(row, 0)?,
                    row.get::<_, String>(NODE_COLUMN_COUNT)?,
                    row.get::<_, i64>(NODE_COLUMN_COUNT + 1)?,
                    row.get::<_, i64>(NODE_COLUMN_COUNT + 2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut nodes = Vec::with_capacity(rows.len());
        for (raw, tags, parent_anchor, position) in rows {
            let subtree_tags = SubtreeTags::from_json(&tags)?;
            if !self.visibility.is_visible(&subtree_tags) {
                continue;
            }
            let record = raw.into_record()?;
            nodes.push(Node {
                node_aggregate_id: record.node_aggregate_id,
                node_type_name: record.node_type_name,
                classification: record.classification,
                node_name: record.node_name,
                origin_dimension_space_point: record.origin,
                dimension_space_point: self.dimension_space_point.clone(),
                properties: record.properties,
                subtree_tags,
                anchor: record.anchor,
                parent_anchor: NodeRelationAnchorPoint::from_raw(parent_anchor),
                position,
            });
        }
        Ok(nodes)
    }
}

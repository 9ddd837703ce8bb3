//! # Repository Configuration
//!
//! One JSON document per content repository:
//!
//! ```json
//! {
//!   "contentRepositoryId": "default",
//!   "dimensions": [
//!     { "id": "language", "default": "en",
//!       "values": [ { "value": "en" }, { "value": "de", "generalizations": ["en"] } ] }
//!   ],
//!   "nodeTypes": [ { "name": "Acme:Folder", "properties": { "title": { "type": "string" } } } ],
//!   "subgraphCacheCapacity": 64
//! }
//! ```
//!
//! Parsing only checks the shape. The dimension DAG and the node type
//! references are validated when the repository is opened, see
//! [`RepositoryConfig::validate`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dimension::{ContentDimensionConfig, InterDimensionalVariationGraph};
use crate::error::{Error, Result};
use crate::node_types::{NodeTypeDefinition, NodeTypeManager};
use crate::types::ContentRepositoryId;

/// Default number of subgraphs kept in the LRU.
pub const DEFAULT_SUBGRAPH_CACHE_CAPACITY: usize = 64;

fn default_subgraph_cache_capacity() -> usize {
    DEFAULT_SUBGRAPH_CACHE_CAPACITY
}

/// Configuration of one content repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    pub content_repository_id: ContentRepositoryId,
    /// Dimensions in configured order; empty means a dimensionless
    /// repository with the single empty point
    #[serde(default)]
    pub dimensions: Vec<ContentDimensionConfig>,
    #[serde(default)]
    pub node_types: Vec<NodeTypeDefinition>,
    /// `0` disables subgraph caching
    #[serde(default = "default_subgraph_cache_capacity")]
    pub subgraph_cache_capacity: usize,
}

impl RepositoryConfig {
    /// A configuration without dimensions or node types.
    pub fn new(content_repository_id: ContentRepositoryId) -> Self {
        Self {
            content_repository_id,
            dimensions: Vec::new(),
            node_types: Vec::new(),
            subgraph_cache_capacity: DEFAULT_SUBGRAPH_CACHE_CAPACITY,
        }
    }

    pub fn with_dimension(mut self, dimension: ContentDimensionConfig) -> Self {
        self.dimensions.push(dimension);
        self
    }

    pub fn with_node_type(mut self, node_type: NodeTypeDefinition) -> Self {
        self.node_types.push(node_type);
        self
    }

    pub fn with_subgraph_cache_capacity(mut self, capacity: usize) -> Self {
        self.subgraph_cache_capacity = capacity;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("malformed repository configuration: {e}")))
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read '{}': {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Builds the variation graph and node type registry.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidDimensionConfiguration`] for cycles, undeclared
    ///   values or defaults
    /// - [`Error::Config`] for duplicate node types or tethered children of
    ///   unknown type
    pub fn validate(&self) -> Result<(InterDimensionalVariationGraph, NodeTypeManager)> {
        let variation_graph = InterDimensionalVariationGraph::new(&self.dimensions)?;
        let node_types = NodeTypeManager::new(self.node_types.clone())?;
        Ok((variation_graph, node_types))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_defaults() {
        let config = RepositoryConfig::from_json_str(
            r#"{
                "contentRepositoryId": "default",
                "dimensions": [
                    { "id": "language", "default": "en",
                      "values": [ { "value": "en" }, { "value": "de", "generalizations": ["en"] } ] }
                ],
                "nodeTypes": [ { "name": "Acme:Folder" } ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.content_repository_id.as_str(), "default");
        assert_eq!(config.subgraph_cache_capacity, DEFAULT_SUBGRAPH_CACHE_CAPACITY);
        let (graph, node_types) = config.validate().unwrap();
        assert_eq!(graph.allowed_subspace().len(), 2);
        assert!(node_types.has(&crate::types::NodeTypeName::new("Acme:Folder").unwrap()));
    }

    #[test]
    fn test_malformed_json_is_a_config_error() {
        let err = RepositoryConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = RepositoryConfig::from_json_str(r#"{ "contentRepositoryId": "Has Spaces" }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_cyclic_dimension_is_rejected_on_validate() {
        let config = RepositoryConfig::from_json_str(
            r#"{
                "contentRepositoryId": "default",
                "dimensions": [
                    { "id": "language", "default": "en",
                      "values": [ { "value": "en", "generalizations": ["de"] },
                                  { "value": "de", "generalizations": ["en"] } ] }
                ]
            }"#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::InvalidDimensionConfiguration(_))));
    }
}

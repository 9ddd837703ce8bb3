//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use serde_json::{json, Value};
use spitegraph::commands::{CreateNodeAggregateWithNode, CreateRootNodeAggregateWithNode, CreateRootWorkspace, CreateWorkspace};
use spitegraph::dimension::{ContentDimensionConfig, ContentDimensionId};
use spitegraph::node_types::{NodeTypeDefinition, PropertyType, ReferenceDefinition};
use spitegraph::types::{NodeName, PropertyValues};
use spitegraph::{
    ContentRepository, ContentRepositoryId, ContentStreamId, DimensionSpacePoint, NodeAggregateId, NodeTypeName,
    ReferenceName, RepositoryConfig, WorkspaceName,
};
use tempfile::TempDir;

/// Installs a test subscriber once; `RUST_LOG` controls the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A temp directory holding the database file; dropping it cleans up.
pub fn temp_db() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("content-repository.db");
    (dir, path)
}

// =============================================================================
// Ids
// =============================================================================

pub fn id(value: &str) -> NodeAggregateId {
    NodeAggregateId::new(value).unwrap()
}

pub fn name(value: &str) -> NodeName {
    NodeName::new(value).unwrap()
}

pub fn workspace(value: &str) -> WorkspaceName {
    WorkspaceName::new(value).unwrap()
}

pub fn node_type(value: &str) -> NodeTypeName {
    NodeTypeName::new(value).unwrap()
}

/// A point in the `language` dimension.
pub fn lang(value: &str) -> DimensionSpacePoint {
    DimensionSpacePoint::from_pairs([("language", value)])
}

pub fn props(pairs: &[(&str, Value)]) -> PropertyValues {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

// =============================================================================
// Configuration
// =============================================================================

pub const ROOT: &str = "lady-eleonode-rootford";

/// Folders with up to two weighted `related` references, pages with a
/// tethered `main` collection, and their contents.
pub fn node_types() -> Vec<NodeTypeDefinition> {
    vec![
        NodeTypeDefinition::new(node_type("Acme:Folder"))
            .with_property("title", PropertyType::String)
            .with_reference(
                ReferenceName::new("related").unwrap(),
                ReferenceDefinition::new()
                    .with_max_items(2)
                    .with_property("weight", PropertyType::Integer),
            ),
        NodeTypeDefinition::new(node_type("Acme:ContentCollection")),
        NodeTypeDefinition::new(node_type("Acme:Page"))
            .with_default("title", PropertyType::String, json!("Untitled"))
            .with_property("hidden", PropertyType::Boolean)
            .with_child_node(name("main"), node_type("Acme:ContentCollection")),
    ]
}

/// No dimensions: every node lives in the empty point.
pub fn plain_config(repository_id: &str) -> RepositoryConfig {
    node_types().into_iter().fold(
        RepositoryConfig::new(ContentRepositoryId::new(repository_id).unwrap()),
        RepositoryConfig::with_node_type,
    )
}

/// `language`: `en` (default), `de` and `fr` fall back to `en`, `de_ch`
/// falls back to `de`.
pub fn language_config(repository_id: &str) -> RepositoryConfig {
    plain_config(repository_id).with_dimension(ContentDimensionConfig::new(
        ContentDimensionId::new("language").unwrap(),
        "en",
        &[("en", &[]), ("de", &["en"]), ("fr", &["en"]), ("de_ch", &["de"])],
    ))
}

// =============================================================================
// Setup
// =============================================================================

/// A repository with a `live` workspace holding the root node.
pub struct Fixture {
    pub repository: ContentRepository,
    pub live: ContentStreamId,
    pub root: NodeAggregateId,
}

impl Fixture {
    pub fn new(config: RepositoryConfig) -> Self {
        init_tracing();
        let repository = ContentRepository::open_in_memory(config).unwrap();
        Self::with_repository(repository)
    }

    pub fn with_repository(mut repository: ContentRepository) -> Self {
        let live = CreateRootWorkspace::new(WorkspaceName::live());
        let live_cs = live.new_content_stream_id.clone();
        repository.handle(live.into()).unwrap();
        let root = id(ROOT);
        repository
            .handle(
                CreateRootNodeAggregateWithNode {
                    content_stream_id: live_cs.clone(),
                    node_aggregate_id: root.clone(),
                    node_type_name: NodeTypeName::root(),
                }
                .into(),
            )
            .unwrap();
        Self {
            repository,
            live: live_cs,
            root,
        }
    }

    /// Creates a workspace on top of `live` and returns its stream.
    pub fn create_workspace(&mut self, name: &str) -> ContentStreamId {
        let command = CreateWorkspace::new(workspace(name), WorkspaceName::live());
        let content_stream_id = command.new_content_stream_id.clone();
        self.repository.handle(command.into()).unwrap();
        content_stream_id
    }

    /// The current content stream of a workspace.
    pub fn current(&self, name: &WorkspaceName) -> ContentStreamId {
        self.repository
            .workspaces()
            .find_by_name(name)
            .unwrap()
            .unwrap()
            .current_content_stream_id
    }

    /// Creates a folder at `origin` below `parent`.
    pub fn create_folder(
        &mut self,
        content_stream_id: &ContentStreamId,
        node_aggregate_id: &str,
        parent: &NodeAggregateId,
        origin: DimensionSpacePoint,
    ) {
        self.repository
            .handle(
                CreateNodeAggregateWithNode::new(
                    content_stream_id.clone(),
                    id(node_aggregate_id),
                    node_type("Acme:Folder"),
                    origin,
                    parent.clone(),
                )
                .with_node_name(name(node_aggregate_id))
                .into(),
            )
            .unwrap();
    }
}

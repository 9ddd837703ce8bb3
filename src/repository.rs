//! # Content Repository
//!
//! [`ContentRepository`] is the synchronous core: it owns the SQLite
//! database, the event store, the projections and the configuration, and
//! it is the only thing that writes to any of them.
//!
//! ```text
//!   handle(command)                         subgraph(cs, point, visibility)
//!        │                                             ▲
//!        ▼                                             │
//!   validate against projections ──► append ──► catch-up ──► hooks (cache flush)
//! ```
//!
//! Every successful command runs a catch-up before it returns, so the next
//! command (and every query) sees the projected result of the previous one.
//! Every command also catches up before it is validated, which is how a
//! repository sees what other repositories on the same file wrote.
//!
//! ## Thread Model
//!
//! The repository is `Send` but not `Sync`; it owns a `rusqlite::Connection`.
//! To use it from async code, move it onto its own thread with
//! [`crate::ContentRepositoryHandle`].

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::catchup::{save_checkpoint, CatchUp, CatchUpHook, CatchUpResult};
use crate::config::RepositoryConfig;
use crate::content_graph::ContentGraph;
use crate::dimension::{DimensionSpacePoint, InterDimensionalVariationGraph};
use crate::error::{Error, Result};
use crate::event_store::{EventEnvelope, EventStore, StreamName};
use crate::integrity::{IntegrityViolation, ProjectionIntegrityViolationDetector};
use crate::node_types::NodeTypeManager;
use crate::projection::content_stream::ContentStreamFinder;
use crate::projection::workspace::WorkspaceFinder;
use crate::projection::{ContentGraphProjection, ContentStreamProjection, Projection, WorkspaceProjection};
use crate::schema::{in_transaction, Database};
use crate::subgraph::{CacheFlushHook, ContentSubgraph, SubgraphCaches, VisibilityConstraints};
use crate::types::{ContentRepositoryId, ContentStreamId, SequenceNumber};

/// One content repository: event log, projections and configuration.
pub struct ContentRepository {
    id: ContentRepositoryId,
    pub(crate) db: Database,
    pub(crate) event_store: EventStore,
    pub(crate) variation_graph: Arc<InterDimensionalVariationGraph>,
    pub(crate) node_types: Arc<NodeTypeManager>,
    projections: Vec<Box<dyn Projection>>,
    hooks: Vec<Box<dyn CatchUpHook>>,
    caches: SubgraphCaches,
    catch_up: CatchUp,
}

impl std::fmt::Debug for ContentRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentRepository")
            .field("id", &self.id)
            .field("last_sequence_number", &self.event_store.last_sequence_number())
            .field("projections", &self.projections.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl ContentRepository {
    /// Opens (or creates) a file-backed repository and catches up its
    /// projections.
    ///
    /// # Errors
    ///
    /// Configuration errors, schema mismatches, and any projection error
    /// raised while catching up.
    pub fn open(path: impl AsRef<Path>, config: RepositoryConfig) -> Result<Self> {
        Self::with_database(Database::open(path)?, config)
    }

    /// Creates an in-memory repository, for tests.
    pub fn open_in_memory(config: RepositoryConfig) -> Result<Self> {
        Self::with_database(Database::open_in_memory()?, config)
    }

    fn with_database(db: Database, config: RepositoryConfig) -> Result<Self> {
        let (variation_graph, node_types) = config.validate()?;
        let event_store = EventStore::load(db.connection())?;

        let projections: Vec<Box<dyn Projection>> = vec![
            Box::new(ContentStreamProjection::new()),
            Box::new(WorkspaceProjection::new()),
            Box::new(ContentGraphProjection::new()),
        ];
        for projection in &projections {
            projection.setup(db.connection())?;
        }

        let caches = SubgraphCaches::new(config.subgraph_cache_capacity);
        let mut repository = Self {
            id: config.content_repository_id,
            db,
            event_store,
            variation_graph: Arc::new(variation_graph),
            node_types: Arc::new(node_types),
            projections,
            hooks: vec![Box::new(CacheFlushHook::new(caches.clone()))],
            caches,
            catch_up: CatchUp::default(),
        };

        let result = repository.catch_up()?;
        info!(
            content_repository_id = %repository.id,
            replayed = result.applied,
            last_sequence_number = %result.last_sequence_number,
            "content repository opened"
        );
        Ok(repository)
    }

    // =========================================================================
    // Projections
    // =========================================================================

    /// Applies every event the projections have not seen yet.
    ///
    /// Other repositories may write to the same database file. Their events
    /// are picked up here, and because they may also have projected them
    /// already, the subgraph caches are dropped whenever the log grew behind
    /// this repository's back.
    pub fn catch_up(&mut self) -> Result<CatchUpResult> {
        if self.event_store.refresh(self.db.connection())? {
            self.caches.clear();
        }
        self.catch_up
            .run(self.db.connection(), &self.event_store, &self.projections, &self.hooks)
    }

    /// Drops a projection's state and rebuilds it from the first event.
    ///
    /// # Errors
    ///
    /// [`Error::Schema`] for an unknown projection name.
    pub fn replay_projection(&mut self, name: &str) -> Result<CatchUpResult> {
        let projection = self
            .projections
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| Error::Schema(format!("unknown projection '{name}'")))?;

        in_transaction(self.db.connection(), |conn| {
            projection.reset(conn)?;
            save_checkpoint(conn, name, SequenceNumber::NONE)
        })?;
        self.caches.clear();
        warn!(projection = name, "projection reset, replaying from the first event");
        self.catch_up()
    }

    /// Registers an observer of committed catch-up batches.
    pub fn add_hook(&mut self, hook: Box<dyn CatchUpHook>) {
        self.hooks.push(hook);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Node aggregate queries for one content stream.
    pub fn content_graph(&self, content_stream_id: ContentStreamId) -> ContentGraph<'_> {
        ContentGraph::new(self.db.connection(), content_stream_id)
    }

    /// The subgraph at one point of one content stream.
    pub fn subgraph(
        &self,
        content_stream_id: ContentStreamId,
        dimension_space_point: DimensionSpacePoint,
        visibility: VisibilityConstraints,
    ) -> ContentSubgraph<'_> {
        ContentSubgraph::new(self.db.connection(), content_stream_id, dimension_space_point, visibility)
            .with_caches(&self.caches)
    }

    pub fn content_streams(&self) -> ContentStreamFinder<'_> {
        ContentStreamFinder::new(self.db.connection())
    }

    pub fn workspaces(&self) -> WorkspaceFinder<'_> {
        WorkspaceFinder::new(self.db.connection())
    }

    /// Reads the events of one stream from the log.
    pub fn read_stream(&self, stream_name: &StreamName) -> Result<Vec<EventEnvelope>> {
        self.event_store.read_stream(self.db.connection(), stream_name)
    }

    /// Checks the content graph tables for structural damage.
    pub fn detect_integrity_violations(&self) -> Result<Vec<IntegrityViolation>> {
        ProjectionIntegrityViolationDetector::new(self.db.connection()).run()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Removes every content stream no workspace needs anymore.
    ///
    /// Returns the removed ids.
    pub fn prune(&mut self) -> Result<Vec<ContentStreamId>> {
        let unused: Vec<ContentStreamId> = self
            .content_streams()
            .find_unused_content_streams()?
            .into_iter()
            .map(|record| record.content_stream_id)
            .collect();
        for content_stream_id in &unused {
            self.remove_content_stream(content_stream_id)?;
        }
        if !unused.is_empty() {
            info!(removed = unused.len(), "pruned unused content streams");
        }
        Ok(unused)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> &ContentRepositoryId {
        &self.id
    }

    pub fn variation_graph(&self) -> &Arc<InterDimensionalVariationGraph> {
        &self.variation_graph
    }

    pub fn node_types(&self) -> &Arc<NodeTypeManager> {
        &self.node_types
    }

    pub fn caches(&self) -> &SubgraphCaches {
        &self.caches
    }

    /// Sequence number of the last event in the log.
    pub fn last_sequence_number(&self) -> SequenceNumber {
        self.event_store.last_sequence_number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catchup::load_checkpoint;
    use crate::commands::CreateRootWorkspace;
    use crate::projection::content_graph::CONTENT_GRAPH_PROJECTION;
    use crate::types::WorkspaceName;

    fn config() -> RepositoryConfig {
        RepositoryConfig::new(ContentRepositoryId::new("default").unwrap())
    }

    #[test]
    fn test_open_in_memory_sets_up_projections() {
        let repository = ContentRepository::open_in_memory(config()).unwrap();
        assert!(repository.workspaces().find_all().unwrap().is_empty());
        assert!(repository.content_streams().find_all().unwrap().is_empty());
        assert_eq!(repository.last_sequence_number(), SequenceNumber::NONE);
    }

    #[test]
    fn test_replay_projection_rebuilds_state() {
        let mut repository = ContentRepository::open_in_memory(config()).unwrap();
        repository
            .handle(CreateRootWorkspace::new(WorkspaceName::live()).into())
            .unwrap();
        let last = repository.last_sequence_number();

        let result = repository.replay_projection(CONTENT_GRAPH_PROJECTION).unwrap();
        assert_eq!(result.last_sequence_number, last);
        assert_eq!(
            load_checkpoint(repository.db.connection(), CONTENT_GRAPH_PROJECTION).unwrap(),
            last
        );
        assert!(repository.replay_projection("nope").is_err());
    }
}

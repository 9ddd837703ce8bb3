//! # Async Handle
//!
//! [`ContentRepository`] owns a `rusqlite::Connection`, which is `!Sync`.
//! To share one repository between async tasks it moves onto a dedicated OS
//! thread, and tasks talk to it over channels:
//!
//! ```text
//!   task1 ─┐                                   ┌──────────────────────────┐
//!   task2 ─┼── tokio::sync::mpsc (Request) ───►│ spitegraph-<repository>  │
//!   task3 ─┘                                   │   ContentRepository      │
//!      ▲                                       │   (owns the Connection)  │
//!      └──── tokio::sync::oneshot (reply) ─────┴──────────────────────────┘
//! ```
//!
//! Requests are served one at a time, in arrival order, so commands never
//! interleave. Queries run as closures on the repository thread; keep them
//! short.
//!
//! ## Projection Updates
//!
//! [`ContentRepositoryHandle::subscribe`] returns a [`Subscription`] fed by a
//! `tokio::sync::broadcast` channel. A catch-up hook on the repository thread
//! sends one [`ProjectionUpdated`] per committed batch. Slow subscribers
//! see [`Error::SubscriptionLagged`] and continue with the newest updates.
//!
//! ## Rust Concepts
//!
//! - **tokio::sync::mpsc**: async send from tasks, `blocking_recv` on the
//!   repository thread
//! - **tokio::sync::oneshot**: single-use reply channel per request
//! - **`Box<dyn FnOnce>`**: ships a query to the thread that owns the data

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::debug;

use crate::catchup::{CatchUpHook, ProjectionUpdated};
use crate::command_handler::CommandResult;
use crate::commands::Command;
use crate::config::RepositoryConfig;
use crate::error::{Error, Result};
use crate::repository::ContentRepository;
use crate::types::ContentRepositoryId;

// =============================================================================
// Configuration
// =============================================================================

/// Size of the request channel.
const REQUEST_CHANNEL_SIZE: usize = 1024;

/// Projection updates buffered per subscriber before it lags.
const UPDATE_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Requests
// =============================================================================

type Job = Box<dyn FnOnce(&mut ContentRepository) + Send>;

enum Request {
    Handle {
        command: Command,
        response: oneshot::Sender<Result<CommandResult>>,
    },
    Run(Job),
    Subscribe {
        response: oneshot::Sender<broadcast::Receiver<ProjectionUpdated>>,
    },
    Shutdown,
}

/// Forwards committed batches to the broadcast channel.
struct BroadcastHook {
    sender: broadcast::Sender<ProjectionUpdated>,
}

impl CatchUpHook for BroadcastHook {
    fn on_batch_committed(&self, update: &ProjectionUpdated) {
        // No receivers is fine.
        let _ = self.sender.send(update.clone());
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Async handle to a content repository running on its own thread.
///
/// `Clone`, `Send` and `Sync`; all clones talk to the same thread.
///
/// # Example
///
/// ```rust,ignore
/// let handle = ContentRepositoryHandle::open("content.db", config).await?;
/// handle.handle(CreateRootWorkspace::new(WorkspaceName::live()).into()).await?;
/// let live = handle
///     .query(|repository| repository.workspaces().find_by_name(&WorkspaceName::live()))
///     .await?;
/// handle.shutdown().await;
/// ```
#[derive(Debug, Clone)]
pub struct ContentRepositoryHandle {
    id: ContentRepositoryId,
    request_tx: mpsc::Sender<Request>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Handle { command, .. } => write!(f, "Handle({})", command.type_name()),
            Request::Run(_) => f.write_str("Run"),
            Request::Subscribe { .. } => f.write_str("Subscribe"),
            Request::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl ContentRepositoryHandle {
    /// Opens a file-backed repository and moves it onto its own thread.
    ///
    /// Opening catches up the projections, which may take a while for a
    /// long log; it runs on the blocking pool.
    pub async fn open(path: impl AsRef<Path>, config: RepositoryConfig) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let repository = tokio::task::spawn_blocking(move || ContentRepository::open(path, config))
            .await
            .map_err(|e| Error::ActorGone(format!("opening the repository panicked: {e}")))??;
        Self::spawn(repository)
    }

    /// Moves an opened repository onto its own thread.
    pub fn spawn(mut repository: ContentRepository) -> Result<Self> {
        let id = repository.id().clone();
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        repository.add_hook(Box::new(BroadcastHook {
            sender: updates.clone(),
        }));

        let thread = thread::Builder::new()
            .name(format!("spitegraph-{id}"))
            .spawn(move || run_repository(repository, updates, request_rx))
            .map_err(|e| Error::ActorGone(format!("failed to spawn repository thread: {e}")))?;

        Ok(Self {
            id,
            request_tx,
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }

    pub fn id(&self) -> &ContentRepositoryId {
        &self.id
    }

    /// Handles a command on the repository thread.
    pub async fn handle(&self, command: Command) -> Result<CommandResult> {
        let (response, response_rx) = oneshot::channel();
        self.send(Request::Handle { command, response }).await?;
        response_rx
            .await
            .map_err(|_| Error::ActorGone("repository dropped the response channel".to_string()))?
    }

    /// Runs a read-only closure against the repository.
    pub async fn query<F, T>(&self, query: F) -> Result<T>
    where
        F: FnOnce(&ContentRepository) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.with_repository(move |repository| query(repository)).await
    }

    /// Runs a closure with exclusive access to the repository, for
    /// maintenance such as [`ContentRepository::replay_projection`] or
    /// [`ContentRepository::prune`].
    pub async fn with_repository<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut ContentRepository) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (response, response_rx) = oneshot::channel();
        self.send(Request::Run(Box::new(move |repository| {
            let _ = response.send(job(repository));
        })))
        .await?;
        response_rx
            .await
            .map_err(|_| Error::ActorGone("repository dropped the response channel".to_string()))?
    }

    /// Subscribes to projection updates committed from now on.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let (response, response_rx) = oneshot::channel();
        self.send(Request::Subscribe { response }).await?;
        let receiver = response_rx
            .await
            .map_err(|_| Error::ActorGone("repository dropped the response channel".to_string()))?;
        Ok(Subscription { receiver })
    }

    /// Stops the repository thread after the requests queued before this
    /// one, and waits for it. Other clones fail with [`Error::ActorGone`]
    /// afterwards.
    pub async fn shutdown(self) {
        let _ = self.request_tx.send(Request::Shutdown).await;
        if let Some(thread) = self.thread.lock().await.take() {
            let _ = thread.join();
        }
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::ActorGone(format!("repository '{}' has shut down", self.id)))
    }
}

/// The repository thread's main loop.
fn run_repository(
    mut repository: ContentRepository,
    updates: broadcast::Sender<ProjectionUpdated>,
    mut request_rx: mpsc::Receiver<Request>,
) {
    while let Some(request) = request_rx.blocking_recv() {
        match request {
            Request::Handle { command, response } => {
                let _ = response.send(repository.handle(command));
            }
            Request::Run(job) => job(&mut repository),
            Request::Subscribe { response } => {
                let _ = response.send(updates.subscribe());
            }
            Request::Shutdown => break,
        }
    }
    debug!(content_repository_id = %repository.id(), "repository thread stopped");
}

// =============================================================================
// Subscription
// =============================================================================

/// Receives [`ProjectionUpdated`] notifications.
///
/// Ends (returns `None`) once the repository thread has stopped.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<ProjectionUpdated>,
}

impl Subscription {
    /// Waits for the next update.
    pub async fn next(&mut self) -> Option<Result<ProjectionUpdated>> {
        match self.receiver.recv().await {
            Ok(update) => Some(Ok(update)),
            Err(RecvError::Lagged(missed)) => Some(Err(Error::SubscriptionLagged(missed))),
            Err(RecvError::Closed) => None,
        }
    }

    /// Turns the subscription into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<ProjectionUpdated>> {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|item| (item, subscription))
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

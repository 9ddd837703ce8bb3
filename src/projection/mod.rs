//! # Projections
//!
//! A projection folds events, in global order, into tables of the shared
//! database. Three projections exist:
//!
//! | Projection        | Tables                                                 |
//! |-------------------|--------------------------------------------------------|
//! | `content_graph`   | `cr_node`, `cr_hierarchy_relation`, `cr_dimension_space_point` |
//! | `content_stream`  | `cr_content_stream`                                    |
//! | `workspace`       | `cr_workspace`                                         |
//!
//! The catch-up engine in [`crate::catchup`] drives them; a projection never
//! reads the event log itself and never opens or commits a transaction.
//!
//! ## Rust Pattern: Trait Objects
//!
//! The catch-up engine holds `Vec<Box<dyn Projection>>`. The trait is
//! object safe (no generics, no `Self` returns), and `Send` so the whole
//! repository can move onto its dedicated thread.

use rusqlite::Connection;

use crate::event_store::EventEnvelope;
use crate::events::EventKind;
use crate::Result;

pub mod content_graph;
pub mod content_stream;
pub mod workspace;

pub use content_graph::ContentGraphProjection;
pub use content_stream::ContentStreamProjection;
pub use workspace::WorkspaceProjection;

/// A read model built from events.
pub trait Projection: Send {
    /// Unique name, also the checkpoint key.
    fn name(&self) -> &str;

    /// Creates the projection's tables if they don't exist.
    fn setup(&self, conn: &Connection) -> Result<()>;

    /// Deletes all projected state; the caller resets the checkpoint.
    fn reset(&self, conn: &Connection) -> Result<()>;

    /// Returns true if `apply` does anything for this event type.
    fn can_handle(&self, event_type: &str) -> bool;

    /// Applies one event inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// [`crate::Error::ProjectionConsistencyViolation`] if the event refers to
    /// state the projection doesn't have. The transaction is rolled back and
    /// the checkpoint stays put.
    fn apply(&self, conn: &Connection, event: &EventKind, envelope: &EventEnvelope) -> Result<()>;
}

//! # SpiteGraph - Event-Sourced Content Graph
//!
//! SpiteGraph is a content repository built on SQLite. It provides:
//!
//! - **Event sourcing**: every change is an event in an append-only log with
//!   per-stream optimistic concurrency
//! - **Content streams**: cheap copy-on-write forks of the whole graph
//! - **Workspaces**: named content streams on top of a base, with publish,
//!   rebase and discard
//! - **Dimensions**: node variants per dimension space point (language,
//!   market, ...) with fallback along generalizations
//! - **Subgraph queries**: one consistent tree per stream, point and
//!   visibility
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │             ContentRepositoryHandle (async, Clone)              │
//! │                 (handle, query, subscribe)                      │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ mpsc / oneshot
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                ContentRepository (own thread)                   │
//! │                                                                 │
//! │  ┌───────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │Command handler│─►│ Event store  │─►│ Catch-up             │  │
//! │  │ + rebase      │  │ (append-only)│  │ content stream,      │  │
//! │  └───────▲───────┘  └──────────────┘  │ workspace, graph     │  │
//! │          │ constraint checks          └──────────┬───────────┘  │
//! │          └──── ContentGraph / ContentSubgraph ◄──┘              │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 SQLite (log, projections, checkpoints)          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Events are the truth**: projections can be dropped and replayed
//!    from the log at any time
//! 2. **Ordered streams**: versions per stream strictly increase, no gaps
//! 3. **Copy-on-write isolation**: a write through one content stream is
//!    never visible through another
//! 4. **Validate, then append**: rejected commands leave no events
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum
//! - [`schema`]: database setup and versioning
//! - [`types`]: identifiers and small value types
//! - [`dimension`]: dimension space points and the variation graph
//! - [`events`], [`commands`]: the event and command enums
//! - [`event_store`]: the append-only log
//! - [`projection`], [`catchup`]: projections and the engine feeding them
//! - [`content_graph`], [`subgraph`]: read side
//! - [`repository`], [`command_handler`], [`rebase`]: the write side
//! - [`api`], [`registry`]: async surface

// =============================================================================
// Module Declarations
// =============================================================================
// Rust pattern: `#[macro_use]` makes the macros of `macros` visible to every
// module declared after it, so it has to come first.

#[macro_use]
mod macros;

/// Error types for SpiteGraph operations.
pub mod error;

/// SQLite database setup and schema versioning.
pub mod schema;

/// Identifiers, sequence numbers and other small value types.
pub mod types;

/// Content dimensions, dimension space points and the variation graph.
pub mod dimension;

/// Node type definitions and property validation.
pub mod node_types;

/// The event enum and its payloads.
pub mod events;

/// The command enum and its payloads.
pub mod commands;

/// The append-only event log with optimistic concurrency.
pub mod event_store;

/// Content stream, workspace and content graph projections.
pub mod projection;

/// Feeds new events to the projections and tracks their checkpoints.
pub mod catchup;

/// Node aggregate queries across all variants of one content stream.
pub mod content_graph;

/// Node queries within one content stream, point and visibility.
pub mod subgraph;

/// Repository configuration.
pub mod config;

/// The synchronous content repository.
pub mod repository;

/// Command validation and event emission.
pub mod command_handler;

/// Publishing, rebasing and discarding workspaces.
pub mod rebase;

/// Consistency checks over the projection tables.
pub mod integrity;

/// Async handle running a repository on its own thread.
///
/// The main entry point is [`ContentRepositoryHandle`](api::ContentRepositoryHandle).
pub mod api;

/// Registry of running repositories.
pub mod registry;

// =============================================================================
// Re-exports
// =============================================================================
// Rust pattern: Re-export commonly used types at the crate root for convenience.
// Users can write `use spitegraph::Error` instead of `use spitegraph::error::Error`.

pub use api::{ContentRepositoryHandle, Subscription};
pub use catchup::{CatchUpHook, CatchUpResult, ProjectionUpdated};
pub use command_handler::CommandResult;
pub use commands::Command;
pub use config::RepositoryConfig;
pub use content_graph::{ContentGraph, NodeAggregate};
pub use dimension::{DimensionSpacePoint, DimensionSpacePointSet, InterDimensionalVariationGraph};
pub use error::{Error, Result};
pub use events::EventKind;
pub use integrity::{IntegrityViolation, ProjectionIntegrityViolationDetector};
pub use rebase::{CommandsThatFailedDuringRebase, WorkspaceRebaseStatistics};
pub use registry::ContentRepositoryRegistry;
pub use repository::ContentRepository;
pub use schema::Database;
pub use subgraph::{ContentSubgraph, Node, Reference, VisibilityConstraints};

// Re-export commonly used types from the types module
pub use types::{
    ContentRepositoryId, ContentStreamId, NodeAggregateId, NodeName, NodeTypeName, ReferenceName, SubtreeTag,
    WorkspaceName,
};

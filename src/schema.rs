//! # SQLite Schema for SpiteGraph
//!
//! One database file holds three kinds of tables:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Event log (this module)        Projections (created by each            │
//! │  ┌──────────────────────┐       projection's setup())                   │
//! │  │ events               │       ┌──────────────────────────┐            │
//! │  │  sequence_number PK  │       │ cr_node                  │            │
//! │  │  stream_name         │       │ cr_hierarchy_relation    │            │
//! │  │  version             │       │ cr_dimension_space_point │            │
//! │  │  event_type, payload │       │ cr_content_stream        │            │
//! │  │  metadata            │       │ cr_workspace             │            │
//! │  └──────────────────────┘       └──────────────────────────┘            │
//! │  ┌──────────────────────┐       ┌──────────────────────────┐            │
//! │  │ stream_heads         │       │ projection_checkpoints   │            │
//! │  └──────────────────────┘       └──────────────────────────┘            │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Why One File?
//!
//! A projection must commit its state change and its checkpoint atomically,
//! otherwise a crash between the two applies an event twice or skips it.
//! With the checkpoint table next to the projection tables, both writes
//! share one SQLite transaction.

use rusqlite::{Connection, OptionalExtension};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations: a mismatch is reported as [`Error::Schema`].
const SCHEMA_VERSION: i32 = 1;

/// How long a statement waits for another connection's write lock.
const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

// =============================================================================
// DDL Statements
// =============================================================================

/// The `events` table is the append-only event log.
///
/// # Columns
///
/// - `sequence_number`: Global position, strictly increasing, starts at 1
/// - `stream_name`: e.g. `ContentStream:cs-1` or `Workspace:live`
/// - `version`: 0-based position within the stream
/// - `event_id`: Random UUID, for tracing
/// - `event_type`: Variant name of the event, e.g. `NodePropertiesWereSet`
/// - `payload`: JSON payload
/// - `metadata`: JSON metadata (the command that caused the event), nullable
/// - `recorded_ms`: Unix timestamp in milliseconds
///
/// # Invariants
///
/// - `sequence_number` is never reused (AUTOINCREMENT)
/// - `(stream_name, version)` is unique and gap-free per stream
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    sequence_number INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_name     TEXT NOT NULL,
    version         INTEGER NOT NULL,
    event_id        TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    payload         TEXT NOT NULL,
    metadata        TEXT,
    recorded_ms     INTEGER NOT NULL
)
"#;

/// Enforces one event per stream version.
///
/// Even if the in-memory head cache were wrong, a second writer proposing
/// the same version fails here instead of forking the stream.
const CREATE_EVENTS_STREAM_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS events_stream_version
ON events(stream_name, version)
"#;

/// The `stream_heads` table caches the latest version of each stream.
///
/// This table is the source of truth for the in-memory head cache of the
/// event store; the cache can lag but never lead.
const CREATE_STREAM_HEADS: &str = r#"
CREATE TABLE IF NOT EXISTS stream_heads (
    stream_name          TEXT PRIMARY KEY,
    last_version         INTEGER NOT NULL,
    last_sequence_number INTEGER NOT NULL
)
"#;

/// Checkpoint per projection: the sequence number of the last applied event.
const CREATE_PROJECTION_CHECKPOINTS: &str = r#"
CREATE TABLE IF NOT EXISTS projection_checkpoints (
    projection_name      TEXT PRIMARY KEY,
    last_sequence_number INTEGER NOT NULL,
    updated_ms           INTEGER NOT NULL
)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS spitegraph_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A wrapper around a SQLite connection with the SpiteGraph base schema.
///
/// # Ownership
///
/// `Database` owns its `Connection`; dropping it closes the file. The
/// connection is `!Sync`, which is why the async handle keeps the whole
/// repository on one dedicated thread.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use spitegraph::Database;
    ///
    /// let db = Database::open("content.db")?;
    /// # Ok::<(), spitegraph::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database for testing.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&mut self) -> Result<()> {
        // WAL: readers see the last committed checkpoint while catch-up writes.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON")?;
        // Other connections to the same file hold the write lock briefly.
        self.conn.busy_timeout(BUSY_TIMEOUT)?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_EVENTS)?;
        self.conn.execute_batch(CREATE_EVENTS_STREAM_INDEX)?;
        self.conn.execute_batch(CREATE_STREAM_HEADS)?;
        self.conn.execute_batch(CREATE_PROJECTION_CHECKPOINTS)?;

        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM spitegraph_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO spitegraph_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, but this SpiteGraph version requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    /// Returns the underlying SQLite connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Runs `f` inside a `BEGIN IMMEDIATE` transaction.
///
/// Commits when `f` succeeds and rolls back when it fails, returning `f`'s
/// error. `IMMEDIATE` takes the write lock up front so two writers never
/// both read a stale head and then race on commit.
pub(crate) fn in_transaction<T>(conn: &Connection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Current time as Unix milliseconds.
pub(crate) fn current_time_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_count(db: &Database) -> i32 {
        db.conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .expect("should query tables")
    }

    /// Verify that in-memory database creation works.
    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().expect("should create in-memory db");

        // metadata, events, stream_heads, projection_checkpoints
        assert_eq!(table_count(&db), 4, "expected 4 tables");
    }

    /// Verify schema version is stored correctly.
    #[test]
    fn test_schema_version_stored() {
        let db = Database::open_in_memory().expect("should create db");

        let version: String = db
            .conn
            .query_row(
                "SELECT value FROM spitegraph_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .expect("should query version");

        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    /// A wrong schema version is refused.
    #[test]
    fn test_schema_version_mismatch() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let db = Database::open(&path).expect("first open should work");
            db.conn
                .execute(
                    "UPDATE spitegraph_metadata SET value = '99' WHERE key = 'schema_version'",
                    [],
                )
                .unwrap();
        }

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    /// Verify that opening the same database twice works (idempotent).
    #[test]
    fn test_double_initialization() {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join("test.db");

        {
            let _db = Database::open(&path).expect("first open should work");
        }

        let db = Database::open(&path).expect("second open should work");
        assert_eq!(table_count(&db), 4);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();

        let result: Result<()> = in_transaction(conn, |conn| {
            conn.execute(
                "INSERT INTO spitegraph_metadata (key, value) VALUES ('scratch', 'x')",
                [],
            )?;
            Err(Error::Schema("boom".to_string()))
        });
        assert!(result.is_err());

        let scratch: Option<String> = conn
            .query_row(
                "SELECT value FROM spitegraph_metadata WHERE key = 'scratch'",
                [],
                |row| row.get(0),
            )
            .optional()
            .unwrap();
        assert!(scratch.is_none());
    }
}

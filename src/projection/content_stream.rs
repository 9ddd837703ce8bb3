//! # Content Stream Projection
//!
//! One row per content stream with its lifecycle status:
//!
//! ```text
//!   CREATED ─┐
//!            ├──► IN_USE_BY_WORKSPACE ──► CLOSED ──► (reopen: previous status)
//!   FORKED ──┘            │
//!                         ▼
//!                  NO_LONGER_IN_USE ──► removed
//!   (failed rebase candidate) REBASE_ERROR ──► removed
//! ```
//!
//! `removed` is a soft delete flag: the row stays so that a removed stream
//! id can never be reused.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::event_store::EventEnvelope;
use crate::events::EventKind;
use crate::projection::Projection;
use crate::types::{ContentStreamId, ContentStreamStatus, Version};

/// Checkpoint name of the content stream projection.
pub const CONTENT_STREAM_PROJECTION: &str = "content_stream";

const CREATE_CONTENT_STREAM: &str = r#"
CREATE TABLE IF NOT EXISTS cr_content_stream (
    content_stream_id        TEXT PRIMARY KEY,
    source_content_stream_id TEXT,
    status                   TEXT NOT NULL,
    version                  INTEGER NOT NULL,
    removed                  INTEGER NOT NULL DEFAULT 0
)
"#;

/// A content stream as the projection sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentStreamRecord {
    pub content_stream_id: ContentStreamId,
    pub source_content_stream_id: Option<ContentStreamId>,
    pub status: ContentStreamStatus,
    /// Version of the stream's last event
    pub version: Version,
    pub removed: bool,
}

impl ContentStreamRecord {
    /// Returns true if writes are refused.
    pub fn is_closed(&self) -> bool {
        self.status == ContentStreamStatus::Closed
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<RawContentStream> {
        Ok(RawContentStream {
            content_stream_id: row.get(0)?,
            source_content_stream_id: row.get(1)?,
            status: row.get(2)?,
            version: row.get(3)?,
            removed: row.get(4)?,
        })
    }
}

struct RawContentStream {
    content_stream_id: String,
    source_content_stream_id: Option<String>,
    status: String,
    version: i64,
    removed: bool,
}

impl RawContentStream {
    fn into_record(self) -> Result<ContentStreamRecord> {
        Ok(ContentStreamRecord {
            content_stream_id: ContentStreamId::new(self.content_stream_id)?,
            source_content_stream_id: self.source_content_stream_id.map(ContentStreamId::new).transpose()?,
            status: ContentStreamStatus::parse(&self.status)?,
            version: Version::from_raw(self.version as u64),
            removed: self.removed,
        })
    }
}

const COLUMNS: &str = "content_stream_id, source_content_stream_id, status, version, removed";

// =============================================================================
// Projection
// =============================================================================

/// Tracks content stream status and version.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContentStreamProjection;

impl ContentStreamProjection {
    pub fn new() -> Self {
        Self
    }
}

impl Projection for ContentStreamProjection {
    fn name(&self) -> &str {
        CONTENT_STREAM_PROJECTION
    }

    fn setup(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(CREATE_CONTENT_STREAM)?;
        Ok(())
    }

    fn reset(&self, conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM cr_content_stream", [])?;
        Ok(())
    }

    fn can_handle(&self, _event_type: &str) -> bool {
        // Every event on a content stream moves its version.
        true
    }

    fn apply(&self, conn: &Connection, event: &EventKind, envelope: &EventEnvelope) -> Result<()> {
        match event {
            EventKind::ContentStreamWasCreated(e) => {
                insert(conn, &e.content_stream_id, None, ContentStreamStatus::Created, envelope.version)?;
            }
            EventKind::ContentStreamWasForked(e) => {
                insert(
                    conn,
                    &e.new_content_stream_id,
                    Some(&e.source_content_stream_id),
                    ContentStreamStatus::Forked,
                    envelope.version,
                )?;
            }
            EventKind::ContentStreamWasClosed(e) => {
                set_status(conn, &e.content_stream_id, ContentStreamStatus::Closed)?;
            }
            EventKind::ContentStreamWasReopened(e) => {
                set_status(conn, &e.content_stream_id, e.previous_state)?;
            }
            EventKind::ContentStreamWasRemoved(e) => {
                conn.execute(
                    "UPDATE cr_content_stream SET removed = 1 WHERE content_stream_id = ?",
                    [e.content_stream_id.as_str()],
                )?;
            }
            EventKind::RootWorkspaceWasCreated(e) => {
                set_status(conn, &e.new_content_stream_id, ContentStreamStatus::InUseByWorkspace)?;
            }
            EventKind::WorkspaceWasCreated(e) => {
                set_status(conn, &e.new_content_stream_id, ContentStreamStatus::InUseByWorkspace)?;
            }
            EventKind::WorkspaceWasRebased(e) => {
                set_status(conn, &e.new_content_stream_id, ContentStreamStatus::InUseByWorkspace)?;
                set_status(conn, &e.previous_content_stream_id, ContentStreamStatus::NoLongerInUse)?;
            }
            EventKind::WorkspaceRebaseFailed(e) => {
                set_status(conn, &e.candidate_content_stream_id, ContentStreamStatus::RebaseError)?;
            }
            EventKind::WorkspaceWasPublished(e) => {
                set_status(conn, &e.new_source_content_stream_id, ContentStreamStatus::InUseByWorkspace)?;
                set_status(conn, &e.previous_source_content_stream_id, ContentStreamStatus::NoLongerInUse)?;
            }
            EventKind::WorkspaceWasDiscarded(e) => {
                set_status(conn, &e.new_content_stream_id, ContentStreamStatus::InUseByWorkspace)?;
                set_status(conn, &e.previous_content_stream_id, ContentStreamStatus::NoLongerInUse)?;
            }
            _ => {}
        }

        if let Some(id) = envelope.stream_name.strip_prefix("ContentStream:") {
            conn.execute(
                "UPDATE cr_content_stream SET version = ? WHERE content_stream_id = ?",
                params![envelope.version.as_raw() as i64, id],
            )?;
        }
        Ok(())
    }
}

fn insert(
    conn: &Connection,
    content_stream_id: &ContentStreamId,
    source: Option<&ContentStreamId>,
    status: ContentStreamStatus,
    version: Version,
) -> Result<()> {
    conn.execute(
        "INSERT INTO cr_content_stream (content_stream_id, source_content_stream_id, status, version) \
         VALUES (?, ?, ?, ?)",
        params![
            content_stream_id.as_str(),
            source.map(|s| s.as_str()),
            status.as_str(),
            version.as_raw() as i64
        ],
    )?;
    Ok(())
}

fn set_status(conn: &Connection, content_stream_id: &ContentStreamId, status: ContentStreamStatus) -> Result<()> {
    conn.execute(
        "UPDATE cr_content_stream SET status = ? WHERE content_stream_id = ?",
        params![status.as_str(), content_stream_id.as_str()],
    )?;
    Ok(())
}

// =============================================================================
// Finder
// =============================================================================

/// Read access to the content stream projection.
#[derive(Debug, Clone, Copy)]
pub struct ContentStreamFinder<'a> {
    conn: &'a Connection,
}

impl<'a> ContentStreamFinder<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Finds a stream, removed or not.
    pub fn find_by_id(&self, content_stream_id: &ContentStreamId) -> Result<Option<ContentStreamRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM cr_content_stream WHERE content_stream_id = ?");
        self.conn
            .query_row(&sql, [content_stream_id.as_str()], ContentStreamRecord::from_row)
            .optional()?
            .map(RawContentStream::into_record)
            .transpose()
    }

    /// All streams that are not removed.
    pub fn find_all(&self) -> Result<Vec<ContentStreamRecord>> {
        self.query(&format!(
            "SELECT {COLUMNS} FROM cr_content_stream WHERE removed = 0 ORDER BY content_stream_id"
        ))
    }

    /// Streams no workspace needs anymore: replaced or failed rebase
    /// candidates that are not removed yet and that no workspace points at.
    pub fn find_unused_content_streams(&self) -> Result<Vec<ContentStreamRecord>> {
        self.query(&format!(
            "SELECT {COLUMNS} FROM cr_content_stream cs WHERE removed = 0 \
             AND status IN ('NO_LONGER_IN_USE', 'REBASE_ERROR') \
             AND NOT EXISTS (SELECT 1 FROM cr_workspace w \
                             WHERE w.current_content_stream_id = cs.content_stream_id) \
             ORDER BY content_stream_id"
        ))
    }

    fn query(&self, sql: &str) -> Result<Vec<ContentStreamRecord>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map([], ContentStreamRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawContentStream::into_record).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

//! # Event Store
//!
//! An append-only, ordered, per-stream event log on SQLite with optimistic
//! concurrency control.
//!
//! ## Streams
//!
//! Every content stream and every workspace has its own event stream:
//!
//! ```text
//! ContentStream:<content-stream-id>   node and content stream events
//! Workspace:<workspace-name>          workspace lifecycle events
//! ```
//!
//! ## Optimistic Concurrency
//!
//! A writer states which version it expects the stream to be at:
//!
//! ```text
//! Writer A: read stream (version 4) ──► append expecting 4 ──► ok, now 5
//! Writer B: read stream (version 4) ──────────► append expecting 4 ──► Conflict
//! ```
//!
//! This is the only concurrency-control mechanism. A conflicting command must
//! be retried against fresh state.
//!
//! ## Invariant: Disk Decides
//!
//! The expected version is checked against the `stream_heads` row inside
//! the same `BEGIN IMMEDIATE` transaction that writes the events, so two
//! processes appending to one database file cannot both win. The in-memory
//! heads are a cache for callers that only need a recent answer; they are
//! updated after every commit or conflict and may lag the database, never
//! lead it. [`EventStore::refresh`] reloads them when another writer moved
//! the log on.

use std::collections::HashMap;
use std::fmt;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::schema::{current_time_ms, in_transaction};
use crate::types::{ContentStreamId, SequenceNumber, Version, WorkspaceName};

// =============================================================================
// Stream Names
// =============================================================================

/// The name of one event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamName(String);

impl StreamName {
    /// The event stream of a content stream.
    pub fn for_content_stream(id: &ContentStreamId) -> Self {
        Self(format!("ContentStream:{id}"))
    }

    /// The event stream of a workspace.
    pub fn for_workspace(name: &WorkspaceName) -> Self {
        Self(format!("Workspace:{name}"))
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Append Types
// =============================================================================

/// The version a writer expects a stream to be at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check at all
    Any,
    /// The stream must not have any events yet
    NoStream,
    /// The stream must have at least one event
    StreamExists,
    /// The stream's last event must have exactly this version
    Exact(Version),
}

impl ExpectedVersion {
    fn matches(&self, current: Option<Version>) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current.is_none(),
            ExpectedVersion::StreamExists => current.is_some(),
            ExpectedVersion::Exact(expected) => current == Some(*expected),
        }
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => write!(f, "any"),
            ExpectedVersion::NoStream => write!(f, "no stream"),
            ExpectedVersion::StreamExists => write!(f, "stream exists"),
            ExpectedVersion::Exact(version) => write!(f, "{version}"),
        }
    }
}

/// An event about to be appended.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Random id, for tracing
    pub event_id: String,
    /// The event type, e.g. `NodePropertiesWereSet`
    pub event_type: String,
    /// JSON payload
    pub payload: Value,
    /// Optional JSON metadata
    pub metadata: Option<Value>,
}

impl NewEvent {
    /// Creates an event with a fresh id and no metadata.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            metadata: None,
        }
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Result of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Sequence number of the first appended event
    pub first_sequence_number: SequenceNumber,
    /// Sequence number of the last appended event
    pub last_sequence_number: SequenceNumber,
    /// The stream's version after the append
    pub version: Version,
}

/// A stored event as read back from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    /// Global position
    pub sequence_number: SequenceNumber,
    /// The stream the event belongs to
    pub stream_name: String,
    /// Position within the stream
    pub version: Version,
    /// Random id assigned on append
    pub event_id: String,
    /// The event type
    pub event_type: String,
    /// JSON payload
    pub payload: Value,
    /// JSON metadata, if any
    pub metadata: Option<Value>,
    /// When the event was appended (Unix milliseconds)
    pub recorded_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct StreamHead {
    last_version: Version,
    last_sequence_number: SequenceNumber,
}

/// What happened inside an append transaction.
enum Attempt {
    Written {
        first: SequenceNumber,
        last: SequenceNumber,
        version: Version,
    },
    /// The stored head did not match the expected version
    Rejected(Option<StreamHead>),
}

fn read_head(conn: &Connection, stream_name: &StreamName) -> Result<Option<StreamHead>> {
    Ok(conn
        .query_row(
            "SELECT last_version, last_sequence_number FROM stream_heads WHERE stream_name = ?",
            [stream_name.as_str()],
            |row| {
                Ok(StreamHead {
                    last_version: Version::from_raw(row.get::<_, i64>(0)? as u64),
                    last_sequence_number: SequenceNumber::from_raw(row.get::<_, i64>(1)? as u64),
                })
            },
        )
        .optional()?)
}

fn read_last_sequence_number(conn: &Connection) -> Result<SequenceNumber> {
    let last: Option<i64> = conn.query_row("SELECT MAX(sequence_number) FROM events", [], |row| row.get(0))?;
    Ok(SequenceNumber::from_raw(last.unwrap_or(0) as u64))
}

// =============================================================================
// Event Store
// =============================================================================

/// The event log with its in-memory stream head cache.
///
/// # Several Writers
///
/// Any number of `EventStore`s, in this or other processes, may append to
/// one database file. Each append locks the file and compares against the
/// stored head, and the unique `(stream_name, version)` index is the
/// backstop below that.
#[derive(Debug)]
pub struct EventStore {
    heads: HashMap<String, StreamHead>,
    last_sequence_number: SequenceNumber,
}

impl EventStore {
    /// Loads the stream heads from the database.
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut heads = HashMap::new();
        let mut stmt =
            conn.prepare("SELECT stream_name, last_version, last_sequence_number FROM stream_heads")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;
        for row in rows {
            let (name, version, sequence_number) = row?;
            heads.insert(
                name,
                StreamHead {
                    last_version: Version::from_raw(version as u64),
                    last_sequence_number: SequenceNumber::from_raw(sequence_number as u64),
                },
            );
        }

        Ok(Self {
            heads,
            last_sequence_number: read_last_sequence_number(conn)?,
        })
    }

    /// Appends events to one stream atomically.
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`] if the stream is not at the expected version
    /// - [`Error::Schema`] if `events` is empty
    pub fn append(
        &mut self,
        conn: &Connection,
        stream_name: &StreamName,
        events: Vec<NewEvent>,
        expected: ExpectedVersion,
    ) -> Result<AppendResult> {
        if events.is_empty() {
            return Err(Error::Schema(format!("empty append to stream '{stream_name}'")));
        }

        let now_ms = current_time_ms();
        let event_count = events.len();

        let attempt = in_transaction(conn, |conn| {
            let head = read_head(conn, stream_name)?;
            let current = head.map(|h| h.last_version);
            if !expected.matches(current) {
                return Ok(Attempt::Rejected(head));
            }

            let mut version = current.map_or(Version::from_raw(0), |v| v.next());
            let mut first = None;
            let mut last = SequenceNumber::NONE;
            for (index, event) in events.iter().enumerate() {
                if index > 0 {
                    version = version.next();
                }
                conn.execute(
                    "INSERT INTO events (stream_name, version, event_id, event_type, payload, metadata, recorded_ms)
                     VALUES (?, ?, ?, ?, ?, ?, ?)",
                    params![
                        stream_name.as_str(),
                        version.as_raw() as i64,
                        event.event_id,
                        event.event_type,
                        event.payload.to_string(),
                        event.metadata.as_ref().map(Value::to_string),
                        now_ms,
                    ],
                )?;
                let sequence_number = SequenceNumber::from_raw(conn.last_insert_rowid() as u64);
                first.get_or_insert(sequence_number);
                last = sequence_number;
            }

            conn.execute(
                "INSERT INTO stream_heads (stream_name, last_version, last_sequence_number)
                 VALUES (?, ?, ?)
                 ON CONFLICT(stream_name) DO UPDATE SET
                     last_version = excluded.last_version,
                     last_sequence_number = excluded.last_sequence_number",
                params![stream_name.as_str(), version.as_raw() as i64, last.as_raw() as i64],
            )?;

            Ok(Attempt::Written {
                first: first.unwrap_or(last),
                last,
                version,
            })
        })?;

        let (first, last, version) = match attempt {
            Attempt::Written { first, last, version } => (first, last, version),
            Attempt::Rejected(head) => {
                // The cache was stale; take what the database said.
                match head {
                    Some(head) => {
                        self.heads.insert(stream_name.as_str().to_string(), head);
                    }
                    None => {
                        self.heads.remove(stream_name.as_str());
                    }
                }
                return Err(Error::Conflict {
                    stream_name: stream_name.to_string(),
                    expected: expected.to_string(),
                    actual: head.map_or_else(|| "no stream".to_string(), |h| h.last_version.to_string()),
                });
            }
        };

        // Memory never leads disk: update the cache only after commit.
        self.heads.insert(
            stream_name.as_str().to_string(),
            StreamHead {
                last_version: version,
                last_sequence_number: last,
            },
        );
        self.last_sequence_number = self.last_sequence_number.max(last);

        debug!(
            stream = %stream_name,
            events = event_count,
            first_sequence_number = %first,
            last_sequence_number = %last,
            "appended events"
        );

        Ok(AppendResult {
            first_sequence_number: first,
            last_sequence_number: last,
            version,
        })
    }

    /// Reloads the heads if another writer appended to the database since
    /// this store last looked. Returns true if it did.
    pub fn refresh(&mut self, conn: &Connection) -> Result<bool> {
        if read_last_sequence_number(conn)? <= self.last_sequence_number {
            return Ok(false);
        }
        *self = Self::load(conn)?;
        debug!(last_sequence_number = %self.last_sequence_number, "event store refreshed from disk");
        Ok(true)
    }

    /// Returns the version of a stream as stored in the database.
    pub fn read_stream_version(&self, conn: &Connection, stream_name: &StreamName) -> Result<Option<Version>> {
        Ok(read_head(conn, stream_name)?.map(|h| h.last_version))
    }

    /// Returns the cached version of a stream, `None` if it has no events.
    pub fn stream_version(&self, stream_name: &StreamName) -> Option<Version> {
        self.heads.get(stream_name.as_str()).map(|h| h.last_version)
    }

    /// Returns the sequence number of the last event of a stream.
    pub fn stream_last_sequence_number(&self, stream_name: &StreamName) -> Option<SequenceNumber> {
        self.heads
            .get(stream_name.as_str())
            .map(|h| h.last_sequence_number)
    }

    /// Returns the sequence number of the last event in the log.
    pub fn last_sequence_number(&self) -> SequenceNumber {
        self.last_sequence_number
    }

    /// Reads all events of one stream in version order.
    pub fn read_stream(&self, conn: &Connection, stream_name: &StreamName) -> Result<Vec<EventEnvelope>> {
        let mut stmt = conn.prepare(
            "SELECT sequence_number, stream_name, version, event_id, event_type, payload, metadata, recorded_ms
             FROM events WHERE stream_name = ? ORDER BY version",
        )?;
        let rows = stmt.query_map([stream_name.as_str()], read_raw_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?.decode()?);
        }
        Ok(events)
    }

    /// Reads up to `limit` events of the global log, starting at `from`
    /// (inclusive).
    pub fn read_all_from(
        &self,
        conn: &Connection,
        from: SequenceNumber,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>> {
        let mut stmt = conn.prepare(
            "SELECT sequence_number, stream_name, version, event_id, event_type, payload, metadata, recorded_ms
             FROM events WHERE sequence_number >= ? ORDER BY sequence_number LIMIT ?",
        )?;
        let rows = stmt.query_map(params![from.as_raw() as i64, limit as i64], read_raw_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?.decode()?);
        }
        Ok(events)
    }

    /// Reads one event by sequence number.
    pub fn read_event(&self, conn: &Connection, sequence_number: SequenceNumber) -> Result<Option<EventEnvelope>> {
        let raw = conn
            .query_row(
                "SELECT sequence_number, stream_name, version, event_id, event_type, payload, metadata, recorded_ms
                 FROM events WHERE sequence_number = ?",
                [sequence_number.as_raw() as i64],
                read_raw_event,
            )
            .optional()?;
        raw.map(RawEvent::decode).transpose()
    }
}

/// Row as stored; JSON columns are decoded outside the rusqlite closure so
/// JSON errors keep their own error variant.
struct RawEvent {
    sequence_number: i64,
    stream_name: String,
    version: i64,
    event_id: String,
    event_type: String,
    payload: String,
    metadata: Option<String>,
    recorded_ms: i64,
}

fn read_raw_event(row: &Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        sequence_number: row.get(0)?,
        stream_name: row.get(1)?,
        version: row.get(2)?,
        event_id: row.get(3)?,
        event_type: row.get(4)?,
        payload: row.get(5)?,
        metadata: row.get(6)?,
        recorded_ms: row.get(7)?,
    })
}

impl RawEvent {
    fn decode(self) -> Result<EventEnvelope> {
        Ok(EventEnvelope {
            sequence_number: SequenceNumber::from_raw(self.sequence_number as u64),
            stream_name: self.stream_name,
            version: Version::from_raw(self.version as u64),
            event_id: self.event_id,
            event_type: self.event_type,
            payload: serde_json::from_str(&self.payload)?,
            metadata: self.metadata.as_deref().map(serde_json::from_str::<Value>).transpose()?,
            recorded_ms: self.recorded_ms,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

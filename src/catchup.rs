//! # Catch-Up
//!
//! Brings projections up to date with the event log.
//!
//! ```text
//!   events:      1   2   3   4   5   6   7
//!                            ▲           ▲
//!   content_graph checkpoint ┘           │
//!   workspace checkpoint ────────────────┘
//!
//!   run() reads from min(checkpoints) + 1 = 4, and for every event hands
//!   it to each projection whose checkpoint is behind it.
//! ```
//!
//! ## Exactly Once
//!
//! Every `(event, projection)` pair runs in its own SQLite transaction that
//! also moves that projection's checkpoint. A crash between two pairs loses
//! nothing and repeats nothing: the next run resumes at the first pair whose
//! checkpoint did not move.
//!
//! A projection that fails aborts the run. Its transaction is rolled back,
//! the checkpoint stays, and the error is returned. Projections are
//! deterministic, so running again fails again until the cause is fixed.
//!
//! ## Hooks
//!
//! After each committed batch, every [`CatchUpHook`] receives a
//! [`ProjectionUpdated`] naming the content streams that changed. The
//! subgraph caches use this to drop stale entries.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, error};

use crate::error::Result;
use crate::event_store::{EventEnvelope, EventStore};
use crate::events::EventKind;
use crate::projection::Projection;
use crate::schema::{current_time_ms, in_transaction};
use crate::types::{ContentStreamId, SequenceNumber};

/// Default number of events read per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

// =============================================================================
// Notifications
// =============================================================================

/// Sent to hooks after a batch of events was committed to the projections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionUpdated {
    /// Sequence number of the last event in the batch
    pub last_sequence_number: SequenceNumber,
    /// Number of events in the batch
    pub applied_events: usize,
    /// Content streams whose events were in the batch
    pub content_stream_ids: BTreeSet<ContentStreamId>,
}

/// Observer of committed catch-up batches.
///
/// Hooks run on the repository thread, right after the commit; they must
/// not block.
pub trait CatchUpHook: Send {
    fn on_batch_committed(&self, update: &ProjectionUpdated);
}

/// Outcome of one catch-up run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CatchUpResult {
    /// Number of events handed to at least one projection
    pub applied: usize,
    /// The lowest checkpoint after the run
    pub last_sequence_number: SequenceNumber,
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Reads a projection's checkpoint; [`SequenceNumber::NONE`] if it never ran.
pub fn load_checkpoint(conn: &Connection, projection_name: &str) -> Result<SequenceNumber> {
    let value: Option<i64> = conn
        .query_row(
            "SELECT last_sequence_number FROM projection_checkpoints WHERE projection_name = ?",
            [projection_name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.map_or(SequenceNumber::NONE, |v| SequenceNumber::from_raw(v as u64)))
}

pub(crate) fn save_checkpoint(conn: &Connection, projection_name: &str, sequence_number: SequenceNumber) -> Result<()> {
    conn.execute(
        "INSERT INTO projection_checkpoints (projection_name, last_sequence_number, updated_ms) \
         VALUES (?1, ?2, ?3) \
         ON CONFLICT(projection_name) DO UPDATE SET last_sequence_number = ?2, updated_ms = ?3",
        params![projection_name, sequence_number.as_raw() as i64, current_time_ms()],
    )?;
    Ok(())
}

// =============================================================================
// Engine
// =============================================================================

/// The catch-up engine.
#[derive(Debug, Clone, Copy)]
pub struct CatchUp {
    batch_size: usize,
}

impl Default for CatchUp {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

impl CatchUp {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Applies all events the projections have not seen yet.
    ///
    /// # Errors
    ///
    /// The first error of any projection. Everything committed before it
    /// stays committed, and hooks are told about it.
    pub fn run(
        &self,
        conn: &Connection,
        event_store: &EventStore,
        projections: &[Box<dyn Projection>],
        hooks: &[Box<dyn CatchUpHook>],
    ) -> Result<CatchUpResult> {
        let mut checkpoints = projections
            .iter()
            .map(|p| load_checkpoint(conn, p.name()))
            .collect::<Result<Vec<_>>>()?;

        let Some(lowest) = checkpoints.iter().min().copied() else {
            return Ok(CatchUpResult::default());
        };

        let mut result = CatchUpResult {
            applied: 0,
            last_sequence_number: lowest,
        };
        let mut from = lowest.next();

        loop {
            let batch = event_store.read_all_from(conn, from, self.batch_size)?;
            let Some(last) = batch.last() else {
                break;
            };
            from = last.sequence_number.next();

            let mut update = ProjectionUpdated {
                last_sequence_number: result.last_sequence_number,
                applied_events: 0,
                content_stream_ids: BTreeSet::new(),
            };

            for envelope in &batch {
                let outcome = EventKind::from_envelope(envelope)
                    .and_then(|event| apply_event(conn, envelope, &event, projections, &mut checkpoints).map(|_| event));
                let event = match outcome {
                    Ok(event) => event,
                    Err(e) => {
                        notify(hooks, &update);
                        return Err(e);
                    }
                };
                if let Some(id) = event.content_stream_id() {
                    update.content_stream_ids.insert(id.clone());
                }
                update.applied_events += 1;
                update.last_sequence_number = envelope.sequence_number;
            }

            debug!(
                events = update.applied_events,
                last_sequence_number = %update.last_sequence_number,
                "catch-up batch committed"
            );
            result.applied += update.applied_events;
            result.last_sequence_number = update.last_sequence_number;
            notify(hooks, &update);
        }

        Ok(result)
    }
}

fn notify(hooks: &[Box<dyn CatchUpHook>], update: &ProjectionUpdated) {
    if update.applied_events == 0 {
        return;
    }
    for hook in hooks {
        hook.on_batch_committed(update);
    }
}

/// Hands one event to every projection that is behind it.
fn apply_event(
    conn: &Connection,
    envelope: &EventEnvelope,
    event: &EventKind,
    projections: &[Box<dyn Projection>],
    checkpoints: &mut [SequenceNumber],
) -> Result<()> {
    for (projection, checkpoint) in projections.iter().zip(checkpoints.iter_mut()) {
        if *checkpoint >= envelope.sequence_number {
            continue;
        }
        let outcome = in_transaction(conn, |tx| {
            // Another connection to the same file may have applied it already.
            if load_checkpoint(tx, projection.name())? >= envelope.sequence_number {
                return Ok(());
            }
            if projection.can_handle(&envelope.event_type) {
                projection.apply(tx, event, envelope)?;
            }
            save_checkpoint(tx, projection.name(), envelope.sequence_number)
        });
        if let Err(e) = outcome {
            error!(
                projection = projection.name(),
                sequence_number = %envelope.sequence_number,
                event_type = %envelope.event_type,
                error = %e,
                "projection failed to apply event"
            );
            return Err(e);
        }
        *checkpoint = envelope.sequence_number;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::{ExpectedVersion, NewEvent, StreamName};
    use crate::schema::Database;
    use crate::Error;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// Counts applied events into a table; fails on a configured event type.
    struct Counting {
        name: &'static str,
        fail_on: Option<&'static str>,
    }

    impl Projection for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn setup(&self, conn: &Connection) -> Result<()> {
            conn.execute_batch("CREATE TABLE IF NOT EXISTS counted (projection TEXT, sequence_number INTEGER)")?;
            Ok(())
        }

        fn reset(&self, conn: &Connection) -> Result<()> {
            conn.execute("DELETE FROM counted WHERE projection = ?", [self.name])?;
            Ok(())
        }

        fn can_handle(&self, _event_type: &str) -> bool {
            true
        }

        fn apply(&self, conn: &Connection, _event: &EventKind, envelope: &EventEnvelope) -> Result<()> {
            conn.execute(
                "INSERT INTO counted VALUES (?, ?)",
                params![self.name, envelope.sequence_number.as_raw() as i64],
            )?;
            if self.fail_on == Some(envelope.event_type.as_str()) {
                return Err(Error::violation("configured failure"));
            }
            Ok(())
        }
    }

    struct Recorder(Arc<Mutex<Vec<ProjectionUpdated>>>);

    impl CatchUpHook for Recorder {
        fn on_batch_committed(&self, update: &ProjectionUpdated) {
            self.0.lock().unwrap().push(update.clone());
        }
    }

    fn counted(conn: &Connection, name: &str) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM counted WHERE projection = ?", [name], |row| row.get(0))
            .unwrap()
    }

    fn append_created(conn: &Connection, store: &mut EventStore, ids: &[&str]) {
        for id in ids {
            let stream = StreamName::for_content_stream(&ContentStreamId::new(*id).unwrap());
            store
                .append(
                    conn,
                    &stream,
                    vec![NewEvent::new("ContentStreamWasCreated", json!({ "contentStreamId": id }))],
                    ExpectedVersion::NoStream,
                )
                .unwrap();
        }
    }

    #[test]
    fn test_catch_up_applies_each_event_once() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let mut store = EventStore::load(conn).unwrap();
        let projections: Vec<Box<dyn Projection>> = vec![Box::new(Counting {
            name: "a",
            fail_on: None,
        })];
        projections[0].setup(conn).unwrap();

        append_created(conn, &mut store, &["cs-1", "cs-2", "cs-3"]);

        let engine = CatchUp::new(2);
        let result = engine.run(conn, &store, &projections, &[]).unwrap();
        assert_eq!(result.applied, 3);
        assert_eq!(result.last_sequence_number, SequenceNumber::from_raw(3));

        let again = engine.run(conn, &store, &projections, &[]).unwrap();
        assert_eq!(again.applied, 0);
        assert_eq!(counted(conn, "a"), 3);
    }

    #[test]
    fn test_failure_keeps_checkpoint_and_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let mut store = EventStore::load(conn).unwrap();
        let projections: Vec<Box<dyn Projection>> = vec![Box::new(Counting {
            name: "a",
            fail_on: Some("ContentStreamWasRemoved"),
        })];
        projections[0].setup(conn).unwrap();

        append_created(conn, &mut store, &["cs-1"]);
        let stream = StreamName::for_content_stream(&ContentStreamId::new("cs-1").unwrap());
        store
            .append(
                conn,
                &stream,
                vec![NewEvent::new("ContentStreamWasRemoved", json!({ "contentStreamId": "cs-1" }))],
                ExpectedVersion::Any,
            )
            .unwrap();

        let err = CatchUp::default().run(conn, &store, &projections, &[]).unwrap_err();
        assert!(matches!(err, Error::ProjectionConsistencyViolation(_)));
        assert_eq!(load_checkpoint(conn, "a").unwrap(), SequenceNumber::from_raw(1));
        // The insert of the failed event was rolled back.
        assert_eq!(counted(conn, "a"), 1);
    }

    #[test]
    fn test_lagging_projection_catches_up_alone() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let mut store = EventStore::load(conn).unwrap();
        append_created(conn, &mut store, &["cs-1", "cs-2"]);

        let first: Vec<Box<dyn Projection>> = vec![Box::new(Counting {
            name: "a",
            fail_on: None,
        })];
        first[0].setup(conn).unwrap();
        CatchUp::default().run(conn, &store, &first, &[]).unwrap();

        let both: Vec<Box<dyn Projection>> = vec![
            Box::new(Counting {
                name: "a",
                fail_on: None,
            }),
            Box::new(Counting {
                name: "b",
                fail_on: None,
            }),
        ];
        CatchUp::default().run(conn, &store, &both, &[]).unwrap();

        assert_eq!(counted(conn, "a"), 2);
        assert_eq!(counted(conn, "b"), 2);
    }

    #[test]
    fn test_hooks_receive_changed_streams() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let mut store = EventStore::load(conn).unwrap();
        let projections: Vec<Box<dyn Projection>> = vec![Box::new(Counting {
            name: "a",
            fail_on: None,
        })];
        projections[0].setup(conn).unwrap();
        append_created(conn, &mut store, &["cs-1", "cs-2"]);

        let updates = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Box<dyn CatchUpHook>> = vec![Box::new(Recorder(Arc::clone(&updates)))];
        CatchUp::default().run(conn, &store, &projections, &hooks).unwrap();

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].applied_events, 2);
        assert_eq!(updates[0].content_stream_ids.len(), 2);
    }
}

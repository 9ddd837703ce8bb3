//! # Workspace Projection
//!
//! One row per workspace: its base workspace, its current content stream and
//! whether it is in sync with its base.
//!
//! A workspace becomes `OUTDATED` as soon as its base workspace's content
//! stream receives node events (directly or through a publish). A rebase or
//! discard brings it back to `UP_TO_DATE`; a failed rebase leaves it
//! `OUTDATED_CONFLICT`.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::event_store::EventEnvelope;
use crate::events::EventKind;
use crate::projection::Projection;
use crate::types::{ContentStreamId, WorkspaceName, WorkspaceStatus};

/// Checkpoint name of the workspace projection.
pub const WORKSPACE_PROJECTION: &str = "workspace";

const CREATE_WORKSPACE: &str = r#"
CREATE TABLE IF NOT EXISTS cr_workspace (
    workspace_name            TEXT PRIMARY KEY,
    base_workspace_name       TEXT,
    workspace_title           TEXT NOT NULL,
    workspace_description     TEXT NOT NULL,
    current_content_stream_id TEXT NOT NULL,
    status                    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS cr_workspace_base ON cr_workspace(base_workspace_name);
CREATE INDEX IF NOT EXISTS cr_workspace_stream ON cr_workspace(current_content_stream_id);
"#;

const COLUMNS: &str = "workspace_name, base_workspace_name, workspace_title, workspace_description, \
     current_content_stream_id, status";

/// A workspace as the projection sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub workspace_name: WorkspaceName,
    /// `None` for root workspaces such as `live`
    pub base_workspace_name: Option<WorkspaceName>,
    pub workspace_title: String,
    pub workspace_description: String,
    pub current_content_stream_id: ContentStreamId,
    pub status: WorkspaceStatus,
}

impl Workspace {
    pub fn is_root_workspace(&self) -> bool {
        self.base_workspace_name.is_none()
    }
}

struct RawWorkspace {
    workspace_name: String,
    base_workspace_name: Option<String>,
    workspace_title: String,
    workspace_description: String,
    current_content_stream_id: String,
    status: String,
}

impl RawWorkspace {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            workspace_name: row.get(0)?,
            base_workspace_name: row.get(1)?,
            workspace_title: row.get(2)?,
            workspace_description: row.get(3)?,
            current_content_stream_id: row.get(4)?,
            status: row.get(5)?,
        })
    }

    fn into_workspace(self) -> Result<Workspace> {
        Ok(Workspace {
            workspace_name: WorkspaceName::new(self.workspace_name)?,
            base_workspace_name: self.base_workspace_name.map(WorkspaceName::new).transpose()?,
            workspace_title: self.workspace_title,
            workspace_description: self.workspace_description,
            current_content_stream_id: ContentStreamId::new(self.current_content_stream_id)?,
            status: WorkspaceStatus::parse(&self.status)?,
        })
    }
}

// =============================================================================
// Projection
// =============================================================================

/// Tracks workspaces and their status.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkspaceProjection;

impl WorkspaceProjection {
    pub fn new() -> Self {
        Self
    }
}

impl Projection for WorkspaceProjection {
    fn name(&self) -> &str {
        WORKSPACE_PROJECTION
    }

    fn setup(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(CREATE_WORKSPACE)?;
        Ok(())
    }

    fn reset(&self, conn: &Connection) -> Result<()> {
        conn.execute("DELETE FROM cr_workspace", [])?;
        Ok(())
    }

    fn can_handle(&self, event_type: &str) -> bool {
        !event_type.starts_with("ContentStream")
    }

    fn apply(&self, conn: &Connection, event: &EventKind, envelope: &EventEnvelope) -> Result<()> {
        match event {
            EventKind::RootWorkspaceWasCreated(e) => {
                insert(
                    conn,
                    &e.workspace_name,
                    None,
                    &e.workspace_title,
                    &e.workspace_description,
                    &e.new_content_stream_id,
                )?;
            }
            EventKind::WorkspaceWasCreated(e) => {
                insert(
                    conn,
                    &e.workspace_name,
                    Some(&e.base_workspace_name),
                    &e.workspace_title,
                    &e.workspace_description,
                    &e.new_content_stream_id,
                )?;
            }
            EventKind::WorkspaceWasRebased(e) => {
                switch_content_stream(conn, &e.workspace_name, &e.new_content_stream_id)?;
                mark_dependents_outdated(conn, &e.workspace_name)?;
            }
            EventKind::WorkspaceRebaseFailed(e) => {
                set_status(conn, &e.workspace_name, WorkspaceStatus::OutdatedConflict)?;
            }
            EventKind::WorkspaceWasPublished(e) => {
                switch_content_stream(conn, &e.source_workspace_name, &e.new_source_content_stream_id)?;
                mark_dependents_outdated(conn, &e.source_workspace_name)?;
            }
            EventKind::WorkspaceWasDiscarded(e) => {
                switch_content_stream(conn, &e.workspace_name, &e.new_content_stream_id)?;
                mark_dependents_outdated(conn, &e.workspace_name)?;
            }
            EventKind::WorkspaceWasRemoved(e) => {
                conn.execute(
                    "DELETE FROM cr_workspace WHERE workspace_name = ?",
                    [e.workspace_name.as_str()],
                )?;
            }
            node_event if node_event.is_publishable() => {
                if let Some(id) = envelope.stream_name.strip_prefix("ContentStream:") {
                    conn.execute(
                        "UPDATE cr_workspace SET status = ? WHERE base_workspace_name IN \
                         (SELECT workspace_name FROM cr_workspace WHERE current_content_stream_id = ?)",
                        params![WorkspaceStatus::Outdated.as_str(), id],
                    )?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn insert(
    conn: &Connection,
    name: &WorkspaceName,
    base: Option<&WorkspaceName>,
    title: &str,
    description: &str,
    content_stream_id: &ContentStreamId,
) -> Result<()> {
    conn.execute(
        &format!("INSERT INTO cr_workspace ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"),
        params![
            name.as_str(),
            base.map(|b| b.as_str()),
            title,
            description,
            content_stream_id.as_str(),
            WorkspaceStatus::UpToDate.as_str(),
        ],
    )?;
    Ok(())
}

fn switch_content_stream(conn: &Connection, name: &WorkspaceName, content_stream_id: &ContentStreamId) -> Result<()> {
    conn.execute(
        "UPDATE cr_workspace SET current_content_stream_id = ?, status = ? WHERE workspace_name = ?",
        params![
            content_stream_id.as_str(),
            WorkspaceStatus::UpToDate.as_str(),
            name.as_str()
        ],
    )?;
    Ok(())
}

fn set_status(conn: &Connection, name: &WorkspaceName, status: WorkspaceStatus) -> Result<()> {
    conn.execute(
        "UPDATE cr_workspace SET status = ? WHERE workspace_name = ?",
        params![status.as_str(), name.as_str()],
    )?;
    Ok(())
}

fn mark_dependents_outdated(conn: &Connection, base: &WorkspaceName) -> Result<()> {
    conn.execute(
        "UPDATE cr_workspace SET status = ? WHERE base_workspace_name = ?",
        params![WorkspaceStatus::Outdated.as_str(), base.as_str()],
    )?;
    Ok(())
}

// =============================================================================
// Finder
// =============================================================================

/// Read access to the workspace projection.
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceFinder<'a> {
    conn: &'a Connection,
}

impl<'a> WorkspaceFinder<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn find_by_name(&self, name: &WorkspaceName) -> Result<Option<Workspace>> {
        let sql = format!("SELECT {COLUMNS} FROM cr_workspace WHERE workspace_name = ?");
        self.conn
            .query_row(&sql, [name.as_str()], RawWorkspace::from_row)
            .optional()?
            .map(RawWorkspace::into_workspace)
            .transpose()
    }

    pub fn find_by_current_content_stream_id(&self, content_stream_id: &ContentStreamId) -> Result<Option<Workspace>> {
        let sql = format!("SELECT {COLUMNS} FROM cr_workspace WHERE current_content_stream_id = ?");
        self.conn
            .query_row(&sql, [content_stream_id.as_str()], RawWorkspace::from_row)
            .optional()?
            .map(RawWorkspace::into_workspace)
            .transpose()
    }

    /// Workspaces whose base is `base`.
    pub fn find_dependents(&self, base: &WorkspaceName) -> Result<Vec<Workspace>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM cr_workspace WHERE base_workspace_name = ? ORDER BY workspace_name"),
            [base.as_str()],
        )
    }

    pub fn find_all(&self) -> Result<Vec<Workspace>> {
        self.query(&format!("SELECT {COLUMNS} FROM cr_workspace ORDER BY workspace_name"), [])
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Workspace>> {
        let mut stmt = self.conn.prepare(sql)?;
        let raw = stmt
            .query_map(params, RawWorkspace::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter().map(RawWorkspace::into_workspace).collect()
    }
}

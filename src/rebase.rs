//! # Workspace Publishing and Rebase
//!
//! A workspace writes to its own content stream, forked from the base
//! workspace's stream. This module moves changes between the two:
//!
//! ```text
//!   publish:  user cs ──(copy publishable events)──► live cs, fork live cs ──► new user cs
//!   rebase:   fork live cs ──► candidate cs, replay the user's commands on it
//!   discard:  fork live cs ──► new user cs (old changes dropped)
//! ```
//!
//! ## Rebase
//!
//! Every node command stored itself in the metadata of its first event, so
//! the commands of a workspace can be read back from its stream and
//! re-issued against a fresh fork of the base. Commands run in their
//! original order; a command that depends on a skipped one fails on its own
//! constraint checks and is recorded too.
//!
//! | Strategy | Some commands fail |
//! |----------|--------------------|
//! | `Fail` | Candidate stream removed, workspace keeps its stream, [`Error::WorkspaceRebaseFailed`] |
//! | `Force` | Workspace switches to the candidate; failures are in the statistics |
//!
//! ## Publish
//!
//! The source stream is closed while its events are copied, so nothing can
//! be written to it in between. The copy is appended to the base stream with
//! the base version recorded at fork time as expected version. If the base
//! moved on, the append fails, the source is reopened and the caller gets
//! [`Error::BaseWorkspaceHasBeenModifiedInTheMeantime`].
//!
//! Both commands check up front that the id of the stream they will create
//! is unused. Any failure after the source was closed reopens it, and a
//! rebase also removes its candidate stream.

use std::fmt;

use tracing::{info, warn};

use crate::command_handler::CommandResult;
use crate::commands::{
    CloseContentStream, Command, DeleteWorkspace, DiscardWorkspace, ForkContentStream, PublishWorkspace,
    RebaseErrorHandlingStrategy, RebaseWorkspace, ReopenContentStream,
};
use crate::error::{Error, Result};
use crate::event_store::{ExpectedVersion, NewEvent, StreamName};
use crate::events::{
    EventKind, EventMetadata, WorkspaceRebaseFailed, WorkspaceWasDiscarded, WorkspaceWasPublished,
    WorkspaceWasRebased, WorkspaceWasRemoved,
};
use crate::projection::workspace::Workspace;
use crate::repository::ContentRepository;
use crate::types::{ContentStreamId, ContentStreamStatus, SequenceNumber, Version};

// =============================================================================
// Rebase Outcome Types
// =============================================================================

/// A command that could not be replayed onto the new base.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandThatFailedDuringRebase {
    /// Zero-based position of the command in the replayed list
    pub command_index: usize,
    /// Sequence number of the event that recorded the command
    pub sequence_number: SequenceNumber,
    pub command: Command,
    /// [`Error::kind`] of the failure
    pub error_kind: String,
    pub error_message: String,
}

/// Every command that failed during one rebase, in replay order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandsThatFailedDuringRebase(Vec<CommandThatFailedDuringRebase>);

impl CommandsThatFailedDuringRebase {
    pub fn new(failures: Vec<CommandThatFailedDuringRebase>) -> Self {
        Self(failures)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandThatFailedDuringRebase> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CommandsThatFailedDuringRebase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} command(s) failed", self.0.len())?;
        for failure in &self.0 {
            write!(
                f,
                "; #{} {} (event {}): {}",
                failure.command_index,
                failure.command.type_name(),
                failure.sequence_number,
                failure.error_message
            )?;
        }
        Ok(())
    }
}

/// One failed command in the rebase statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebaseErrorEntry {
    /// Zero-based position of the command in the replayed list
    pub command_index: usize,
    pub message: String,
    pub cause_class: String,
    pub cause_message: String,
}

/// What a rebase did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceRebaseStatistics {
    pub total_number_of_applied_commands: usize,
    pub errors: Vec<RebaseErrorEntry>,
}

impl WorkspaceRebaseStatistics {
    /// Applied plus failed commands.
    pub fn total_number_of_replayed_commands(&self) -> usize {
        self.total_number_of_applied_commands + self.errors.len()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Errors that abort a rebase instead of being recorded as a failed command.
fn is_infrastructure_error(error: &Error) -> bool {
    matches!(
        error,
        Error::Sqlite(_) | Error::Json(_) | Error::Schema(_) | Error::ProjectionConsistencyViolation(_)
    )
}

// =============================================================================
// Workspace Commands
// =============================================================================

impl ContentRepository {
    pub(crate) fn publish_workspace(&mut self, command: PublishWorkspace) -> Result<CommandResult> {
        let workspace = self.require_workspace(&command.workspace_name)?;
        let base = self.require_base_workspace(&workspace)?;
        let source_id = workspace.current_content_stream_id.clone();
        let base_id = base.current_content_stream_id.clone();
        let source = self.require_content_stream(&source_id)?;
        self.require_unused_content_stream_id(&command.new_content_stream_id)?;

        let mut fork_version = None;
        let mut to_publish = Vec::new();
        for envelope in self.read_stream(&StreamName::for_content_stream(&source_id))? {
            let event = EventKind::from_envelope(&envelope)?;
            if let EventKind::ContentStreamWasForked(forked) = &event {
                fork_version = Some(forked.version_of_source_content_stream);
            } else if let Some(copy) = event.with_content_stream_id(&base_id) {
                let metadata = EventMetadata::from_envelope(&envelope)?;
                to_publish.push(copy.to_new_event(metadata.as_ref())?);
            }
        }

        let fork_version = match fork_version {
            Some(version) if source.source_content_stream_id.as_ref() == Some(&base_id) => version,
            version => {
                return Err(Error::BaseWorkspaceHasBeenModifiedInTheMeantime {
                    content_stream_id: base_id.to_string(),
                    expected_version: version.map_or(0, |v| v.as_raw()),
                })
            }
        };

        self.handle(
            CloseContentStream {
                content_stream_id: source_id.clone(),
            }
            .into(),
        )?;

        // From here on the source is closed; every failure reopens it.
        let published = self.publish_closed_stream(&command, &base, &source_id, to_publish, fork_version);
        let last = match published {
            Ok(last) => last,
            Err(error) => {
                self.roll_back(&source_id, source.status, None);
                return Err(error);
            }
        };
        info!(
            workspace = %command.workspace_name,
            base = %base.workspace_name,
            "workspace published"
        );
        Ok(CommandResult::new(last))
    }

    fn publish_closed_stream(
        &mut self,
        command: &PublishWorkspace,
        base: &Workspace,
        source_id: &ContentStreamId,
        to_publish: Vec<NewEvent>,
        fork_version: Version,
    ) -> Result<SequenceNumber> {
        let base_id = &base.current_content_stream_id;
        if !to_publish.is_empty() {
            self.commit(
                &StreamName::for_content_stream(base_id),
                to_publish,
                ExpectedVersion::Exact(fork_version),
            )
            .map_err(|error| match error {
                Error::Conflict { .. } => Error::BaseWorkspaceHasBeenModifiedInTheMeantime {
                    content_stream_id: base_id.to_string(),
                    expected_version: fork_version.as_raw(),
                },
                other => other,
            })?;
        }

        self.fork(&command.new_content_stream_id, base_id)?;
        self.commit(
            &StreamName::for_workspace(&command.workspace_name),
            vec![EventKind::from(WorkspaceWasPublished {
                source_workspace_name: command.workspace_name.clone(),
                target_workspace_name: base.workspace_name.clone(),
                new_source_content_stream_id: command.new_content_stream_id.clone(),
                previous_source_content_stream_id: source_id.clone(),
            })
            .to_new_event(None)?],
            ExpectedVersion::Any,
        )
    }

    pub(crate) fn rebase_workspace(&mut self, command: RebaseWorkspace) -> Result<CommandResult> {
        let workspace = self.require_workspace(&command.workspace_name)?;
        let base = self.require_base_workspace(&workspace)?;
        let previous_id = workspace.current_content_stream_id.clone();
        let candidate_id = command.rebased_content_stream_id.clone();
        let previous = self.require_content_stream(&previous_id)?;
        self.require_unused_content_stream_id(&candidate_id)?;
        let commands = self.rebasable_commands(&previous_id)?;

        self.handle(
            CloseContentStream {
                content_stream_id: previous_id.clone(),
            }
            .into(),
        )?;

        let replayed = self.replay_onto_candidate(&candidate_id, &base.current_content_stream_id, commands);
        let (statistics, failures) = match replayed {
            Ok(outcome) => outcome,
            Err(error) => {
                self.roll_back(&previous_id, previous.status, Some(&candidate_id));
                return Err(error);
            }
        };

        let workspace_stream = StreamName::for_workspace(&command.workspace_name);
        if failures.is_empty() || command.rebase_error_handling_strategy == RebaseErrorHandlingStrategy::Force {
            let rebased = self.commit(
                &workspace_stream,
                vec![EventKind::from(WorkspaceWasRebased {
                    workspace_name: command.workspace_name.clone(),
                    new_content_stream_id: candidate_id.clone(),
                    previous_content_stream_id: previous_id.clone(),
                })
                .to_new_event(None)?],
                ExpectedVersion::Any,
            );
            let last = match rebased {
                Ok(last) => last,
                Err(error) => {
                    self.roll_back(&previous_id, previous.status, Some(&candidate_id));
                    return Err(error);
                }
            };
            info!(
                workspace = %command.workspace_name,
                applied = statistics.total_number_of_applied_commands,
                failed = statistics.errors.len(),
                "workspace rebased"
            );
            return Ok(CommandResult {
                last_sequence_number: last,
                rebase_statistics: Some(statistics),
            });
        }

        self.reopen(&previous_id, previous.status)?;
        self.commit(
            &workspace_stream,
            vec![EventKind::from(WorkspaceRebaseFailed {
                workspace_name: command.workspace_name.clone(),
                candidate_content_stream_id: candidate_id.clone(),
                previous_content_stream_id: previous_id,
            })
            .to_new_event(None)?],
            ExpectedVersion::Any,
        )?;
        self.remove_content_stream(&candidate_id)?;
        warn!(
            workspace = %command.workspace_name,
            failed = failures.len(),
            "workspace rebase failed, keeping the previous content stream"
        );
        Err(Error::WorkspaceRebaseFailed(CommandsThatFailedDuringRebase::new(failures)))
    }

    /// Forks the base into the candidate stream and handles every command
    /// again on it. Infrastructure errors abort the replay.
    fn replay_onto_candidate(
        &mut self,
        candidate_id: &ContentStreamId,
        base_id: &ContentStreamId,
        commands: Vec<(SequenceNumber, Command)>,
    ) -> Result<(WorkspaceRebaseStatistics, Vec<CommandThatFailedDuringRebase>)> {
        self.fork(candidate_id, base_id)?;

        let mut statistics = WorkspaceRebaseStatistics::default();
        let mut failures = Vec::new();
        for (command_index, (sequence_number, original)) in commands.into_iter().enumerate() {
            match self.handle(original.with_content_stream_id(candidate_id)) {
                Ok(_) => statistics.total_number_of_applied_commands += 1,
                Err(error) if is_infrastructure_error(&error) => return Err(error),
                Err(error) => {
                    statistics.errors.push(RebaseErrorEntry {
                        command_index,
                        message: format!("the command {} could not be rebased", original.type_name()),
                        cause_class: error.kind().to_string(),
                        cause_message: error.to_string(),
                    });
                    failures.push(CommandThatFailedDuringRebase {
                        command_index,
                        sequence_number,
                        command: original,
                        error_kind: error.kind().to_string(),
                        error_message: error.to_string(),
                    });
                }
            }
        }
        Ok((statistics, failures))
    }

    pub(crate) fn discard_workspace(&mut self, command: DiscardWorkspace) -> Result<CommandResult> {
        let workspace = self.require_workspace(&command.workspace_name)?;
        let base = self.require_base_workspace(&workspace)?;

        self.fork(&command.new_content_stream_id, &base.current_content_stream_id)?;
        let last = self.commit(
            &StreamName::for_workspace(&command.workspace_name),
            vec![EventKind::from(WorkspaceWasDiscarded {
                workspace_name: command.workspace_name.clone(),
                new_content_stream_id: command.new_content_stream_id.clone(),
                previous_content_stream_id: workspace.current_content_stream_id,
            })
            .to_new_event(None)?],
            ExpectedVersion::Any,
        )?;
        Ok(CommandResult::new(last))
    }

    pub(crate) fn delete_workspace(&mut self, command: DeleteWorkspace) -> Result<CommandResult> {
        let workspace = self.require_workspace(&command.workspace_name)?;

        self.remove_content_stream(&workspace.current_content_stream_id)?;
        let last = self.commit(
            &StreamName::for_workspace(&command.workspace_name),
            vec![EventKind::from(WorkspaceWasRemoved {
                workspace_name: command.workspace_name.clone(),
            })
            .to_new_event(None)?],
            ExpectedVersion::Any,
        )?;
        Ok(CommandResult::new(last))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// The node commands recorded in a content stream, in append order.
    fn rebasable_commands(&self, content_stream_id: &ContentStreamId) -> Result<Vec<(SequenceNumber, Command)>> {
        let mut commands = Vec::new();
        for envelope in self.read_stream(&StreamName::for_content_stream(content_stream_id))? {
            let Some(metadata) = EventMetadata::from_envelope(&envelope)? else {
                continue;
            };
            let command = Command::from_metadata(&metadata)?;
            if command.is_rebasable() {
                commands.push((envelope.sequence_number, command));
            }
        }
        Ok(commands)
    }

    fn require_unused_content_stream_id(&self, content_stream_id: &ContentStreamId) -> Result<()> {
        if self.content_streams().find_by_id(content_stream_id)?.is_some() {
            return Err(Error::ContentStreamAlreadyExists(content_stream_id.to_string()));
        }
        Ok(())
    }

    /// Undoes a half-done publish or rebase: reopens the workspace's stream
    /// and removes the candidate if it was created. Failures here are logged,
    /// the caller returns the error that caused the roll back.
    fn roll_back(
        &mut self,
        content_stream_id: &ContentStreamId,
        previous_state: ContentStreamStatus,
        candidate: Option<&ContentStreamId>,
    ) {
        if let Err(error) = self.reopen(content_stream_id, previous_state) {
            warn!(content_stream_id = %content_stream_id, error = %error, "could not reopen content stream");
        }
        let Some(candidate) = candidate else {
            return;
        };
        if self.require_content_stream(candidate).is_ok() {
            if let Err(error) = self.remove_content_stream(candidate) {
                warn!(content_stream_id = %candidate, error = %error, "could not remove candidate content stream");
            }
        }
    }

    fn fork(&mut self, content_stream_id: &ContentStreamId, source: &ContentStreamId) -> Result<CommandResult> {
        self.handle(
            ForkContentStream {
                content_stream_id: content_stream_id.clone(),
                source_content_stream_id: source.clone(),
            }
            .into(),
        )
    }

    fn reopen(&mut self, content_stream_id: &ContentStreamId, previous_state: ContentStreamStatus) -> Result<CommandResult> {
        self.handle(
            ReopenContentStream {
                content_stream_id: content_stream_id.clone(),
                previous_state,
            }
            .into(),
        )
    }
}

//! Sync run lifecycle
//!
//! The transition table is a pure function over [`SyncRunStatus`].
//! [`Lifecycle`] applies transitions to stored runs with an optimistic
//! version check, then dispatches notifications once the change is
//! committed.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};

use super::notify::{Notifier, select_notice};
use crate::error::SyncError;
use crate::models::{SyncRun, SyncRunId, SyncRunStatus};
use crate::storage::{Scope, StaleRunError, StatusUpdate, SyncStore};

/// Events that drive a run between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunEvent {
    Start,
    Query,
    Queue,
    Progress,
    Complete,
    Abort,
    Cancel,
    Pause,
    Resume,
}

impl RunEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEvent::Start => "start",
            RunEvent::Query => "query",
            RunEvent::Queue => "queue",
            RunEvent::Progress => "progress",
            RunEvent::Complete => "complete",
            RunEvent::Abort => "abort",
            RunEvent::Cancel => "cancel",
            RunEvent::Pause => "pause",
            RunEvent::Resume => "resume",
        }
    }
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event was fired from a state that does not accept it
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot {event} a sync run in state {from}")]
pub struct InvalidTransition {
    pub from: SyncRunStatus,
    pub event: RunEvent,
}

/// The state `event` moves a run in state `from` to
pub fn next_status(from: SyncRunStatus, event: RunEvent) -> Result<SyncRunStatus, InvalidTransition> {
    use SyncRunStatus::*;

    let to = match (event, from) {
        (RunEvent::Start, Pending) => Started,
        (RunEvent::Query, Started) => Querying,
        (RunEvent::Queue, Querying) => Queued,
        (RunEvent::Progress, Queued) => InProgress,
        (RunEvent::Complete, InProgress) => Success,
        (RunEvent::Abort, Pending | Started | Querying | Queued | InProgress | Paused) => Failed,
        (RunEvent::Cancel, Pending | Started | Querying | Queued | InProgress | Paused) => Canceled,
        (RunEvent::Pause, Started | Querying | Queued | InProgress) => Paused,
        (RunEvent::Resume, Paused) => Pending,
        _ => return Err(InvalidTransition { from, event }),
    };
    Ok(to)
}

/// Applies transitions to stored runs
pub struct Lifecycle {
    store: Arc<dyn SyncStore>,
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn SyncStore>,
        notifier: Arc<dyn Notifier>,
        recipients: Vec<String>,
    ) -> Self {
        Self {
            store,
            notifier,
            recipients,
        }
    }

    /// Fire `event` on a run
    ///
    /// # Errors
    /// - [`SyncError::InvalidTransition`] if the current state rejects the event
    /// - [`SyncError::ConcurrentTransition`] if another transition committed first
    pub fn fire(&self, run_id: SyncRunId, event: RunEvent) -> Result<SyncRun, SyncError> {
        self.transition(run_id, event, None)
    }

    /// Abort a run, recording why
    pub fn fail(&self, run_id: SyncRunId, error: impl Into<String>) -> Result<SyncRun, SyncError> {
        self.transition(run_id, RunEvent::Abort, Some(error.into()))
    }

    fn transition(
        &self,
        run_id: SyncRunId,
        event: RunEvent,
        error: Option<String>,
    ) -> Result<SyncRun, SyncError> {
        let run = self
            .store
            .get_run(run_id, Scope::Kept)?
            .ok_or_else(|| SyncError::not_found(format!("sync run {run_id}")))?;

        let to = next_status(run.status, event)?;
        let now = Utc::now();

        let update = StatusUpdate {
            run_id,
            expected_version: run.lock_version,
            status: to,
            started_at: (event == RunEvent::Start).then_some(now),
            finished_at: to.is_terminal().then_some(now),
            error,
            updated_at: now,
        };

        let updated = self.store.update_run_status(update).map_err(|e| {
            if e.downcast_ref::<StaleRunError>().is_some() {
                SyncError::ConcurrentTransition(run_id)
            } else {
                SyncError::Storage(e)
            }
        })?;

        info!("Sync run {}: {} -> {} ({})", run_id, run.status, to, event);

        if matches!(to, SyncRunStatus::Success | SyncRunStatus::Failed) {
            self.dispatch(&updated);
        }

        Ok(updated)
    }

    /// Send the terminal notice; failures never touch the committed run
    fn dispatch(&self, run: &SyncRun) {
        let Some(notice) = select_notice(run, &self.recipients) else {
            return;
        };

        if let Err(e) = self.notifier.notify(&notice) {
            warn!(
                "Failed to send '{}' notice for sync run {}: {:#}",
                notice.kind.subject(),
                run.id,
                e
            );
        }
    }
}

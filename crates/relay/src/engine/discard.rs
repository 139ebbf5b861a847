//! Sync discard propagation
//!
//! Discarding a sync soft-deletes it and every run it owns. Tracked records
//! survive; they only lose their link to the discarded runs.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};

use super::lifecycle::{Lifecycle, RunEvent};
use crate::error::SyncError;
use crate::models::{SyncId, SyncRunStatus};
use crate::storage::{DiscardOutcome, Scope, SyncStore};

pub struct DiscardPropagator {
    store: Arc<dyn SyncStore>,
    lifecycle: Arc<Lifecycle>,
}

impl DiscardPropagator {
    pub fn new(store: Arc<dyn SyncStore>, lifecycle: Arc<Lifecycle>) -> Self {
        Self { store, lifecycle }
    }

    /// Discard a kept sync
    ///
    /// Open runs are canceled first so their executors stop at the next
    /// chunk boundary.
    pub fn discard(&self, sync_id: SyncId) -> Result<DiscardOutcome, SyncError> {
        if self.store.get_sync(sync_id, Scope::Kept)?.is_none() {
            return Err(SyncError::not_found(format!("sync {sync_id}")));
        }

        for run in self.store.list_runs(sync_id, Scope::Kept)? {
            if !(run.status.is_active() || run.status == SyncRunStatus::Paused) {
                continue;
            }
            match self.lifecycle.fire(run.id, RunEvent::Cancel) {
                Ok(_) => {}
                // Finished on its own in the meantime
                Err(SyncError::InvalidTransition(_) | SyncError::ConcurrentTransition(_)) => {
                    debug!("Sync run {} settled before it could be canceled", run.id);
                }
                Err(e) => return Err(e),
            }
        }

        let outcome = self.store.discard_sync(sync_id, Utc::now())?;
        info!(
            "Discarded sync {} ({} runs, {} records detached)",
            sync_id,
            outcome.discarded_runs.len(),
            outcome.detached_records
        );
        Ok(outcome)
    }
}

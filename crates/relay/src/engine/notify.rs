//! Post-transition run notifications
//!
//! Picks which notice a terminal run deserves. Delivery is left to a
//! [`Notifier`] implementation.

use std::sync::RwLock;

use anyhow::{Result, anyhow};
use log::info;
use serde::Serialize;

use crate::models::{SyncId, SyncRun, SyncRunId, SyncRunStatus};

/// Which notice a run produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Success,
    Failure,
    /// The run succeeded but some chunks failed to write
    RowFailure,
}

impl NoticeKind {
    pub fn subject(&self) -> &'static str {
        match self {
            NoticeKind::Success => "Sync run success",
            NoticeKind::Failure => "Sync run failed",
            NoticeKind::RowFailure => "Sync completed with failed rows",
        }
    }
}

/// Payload handed to a [`Notifier`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunNotice {
    pub kind: NoticeKind,
    pub sync_id: SyncId,
    pub sync_run_id: SyncRunId,
    pub successful_rows: u64,
    pub failed_rows: u64,
    pub recipients: Vec<String>,
    /// Extraction error, for failure notices
    pub error: Option<String>,
}

/// Select the notice for a run, if its status warrants one
///
/// Only `success` and `failed` notify. A successful run with failed rows
/// gets the row-failure variant.
pub fn select_notice(run: &SyncRun, recipients: &[String]) -> Option<RunNotice> {
    let kind = match run.status {
        SyncRunStatus::Failed => NoticeKind::Failure,
        SyncRunStatus::Success if run.failed_rows > 0 => NoticeKind::RowFailure,
        SyncRunStatus::Success => NoticeKind::Success,
        _ => return None,
    };

    Some(RunNotice {
        kind,
        sync_id: run.sync_id,
        sync_run_id: run.id,
        successful_rows: run.successful_rows,
        failed_rows: run.failed_rows,
        recipients: recipients.to_vec(),
        error: run.error.clone(),
    })
}

/// Delivers run notices
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &RunNotice) -> Result<()>;
}

/// Writes notices to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: &RunNotice) -> Result<()> {
        info!(
            "{}: sync {} run {} ({} successful, {} failed) to [{}]",
            notice.kind.subject(),
            notice.sync_id,
            notice.sync_run_id,
            notice.successful_rows,
            notice.failed_rows,
            notice.recipients.join(", ")
        );
        Ok(())
    }
}

/// Keeps delivered notices in memory
///
/// Useful for tests. Can be switched to fail every delivery.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    notices: RwLock<Vec<RunNotice>>,
    failing: RwLock<bool>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent delivery fail (notices are still recorded)
    pub fn set_failing(&self, failing: bool) {
        *self.failing.write().unwrap() = failing;
    }

    pub fn notices(&self) -> Vec<RunNotice> {
        self.notices.read().unwrap().clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notice: &RunNotice) -> Result<()> {
        self.notices.write().unwrap().push(notice.clone());
        if *self.failing.read().unwrap() {
            return Err(anyhow!("mail transport unreachable"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(status: SyncRunStatus, successful: u64, failed: u64) -> SyncRun {
        let mut run: SyncRun = serde_json::from_value(serde_json::json!({
            "id": 7, "sync_id": 3, "status": "pending", "sync_run_type": "general",
            "total_query_rows": 0, "total_rows": 0, "successful_rows": 0, "failed_rows": 0,
            "workspace_id": 1, "source_id": 1, "destination_id": 2, "model_id": 1,
            "error": null, "started_at": null, "finished_at": null,
            "created_at": "2024-01-01T00:00:00Z", "updated_at": "2024-01-01T00:00:00Z",
            "discarded_at": null, "lock_version": 0
        }))
        .unwrap();
        run.status = status;
        run.successful_rows = successful;
        run.failed_rows = failed;
        run.total_rows = successful + failed;
        run
    }

    #[test]
    fn test_select_notice_variants() {
        let recipients = vec!["ops@example.com".to_string()];

        let notice = select_notice(&run_with(SyncRunStatus::Success, 25, 0), &recipients).unwrap();
        assert_eq!(notice.kind, NoticeKind::Success);
        assert_eq!(notice.recipients, recipients);

        let notice = select_notice(&run_with(SyncRunStatus::Success, 15, 10), &recipients).unwrap();
        assert_eq!(notice.kind, NoticeKind::RowFailure);
        assert_eq!(notice.kind.subject(), "Sync completed with failed rows");

        let notice = select_notice(&run_with(SyncRunStatus::Failed, 0, 0), &recipients).unwrap();
        assert_eq!(notice.kind, NoticeKind::Failure);
    }

    #[test]
    fn test_select_notice_skips_non_notifying_states() {
        for status in [
            SyncRunStatus::Pending,
            SyncRunStatus::InProgress,
            SyncRunStatus::Paused,
            SyncRunStatus::Canceled,
        ] {
            assert!(select_notice(&run_with(status, 1, 1), &[]).is_none());
        }
    }

    #[test]
    fn test_memory_notifier_failing() {
        let notifier = MemoryNotifier::new();
        let notice = select_notice(&run_with(SyncRunStatus::Success, 1, 0), &[]).unwrap();

        assert!(notifier.notify(&notice).is_ok());
        notifier.set_failing(true);
        assert!(notifier.notify(&notice).is_err());
        assert_eq!(notifier.notices().len(), 2);
    }
}

//! Storage trait definitions

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{
    Connector, ConnectorId, Model, ModelId, RunCounters, SyncDefinition, SyncId, SyncRecord,
    SyncRun, SyncRunId, SyncRunStatus,
};

/// Which rows a query sees with respect to soft deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// Only rows that are not discarded
    #[default]
    Kept,
    /// Discarded and kept rows alike
    WithDiscarded,
    /// Only discarded rows
    DiscardedOnly,
}

impl Scope {
    /// Whether a row with the given discard timestamp is visible
    pub fn includes(&self, discarded_at: Option<DateTime<Utc>>) -> bool {
        match self {
            Scope::Kept => discarded_at.is_none(),
            Scope::WithDiscarded => true,
            Scope::DiscardedOnly => discarded_at.is_some(),
        }
    }

    /// SQL predicate on a `discarded_at` column
    pub(crate) fn sql_filter(&self) -> &'static str {
        match self {
            Scope::Kept => "discarded_at IS NULL",
            Scope::WithDiscarded => "1 = 1",
            Scope::DiscardedOnly => "discarded_at IS NOT NULL",
        }
    }
}

/// Error indicating a status update lost an optimistic version check
#[derive(Debug, thiserror::Error)]
#[error("Sync run {run_id} changed since version {expected_version}")]
pub struct StaleRunError {
    pub run_id: SyncRunId,
    pub expected_version: u64,
}

/// A compare-and-swap status change for one run
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub run_id: SyncRunId,
    /// `lock_version` the caller read; the update fails if it moved
    pub expected_version: u64,
    pub status: SyncRunStatus,
    /// Set only when `Some`
    pub started_at: Option<DateTime<Utc>>,
    /// Set only when `Some`
    pub finished_at: Option<DateTime<Utc>>,
    /// Set only when `Some`
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// What a sync discard touched
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscardOutcome {
    pub sync_id: Option<SyncId>,
    pub discarded_runs: Vec<SyncRunId>,
    /// Records whose `sync_run_id` was cleared
    pub detached_records: usize,
}

/// Trait for sync storage operations
///
/// Abstracts over the in-memory and SQLite backends. Every method is
/// atomic with respect to the others on the same store.
pub trait SyncStore: Send + Sync {
    // === Connectors and models ===

    /// Insert a connector, returning it with its assigned id
    fn insert_connector(&self, connector: Connector) -> Result<Connector>;

    fn get_connector(&self, id: ConnectorId) -> Result<Option<Connector>>;

    /// Insert a model, returning it with its assigned id
    fn insert_model(&self, model: Model) -> Result<Model>;

    fn get_model(&self, id: ModelId) -> Result<Option<Model>>;

    // === Syncs ===

    /// Insert a sync, returning it with its assigned id
    fn insert_sync(&self, sync: SyncDefinition) -> Result<SyncDefinition>;

    /// Overwrite a kept sync's definition
    fn update_sync(&self, sync: &SyncDefinition) -> Result<()>;

    fn get_sync(&self, id: SyncId, scope: Scope) -> Result<Option<SyncDefinition>>;

    /// List syncs ordered by id
    fn list_syncs(&self, scope: Scope) -> Result<Vec<SyncDefinition>>;

    /// Store the incremental watermark without touching other fields
    fn set_current_cursor(&self, id: SyncId, cursor: Option<&str>) -> Result<()>;

    // === Runs ===

    /// Insert a run, returning it with its assigned id
    fn insert_run(&self, run: SyncRun) -> Result<SyncRun>;

    fn get_run(&self, id: SyncRunId, scope: Scope) -> Result<Option<SyncRun>>;

    /// List a sync's runs ordered by id (oldest first)
    fn list_runs(&self, sync_id: SyncId, scope: Scope) -> Result<Vec<SyncRun>>;

    /// Kept runs whose status is active (pending through in_progress)
    fn list_active_runs(&self) -> Result<Vec<SyncRun>>;

    /// Apply a status change if `lock_version` still matches
    ///
    /// # Errors
    /// Returns [`StaleRunError`] if the version moved, so callers can
    /// downcast and report a concurrent transition.
    fn update_run_status(&self, update: StatusUpdate) -> Result<SyncRun>;

    /// Overwrite a run's row counters (does not bump `lock_version`)
    fn update_run_counters(&self, id: SyncRunId, counters: &RunCounters) -> Result<()>;

    // === Records ===

    /// Insert or replace the record keyed by `(sync_id, primary_key)`
    fn upsert_sync_record(&self, record: SyncRecord) -> Result<()>;

    fn find_sync_record(&self, sync_id: SyncId, primary_key: &str) -> Result<Option<SyncRecord>>;

    /// List a sync's records ordered by primary key
    fn list_sync_records(&self, sync_id: SyncId) -> Result<Vec<SyncRecord>>;

    // === Discard ===

    /// Discard a sync and its runs, and detach records from those runs
    ///
    /// Runs already discarded keep their original timestamp. A sync that is
    /// missing or already discarded yields an empty outcome.
    fn discard_sync(&self, id: SyncId, at: DateTime<Utc>) -> Result<DiscardOutcome>;
}

//! Sync run: one execution attempt of a sync

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConnectorId, ModelId, SyncDefinition, SyncId};
use crate::error::ParseEnumError;

/// Unique identifier for a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncRunId(pub i64);

impl fmt::Display for SyncRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a run
///
/// See [`crate::engine::next_status`] for the allowed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    #[default]
    Pending,
    Started,
    Querying,
    Queued,
    InProgress,
    Success,
    Paused,
    Failed,
    Canceled,
}

impl SyncRunStatus {
    pub const ALL: [SyncRunStatus; 9] = [
        SyncRunStatus::Pending,
        SyncRunStatus::Started,
        SyncRunStatus::Querying,
        SyncRunStatus::Queued,
        SyncRunStatus::InProgress,
        SyncRunStatus::Success,
        SyncRunStatus::Paused,
        SyncRunStatus::Failed,
        SyncRunStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Pending => "pending",
            SyncRunStatus::Started => "started",
            SyncRunStatus::Querying => "querying",
            SyncRunStatus::Queued => "queued",
            SyncRunStatus::InProgress => "in_progress",
            SyncRunStatus::Success => "success",
            SyncRunStatus::Paused => "paused",
            SyncRunStatus::Failed => "failed",
            SyncRunStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncRunStatus::Success | SyncRunStatus::Failed | SyncRunStatus::Canceled
        )
    }

    /// Non-terminal and not paused
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncRunStatus::Pending
                | SyncRunStatus::Started
                | SyncRunStatus::Querying
                | SyncRunStatus::Queued
                | SyncRunStatus::InProgress
        )
    }
}

impl fmt::Display for SyncRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncRunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncRunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("sync run status", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunType {
    #[default]
    General,
    Test,
}

impl SyncRunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunType::General => "general",
            SyncRunType::Test => "test",
        }
    }
}

impl FromStr for SyncRunType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(SyncRunType::General),
            "test" => Ok(SyncRunType::Test),
            other => Err(ParseEnumError::new("sync run type", other)),
        }
    }
}

/// Row counters owned by the executor while a run is in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total_query_rows: u64,
    pub total_rows: u64,
    pub successful_rows: u64,
    pub failed_rows: u64,
}

/// One execution attempt of a sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: SyncRunId,
    pub sync_id: SyncId,
    pub status: SyncRunStatus,
    pub sync_run_type: SyncRunType,
    pub total_query_rows: u64,
    pub total_rows: u64,
    pub successful_rows: u64,
    pub failed_rows: u64,
    // Copied from the sync at creation so the audit trail survives later edits
    pub workspace_id: i64,
    pub source_id: ConnectorId,
    pub destination_id: ConnectorId,
    pub model_id: ModelId,
    /// Extraction failure message, for failed runs
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub discarded_at: Option<DateTime<Utc>>,
    /// Bumped on every status change; guards concurrent transitions
    pub lock_version: u64,
}

impl SyncRun {
    /// A new pending run for `sync` (id assigned by the store)
    pub fn for_sync(sync: &SyncDefinition, sync_run_type: SyncRunType) -> Self {
        let now = Utc::now();
        Self {
            id: SyncRunId(0),
            sync_id: sync.id,
            status: SyncRunStatus::Pending,
            sync_run_type,
            total_query_rows: 0,
            total_rows: 0,
            successful_rows: 0,
            failed_rows: 0,
            workspace_id: sync.workspace_id,
            source_id: sync.source_id,
            destination_id: sync.destination_id,
            model_id: sync.model_id,
            error: None,
            started_at: None,
            finished_at: None,
            created_at: now,
            updated_at: now,
            discarded_at: None,
            lock_version: 0,
        }
    }

    pub fn counters(&self) -> RunCounters {
        RunCounters {
            total_query_rows: self.total_query_rows,
            total_rows: self.total_rows,
            successful_rows: self.successful_rows,
            failed_rows: self.failed_rows,
        }
    }

    pub fn apply_counters(&mut self, counters: &RunCounters) {
        self.total_query_rows = counters.total_query_rows;
        self.total_rows = counters.total_rows;
        self.successful_rows = counters.successful_rows;
        self.failed_rows = counters.failed_rows;
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded_at.is_some()
    }
}

//! Per-record fingerprints written by the record tracker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{SyncId, SyncRunId};

/// Dedup fingerprint of one written record
///
/// Keyed by `(sync_id, primary_key)`. The link to the run that last wrote
/// it is cleared, not cascaded, when that run is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub sync_id: SyncId,
    pub sync_run_id: Option<SyncRunId>,
    /// Content hash of the record
    pub fingerprint: String,
    /// Value of the model's primary key for this record
    pub primary_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRecord {
    pub fn new(
        sync_id: SyncId,
        sync_run_id: SyncRunId,
        fingerprint: impl Into<String>,
        primary_key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            sync_id,
            sync_run_id: Some(sync_run_id),
            fingerprint: fingerprint.into(),
            primary_key: primary_key.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

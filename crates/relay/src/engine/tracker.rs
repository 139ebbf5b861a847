//! Per-record fingerprints
//!
//! Each successfully written record leaves a [`SyncRecord`] behind, keyed by
//! the model's primary key. Incremental runs can compare against it to skip
//! rows that have not changed since the last write.

use std::sync::Arc;

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::models::{Record, SyncId, SyncRecord, SyncRunId};
use crate::storage::SyncStore;

/// Stable content hash of a record (hex-encoded SHA-256)
///
/// Fields are hashed in name order with length prefixes, so the result
/// does not depend on source column order and distinct records cannot
/// collide by concatenation.
pub fn fingerprint(record: &Record) -> String {
    let mut hasher = Sha256::new();
    for (name, value) in record.fields() {
        let normalized = value.normalized();
        hasher.update((name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());
        hasher.update((normalized.len() as u64).to_le_bytes());
        hasher.update(normalized.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Primary key text of a record, if the field is present and not null
pub fn primary_key_of(record: &Record, primary_key_field: &str) -> Option<String> {
    record
        .get(primary_key_field)
        .filter(|v| !v.is_null())
        .map(|v| v.to_string())
}

/// Persists fingerprints for written records
pub struct RecordTracker {
    store: Arc<dyn SyncStore>,
}

impl RecordTracker {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Fingerprint `record` and store it against `sync_run_id`
    ///
    /// Records without a usable primary key are keyed by their fingerprint.
    pub fn record(
        &self,
        sync_id: SyncId,
        sync_run_id: SyncRunId,
        record: &Record,
        primary_key_field: &str,
    ) -> Result<String> {
        let fingerprint = fingerprint(record);
        let primary_key =
            primary_key_of(record, primary_key_field).unwrap_or_else(|| fingerprint.clone());

        self.store.upsert_sync_record(SyncRecord::new(
            sync_id,
            sync_run_id,
            fingerprint.clone(),
            primary_key,
        ))?;
        Ok(fingerprint)
    }

    /// Whether the stored fingerprint for this record's key matches its content
    pub fn is_unchanged(
        &self,
        sync_id: SyncId,
        record: &Record,
        primary_key_field: &str,
    ) -> Result<bool> {
        let fingerprint = fingerprint(record);
        let primary_key =
            primary_key_of(record, primary_key_field).unwrap_or_else(|| fingerprint.clone());

        Ok(self
            .store
            .find_sync_record(sync_id, &primary_key)?
            .is_some_and(|existing| existing.fingerprint == fingerprint))
    }
}

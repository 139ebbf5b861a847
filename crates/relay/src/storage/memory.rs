//! In-memory storage implementation
//!
//! Used by tests and dry runs. Each table is a map behind its own RwLock;
//! operations spanning tables take the locks in a fixed order
//! (syncs, runs, records).

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{DiscardOutcome, Scope, StaleRunError, StatusUpdate, SyncStore};
use crate::models::{
    Connector, ConnectorId, Model, ModelId, RunCounters, SyncDefinition, SyncId, SyncRecord,
    SyncRun, SyncRunId,
};

/// In-memory implementation of SyncStore
pub struct InMemorySyncStore {
    next_id: AtomicI64,
    connectors: RwLock<HashMap<ConnectorId, Connector>>,
    models: RwLock<HashMap<ModelId, Model>>,
    syncs: RwLock<BTreeMap<SyncId, SyncDefinition>>,
    runs: RwLock<BTreeMap<SyncRunId, SyncRun>>,
    /// Keyed by (sync_id, primary_key)
    records: RwLock<BTreeMap<(SyncId, String), SyncRecord>>,
}

impl InMemorySyncStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            connectors: RwLock::new(HashMap::new()),
            models: RwLock::new(HashMap::new()),
            syncs: RwLock::new(BTreeMap::new()),
            runs: RwLock::new(BTreeMap::new()),
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Ids are unique across all tables, which keeps test output unambiguous
    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for InMemorySyncStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncStore for InMemorySyncStore {
    fn insert_connector(&self, mut connector: Connector) -> Result<Connector> {
        connector.id = ConnectorId(self.allocate_id());
        let mut connectors = self.connectors.write().unwrap();
        connectors.insert(connector.id, connector.clone());
        Ok(connector)
    }

    fn get_connector(&self, id: ConnectorId) -> Result<Option<Connector>> {
        let connectors = self.connectors.read().unwrap();
        Ok(connectors.get(&id).cloned())
    }

    fn insert_model(&self, mut model: Model) -> Result<Model> {
        model.id = ModelId(self.allocate_id());
        let mut models = self.models.write().unwrap();
        models.insert(model.id, model.clone());
        Ok(model)
    }

    fn get_model(&self, id: ModelId) -> Result<Option<Model>> {
        let models = self.models.read().unwrap();
        Ok(models.get(&id).cloned())
    }

    fn insert_sync(&self, mut sync: SyncDefinition) -> Result<SyncDefinition> {
        sync.id = SyncId(self.allocate_id());
        let mut syncs = self.syncs.write().unwrap();
        syncs.insert(sync.id, sync.clone());
        Ok(sync)
    }

    fn update_sync(&self, sync: &SyncDefinition) -> Result<()> {
        let mut syncs = self.syncs.write().unwrap();
        match syncs.get_mut(&sync.id) {
            Some(existing) if !existing.is_discarded() => {
                *existing = sync.clone();
                Ok(())
            }
            _ => Err(anyhow!("Sync {} not found", sync.id)),
        }
    }

    fn get_sync(&self, id: SyncId, scope: Scope) -> Result<Option<SyncDefinition>> {
        let syncs = self.syncs.read().unwrap();
        Ok(syncs
            .get(&id)
            .filter(|s| scope.includes(s.discarded_at))
            .cloned())
    }

    fn list_syncs(&self, scope: Scope) -> Result<Vec<SyncDefinition>> {
        let syncs = self.syncs.read().unwrap();
        Ok(syncs
            .values()
            .filter(|s| scope.includes(s.discarded_at))
            .cloned()
            .collect())
    }

    fn set_current_cursor(&self, id: SyncId, cursor: Option<&str>) -> Result<()> {
        let mut syncs = self.syncs.write().unwrap();
        let sync = syncs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Sync {} not found", id))?;
        sync.current_cursor_field = cursor.map(str::to_string);
        sync.updated_at = Utc::now();
        Ok(())
    }

    fn insert_run(&self, mut run: SyncRun) -> Result<SyncRun> {
        run.id = SyncRunId(self.allocate_id());
        let mut runs = self.runs.write().unwrap();
        runs.insert(run.id, run.clone());
        Ok(run)
    }

    fn get_run(&self, id: SyncRunId, scope: Scope) -> Result<Option<SyncRun>> {
        let runs = self.runs.read().unwrap();
        Ok(runs
            .get(&id)
            .filter(|r| scope.includes(r.discarded_at))
            .cloned())
    }

    fn list_runs(&self, sync_id: SyncId, scope: Scope) -> Result<Vec<SyncRun>> {
        let runs = self.runs.read().unwrap();
        Ok(runs
            .values()
            .filter(|r| r.sync_id == sync_id && scope.includes(r.discarded_at))
            .cloned()
            .collect())
    }

    fn list_active_runs(&self) -> Result<Vec<SyncRun>> {
        let runs = self.runs.read().unwrap();
        Ok(runs
            .values()
            .filter(|r| r.discarded_at.is_none() && r.status.is_active())
            .cloned()
            .collect())
    }

    fn update_run_status(&self, update: StatusUpdate) -> Result<SyncRun> {
        let mut runs = self.runs.write().unwrap();
        let run = runs
            .get_mut(&update.run_id)
            .ok_or_else(|| anyhow!("Sync run {} not found", update.run_id))?;

        if run.lock_version != update.expected_version {
            return Err(StaleRunError {
                run_id: update.run_id,
                expected_version: update.expected_version,
            }
            .into());
        }

        run.status = update.status;
        if update.started_at.is_some() {
            run.started_at = update.started_at;
        }
        if update.finished_at.is_some() {
            run.finished_at = update.finished_at;
        }
        if update.error.is_some() {
            run.error = update.error;
        }
        run.updated_at = update.updated_at;
        run.lock_version += 1;
        Ok(run.clone())
    }

    fn update_run_counters(&self, id: SyncRunId, counters: &RunCounters) -> Result<()> {
        let mut runs = self.runs.write().unwrap();
        let run = runs
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Sync run {} not found", id))?;
        run.apply_counters(counters);
        run.updated_at = Utc::now();
        Ok(())
    }

    fn upsert_sync_record(&self, record: SyncRecord) -> Result<()> {
        let mut records = self.records.write().unwrap();
        let key = (record.sync_id, record.primary_key.clone());
        match records.get_mut(&key) {
            Some(existing) => {
                existing.sync_run_id = record.sync_run_id;
                existing.fingerprint = record.fingerprint;
                existing.updated_at = record.updated_at;
            }
            None => {
                records.insert(key, record);
            }
        }
        Ok(())
    }

    fn find_sync_record(&self, sync_id: SyncId, primary_key: &str) -> Result<Option<SyncRecord>> {
        let records = self.records.read().unwrap();
        Ok(records.get(&(sync_id, primary_key.to_string())).cloned())
    }

    fn list_sync_records(&self, sync_id: SyncId) -> Result<Vec<SyncRecord>> {
        let records = self.records.read().unwrap();
        Ok(records
            .values()
            .filter(|r| r.sync_id == sync_id)
            .cloned()
            .collect())
    }

    fn discard_sync(&self, id: SyncId, at: DateTime<Utc>) -> Result<DiscardOutcome> {
        let mut syncs = self.syncs.write().unwrap();
        let mut runs = self.runs.write().unwrap();
        let mut records = self.records.write().unwrap();

        let Some(sync) = syncs.get_mut(&id).filter(|s| !s.is_discarded()) else {
            return Ok(DiscardOutcome::default());
        };
        sync.discarded_at = Some(at);

        let mut outcome = DiscardOutcome {
            sync_id: Some(id),
            ..Default::default()
        };

        for run in runs.values_mut().filter(|r| r.sync_id == id) {
            if run.discarded_at.is_none() {
                run.discarded_at = Some(at);
            }
            outcome.discarded_runs.push(run.id);
        }

        for record in records.values_mut() {
            if let Some(run_id) = record.sync_run_id
                && outcome.discarded_runs.contains(&run_id)
            {
                record.sync_run_id = None;
                outcome.detached_records += 1;
            }
        }

        Ok(outcome)
    }
}

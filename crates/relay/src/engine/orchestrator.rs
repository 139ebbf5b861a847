//! Orchestrator
//!
//! The entry point callers use: validates and stores syncs, creates runs,
//! forwards run control to the lifecycle, resolves schedules and hands runs
//! to the worker pool.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rayon::prelude::*;

use super::discard::DiscardPropagator;
use super::executor::{Executor, RunOutcome, RunPlan};
use super::lifecycle::{Lifecycle, RunEvent};
use super::notify::Notifier;
use crate::connectors::ConnectorRegistry;
use crate::error::{SyncError, ValidationErrors};
use crate::models::{
    Connector, ConnectorId, ConnectorType, Model, ModelId, ScheduleType, SyncDefinition, SyncId,
    SyncMode, SyncParams, SyncRun, SyncRunId, SyncRunStatus, SyncRunType, SyncStatus,
};
use crate::schedule::{NormalizedSchedule, is_due, normalize_schedule};
use crate::settings::EngineSettings;
use crate::storage::{DiscardOutcome, Scope, SyncStore};

/// Error recorded on runs a previous process left open
const INTERRUPTED: &str = "interrupted before completion";

/// Sync parameters that passed validation
struct ValidatedSync {
    source: Connector,
    destination: Connector,
    model: Model,
    schedule: NormalizedSchedule,
    sync_mode: SyncMode,
    cursor_field: Option<String>,
}

pub struct Orchestrator {
    store: Arc<dyn SyncStore>,
    registry: ConnectorRegistry,
    lifecycle: Arc<Lifecycle>,
    executor: Executor,
    discard: DiscardPropagator,
    pool: rayon::ThreadPool,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SyncStore>,
        registry: ConnectorRegistry,
        notifier: Arc<dyn Notifier>,
        settings: &EngineSettings,
    ) -> anyhow::Result<Self> {
        settings.validate()?;

        let lifecycle = Arc::new(Lifecycle::new(
            store.clone(),
            notifier,
            settings.notification_recipients.clone(),
        ));
        let executor = Executor::new(store.clone(), lifecycle.clone(), settings.chunk_size)
            .with_skip_unchanged(settings.skip_unchanged_records);
        let discard = DiscardPropagator::new(store.clone(), lifecycle.clone());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.worker_threads)
            .thread_name(|i| format!("relay-worker-{i}"))
            .build()
            .context("Failed to start worker pool")?;

        Ok(Self {
            store,
            registry,
            lifecycle,
            executor,
            discard,
            pool,
        })
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    // === Syncs ===

    /// Validate and store a new sync (status `pending`)
    pub fn create_sync(&self, params: &SyncParams) -> Result<SyncDefinition, SyncError> {
        let valid = self.validate(params)?;
        let now = Utc::now();

        let sync = self.store.insert_sync(SyncDefinition {
            id: SyncId(0),
            workspace_id: params.workspace_id,
            source_id: valid.source.id,
            destination_id: valid.destination.id,
            model_id: valid.model.id,
            status: SyncStatus::Pending,
            schedule_type: valid.schedule.schedule_type,
            sync_interval: valid.schedule.sync_interval,
            sync_interval_unit: valid.schedule.sync_interval_unit,
            cron_expression: valid.schedule.cron_expression,
            stream_name: params.stream_name.clone(),
            sync_mode: valid.sync_mode,
            cursor_field: valid.cursor_field,
            current_cursor_field: None,
            configuration: params.configuration.clone(),
            created_at: now,
            updated_at: now,
            discarded_at: None,
        })?;

        info!(
            "Created sync {} ({} -> {}, {})",
            sync.id,
            valid.source.name,
            valid.destination.name,
            sync.schedule_type.as_str()
        );
        Ok(sync)
    }

    /// Re-validate and overwrite a kept sync
    ///
    /// Status and creation time are kept. The watermark resets when the
    /// cursor field changes.
    pub fn update_sync(
        &self,
        id: SyncId,
        params: &SyncParams,
    ) -> Result<SyncDefinition, SyncError> {
        let existing = self.load_sync(id)?;
        let valid = self.validate(params)?;

        let current_cursor_field = if valid.cursor_field == existing.cursor_field {
            existing.current_cursor_field.clone()
        } else {
            None
        };

        let sync = SyncDefinition {
            workspace_id: params.workspace_id,
            source_id: valid.source.id,
            destination_id: valid.destination.id,
            model_id: valid.model.id,
            schedule_type: valid.schedule.schedule_type,
            sync_interval: valid.schedule.sync_interval,
            sync_interval_unit: valid.schedule.sync_interval_unit,
            cron_expression: valid.schedule.cron_expression,
            stream_name: params.stream_name.clone(),
            sync_mode: valid.sync_mode,
            cursor_field: valid.cursor_field,
            current_cursor_field,
            configuration: params.configuration.clone(),
            updated_at: Utc::now(),
            ..existing
        };

        self.store.update_sync(&sync)?;
        info!("Updated sync {}", sync.id);
        Ok(sync)
    }

    /// Check destination connectivity and make the sync eligible for scheduling
    pub fn activate_sync(&self, id: SyncId) -> Result<SyncDefinition, SyncError> {
        let mut sync = self.load_sync(id)?;
        let connector = self.load_connector(sync.destination_id)?;
        let destination = self.registry.destination(&connector.connector_name).ok_or_else(|| {
            SyncError::connector(format!(
                "no destination connector named {}",
                connector.connector_name
            ))
        })?;

        destination
            .check(&connector.configuration)
            .map_err(|e| SyncError::connector(format!("{e:#}")))?;

        sync.status = SyncStatus::Active;
        sync.updated_at = Utc::now();
        self.store.update_sync(&sync)?;
        info!("Activated sync {}", sync.id);
        Ok(sync)
    }

    pub fn disable_sync(&self, id: SyncId) -> Result<SyncDefinition, SyncError> {
        let mut sync = self.load_sync(id)?;
        sync.status = SyncStatus::Disabled;
        sync.updated_at = Utc::now();
        self.store.update_sync(&sync)?;
        info!("Disabled sync {}", sync.id);
        Ok(sync)
    }

    /// Soft-delete a sync and its runs
    pub fn discard_sync(&self, id: SyncId) -> Result<DiscardOutcome, SyncError> {
        self.discard.discard(id)
    }

    pub fn get_sync(&self, id: SyncId, scope: Scope) -> Result<Option<SyncDefinition>, SyncError> {
        Ok(self.store.get_sync(id, scope)?)
    }

    pub fn list_syncs(&self, scope: Scope) -> Result<Vec<SyncDefinition>, SyncError> {
        Ok(self.store.list_syncs(scope)?)
    }

    // === Runs ===

    /// Create a pending run for a kept sync
    ///
    /// This is the explicit trigger; manual syncs only ever run this way.
    pub fn create_run(&self, sync_id: SyncId, run_type: SyncRunType) -> Result<SyncRun, SyncError> {
        let sync = self.load_sync(sync_id)?;
        let run = self.store.insert_run(SyncRun::for_sync(&sync, run_type))?;
        info!(
            "Created {} run {} for sync {}",
            run.sync_run_type.as_str(),
            run.id,
            sync.id
        );
        Ok(run)
    }

    pub fn get_run(&self, id: SyncRunId, scope: Scope) -> Result<Option<SyncRun>, SyncError> {
        Ok(self.store.get_run(id, scope)?)
    }

    pub fn list_runs(&self, sync_id: SyncId, scope: Scope) -> Result<Vec<SyncRun>, SyncError> {
        Ok(self.store.list_runs(sync_id, scope)?)
    }

    pub fn cancel_run(&self, id: SyncRunId) -> Result<SyncRun, SyncError> {
        self.lifecycle.fire(id, RunEvent::Cancel)
    }

    pub fn abort_run(&self, id: SyncRunId) -> Result<SyncRun, SyncError> {
        self.lifecycle.fire(id, RunEvent::Abort)
    }

    pub fn pause_run(&self, id: SyncRunId) -> Result<SyncRun, SyncError> {
        self.lifecycle.fire(id, RunEvent::Pause)
    }

    /// Move a paused run back to `pending`; submit it again to re-execute
    pub fn resume_run(&self, id: SyncRunId) -> Result<SyncRun, SyncError> {
        self.lifecycle.fire(id, RunEvent::Resume)
    }

    /// Execute a pending run on the calling thread
    ///
    /// A run whose sync can no longer be executed (missing connector,
    /// unregistered implementation, stream gone from the catalog) is failed
    /// with the reason and the error is returned.
    pub fn execute(&self, run_id: SyncRunId) -> Result<RunOutcome, SyncError> {
        let run = self
            .store
            .get_run(run_id, Scope::Kept)?
            .ok_or_else(|| SyncError::not_found(format!("sync run {run_id}")))?;

        let plan = match self.load_sync(run.sync_id).and_then(|sync| self.plan(sync)) {
            Ok(plan) => plan,
            Err(e) => {
                error!("Sync run {} cannot execute: {}", run_id, e);
                if !run.status.is_terminal() {
                    self.lifecycle.fail(run_id, e.to_string())?;
                }
                return Err(e);
            }
        };

        self.executor.execute(run_id, &plan)
    }

    /// Execute several runs concurrently on the worker pool and wait for all
    pub fn execute_many(&self, run_ids: &[SyncRunId]) -> Vec<Result<RunOutcome, SyncError>> {
        self.pool
            .install(|| run_ids.par_iter().map(|id| self.execute(*id)).collect())
    }

    /// Queue a run on the worker pool and return immediately
    pub fn submit(self: &Arc<Self>, run_id: SyncRunId) {
        let this = Arc::clone(self);
        self.pool.spawn(move || {
            if let Err(e) = this.execute(run_id) {
                error!("Sync run {} failed to execute: {}", run_id, e);
            }
        });
    }

    // === Scheduling ===

    /// Create runs for every sync due at `now`
    ///
    /// Only active syncs with an interval or cron schedule are considered,
    /// and never while one of their runs is still open.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<Vec<SyncRun>, SyncError> {
        let mut created = Vec::new();

        for sync in self.store.list_syncs(Scope::Kept)? {
            if sync.status != SyncStatus::Active || sync.schedule_type == ScheduleType::Manual {
                continue;
            }

            let runs = self.store.list_runs(sync.id, Scope::Kept)?;
            let open = runs
                .iter()
                .any(|r| r.status.is_active() || r.status == SyncRunStatus::Paused);
            if open || !is_due(&sync, runs.last(), now) {
                continue;
            }

            let run = self
                .store
                .insert_run(SyncRun::for_sync(&sync, SyncRunType::General))?;
            info!("Scheduled run {} for sync {}", run.id, sync.id);
            created.push(run);
        }

        Ok(created)
    }

    /// [`tick`](Self::tick), then submit every created run
    pub fn run_due(self: &Arc<Self>, now: DateTime<Utc>) -> Result<Vec<SyncRunId>, SyncError> {
        let runs = self.tick(now)?;
        let ids: Vec<SyncRunId> = runs.iter().map(|r| r.id).collect();
        for id in &ids {
            self.submit(*id);
        }
        Ok(ids)
    }

    /// Fail every run a previous process left active
    ///
    /// Call once at startup, before the first tick. Until its open run is
    /// closed a sync is never scheduled again. Paused runs are left for an
    /// explicit resume.
    pub fn recover_interrupted(&self) -> Result<Vec<SyncRunId>, SyncError> {
        let mut recovered = Vec::new();
        for run in self.store.list_active_runs()? {
            match self.lifecycle.fail(run.id, INTERRUPTED) {
                Ok(_) => {
                    warn!("Sync run {} was left {}; marked failed", run.id, run.status);
                    recovered.push(run.id);
                }
                Err(SyncError::InvalidTransition(_) | SyncError::ConcurrentTransition(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    // === Helpers ===

    fn load_sync(&self, id: SyncId) -> Result<SyncDefinition, SyncError> {
        self.store
            .get_sync(id, Scope::Kept)?
            .ok_or_else(|| SyncError::not_found(format!("sync {id}")))
    }

    fn load_connector(&self, id: ConnectorId) -> Result<Connector, SyncError> {
        self.store
            .get_connector(id)?
            .ok_or_else(|| SyncError::not_found(format!("connector {id}")))
    }

    /// Resolve everything an execution of `sync` needs
    fn plan(&self, sync: SyncDefinition) -> Result<RunPlan, SyncError> {
        let source_connector = self.load_connector(sync.source_id)?;
        let destination_connector = self.load_connector(sync.destination_id)?;
        let model = self
            .store
            .get_model(sync.model_id)?
            .ok_or_else(|| SyncError::not_found(format!("model {}", sync.model_id)))?;

        let stream = destination_connector
            .catalog
            .as_ref()
            .and_then(|catalog| catalog.stream(&sync.stream_name))
            .cloned()
            .ok_or_else(|| {
                SyncError::connector(format!(
                    "stream {} is not in the catalog of {}",
                    sync.stream_name, destination_connector.name
                ))
            })?;

        let source = self
            .registry
            .source(&source_connector.connector_name)
            .ok_or_else(|| {
                SyncError::connector(format!(
                    "no source connector named {}",
                    source_connector.connector_name
                ))
            })?;
        let destination = self
            .registry
            .destination(&destination_connector.connector_name)
            .ok_or_else(|| {
                SyncError::connector(format!(
                    "no destination connector named {}",
                    destination_connector.connector_name
                ))
            })?;

        Ok(RunPlan {
            sync,
            model,
            source_connector,
            destination_connector,
            stream,
            source,
            destination,
        })
    }

    /// Check caller input, collecting every failure
    fn validate(&self, params: &SyncParams) -> Result<ValidatedSync, SyncError> {
        let mut errors = ValidationErrors::new();

        let source = self
            .store
            .get_connector(ConnectorId(params.source_id))?
            .filter(|c| c.connector_type == ConnectorType::Source);
        if source.is_none() {
            errors.add("source_id", "must reference a source connector");
        }

        let destination = self
            .store
            .get_connector(ConnectorId(params.destination_id))?
            .filter(|c| c.connector_type == ConnectorType::Destination);
        match &destination {
            None => errors.add("destination_id", "must reference a destination connector"),
            Some(connector) => match &connector.catalog {
                None => errors.add("catalog", "Catalog is missing"),
                Some(catalog) if catalog.stream(&params.stream_name).is_none() => errors.add(
                    "stream_name",
                    "Add a valid stream_name associated with destination connector",
                ),
                Some(_) => {}
            },
        }

        let model = self.store.get_model(ModelId(params.model_id))?;
        if model.is_none() {
            errors.add("model_id", "must reference an existing model");
        }

        let schedule = match normalize_schedule(
            &params.schedule_type,
            params.sync_interval,
            params.sync_interval_unit.as_deref(),
            params.cron_expression.as_deref(),
        ) {
            Ok(schedule) => Some(schedule),
            Err(schedule_errors) => {
                errors.extend(schedule_errors);
                None
            }
        };

        let sync_mode = match params.sync_mode.as_deref() {
            None => SyncMode::default(),
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                errors.add("sync_mode", "is not included in the list");
                SyncMode::default()
            }),
        };

        let cursor_field = match sync_mode {
            SyncMode::FullRefresh => None,
            SyncMode::Incremental => {
                let field = params
                    .cursor_field
                    .as_deref()
                    .map(str::trim)
                    .filter(|f| !f.is_empty());
                if field.is_none() {
                    errors.add("cursor_field", "can't be blank for incremental syncs");
                }
                field.map(str::to_string)
            }
        };

        match (source, destination, model, schedule) {
            (Some(source), Some(destination), Some(model), Some(schedule)) if errors.is_empty() => {
                Ok(ValidatedSync {
                    source,
                    destination,
                    model,
                    schedule,
                    sync_mode,
                    cursor_field,
                })
            }
            _ => Err(SyncError::Validation(errors)),
        }
    }
}

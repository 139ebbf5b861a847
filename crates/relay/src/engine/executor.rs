//! Chunked sync executor
//!
//! Drives one run from `pending` to a terminal state: extracts every record
//! from the source, writes them to the destination in fixed-size chunks and
//! keeps the run's counters current after each chunk. A failed chunk is
//! counted and skipped; only extraction failures fail the run.

use std::cmp::Ordering;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;

use super::lifecycle::{Lifecycle, RunEvent};
use super::tracker::RecordTracker;
use crate::connectors::{
    DestinationConnector, SourceConnector, SourceQuery, WritePayload, WriteTarget, resolve_target,
};
use crate::error::SyncError;
use crate::models::{
    CatalogStream, Connector, Model, Record, RunCounters, SyncDefinition, SyncRun, SyncRunId,
    SyncRunStatus, Value,
};
use crate::storage::{Scope, SyncStore};

/// Result artifact of a run: `{"successful": n, "failed": m}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub successful: u64,
    pub failed: u64,
}

/// Final state of an executed run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run: SyncRun,
    pub summary: RunSummary,
}

/// Everything needed to execute runs of one sync
#[derive(Clone)]
pub struct RunPlan {
    pub sync: SyncDefinition,
    pub model: Model,
    pub source_connector: Connector,
    pub destination_connector: Connector,
    pub stream: CatalogStream,
    pub source: Arc<dyn SourceConnector>,
    pub destination: Arc<dyn DestinationConnector>,
}

impl RunPlan {
    fn source_query(&self) -> SourceQuery {
        SourceQuery {
            configuration: self.source_connector.configuration.clone(),
            query: self.model.query.clone(),
            query_type: self.model.query_type,
            sync_mode: self.sync.sync_mode,
            cursor_field: self.sync.cursor_field.clone(),
            current_cursor: self.sync.current_cursor_field.clone(),
        }
    }
}

/// Paused and terminal runs stop the executor
fn is_halted(status: SyncRunStatus) -> bool {
    status.is_terminal() || status == SyncRunStatus::Paused
}

/// Highest value of `field` among `records`, skipping nulls and values
/// that do not compare with the running maximum
pub fn max_cursor<'a>(records: impl IntoIterator<Item = &'a Record>, field: &str) -> Option<Value> {
    records
        .into_iter()
        .filter_map(|record| record.get(field))
        .filter(|value| !value.is_null())
        .fold(None, |max: Option<&Value>, value| match max {
            Some(current) if value.compare(current) != Some(Ordering::Greater) => Some(current),
            _ => Some(value),
        })
        .cloned()
}

/// Executes runs one at a time; share it across worker threads
pub struct Executor {
    store: Arc<dyn SyncStore>,
    lifecycle: Arc<Lifecycle>,
    tracker: RecordTracker,
    chunk_size: usize,
    skip_unchanged: bool,
}

impl Executor {
    pub fn new(store: Arc<dyn SyncStore>, lifecycle: Arc<Lifecycle>, chunk_size: usize) -> Self {
        Self {
            tracker: RecordTracker::new(store.clone()),
            store,
            lifecycle,
            chunk_size: chunk_size.max(1),
            skip_unchanged: false,
        }
    }

    /// Skip records unchanged since their last write (incremental syncs only)
    pub fn with_skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Execute a pending run to completion
    ///
    /// Returns early, without error, if the run is paused, canceled or
    /// aborted by someone else while it executes. A run that already
    /// finished is returned as stored.
    pub fn execute(&self, run_id: SyncRunId, plan: &RunPlan) -> Result<RunOutcome, SyncError> {
        if self.advance(run_id, RunEvent::Start)?.is_none() {
            return self.halted(run_id);
        }

        // Only the worker that started the run owns its counters. A resumed
        // run starts over.
        let mut counters = RunCounters::default();
        self.store.update_run_counters(run_id, &counters)?;

        let target = match resolve_target(&plan.destination_connector, &plan.stream) {
            Ok(target) => target,
            Err(e) => return self.abort(run_id, format!("{e:#}")),
        };

        if self.advance(run_id, RunEvent::Query)?.is_none() {
            return self.halted(run_id);
        }

        // === Extraction ===

        let extraction = match plan.source.query(&plan.source_query()) {
            Ok(extraction) => extraction,
            Err(e) => {
                error!("Sync run {} extraction failed: {:#}", run_id, e);
                return self.abort(run_id, format!("{e:#}"));
            }
        };

        let reported = extraction.total_row_count;
        let mut records = Vec::new();
        for item in extraction.records {
            match item {
                Ok(record) => records.push(record),
                Err(e) => {
                    counters.total_query_rows = records.len() as u64;
                    self.store.update_run_counters(run_id, &counters)?;
                    error!(
                        "Sync run {} extraction failed after {} rows: {:#}",
                        run_id,
                        records.len(),
                        e
                    );
                    return self.abort(run_id, format!("{e:#}"));
                }
            }
        }

        counters.total_query_rows = records.len() as u64;
        self.store.update_run_counters(run_id, &counters)?;
        info!("Sync run {} extracted {} records", run_id, records.len());
        if let Some(reported) = reported
            && reported != counters.total_query_rows
        {
            warn!(
                "Sync run {} source reported {} rows but yielded {}",
                run_id, reported, counters.total_query_rows
            );
        }

        let pending = self.unchanged_filtered(plan, &records)?;

        if self.advance(run_id, RunEvent::Queue)?.is_none()
            || self.advance(run_id, RunEvent::Progress)?.is_none()
        {
            return self.halted(run_id);
        }

        // === Chunked writes ===

        for (index, chunk) in pending.chunks(self.chunk_size).enumerate() {
            if self.halted_between_chunks(run_id)? {
                info!("Sync run {} stopped before chunk {}", run_id, index + 1);
                return self.halted(run_id);
            }

            self.write_chunk(run_id, plan, &target, chunk, &mut counters);
            counters.total_rows = counters.successful_rows + counters.failed_rows;
            self.store.update_run_counters(run_id, &counters)?;
        }

        let Some(run) = self.advance(run_id, RunEvent::Complete)? else {
            return self.halted(run_id);
        };

        // The run has already succeeded; a lost watermark only means the
        // next run re-extracts these rows.
        if plan.sync.is_incremental()
            && counters.failed_rows == 0
            && let Err(e) = self.advance_cursor(plan, &records)
        {
            warn!("Sync {} cursor was not advanced: {:#}", plan.sync.id, e);
        }

        info!(
            "Sync run {} finished: {} successful, {} failed",
            run_id, counters.successful_rows, counters.failed_rows
        );
        Ok(RunOutcome {
            run,
            summary: summary_of(&counters),
        })
    }

    /// Write one chunk; failures are counted, never raised
    fn write_chunk(
        &self,
        run_id: SyncRunId,
        plan: &RunPlan,
        target: &WriteTarget,
        chunk: &[&Record],
        counters: &mut RunCounters,
    ) {
        let owned: Vec<Record> = chunk.iter().map(|r| (*r).clone()).collect();
        let payload = WritePayload::from_chunk(&owned);
        let size = chunk.len() as u64;

        match plan.destination.write(target, &payload) {
            Ok(()) => {
                counters.successful_rows += size;
                for record in &owned {
                    if let Err(e) =
                        self.tracker
                            .record(plan.sync.id, run_id, record, &plan.model.primary_key)
                    {
                        warn!("Sync run {} failed to track record: {:#}", run_id, e);
                    }
                }
                debug!("Sync run {} wrote {} records", run_id, size);
            }
            Err(e) => {
                counters.failed_rows += size;
                warn!(
                    "Sync run {} chunk of {} records failed: {:#}",
                    run_id, size, e
                );
            }
        }
    }

    /// Records still to write, after dropping unchanged ones when enabled
    fn unchanged_filtered<'a>(
        &self,
        plan: &RunPlan,
        records: &'a [Record],
    ) -> Result<Vec<&'a Record>, SyncError> {
        if !(self.skip_unchanged && plan.sync.is_incremental()) {
            return Ok(records.iter().collect());
        }

        let mut pending = Vec::with_capacity(records.len());
        for record in records {
            if !self
                .tracker
                .is_unchanged(plan.sync.id, record, &plan.model.primary_key)?
            {
                pending.push(record);
            }
        }

        let skipped = records.len() - pending.len();
        if skipped > 0 {
            info!("Skipping {} unchanged records for sync {}", skipped, plan.sync.id);
        }
        Ok(pending)
    }

    fn advance_cursor(&self, plan: &RunPlan, records: &[Record]) -> Result<(), SyncError> {
        let Some(field) = plan.sync.cursor_field.as_deref() else {
            return Ok(());
        };
        if let Some(max) = max_cursor(records, field) {
            let cursor = max.to_string();
            self.store.set_current_cursor(plan.sync.id, Some(&cursor))?;
            debug!("Sync {} cursor advanced to {}", plan.sync.id, cursor);
        }
        Ok(())
    }

    /// Fire `event`, or `None` if the run was halted from outside
    fn advance(&self, run_id: SyncRunId, event: RunEvent) -> Result<Option<SyncRun>, SyncError> {
        match self.lifecycle.fire(run_id, event) {
            Ok(run) => Ok(Some(run)),
            Err(
                err @ (SyncError::InvalidTransition(_)
                | SyncError::ConcurrentTransition(_)
                | SyncError::NotFound { .. }),
            ) => {
                if is_halted(self.load(run_id)?.status) {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn halted_between_chunks(&self, run_id: SyncRunId) -> Result<bool, SyncError> {
        Ok(self.load(run_id)?.status != SyncRunStatus::InProgress)
    }

    fn abort(&self, run_id: SyncRunId, message: String) -> Result<RunOutcome, SyncError> {
        match self.lifecycle.fail(run_id, message) {
            Ok(run) => Ok(RunOutcome {
                summary: summary_of(&run.counters()),
                run,
            }),
            Err(
                SyncError::InvalidTransition(_)
                | SyncError::ConcurrentTransition(_)
                | SyncError::NotFound { .. },
            ) => self.halted(run_id),
            Err(e) => Err(e),
        }
    }

    /// Outcome of a run someone else stopped, as stored
    fn halted(&self, run_id: SyncRunId) -> Result<RunOutcome, SyncError> {
        let run = self.load(run_id)?;
        info!("Sync run {} halted in state {}", run_id, run.status);
        Ok(RunOutcome {
            summary: summary_of(&run.counters()),
            run,
        })
    }

    /// Discarded runs are still visible here so a discard mid-run halts cleanly
    fn load(&self, run_id: SyncRunId) -> Result<SyncRun, SyncError> {
        self.store
            .get_run(run_id, Scope::WithDiscarded)?
            .ok_or_else(|| SyncError::not_found(format!("sync run {run_id}")))
    }
}

fn summary_of(counters: &RunCounters) -> RunSummary {
    RunSummary {
        successful: counters.successful_rows,
        failed: counters.failed_rows,
    }
}

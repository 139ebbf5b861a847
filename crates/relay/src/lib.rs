//! Relay crate - Sync-run orchestration engine
//!
//! This crate moves records from a source connector to a destination
//! connector on a schedule and tracks, per run, how much succeeded:
//! - Domain models (SyncDefinition, SyncRun, SyncRecord, Record)
//! - Run lifecycle state machine with optimistic versioning
//! - Manual, interval and cron schedule resolution
//! - Chunked executor with per-chunk failure isolation
//! - Record fingerprints and incremental cursors
//! - Soft-delete cascade from syncs to runs
//! - Storage trait with in-memory and SQLite backends
//!
//! The crate is executor-agnostic: runs execute on a rayon pool and all
//! I/O is synchronous.

pub mod connectors;
pub mod engine;
pub mod error;
pub mod models;
pub mod schedule;
pub mod settings;
pub mod storage;

pub use connectors::{
    ConnectorRegistry, DestinationConnector, Extraction, HttpDestination, JsonFileSource,
    RecordingDestination, SourceConnector, SourceQuery, StaticSource, WritePayload, WriteTarget,
};
pub use engine::{
    InvalidTransition, LogNotifier, MemoryNotifier, NoticeKind, Notifier, Orchestrator,
    RunEvent, RunNotice, RunOutcome, RunSummary, next_status,
};
pub use error::{SyncError, ValidationErrors};
pub use models::{
    Catalog, CatalogStream, Connector, ConnectorId, ConnectorType, Model, ModelId, Record,
    RequestMethod, ScheduleType, SyncDefinition, SyncId, SyncIntervalUnit, SyncMode, SyncParams,
    SyncRecord, SyncRun, SyncRunId, SyncRunStatus, SyncRunType, SyncStatus, Value,
};
pub use settings::EngineSettings;
pub use storage::{InMemorySyncStore, Scope, SqliteSyncStore, SyncStore};

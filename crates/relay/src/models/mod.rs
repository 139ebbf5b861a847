//! Domain models for syncs, runs and tracked records

mod connector;
mod record;
mod sync;
mod sync_record;
mod sync_run;

pub use connector::{
    Catalog, CatalogStream, Connector, ConnectorId, ConnectorType, JsonMap, Model, ModelId,
    QueryType, RequestMethod,
};
pub use record::{Record, Value};
pub use sync::{
    ScheduleType, SyncDefinition, SyncId, SyncIntervalUnit, SyncMode, SyncParams, SyncStatus,
};
pub use sync_record::SyncRecord;
pub use sync_run::{RunCounters, SyncRun, SyncRunId, SyncRunStatus, SyncRunType};

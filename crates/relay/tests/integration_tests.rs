//! Integration tests for the relay crate
//!
//! These tests drive syncs end to end through the orchestrator, from
//! creation through scheduling, execution, notification and discard.

use std::fs;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use relay::connectors::{JsonFileSource, RecordingDestination, SourceConnector, StaticSource};
use relay::engine::{MemoryNotifier, NoticeKind, Orchestrator};
use relay::models::{
    Catalog, CatalogStream, Connector, ConnectorId, JsonMap, Model, ModelId, Record, ScheduleType,
    SyncIntervalUnit, SyncParams, SyncRunId, SyncRunStatus, SyncRunType, SyncStatus,
};
use relay::settings::EngineSettings;
use relay::storage::{InMemorySyncStore, Scope, SqliteSyncStore, StatusUpdate, SyncStore};
use relay::{ConnectorRegistry, SyncError, SyncRun};
use serde_json::json;
use tempfile::TempDir;

struct World {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn SyncStore>,
    notifier: Arc<MemoryNotifier>,
    destination: Arc<RecordingDestination>,
    source_id: ConnectorId,
    destination_id: ConnectorId,
    model_id: ModelId,
}

/// Wire an orchestrator around one source and one recording destination
fn world(
    store: Arc<dyn SyncStore>,
    source: Arc<dyn SourceConnector>,
    source_config: JsonMap,
    destination: RecordingDestination,
    chunk_size: usize,
) -> World {
    let destination = Arc::new(destination);
    let notifier = Arc::new(MemoryNotifier::new());

    let mut registry = ConnectorRegistry::new();
    registry.register_source("Source", source);
    registry.register_destination("Destination", destination.clone());

    let source_connector = store
        .insert_connector(Connector::source("warehouse", "Source").with_configuration(source_config))
        .unwrap();
    let mut destination_config = JsonMap::new();
    destination_config.insert("destination_url".into(), json!("http://crm.test/api/"));
    let destination_connector = store
        .insert_connector(
            Connector::destination("crm", "Destination")
                .with_configuration(destination_config)
                .with_catalog(Catalog::new(vec![CatalogStream::new("profile")])),
        )
        .unwrap();
    let model = store
        .insert_model(Model::new(source_connector.id, "users", "SELECT * FROM users", "id"))
        .unwrap();

    let settings = EngineSettings {
        chunk_size,
        notification_recipients: vec!["ops@example.com".to_string()],
        ..EngineSettings::default()
    };
    let orchestrator =
        Orchestrator::new(store.clone(), registry, notifier.clone(), &settings).unwrap();

    World {
        orchestrator: Arc::new(orchestrator),
        store,
        notifier,
        destination,
        source_id: source_connector.id,
        destination_id: destination_connector.id,
        model_id: model.id,
    }
}

fn static_world(records: Vec<Record>, destination: RecordingDestination) -> World {
    world(
        Arc::new(InMemorySyncStore::new()),
        Arc::new(StaticSource::new(records)),
        JsonMap::new(),
        destination,
        10,
    )
}

fn users(n: i64) -> Vec<Record> {
    (1..=n)
        .map(|i| {
            Record::new()
                .with("id", i)
                .with("email", format!("user{i}@example.com"))
        })
        .collect()
}

impl World {
    fn params(&self, schedule_type: &str) -> SyncParams {
        SyncParams {
            workspace_id: 1,
            source_id: self.source_id.0,
            destination_id: self.destination_id.0,
            model_id: self.model_id.0,
            schedule_type: schedule_type.to_string(),
            stream_name: "profile".to_string(),
            ..SyncParams::default()
        }
    }

    fn run_now(&self, params: &SyncParams) -> SyncRun {
        let sync = self.orchestrator.create_sync(params).unwrap();
        let run = self
            .orchestrator
            .create_run(sync.id, SyncRunType::General)
            .unwrap();
        self.orchestrator.execute(run.id).unwrap().run
    }
}

fn assert_counters_consistent(run: &SyncRun) {
    assert_eq!(run.total_rows, run.successful_rows + run.failed_rows);
    assert!(run.total_rows <= run.total_query_rows);
}

#[test]
fn test_second_chunk_failure_is_partial_success() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteSyncStore::new(dir.path().join("relay.test.sqlite")).unwrap());
    let w = world(
        store,
        Arc::new(StaticSource::new(users(25))),
        JsonMap::new(),
        RecordingDestination::new().fail_call(2),
        10,
    );

    let run = w.run_now(&w.params("manual"));

    assert_eq!(run.status, SyncRunStatus::Success);
    assert_eq!(run.successful_rows, 15);
    assert_eq!(run.failed_rows, 10);
    assert_eq!(run.total_rows, 25);
    assert_eq!(run.total_query_rows, 25);
    assert_counters_consistent(&run);

    let sizes: Vec<usize> = w.destination.writes().iter().map(|c| c.payload.len()).collect();
    assert_eq!(sizes, vec![10, 10, 5]);

    let notices = w.notifier.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, NoticeKind::RowFailure);
    assert_eq!(notices[0].successful_rows, 15);
    assert_eq!(notices[0].failed_rows, 10);
    assert_eq!(notices[0].recipients, vec!["ops@example.com".to_string()]);

    // Only records from successful chunks are tracked
    assert_eq!(w.store.list_sync_records(run.sync_id).unwrap().len(), 15);
    assert!(w.store.find_sync_record(run.sync_id, "11").unwrap().is_none());
    assert!(w.store.find_sync_record(run.sync_id, "21").unwrap().is_some());
}

#[test]
fn test_payload_reaches_destination_in_wire_shape() {
    let w = static_world(users(2), RecordingDestination::new());
    w.run_now(&w.params("manual"));

    let call = &w.destination.writes()[0];
    assert_eq!(call.target.url, "http://crm.test/api/");
    assert_eq!(
        serde_json::to_value(&call.payload).unwrap(),
        json!({"records": [
            {"fields": {"email": "user1@example.com", "id": 1}},
            {"fields": {"email": "user2@example.com", "id": 2}}
        ]})
    );
}

#[test]
fn test_discard_cascade() {
    let w = static_world(users(5), RecordingDestination::new());
    let first = w.run_now(&w.params("manual"));
    let second = w
        .orchestrator
        .create_run(first.sync_id, SyncRunType::Test)
        .unwrap();
    w.orchestrator.execute(second.id).unwrap();
    let other = w.run_now(&w.params("manual"));

    let outcome = w.orchestrator.discard_sync(first.sync_id).unwrap();
    assert_eq!(outcome.discarded_runs, vec![first.id, second.id]);

    // Default scope hides the sync and its runs
    assert!(w.orchestrator.get_sync(first.sync_id, Scope::Kept).unwrap().is_none());
    assert!(w.orchestrator.list_runs(first.sync_id, Scope::Kept).unwrap().is_empty());
    let discarded = w
        .orchestrator
        .list_runs(first.sync_id, Scope::WithDiscarded)
        .unwrap();
    assert_eq!(discarded.len(), 2);
    assert!(discarded.iter().all(|r| r.discarded_at.is_some()));
    assert_eq!(
        w.orchestrator.list_syncs(Scope::DiscardedOnly).unwrap().len(),
        1
    );

    // Records survive, detached from the discarded runs
    let records = w.store.list_sync_records(first.sync_id).unwrap();
    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|r| r.sync_run_id.is_none()));

    // Other syncs are untouched
    let kept = w.store.list_sync_records(other.sync_id).unwrap();
    assert!(kept.iter().all(|r| r.sync_run_id == Some(other.id)));

    // A discarded sync cannot get new runs
    let err = w
        .orchestrator
        .create_run(first.sync_id, SyncRunType::General)
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound { .. }));
}

#[test]
fn test_manual_sync_never_auto_triggers() {
    let w = static_world(users(1), RecordingDestination::new());
    let sync = w.orchestrator.create_sync(&w.params("manual")).unwrap();
    w.orchestrator.activate_sync(sync.id).unwrap();

    let start = Utc::now();
    for hour in 0..24 * 30 {
        let created = w.orchestrator.tick(start + Duration::hours(hour)).unwrap();
        assert!(created.is_empty());
    }
    assert!(w.orchestrator.list_runs(sync.id, Scope::WithDiscarded).unwrap().is_empty());

    w.orchestrator.create_run(sync.id, SyncRunType::General).unwrap();
    assert_eq!(w.orchestrator.list_runs(sync.id, Scope::Kept).unwrap().len(), 1);
}

#[test]
fn test_schedule_fields_are_mutually_exclusive() {
    let w = static_world(users(1), RecordingDestination::new());

    let interval = SyncParams {
        sync_interval: Some(10),
        sync_interval_unit: Some("minutes".to_string()),
        cron_expression: Some("0 0 */2 * *".to_string()),
        ..w.params("interval")
    };
    let sync = w.orchestrator.create_sync(&interval).unwrap();
    let stored = w.orchestrator.get_sync(sync.id, Scope::Kept).unwrap().unwrap();
    assert_eq!(stored.schedule_type, ScheduleType::Interval);
    assert_eq!(stored.sync_interval, Some(10));
    assert_eq!(stored.sync_interval_unit, Some(SyncIntervalUnit::Minutes));
    assert!(stored.cron_expression.is_none());

    let cron = SyncParams {
        schedule_type: "cron_expression".to_string(),
        ..interval.clone()
    };
    let updated = w.orchestrator.update_sync(sync.id, &cron).unwrap();
    assert_eq!(updated.cron_expression.as_deref(), Some("0 0 */2 * *"));
    assert!(updated.sync_interval.is_none());
    assert!(updated.sync_interval_unit.is_none());

    let manual = SyncParams {
        schedule_type: "manual".to_string(),
        sync_interval: Some(30),
        ..cron
    };
    let updated = w.orchestrator.update_sync(sync.id, &manual).unwrap();
    assert!(updated.sync_interval.is_none());
    assert!(updated.cron_expression.is_none());
}

#[test]
fn test_validation_errors_prevent_creation() {
    let w = static_world(users(1), RecordingDestination::new());
    let bare = w
        .store
        .insert_connector(Connector::destination("no-catalog", "Destination"))
        .unwrap();

    let params = SyncParams {
        destination_id: bare.id.0,
        ..w.params("manual")
    };
    let err = w.orchestrator.create_sync(&params).unwrap_err();
    assert_eq!(
        serde_json::to_value(err.validation_errors().unwrap()).unwrap(),
        json!({"catalog": ["Catalog is missing"]})
    );

    let err = w
        .orchestrator
        .create_sync(&w.params("autoamted"))
        .unwrap_err();
    assert_eq!(
        serde_json::to_value(err.validation_errors().unwrap()).unwrap(),
        json!({"schedule_type": ["invalid schedule type"]})
    );

    assert!(w.orchestrator.list_syncs(Scope::WithDiscarded).unwrap().is_empty());
}

#[test]
fn test_incremental_cursor_across_runs() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("users.json");
    fs::write(
        &path,
        r#"[{"id": 1, "updated_at": "2024-01-01T00:00:00Z"},
            {"id": 2, "updated_at": "2024-01-03T00:00:00Z"},
            {"id": 3, "updated_at": "2024-01-02T00:00:00Z"}]"#,
    )
    .unwrap();

    let mut source_config = JsonMap::new();
    source_config.insert("path".into(), json!(path.to_str().unwrap()));
    let w = world(
        Arc::new(InMemorySyncStore::new()),
        Arc::new(JsonFileSource),
        source_config,
        RecordingDestination::new(),
        10,
    );

    let params = SyncParams {
        sync_mode: Some("incremental".to_string()),
        cursor_field: Some("updated_at".to_string()),
        ..w.params("manual")
    };
    let first = w.run_now(&params);
    assert_eq!(first.successful_rows, 3);

    let sync = w.orchestrator.get_sync(first.sync_id, Scope::Kept).unwrap().unwrap();
    assert_eq!(
        sync.current_cursor_field.as_deref(),
        Some("2024-01-03T00:00:00Z")
    );

    fs::write(
        &path,
        r#"[{"id": 1, "updated_at": "2024-01-01T00:00:00Z"},
            {"id": 2, "updated_at": "2024-01-03T00:00:00Z"},
            {"id": 4, "updated_at": "2024-01-04T00:00:00Z"}]"#,
    )
    .unwrap();

    let run = w
        .orchestrator
        .create_run(sync.id, SyncRunType::General)
        .unwrap();
    let second = w.orchestrator.execute(run.id).unwrap();
    assert_eq!(second.run.total_query_rows, 1);
    assert_eq!(second.summary.successful, 1);

    let sync = w.orchestrator.get_sync(sync.id, Scope::Kept).unwrap().unwrap();
    assert_eq!(
        sync.current_cursor_field.as_deref(),
        Some("2024-01-04T00:00:00Z")
    );
}

#[test]
fn test_cancel_between_chunks() {
    let orchestrator_cell: Arc<OnceLock<Arc<Orchestrator>>> = Arc::new(OnceLock::new());
    let run_cell: Arc<OnceLock<SyncRunId>> = Arc::new(OnceLock::new());

    let hook_orchestrator = orchestrator_cell.clone();
    let hook_run = run_cell.clone();
    let destination = RecordingDestination::new().with_hook(move |call| {
        if call == 2 {
            let orchestrator = hook_orchestrator.get().unwrap();
            orchestrator.cancel_run(*hook_run.get().unwrap()).unwrap();
        }
    });
    let w = static_world(users(50), destination);
    orchestrator_cell.set(w.orchestrator.clone()).ok().unwrap();

    let sync = w.orchestrator.create_sync(&w.params("manual")).unwrap();
    let run = w
        .orchestrator
        .create_run(sync.id, SyncRunType::General)
        .unwrap();
    run_cell.set(run.id).unwrap();

    let outcome = w.orchestrator.execute(run.id).unwrap();

    assert_eq!(outcome.run.status, SyncRunStatus::Canceled);
    assert_eq!(w.destination.write_count(), 2);
    assert_eq!(outcome.summary.successful, 20);
    assert!(w.notifier.notices().is_empty());

    // Terminal runs reject further control
    let err = w.orchestrator.abort_run(run.id).unwrap_err();
    assert!(matches!(err, SyncError::InvalidTransition(_)));
}

#[test]
fn test_extraction_failure_fails_run_and_notifies() {
    let w = world(
        Arc::new(InMemorySyncStore::new()),
        Arc::new(StaticSource::new(users(30)).failing_after(12, "connection reset by peer")),
        JsonMap::new(),
        RecordingDestination::new(),
        10,
    );

    let run = w.run_now(&w.params("manual"));

    assert_eq!(run.status, SyncRunStatus::Failed);
    assert_eq!(run.total_query_rows, 12);
    assert_eq!(run.total_rows, 0);
    assert_eq!(run.error.as_deref(), Some("connection reset by peer"));
    assert!(run.finished_at.is_some());
    assert_eq!(w.destination.write_count(), 0);
    assert_eq!(w.notifier.notices()[0].kind, NoticeKind::Failure);
}

#[test]
fn test_execute_many_runs_concurrently() {
    let w = static_world(users(25), RecordingDestination::new());

    let run_ids: Vec<SyncRunId> = (0..6)
        .map(|_| {
            let sync = w.orchestrator.create_sync(&w.params("manual")).unwrap();
            w.orchestrator
                .create_run(sync.id, SyncRunType::General)
                .unwrap()
                .id
        })
        .collect();

    let outcomes = w.orchestrator.execute_many(&run_ids);

    assert_eq!(outcomes.len(), 6);
    for outcome in outcomes {
        let outcome = outcome.unwrap();
        assert_eq!(outcome.run.status, SyncRunStatus::Success);
        assert_eq!(outcome.summary.successful, 25);
        assert_counters_consistent(&outcome.run);
    }
    assert_eq!(w.destination.write_count(), 18);
    assert_eq!(w.notifier.notices().len(), 6);
}

#[test]
fn test_scheduler_submits_due_interval_runs() {
    let w = static_world(users(3), RecordingDestination::new());
    let params = SyncParams {
        sync_interval: Some(1),
        sync_interval_unit: Some("hours".to_string()),
        ..w.params("interval")
    };
    let sync = w.orchestrator.create_sync(&params).unwrap();
    w.orchestrator.activate_sync(sync.id).unwrap();

    let submitted = w.orchestrator.run_due(Utc::now()).unwrap();
    assert_eq!(submitted.len(), 1);

    let mut finished = None;
    for _ in 0..200 {
        let run = w
            .orchestrator
            .get_run(submitted[0], Scope::Kept)
            .unwrap()
            .unwrap();
        if run.status.is_terminal() {
            finished = Some(run);
            break;
        }
        thread::sleep(StdDuration::from_millis(25));
    }

    let run = finished.expect("submitted run did not finish");
    assert_eq!(run.status, SyncRunStatus::Success);
    assert_eq!(run.successful_rows, 3);

    // Not due again until an hour after it finished
    assert!(w.orchestrator.tick(Utc::now()).unwrap().is_empty());
    assert_eq!(
        w.orchestrator
            .tick(Utc::now() + Duration::minutes(61))
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn test_sqlite_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("relay.test.sqlite");

    let (sync_id, run_id) = {
        let store = Arc::new(SqliteSyncStore::new(&db_path).unwrap());
        let w = world(
            store,
            Arc::new(StaticSource::new(users(4))),
            JsonMap::new(),
            RecordingDestination::new(),
            3,
        );
        let sync = w.orchestrator.create_sync(&w.params("manual")).unwrap();
        w.orchestrator.activate_sync(sync.id).unwrap();
        let run = w
            .orchestrator
            .create_run(sync.id, SyncRunType::Test)
            .unwrap();
        w.orchestrator.execute(run.id).unwrap();
        (sync.id, run.id)
    };

    let store = SqliteSyncStore::new(&db_path).unwrap();
    let sync = store.get_sync(sync_id, Scope::Kept).unwrap().unwrap();
    assert_eq!(sync.status, SyncStatus::Active);

    let run = store.get_run(run_id, Scope::Kept).unwrap().unwrap();
    assert_eq!(run.status, SyncRunStatus::Success);
    assert_eq!(run.sync_run_type, SyncRunType::Test);
    assert_eq!(run.successful_rows, 4);
    assert!(run.started_at.is_some() && run.finished_at.is_some());
    assert_eq!(store.list_sync_records(sync_id).unwrap().len(), 4);
}

#[test]
fn test_restart_recovers_interrupted_runs() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("relay.test.sqlite");
    let now = Utc::now();

    let (sync_id, queued_id, in_flight_id) = {
        let store = Arc::new(SqliteSyncStore::new(&db_path).unwrap());
        let w = world(
            store,
            Arc::new(StaticSource::new(users(3))),
            JsonMap::new(),
            RecordingDestination::new(),
            10,
        );
        let params = SyncParams {
            sync_interval: Some(1),
            sync_interval_unit: Some("hours".to_string()),
            ..w.params("interval")
        };
        let sync = w.orchestrator.create_sync(&params).unwrap();
        w.orchestrator.activate_sync(sync.id).unwrap();
        let queued = w.orchestrator.tick(now).unwrap().remove(0);

        let manual = w.orchestrator.create_sync(&w.params("manual")).unwrap();
        let in_flight = w
            .orchestrator
            .create_run(manual.id, SyncRunType::General)
            .unwrap();
        w.store
            .update_run_status(StatusUpdate {
                run_id: in_flight.id,
                expected_version: in_flight.lock_version,
                status: SyncRunStatus::InProgress,
                started_at: Some(now),
                finished_at: None,
                error: None,
                updated_at: now,
            })
            .unwrap();

        // The process dies here: neither run is ever executed
        (sync.id, queued.id, in_flight.id)
    };

    let store = Arc::new(SqliteSyncStore::new(&db_path).unwrap());
    let w = world(
        store,
        Arc::new(StaticSource::new(users(3))),
        JsonMap::new(),
        RecordingDestination::new(),
        10,
    );
    assert!(w.orchestrator.tick(now + Duration::hours(2)).unwrap().is_empty());

    let recovered = w.orchestrator.recover_interrupted().unwrap();
    assert_eq!(recovered, vec![queued_id, in_flight_id]);
    for id in recovered {
        let run = w.orchestrator.get_run(id, Scope::Kept).unwrap().unwrap();
        assert_eq!(run.status, SyncRunStatus::Failed);
        assert!(run.error.is_some());
    }
    assert_eq!(w.notifier.notices().len(), 2);
    assert!(w.notifier.notices().iter().all(|n| n.kind == NoticeKind::Failure));

    let scheduled = w.orchestrator.tick(now + Duration::hours(2)).unwrap();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].sync_id, sync_id);
}

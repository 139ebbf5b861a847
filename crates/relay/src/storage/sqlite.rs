//! SQLite-based sync storage

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};
use serde::de::DeserializeOwned;

use super::{DiscardOutcome, Scope, StaleRunError, StatusUpdate, SyncStore};
use crate::models::{
    Connector, ConnectorId, Model, ModelId, RunCounters, SyncDefinition, SyncId, SyncRecord,
    SyncRun, SyncRunId,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE connectors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id INTEGER NOT NULL,
                connector_type TEXT NOT NULL,
                name TEXT NOT NULL,
                connector_name TEXT NOT NULL,
                configuration TEXT NOT NULL DEFAULT '{}',
                catalog TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE models (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id INTEGER NOT NULL,
                connector_id INTEGER NOT NULL REFERENCES connectors(id),
                name TEXT NOT NULL,
                query TEXT NOT NULL,
                query_type TEXT NOT NULL,
                primary_key TEXT NOT NULL
            );

            CREATE TABLE syncs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workspace_id INTEGER NOT NULL,
                source_id INTEGER NOT NULL REFERENCES connectors(id),
                destination_id INTEGER NOT NULL REFERENCES connectors(id),
                model_id INTEGER NOT NULL REFERENCES models(id),
                status TEXT NOT NULL,
                schedule_type TEXT NOT NULL,
                sync_interval INTEGER,
                sync_interval_unit TEXT,
                cron_expression TEXT,
                stream_name TEXT NOT NULL,
                sync_mode TEXT NOT NULL,
                cursor_field TEXT,
                current_cursor_field TEXT,
                configuration TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                discarded_at TEXT
            );

            CREATE TABLE sync_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sync_id INTEGER NOT NULL REFERENCES syncs(id),
                status TEXT NOT NULL DEFAULT 'pending',
                sync_run_type TEXT NOT NULL DEFAULT 'general',
                total_query_rows INTEGER NOT NULL DEFAULT 0,
                total_rows INTEGER NOT NULL DEFAULT 0,
                successful_rows INTEGER NOT NULL DEFAULT 0,
                failed_rows INTEGER NOT NULL DEFAULT 0,
                workspace_id INTEGER NOT NULL,
                source_id INTEGER NOT NULL,
                destination_id INTEGER NOT NULL,
                model_id INTEGER NOT NULL,
                error TEXT,
                started_at TEXT,
                finished_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                discarded_at TEXT,
                lock_version INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX idx_sync_runs_sync_id ON sync_runs(sync_id);

            CREATE TABLE sync_records (
                sync_id INTEGER NOT NULL REFERENCES syncs(id),
                primary_key TEXT NOT NULL,
                sync_run_id INTEGER REFERENCES sync_runs(id) ON DELETE SET NULL,
                fingerprint TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (sync_id, primary_key)
            );
            "#,
        ),
        // Migration 2: Lookup indexes for the scheduler and discard cascade
        M::up(
            r#"
            CREATE INDEX idx_sync_runs_status ON sync_runs(status) WHERE discarded_at IS NULL;
            CREATE INDEX idx_sync_records_run ON sync_records(sync_run_id);
            "#,
        ),
    ])
}

const SYNC_COLUMNS: &str = "id, workspace_id, source_id, destination_id, model_id, status,
    schedule_type, sync_interval, sync_interval_unit, cron_expression, stream_name, sync_mode,
    cursor_field, current_cursor_field, configuration, created_at, updated_at, discarded_at";

const RUN_COLUMNS: &str = "id, sync_id, status, sync_run_type, total_query_rows, total_rows,
    successful_rows, failed_rows, workspace_id, source_id, destination_id, model_id, error,
    started_at, finished_at, created_at, updated_at, discarded_at, lock_version";

const RECORD_COLUMNS: &str =
    "sync_id, sync_run_id, fingerprint, primary_key, created_at, updated_at";

/// SQLite-based sync storage
pub struct SqliteSyncStore {
    conn: Mutex<Connection>,
}

impl SqliteSyncStore {
    /// Open (or create) the database at `db_path` and run migrations
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::with_connection(conn)
    }

    /// A private in-memory database, for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets the scheduler read while a worker writes counters
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

// === Row mapping ===

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

fn opt_enum_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn rfc3339(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(|t| t.to_rfc3339())
}

fn connector_from_row(row: &Row<'_>) -> rusqlite::Result<Connector> {
    let catalog: Option<String> = row.get(6)?;
    Ok(Connector {
        id: ConnectorId(row.get(0)?),
        workspace_id: row.get(1)?,
        connector_type: enum_col(row, 2)?,
        name: row.get(3)?,
        connector_name: row.get(4)?,
        configuration: json_col(row, 5)?,
        catalog: catalog
            .map(|c| serde_json::from_str(&c).map_err(|e| conversion_error(6, e)))
            .transpose()?,
        created_at: time_col(row, 7)?,
    })
}

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<Model> {
    Ok(Model {
        id: ModelId(row.get(0)?),
        workspace_id: row.get(1)?,
        connector_id: ConnectorId(row.get(2)?),
        name: row.get(3)?,
        query: row.get(4)?,
        query_type: enum_col(row, 5)?,
        primary_key: row.get(6)?,
    })
}

fn sync_from_row(row: &Row<'_>) -> rusqlite::Result<SyncDefinition> {
    Ok(SyncDefinition {
        id: SyncId(row.get(0)?),
        workspace_id: row.get(1)?,
        source_id: ConnectorId(row.get(2)?),
        destination_id: ConnectorId(row.get(3)?),
        model_id: ModelId(row.get(4)?),
        status: enum_col(row, 5)?,
        schedule_type: enum_col(row, 6)?,
        sync_interval: row.get(7)?,
        sync_interval_unit: opt_enum_col(row, 8)?,
        cron_expression: row.get(9)?,
        stream_name: row.get(10)?,
        sync_mode: enum_col(row, 11)?,
        cursor_field: row.get(12)?,
        current_cursor_field: row.get(13)?,
        configuration: json_col(row, 14)?,
        created_at: time_col(row, 15)?,
        updated_at: time_col(row, 16)?,
        discarded_at: opt_time_col(row, 17)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
    Ok(SyncRun {
        id: SyncRunId(row.get(0)?),
        sync_id: SyncId(row.get(1)?),
        status: enum_col(row, 2)?,
        sync_run_type: enum_col(row, 3)?,
        total_query_rows: row.get::<_, i64>(4)? as u64,
        total_rows: row.get::<_, i64>(5)? as u64,
        successful_rows: row.get::<_, i64>(6)? as u64,
        failed_rows: row.get::<_, i64>(7)? as u64,
        workspace_id: row.get(8)?,
        source_id: ConnectorId(row.get(9)?),
        destination_id: ConnectorId(row.get(10)?),
        model_id: ModelId(row.get(11)?),
        error: row.get(12)?,
        started_at: opt_time_col(row, 13)?,
        finished_at: opt_time_col(row, 14)?,
        created_at: time_col(row, 15)?,
        updated_at: time_col(row, 16)?,
        discarded_at: opt_time_col(row, 17)?,
        lock_version: row.get::<_, i64>(18)? as u64,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<SyncRecord> {
    Ok(SyncRecord {
        sync_id: SyncId(row.get(0)?),
        sync_run_id: row.get::<_, Option<i64>>(1)?.map(SyncRunId),
        fingerprint: row.get(2)?,
        primary_key: row.get(3)?,
        created_at: time_col(row, 4)?,
        updated_at: time_col(row, 5)?,
    })
}

impl SyncStore for SqliteSyncStore {
    fn insert_connector(&self, mut connector: Connector) -> Result<Connector> {
        let conn = self.conn.lock().unwrap();
        let catalog = connector
            .catalog
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            "INSERT INTO connectors
             (workspace_id, connector_type, name, connector_name, configuration, catalog, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                connector.workspace_id,
                connector.connector_type.as_str(),
                connector.name,
                connector.connector_name,
                serde_json::to_string(&connector.configuration)?,
                catalog,
                connector.created_at.to_rfc3339(),
            ],
        )?;

        connector.id = ConnectorId(conn.last_insert_rowid());
        Ok(connector)
    }

    fn get_connector(&self, id: ConnectorId) -> Result<Option<Connector>> {
        let conn = self.conn.lock().unwrap();
        let connector = conn
            .query_row(
                "SELECT id, workspace_id, connector_type, name, connector_name, configuration,
                        catalog, created_at
                 FROM connectors WHERE id = ?",
                [id.0],
                connector_from_row,
            )
            .optional()?;
        Ok(connector)
    }

    fn insert_model(&self, mut model: Model) -> Result<Model> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO models (workspace_id, connector_id, name, query, query_type, primary_key)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                model.workspace_id,
                model.connector_id.0,
                model.name,
                model.query,
                model.query_type.as_str(),
                model.primary_key,
            ],
        )?;

        model.id = ModelId(conn.last_insert_rowid());
        Ok(model)
    }

    fn get_model(&self, id: ModelId) -> Result<Option<Model>> {
        let conn = self.conn.lock().unwrap();
        let model = conn
            .query_row(
                "SELECT id, workspace_id, connector_id, name, query, query_type, primary_key
                 FROM models WHERE id = ?",
                [id.0],
                model_from_row,
            )
            .optional()?;
        Ok(model)
    }

    fn insert_sync(&self, mut sync: SyncDefinition) -> Result<SyncDefinition> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO syncs
             (workspace_id, source_id, destination_id, model_id, status, schedule_type,
              sync_interval, sync_interval_unit, cron_expression, stream_name, sync_mode,
              cursor_field, current_cursor_field, configuration, created_at, updated_at,
              discarded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                sync.workspace_id,
                sync.source_id.0,
                sync.destination_id.0,
                sync.model_id.0,
                sync.status.as_str(),
                sync.schedule_type.as_str(),
                sync.sync_interval,
                sync.sync_interval_unit.map(|u| u.as_str()),
                sync.cron_expression,
                sync.stream_name,
                sync.sync_mode.as_str(),
                sync.cursor_field,
                sync.current_cursor_field,
                serde_json::to_string(&sync.configuration)?,
                sync.created_at.to_rfc3339(),
                sync.updated_at.to_rfc3339(),
                rfc3339(sync.discarded_at),
            ],
        )?;

        sync.id = SyncId(conn.last_insert_rowid());
        Ok(sync)
    }

    fn update_sync(&self, sync: &SyncDefinition) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE syncs SET
                workspace_id = ?, source_id = ?, destination_id = ?, model_id = ?, status = ?,
                schedule_type = ?, sync_interval = ?, sync_interval_unit = ?,
                cron_expression = ?, stream_name = ?, sync_mode = ?, cursor_field = ?,
                current_cursor_field = ?, configuration = ?, updated_at = ?
             WHERE id = ? AND discarded_at IS NULL",
            params![
                sync.workspace_id,
                sync.source_id.0,
                sync.destination_id.0,
                sync.model_id.0,
                sync.status.as_str(),
                sync.schedule_type.as_str(),
                sync.sync_interval,
                sync.sync_interval_unit.map(|u| u.as_str()),
                sync.cron_expression,
                sync.stream_name,
                sync.sync_mode.as_str(),
                sync.cursor_field,
                sync.current_cursor_field,
                serde_json::to_string(&sync.configuration)?,
                sync.updated_at.to_rfc3339(),
                sync.id.0,
            ],
        )?;

        if changed == 0 {
            return Err(anyhow!("Sync {} not found", sync.id));
        }
        Ok(())
    }

    fn get_sync(&self, id: SyncId, scope: Scope) -> Result<Option<SyncDefinition>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {SYNC_COLUMNS} FROM syncs WHERE id = ? AND {}",
            scope.sql_filter()
        );
        let sync = conn.query_row(&sql, [id.0], sync_from_row).optional()?;
        Ok(sync)
    }

    fn list_syncs(&self, scope: Scope) -> Result<Vec<SyncDefinition>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {SYNC_COLUMNS} FROM syncs WHERE {} ORDER BY id",
            scope.sql_filter()
        );
        let mut stmt = conn.prepare(&sql)?;
        let syncs = stmt
            .query_map([], sync_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(syncs)
    }

    fn set_current_cursor(&self, id: SyncId, cursor: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE syncs SET current_cursor_field = ?, updated_at = ? WHERE id = ?",
            params![cursor, Utc::now().to_rfc3339(), id.0],
        )?;
        if changed == 0 {
            return Err(anyhow!("Sync {} not found", id));
        }
        Ok(())
    }

    fn insert_run(&self, mut run: SyncRun) -> Result<SyncRun> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_runs
             (sync_id, status, sync_run_type, total_query_rows, total_rows, successful_rows,
              failed_rows, workspace_id, source_id, destination_id, model_id, error,
              started_at, finished_at, created_at, updated_at, discarded_at, lock_version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                run.sync_id.0,
                run.status.as_str(),
                run.sync_run_type.as_str(),
                run.total_query_rows as i64,
                run.total_rows as i64,
                run.successful_rows as i64,
                run.failed_rows as i64,
                run.workspace_id,
                run.source_id.0,
                run.destination_id.0,
                run.model_id.0,
                run.error,
                rfc3339(run.started_at),
                rfc3339(run.finished_at),
                run.created_at.to_rfc3339(),
                run.updated_at.to_rfc3339(),
                rfc3339(run.discarded_at),
                run.lock_version as i64,
            ],
        )?;

        run.id = SyncRunId(conn.last_insert_rowid());
        Ok(run)
    }

    fn get_run(&self, id: SyncRunId, scope: Scope) -> Result<Option<SyncRun>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = ? AND {}",
            scope.sql_filter()
        );
        let run = conn.query_row(&sql, [id.0], run_from_row).optional()?;
        Ok(run)
    }

    fn list_runs(&self, sync_id: SyncId, scope: Scope) -> Result<Vec<SyncRun>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs WHERE sync_id = ? AND {} ORDER BY id",
            scope.sql_filter()
        );
        let mut stmt = conn.prepare(&sql)?;
        let runs = stmt
            .query_map([sync_id.0], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn list_active_runs(&self) -> Result<Vec<SyncRun>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs
             WHERE discarded_at IS NULL
               AND status IN ('pending', 'started', 'querying', 'queued', 'in_progress')
             ORDER BY id"
        );
        let mut stmt = conn.prepare(&sql)?;
        let runs = stmt
            .query_map([], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn update_run_status(&self, update: StatusUpdate) -> Result<SyncRun> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        // COALESCE keeps the stored value when the update leaves a field unset
        let changed = tx.execute(
            "UPDATE sync_runs SET
                status = ?,
                started_at = COALESCE(?, started_at),
                finished_at = COALESCE(?, finished_at),
                error = COALESCE(?, error),
                updated_at = ?,
                lock_version = lock_version + 1
             WHERE id = ? AND lock_version = ?",
            params![
                update.status.as_str(),
                rfc3339(update.started_at),
                rfc3339(update.finished_at),
                update.error,
                update.updated_at.to_rfc3339(),
                update.run_id.0,
                update.expected_version as i64,
            ],
        )?;

        if changed == 0 {
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM sync_runs WHERE id = ?",
                [update.run_id.0],
                |row| row.get(0),
            )?;
            if exists == 0 {
                return Err(anyhow!("Sync run {} not found", update.run_id));
            }
            return Err(StaleRunError {
                run_id: update.run_id,
                expected_version: update.expected_version,
            }
            .into());
        }

        let sql = format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = ?");
        let run = tx.query_row(&sql, [update.run_id.0], run_from_row)?;
        tx.commit()?;
        Ok(run)
    }

    fn update_run_counters(&self, id: SyncRunId, counters: &RunCounters) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE sync_runs SET
                total_query_rows = ?, total_rows = ?, successful_rows = ?, failed_rows = ?,
                updated_at = ?
             WHERE id = ?",
            params![
                counters.total_query_rows as i64,
                counters.total_rows as i64,
                counters.successful_rows as i64,
                counters.failed_rows as i64,
                Utc::now().to_rfc3339(),
                id.0,
            ],
        )?;
        if changed == 0 {
            return Err(anyhow!("Sync run {} not found", id));
        }
        Ok(())
    }

    fn upsert_sync_record(&self, record: SyncRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_records
             (sync_id, primary_key, sync_run_id, fingerprint, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(sync_id, primary_key) DO UPDATE SET
                sync_run_id = excluded.sync_run_id,
                fingerprint = excluded.fingerprint,
                updated_at = excluded.updated_at",
            params![
                record.sync_id.0,
                record.primary_key,
                record.sync_run_id.map(|id| id.0),
                record.fingerprint,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn find_sync_record(&self, sync_id: SyncId, primary_key: &str) -> Result<Option<SyncRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records WHERE sync_id = ? AND primary_key = ?"
        );
        let record = conn
            .query_row(&sql, params![sync_id.0, primary_key], record_from_row)
            .optional()?;
        Ok(record)
    }

    fn list_sync_records(&self, sync_id: SyncId) -> Result<Vec<SyncRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records WHERE sync_id = ? ORDER BY primary_key"
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map([sync_id.0], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn discard_sync(&self, id: SyncId, at: DateTime<Utc>) -> Result<DiscardOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let at = at.to_rfc3339();

        let changed = tx.execute(
            "UPDATE syncs SET discarded_at = ? WHERE id = ? AND discarded_at IS NULL",
            params![at, id.0],
        )?;
        if changed == 0 {
            return Ok(DiscardOutcome::default());
        }

        tx.execute(
            "UPDATE sync_runs SET discarded_at = ? WHERE sync_id = ? AND discarded_at IS NULL",
            params![at, id.0],
        )?;

        let discarded_runs = {
            let mut stmt = tx.prepare("SELECT id FROM sync_runs WHERE sync_id = ? ORDER BY id")?;
            stmt.query_map([id.0], |row| row.get::<_, i64>(0).map(SyncRunId))?
                .collect::<Result<Vec<_>, _>>()?
        };

        let detached_records = tx.execute(
            "UPDATE sync_records SET sync_run_id = NULL
             WHERE sync_run_id IN (SELECT id FROM sync_runs WHERE sync_id = ?)",
            [id.0],
        )?;

        tx.commit()?;
        Ok(DiscardOutcome {
            sync_id: Some(id),
            discarded_runs,
            detached_records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Catalog, CatalogStream, ScheduleType, SyncIntervalUnit, SyncMode, SyncRunStatus,
        SyncRunType, SyncStatus,
    };
    use tempfile::tempdir;

    fn create_test_store() -> (SqliteSyncStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        // Use .test.sqlite extension to clearly distinguish from production databases
        let store = SqliteSyncStore::new(dir.path().join("relay.test.sqlite")).unwrap();
        (store, dir)
    }

    fn seed_sync(store: &SqliteSyncStore) -> SyncDefinition {
        let source = store
            .insert_connector(Connector::source("warehouse", "JsonFile"))
            .unwrap();
        let destination = store
            .insert_connector(
                Connector::destination("crm", "Http")
                    .with_catalog(Catalog::new(vec![CatalogStream::new("profile")])),
            )
            .unwrap();
        let model = store
            .insert_model(Model::new(source.id, "users", "SELECT * FROM users", "id"))
            .unwrap();

        let now = Utc::now();
        store
            .insert_sync(SyncDefinition {
                id: SyncId(0),
                workspace_id: 1,
                source_id: source.id,
                destination_id: destination.id,
                model_id: model.id,
                status: SyncStatus::Pending,
                schedule_type: ScheduleType::Interval,
                sync_interval: Some(3),
                sync_interval_unit: Some(SyncIntervalUnit::Hours),
                cron_expression: None,
                stream_name: "profile".to_string(),
                sync_mode: SyncMode::Incremental,
                cursor_field: Some("updated_at".to_string()),
                current_cursor_field: None,
                configuration: Default::default(),
                created_at: now,
                updated_at: now,
                discarded_at: None,
            })
            .unwrap()
    }

    #[test]
    fn test_connector_round_trip() {
        let (store, _dir) = create_test_store();
        let sync = seed_sync(&store);

        let destination = store.get_connector(sync.destination_id).unwrap().unwrap();
        assert_eq!(destination.connector_name, "Http");
        assert!(destination.catalog.unwrap().stream("profile").is_some());
        assert!(store.get_connector(ConnectorId(999)).unwrap().is_none());
    }

    #[test]
    fn test_sync_crud() {
        let (store, _dir) = create_test_store();
        let mut sync = seed_sync(&store);

        let loaded = store.get_sync(sync.id, Scope::Kept).unwrap().unwrap();
        assert_eq!(loaded.sync_interval, Some(3));
        assert_eq!(loaded.sync_interval_unit, Some(SyncIntervalUnit::Hours));
        assert_eq!(loaded.sync_mode, SyncMode::Incremental);

        sync.schedule_type = ScheduleType::CronExpression;
        sync.sync_interval = None;
        sync.sync_interval_unit = None;
        sync.cron_expression = Some("0 0 */2 * *".to_string());
        store.update_sync(&sync).unwrap();

        let loaded = store.get_sync(sync.id, Scope::Kept).unwrap().unwrap();
        assert_eq!(loaded.cron_expression.as_deref(), Some("0 0 */2 * *"));
        assert!(loaded.sync_interval.is_none());

        store.set_current_cursor(sync.id, Some("2024-05-01")).unwrap();
        let loaded = store.get_sync(sync.id, Scope::Kept).unwrap().unwrap();
        assert_eq!(loaded.current_cursor_field.as_deref(), Some("2024-05-01"));
    }

    #[test]
    fn test_run_status_compare_and_swap() {
        let (store, _dir) = create_test_store();
        let sync = seed_sync(&store);
        let run = store
            .insert_run(SyncRun::for_sync(&sync, SyncRunType::Test))
            .unwrap();

        let started_at = Utc::now();
        let updated = store
            .update_run_status(StatusUpdate {
                run_id: run.id,
                expected_version: 0,
                status: SyncRunStatus::Started,
                started_at: Some(started_at),
                finished_at: None,
                error: None,
                updated_at: started_at,
            })
            .unwrap();
        assert_eq!(updated.status, SyncRunStatus::Started);
        assert_eq!(updated.lock_version, 1);
        assert!(updated.started_at.is_some());
        assert_eq!(updated.sync_run_type, SyncRunType::Test);

        let stale = store.update_run_status(StatusUpdate {
            run_id: run.id,
            expected_version: 0,
            status: SyncRunStatus::Canceled,
            started_at: None,
            finished_at: None,
            error: None,
            updated_at: Utc::now(),
        });
        assert!(stale.unwrap_err().downcast_ref::<StaleRunError>().is_some());

        let missing = store.update_run_status(StatusUpdate {
            run_id: SyncRunId(4242),
            expected_version: 0,
            status: SyncRunStatus::Canceled,
            started_at: None,
            finished_at: None,
            error: None,
            updated_at: Utc::now(),
        });
        assert!(missing.unwrap_err().downcast_ref::<StaleRunError>().is_none());
    }

    #[test]
    fn test_active_runs_exclude_paused_and_terminal() {
        let (store, _dir) = create_test_store();
        let sync = seed_sync(&store);

        for status in SyncRunStatus::ALL {
            let mut run = SyncRun::for_sync(&sync, SyncRunType::General);
            run.status = status;
            store.insert_run(run).unwrap();
        }

        let active: Vec<_> = store
            .list_active_runs()
            .unwrap()
            .into_iter()
            .map(|r| r.status)
            .collect();
        assert_eq!(
            active,
            vec![
                SyncRunStatus::Pending,
                SyncRunStatus::Started,
                SyncRunStatus::Querying,
                SyncRunStatus::Queued,
                SyncRunStatus::InProgress,
            ]
        );
    }

    #[test]
    fn test_discard_cascades_and_detaches_records() {
        let (store, _dir) = create_test_store();
        let sync = seed_sync(&store);
        let other = seed_sync(&store);
        let run = store
            .insert_run(SyncRun::for_sync(&sync, SyncRunType::General))
            .unwrap();
        let other_run = store
            .insert_run(SyncRun::for_sync(&other, SyncRunType::General))
            .unwrap();
        store
            .upsert_sync_record(SyncRecord::new(sync.id, run.id, "unique_fingerprint", "key1"))
            .unwrap();

        let outcome = store.discard_sync(sync.id, Utc::now()).unwrap();
        assert_eq!(outcome.discarded_runs, vec![run.id]);
        assert_eq!(outcome.detached_records, 1);

        assert!(store.get_sync(sync.id, Scope::Kept).unwrap().is_none());
        assert!(store.get_sync(sync.id, Scope::DiscardedOnly).unwrap().is_some());
        assert!(store.list_runs(sync.id, Scope::Kept).unwrap().is_empty());

        let discarded = store.get_run(run.id, Scope::WithDiscarded).unwrap().unwrap();
        assert!(discarded.discarded_at.is_some());
        let untouched = store.get_run(other_run.id, Scope::Kept).unwrap().unwrap();
        assert!(untouched.discarded_at.is_none());

        let record = store.find_sync_record(sync.id, "key1").unwrap().unwrap();
        assert!(record.sync_run_id.is_none());
        assert_eq!(record.fingerprint, "unique_fingerprint");
    }

    #[test]
    fn test_update_discarded_sync_fails() {
        let (store, _dir) = create_test_store();
        let sync = seed_sync(&store);
        store.discard_sync(sync.id, Utc::now()).unwrap();

        assert!(store.update_sync(&sync).is_err());
    }
}

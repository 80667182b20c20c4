//! SQLite-backed [`TaskStore`] using a `sqlx` connection pool.
//!
//! Timestamps are stored as UTC epoch milliseconds and key-value mappings as
//! JSON text. The schema is applied from the embedded migrations on open.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use hearth_core::config::StorageConfig;

use super::{TaskStore, INTERRUPTED_ERROR};
use crate::error::StoreError;
use crate::model::{ExecutionOutcome, ExecutionStatus, Params, Task, TaskExecution, TaskStatus};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TASK_COLUMNS: &str = "id, name, task_type, schedule, params, enabled, \
     last_run, next_run, status, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, task_id, started_at, completed_at, status, result, error";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    /// Advisory lock on `<db>.lock`, held while any clone is alive.
    owner: Option<Arc<File>>,
}

impl SqliteStore {
    /// Open (creating if missing) the database file at `path` and apply the schema.
    ///
    /// Does not take the owner lock; use this only for read-only access next
    /// to a process that may hold it.
    pub async fn open(path: &Path, max_connections: u32) -> Result<Self, StoreError> {
        create_parent(path)?;
        Self::connect(path, max_connections, None).await
    }

    /// Open the database as its only writer.
    ///
    /// Fails with [`StoreError::Locked`] while another store opened this way,
    /// in this or any other process, is still alive. The lock is released by
    /// the OS if the holder exits without cleanup.
    pub async fn open_exclusive(path: &Path, max_connections: u32) -> Result<Self, StoreError> {
        create_parent(path)?;
        let owner = acquire_owner_lock(path)?;
        Self::connect(path, max_connections, Some(Arc::new(owner))).await
    }

    async fn connect(
        path: &Path,
        max_connections: u32,
        owner: Option<Arc<File>>,
    ) -> Result<Self, StoreError> {

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool, owner };
        store.migrate().await?;
        info!(path = %path.display(), exclusive = store.owner.is_some(), "scheduler store opened");
        Ok(store)
    }

    /// Open the database described by the storage section of the config.
    pub async fn open_config(config: &StorageConfig) -> Result<Self, StoreError> {
        Self::open(&config.database_path(), config.max_connections).await
    }

    /// [`SqliteStore::open_exclusive`] for the configured database.
    pub async fn open_config_exclusive(config: &StorageConfig) -> Result<Self, StoreError> {
        Self::open_exclusive(&config.database_path(), config.max_connections).await
    }

    /// Private in-memory database, alive as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        // A second connection would see a different, empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool, owner: None };
        store.migrate().await?;
        debug!("in-memory scheduler store opened");
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn create_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn owner_lock_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

fn acquire_owner_lock(path: &Path) -> Result<File, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(owner_lock_path(path))?;
    match file.try_lock() {
        Ok(()) => Ok(file),
        Err(TryLockError::WouldBlock) => Err(StoreError::Locked(path.to_path_buf())),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

// ── Row mapping ──────────────────────────────────────────────────────

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(table: &'static str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        table,
        detail: format!("timestamp out of range: {ms}"),
    })
}

fn opt_from_millis(table: &'static str, ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(|ms| from_millis(table, ms)).transpose()
}

fn parse_params(table: &'static str, raw: Option<String>) -> Result<Params, StoreError> {
    match raw.as_deref() {
        None | Some("") => Ok(Params::new()),
        Some(text) => match serde_json::from_str::<serde_json::Value>(text)? {
            serde_json::Value::Object(map) => Ok(map),
            serde_json::Value::Null => Ok(Params::new()),
            other => Err(StoreError::Corrupt {
                table,
                detail: format!("expected JSON object, got {other}"),
            }),
        },
    }
}

fn task_from_row(row: &SqliteRow) -> Result<Task, StoreError> {
    let status: String = row.try_get("status")?;
    let status = TaskStatus::from_str(&status)
        .map_err(|detail| StoreError::Corrupt { table: "tasks", detail })?;

    Ok(Task {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        task_type: row.try_get("task_type")?,
        schedule: row.try_get("schedule")?,
        params: parse_params("tasks", row.try_get("params")?)?,
        enabled: row.try_get("enabled")?,
        last_run: opt_from_millis("tasks", row.try_get("last_run")?)?,
        next_run: opt_from_millis("tasks", row.try_get("next_run")?)?,
        status,
        created_at: from_millis("tasks", row.try_get("created_at")?)?,
        updated_at: from_millis("tasks", row.try_get("updated_at")?)?,
    })
}

fn execution_from_row(row: &SqliteRow) -> Result<TaskExecution, StoreError> {
    let status: String = row.try_get("status")?;
    let status = ExecutionStatus::from_str(&status).map_err(|detail| StoreError::Corrupt {
        table: "task_executions",
        detail,
    })?;

    Ok(TaskExecution {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        started_at: from_millis("task_executions", row.try_get("started_at")?)?,
        completed_at: opt_from_millis("task_executions", row.try_get("completed_at")?)?,
        status,
        result: parse_params("task_executions", row.try_get("result")?)?,
        error: row.try_get("error")?,
    })
}

// ── TaskStore impl ───────────────────────────────────────────────────

#[async_trait]
impl TaskStore for SqliteStore {
    async fn put_task(&self, task: &Task) -> Result<(), StoreError> {
        let params = serde_json::to_string(&task.params)?;

        // Upsert rather than REPLACE: a REPLACE deletes the row first and
        // would cascade away the task's execution history.
        sqlx::query(
            "INSERT INTO tasks (id, name, task_type, schedule, params, enabled,
                                last_run, next_run, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                task_type = excluded.task_type,
                schedule = excluded.schedule,
                params = excluded.params,
                enabled = excluded.enabled,
                last_run = excluded.last_run,
                next_run = excluded.next_run,
                status = excluded.status,
                updated_at = excluded.updated_at",
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.task_type)
        .bind(&task.schedule)
        .bind(params)
        .bind(task.enabled)
        .bind(task.last_run.map(to_millis))
        .bind(task.next_run.map(to_millis))
        .bind(task.status.as_str())
        .bind(to_millis(task.created_at))
        .bind(to_millis(task.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn append_execution(
        &self,
        task_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO task_executions (task_id, started_at, status)
             VALUES (?, ?, 'running')",
        )
        .bind(task_id)
        .bind(to_millis(started_at))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn complete_execution(
        &self,
        id: i64,
        outcome: &ExecutionOutcome,
    ) -> Result<(), StoreError> {
        let result_json = serde_json::to_string(&outcome.result)?;

        let result = sqlx::query(
            "UPDATE task_executions
             SET status = ?, completed_at = ?, result = ?, error = ?
             WHERE id = ? AND status = 'running'",
        )
        .bind(outcome.status.as_str())
        .bind(to_millis(outcome.completed_at))
        .bind(result_json)
        .bind(&outcome.error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(id));
        }
        Ok(())
    }

    async fn get_execution(&self, id: i64) -> Result<Option<TaskExecution>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    async fn executions_for_task(
        &self,
        task_id: &str,
        limit: u32,
    ) -> Result<Vec<TaskExecution>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM task_executions
             WHERE task_id = ?
             ORDER BY started_at DESC, id DESC
             LIMIT ?"
        ))
        .bind(task_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(execution_from_row).collect()
    }

    async fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE task_executions
             SET status = 'failed', completed_at = ?, error = ?
             WHERE status = 'running'",
        )
        .bind(to_millis(now))
        .bind(INTERRUPTED_ERROR)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from the persistent store. Never retried internally.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("execution not found: {0}")]
    ExecutionNotFound(i64),

    #[error("store {} is locked by another process", .0.display())]
    Locked(PathBuf),

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

/// Errors returned by scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid task: {0}")]
    Validation(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task already exists: {0}")]
    DuplicateTask(String),

    #[error("task already running: {0}")]
    AlreadyRunning(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("shutdown deadline of {0:?} exceeded with executions still in flight")]
    ShutdownTimeout(Duration),
}

impl SchedulerError {
    /// Whether the error is a duplicate-admission rejection.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SchedulerError::AlreadyRunning(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedulerError::TaskNotFound(_))
    }
}

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;

//! Durable storage for task definitions and execution history.
//!
//! [`TaskStore`] is the persistence contract the registry and coordinator
//! write through. [`SqliteStore`] is the file-backed implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{ExecutionOutcome, Task, TaskExecution};

/// Error text recorded on executions found `running` at startup.
pub const INTERRUPTED_ERROR: &str = "interrupted by restart";

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or overwrite a task row.
    async fn put_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, StoreError>;

    /// Delete a task and its executions. Returns `false` if no row existed.
    async fn delete_task(&self, id: &str) -> Result<bool, StoreError>;

    async fn list_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Append a `running` execution record and return its id.
    async fn append_execution(
        &self,
        task_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Fill in the completion fields of a `running` execution.
    ///
    /// Fails with [`StoreError::ExecutionNotFound`] if the record is gone or
    /// already complete.
    async fn complete_execution(
        &self,
        id: i64,
        outcome: &ExecutionOutcome,
    ) -> Result<(), StoreError>;

    async fn get_execution(&self, id: i64) -> Result<Option<TaskExecution>, StoreError>;

    /// Executions of one task, newest `started_at` first.
    async fn executions_for_task(
        &self,
        task_id: &str,
        limit: u32,
    ) -> Result<Vec<TaskExecution>, StoreError>;

    /// Mark every execution still `running` as failed. Returns how many changed.
    async fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

//! In-memory task cache kept consistent with the store.
//!
//! Every mutation takes the exclusive lock, writes through to the store and
//! only then updates the cache, so a crash never loses an acknowledged write.
//! Reads take the shared lock and return clones.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};
use crate::model::{Task, TaskStatus};
use crate::schedule;
use crate::store::TaskStore;

pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Task>>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl TaskRegistry {
    /// Load every task from the store.
    pub async fn load(store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        let tasks: HashMap<String, Task> = store
            .list_tasks()
            .await?
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();

        info!(tasks = tasks.len(), "task registry loaded");
        Ok(Self {
            tasks: RwLock::new(tasks),
            store,
            clock,
        })
    }

    /// Return tasks left `running` by a previous process to `idle`.
    ///
    /// Tasks whose `next_run` is missing are rescheduled from now. Returns
    /// how many tasks were reset.
    pub async fn recover(&self) -> Result<usize> {
        let mut tasks = self.tasks.write().await;
        let now = self.clock.now();
        let mut reset = 0;

        for task in tasks.values_mut() {
            if task.status != TaskStatus::Running {
                continue;
            }
            let mut recovered = task.clone();
            recovered.status = TaskStatus::Idle;
            if recovered.next_run.is_none() {
                recovered.next_run = schedule::next_run(&recovered.schedule, now);
            }
            recovered.updated_at = now;

            self.store.put_task(&recovered).await?;
            *task = recovered;
            reset += 1;
        }
        Ok(reset)
    }

    /// Register a new task. Assigns an id when empty and stamps server fields.
    pub async fn add(&self, mut task: Task) -> Result<Task> {
        validate(&task)?;
        normalize_schedule(&mut task);
        if task.id.trim().is_empty() {
            task.id = Uuid::new_v4().to_string();
        }

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(SchedulerError::DuplicateTask(task.id));
        }

        let now = self.clock.now();
        task.created_at = now;
        task.updated_at = now;
        task.status = TaskStatus::Idle;
        task.last_run = None;
        task.next_run = schedule::next_run(&task.schedule, now);

        self.store.put_task(&task).await?;
        tasks.insert(task.id.clone(), task.clone());
        debug!(task_id = %task.id, next_run = ?task.next_run, "task stored");
        Ok(task)
    }

    /// Replace the caller-owned fields of an existing task.
    ///
    /// `created_at`, `last_run` and `status` are kept; `next_run` is recomputed.
    pub async fn update(&self, mut task: Task) -> Result<Task> {
        validate(&task)?;
        normalize_schedule(&mut task);

        let mut tasks = self.tasks.write().await;
        let existing = tasks
            .get(&task.id)
            .ok_or_else(|| SchedulerError::TaskNotFound(task.id.clone()))?;

        let now = self.clock.now();
        let updated = Task {
            id: existing.id.clone(),
            name: task.name,
            task_type: task.task_type,
            schedule: task.schedule,
            params: task.params,
            enabled: task.enabled,
            last_run: existing.last_run,
            next_run: None,
            status: existing.status,
            created_at: existing.created_at,
            updated_at: now,
        };
        let updated = Task {
            next_run: schedule::next_run(&updated.schedule, now),
            ..updated
        };

        self.store.put_task(&updated).await?;
        tasks.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    /// Remove a task from the store and then the cache.
    ///
    /// In-flight executions must be cancelled by the caller first.
    pub async fn delete(&self, id: &str) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(id) {
            return Err(SchedulerError::TaskNotFound(id.to_string()));
        }

        self.store.delete_task(id).await?;
        tasks
            .remove(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))
    }

    pub async fn get(&self, id: &str) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.tasks.read().await.contains_key(id)
    }

    /// Snapshot of all tasks, oldest first.
    pub async fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Flip a task to `running` and stamp `last_run`.
    ///
    /// The cache always changes; the returned error only reports the store
    /// write, which callers treat as best-effort.
    pub async fn mark_running(&self, id: &str, started_at: DateTime<Utc>) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        task.status = TaskStatus::Running;
        task.last_run = Some(started_at);
        task.updated_at = started_at;
        let snapshot = task.clone();

        self.store.put_task(&snapshot).await?;
        Ok(())
    }

    /// Record a terminal status and reschedule relative to `completed_at`.
    ///
    /// The cache is updated even if the store write fails; it stays
    /// authoritative until the next successful write or a restart.
    pub async fn mark_finished(
        &self,
        id: &str,
        status: TaskStatus,
        completed_at: DateTime<Utc>,
    ) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound(id.to_string()))?;

        task.status = status;
        task.next_run = schedule::next_run(&task.schedule, completed_at);
        task.updated_at = completed_at;
        let snapshot = task.clone();

        self.store.put_task(&snapshot).await?;
        Ok(snapshot)
    }
}

/// A blank schedule is stored as `""` so the row says "manual" as plainly as
/// the missing `next_run` does.
fn normalize_schedule(task: &mut Task) {
    if schedule::is_manual(&task.schedule) {
        task.schedule.clear();
    }
}

fn validate(task: &Task) -> Result<()> {
    if task.name.trim().is_empty() {
        return Err(SchedulerError::Validation("name must not be empty".into()));
    }
    if task.task_type.trim().is_empty() {
        return Err(SchedulerError::Validation("type must not be empty".into()));
    }
    if task.id.chars().any(char::is_control) {
        return Err(SchedulerError::Validation(
            "id must not contain control characters".into(),
        ));
    }
    Ok(())
}

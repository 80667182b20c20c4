//! The management API: task CRUD, manual execution, history and lifecycle.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use hearth_core::config::SchedulerConfig;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::coordinator::Coordinator;
use crate::error::{Result, SchedulerError};
use crate::events::{EventBus, SchedulerEvent};
use crate::handler::HandlerRegistry;
use crate::model::{Task, TaskExecution};
use crate::registry::TaskRegistry;
use crate::scanner::Scanner;
use crate::store::TaskStore;

/// Upper bound on a single history query.
pub const MAX_HISTORY_LIMIT: u32 = 1000;

#[derive(Clone)]
pub struct SchedulerOptions {
    pub tick_interval: Duration,
    pub clock: Arc<dyn Clock>,
    /// Fail executions and reset tasks left `running` by a previous process.
    /// Only the process that owns the store should enable this.
    pub recover: bool,
}

impl SchedulerOptions {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            ..Self::default()
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_recovery(mut self, recover: bool) -> Self {
        self.recover = recover;
        self
    }
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            clock: Arc::new(SystemClock),
            recover: true,
        }
    }
}

impl std::fmt::Debug for SchedulerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerOptions")
            .field("tick_interval", &self.tick_interval)
            .field("recover", &self.recover)
            .finish_non_exhaustive()
    }
}

pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    coordinator: Arc<Coordinator>,
    scanner: Arc<Scanner>,
    events: EventBus,
    scanner_stop: CancellationToken,
    scanner_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Load all tasks and, if enabled, recover state left by a previous process.
    ///
    /// The scanner does not run until [`Scheduler::start`] is called.
    pub async fn open(
        store: Arc<dyn TaskStore>,
        handlers: HandlerRegistry,
        options: SchedulerOptions,
    ) -> Result<Self> {
        let clock = options.clock;

        let registry = Arc::new(TaskRegistry::load(Arc::clone(&store), Arc::clone(&clock)).await?);
        if options.recover {
            let interrupted = store.recover_interrupted(clock.now()).await?;
            let reset = registry.recover().await?;
            if interrupted > 0 || reset > 0 {
                warn!(
                    executions = interrupted,
                    tasks = reset,
                    "recovered state interrupted by restart"
                );
            }
        }
        let events = EventBus::new();
        let handlers = Arc::new(handlers);

        let mut unhandled: Vec<String> = registry
            .list()
            .await
            .into_iter()
            .filter(|task| !handlers.contains(&task.task_type))
            .map(|task| task.task_type)
            .collect();
        unhandled.sort();
        unhandled.dedup();
        if !unhandled.is_empty() {
            warn!(task_types = ?unhandled, "tasks reference unregistered handler types");
        }

        let coordinator = Arc::new(Coordinator::new(
            Arc::clone(&registry),
            Arc::clone(&handlers),
            Arc::clone(&store),
            Arc::clone(&clock),
            events.clone(),
        ));
        let scanner = Arc::new(Scanner::new(
            Arc::clone(&registry),
            Arc::clone(&coordinator),
            clock,
            options.tick_interval,
        ));

        info!(
            tasks = registry.len().await,
            handlers = handlers.len(),
            "scheduler opened"
        );

        Ok(Self {
            store,
            registry,
            coordinator,
            scanner,
            events,
            scanner_stop: CancellationToken::new(),
            scanner_handle: Mutex::new(None),
        })
    }

    /// Spawn the scanner loop. Returns `false` if it was already started.
    pub fn start(&self) -> bool {
        let mut handle = self
            .scanner_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() || self.scanner_stop.is_cancelled() {
            return false;
        }
        let scanner = Arc::clone(&self.scanner);
        *handle = Some(tokio::spawn(scanner.run(self.scanner_stop.clone())));
        true
    }

    /// Run one scan at the clock's current time. Returns executions started.
    pub async fn scan_once(&self) -> usize {
        self.scanner.scan_once().await
    }

    pub async fn add_task(&self, task: Task) -> Result<Task> {
        let task = self.registry.add(task).await?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            schedule = %task.schedule,
            "task added"
        );
        self.events.emit(SchedulerEvent::TaskAdded {
            task_id: task.id.clone(),
        });
        Ok(task)
    }

    pub async fn update_task(&self, task: Task) -> Result<Task> {
        let task = self.registry.update(task).await?;
        info!(
            task_id = %task.id,
            schedule = %task.schedule,
            enabled = task.enabled,
            "task updated"
        );
        self.events.emit(SchedulerEvent::TaskUpdated {
            task_id: task.id.clone(),
        });
        Ok(task)
    }

    /// Cancel any in-flight execution, then remove the task and its history.
    ///
    /// Returns once cancellation has been requested; the handler may still be
    /// winding down.
    pub async fn delete_task(&self, id: &str) -> Result<Task> {
        if !self.registry.contains(id).await {
            return Err(SchedulerError::TaskNotFound(id.to_string()));
        }
        let cancelled_running = self.coordinator.cancel(id);
        let task = self.registry.delete(id).await?;

        info!(task_id = %id, cancelled_running, "task deleted");
        self.events.emit(SchedulerEvent::TaskDeleted {
            task_id: id.to_string(),
            cancelled_running,
        });
        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.registry.get(id).await
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.registry.list().await
    }

    /// Start an execution immediately, regardless of schedule or `enabled`.
    ///
    /// Fails with [`SchedulerError::AlreadyRunning`] rather than queueing.
    pub async fn execute_now(&self, id: &str) -> Result<i64> {
        let task = self.registry.get(id).await?;
        self.coordinator.submit(task).await
    }

    /// Most recent executions of a task, newest first.
    ///
    /// `limit` is clamped to `1..=1000`.
    pub async fn history(&self, task_id: &str, limit: u32) -> Result<Vec<TaskExecution>> {
        if !self.registry.contains(task_id).await {
            return Err(SchedulerError::TaskNotFound(task_id.to_string()));
        }
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.store.executions_for_task(task_id, limit).await?)
    }

    pub async fn execution(&self, id: i64) -> Result<Option<TaskExecution>> {
        Ok(self.store.get_execution(id).await?)
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.coordinator.is_running(task_id)
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.coordinator.running_ids()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Stop scanning, cancel running executions and wait for them to finish.
    ///
    /// Returns [`SchedulerError::ShutdownTimeout`] if executions are still in
    /// flight when `deadline` elapses.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        let started = Instant::now();
        info!(deadline_secs = deadline.as_secs_f64(), "scheduler shutting down");

        self.scanner_stop.cancel();
        let handle = self
            .scanner_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let mut scanner_stuck = false;
        if let Some(mut handle) = handle {
            match tokio::time::timeout(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "scanner task ended abnormally"),
                Err(_) => {
                    warn!("scanner did not stop before the deadline, aborting it");
                    handle.abort();
                    scanner_stuck = true;
                }
            }
        }

        // Executions are cancelled even when the scanner overran the deadline.
        let signalled = self.coordinator.cancel_all();
        if signalled > 0 {
            info!(executions = signalled, "cancelled running executions");
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        self.coordinator.shutdown(remaining).await.map_err(|e| match e {
            SchedulerError::ShutdownTimeout(_) => SchedulerError::ShutdownTimeout(deadline),
            other => other,
        })?;
        if scanner_stuck {
            return Err(SchedulerError::ShutdownTimeout(deadline));
        }

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "scheduler stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::handler::handler_fn;
    use crate::model::Params;
    use crate::store::SqliteStore;
    use chrono::{TimeZone, Utc};

    async fn open(handlers: HandlerRegistry) -> Scheduler {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap(),
        ));
        Scheduler::open(store, handlers, SchedulerOptions::default().with_clock(clock))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn history_of_unknown_task_is_not_found() {
        let scheduler = open(HandlerRegistry::new()).await;
        assert!(scheduler.history("nope", 10).await.unwrap_err().is_not_found());
        assert!(scheduler.execute_now("nope").await.unwrap_err().is_not_found());
        assert!(scheduler.delete_task("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn history_limit_is_clamped() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("noop", handler_fn(|_, _| async { Ok(Params::new()) }));
        let scheduler = open(handlers).await;
        let task = scheduler.add_task(Task::new("Noop", "noop", "")).await.unwrap();

        let mut events = scheduler.subscribe();
        scheduler.execute_now(&task.id).await.unwrap();
        while !matches!(events.recv().await.unwrap(), SchedulerEvent::ExecutionFinished { .. }) {}

        let history = scheduler.history(&task.id, 0).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn events_follow_task_lifecycle() {
        let scheduler = open(HandlerRegistry::new()).await;
        let mut events = scheduler.subscribe();

        let mut task = scheduler.add_task(Task::new("Cleanup", "cleanup", "daily")).await.unwrap();
        task.enabled = false;
        scheduler.update_task(task.clone()).await.unwrap();
        scheduler.delete_task(&task.id).await.unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SchedulerEvent::TaskAdded { task_id: task.id.clone() }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SchedulerEvent::TaskUpdated { task_id: task.id.clone() }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SchedulerEvent::TaskDeleted {
                task_id: task.id.clone(),
                cancelled_running: false,
            }
        );
    }

    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_is_clean() {
        let scheduler = open(HandlerRegistry::new()).await;
        assert!(scheduler.start());
        assert!(!scheduler.start());
        scheduler.shutdown(Duration::from_secs(5)).await.unwrap();
        assert!(!scheduler.start());
    }
}

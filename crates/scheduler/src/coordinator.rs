//! Execution admission, spawning and cancellation.
//!
//! The running-set maps a task id to the cancellation token of its single
//! in-flight execution. Admission is a synchronous check-and-insert under a
//! std mutex, so two callers racing on the same task id can never both win.
//! The slot is released by a drop guard owned by the execution unit, after
//! the terminal state has been written and before `ExecutionFinished` is
//! emitted.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::error::{Result, SchedulerError, StoreError};
use crate::events::{EventBus, SchedulerEvent};
use crate::handler::{ExecutionContext, HandlerRegistry};
use crate::model::{ExecutionOutcome, ExecutionStatus, Task};
use crate::registry::TaskRegistry;
use crate::store::TaskStore;

type RunningSet = Arc<Mutex<HashMap<String, CancellationToken>>>;

fn lock(running: &RunningSet) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds a task's running-set entry for the lifetime of one execution.
struct RunningSlot {
    running: RunningSet,
    task_id: String,
    token: CancellationToken,
}

impl Drop for RunningSlot {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.task_id);
    }
}

pub struct Coordinator {
    registry: Arc<TaskRegistry>,
    handlers: Arc<HandlerRegistry>,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    running: RunningSet,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Coordinator {
    pub fn new(
        registry: Arc<TaskRegistry>,
        handlers: Arc<HandlerRegistry>,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            handlers,
            store,
            clock,
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    fn admit(&self, task_id: &str) -> Result<RunningSlot> {
        let mut running = lock(&self.running);
        if running.contains_key(task_id) {
            return Err(SchedulerError::AlreadyRunning(task_id.to_string()));
        }
        let token = self.shutdown.child_token();
        running.insert(task_id.to_string(), token.clone());
        Ok(RunningSlot {
            running: Arc::clone(&self.running),
            task_id: task_id.to_string(),
            token,
        })
    }

    /// Admit and start one execution of `task`.
    ///
    /// Returns the execution id once the `running` record is durable and the
    /// execution unit has been spawned. Rejects with
    /// [`SchedulerError::AlreadyRunning`] if the task is in flight.
    pub async fn submit(self: &Arc<Self>, task: Task) -> Result<i64> {
        let slot = self.admit(&task.id)?;
        let started_at = self.clock.now();

        // Dropping the slot on error releases the admission.
        let execution_id = self.store.append_execution(&task.id, started_at).await?;

        if let Err(e) = self.registry.mark_running(&task.id, started_at).await {
            warn!(task_id = %task.id, execution_id, error = %e, "failed to persist running status");
        }

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            execution_id,
            "execution started"
        );
        self.events.emit(SchedulerEvent::ExecutionStarted {
            task_id: task.id.clone(),
            execution_id,
        });

        let this = Arc::clone(self);
        self.tracker
            .spawn(async move { this.run(task, execution_id, slot).await });
        Ok(execution_id)
    }

    async fn run(self: Arc<Self>, task: Task, execution_id: i64, slot: RunningSlot) {
        let ctx = ExecutionContext::new(task.id.clone(), execution_id, slot.token.clone());

        let outcome = match self.handlers.get(&task.task_type) {
            None => ExecutionOutcome::failure(
                self.clock.now(),
                format!("no handler registered for task type '{}'", task.task_type),
            ),
            Some(handler) => {
                let result = AssertUnwindSafe(handler.execute(ctx, task.params.clone()))
                    .catch_unwind()
                    .await;
                let completed_at = self.clock.now();
                match result {
                    Ok(Ok(output)) => ExecutionOutcome::success(completed_at, output),
                    Ok(Err(e)) => ExecutionOutcome::failure(completed_at, e.to_string()),
                    Err(payload) => ExecutionOutcome::failure(
                        completed_at,
                        format!("handler panicked: {}", panic_message(payload.as_ref())),
                    ),
                }
            }
        };

        let status = outcome.status;
        self.finish(&task, execution_id, outcome).await;
        drop(slot);

        self.events.emit(SchedulerEvent::ExecutionFinished {
            task_id: task.id,
            execution_id,
            status,
        });
    }

    async fn finish(&self, task: &Task, execution_id: i64, outcome: ExecutionOutcome) {
        let status = outcome.status;

        if let Err(e) = self.store.complete_execution(execution_id, &outcome).await {
            let deleted = matches!(e, StoreError::ExecutionNotFound(_))
                && !self.registry.contains(&task.id).await;
            if deleted {
                debug!(task_id = %task.id, execution_id, "task deleted before execution completed");
            } else {
                error!(
                    task_id = %task.id,
                    execution_id,
                    error = %e,
                    "failed to record execution completion"
                );
            }
        }

        match self
            .registry
            .mark_finished(&task.id, status.into(), outcome.completed_at)
            .await
        {
            Ok(updated) => {
                if status == ExecutionStatus::Success {
                    info!(
                        task_id = %task.id,
                        execution_id,
                        next_run = ?updated.next_run,
                        "execution succeeded"
                    );
                } else {
                    warn!(
                        task_id = %task.id,
                        execution_id,
                        error = %outcome.error,
                        next_run = ?updated.next_run,
                        "execution failed"
                    );
                }
            }
            Err(SchedulerError::TaskNotFound(_)) => {
                debug!(task_id = %task.id, execution_id, "task deleted during execution");
            }
            Err(e) => {
                error!(
                    task_id = %task.id,
                    execution_id,
                    error = %e,
                    "failed to persist terminal task state"
                );
            }
        }
    }

    /// Request cancellation of the task's in-flight execution, if any.
    pub fn cancel(&self, task_id: &str) -> bool {
        match lock(&self.running).get(task_id) {
            Some(token) => {
                token.cancel();
                debug!(task_id = %task_id, "execution cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancel every in-flight execution. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let running = lock(&self.running);
        for token in running.values() {
            token.cancel();
        }
        running.len()
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        lock(&self.running).contains_key(task_id)
    }

    /// Ids of tasks currently executing, sorted.
    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.running).keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Execution units spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel everything and wait for execution units to drain.
    ///
    /// Units still running when `deadline` elapses keep finishing in the
    /// background.
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        self.shutdown.cancel();
        self.tracker.close();

        if tokio::time::timeout(deadline, self.tracker.wait()).await.is_err() {
            warn!(
                in_flight = self.tracker.len(),
                deadline_secs = deadline.as_secs_f64(),
                "shutdown deadline exceeded"
            );
            return Err(SchedulerError::ShutdownTimeout(deadline));
        }
        debug!("execution units drained");
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

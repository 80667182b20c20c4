//! Periodic due-task scan.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::coordinator::Coordinator;
use crate::registry::TaskRegistry;

pub struct Scanner {
    registry: Arc<TaskRegistry>,
    coordinator: Arc<Coordinator>,
    clock: Arc<dyn Clock>,
    tick: Duration,
}

impl Scanner {
    pub fn new(
        registry: Arc<TaskRegistry>,
        coordinator: Arc<Coordinator>,
        clock: Arc<dyn Clock>,
        tick: Duration,
    ) -> Self {
        Self {
            registry,
            coordinator,
            clock,
            tick,
        }
    }

    /// Submit every task due at the clock's current time. Returns how many
    /// executions were started.
    pub async fn scan_once(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<_> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|task| task.is_due(now) && !self.coordinator.is_running(&task.id))
            .collect();

        let mut started = 0;
        for task in due {
            let task_id = task.id.clone();
            match self.coordinator.submit(task).await {
                Ok(_) => started += 1,
                Err(e) if e.is_conflict() => {
                    debug!(task_id = %task_id, "due task already running, skipped");
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "failed to submit due task");
                }
            }
        }
        started
    }

    /// Scan on every tick until `stop` is cancelled. Missed ticks are skipped.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick_secs = self.tick.as_secs_f64(), "scanner started");

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    let started = self.scan_once().await;
                    if started > 0 {
                        debug!(started, "scan submitted due tasks");
                    }
                }
            }
        }
        info!("scanner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::EventBus;
    use crate::handler::{handler_fn, HandlerRegistry};
    use crate::model::{Params, Task};
    use crate::store::SqliteStore;
    use chrono::{TimeZone, Utc};

    async fn scanner() -> (Scanner, Arc<TaskRegistry>, Arc<ManualClock>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap(),
        ));
        let registry = Arc::new(TaskRegistry::load(store.clone(), clock.clone()).await.unwrap());
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "wait",
            handler_fn(|ctx, _| async move {
                ctx.cancelled().await;
                Ok(Params::new())
            }),
        );
        let coordinator = Arc::new(Coordinator::new(
            registry.clone(),
            Arc::new(handlers),
            store,
            clock.clone(),
            EventBus::new(),
        ));
        let scanner = Scanner::new(registry.clone(), coordinator, clock.clone(), Duration::from_secs(60));
        (scanner, registry, clock)
    }

    #[tokio::test]
    async fn only_enabled_due_tasks_are_submitted() {
        let (scanner, registry, clock) = scanner().await;
        registry.add(Task::new("Due", "wait", "every 30m")).await.unwrap();
        registry
            .add(Task::new("Disabled", "wait", "every 30m").with_enabled(false))
            .await
            .unwrap();
        registry.add(Task::new("Manual", "wait", "")).await.unwrap();
        registry.add(Task::new("Later", "wait", "daily")).await.unwrap();

        assert_eq!(scanner.scan_once().await, 0);
        clock.advance(chrono::Duration::minutes(31));
        assert_eq!(scanner.scan_once().await, 1);
    }

    #[tokio::test]
    async fn running_tasks_are_skipped() {
        let (scanner, registry, clock) = scanner().await;
        registry.add(Task::new("Due", "wait", "hourly")).await.unwrap();

        clock.advance(chrono::Duration::minutes(61));
        assert_eq!(scanner.scan_once().await, 1);
        assert_eq!(scanner.scan_once().await, 0);
    }

    #[tokio::test]
    async fn loop_exits_on_stop() {
        let (scanner, _registry, _clock) = scanner().await;
        let stop = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(scanner).run(stop.clone()));
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

//! End-to-end scheduler behaviour through the public management API.
//!
//! Uses an in-memory or temp-file SQLite store and a manual clock so
//! scheduling decisions are deterministic.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use hearth_scheduler::store::INTERRUPTED_ERROR;
use hearth_scheduler::Clock;
use hearth_scheduler::{
    handler_fn, ExecutionStatus, HandlerError, HandlerRegistry, ManualClock, Params, Scheduler,
    SchedulerError, SchedulerEvent, SchedulerOptions, SqliteStore, Task, TaskStatus, TaskStore,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 2, 6, 0, 0).unwrap()
}

fn handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register("noop", handler_fn(|_, _| async { Ok(Params::new()) }));
    handlers.register(
        "block",
        handler_fn(|ctx, _| async move {
            ctx.cancelled().await;
            Err(HandlerError::Cancelled)
        }),
    );
    handlers
}

async fn open(handlers: HandlerRegistry) -> (Scheduler, Arc<ManualClock>) {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let clock = Arc::new(ManualClock::new(t0()));
    let options = SchedulerOptions::default().with_clock(clock.clone());
    let scheduler = Scheduler::open(store, handlers, options).await.unwrap();
    (scheduler, clock)
}

async fn wait_finished(rx: &mut broadcast::Receiver<SchedulerEvent>, id: i64) -> ExecutionStatus {
    timeout(TIMEOUT, async {
        loop {
            if let SchedulerEvent::ExecutionFinished {
                execution_id,
                status,
                ..
            } = rx.recv().await.unwrap()
            {
                if execution_id == id {
                    return status;
                }
            }
        }
    })
    .await
    .expect("execution did not finish in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_execute_now_admits_exactly_one() {
    let (scheduler, _clock) = open(handlers()).await;
    let scheduler = Arc::new(scheduler);
    let task = scheduler.add_task(Task::new("Long scan", "block", "")).await.unwrap();

    let calls = (0..16).map(|_| {
        let scheduler = Arc::clone(&scheduler);
        let id = task.id.clone();
        tokio::spawn(async move { scheduler.execute_now(&id).await })
    });
    let results = futures::future::join_all(calls).await;

    let mut admitted = 0;
    let mut conflicts = 0;
    for result in results {
        match result.unwrap() {
            Ok(_) => admitted += 1,
            Err(SchedulerError::AlreadyRunning(id)) => {
                assert_eq!(id, task.id);
                conflicts += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(conflicts, 15);

    let history = scheduler.history(&task.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Running);

    scheduler.shutdown(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn daily_next_run_is_one_day_after_completion() {
    let (scheduler, clock) = open(handlers()).await;
    let task = scheduler.add_task(Task::new("Nightly backup", "noop", "daily")).await.unwrap();
    assert_eq!(task.next_run, Some(t0() + chrono::Duration::days(1)));

    clock.advance(chrono::Duration::hours(3));
    let mut events = scheduler.subscribe();
    let id = scheduler.execute_now(&task.id).await.unwrap();
    assert_eq!(wait_finished(&mut events, id).await, ExecutionStatus::Success);

    let execution = scheduler.execution(id).await.unwrap().unwrap();
    let completed_at = execution.completed_at.unwrap();
    let task = scheduler.get_task(&task.id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Success);
    assert_eq!(task.next_run, Some(completed_at + chrono::Duration::days(1)));
    assert!(task.next_run.unwrap() >= completed_at);
}

#[tokio::test]
async fn unrecognised_schedule_defaults_to_one_hour() {
    let (scheduler, _clock) = open(handlers()).await;
    let task = scheduler
        .add_task(Task::new("Odd", "noop", "every 3 weeks"))
        .await
        .unwrap();
    assert_eq!(task.next_run, Some(t0() + chrono::Duration::hours(1)));
    assert_eq!(task.schedule, "every 3 weeks");
}

#[tokio::test]
async fn add_then_get_returns_the_input() {
    let (scheduler, _clock) = open(handlers()).await;
    let mut params = Params::new();
    params.insert("source".into(), "/srv/photos".into());
    params.insert("keep".into(), 7.into());
    let input = Task::new("Photo backup", "backup", "every 6h")
        .with_params(params)
        .with_enabled(false);

    let added = scheduler.add_task(input.clone()).await.unwrap();
    let fetched = scheduler.get_task(&added.id).await.unwrap();

    assert_eq!(fetched, added);
    assert_eq!(fetched.name, input.name);
    assert_eq!(fetched.task_type, input.task_type);
    assert_eq!(fetched.schedule, input.schedule);
    assert_eq!(fetched.params, input.params);
    assert_eq!(fetched.enabled, input.enabled);
    assert_eq!(fetched.last_run, None);
    assert_eq!(fetched.status, TaskStatus::Idle);
}

#[tokio::test]
async fn history_is_newest_first() {
    let (scheduler, clock) = open(handlers()).await;
    let task = scheduler.add_task(Task::new("Index", "noop", "hourly")).await.unwrap();
    let mut events = scheduler.subscribe();

    let mut ids = Vec::new();
    for _ in 0..3 {
        clock.advance(chrono::Duration::minutes(10));
        let id = scheduler.execute_now(&task.id).await.unwrap();
        wait_finished(&mut events, id).await;
        ids.push(id);
    }

    let history = scheduler.history(&task.id, 10).await.unwrap();
    assert_eq!(history.len(), 3);
    let returned: Vec<i64> = history.iter().map(|e| e.id).collect();
    ids.reverse();
    assert_eq!(returned, ids);
    assert!(history.windows(2).all(|w| w[0].started_at > w[1].started_at));
}

#[tokio::test]
async fn delete_cancels_running_execution() {
    let (observed_tx, mut observed_rx) = mpsc::channel::<String>(1);
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "watch",
        handler_fn(move |ctx, _| {
            let observed = observed_tx.clone();
            async move {
                ctx.cancelled().await;
                let _ = observed.send(ctx.task_id.clone()).await;
                Err(HandlerError::Cancelled)
            }
        }),
    );
    let (scheduler, _clock) = open(handlers).await;
    let task = scheduler.add_task(Task::new("Watch", "watch", "")).await.unwrap();

    scheduler.execute_now(&task.id).await.unwrap();
    assert!(scheduler.is_running(&task.id));

    scheduler.delete_task(&task.id).await.unwrap();
    assert!(scheduler.get_task(&task.id).await.unwrap_err().is_not_found());

    let cancelled = timeout(TIMEOUT, observed_rx.recv()).await.unwrap().unwrap();
    assert_eq!(cancelled, task.id);
}

#[tokio::test]
async fn hourly_task_runs_once_after_sixty_one_minutes() {
    let (scheduler, clock) = open(handlers()).await;
    let task = scheduler.add_task(Task::new("Hourly scan", "noop", "hourly")).await.unwrap();
    let mut events = scheduler.subscribe();

    assert_eq!(scheduler.scan_once().await, 0);
    clock.advance(chrono::Duration::minutes(61));
    assert_eq!(scheduler.scan_once().await, 1);

    let history = scheduler.history(&task.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    wait_finished(&mut events, history[0].id).await;
    assert_eq!(scheduler.scan_once().await, 0);

    let history = scheduler.history(&task.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    let execution = &history[0];
    assert!(execution.started_at >= t0());
    assert!(execution.started_at <= t0() + chrono::Duration::minutes(61));
    assert!(execution.status.is_terminal());

    let task = scheduler.get_task(&task.id).await.unwrap();
    assert_eq!(
        task.next_run,
        Some(execution.started_at + chrono::Duration::hours(1))
    );
}

#[tokio::test]
async fn disabled_task_still_runs_manually() {
    let (scheduler, clock) = open(handlers()).await;
    let task = scheduler
        .add_task(Task::new("Paused", "noop", "every 30m").with_enabled(false))
        .await
        .unwrap();

    clock.advance(chrono::Duration::hours(2));
    assert_eq!(scheduler.scan_once().await, 0);

    let mut events = scheduler.subscribe();
    let id = scheduler.execute_now(&task.id).await.unwrap();
    assert_eq!(wait_finished(&mut events, id).await, ExecutionStatus::Success);
}

#[tokio::test]
async fn unregistered_type_records_failed_execution() {
    let (scheduler, _clock) = open(handlers()).await;
    let task = scheduler.add_task(Task::new("Mystery", "defrag", "")).await.unwrap();
    let mut events = scheduler.subscribe();

    let id = scheduler.execute_now(&task.id).await.unwrap();
    assert_eq!(wait_finished(&mut events, id).await, ExecutionStatus::Failed);

    let execution = scheduler.execution(id).await.unwrap().unwrap();
    assert_eq!(execution.error, "no handler registered for task type 'defrag'");
    assert_eq!(
        scheduler.get_task(&task.id).await.unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn restart_recovers_interrupted_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scheduler.db");

    let execution_id = {
        let store = SqliteStore::open(&path, 2).await.unwrap();
        let mut task = Task::new("Backup", "noop", "daily").with_id("backup");
        task.status = TaskStatus::Running;
        task.created_at = t0();
        task.updated_at = t0();
        store.put_task(&task).await.unwrap();
        let id = store.append_execution("backup", t0()).await.unwrap();
        store.close().await;
        id
    };

    let store = Arc::new(SqliteStore::open(&path, 2).await.unwrap());
    let clock = Arc::new(ManualClock::new(t0() + chrono::Duration::minutes(5)));
    let scheduler = Scheduler::open(
        store,
        handlers(),
        SchedulerOptions::default().with_clock(clock.clone()),
    )
    .await
    .unwrap();

    let execution = scheduler.execution(execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error, INTERRUPTED_ERROR);
    assert_eq!(execution.completed_at, Some(clock.now()));

    let task = scheduler.get_task("backup").await.unwrap();
    assert_eq!(task.status, TaskStatus::Idle);
    assert_eq!(task.next_run, Some(clock.now() + chrono::Duration::days(1)));
    assert!(!scheduler.is_running("backup"));
}

#[tokio::test]
async fn shutdown_drains_cooperative_handlers() {
    let (scheduler, _clock) = open(handlers()).await;
    let task = scheduler.add_task(Task::new("Long", "block", "")).await.unwrap();
    let id = scheduler.execute_now(&task.id).await.unwrap();

    scheduler.shutdown(TIMEOUT).await.unwrap();

    let execution = scheduler.execution(id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error, "cancelled");
    assert!(scheduler.running_ids().is_empty());
}

#[tokio::test]
async fn shutdown_times_out_on_stubborn_handler() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "stubborn",
        handler_fn(|_, _| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Params::new())
        }),
    );
    let (scheduler, _clock) = open(handlers).await;
    let task = scheduler.add_task(Task::new("Stubborn", "stubborn", "")).await.unwrap();
    scheduler.execute_now(&task.id).await.unwrap();

    let deadline = Duration::from_millis(200);
    let err = scheduler.shutdown(deadline).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ShutdownTimeout(d) if d == deadline));
    assert!(scheduler.is_running(&task.id));
}

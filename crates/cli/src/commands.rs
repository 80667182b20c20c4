use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use hearth_core::Config;
use hearth_scheduler::{
    Scheduler, SchedulerEvent, SchedulerOptions, SqliteStore, StoreError, Task,
};

use crate::cli::Command;
use crate::handlers;

pub async fn dispatch(command: Command, config: &Config) -> Result<()> {
    match command {
        Command::Serve { events, .. } => serve(config, events).await,
        Command::Add {
            name,
            task_type,
            schedule,
            id,
            params,
            disabled,
        } => {
            let scheduler = open(config, Access::Owner).await?;
            let mut task = Task::new(name, task_type, schedule).with_enabled(!disabled);
            if let Some(id) = id {
                task = task.with_id(id);
            }
            if let Some(params) = params {
                task = task.with_params(params);
            }
            print_json(&scheduler.add_task(task).await?)
        }
        Command::List => {
            let scheduler = open(config, Access::Shared).await?;
            print_json(&scheduler.list_tasks().await)
        }
        Command::Show { id } => {
            let scheduler = open(config, Access::Shared).await?;
            print_json(&scheduler.get_task(&id).await?)
        }
        Command::Update {
            id,
            name,
            schedule,
            params,
            enable,
            disable,
        } => {
            let scheduler = open(config, Access::Owner).await?;
            let mut task = scheduler.get_task(&id).await?;
            if let Some(name) = name {
                task.name = name;
            }
            if let Some(schedule) = schedule {
                task.schedule = schedule;
            }
            if let Some(params) = params {
                task.params = params;
            }
            if enable {
                task.enabled = true;
            } else if disable {
                task.enabled = false;
            }
            print_json(&scheduler.update_task(task).await?)
        }
        Command::Delete { id } => {
            let scheduler = open(config, Access::Owner).await?;
            print_json(&scheduler.delete_task(&id).await?)
        }
        Command::Run { id, wait_secs } => run(config, &id, Duration::from_secs(wait_secs)).await,
        Command::History { id, limit } => {
            let scheduler = open(config, Access::Shared).await?;
            let limit = limit.unwrap_or(config.scheduler.history_limit);
            print_json(&scheduler.history(&id, limit).await?)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Read-only; may run next to a live server.
    Shared,
    /// Sole writer. Refused while `serve` or another writing command holds
    /// the store. Holding the lock means any `running` record was left by a
    /// dead process, so interrupted state is recovered on open.
    Owner,
}

/// Open the store and build a scheduler with the built-in handlers.
async fn open(config: &Config, access: Access) -> Result<Scheduler> {
    let path = config.storage.database_path();
    let opened = match access {
        Access::Shared => SqliteStore::open_config(&config.storage).await,
        Access::Owner => SqliteStore::open_config_exclusive(&config.storage).await,
    };
    let store = match opened {
        Ok(store) => store,
        Err(StoreError::Locked(_)) => bail!(
            "task store {} is in use by another hearth process; stop `hearth serve` before changing tasks",
            path.display()
        ),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to open task store at {}", path.display()))
        }
    };
    let options = SchedulerOptions::from_config(&config.scheduler)
        .with_recovery(access == Access::Owner);
    let scheduler = Scheduler::open(Arc::new(store), handlers::builtin(), options).await?;
    Ok(scheduler)
}

async fn serve(config: &Config, print_events: bool) -> Result<()> {
    let scheduler = open(config, Access::Owner).await?;

    if print_events {
        let rx = scheduler.subscribe();
        tokio::spawn(print_event_stream(rx));
    }

    scheduler.start();
    info!("hearth scheduler running, press ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    scheduler
        .shutdown(config.scheduler.shutdown_timeout())
        .await
        .context("scheduler did not shut down cleanly")?;
    info!("hearth exited cleanly");
    Ok(())
}

async fn run(config: &Config, id: &str, wait: Duration) -> Result<()> {
    let scheduler = open(config, Access::Owner).await?;
    let mut events = scheduler.subscribe();
    let execution_id = scheduler.execute_now(id).await?;

    if tokio::time::timeout(wait, wait_finished(&mut events, execution_id))
        .await
        .is_err()
    {
        warn!(task_id = %id, execution_id, wait_secs = wait.as_secs(), "gave up waiting, cancelling");
    }
    scheduler
        .shutdown(config.scheduler.shutdown_timeout())
        .await
        .context("execution did not stop before the shutdown deadline")?;

    let execution = scheduler
        .execution(execution_id)
        .await?
        .with_context(|| format!("execution {execution_id} disappeared"))?;
    print_json(&execution)
}

async fn wait_finished(events: &mut broadcast::Receiver<SchedulerEvent>, execution_id: i64) {
    loop {
        match events.recv().await {
            Ok(SchedulerEvent::ExecutionFinished { execution_id: id, .. }) if id == execution_id => {
                return;
            }
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }
    }
}

async fn print_event_stream(mut events: broadcast::Receiver<SchedulerEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to serialize event"),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to encode output")?;
    println!("{json}");
    Ok(())
}

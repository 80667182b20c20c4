//! State-transition events for external audit and observability consumers.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::ExecutionStatus;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskAdded {
        task_id: String,
    },
    TaskUpdated {
        task_id: String,
    },
    TaskDeleted {
        task_id: String,
        cancelled_running: bool,
    },
    ExecutionStarted {
        task_id: String,
        execution_id: i64,
    },
    ExecutionFinished {
        task_id: String,
        execution_id: i64,
        status: ExecutionStatus,
    },
}

impl SchedulerEvent {
    pub fn task_id(&self) -> &str {
        match self {
            SchedulerEvent::TaskAdded { task_id }
            | SchedulerEvent::TaskUpdated { task_id }
            | SchedulerEvent::TaskDeleted { task_id, .. }
            | SchedulerEvent::ExecutionStarted { task_id, .. }
            | SchedulerEvent::ExecutionFinished { task_id, .. } => task_id,
        }
    }
}

/// Fan-out of [`SchedulerEvent`]s. Sending never blocks; slow receivers lag.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SchedulerEvent) {
        // No receivers is the normal case outside tests and the CLI watcher.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

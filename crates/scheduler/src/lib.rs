//! Task scheduling and execution engine.
//!
//! This crate provides:
//! - A SQLite-backed store for task definitions and execution history
//! - A write-through in-memory task registry
//! - A type-keyed handler registry for the work itself
//! - An execution coordinator enforcing one in-flight run per task
//! - A periodic due-task scanner over a fixed interval vocabulary

pub mod clock;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod handler;
pub mod model;
pub mod registry;
pub mod scanner;
pub mod schedule;
pub mod scheduler;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SchedulerError, StoreError};
pub use events::SchedulerEvent;
pub use handler::{handler_fn, ExecutionContext, HandlerError, HandlerRegistry, TaskHandler};
pub use model::{ExecutionOutcome, ExecutionStatus, Params, Task, TaskExecution, TaskStatus};
pub use scheduler::{Scheduler, SchedulerOptions};
pub use store::{SqliteStore, TaskStore};

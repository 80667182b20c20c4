//! Handler contract and the type-keyed handler registry.
//!
//! Handlers are supplied by collaborators (backup, indexing, cleanup logic)
//! and registered once before the scheduler is opened. The registry is moved
//! into the scheduler behind an `Arc`, so it cannot change after startup.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::Params;

/// Error returned by a handler. Recorded on the execution, never propagated.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("cancelled")]
    Cancelled,

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        HandlerError::Failed(msg.into())
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        HandlerError::Failed(e.to_string())
    }
}

/// Per-execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub task_id: String,
    pub execution_id: i64,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(task_id: impl Into<String>, execution_id: i64, cancel: CancellationToken) -> Self {
        Self {
            task_id: task_id.into(),
            execution_id,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the execution has been cancelled (task deleted or shutdown).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Work performed for one task type.
///
/// Implementations must observe [`ExecutionContext::cancelled`] promptly.
/// A handler that ignores cancellation delays graceful shutdown.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext, params: Params) -> Result<Params, HandlerError>;
}

type BoxFuture = Pin<Box<dyn Future<Output = Result<Params, HandlerError>> + Send>>;

/// Adapter produced by [`handler_fn`].
pub struct FnHandler {
    f: Box<dyn Fn(ExecutionContext, Params) -> BoxFuture + Send + Sync>,
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn execute(&self, ctx: ExecutionContext, params: Params) -> Result<Params, HandlerError> {
        (self.f)(ctx, params).await
    }
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler
where
    F: Fn(ExecutionContext, Params) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Params, HandlerError>> + Send + 'static,
{
    FnHandler {
        f: Box::new(move |ctx, params| Box::pin(f(ctx, params))),
    }
}

/// Mapping from task type to handler. Startup-only: register everything
/// before passing the registry to [`Scheduler::open`](crate::Scheduler::open).
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `task_type`.
    pub fn register(&mut self, task_type: impl Into<String>, handler: impl TaskHandler + 'static) {
        let task_type = task_type.into();
        tracing::debug!(task_type = %task_type, "registered task handler");
        self.handlers.insert(task_type, Arc::new(handler));
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

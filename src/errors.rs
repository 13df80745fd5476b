use super::model::TaskId;
use std::{error::Error, fmt, sync::Arc};
use thiserror::Error;

/// Error produced by a task body, shared between every reader of the handle.
pub type TaskFailure = Arc<dyn Error + Send + Sync + 'static>;

/// Pool-level errors: configuration, submission and lifecycle.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("no tokio runtime available to host pool workers")]
    NoRuntime,

    #[error("pool is closed and no longer accepts tasks")]
    Closed,

    #[error("pending queue is full ({0} tasks)")]
    QueueFull(usize),

    #[error("task {0} has not completed yet")]
    NotReady(TaskId),

    #[error("worker {worker} failed: {reason}")]
    Worker { worker: usize, reason: String },

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    #[error(transparent)]
    Task(#[from] TaskError),
}

/// Outcome of a task that did not produce a value.
#[derive(Clone, Error)]
pub enum TaskError {
    #[error("task failed: {0}")]
    Failed(TaskFailure),

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was cancelled before it ran")]
    Cancelled,

    #[error("task was dropped before it completed")]
    Abandoned,

    #[error("timed out waiting for task")]
    Timeout,
}

impl TaskError {
    pub(crate) fn failed<E>(err: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync + 'static>>,
    {
        TaskError::Failed(Arc::from(err.into()))
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::Failed(err) => f.debug_tuple("Failed").field(&err.to_string()).finish(),
            TaskError::Panicked(msg) => f.debug_tuple("Panicked").field(msg).finish(),
            TaskError::Cancelled => f.write_str("Cancelled"),
            TaskError::Abandoned => f.write_str("Abandoned"),
            TaskError::Timeout => f.write_str("Timeout"),
        }
    }
}

impl PartialEq for TaskError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TaskError::Failed(a), TaskError::Failed(b)) => {
                Arc::ptr_eq(a, b) || a.to_string() == b.to_string()
            }
            (TaskError::Panicked(a), TaskError::Panicked(b)) => a == b,
            (TaskError::Cancelled, TaskError::Cancelled) => true,
            (TaskError::Abandoned, TaskError::Abandoned) => true,
            (TaskError::Timeout, TaskError::Timeout) => true,
            _ => false,
        }
    }
}

/// Renders a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

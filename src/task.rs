use super::{
    errors::TaskError,
    handle::Completer,
    model::{TaskId, TaskState, WorkerId},
};
use futures::future::{BoxFuture, FutureExt};


/// Builds the task's future once a worker has claimed it.
pub(crate) type TaskBody<T> =
    Box<dyn FnOnce(WorkerId) -> BoxFuture<'static, Result<T, TaskError>> + Send + 'static>;

/// Type-erased queued task, as seen by the dispatcher and workers.
pub(crate) trait Runnable: Send + 'static {
    fn id(&self) -> TaskId;

    /// Moves the task to `Running`. False if it was cancelled while queued.
    fn start(&self, worker: WorkerId) -> bool;

    /// Runs the body and publishes its outcome, yielding the terminal state.
    fn run(self: Box<Self>, worker: WorkerId) -> BoxFuture<'static, TaskState>;

    /// Resolves a still-pending task as cancelled.
    fn cancel(self: Box<Self>) -> bool;
}

pub(crate) type Job = Box<dyn Runnable>;

pub(crate) struct Task<T> {
    completer: Completer<T>,
    body: TaskBody<T>,
}

impl<T> Task<T> {
    pub(crate) fn new(completer: Completer<T>, body: TaskBody<T>) -> Self {
        Self { completer, body }
    }
}

impl<T> Runnable for Task<T>
where
    T: Send + Sync + 'static,
{
    #[inline]
    fn id(&self) -> TaskId {
        self.completer.id()
    }

    #[inline]
    fn start(&self, worker: WorkerId) -> bool {
        self.completer.start(worker)
    }

    fn run(self: Box<Self>, worker: WorkerId) -> BoxFuture<'static, TaskState> {
        let Task { completer, body } = *self;
        async move {
            let result = body(worker).await;
            completer.finish(result)
        }
        .boxed()
    }

    fn cancel(self: Box<Self>) -> bool {
        self.completer.cancel()
    }
}

//! Worker loop and the identity of the worker running the current task.

use super::{
    dispatch::Dispatcher,
    model::{TaskState, WorkerId},
};
use std::{
    cell::Cell,
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};


tokio::task_local! {
    static ASYNC_WORKER: WorkerId;
}

thread_local! {
    static BLOCKING_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// The pool worker executing the calling task, or `None` outside a pool.
///
/// Works both inside async task bodies and inside blocking closures.
pub fn current() -> Option<WorkerId> {
    ASYNC_WORKER
        .try_with(|id| *id)
        .ok()
        .or_else(|| BLOCKING_WORKER.with(Cell::get))
}

pub(crate) fn scope_async<F: Future>(
    worker: WorkerId,
    fut: F,
) -> impl Future<Output = F::Output> {
    ASYNC_WORKER.scope(worker, fut)
}

/// Runs a blocking closure with `current()` reporting `worker`.
pub(crate) fn enter_blocking<R>(worker: WorkerId, f: impl FnOnce() -> R) -> R {
    struct Reset(Option<WorkerId>);
    impl Drop for Reset {
        fn drop(&mut self) {
            BLOCKING_WORKER.with(|cell| cell.set(self.0));
        }
    }

    let _reset = Reset(BLOCKING_WORKER.with(|cell| cell.replace(Some(worker))));
    f()
}


/// Counters shared by every worker of a pool.
#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) running: AtomicUsize,
    pub(crate) peak_running: AtomicUsize,
    pub(crate) submitted: AtomicUsize,
    pub(crate) succeeded: AtomicUsize,
    pub(crate) failed: AtomicUsize,
    pub(crate) cancelled: AtomicUsize,
}

impl Counters {
    pub(crate) fn record(&self, state: TaskState) {
        let counter = match state {
            TaskState::Succeeded => &self.succeeded,
            TaskState::Failed => &self.failed,
            TaskState::Cancelled => &self.cancelled,
            TaskState::Pending | TaskState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) async fn worker_loop(
    worker: WorkerId,
    dispatcher: Arc<Dispatcher>,
    counters: Arc<Counters>,
    closing: CancellationToken,
) {
    debug!(%worker, "worker started");
    let mut executed = 0usize;

    while let Some(job) = dispatcher.next(&closing).await {
        let task = job.id();
        if !job.start(worker) {
            trace!(%worker, %task, "skipping cancelled task");
            counters.record(TaskState::Cancelled);
            continue;
        }

        let running = counters.running.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak_running.fetch_max(running, Ordering::AcqRel);
        trace!(%worker, %task, "running");

        let state = job.run(worker).await;

        counters.running.fetch_sub(1, Ordering::AcqRel);
        counters.record(state);
        executed += 1;
        trace!(%worker, %task, ?state, "finished");
    }

    debug!(%worker, executed, "worker stopped");
}

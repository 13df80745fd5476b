use super::{
    errors::{PoolError, TaskError},
    model::{TaskId, TaskState, WorkerId},
};
use std::{
    fmt,
    future::IntoFuture,
    sync::Arc,
};
use futures::future::{BoxFuture, FutureExt};
use tokio::{
    sync::watch,
    time::Duration,
};


/// Shared cell a task publishes its progress through.
pub(crate) enum Slot<T> {
    Pending,
    Running(WorkerId),
    Done {
        result: Result<T, TaskError>,
        worker: Option<WorkerId>,
    },
}

impl<T> Slot<T> {
    fn state(&self) -> TaskState {
        match self {
            Slot::Pending => TaskState::Pending,
            Slot::Running(_) => TaskState::Running,
            Slot::Done { result: Ok(_), .. } => TaskState::Succeeded,
            Slot::Done { result: Err(TaskError::Cancelled), .. } => TaskState::Cancelled,
            Slot::Done { result: Err(_), .. } => TaskState::Failed,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Slot::Done { .. })
    }
}


/// Producer side of a task's slot, owned by the queued task.
///
/// Dropping a completer that never reached a terminal state resolves the
/// handle anyway (`Cancelled` if the task never started, `Abandoned` if it
/// was dropped mid-run), so no waiter is left hanging.
pub(crate) struct Completer<T> {
    id: TaskId,
    tx: Arc<watch::Sender<Slot<T>>>,
}

impl<T> Completer<T> {
    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    /// Claims the task for `worker`. False if it already left `Pending`.
    pub(crate) fn start(&self, worker: WorkerId) -> bool {
        self.tx.send_if_modified(|slot| {
            if matches!(slot, Slot::Pending) {
                *slot = Slot::Running(worker);
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn finish(&self, result: Result<T, TaskError>) -> TaskState {
        let mut result = Some(result);
        self.tx.send_if_modified(|slot| {
            let worker = match slot {
                Slot::Done { .. } => return false,
                Slot::Running(worker) => Some(*worker),
                Slot::Pending => None,
            };
            if let Some(result) = result.take() {
                *slot = Slot::Done { result, worker };
                return true;
            }
            false
        });
        self.tx.borrow().state()
    }

    pub(crate) fn cancel(&self) -> bool {
        cancel_pending(&self.tx)
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.tx.send_if_modified(|slot| match slot {
            Slot::Pending => {
                *slot = Slot::Done { result: Err(TaskError::Cancelled), worker: None };
                true
            }
            Slot::Running(worker) => {
                let worker = Some(*worker);
                *slot = Slot::Done { result: Err(TaskError::Abandoned), worker };
                true
            }
            Slot::Done { .. } => false,
        });
    }
}

fn cancel_pending<T>(tx: &watch::Sender<Slot<T>>) -> bool {
    tx.send_if_modified(|slot| {
        if matches!(slot, Slot::Pending) {
            *slot = Slot::Done { result: Err(TaskError::Cancelled), worker: None };
            true
        } else {
            false
        }
    })
}

pub(crate) fn channel<T>(id: TaskId) -> (Completer<T>, TaskHandle<T>) {
    let (tx, rx) = watch::channel(Slot::Pending);
    let tx = Arc::new(tx);
    let completer = Completer { id, tx: tx.clone() };
    (completer, TaskHandle { id, tx, rx })
}


/// Handle to one submitted task.
///
/// Status checks never block. `wait` and `get` suspend the caller until the
/// task is terminal or the optional timeout elapses; a timeout never changes
/// the task's state. Results are kept in the handle, so `get` can be called
/// any number of times.
pub struct TaskHandle<T> {
    id: TaskId,
    tx: Arc<watch::Sender<Slot<T>>>,
    rx: watch::Receiver<Slot<T>>,
}

impl<T> TaskHandle<T> {
    #[inline]
    pub fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        self.rx.borrow().state()
    }

    /// The worker that picked the task up, once it has.
    pub fn worker(&self) -> Option<WorkerId> {
        match &*self.rx.borrow() {
            Slot::Running(worker) => Some(*worker),
            Slot::Done { worker, .. } => *worker,
            Slot::Pending => None,
        }
    }

    /// True once the task has succeeded, failed or been cancelled.
    #[inline]
    pub fn ready(&self) -> bool {
        self.rx.borrow().is_terminal()
    }

    /// Whether the task succeeded. Errors with `NotReady` until `ready()`.
    pub fn successful(&self) -> Result<bool, PoolError> {
        match self.state() {
            TaskState::Succeeded => Ok(true),
            TaskState::Failed | TaskState::Cancelled => Ok(false),
            TaskState::Pending | TaskState::Running => Err(PoolError::NotReady(self.id)),
        }
    }

    /// Cancels the task if no worker has picked it up yet.
    pub fn cancel(&self) -> bool {
        cancel_pending(&self.tx)
    }

    /// Waits for a terminal state. Returns false if `timeout` elapsed first.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut rx = self.rx.clone();
        let terminal = async move {
            while !rx.borrow_and_update().is_terminal() {
                if rx.changed().await.is_err() {
                    return false;
                }
            }
            true
        };
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, terminal)
                .await
                .unwrap_or(false),
            None => terminal.await,
        }
    }
}

impl<T: Clone> TaskHandle<T> {
    /// The task's result if it is already terminal.
    pub fn try_get(&self) -> Option<Result<T, TaskError>> {
        match &*self.rx.borrow() {
            Slot::Done { result, .. } => Some(result.clone()),
            _ => None,
        }
    }

    /// Waits for the task and returns its value or captured error.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<T, TaskError> {
        if self.wait(timeout).await {
            if let Some(result) = self.try_get() {
                return result;
            }
        }
        Err(TaskError::Timeout)
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> IntoFuture for TaskHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Output = Result<T, TaskError>;
    type IntoFuture = BoxFuture<'static, Result<T, TaskError>>;

    fn into_future(self) -> Self::IntoFuture {
        async move { self.get(None).await }.boxed()
    }
}

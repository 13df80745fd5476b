use super::{
    dispatch::Dispatcher,
    errors::{panic_message, PoolError, TaskError},
    handle::{self, TaskHandle},
    model::{JoinOrdering, PoolMetrics, TaskId, WorkerId},
    task::{Task, TaskBody},
    worker::{self, worker_loop, Counters},
};
use std::{
    error::Error,
    future::{Future, IntoFuture},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};
use futures::{
    future::FutureExt,
    stream::{FuturesUnordered, StreamExt},
};
use tokio::{
    runtime::Handle,
    sync::Mutex,
    task::{JoinError, JoinHandle},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};


pub const WORKERS_ENV: &str = "WORKPOOL_WORKERS";
pub const MAX_PENDING_ENV: &str = "WORKPOOL_MAX_PENDING";
pub const NAME_ENV: &str = "WORKPOOL_NAME";

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub worker_count: usize,
    /// Submissions are rejected with `QueueFull` once this many tasks wait.
    pub max_pending: Option<usize>,
    /// Used in log spans.
    pub name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            max_pending: None,
            name: "workpool".to_string(),
        }
    }
}

impl Config {
    pub fn cpu_bound() -> Self {
        let num_cpus = num_cpus::get();
        Self {
            worker_count: num_cpus,
            max_pending: Some(num_cpus * 10),
            ..Default::default()
        }
    }

    pub fn io_bound() -> Self {
        Self {
            worker_count: num_cpus::get() * 2,
            max_pending: None,
            ..Default::default()
        }
    }

    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }

    /// Defaults overridden by `WORKPOOL_WORKERS`, `WORKPOOL_MAX_PENDING`
    /// and `WORKPOOL_NAME`.
    pub fn from_env() -> Result<Self, PoolError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, PoolError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<Option<usize>, PoolError> {
            lookup(key)
                .map(|raw| {
                    raw.trim().parse::<usize>().map_err(|_| {
                        PoolError::InvalidConfig(format!("{key}={raw:?} is not an integer"))
                    })
                })
                .transpose()
        };

        let mut config = Self::default();
        if let Some(workers) = parse(WORKERS_ENV)? {
            config.worker_count = workers;
        }
        if let Some(max_pending) = parse(MAX_PENDING_ENV)? {
            config.max_pending = Some(max_pending);
        }
        if let Some(name) = lookup(NAME_ENV) {
            config.name = name;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.worker_count == 0 {
            return Err(PoolError::InvalidConfig("worker_count must be at least 1".into()));
        }
        if self.max_pending == Some(0) {
            return Err(PoolError::InvalidConfig("max_pending must be at least 1".into()));
        }
        Ok(())
    }
}


/// Worker tasks not yet joined, plus the first failure seen while joining.
struct WorkerSet {
    handles: Vec<(WorkerId, JoinHandle<()>)>,
    failure: Option<(WorkerId, String)>,
}

/// Fixed-size pool of workers fed from a FIFO queue.
///
/// Workers are tokio tasks, so a pool must be opened from within a runtime.
/// Async task bodies run on the worker itself; blocking bodies run on the
/// runtime's blocking threads while the worker waits for them. Either way a
/// worker runs one task at a time, so at most `worker_count` tasks are
/// running at once.
pub struct WorkerPool {
    config: Config,
    dispatcher: Arc<Dispatcher>,
    counters: Arc<Counters>,
    closing: CancellationToken,
    closed: AtomicBool,
    next_id: AtomicU64,
    workers: Mutex<WorkerSet>,
}

impl WorkerPool {
    pub fn open(worker_count: usize) -> Result<Self, PoolError> {
        Self::with_config(Config::with_workers(worker_count))
    }

    pub fn with_config(config: Config) -> Result<Self, PoolError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;

        let dispatcher = Arc::new(Dispatcher::new());
        let counters = Arc::new(Counters::default());
        let closing = CancellationToken::new();

        let workers = (0..config.worker_count)
            .map(|index| {
                let id = WorkerId(index);
                let span = info_span!("worker", pool = %config.name, worker = index);
                let handle = runtime.spawn(
                    worker_loop(id, dispatcher.clone(), counters.clone(), closing.clone())
                        .instrument(span),
                );
                (id, handle)
            })
            .collect();

        info!(pool = %config.name, workers = config.worker_count, "pool opened");

        Ok(Self {
            config,
            dispatcher,
            counters,
            closing,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            workers: Mutex::new(WorkerSet {
                handles: workers,
                failure: None,
            }),
        })
    }

    /// Opens a pool, runs `f` with it and shuts it down gracefully afterwards.
    pub async fn scope<F, Fut, R>(config: Config, f: F) -> Result<R, PoolError>
    where
        F: FnOnce(Arc<WorkerPool>) -> Fut,
        Fut: Future<Output = R>,
    {
        let pool = Arc::new(Self::with_config(config)?);
        let out = f(pool.clone()).await;
        pool.shutdown(false).await?;
        Ok(out)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn enqueue<T>(&self, body: TaskBody<T>) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + Sync + 'static,
    {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        if !self.dispatcher.try_reserve(self.config.max_pending) {
            return Err(PoolError::QueueFull(self.config.max_pending.unwrap_or(usize::MAX)));
        }

        let id = TaskId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (completer, handle) = handle::channel(id);
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        self.dispatcher.push_reserved(Box::new(Task::new(completer, body)));
        Ok(handle)
    }

    /// Submits an async task. A panic inside it fails the task.
    pub fn spawn<T, F>(&self, fut: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + Sync + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        self.enqueue(async_body(fut.map(Ok)))
    }

    /// Submits an async task whose `Err` fails the task.
    pub fn submit<T, E, F>(&self, fut: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + Sync + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>>,
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.enqueue(async_body(fut.map(|res| res.map_err(TaskError::failed))))
    }

    /// Submits a blocking closure.
    pub fn spawn_blocking<T, F>(&self, f: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.enqueue(blocking_body(move || Ok(f())))
    }

    /// Submits `f(args)` to run on a blocking thread; an `Err` fails the task.
    pub fn apply_async<A, T, E, F>(&self, f: F, args: A) -> Result<TaskHandle<T>, PoolError>
    where
        A: Send + 'static,
        T: Send + Sync + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>>,
        F: FnOnce(A) -> Result<T, E> + Send + 'static,
    {
        self.enqueue(blocking_body(move || f(args).map_err(TaskError::failed)))
    }

    /// Runs `f(args)` on the pool and waits for its result.
    pub async fn apply<A, T, E, F>(&self, f: F, args: A) -> Result<T, PoolError>
    where
        A: Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>>,
        F: FnOnce(A) -> Result<T, E> + Send + 'static,
    {
        let handle = self.apply_async(f, args)?;
        Ok(handle.get(None).await?)
    }

    /// Submits `f(item)` for every item. If any submission is rejected, the
    /// tasks already queued by this call are cancelled.
    pub fn map_async<A, T, E, F, I>(&self, f: F, items: I) -> Result<Vec<TaskHandle<T>>, PoolError>
    where
        I: IntoIterator<Item = A>,
        A: Send + 'static,
        T: Send + Sync + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>>,
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let items = items.into_iter();
        let mut handles = Vec::with_capacity(items.size_hint().0);

        for item in items {
            let f = Arc::clone(&f);
            match self.apply_async(move |a| f(a), item) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for handle in &handles {
                        handle.cancel();
                    }
                    return Err(err);
                }
            }
        }
        Ok(handles)
    }

    /// Applies `f` to every item on the pool and collects the outcomes.
    pub async fn map<A, T, E, F, I>(
        &self,
        f: F,
        items: I,
        ordering: JoinOrdering,
    ) -> Result<Vec<Result<T, TaskError>>, PoolError>
    where
        I: IntoIterator<Item = A>,
        A: Send + 'static,
        T: Clone + Send + Sync + 'static,
        E: Into<Box<dyn Error + Send + Sync + 'static>>,
        F: Fn(A) -> Result<T, E> + Send + Sync + 'static,
    {
        let handles = self.map_async(f, items)?;
        Ok(join_handles(handles, ordering).await)
    }

    pub fn metrics(&self) -> PoolMetrics {
        snapshot(self.config.worker_count, &self.dispatcher, &self.counters)
    }

    /// Calls `callback` with fresh metrics every `interval` until the returned
    /// token is cancelled or the pool shuts down.
    pub fn start_monitoring<F>(&self, interval: Duration, callback: F) -> CancellationToken
    where
        F: Fn(PoolMetrics) + Send + 'static,
    {
        let token = self.closing.child_token();
        let stop = token.clone();
        let workers = self.config.worker_count;
        let dispatcher = Arc::clone(&self.dispatcher);
        let counters = Arc::clone(&self.counters);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        callback(snapshot(workers, &dispatcher, &counters));
                    }
                    _ = stop.cancelled() => break,
                }
            }
        });

        token
    }

    fn cancel_queued(&self) -> usize {
        let drained = self.dispatcher.drain();
        let count = drained.len();
        for job in drained {
            // A task cancelled through its handle is already resolved.
            job.cancel();
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
        }
        count
    }

    /// Stops accepting tasks and waits for every worker to exit.
    ///
    /// With `cancel_pending`, queued tasks are cancelled instead of run.
    /// Running tasks always finish. Concurrent or repeated calls all wait for
    /// the same workers and report the same outcome.
    pub async fn shutdown(&self, cancel_pending: bool) -> Result<(), PoolError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(pool = %self.config.name, cancel_pending, "shutting down");
        }
        if cancel_pending {
            let cancelled = self.cancel_queued();
            if cancelled > 0 {
                debug!(pool = %self.config.name, cancelled, "cancelled pending tasks");
            }
        }
        self.closing.cancel();

        // A handle leaves the set only after it is joined, so a timed out
        // call leaves the remaining workers to the next caller.
        let mut workers = self.workers.lock().await;
        while let Some((worker, handle)) = workers.handles.last_mut() {
            let worker = *worker;
            let joined = handle.await;
            workers.handles.pop();
            if let Err(err) = joined {
                warn!(pool = %self.config.name, %worker, error = %err, "worker did not exit cleanly");
                workers.failure.get_or_insert((worker, err.to_string()));
            }
        }

        // Submissions racing the close flag may land after the workers left.
        let stragglers = self.cancel_queued();
        if stragglers > 0 {
            warn!(pool = %self.config.name, stragglers, "cancelled tasks queued during shutdown");
        }

        match &workers.failure {
            Some((worker, reason)) => Err(PoolError::Worker {
                worker: worker.0,
                reason: reason.clone(),
            }),
            None => {
                debug!(pool = %self.config.name, "pool stopped");
                Ok(())
            }
        }
    }

    pub async fn shutdown_timeout(
        &self,
        cancel_pending: bool,
        timeout: Duration,
    ) -> Result<(), PoolError> {
        tokio::time::timeout(timeout, self.shutdown(cancel_pending))
            .await
            .map_err(|_| PoolError::ShutdownTimeout)?
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.closing.cancel();
    }
}


fn snapshot(workers: usize, dispatcher: &Dispatcher, counters: &Counters) -> PoolMetrics {
    PoolMetrics {
        workers,
        idle_workers: dispatcher.idle(),
        queued_tasks: dispatcher.queued(),
        running_tasks: counters.running.load(Ordering::Relaxed),
        peak_running: counters.peak_running.load(Ordering::Relaxed),
        total_submitted: counters.submitted.load(Ordering::Relaxed),
        succeeded_tasks: counters.succeeded.load(Ordering::Relaxed),
        failed_tasks: counters.failed.load(Ordering::Relaxed),
        cancelled_tasks: counters.cancelled.load(Ordering::Relaxed),
    }
}

fn async_body<T, F>(fut: F) -> TaskBody<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T, TaskError>> + Send + 'static,
{
    Box::new(move |worker| {
        worker::scope_async(worker, AssertUnwindSafe(fut).catch_unwind())
            .map(|caught| {
                caught.unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload))))
            })
            .boxed()
    })
}

fn blocking_body<T, F>(f: F) -> TaskBody<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TaskError> + Send + 'static,
{
    Box::new(move |worker| {
        tokio::task::spawn_blocking(move || worker::enter_blocking(worker, f))
            .map(|joined| joined.unwrap_or_else(|err| Err(join_error(err))))
            .boxed()
    })
}

fn join_error(err: JoinError) -> TaskError {
    if err.is_panic() {
        TaskError::Panicked(panic_message(err.into_panic()))
    } else {
        TaskError::Abandoned
    }
}

/// Awaits every handle, in submission or completion order.
pub async fn join_handles<T>(
    handles: Vec<TaskHandle<T>>,
    ordering: JoinOrdering,
) -> Vec<Result<T, TaskError>>
where
    T: Clone + Send + Sync + 'static,
{
    let mut results = Vec::with_capacity(handles.len());
    match ordering {
        JoinOrdering::Ordered => {
            for handle in handles {
                results.push(handle.get(None).await);
            }
        }
        JoinOrdering::UnOrdered => {
            let mut pending: FuturesUnordered<_> =
                handles.into_iter().map(IntoFuture::into_future).collect();
            while let Some(result) = pending.next().await {
                results.push(result);
            }
        }
    }
    results
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn config_from_lookup() {
        let config = Config::from_lookup(lookup(&[
            (WORKERS_ENV, "3"),
            (MAX_PENDING_ENV, " 40 "),
            (NAME_ENV, "demo"),
        ]))
        .unwrap();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.max_pending, Some(40));
        assert_eq!(config.name, "demo");

        let defaults = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(defaults.worker_count, num_cpus::get());
        assert_eq!(defaults.max_pending, None);
    }

    #[test]
    fn config_rejects_bad_values() {
        assert!(matches!(
            Config::from_lookup(lookup(&[(WORKERS_ENV, "many")])),
            Err(PoolError::InvalidConfig(_))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[(WORKERS_ENV, "0")])),
            Err(PoolError::InvalidConfig(_))
        ));
        assert!(Config::with_workers(0).validate().is_err());
        assert!(Config::cpu_bound().validate().is_ok());
        assert!(Config::io_bound().validate().is_ok());
    }

    #[test]
    fn open_requires_runtime() {
        assert!(matches!(WorkerPool::open(2), Err(PoolError::NoRuntime)));
    }
}

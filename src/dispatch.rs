//! FIFO hand-off of pending tasks to idle workers.
//!
//! Tasks wait in a global injector queue and are taken in submission order.
//! Workers with nothing to do park on a [`Notify`]; every push wakes one of
//! them, and `Notify` releases waiters in the order they parked, so the
//! worker that went idle first gets the next task.

use super::task::Job;
use std::sync::atomic::{AtomicUsize, Ordering};
use crossbeam::deque::{Injector, Steal};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;


pub(crate) struct Dispatcher {
    queue: Injector<Job>,
    notify: Notify,
    queued: AtomicUsize,
    idle: AtomicUsize,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            queue: Injector::new(),
            notify: Notify::new(),
            queued: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn idle(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }

    /// Claims a queue slot, failing once `max` tasks are already queued.
    pub(crate) fn try_reserve(&self, max: Option<usize>) -> bool {
        match max {
            None => {
                self.queued.fetch_add(1, Ordering::AcqRel);
                true
            }
            Some(max) => self
                .queued
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                    (queued < max).then_some(queued + 1)
                })
                .is_ok(),
        }
    }

    /// Queues a task whose slot was taken with `try_reserve`.
    pub(crate) fn push_reserved(&self, job: Job) {
        trace!(task = %job.id(), "queued");
        self.queue.push(job);
        self.notify.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn push(&self, job: Job) {
        self.try_reserve(None);
        self.push_reserved(job);
    }

    /// Takes the oldest pending task, if any.
    pub(crate) fn pop(&self) -> Option<Job> {
        loop {
            match self.queue.steal() {
                Steal::Success(job) => {
                    self.queued.fetch_sub(1, Ordering::AcqRel);
                    return Some(job);
                }
                Steal::Empty => return None,
                Steal::Retry => std::hint::spin_loop(),
            }
        }
    }

    /// Waits for the next task. Once `closing` fires the queue is still
    /// drained, and `None` is returned only when it is empty.
    pub(crate) async fn next(&self, closing: &CancellationToken) -> Option<Job> {
        loop {
            if let Some(job) = self.pop() {
                // Pass the wakeup on so a burst of pushes fans out across
                // every idle worker.
                if !self.queue.is_empty() {
                    self.notify.notify_one();
                }
                return Some(job);
            }
            if closing.is_cancelled() {
                return None;
            }

            self.idle.fetch_add(1, Ordering::Release);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = closing.cancelled() => {}
            }
            self.idle.fetch_sub(1, Ordering::Acquire);
        }
    }

    /// Removes every pending task.
    pub(crate) fn drain(&self) -> Vec<Job> {
        let mut jobs = Vec::with_capacity(self.queued());
        while let Some(job) = self.pop() {
            jobs.push(job);
        }
        jobs
    }
}

use std::fmt;

/// Identifier assigned to a task at submission, unique within one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Index of a pool worker, `0..worker_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle of a submitted task.
///
/// Transitions only move forward: `Pending -> Running -> Succeeded | Failed`,
/// or `Pending -> Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }
}

#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub workers: usize,
    pub idle_workers: usize,
    pub queued_tasks: usize,
    pub running_tasks: usize,
    pub peak_running: usize,
    pub total_submitted: usize,
    pub succeeded_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
}

impl PoolMetrics {
    pub fn utilization(&self) -> f64 {
        if self.workers == 0 {
            return 0.0;
        }
        self.running_tasks as f64 / self.workers as f64
    }

    pub fn finished(&self) -> usize {
        self.succeeded_tasks + self.failed_tasks + self.cancelled_tasks
    }

    pub fn success_rate(&self) -> f64 {
        let total = self.succeeded_tasks + self.failed_tasks;
        if total == 0 {
            return 1.0;
        }
        self.succeeded_tasks as f64 / total as f64
    }
}

/// Order in which `map` reports results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOrdering {
    /// Submission order.
    Ordered,
    /// Completion order.
    UnOrdered,
}

//! Bounded async worker pool with future-like task handles.
//!
//! # Features
//! - Fixed number of workers, FIFO dispatch to the first idle worker
//! - Async and blocking task bodies, `apply`/`map` helpers
//! - Handles with non-blocking `ready`/`successful` and awaitable `wait`/`get`
//! - Task failures and panics captured into the handle
//! - Graceful or cancelling shutdown, scoped pools
//! - Pool metrics and periodic monitoring

mod dispatch;
pub mod errors;
pub mod handle;
pub mod model;
pub mod pool;
mod task;
pub mod worker;

pub use errors::{PoolError, TaskError};
pub use handle::TaskHandle;
pub use model::{JoinOrdering, PoolMetrics, TaskId, TaskState, WorkerId};
pub use pool::{join_handles, Config, WorkerPool};

//! Error types for foreman-pool.

use thiserror::Error;

use foreman_authority::AuthorityError;
use foreman_core::types::{TaskId, WorkerId};

/// All errors that can arise from pool manager operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A request to the authority failed.
    #[error("authority error: {0}")]
    Authority(#[from] AuthorityError),

    /// The pool actor is gone and the request channel is closed.
    #[error("pool channel closed: {0}")]
    ChannelClosed(&'static str),

    /// The worker id is not tracked by the pool.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// A completion report named a task the worker does not hold.
    #[error("task {task} is not in flight on {worker}")]
    UnknownTask { worker: WorkerId, task: TaskId },
}

//! Error types for foreman-authority.

use std::time::Duration;

use thiserror::Error;

use foreman_core::types::WorkerId;

/// Failure of the spawn capability. Propagated to the requester; the pool
/// manager may back off and retry.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The entry point reference cannot name a runnable program.
    #[error("invalid entry point: {0}")]
    InvalidEntryPoint(String),

    /// The capability did not produce a process within the configured
    /// spawn timeout.
    #[error("spawn timed out after {0:?}")]
    TimedOut(Duration),

    /// OS-level process creation failed.
    #[error("spawn I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The capability itself is unavailable or refused the request.
    #[error("spawn capability unavailable: {0}")]
    Capability(String),

    /// The template environment could not be cloned for the new worker
    /// (snapshot capture or snapshot file write failed).
    #[error("worker environment cannot be cloned: {0}")]
    Environment(String),
}

/// All errors that can arise from authority operations.
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("spawn failed: {0}")]
    Spawn(#[from] SpawnError),

    /// The worker id is not (or no longer) known to the authority.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// The authority actor is gone and the request channel is closed.
    #[error("authority channel closed: {0}")]
    ChannelClosed(&'static str),
}

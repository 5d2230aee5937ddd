//! # foreman-pool
//!
//! The worker pool manager: tracks live workers, dispatches tasks with
//! round-robin or least-loaded selection, queues overflow, reacts to
//! crashes by requeueing idempotent tasks and requesting replacement
//! spawns, and keeps the pool between its floor and ceiling.
//!
//! The pool holds only an [`foreman_authority::AuthorityHandle`]; it
//! observes and requests worker state transitions, never performs them.

pub mod error;
pub mod pool;

pub use error::PoolError;
pub use pool::{
    DispatchOutcome, PoolConfig, PoolHandle, PoolHealth, PoolManager, TaskAssignment,
};

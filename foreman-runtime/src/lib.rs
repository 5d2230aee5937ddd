//! # foreman-runtime
//!
//! The coordinator process: wires the config store, log sink, worker
//! authority, and pool manager together, exposes them to worker processes
//! over Unix sockets, and answers a small status/stop control protocol.
//!
//! Worker processes use [`worker::WorkerContext`] to bootstrap from the
//! environment the authority stamped onto them.

pub mod control;
pub mod error;
pub mod gateway;
pub mod paths;
pub mod runtime;
pub mod worker;

pub use control::{
    request_dispatch, request_status, request_stop, send_request, ControlRequest, ControlResponse,
};
pub use error::RuntimeError;
pub use gateway::{CompletionReport, TaskReply, TaskRequest};
pub use runtime::{run, start_blocking, RuntimeOptions};
pub use worker::{TaskClient, WorkerContext};

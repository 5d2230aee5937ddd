//! # foreman-sink
//!
//! Ordered log aggregation: many concurrent producers, one authoritative
//! aggregator that serializes acceptance, one drain stream in arrival
//! order. Backpressure is a configured policy (block with timeout, or
//! drop) reported to producers as a status value.
//!
//! [`export::JsonLinesExporter`] is the bundled export collaborator; the
//! sink itself emits raw [`foreman_core::types::LogRecord`] values.

pub mod error;
pub mod export;
pub mod remote;
pub mod sink;

pub use error::SinkError;
pub use export::{JsonLinesExporter, MAX_LOG_BYTES, MAX_ROTATED_FILES};
pub use remote::{serve_connection, RemoteProducer, SinkReply, SinkRequest};
pub use sink::{Drain, LogProducer, LogSink, SinkConfig, WriteStatus};

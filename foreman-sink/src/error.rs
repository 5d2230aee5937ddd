//! Error types for foreman-sink.

use std::path::PathBuf;

use thiserror::Error;

use foreman_transport::TransportError;

/// All errors that can arise from log sink operations.
///
/// A full buffer is never an error: producers get
/// [`WriteStatus::Dropped`](crate::sink::WriteStatus::Dropped) as a status
/// value instead, so a misbehaving sink cannot halt worker computation.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The aggregator is gone (shutdown) and the record channel is closed.
    #[error("sink channel closed: {0}")]
    ChannelClosed(&'static str),

    /// A remote producer call failed at the transport layer.
    #[error("sink transport error: {0}")]
    Transport(#[from] TransportError),

    /// The remote peer replied with something the protocol does not allow.
    #[error("sink protocol error: {0}")]
    Protocol(String),

    /// Exporter I/O failure, with annotated path.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Exporter JSON encoding failure.
    #[error("record JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience constructor for [`SinkError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SinkError {
    SinkError::Io {
        path: path.into(),
        source,
    }
}

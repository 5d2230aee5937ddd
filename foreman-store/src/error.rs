//! Error types for foreman-store.

use std::path::PathBuf;

use thiserror::Error;

use foreman_core::types::ConfigKey;
use foreman_transport::TransportError;

/// All errors that can arise from config store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key has no current value.
    #[error("no value for key {key}")]
    NotFound { key: ConfigKey },

    /// The subscriber's bounded queue overflowed and the store abandoned it.
    /// Recover by resubscribing with a fresh snapshot.
    #[error("subscriber fell behind and was disconnected; resubscribe with a fresh snapshot")]
    SubscriberOverflow,

    /// The store actor is gone (shutdown) and the request channel is closed.
    #[error("store channel closed: {0}")]
    ChannelClosed(&'static str),

    /// A remote proxy call failed at the transport layer.
    #[error("store transport error: {0}")]
    Transport(#[from] TransportError),

    /// An I/O error from the persistence backend, with annotated path.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization error (backend persist path).
    #[error("backend JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backend document parse error on load, with file path context.
    #[error("failed to parse config document at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The remote peer replied with something the protocol does not allow
    /// at this point.
    #[error("store protocol error: {0}")]
    Protocol(String),

    /// Backend file watcher failure.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

/// Convenience constructor for [`StoreError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}

//! Error types for the coordinator runtime and worker bootstrap.

use std::path::PathBuf;

use thiserror::Error;

use foreman_authority::AuthorityError;
use foreman_core::SettingsError;
use foreman_pool::PoolError;
use foreman_sink::SinkError;
use foreman_store::StoreError;
use foreman_transport::TransportError;

/// All errors that can arise from the runtime, control protocol, and
/// worker bootstrap.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("authority error: {0}")]
    Authority(#[from] AuthorityError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("control protocol error: {0}")]
    Protocol(String),

    /// The coordinator is not running (control socket missing).
    #[error("coordinator is not running (socket missing: {socket})")]
    NotRunning { socket: PathBuf },

    /// A required bootstrap variable is absent from the worker environment.
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    /// A bootstrap variable is present but unparseable.
    #[error("invalid value for {var}: {value}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Convenience constructor for [`RuntimeError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RuntimeError {
    RuntimeError::Io {
        path: path.into(),
        source,
    }
}

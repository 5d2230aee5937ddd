//! Error types for foreman-transport.

use std::time::Duration;

use thiserror::Error;

/// All errors that can arise on a transport endpoint.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint was closed locally, or the peer is gone. Non-retriable
    /// without re-establishing the endpoint.
    #[error("transport endpoint is closed")]
    Closed,

    /// No frame arrived within the deadline. Local and retriable.
    #[error("timed out after {0:?} waiting for a frame")]
    Timeout(Duration),

    /// A frame length prefix exceeded the configured maximum. Enforced on
    /// both the send and receive side so a corrupt prefix cannot trigger an
    /// unbounded allocation.
    #[error("frame of {len} bytes exceeds the {max}-byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Underlying I/O failure other than peer disconnect.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Message body failed to encode or decode.
    #[error("transport codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether the caller may simply retry the same call on the same
    /// endpoint.
    pub fn is_retriable(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

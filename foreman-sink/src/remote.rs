//! Framed producer protocol for the log sink.
//!
//! Workers hold a write-only endpoint; each record is answered with its
//! [`WriteStatus`] so backpressure decisions reach the producer as values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use foreman_core::types::LogRecord;
use foreman_transport::{Endpoint, TransportError};

use crate::error::SinkError;
use crate::sink::{LogProducer, WriteStatus};

/// Producer-to-sink messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SinkRequest {
    Write { record: LogRecord },
}

/// Sink-to-producer messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum SinkReply {
    Status { status: WriteStatus },
    Error { message: String },
}

/// Serve one producer connection. Returns `Ok(())` when the peer
/// disconnects.
pub async fn serve_connection(
    mut endpoint: Endpoint,
    producer: LogProducer,
) -> Result<(), SinkError> {
    loop {
        let request: SinkRequest = match endpoint.recv_wait().await {
            Ok(request) => request,
            Err(TransportError::Closed) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let reply = match request {
            SinkRequest::Write { record } => match producer.write(record).await {
                Ok(status) => SinkReply::Status { status },
                Err(err) => SinkReply::Error {
                    message: err.to_string(),
                },
            },
        };

        match endpoint.send(&reply).await {
            Ok(()) => {}
            Err(TransportError::Closed) => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
}

/// Worker-side write-only proxy to the remote sink.
pub struct RemoteProducer {
    endpoint: Endpoint,
    timeout: Duration,
}

impl RemoteProducer {
    /// Wrap an already-connected endpoint (in-process deployments, tests).
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }

    /// Connect to the sink's Unix socket.
    pub async fn connect(path: &Path, timeout: Duration) -> Result<Self, SinkError> {
        let endpoint = Endpoint::connect_unix(path).await?;
        Ok(Self::new(endpoint, timeout))
    }

    /// Submit one record and learn its acceptance status.
    pub async fn write(&mut self, record: LogRecord) -> Result<WriteStatus, SinkError> {
        self.endpoint.send(&SinkRequest::Write { record }).await?;
        match self.endpoint.recv::<SinkReply>(self.timeout).await? {
            SinkReply::Status { status } => Ok(status),
            SinkReply::Error { message } => Err(SinkError::Protocol(message)),
        }
    }

    /// Release the connection.
    pub async fn close(&mut self) {
        self.endpoint.close().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

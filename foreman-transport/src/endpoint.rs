//! Bidirectional framed endpoints.
//!
//! An [`Endpoint`] is one side of a channel between an authority task and a
//! client. Messages are opaque serde records, FIFO per direction, delivered
//! at most once per call. Endpoints are owned by exactly one task at a time;
//! cross-task sharing goes through channels, never through the endpoint.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::TransportError;
use crate::frame::{read_frame, write_frame};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One side of a bidirectional, length-framed message channel.
pub struct Endpoint {
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
}

impl Endpoint {
    fn from_halves(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    /// A connected in-process endpoint pair, used by tests and by
    /// single-process deployments that skip the socket layer.
    pub fn pair() -> (Endpoint, Endpoint) {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let (lr, lw) = tokio::io::split(left);
        let (rr, rw) = tokio::io::split(right);
        (
            Endpoint::from_halves(Box::new(lr), Box::new(lw)),
            Endpoint::from_halves(Box::new(rr), Box::new(rw)),
        )
    }

    /// Wrap an accepted Unix stream (authority side).
    pub fn from_unix(stream: UnixStream) -> Endpoint {
        let (reader, writer) = stream.into_split();
        Endpoint::from_halves(Box::new(reader), Box::new(writer))
    }

    /// Connect to an authority's Unix socket (client side).
    pub async fn connect_unix(path: &Path) -> Result<Endpoint, TransportError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Endpoint::from_unix(stream))
    }

    /// Send one message. Fails with [`TransportError::Closed`] when the
    /// endpoint was closed or the peer is gone.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::Closed)?;
        let payload = serde_json::to_vec(message)?;
        write_frame(writer, &payload).await
    }

    /// Receive one message, waiting at most `timeout`.
    ///
    /// Fails with [`TransportError::Timeout`] when nothing arrives in time
    /// (retriable) and [`TransportError::Closed`] when the endpoint is
    /// closed or the peer is gone.
    pub async fn recv<T: DeserializeOwned>(
        &mut self,
        timeout: Duration,
    ) -> Result<T, TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::Closed)?;
        let payload = match tokio::time::timeout(timeout, read_frame(reader)).await {
            Ok(result) => result?,
            Err(_elapsed) => return Err(TransportError::Timeout(timeout)),
        };
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Receive one message with no deadline. Used by serve loops that rely
    /// on `Closed` to learn the peer went away.
    pub async fn recv_wait<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        let reader = self.reader.as_mut().ok_or(TransportError::Closed)?;
        let payload = read_frame(reader).await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    /// Close the endpoint and release transport resources.
    ///
    /// Idempotent; reads and writes after close fail with
    /// [`TransportError::Closed`].
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            // Best-effort shutdown so the peer sees a clean EOF.
            let _ = writer.shutdown().await;
        }
        self.reader = None;
    }

    /// Whether `close` has been called on this side.
    pub fn is_closed(&self) -> bool {
        self.writer.is_none() && self.reader.is_none()
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
        text: String,
    }

    fn ping(n: u32) -> Ping {
        Ping {
            n,
            text: format!("message-{n}"),
        }
    }

    #[tokio::test]
    async fn pair_roundtrip() {
        let (mut a, mut b) = Endpoint::pair();
        a.send(&ping(1)).await.expect("send");
        let got: Ping = b.recv(Duration::from_secs(1)).await.expect("recv");
        assert_eq!(got, ping(1));
    }

    #[tokio::test]
    async fn fifo_order_is_preserved_per_direction() {
        let (mut a, mut b) = Endpoint::pair();
        for n in 0..20u32 {
            a.send(&ping(n)).await.expect("send");
        }
        for n in 0..20u32 {
            let got: Ping = b.recv(Duration::from_secs(1)).await.expect("recv");
            assert_eq!(got.n, n, "frames must arrive in send order");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recv_times_out_when_nothing_arrives() {
        let (_a, mut b) = Endpoint::pair();
        let err = b
            .recv::<Ping>(Duration::from_millis(100))
            .await
            .expect_err("no message was sent");
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn send_after_close_fails_closed() {
        let (mut a, _b) = Endpoint::pair();
        a.close().await;
        let err = a.send(&ping(1)).await.expect_err("closed endpoint");
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn recv_after_peer_close_fails_closed() {
        let (mut a, mut b) = Endpoint::pair();
        a.close().await;
        let err = b
            .recv::<Ping>(Duration::from_secs(1))
            .await
            .expect_err("peer is gone");
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut a, _b) = Endpoint::pair();
        a.close().await;
        a.close().await;
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn mismatched_payload_is_a_codec_error() {
        let (mut a, mut b) = Endpoint::pair();
        a.send(&"just a string").await.expect("send");
        let err = b
            .recv::<Ping>(Duration::from_secs(1))
            .await
            .expect_err("shape mismatch");
        assert!(matches!(err, TransportError::Codec(_)));
    }

    #[tokio::test]
    async fn unix_socket_roundtrip() {
        let tmp = TempDir::new().expect("tmpdir");
        let path = tmp.path().join("endpoint.sock");
        let listener = tokio::net::UnixListener::bind(&path).expect("bind");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut endpoint = Endpoint::from_unix(stream);
            let got: Ping = endpoint.recv_wait().await.expect("recv");
            endpoint.send(&got).await.expect("echo");
        });

        let mut client = Endpoint::connect_unix(&path).await.expect("connect");
        client.send(&ping(7)).await.expect("send");
        let echoed: Ping = client.recv(Duration::from_secs(1)).await.expect("recv");
        assert_eq!(echoed, ping(7));

        server.await.expect("server task");
    }

    #[tokio::test]
    async fn independent_endpoints_do_not_interleave() {
        let (mut a1, mut b1) = Endpoint::pair();
        let (mut a2, mut b2) = Endpoint::pair();

        a1.send(&ping(1)).await.expect("send");
        a2.send(&ping(2)).await.expect("send");

        let on_two: Ping = b2.recv(Duration::from_secs(1)).await.expect("recv");
        let on_one: Ping = b1.recv(Duration::from_secs(1)).await.expect("recv");
        assert_eq!(on_one.n, 1);
        assert_eq!(on_two.n, 2);
    }
}

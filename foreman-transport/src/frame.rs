//! Length-prefixed framing.
//!
//! Wire format: 4-byte big-endian payload length, then the payload bytes.
//! Peer disconnects surface as [`TransportError::Closed`]; a clean EOF in
//! the middle of a frame is treated the same way.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Write one length-prefixed frame and flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| TransportError::FrameTooLarge {
        len: payload.len(),
        max: MAX_FRAME_BYTES,
    })?;

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(map_io)?;
    writer.write_all(payload).await.map_err(map_io)?;
    writer.flush().await.map_err(map_io)?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await.map_err(map_io)?;

    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.map_err(map_io)?;
    Ok(payload)
}

/// Peer-gone I/O conditions collapse to `Closed`; everything else stays an
/// I/O error.
fn map_io(err: std::io::Error) -> TransportError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => TransportError::Closed,
        _ => TransportError::Io(err),
    }
}

//! Length-prefix framing (spec §4.6, §6): `[u32 big-endian length N][N bytes]`.
//!
//! `FrameReader` wraps the read half of a connection and yields decoded
//! [`Envelope`]s; `write_frame` writes one length-prefixed envelope to the
//! write half. Kept as two small free functions/a reader struct rather than
//! a generic `Transport`, since the wire format here is fixed, not pluggable
//! (unlike the teacher's `Transport<Item, SinkItem>` seam).

use crate::envelope::{DecodeError, Envelope};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame length: `i32::MAX` bytes, per spec §4.6 ("max frame =
/// INT_MAX").
pub const MAX_FRAME_LEN: u32 = i32::MAX as u32;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    FrameTooLarge(u32),
    #[error("connection closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("envelope decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Reads length-framed envelopes off an `AsyncRead` half of a connection.
///
/// Stateless between requests: each call to [`FrameReader::read_envelope`]
/// reads exactly one frame and returns, so nothing about one request's
/// decode carries over to the next (spec §4.6: "pipeline is stateless
/// between requests on the same connection").
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Reads and decodes the next frame. Returns `Ok(None)` on a clean EOF
    /// at a frame boundary (no bytes read for a new frame yet).
    pub async fn read_envelope(&mut self) -> Result<Option<Envelope>, FrameError> {
        let len = match self.read_u32_or_eof().await? {
            Some(len) => len,
            None => return Ok(None),
        };
        if len > MAX_FRAME_LEN {
            return Err(FrameError::FrameTooLarge(len));
        }
        let body = self.read_exact_bytes(len as usize).await?;
        let envelope = Envelope::decode(body)?;
        Ok(Some(envelope))
    }

    async fn read_u32_or_eof(&mut self) -> Result<Option<u32>, FrameError> {
        while self.buf.len() < 4 {
            let mut tmp = [0u8; 4096];
            let n = self.inner.read(&mut tmp).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(FrameError::Closed);
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
        Ok(Some(self.buf.get_u32()))
    }

    async fn read_exact_bytes(&mut self, len: usize) -> Result<Bytes, FrameError> {
        while self.buf.len() < len {
            let mut tmp = [0u8; 4096];
            let n = self.inner.read(&mut tmp).await?;
            if n == 0 {
                return Err(FrameError::Closed);
            }
            self.buf.extend_from_slice(&tmp[..n]);
        }
        Ok(self.buf.split_to(len).freeze())
    }
}

/// Encodes and writes one length-framed envelope to an `AsyncWrite` half.
pub async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<(), FrameError> {
    let mut body = BytesMut::new();
    envelope.encode(&mut body);
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(FrameError::FrameTooLarge(body.len() as u32));
    }
    let mut frame = BytesMut::with_capacity(body.len() + 4);
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

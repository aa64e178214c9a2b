//! Length-prefixed framing over a byte stream.
//!
//! Wire layout: `[len(4 bytes BE)][body(len bytes)]`. A reader always
//! reassembles exactly one body per call, however the transport chunks the
//! bytes, and leaves any following frame untouched in the stream.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame body size (16 MB). A 5 MB attachment survives two rounds
/// of base64 plus JSON escaping well within this.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_SIZE)]
    TooLarge(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read one frame body. Returns `Ok(None)` on a clean end of stream between
/// frames; a stream that ends mid-frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let frame_len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if frame_len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(frame_len));
    }

    let mut body = vec![0u8; frame_len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one frame. Prefix and body go out in a single `write_all` so two
/// writers on the same stream can never interleave inside a frame.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

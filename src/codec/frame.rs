// =============================================================================
// Length-prefixed framing over the broker socket
// =============================================================================
//
// Every frame is a 4-byte big-endian unsigned length followed by exactly that
// many bytes of Protocol-Buffers envelope. The reader enforces a frame-size
// cap so a corrupt prefix cannot allocate unbounded memory.
// =============================================================================

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CodecError;

/// Upper bound on a single inbound frame. The largest broker responses
/// (full symbol lists) are well under this.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Prepend the length prefix to envelope bytes, yielding a writable frame.
pub fn encode_frame(envelope: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + envelope.len());
    buf.put_u32(envelope.len() as u32);
    buf.put_slice(envelope);
    buf.freeze()
}

/// Split a length prefix off a complete in-memory frame. Used by tests and by
/// the reader below; the wire path streams instead of buffering whole frames.
pub fn split_frame(frame: &[u8]) -> Result<&[u8], CodecError> {
    if frame.len() < 4 {
        return Err(CodecError::Frame(format!(
            "frame shorter than length prefix ({} bytes)",
            frame.len()
        )));
    }
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if declared > MAX_FRAME_BYTES {
        return Err(CodecError::Oversize {
            got: declared,
            limit: MAX_FRAME_BYTES,
        });
    }
    let body = &frame[4..];
    if body.len() != declared {
        return Err(CodecError::Frame(format!(
            "length prefix declares {declared} bytes but {} follow",
            body.len()
        )));
    }
    Ok(body)
}

/// Read one length-prefixed envelope from the stream.
///
/// Transport-level failures (EOF mid-frame, socket errors) come back as
/// `std::io::Error`; a length prefix over the cap is a [`CodecError`] the
/// caller treats as a protocol violation.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Result<Vec<u8>, CodecError>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    reader.read_exact(&mut prefix).await?;
    let declared = u32::from_be_bytes(prefix) as usize;
    if declared > MAX_FRAME_BYTES {
        return Ok(Err(CodecError::Oversize {
            got: declared,
            limit: MAX_FRAME_BYTES,
        }));
    }
    let mut body = vec![0u8; declared];
    reader.read_exact(&mut body).await?;
    Ok(Ok(body))
}

/// Write one pre-encoded frame (already length-prefixed) to the stream.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

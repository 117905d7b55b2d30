//! Newline-delimited JSON framing over async byte streams.
//!
//! One frame per line. `serde_json` never emits a literal newline
//! (newlines inside strings are escaped), so the delimiter is
//! unambiguous. Frames are capped at [`MAX_FRAME_BYTES`] to bound the
//! memory a single connection can pin.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use veilchat_types::{Result, VeilchatError};

use crate::wire::Frame;

/// Upper bound on one serialized frame, including the newline.
///
/// The largest legitimate frame is a chat-context KEY_EXCHANGE carrying
/// three 3072-bit integers as decimal strings (≈ 3 KiB); 256 KiB leaves
/// generous headroom for sealed payloads.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Serializes `frame` and writes it as one line.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(frame).map_err(|e| VeilchatError::TransportFailure {
        reason: format!("frame serialization failed: {e}"),
    })?;
    line.push('\n');

    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| VeilchatError::TransportFailure {
            reason: format!("write failed: {e}"),
        })?;
    writer
        .flush()
        .await
        .map_err(|e| VeilchatError::TransportFailure {
            reason: format!("flush failed: {e}"),
        })
}

/// Reads one frame line.
///
/// Returns `Ok(None)` on clean end-of-stream. A line exceeding
/// [`MAX_FRAME_BYTES`], a truncated final line, or malformed JSON all
/// fail the read.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncBufRead + Unpin,
{
    Ok(read_frame_raw(reader).await?.map(|(frame, _)| frame))
}

/// Reads one frame line, returning both the parsed frame and the raw
/// serialized form.
///
/// The relay forwards peer-to-peer frames by their raw bytes so the
/// delivered payload is exactly what the sender produced.
pub async fn read_frame_raw<R>(reader: &mut R) -> Result<Option<(Frame, String)>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader
        .take(MAX_FRAME_BYTES as u64)
        .read_line(&mut line)
        .await
        .map_err(|e| VeilchatError::TransportFailure {
            reason: format!("read failed: {e}"),
        })?;

    if n == 0 {
        return Ok(None);
    }

    if !line.ends_with('\n') {
        // Either the peer closed mid-frame or the cap was hit.
        return Err(VeilchatError::TransportFailure {
            reason: if n >= MAX_FRAME_BYTES {
                format!("frame exceeds {MAX_FRAME_BYTES} bytes")
            } else {
                "connection closed mid-frame".into()
            },
        });
    }

    let raw = line.trim_end().to_string();
    let frame = serde_json::from_str(&raw).map_err(|e| VeilchatError::ProtocolViolation {
        reason: format!("malformed frame: {e}"),
    })?;
    Ok(Some((frame, raw)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

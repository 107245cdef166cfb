//! Relay wire protocol: handshake field, frame markers, and the frame reader.
//!
//! ```text
//! Handshake:  <username, space padded to the handshake width>
//! Keepalive:  00 00 00 00
//! Content:    00 00 00 01 | size: u32 BE | payload (size bytes)
//! Payload:    <recipient, space padded to 128 bytes> | sender-defined bytes
//! ```
//!
//! The reader tolerates stray bytes between frames by sliding a 4-byte
//! window over the stream until it lines up with a marker again.

use crate::error::RelayError;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Marker preceding a keepalive frame
pub const KEEPALIVE_MARKER: [u8; 4] = [0x00, 0x00, 0x00, 0x00];

/// Marker preceding a content frame
pub const CONTENT_MARKER: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Width of the recipient username field at the start of a content payload
pub const RECIPIENT_FIELD_SIZE: usize = 128;

/// Marker plus size field
const CONTENT_HEADER_SIZE: usize = 8;

/// A decoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Keepalive,
    Content { size: u32, payload: Bytes },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Keepalive,
    Content,
}

impl Marker {
    fn from_window(window: &[u8; 4]) -> Option<Self> {
        match *window {
            KEEPALIVE_MARKER => Some(Marker::Keepalive),
            CONTENT_MARKER => Some(Marker::Content),
            _ => None,
        }
    }
}

/// Decodes frames from one connection's byte stream.
///
/// Reads are exact: a read that returns zero bytes before the requested
/// amount is available fails with `FrameReadFailed`.
pub struct FrameReader<R> {
    reader: R,
    max_content_size: u32,
    max_resync_bytes: usize,
    /// Bytes pulled off the stream since the last `take_consumed`
    consumed: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_content_size: u32, max_resync_bytes: usize) -> Self {
        Self {
            reader,
            max_content_size,
            max_resync_bytes,
            consumed: 0,
        }
    }

    /// Read the next frame, skipping any bytes that precede a marker.
    pub async fn next_frame(&mut self) -> Result<Frame, RelayError> {
        match self.read_marker().await? {
            Marker::Keepalive => Ok(Frame::Keepalive),
            Marker::Content => {
                let size = self.read_size().await?;
                if size == 0 || size > self.max_content_size {
                    return Err(RelayError::InvalidFrameSize {
                        size,
                        max: self.max_content_size,
                    });
                }

                let mut payload = BytesMut::zeroed(size as usize);
                self.read_full(&mut payload).await?;
                Ok(Frame::Content {
                    size,
                    payload: payload.freeze(),
                })
            }
        }
    }

    /// Return and reset the number of bytes consumed from the stream.
    pub fn take_consumed(&mut self) -> u64 {
        std::mem::take(&mut self.consumed)
    }

    async fn read_marker(&mut self) -> Result<Marker, RelayError> {
        let mut window = [0u8; 4];
        self.read_full(&mut window).await?;

        let mut skipped = 0usize;
        loop {
            if let Some(marker) = Marker::from_window(&window) {
                if skipped > 0 {
                    trace!(skipped, "Resynchronized on frame marker");
                }
                return Ok(marker);
            }

            if skipped >= self.max_resync_bytes {
                return Err(RelayError::ResyncLimitExceeded { scanned: skipped });
            }

            let mut next = [0u8; 1];
            self.read_full(&mut next).await?;
            window.copy_within(1.., 0);
            window[3] = next[0];
            skipped += 1;
        }
    }

    async fn read_size(&mut self) -> Result<u32, RelayError> {
        let mut size = [0u8; 4];
        self.read_full(&mut size).await?;
        Ok(u32::from_be_bytes(size))
    }

    async fn read_full(&mut self, buf: &mut [u8]) -> Result<(), RelayError> {
        self.reader.read_exact(buf).await?;
        self.consumed += buf.len() as u64;
        Ok(())
    }
}

/// Decode a handshake field into a username.
///
/// Returns `None` when the field is empty after trimming whitespace.
pub fn parse_username(field: &[u8]) -> Option<String> {
    let username = String::from_utf8_lossy(field);
    let username = username.trim();
    if username.is_empty() {
        None
    } else {
        Some(username.to_string())
    }
}

/// Extract the recipient name from the start of a content payload.
pub fn recipient(payload: &[u8]) -> String {
    let field = &payload[..payload.len().min(RECIPIENT_FIELD_SIZE)];
    String::from_utf8_lossy(field).trim().to_string()
}

/// Encode a payload as a content frame.
pub fn encode_content_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(CONTENT_HEADER_SIZE + payload.len());
    frame.put_slice(&CONTENT_MARKER);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.freeze()
}

/// Left-justify `value` in a space padded field of `width` bytes.
///
/// Returns `None` if the value does not fit.
#[cfg(test)]
pub fn pad_field(value: &str, width: usize) -> Option<Vec<u8>> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return None;
    }
    let mut field = Vec::with_capacity(width);
    field.extend_from_slice(bytes);
    field.resize(width, b' ');
    Some(field)
}

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{FrameError, Result};
use crate::message::{NetworkMessage, NetworkMessageHeader, NETWORK_HEADER_SIZE};

/// Default maximum payload size: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Hard ceiling imposed by the signed 32-bit length field.
pub const MAX_PAYLOAD_LIMIT: usize = i32::MAX as usize;

/// Encode a channel-wrapped message into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬──────────────┬──────────────┬───────────┬────────────────┐
/// │ Channel (16) │ MessageId    │ ReplyTo      │ Length    │ Payload        │
/// │ GUID LE      │ (16) GUID LE │ (16) GUID LE │ (4B i32   │ (Length bytes) │
/// │              │              │              │  LE)      │                │
/// └──────────────┴──────────────┴──────────────┴───────────┴────────────────┘
/// ```
///
/// The length field is always written from the payload actually present.
pub fn encode_network_message(
    message: &NetworkMessage,
    dst: &mut BytesMut,
    max_payload: usize,
) -> Result<()> {
    let size = message.payload().len();
    let max = max_payload.min(MAX_PAYLOAD_LIMIT);
    if size > max {
        return Err(FrameError::PayloadTooLarge { size, max });
    }

    let mut header = *message.header();
    header.shared.length = size as i32;

    dst.reserve(NETWORK_HEADER_SIZE + size);
    dst.put_slice(&header.to_bytes());
    dst.put_slice(message.payload());
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_network_message(
    src: &mut BytesMut,
    max_payload: usize,
) -> Result<Option<NetworkMessage>> {
    if src.len() < NETWORK_HEADER_SIZE {
        return Ok(None);
    }

    let mut raw = [0u8; NETWORK_HEADER_SIZE];
    raw.copy_from_slice(&src[..NETWORK_HEADER_SIZE]);
    let header = NetworkMessageHeader::from_bytes(&raw);
    let payload_len = payload_len(&header, max_payload)?;

    let total = NETWORK_HEADER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None);
    }

    src.advance(NETWORK_HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(NetworkMessage::from_parts(header, payload)))
}

/// Validate the header's length field and return it as a byte count.
pub(crate) fn payload_len(header: &NetworkMessageHeader, max_payload: usize) -> Result<usize> {
    let length = header.shared.length;
    let size = usize::try_from(length).map_err(|_| FrameError::InvalidLength(length))?;
    let max = max_payload.min(MAX_PAYLOAD_LIMIT);
    if size > max {
        return Err(FrameError::PayloadTooLarge { size, max });
    }
    Ok(size)
}

/// Configuration for frame reading and writing.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations. `None` blocks indefinitely.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl FrameConfig {
    /// Override the maximum payload size.
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    /// Override the write timeout.
    pub fn with_write_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

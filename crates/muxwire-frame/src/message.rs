//! Message shapes carried by frames.
//!
//! Application code works with [`SharedMessage`]. The channel-wrapped
//! [`NetworkMessage`] only exists where a connection reads or writes frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Shared header: message id (16) + reply-to (16) + length (4) = 36 bytes.
pub const SHARED_HEADER_SIZE: usize = 36;

/// Network header: channel id (16) + shared header (36) = 52 bytes.
pub const NETWORK_HEADER_SIZE: usize = 16 + SHARED_HEADER_SIZE;

/// The implicit channel every connection can use without agreeing on an id.
pub const DEFAULT_CHANNEL: Uuid = Uuid::nil();

/// Header common to every message.
///
/// A nil `reply_to` means the message does not answer anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedMessageHeader {
    pub message_id: Uuid,
    pub reply_to: Uuid,
    pub length: i32,
}

impl SharedMessageHeader {
    /// Encode into the fixed little-endian layout.
    ///
    /// Identifiers use the mixed-endian GUID byte order
    /// ([`Uuid::to_bytes_le`]).
    pub fn to_bytes(&self) -> [u8; SHARED_HEADER_SIZE] {
        let mut out = [0u8; SHARED_HEADER_SIZE];
        let mut dst = &mut out[..];
        self.put(&mut dst);
        out
    }

    /// Decode from the fixed little-endian layout.
    pub fn from_bytes(src: &[u8; SHARED_HEADER_SIZE]) -> Self {
        let mut src = &src[..];
        Self::get(&mut src)
    }

    fn put(&self, dst: &mut impl BufMut) {
        dst.put_slice(&self.message_id.to_bytes_le());
        dst.put_slice(&self.reply_to.to_bytes_le());
        dst.put_i32_le(self.length);
    }

    fn get(src: &mut impl Buf) -> Self {
        let message_id = get_guid(src);
        let reply_to = get_guid(src);
        let length = src.get_i32_le();
        Self {
            message_id,
            reply_to,
            length,
        }
    }
}

/// Header written to the socket in front of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkMessageHeader {
    pub channel_guid: Uuid,
    pub shared: SharedMessageHeader,
}

impl NetworkMessageHeader {
    /// Encode into the fixed little-endian layout.
    pub fn to_bytes(&self) -> [u8; NETWORK_HEADER_SIZE] {
        let mut out = [0u8; NETWORK_HEADER_SIZE];
        let mut dst = &mut out[..];
        dst.put_slice(&self.channel_guid.to_bytes_le());
        self.shared.put(&mut dst);
        out
    }

    /// Decode from the fixed little-endian layout.
    pub fn from_bytes(src: &[u8; NETWORK_HEADER_SIZE]) -> Self {
        let mut src = &src[..];
        let channel_guid = get_guid(&mut src);
        let shared = SharedMessageHeader::get(&mut src);
        Self {
            channel_guid,
            shared,
        }
    }
}

fn get_guid(src: &mut impl Buf) -> Uuid {
    let mut raw = [0u8; 16];
    src.copy_to_slice(&mut raw);
    Uuid::from_bytes_le(raw)
}

/// An addressed application message: header plus immutable payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMessage {
    header: SharedMessageHeader,
    payload: Bytes,
}

impl SharedMessage {
    /// Create a message with a fresh id.
    ///
    /// Pass [`Uuid::nil`] as `reply_to` for a message that answers nothing.
    pub fn new(reply_to: Uuid, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            header: SharedMessageHeader {
                message_id: Uuid::new_v4(),
                reply_to,
                length: wire_length(payload.len()),
            },
            payload,
        }
    }

    /// Create a message that answers `self`.
    pub fn reply(&self, payload: impl Into<Bytes>) -> Self {
        Self::new(self.header.message_id, payload)
    }

    /// Rebuild a message from a header and a borrowed payload.
    ///
    /// The payload is copied so the message outlives the source buffer.
    pub fn from_wire(header: SharedMessageHeader, payload: &[u8]) -> Self {
        Self {
            header: SharedMessageHeader {
                length: wire_length(payload.len()),
                ..header
            },
            payload: Bytes::copy_from_slice(payload),
        }
    }

    pub fn header(&self) -> &SharedMessageHeader {
        &self.header
    }

    pub fn id(&self) -> Uuid {
        self.header.message_id
    }

    pub fn reply_to(&self) -> Uuid {
        self.header.reply_to
    }

    /// True when this message answers another one.
    pub fn is_reply(&self) -> bool {
        !self.header.reply_to.is_nil()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Serialize as shared header followed by payload (no channel id).
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SHARED_HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.to_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// A [`SharedMessage`] wrapped with the channel it travels on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkMessage {
    header: NetworkMessageHeader,
    payload: Bytes,
}

impl NetworkMessage {
    /// Wrap `message` for `channel_guid`.
    pub fn new(channel_guid: Uuid, message: SharedMessage) -> Self {
        Self {
            header: NetworkMessageHeader {
                channel_guid,
                shared: message.header,
            },
            payload: message.payload,
        }
    }

    /// Assemble a frame that was just read off the wire.
    pub(crate) fn from_parts(header: NetworkMessageHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn header(&self) -> &NetworkMessageHeader {
        &self.header
    }

    pub fn channel_guid(&self) -> Uuid {
        self.header.channel_guid
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Strip the channel id.
    pub fn into_shared(self) -> SharedMessage {
        SharedMessage {
            header: self.header.shared,
            payload: self.payload,
        }
    }

    /// Serialize as network header followed by payload.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(NETWORK_HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.to_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        NETWORK_HEADER_SIZE + self.payload.len()
    }
}

/// Payloads longer than `i32::MAX` saturate here and are rejected by the
/// encoder before they reach a socket.
fn wire_length(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

//! Channel-addressed message framing.
//!
//! Every frame on the wire is a fixed 52-byte header followed by the payload:
//! - a 16-byte channel id used to demultiplex logical streams
//! - a 16-byte message id, unique per message
//! - a 16-byte reply-to id, nil unless the message answers another one
//! - a 4-byte little-endian signed payload length
//!
//! Readers always hand back complete frames; writers never interleave them.

pub mod codec;
pub mod error;
pub mod message;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_network_message, encode_network_message, FrameConfig, DEFAULT_MAX_PAYLOAD,
    MAX_PAYLOAD_LIMIT,
};
pub use error::{FrameError, Result};
pub use message::{
    NetworkMessage, NetworkMessageHeader, SharedMessage, SharedMessageHeader, DEFAULT_CHANNEL,
    NETWORK_HEADER_SIZE, SHARED_HEADER_SIZE,
};
pub use reader::FrameReader;
pub use writer::{FrameWriter, SharedFrameWriter};

pub use uuid::Uuid;

//! Multiplexed message channels over a single TCP connection.
//!
//! One connection carries any number of logical channels, each addressed by
//! a 128-bit id. Messages can name the message they answer, which lets a
//! sender block until the matching reply arrives.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP listener and connector primitives
//! - [`frame`]: wire headers, messages and blocking frame I/O
//! - [`peer`]: channels, per-connection contexts, client and server (behind `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use muxwire_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use muxwire_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use muxwire_peer::*;
}

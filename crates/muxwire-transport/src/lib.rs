//! TCP transport primitives.
//!
//! This is the lowest layer of muxwire. It binds listeners, accepts and
//! opens connections, and tunes the resulting [`std::net::TcpStream`]s.
//! Everything else builds on the plain blocking streams returned here.

pub mod error;
pub mod tcp;

pub use error::{Result, TransportError};
pub use tcp::{connect, wake_listener, TcpSocket};

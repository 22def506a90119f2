//! Multiplexed message channels over a single TCP connection.
//!
//! A [`MessageContext`] owns one connection and demultiplexes inbound frames
//! to [`MessageChannel`]s by channel id. Channels send, fan received messages
//! out to subscribers, and can block a sender until a correlated reply
//! arrives. [`Client`] and [`Server`] create contexts for outbound and
//! accepted connections and drive their shutdown.

pub mod channel;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod server;
pub mod sync;

pub use channel::{MessageChannel, MessageEvent, TransmitOptions, DEFAULT_REPLY_TIMEOUT};
pub use client::Client;
pub use config::PeerConfig;
pub use context::MessageContext;
pub use error::{PeerError, Result};
pub use event::{Event, SubscriptionId};
pub use server::Server;
pub use sync::{CancelToken, CloseOnce};

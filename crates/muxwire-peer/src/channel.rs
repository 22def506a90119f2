use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use muxwire_frame::{FrameError, NetworkMessage, SharedFrameWriter, SharedMessage};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PeerError, Result};
use crate::event::Event;

/// Reply timeout used by [`TransmitOptions::default`].
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// How [`MessageChannel::send_with`] transmits a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitOptions {
    /// Block until a message whose reply-to matches the sent id arrives.
    pub wait_for_reply: bool,
    /// Upper bound on the wait. Ignored unless `wait_for_reply` is set.
    pub timeout: Duration,
}

impl TransmitOptions {
    /// Send without waiting.
    pub fn fire_and_forget() -> Self {
        Self {
            wait_for_reply: false,
            timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    /// Send and wait up to `timeout` for a correlated reply.
    pub fn wait_for_reply(timeout: Duration) -> Self {
        Self {
            wait_for_reply: true,
            timeout,
        }
    }
}

impl Default for TransmitOptions {
    fn default() -> Self {
        Self::fire_and_forget()
    }
}

/// A message delivered to a channel's subscribers.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub channel_guid: Uuid,
    pub message: SharedMessage,
}

/// One logical stream multiplexed over a context's connection.
///
/// Cloning is cheap; clones share subscribers and state. A channel is inert
/// once its owning [`crate::MessageContext`] disconnects: sends fail with
/// [`PeerError::ChannelClosed`] and subscribers are dropped.
#[derive(Clone)]
pub struct MessageChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    guid: Uuid,
    writer: Arc<SharedFrameWriter<TcpStream>>,
    message_received: Event<MessageEvent>,
    sending_failed: Event<Uuid>,
    pending: DashMap<Uuid, SyncSender<SharedMessage>>,
    closed: AtomicBool,
}

impl MessageChannel {
    pub(crate) fn new(guid: Uuid, writer: Arc<SharedFrameWriter<TcpStream>>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                guid,
                writer,
                message_received: Event::new("message_received"),
                sending_failed: Event::new("message_sending_failed"),
                pending: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn guid(&self) -> Uuid {
        self.inner.guid
    }

    /// Every inbound message addressed to this channel.
    pub fn message_received(&self) -> &Event<MessageEvent> {
        &self.inner.message_received
    }

    /// Raised with the channel id when a send fails at the transport level.
    pub fn sending_failed(&self) -> &Event<Uuid> {
        &self.inner.sending_failed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send `message` on this channel.
    ///
    /// A transport failure raises [`MessageChannel::sending_failed`], which
    /// the owning context answers by disconnecting.
    pub fn send(&self, message: SharedMessage) -> Result<()> {
        if self.is_closed() {
            return Err(PeerError::ChannelClosed(self.inner.guid));
        }

        let frame = NetworkMessage::new(self.inner.guid, message);
        match self.inner.writer.try_write_frame(&frame) {
            Ok(()) => Ok(()),
            Err(err @ FrameError::PayloadTooLarge { .. }) => Err(err.into()),
            Err(err) => {
                if err.is_disconnect() {
                    debug!(channel = %self.inner.guid, error = %err, "send failed");
                } else {
                    warn!(channel = %self.inner.guid, error = %err, "send failed");
                }
                self.inner.sending_failed.publish(&self.inner.guid);
                Err(PeerError::SendFailed {
                    channel: self.inner.guid,
                    source: err,
                })
            }
        }
    }

    /// Send with explicit options.
    ///
    /// Returns `Ok(true)` once sent (and, when waiting, once the reply
    /// arrived) and `Ok(false)` when the reply did not arrive in time.
    pub fn send_with(&self, message: SharedMessage, options: TransmitOptions) -> Result<bool> {
        if !options.wait_for_reply {
            return self.send(message).map(|()| true);
        }
        self.request(message, options.timeout)
            .map(|reply| reply.is_some())
    }

    /// Send `message` and block until its reply arrives or `timeout` elapses.
    ///
    /// The request is registered before the frame is written, so a fast
    /// reply cannot slip past it. Only the first message whose reply-to
    /// equals the sent id completes the request. Returns `Ok(None)` on
    /// timeout.
    ///
    /// Replies are matched by the context's read loop ahead of subscriber
    /// delivery, so a subscriber may itself make requests on the connection
    /// it was called from.
    pub fn request(
        &self,
        message: SharedMessage,
        timeout: Duration,
    ) -> Result<Option<SharedMessage>> {
        let expected = message.id();
        let (tx, rx) = mpsc::sync_channel::<SharedMessage>(1);
        self.inner.pending.insert(expected, tx);

        if let Err(err) = self.send(message) {
            self.inner.pending.remove(&expected);
            return Err(err);
        }

        match rx.recv_timeout(timeout) {
            Ok(reply) => Ok(Some(reply)),
            Err(RecvTimeoutError::Timeout) => {
                self.inner.pending.remove(&expected);
                debug!(channel = %self.inner.guid, message = %expected, ?timeout, "reply timed out");
                Ok(None)
            }
            Err(RecvTimeoutError::Disconnected) => Err(PeerError::Disconnected(format!(
                "channel {} closed while awaiting reply to {expected}",
                self.inner.guid
            ))),
        }
    }

    /// Number of requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Hand `message` to the request waiting on its reply-to id, if any.
    pub(crate) fn complete_request(&self, message: &SharedMessage) -> bool {
        if !message.is_reply() {
            return false;
        }
        match self.inner.pending.remove(&message.reply_to()) {
            Some((_, waiter)) => {
                // A full or abandoned slot means the request already ended.
                let _ = waiter.try_send(message.clone());
                true
            }
            None => false,
        }
    }

    /// Fail every waiting request with [`PeerError::Disconnected`].
    pub(crate) fn abandon_requests(&self) {
        self.inner.pending.clear();
    }

    /// Deliver an inbound message to every subscriber, completing a waiting
    /// request first when it is a reply.
    pub(crate) fn publish(&self, message: SharedMessage) {
        self.complete_request(&message);
        let event = MessageEvent {
            channel_guid: self.inner.guid,
            message,
        };
        self.inner.message_received.publish(&event);
    }

    /// Make the channel inert, fail waiting requests and release its
    /// subscribers.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.abandon_requests();
        self.inner.message_received.clear();
        self.inner.sending_failed.clear();
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("guid", &self.inner.guid)
            .field("closed", &self.is_closed())
            .finish()
    }
}

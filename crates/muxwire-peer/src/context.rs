use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Scope, ThreadId};

use dashmap::DashMap;
use muxwire_frame::{
    FrameConfig, FrameReader, FrameWriter, NetworkMessage, SharedFrameWriter, SharedMessage,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::channel::MessageChannel;
use crate::error::{PeerError, Result};
use crate::event::Event;
use crate::sync::{CancelToken, CloseOnce};

/// Owner of one TCP connection.
///
/// A context demultiplexes inbound frames to its [`MessageChannel`]s by
/// channel id and tears the connection down exactly once. Cloning is cheap;
/// clones refer to the same connection.
///
/// Lifecycle: `Active -> Disconnected`. Transport failures while reading or
/// sending end in [`MessageContext::disconnect`], which fires
/// [`MessageContext::disconnected`] a single time.
#[derive(Clone)]
pub struct MessageContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    guid: Uuid,
    socket: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    reader: Mutex<Option<FrameReader<TcpStream>>>,
    writer: Arc<SharedFrameWriter<TcpStream>>,
    channels: DashMap<Uuid, MessageChannel>,
    cancel: CancelToken,
    lifecycle: CloseOnce,
    disconnected: Event<MessageContext>,
    threads: Mutex<Vec<ThreadId>>,
}

impl MessageContext {
    /// Wrap a connected stream.
    ///
    /// `cancel` is observed by the dispatch loop between frames; it is
    /// usually shared with whoever owns the context (a server).
    pub fn new(
        guid: Uuid,
        stream: TcpStream,
        cancel: CancelToken,
        config: &FrameConfig,
    ) -> Result<Self> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let reader = FrameReader::with_config_tcp(stream.try_clone()?, config.clone())?;
        let writer = FrameWriter::with_config_tcp(stream.try_clone()?, config.clone())?;

        debug!(context = %guid, peer = %peer_addr, "message context created");

        Ok(Self {
            inner: Arc::new(ContextInner {
                guid,
                socket: stream,
                local_addr,
                peer_addr,
                reader: Mutex::new(Some(reader)),
                writer: Arc::new(SharedFrameWriter::new(writer)),
                channels: DashMap::new(),
                cancel,
                lifecycle: CloseOnce::new(),
                disconnected: Event::new("disconnected"),
                threads: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn guid(&self) -> Uuid {
        self.inner.guid
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Raised once, with this context, after the connection is torn down.
    pub fn disconnected(&self) -> &Event<MessageContext> {
        &self.inner.disconnected
    }

    /// Whether the connection is still live.
    ///
    /// Checked under the teardown latch, so a disconnect in progress is never
    /// reported as connected.
    pub fn is_connected(&self) -> bool {
        self.inner
            .lifecycle
            .inspect(|closed| !closed && self.inner.socket.peer_addr().is_ok())
    }

    /// Return the channel registered for `guid`, creating it if needed.
    ///
    /// Concurrent callers asking for the same id get the same channel.
    /// Fails with [`PeerError::Disposed`] once the context has disconnected.
    pub fn get_or_create_channel(&self, guid: Uuid) -> Result<MessageChannel> {
        if self.inner.lifecycle.is_closed() {
            return Err(PeerError::Disposed(self.inner.guid));
        }

        let mut created = false;
        let channel = self
            .inner
            .channels
            .entry(guid)
            .or_insert_with(|| {
                created = true;
                self.new_channel(guid)
            })
            .value()
            .clone();

        if created {
            // A disconnect may have drained the registry between the check
            // above and the insert.
            if self.inner.lifecycle.is_closed() {
                self.inner.channels.remove(&guid);
                channel.close();
                return Err(PeerError::Disposed(self.inner.guid));
            }
            debug!(context = %self.inner.guid, channel = %guid, "channel registered");
        }

        Ok(channel)
    }

    /// Look up a channel without creating it.
    pub fn channel(&self, guid: Uuid) -> Option<MessageChannel> {
        self.inner
            .channels
            .get(&guid)
            .map(|entry| entry.value().clone())
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// Run the inbound dispatch loop on the calling thread until the
    /// connection ends, then disconnect.
    ///
    /// Replies are matched to waiting requests here, as soon as they are
    /// read. Every frame is then queued to a delivery thread owned by its
    /// channel, so each channel sees its messages in arrival order and a slow
    /// subscriber holds up only its own channel. Frames for unknown channels
    /// are dropped. When reading stops, queued messages are still delivered
    /// before the context disconnects.
    ///
    /// Fails with [`PeerError::AlreadyRunning`] if called twice.
    pub fn run(&self) -> Result<()> {
        let mut reader = self
            .inner
            .reader
            .lock()
            .take()
            .ok_or(PeerError::AlreadyRunning(self.inner.guid))?;
        self.inner.threads.lock().push(thread::current().id());

        let result = thread::scope(|scope| -> Result<()> {
            let mut queues = HashMap::new();
            let outcome = loop {
                if self.inner.cancel.is_cancelled() || self.inner.lifecycle.is_closed() {
                    break Ok(());
                }
                match reader.read_frame() {
                    Ok(frame) => {
                        trace!(
                            context = %self.inner.guid,
                            channel = %frame.channel_guid(),
                            size = frame.payload().len(),
                            "frame received"
                        );
                        if let Err(err) = self.route(scope, &mut queues, frame) {
                            break Err(err);
                        }
                    }
                    Err(err) if err.is_disconnect() || self.inner.lifecycle.is_closed() => {
                        debug!(context = %self.inner.guid, error = %err, "read loop finished");
                        break Ok(());
                    }
                    Err(err) => {
                        warn!(context = %self.inner.guid, error = %err, "frame read failed");
                        break Ok(());
                    }
                }
            };

            // Nothing more will be read, so no reply can complete a request a
            // subscriber is still waiting on.
            for entry in self.inner.channels.iter() {
                entry.value().abandon_requests();
            }
            drop(queues);
            outcome
        });

        self.disconnect();
        result
    }

    fn route<'scope, 'env>(
        &'env self,
        scope: &'scope Scope<'scope, 'env>,
        queues: &mut HashMap<Uuid, Sender<SharedMessage>>,
        frame: NetworkMessage,
    ) -> Result<()> {
        let guid = frame.channel_guid();
        let Some(channel) = self.channel(guid) else {
            trace!(context = %self.inner.guid, channel = %guid, "no channel for frame, dropped");
            return Ok(());
        };

        let message = frame.into_shared();
        channel.complete_request(&message);

        let queue = match queues.entry(guid) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel::<SharedMessage>();
                thread::Builder::new()
                    .name("muxwire-dispatch".to_string())
                    .spawn_scoped(scope, move || {
                        self.inner.threads.lock().push(thread::current().id());
                        for message in rx {
                            channel.publish(message);
                        }
                    })?;
                slot.insert(tx)
            }
        };
        if queue.send(message).is_err() {
            warn!(context = %self.inner.guid, channel = %guid, "delivery thread gone, frame dropped");
        }
        Ok(())
    }

    /// Tear the connection down.
    ///
    /// Only the first call does any work: it marks the context closed, shuts
    /// the socket (releasing the blocked reader), closes every channel and
    /// then raises [`MessageContext::disconnected`], returning once every
    /// subscriber has finished. Later calls return immediately.
    pub fn disconnect(&self) {
        let won = self.inner.lifecycle.close(|| {
            if let Err(err) = self.inner.socket.shutdown(Shutdown::Both) {
                debug!(context = %self.inner.guid, error = %err, "socket shutdown failed");
            }
        });
        if !won {
            return;
        }

        let channels: Vec<MessageChannel> = self
            .inner
            .channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.channels.clear();
        for channel in &channels {
            channel.close();
        }

        info!(context = %self.inner.guid, peer = %self.inner.peer_addr, "message context disconnected");

        self.inner.disconnected.publish(self);
        self.inner.disconnected.clear();
    }

    /// Start [`MessageContext::run`] on a dedicated thread.
    pub(crate) fn spawn_runner(&self) -> Result<JoinHandle<()>> {
        let context = self.clone();
        let handle = thread::Builder::new()
            .name("muxwire-context".to_string())
            .spawn(move || {
                if let Err(err) = context.run() {
                    warn!(context = %context.guid(), error = %err, "dispatch loop failed");
                }
            })?;
        Ok(handle)
    }

    /// True on the thread running this context's read loop or one of its
    /// delivery threads.
    ///
    /// Waiting for the runner from either of them would never return.
    pub(crate) fn owns_current_thread(&self) -> bool {
        self.inner.threads.lock().contains(&thread::current().id())
    }

    fn new_channel(&self, guid: Uuid) -> MessageChannel {
        let channel = MessageChannel::new(guid, Arc::clone(&self.inner.writer));
        let context = Arc::downgrade(&self.inner);
        channel.sending_failed().subscribe(move |channel_guid| {
            if let Some(inner) = context.upgrade() {
                debug!(context = %inner.guid, channel = %channel_guid, "send failed, disconnecting");
                MessageContext { inner }.disconnect();
            }
        });
        channel
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("guid", &self.inner.guid)
            .field("peer_addr", &self.inner.peer_addr)
            .field("channels", &self.inner.channels.len())
            .field("closed", &self.inner.lifecycle.is_closed())
            .finish()
    }
}

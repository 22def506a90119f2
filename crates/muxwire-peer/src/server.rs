use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use muxwire_transport::{wake_listener, TcpSocket, TransportError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PeerConfig;
use crate::context::MessageContext;
use crate::error::{PeerError, Result};
use crate::event::Event;
use crate::sync::{CancelToken, CloseOnce};

/// Accepts connections and gives each one a [`MessageContext`].
///
/// ```no_run
/// use std::sync::Arc;
/// use muxwire_peer::Server;
///
/// let server = Arc::new(Server::new("127.0.0.1:7000".parse().unwrap()));
/// server.client_connected().subscribe(|context| {
///     let _ = context.get_or_create_channel(uuid::Uuid::nil());
/// });
/// server.open().unwrap();
///
/// let accept = Arc::clone(&server);
/// std::thread::spawn(move || accept.run());
/// // ...
/// server.shutdown();
/// ```
///
/// Dropping the server shuts it down.
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    addr: SocketAddr,
    config: PeerConfig,
    listener: Mutex<Option<Arc<TcpSocket>>>,
    connections: DashMap<Uuid, MessageContext>,
    runners: Mutex<Vec<(MessageContext, JoinHandle<()>)>>,
    cancel: CancelToken,
    lifecycle: CloseOnce,
    client_connected: Event<MessageContext>,
    client_disconnected: Event<MessageContext>,
    shutdown: Event<()>,
}

impl Server {
    /// Create a server for `addr`. Nothing is bound until [`Server::open`].
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_config(addr, PeerConfig::default())
    }

    pub fn with_config(addr: SocketAddr, config: PeerConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                addr,
                config,
                listener: Mutex::new(None),
                connections: DashMap::new(),
                runners: Mutex::new(Vec::new()),
                cancel: CancelToken::new(),
                lifecycle: CloseOnce::new(),
                client_connected: Event::new("client_connected"),
                client_disconnected: Event::new("client_disconnected"),
                shutdown: Event::new("shutdown"),
            }),
        }
    }

    /// Raised for every accepted connection, before its dispatch loop starts.
    ///
    /// Channels registered here see every frame the client sends.
    pub fn client_connected(&self) -> &Event<MessageContext> {
        &self.inner.client_connected
    }

    /// Raised when an accepted connection disconnects.
    pub fn client_disconnected(&self) -> &Event<MessageContext> {
        &self.inner.client_disconnected
    }

    /// Raised once when the server has finished shutting down.
    pub fn on_shutdown(&self) -> &Event<()> {
        &self.inner.shutdown
    }

    /// Bind and listen. Does not accept yet.
    pub fn open(&self) -> Result<()> {
        if self.inner.lifecycle.is_closed() {
            return Err(TransportError::Shutdown.into());
        }
        let mut listener = self.inner.listener.lock();
        if listener.is_none() {
            *listener = Some(Arc::new(TcpSocket::bind(self.inner.addr)?));
        }
        Ok(())
    }

    /// Bound address, once open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .lock()
            .as_ref()
            .map(|listener| listener.local_addr())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Context of a live connection.
    pub fn context(&self, guid: Uuid) -> Option<MessageContext> {
        self.inner
            .connections
            .get(&guid)
            .map(|entry| entry.value().clone())
    }

    /// Accept connections on the calling thread until shutdown or an accept
    /// error, then shut the server down.
    pub fn run(&self) -> Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .clone()
            .ok_or(PeerError::NotOpen)?;
        info!(addr = %listener.local_addr(), "accepting connections");

        let result = loop {
            if self.inner.cancel.is_cancelled() {
                break Ok(());
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    if self.inner.cancel.is_cancelled() {
                        break Ok(());
                    }
                    if let Err(err) = self.accept_connection(stream, peer) {
                        warn!(%peer, error = %err, "connection rejected");
                    }
                }
                Err(_) if self.inner.cancel.is_cancelled() => break Ok(()),
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    break Err(err.into());
                }
            }
        };

        self.shutdown();
        result
    }

    fn accept_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        if let Err(err) = stream.set_nodelay(self.inner.config.nodelay) {
            debug!(%peer, error = %err, "failed to set TCP_NODELAY");
        }

        let guid = Uuid::new_v4();
        let context = MessageContext::new(
            guid,
            stream,
            self.inner.cancel.clone(),
            &self.inner.config.frame,
        )?;

        match self.inner.connections.entry(guid) {
            Entry::Occupied(_) => {
                context.disconnect();
                return Err(PeerError::DuplicateGuid(guid));
            }
            Entry::Vacant(slot) => {
                slot.insert(context.clone());
            }
        }

        let server = Arc::downgrade(&self.inner);
        context.disconnected().subscribe(move |context| {
            let Some(server) = server.upgrade() else {
                return;
            };
            server.connections.remove(&context.guid());
            debug!(context = %context.guid(), "client disconnected");
            server.client_disconnected.publish(context);
        });

        // Shutdown cancels before draining the registry; anything registered
        // after the drain is caught here.
        if self.inner.cancel.is_cancelled() {
            context.disconnect();
            return Err(TransportError::Shutdown.into());
        }

        info!(context = %guid, %peer, "client connected");
        self.inner.client_connected.publish(&context);

        let runner = match context.spawn_runner() {
            Ok(runner) => runner,
            Err(err) => {
                context.disconnect();
                return Err(err);
            }
        };
        self.track_runner(context, runner);
        Ok(())
    }

    /// Keep `runner` for [`Server::shutdown`] to join.
    ///
    /// Once shutdown has collected the runners it is too late to hand one
    /// over, so the runner is joined here instead.
    fn track_runner(&self, context: MessageContext, runner: JoinHandle<()>) {
        let mut runners = self.inner.runners.lock();
        if !self.inner.cancel.is_cancelled() {
            runners.retain(|(_, runner)| !runner.is_finished());
            runners.push((context, runner));
            return;
        }
        drop(runners);
        join_runner(&context, runner);
    }

    /// Stop listening, disconnect every client and wait for their dispatch
    /// loops, then raise [`Server::on_shutdown`].
    ///
    /// Only the first call does anything.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        let mut listener = None;
        let won = inner.lifecycle.close(|| {
            inner.cancel.cancel();
            listener = inner.listener.lock().take();
        });
        if !won {
            return;
        }

        if let Some(listener) = listener {
            wake_listener(listener.local_addr());
        }

        let guids: Vec<Uuid> = inner.connections.iter().map(|entry| *entry.key()).collect();
        let drained: Vec<MessageContext> = guids
            .into_iter()
            .filter_map(|guid| inner.connections.remove(&guid).map(|(_, context)| context))
            .collect();

        thread::scope(|scope| {
            for context in &drained {
                scope.spawn(|| context.disconnect());
            }
        });

        // Includes runners of connections that ended before shutdown.
        let runners = std::mem::take(&mut *inner.runners.lock());
        for (context, runner) in runners {
            join_runner(&context, runner);
        }

        info!(addr = %inner.addr, "server shut down");
        inner.shutdown.publish(&());
    }
}

fn join_runner(context: &MessageContext, runner: JoinHandle<()>) {
    if context.owns_current_thread() {
        return;
    }
    if runner.join().is_err() {
        warn!(context = %context.guid(), "dispatch thread panicked");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.inner.addr)
            .field("local_addr", &self.local_addr())
            .field("connections", &self.inner.connections.len())
            .field("closed", &self.inner.lifecycle.is_closed())
            .finish()
    }
}

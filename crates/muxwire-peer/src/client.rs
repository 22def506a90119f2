use std::net::SocketAddr;
use std::thread::JoinHandle;

use muxwire_transport::connect;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PeerConfig;
use crate::context::MessageContext;
use crate::error::{PeerError, Result};
use crate::sync::CancelToken;

/// Outbound connection to a [`crate::Server`].
///
/// Dropping the client shuts it down.
pub struct Client {
    config: PeerConfig,
    state: Mutex<ClientState>,
}

#[derive(Default)]
struct ClientState {
    remote_addr: Option<SocketAddr>,
    context: Option<MessageContext>,
    runner: Option<JoinHandle<()>>,
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(PeerConfig::default())
    }

    pub fn with_config(config: PeerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Connect to `addr` and start dispatching inbound frames.
    ///
    /// A client whose previous connection has ended may connect again. The
    /// client is not locked while the old connection winds down, so its
    /// `disconnected` subscribers may call back into the client.
    pub fn connect(&self, addr: SocketAddr) -> Result<()> {
        let (previous, runner) = {
            let mut state = self.state.lock();
            if state.context.as_ref().is_some_and(MessageContext::is_connected) {
                return Err(PeerError::AlreadyConnected);
            }
            (state.context.take(), state.runner.take())
        };
        if let Some(previous) = previous {
            retire(&previous, runner);
        }

        let stream = connect(addr, self.config.nodelay)?;
        let context =
            MessageContext::new(Uuid::new_v4(), stream, CancelToken::new(), &self.config.frame)?;

        let mut state = self.state.lock();
        if state.context.as_ref().is_some_and(MessageContext::is_connected) {
            // Lost a race with a concurrent connect.
            drop(state);
            context.disconnect();
            return Err(PeerError::AlreadyConnected);
        }
        let runner = match context.spawn_runner() {
            Ok(runner) => runner,
            Err(err) => {
                drop(state);
                context.disconnect();
                return Err(err);
            }
        };
        let stale = (state.context.take(), state.runner.take());

        info!(context = %context.guid(), remote = %addr, "client connected");

        state.remote_addr = Some(addr);
        state.context = Some(context);
        state.runner = Some(runner);
        drop(state);

        if let (Some(stale), runner) = stale {
            retire(&stale, runner);
        }
        Ok(())
    }

    /// Context of the current (or most recent) connection.
    pub fn message_context(&self) -> Option<MessageContext> {
        self.state.lock().context.clone()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.state.lock().remote_addr
    }

    /// Disconnect and wait for the dispatch loop to finish.
    ///
    /// Safe to call repeatedly. When called from one of the connection's own
    /// handlers the loop is left to finish on its own.
    pub fn shutdown(&self) {
        let (context, runner) = {
            let mut state = self.state.lock();
            (state.context.clone(), state.runner.take())
        };
        if let Some(context) = context {
            retire(&context, runner);
        }
    }
}

/// Disconnect `context` and wait for its runner unless called from it.
fn retire(context: &MessageContext, runner: Option<JoinHandle<()>>) {
    context.disconnect();

    let Some(runner) = runner else {
        return;
    };
    if context.owns_current_thread() {
        debug!(context = %context.guid(), "shutdown from dispatch thread, not joining");
        return;
    }
    if runner.join().is_err() {
        warn!(context = %context.guid(), "dispatch thread panicked");
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Client")
            .field("remote_addr", &state.remote_addr)
            .field("context", &state.context)
            .finish()
    }
}

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};

/// How long a wakeup connection may take before it is abandoned.
const WAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// Listening TCP socket.
///
/// Accepting is blocking. A thread parked in [`TcpSocket::accept`] is released
/// either by dropping the socket on another path or by [`wake_listener`].
#[derive(Debug)]
pub struct TcpSocket {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpSocket {
    /// Bind and listen on `addr`.
    ///
    /// Port `0` asks the OS for an ephemeral port; query it with
    /// [`TcpSocket::local_addr`].
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener =
            TcpListener::bind(addr).map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        info!(%local_addr, "listening on tcp socket");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted connection");
        Ok((stream, peer))
    }

    /// The address this socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// Connect to a listening TCP socket (blocking).
pub fn connect(addr: SocketAddr, nodelay: bool) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).map_err(|source| TransportError::Connect { addr, source })?;
    stream.set_nodelay(nodelay)?;
    debug!(%addr, "connected to tcp socket");
    Ok(stream)
}

/// Release a thread blocked accepting on `addr`.
///
/// Blocking `accept` does not observe cancellation flags, so shutdown sets its
/// flag first and then opens a throwaway connection. Wildcard bind addresses
/// are reached through loopback of the same family. Failures are ignored: a
/// listener that is already gone has nothing left to wake.
pub fn wake_listener(addr: SocketAddr) {
    let target = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    };

    match TcpStream::connect_timeout(&target, WAKE_TIMEOUT) {
        Ok(stream) => {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(%target, "woke listener");
        }
        Err(err) => debug!(%target, error = %err, "listener wakeup skipped"),
    }
}

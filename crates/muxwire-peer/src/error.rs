use uuid::Uuid;

/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] muxwire_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] muxwire_frame::FrameError),

    /// The message context has already been torn down.
    #[error("message context {0} has been disposed")]
    Disposed(Uuid),

    /// The dispatch loop was started twice.
    #[error("dispatch loop for message context {0} is already running")]
    AlreadyRunning(Uuid),

    /// The client already holds a live connection.
    #[error("client is already connected")]
    AlreadyConnected,

    /// The server must be opened before it can accept.
    #[error("server is not open")]
    NotOpen,

    /// A freshly generated connection id collided with a live one.
    #[error("connection id {0} is already registered")]
    DuplicateGuid(Uuid),

    /// The channel belongs to a context that has disconnected.
    #[error("channel {0} is closed")]
    ChannelClosed(Uuid),

    /// Writing a frame failed at the transport level.
    #[error("send on channel {channel} failed: {source}")]
    SendFailed {
        channel: Uuid,
        source: muxwire_frame::FrameError,
    },

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),
}

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        PeerError::Transport(err.into())
    }
}

pub type Result<T> = std::result::Result<T, PeerError>;

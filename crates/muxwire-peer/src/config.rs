use muxwire_frame::FrameConfig;

/// Connection settings shared by [`crate::Client`] and [`crate::Server`].
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Frame limits and socket timeouts applied to every connection.
    pub frame: FrameConfig,
    /// Disable Nagle's algorithm on connected sockets.
    pub nodelay: bool,
}

impl PeerConfig {
    /// Override frame configuration.
    pub fn with_frame_config(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    /// Override the maximum payload size accepted and sent.
    pub fn with_max_payload_size(mut self, max_payload_size: usize) -> Self {
        self.frame.max_payload_size = max_payload_size;
        self
    }

    /// Override TCP_NODELAY.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            nodelay: true,
        }
    }
}

use std::io::{ErrorKind, Write};
use std::net::TcpStream;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::{encode_network_message, FrameConfig};
use crate::error::{FrameError, Result};
use crate::message::NetworkMessage;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes complete frames to any `Write` stream.
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode and write a complete frame (blocking).
    pub fn write_message(&mut self, message: &NetworkMessage) -> Result<()> {
        self.buf.clear();
        encode_network_message(message, &mut self.buf, self.config.max_payload_size)?;

        let encoded = std::mem::take(&mut self.buf);
        let result = self.write_encoded(&encoded);
        self.buf = encoded;
        result
    }

    /// Write bytes that already hold one or more complete frames.
    pub fn write_encoded(&mut self, bytes: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < bytes.len() {
            match self.inner.write(&bytes[offset..]) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => offset += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }

        self.flush()
    }

    /// Flush the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameWriter<TcpStream> {
    /// Create a frame writer for a TCP stream and apply write timeout from config.
    pub fn with_config_tcp(inner: TcpStream, config: FrameConfig) -> Result<Self> {
        inner.set_write_timeout(config.write_timeout)?;
        Ok(Self::with_config(inner, config))
    }
}

/// A [`FrameWriter`] shared by every sender on one connection.
///
/// Frames are encoded before the lock is taken; the lock only covers the
/// socket write, so whole frames go out atomically and never interleave.
pub struct SharedFrameWriter<T> {
    inner: Mutex<FrameWriter<T>>,
    max_payload_size: usize,
}

impl<T: Write> SharedFrameWriter<T> {
    pub fn new(writer: FrameWriter<T>) -> Self {
        let max_payload_size = writer.config().max_payload_size;
        Self {
            inner: Mutex::new(writer),
            max_payload_size,
        }
    }

    /// Write one frame, reporting transport failure as `false`.
    ///
    /// Failures are expected when the peer has gone away and are not raised.
    pub fn write_frame(&self, message: &NetworkMessage) -> bool {
        match self.try_write_frame(message) {
            Ok(()) => true,
            Err(err) if err.is_disconnect() => {
                debug!(channel = %message.channel_guid(), error = %err, "frame write failed");
                false
            }
            Err(err) => {
                warn!(channel = %message.channel_guid(), error = %err, "frame write failed");
                false
            }
        }
    }

    /// Write one frame, returning the underlying error on failure.
    pub fn try_write_frame(&self, message: &NetworkMessage) -> Result<()> {
        let mut encoded = BytesMut::new();
        encode_network_message(message, &mut encoded, self.max_payload_size)?;

        let mut writer = self.inner.lock();
        writer.write_encoded(&encoded)
    }

    /// Run `f` with exclusive access to the underlying writer.
    pub fn with_writer<R>(&self, f: impl FnOnce(&mut FrameWriter<T>) -> R) -> R {
        let mut writer = self.inner.lock();
        f(&mut writer)
    }
}

use std::io::{ErrorKind, Read};

use crate::codec::{Frame, FrameConfig, FrameDecoder};
use crate::error::{FrameError, Result};
use crate::health::LinkHealth;

const READ_CHUNK_SIZE: usize = 1024;

/// Reads complete frames from any `Read` stream.
///
/// Handles partial reads and resynchronization internally. Callers always
/// get complete frames with a valid check sequence.
pub struct FrameReader<T> {
    inner: T,
    decoder: FrameDecoder,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration (basic mode).
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::with_config(&config),
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            };

            if read == 0 {
                return Err(FrameError::ConnectionClosed);
            }

            self.decoder.push(&chunk[..read]);
        }
    }

    /// Decoder statistics for this stream.
    pub fn health(&self) -> &LinkHealth {
        self.decoder.health()
    }
}

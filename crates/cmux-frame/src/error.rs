/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame check sequence did not match.
    #[error("frame check sequence mismatch (expected 0x{expected:02X}, got 0x{actual:02X})")]
    Fcs { expected: u8, actual: u8 },

    /// The frame is structurally invalid.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// The payload exceeds what the framing mode can carry.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The channel id is outside 0..=63.
    #[error("invalid channel {0} (max 63)")]
    InvalidChannel(u8),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;

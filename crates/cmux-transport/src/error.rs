use std::path::PathBuf;

/// Errors that can occur while opening or using the physical stream.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to open a character device.
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to a socket address.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    /// The device address could not be parsed.
    #[error("invalid device address {0:?}")]
    InvalidAddress(String),

    /// An I/O error occurred on the stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;

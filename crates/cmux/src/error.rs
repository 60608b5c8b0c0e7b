use std::time::Duration;

/// Errors that can occur while driving a modem session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Opening or configuring the physical stream failed.
    #[error(transparent)]
    Transport(#[from] cmux_transport::TransportError),

    /// Writing to the physical stream failed.
    #[error(transparent)]
    Frame(#[from] cmux_frame::FrameError),

    /// The multiplexer rejected a request.
    #[error(transparent)]
    Mux(#[from] cmux_mux::MuxError),

    /// The chat engine rejected a request.
    #[error(transparent)]
    Chat(#[from] cmux_chat::ChatError),

    /// Reading the physical stream failed.
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    /// No chat engine runs on this channel.
    #[error("no chat on channel {0}")]
    NoChat(u8),

    /// The physical link is gone; the session is unusable.
    #[error("link down")]
    LinkDown,

    /// A blocking wait ran out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, Error>;

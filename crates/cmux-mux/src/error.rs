use std::time::Duration;

/// Errors that can occur in multiplexer operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] cmux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] cmux_frame::FrameError),

    /// The peer never acknowledged the channel open.
    #[error("channel {0} open timed out")]
    ChannelOpenTimeout(u8),

    /// The peer never acknowledged the channel close.
    #[error("channel {0} close timed out")]
    ChannelCloseTimeout(u8),

    /// The peer answered the open request with DM.
    #[error("channel {0} open refused by peer")]
    OpenRefused(u8),

    /// Data was written to a channel that is not open.
    #[error("channel {0} is not open")]
    ChannelNotOpen(u8),

    /// The channel is closing and cannot be reopened yet.
    #[error("channel {0} is closing")]
    ChannelBusy(u8),

    /// No channel with this DLCI exists.
    #[error("unknown channel {0}")]
    UnknownChannel(u8),

    /// The name does not map to a DLCI.
    #[error("unknown channel name {0:?}")]
    UnknownChannelName(String),

    /// The physical link was lost.
    #[error("link down")]
    LinkDown,

    /// The multiplexer was torn down; handles are no longer valid.
    #[error("multiplexer terminated")]
    Terminated,

    /// No multiplexer variant accepted the device.
    #[error("probe failed: {0}")]
    ProbeFailed(String),

    /// A blocking exchange timed out.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, MuxError>;

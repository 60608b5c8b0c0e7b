/// Errors that can occur when handing work to a chat engine.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// The command text cannot be sent as a single line.
    #[error("invalid command {0:?}: must be one line of text")]
    InvalidCommand(String),

    /// A notification prefix was empty.
    #[error("notification prefix must not be empty")]
    EmptyPrefix,

    /// A hex-encoded PDU could not be decoded.
    #[error("invalid PDU: {0}")]
    InvalidPdu(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, ChatError>;

use std::fmt;
use std::io;

use cmux::chat::ChatError;
use cmux::frame::FrameError;
use cmux::mux::MuxError;
use cmux::transport::TransportError;
use cmux::{Error, ResultCode};

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        _ => TRANSPORT_ERROR,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Open { source, .. } | TransportError::Connect { source, .. } => {
            let code = if source.kind() == io::ErrorKind::PermissionDenied {
                PERMISSION_DENIED
            } else {
                TRANSPORT_ERROR
            };
            CliError::new(code, format!("{context}: {source}"))
        }
        TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidAddress(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::ConnectionClosed => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn mux_error(context: &str, err: MuxError) -> CliError {
    match err {
        MuxError::Transport(err) => transport_error(context, err),
        MuxError::Frame(err) => frame_error(context, err),
        MuxError::ChannelOpenTimeout(_)
        | MuxError::ChannelCloseTimeout(_)
        | MuxError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        MuxError::UnknownChannel(_) | MuxError::UnknownChannelName(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        MuxError::LinkDown => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn session_error(context: &str, err: Error) -> CliError {
    match err {
        Error::Transport(err) => transport_error(context, err),
        Error::Frame(err) => frame_error(context, err),
        Error::Mux(err) => mux_error(context, err),
        Error::Chat(ChatError::InvalidPdu(err)) => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        Error::Chat(err) => CliError::new(USAGE, format!("{context}: {err}")),
        Error::Io(err) => io_error(context, err),
        Error::LinkDown => CliError::new(TRANSPORT_ERROR, format!("{context}: {err}")),
        Error::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        Error::NoChat(_) => CliError::new(INTERNAL, format!("{context}: {err}")),
    }
}

/// Exit code for a finished AT command.
pub fn result_code(code: ResultCode) -> i32 {
    match code {
        ResultCode::Ok | ResultCode::Connect => SUCCESS,
        ResultCode::Timeout | ResultCode::Dead => TIMEOUT,
        ResultCode::ChannelClosed | ResultCode::LinkDown => TRANSPORT_ERROR,
        _ => FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_address_is_usage() {
        let err = transport_error("open", TransportError::InvalidAddress("tcp:".into()));
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn open_timeout_maps_to_timeout() {
        let err = session_error("open", Error::Mux(MuxError::ChannelOpenTimeout(1)));
        assert_eq!(err.code, TIMEOUT);
        assert!(err.message.starts_with("open: "));
    }

    #[test]
    fn command_outcomes() {
        assert_eq!(result_code(ResultCode::Ok), SUCCESS);
        assert_eq!(result_code(ResultCode::CmeError(10)), FAILURE);
        assert_eq!(result_code(ResultCode::Dead), TIMEOUT);
        assert_eq!(result_code(ResultCode::LinkDown), TRANSPORT_ERROR);
    }
}

//! Cellular modem serial core.
//!
//! cmux turns one modem serial link into independent virtual channels and
//! runs AT command conversations over them.
//!
//! # Crate Structure
//!
//! - [`transport`]: physical byte stream (tty, TCP, Unix socket)
//! - [`frame`]: GSM 07.10 frame codec and control-channel messages
//! - [`mux`]: channel multiplexer variants and their registry
//! - [`chat`]: AT command engine and retry decorator
//! - [`Session`]: the loop that drives all of the above over one stream
//!
//! ```ignore
//! let stream = SerialStream::open(&"/dev/ttyUSB2".parse()?, 115_200)?;
//! let mut session = Session::establish(
//!     stream,
//!     &MultiplexerRegistry::with_defaults(),
//!     SessionConfig::default(),
//! )?;
//! let primary = session.open_channel("primary")?;
//! let result = session.execute(primary, Command::new("AT+CGSN"))?;
//! ```

pub mod error;
pub mod session;

pub use error::{Error, Result};
pub use session::{RetryId, Session, SessionConfig, SessionEvent};

pub use cmux_chat::{Command, CommandResult, NotificationFilter, ResultCode, RetryPolicy};
pub use cmux_mux::MultiplexerRegistry;
pub use cmux_transport::SerialStream;

/// Re-export transport types.
pub mod transport {
    pub use cmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use cmux_frame::*;
}

/// Re-export multiplexer types.
pub mod mux {
    pub use cmux_mux::*;
}

/// Re-export chat types.
pub mod chat {
    pub use cmux_chat::*;
}

//! Virtual channels over one modem serial link.
//!
//! A [`SerialMultiplexer`] turns a single byte stream into numbered
//! channels. Two variants ship with the crate:
//! - [`Gsm0710Multiplexer`]: GSM 07.10 basic or advanced framing, entered with `AT+CMUX`
//! - [`PassthroughMultiplexer`]: one raw channel for modems without multiplexing
//!
//! [`MultiplexerRegistry`] probes the device and picks the first variant
//! that fits.

pub mod error;
pub mod gsm0710;
pub mod multiplexer;
pub mod passthrough;
pub mod probe;
pub mod registry;

pub use error::{MuxError, Result};
pub use gsm0710::Gsm0710Multiplexer;
pub use multiplexer::{
    ChannelState, CloseCause, MuxConfig, MuxEvent, OpenFailure, Role, SerialMultiplexer,
};
pub use passthrough::PassthroughMultiplexer;
pub use probe::{cmux_command, probe_cmux, speed_code};
pub use registry::{ModemIo, MultiplexerRegistry, MultiplexerVariant};

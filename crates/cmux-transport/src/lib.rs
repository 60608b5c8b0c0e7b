//! Physical byte stream to a cellular modem.
//!
//! A modem is reached through one of:
//! - a serial character device (`/dev/ttyUSB0`, `/dev/ttyACM0`, ...)
//! - a TCP connection to a modem simulator (`tcp:host:port`)
//! - a Unix stream socket (`unix:/path/to/socket`)
//!
//! This is the lowest layer of cmux. Everything else builds on top of
//! the [`SerialStream`] type provided here. Serial devices are opened
//! through `serialport` at the requested baud rate, 8N1, without flow
//! control.

pub mod address;
pub mod error;
pub mod stream;

pub use address::DeviceAddress;
pub use error::{Result, TransportError};
pub use stream::SerialStream;

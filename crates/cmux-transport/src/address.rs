use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::TransportError;

/// Where a modem can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAddress {
    /// Serial character device.
    Tty(PathBuf),
    /// TCP endpoint, usually a modem simulator.
    Tcp(String),
    /// Unix stream socket.
    Unix(PathBuf),
}

impl FromStr for DeviceAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("tcp:") {
            let valid = rest
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(TransportError::InvalidAddress(s.to_string()));
            }
            return Ok(Self::Tcp(rest.to_string()));
        }
        if let Some(rest) = s.strip_prefix("unix:") {
            if rest.is_empty() {
                return Err(TransportError::InvalidAddress(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(rest)));
        }
        if s.is_empty() {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        Ok(Self::Tty(PathBuf::from(s)))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tty(path) => write!(f, "{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

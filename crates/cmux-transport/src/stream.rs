use std::cell::Cell;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::debug;

use crate::address::DeviceAddress;
use crate::error::{Result, TransportError};

/// Stands in for "no timeout" on serial ports, which always have one.
const SERIAL_BLOCKING_TIMEOUT: Duration = Duration::from_secs(3600);

/// A connected modem stream implementing `Read + Write`.
///
/// This is the fundamental I/O type of cmux. A read that hits the configured
/// read timeout fails with `ErrorKind::WouldBlock` or `ErrorKind::TimedOut`
/// depending on the platform, the same as a socket read would.
pub struct SerialStream {
    inner: SerialStreamInner,
}

enum SerialStreamInner {
    Tty(TtyDevice),
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

/// A serial port has one timeout shared by reads and writes; each
/// direction's value is applied right before the operation.
struct TtyDevice {
    port: Box<dyn SerialPort>,
    read_timeout: Cell<Option<Duration>>,
    write_timeout: Cell<Option<Duration>>,
}

impl SerialStream {
    /// Open the stream described by `address` (blocking).
    ///
    /// Serial devices are configured for `baud_rate`, 8N1 and no flow
    /// control; sockets ignore the rate.
    pub fn open(address: &DeviceAddress, baud_rate: u32) -> Result<Self> {
        match address {
            DeviceAddress::Tty(path) => {
                let port = serialport::new(path.to_string_lossy(), baud_rate)
                    .data_bits(DataBits::Eight)
                    .parity(Parity::None)
                    .stop_bits(StopBits::One)
                    .flow_control(FlowControl::None)
                    .timeout(SERIAL_BLOCKING_TIMEOUT)
                    .open()
                    .map_err(|err| TransportError::Open {
                        path: path.clone(),
                        source: err.into(),
                    })?;
                debug!(?path, baud_rate, "opened serial device");
                Ok(Self::from_port(port))
            }
            DeviceAddress::Tcp(addr) => {
                let stream =
                    TcpStream::connect(addr.as_str()).map_err(|source| TransportError::Connect {
                        address: addr.clone(),
                        source,
                    })?;
                stream.set_nodelay(true)?;
                debug!(%addr, "connected to modem over tcp");
                Ok(Self::from_tcp(stream))
            }
            #[cfg(unix)]
            DeviceAddress::Unix(path) => {
                let stream = std::os::unix::net::UnixStream::connect(path).map_err(|source| {
                    TransportError::Connect {
                        address: path.display().to_string(),
                        source,
                    }
                })?;
                debug!(?path, "connected to modem over unix socket");
                Ok(Self::from_unix(stream))
            }
            #[cfg(not(unix))]
            other => Err(TransportError::InvalidAddress(other.to_string())),
        }
    }

    /// Wrap an already opened and configured serial port.
    pub fn from_port(port: Box<dyn SerialPort>) -> Self {
        Self {
            inner: SerialStreamInner::Tty(TtyDevice {
                port,
                read_timeout: Cell::new(None),
                write_timeout: Cell::new(None),
            }),
        }
    }

    /// Wrap a connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: SerialStreamInner::Tcp(stream),
        }
    }

    /// Wrap a connected Unix stream socket.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: SerialStreamInner::Unix(stream),
        }
    }

    /// Set read timeout on the underlying stream.
    ///
    /// A zero duration is rejected, as it is for sockets.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            SerialStreamInner::Tty(tty) => {
                reject_zero(timeout)?;
                tty.read_timeout.set(timeout);
                Ok(())
            }
            SerialStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            SerialStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            SerialStreamInner::Tty(tty) => {
                reject_zero(timeout)?;
                tty.write_timeout.set(timeout);
                Ok(())
            }
            SerialStreamInner::Tcp(stream) => {
                stream.set_write_timeout(timeout).map_err(Into::into)
            }
            #[cfg(unix)]
            SerialStreamInner::Unix(stream) => {
                stream.set_write_timeout(timeout).map_err(Into::into)
            }
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            SerialStreamInner::Tty(tty) => {
                let port = tty.port.try_clone().map_err(std::io::Error::from)?;
                let cloned = Self::from_port(port);
                cloned.set_read_timeout(tty.read_timeout.get())?;
                cloned.set_write_timeout(tty.write_timeout.get())?;
                Ok(cloned)
            }
            SerialStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
            #[cfg(unix)]
            SerialStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            SerialStreamInner::Tty(_) => "tty",
            SerialStreamInner::Tcp(_) => "tcp",
            #[cfg(unix)]
            SerialStreamInner::Unix(_) => "unix-socket",
        }
    }
}

fn reject_zero(timeout: Option<Duration>) -> Result<()> {
    if timeout == Some(Duration::ZERO) {
        return Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "cannot set a 0 duration timeout",
        )));
    }
    Ok(())
}

impl TtyDevice {
    fn apply(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        self.port
            .set_timeout(timeout.unwrap_or(SERIAL_BLOCKING_TIMEOUT))
            .map_err(Into::into)
    }
}

impl Read for TtyDevice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.apply(self.read_timeout.get())?;
        self.port.read(buf)
    }
}

impl Write for TtyDevice {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.apply(self.write_timeout.get())?;
        self.port.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port.flush()
    }
}

impl Read for SerialStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            SerialStreamInner::Tty(tty) => tty.read(buf),
            SerialStreamInner::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            SerialStreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for SerialStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            SerialStreamInner::Tty(tty) => tty.write(buf),
            SerialStreamInner::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            SerialStreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            SerialStreamInner::Tty(tty) => tty.flush(),
            SerialStreamInner::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            SerialStreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl std::fmt::Debug for SerialStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialStream")
            .field("type", &self.transport_name())
            .finish()
    }
}

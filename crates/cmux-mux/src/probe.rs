//! Blocking `AT+CMUX` exchange used to switch a modem into multiplexing.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use cmux_frame::writer::write_all;
use cmux_frame::FrameError;
use tracing::debug;

use crate::error::{MuxError, Result};
use crate::multiplexer::MuxConfig;

/// `AT+CMUX` port speed code for a baud rate. Unlisted rates report 115200.
pub fn speed_code(baud: u32) -> u8 {
    match baud {
        9600 => 1,
        19200 => 2,
        38400 => 3,
        57600 => 4,
        115_200 => 5,
        230_400 => 6,
        _ => 5,
    }
}

/// Build the `AT+CMUX` command line (without terminator) for `config`.
pub fn cmux_command(config: &MuxConfig) -> String {
    format!(
        "AT+CMUX={},0,{},{}",
        config.mode.cmux_value(),
        speed_code(config.port_speed),
        config.frame_size
    )
}

/// Send `AT+CMUX` and wait for the final result.
///
/// Returns `Ok(true)` on `OK` and `Ok(false)` when the modem answers with
/// an error. The stream needs a finite read timeout so the deadline can be
/// checked between reads.
pub fn probe_cmux<T: Read + Write + ?Sized>(io: &mut T, config: &MuxConfig) -> Result<bool> {
    let command = cmux_command(config);
    let accepted = chat(io, &command, config.probe_timeout)?;
    debug!(command, accepted, mode = %config.mode, "cmux probe finished");
    Ok(accepted)
}

/// One raw command/response exchange on an unframed stream.
pub fn chat<T: Read + Write + ?Sized>(io: &mut T, command: &str, timeout: Duration) -> Result<bool> {
    let mut line = Vec::with_capacity(command.len() + 1);
    line.extend_from_slice(command.as_bytes());
    line.push(b'\r');
    write_all(io, &line)?;
    io.flush().map_err(FrameError::Io)?;

    let deadline = Instant::now() + timeout;
    let mut pending = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        if Instant::now() >= deadline {
            return Err(MuxError::Timeout(timeout));
        }

        match io.read(&mut chunk) {
            Ok(0) => return Err(MuxError::Frame(FrameError::ConnectionClosed)),
            Ok(n) => pending.extend_from_slice(&chunk[..n]),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(err) => return Err(MuxError::Frame(FrameError::Io(err))),
        }

        while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let text = text.trim();
            if text.is_empty() || text == command {
                continue;
            }
            debug!(line = text, "probe response");
            if text == "OK" {
                return Ok(true);
            }
            if text == "ERROR" || text.starts_with("+CME ERROR") {
                return Ok(false);
            }
        }
    }
}

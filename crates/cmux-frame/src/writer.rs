use std::io::{ErrorKind, Write};

use crate::error::{FrameError, Result};

/// Write every byte of `bytes`, retrying on `Interrupted` and `WouldBlock`.
pub fn write_all<W: Write + ?Sized>(inner: &mut W, bytes: &[u8]) -> Result<()> {
    let mut offset = 0usize;
    while offset < bytes.len() {
        match inner.write(&bytes[offset..]) {
            Ok(0) => return Err(FrameError::ConnectionClosed),
            Ok(n) => offset += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => continue,
            Err(err) => return Err(FrameError::Io(err)),
        }
    }
    Ok(())
}

use std::fs::File;
use std::io::Read;
use std::path::Path;

use cmux::frame::{Frame, FrameConfig, FrameDecoder, FrameError, FrameReader, FramingMode};
use tracing::debug;

use crate::cmd::DecodeArgs;
use crate::exit::{frame_error, io_error, CliError, CliResult, DATA_INVALID, SUCCESS, USAGE};
use crate::output::{print_frames, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let mode = args.mode.into();
    let frames = match (&args.file, &args.hex) {
        (Some(path), _) => read_capture(mode, open_capture(path)?)?,
        (None, Some(hex)) => decode_frames(mode, &parse_hex(hex)?)?,
        (None, None) => return Err(CliError::new(USAGE, "nothing to decode")),
    };
    print_frames(&frames, format);
    Ok(SUCCESS)
}

fn open_capture(path: &Path) -> CliResult<Box<dyn Read>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(std::io::stdin().lock()));
    }
    File::open(path)
        .map(|file| Box::new(file) as Box<dyn Read>)
        .map_err(|err| io_error(&format!("cannot read {}", path.display()), err))
}

/// Decode a binary capture until end of input; a trailing partial frame is ignored.
fn read_capture<R: Read>(mode: FramingMode, input: R) -> CliResult<Vec<Frame>> {
    let config = FrameConfig {
        mode,
        ..FrameConfig::default()
    };
    let mut reader = FrameReader::with_config(input, config);
    let mut frames = Vec::new();
    loop {
        match reader.read_frame() {
            Ok(frame) => frames.push(frame),
            Err(FrameError::ConnectionClosed) => break,
            Err(err) => return Err(frame_error("capture read failed", err)),
        }
    }

    let health = reader.health();
    debug!(
        frames = frames.len(),
        fcs_errors = health.fcs_errors,
        discarded = health.discarded_bytes,
        "decoded capture file"
    );
    if frames.is_empty() {
        return Err(CliError::new(
            DATA_INVALID,
            format!(
                "no valid {} frame in capture ({} fcs errors)",
                mode.as_str(),
                health.fcs_errors
            ),
        ));
    }
    Ok(frames)
}

fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    hex::decode(digits).map_err(|err| CliError::new(DATA_INVALID, format!("invalid hex: {err}")))
}

fn decode_frames(mode: FramingMode, bytes: &[u8]) -> CliResult<Vec<Frame>> {
    let mut decoder = FrameDecoder::new(mode);
    decoder.push(bytes);
    let frames: Vec<Frame> = std::iter::from_fn(|| decoder.next_frame()).collect();

    let health = decoder.health();
    debug!(
        frames = frames.len(),
        fcs_errors = health.fcs_errors,
        discarded = health.discarded_bytes,
        "decoded capture"
    );
    if frames.is_empty() {
        return Err(CliError::new(
            DATA_INVALID,
            format!(
                "no valid {} frame in {} bytes ({} fcs errors)",
                mode.as_str(),
                bytes.len(),
                health.fcs_errors
            ),
        ));
    }
    Ok(frames)
}

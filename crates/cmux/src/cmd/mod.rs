use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use cmux::frame::FramingMode;
use cmux::mux::MuxConfig;
use cmux::transport::DeviceAddress;
use cmux::{MultiplexerRegistry, SerialStream, Session, SessionConfig};

use crate::exit::{session_error, transport_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod chat;
pub mod decode;
pub mod monitor;
pub mod probe;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Detect the multiplexer a modem supports.
    Probe(ProbeArgs),
    /// Run AT commands on one channel.
    Chat(ChatArgs),
    /// Print unsolicited notifications until interrupted.
    Monitor(MonitorArgs),
    /// Decode captured frame bytes (hex text or a binary capture file).
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Probe(args) => probe::run(args, format),
        Command::Chat(args) => chat::run(args, format),
        Command::Monitor(args) => monitor::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum Framing {
    #[default]
    Basic,
    Advanced,
}

impl From<Framing> for FramingMode {
    fn from(framing: Framing) -> Self {
        match framing {
            Framing::Basic => FramingMode::Basic,
            Framing::Advanced => FramingMode::Advanced,
        }
    }
}

#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Modem address: tty path, tcp:HOST:PORT or unix:PATH.
    #[arg(env = "CMUX_DEVICE")]
    pub device: String,
    /// GSM 07.10 framing.
    #[arg(long, value_enum, default_value = "basic", env = "CMUX_MODE")]
    pub mode: Framing,
    /// Skip detection and use this multiplexer (gsm0710, passthrough).
    #[arg(long)]
    pub variant: Option<String>,
    /// Serial line speed; also reported to the modem in AT+CMUX.
    #[arg(long, default_value_t = 115_200)]
    pub baud: u32,
    /// Largest information field per frame (N1).
    #[arg(long, default_value_t = cmux::frame::DEFAULT_FRAME_SIZE)]
    pub frame_size: usize,
    /// Wait for channel acknowledgements (e.g. 500ms, 2s).
    #[arg(long, default_value = "500ms")]
    pub ack_timeout: String,
}

impl DeviceArgs {
    pub fn session_config(&self) -> CliResult<SessionConfig> {
        if self.frame_size == 0 {
            return Err(CliError::new(USAGE, "frame size must be greater than zero"));
        }
        Ok(SessionConfig {
            mux: MuxConfig {
                mode: self.mode.into(),
                frame_size: self.frame_size,
                port_speed: self.baud,
                ack_timeout: parse_duration(&self.ack_timeout)?,
                ..MuxConfig::default()
            },
            variant: self.variant.clone(),
            ..SessionConfig::default()
        })
    }

    pub fn open_stream(&self) -> CliResult<SerialStream> {
        let address: DeviceAddress = self
            .device
            .parse()
            .map_err(|err| transport_error("invalid device", err))?;
        SerialStream::open(&address, self.baud)
            .map_err(|err| transport_error("open failed", err))
    }

    pub fn connect(&self, config: SessionConfig) -> CliResult<Session> {
        let stream = self.open_stream()?;
        Session::establish(stream, &MultiplexerRegistry::with_defaults(), config)
            .map_err(|err| session_error("establish failed", err))
    }
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
}

#[derive(Args, Debug)]
pub struct ChatArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Commands to run in order; stops at the first failure.
    #[arg(required = true, num_args = 1..)]
    pub commands: Vec<String>,
    /// Channel name or DLCI.
    #[arg(long, short = 'c', default_value = "primary")]
    pub channel: String,
    /// Per-command timeout (e.g. 90s, 500ms).
    #[arg(long, default_value = "90s")]
    pub timeout: String,
    /// Retry each command up to N attempts until it returns OK.
    #[arg(long, value_name = "N")]
    pub retry: Option<u32>,
    /// Pause between attempts when --retry is set.
    #[arg(long, default_value = "1s", requires = "retry")]
    pub retry_interval: String,
}

#[derive(Args, Debug)]
pub struct MonitorArgs {
    #[command(flatten)]
    pub device: DeviceArgs,
    /// Channel name or DLCI.
    #[arg(long, short = 'c', default_value = "primary")]
    pub channel: String,
    /// Notification prefixes to report (comma-separated, e.g. +CREG:,+CEREG:).
    #[arg(long, value_delimiter = ',')]
    pub notify: Vec<String>,
    /// Exit after N notifications.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Frame bytes as hex; whitespace and ':' separators are ignored.
    #[arg(required_unless_present = "file", conflicts_with = "file")]
    pub hex: Option<String>,
    /// Read raw captured bytes from a file ('-' for stdin).
    #[arg(long, short = 'f', value_name = "PATH")]
    pub file: Option<PathBuf>,
    /// GSM 07.10 framing.
    #[arg(long, value_enum, default_value = "basic")]
    pub mode: Framing,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show build target and features.
    #[arg(long)]
    pub extended: bool,
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    let (number, millis) = match input.strip_suffix("ms") {
        Some(number) => (number, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };
    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration: {input:?}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }
    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

use std::time::{Duration, Instant};

use bytes::Bytes;
use cmux_frame::{
    FrameConfig, FramingMode, HealthChange, LinkHealth, ModemSignals, DEFAULT_FRAME_SIZE,
    DEFAULT_MAX_PAYLOAD,
};

use crate::error::Result;

/// Lifecycle of one virtual channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Closed,
    Opening,
    Open,
    Closing,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Opening => "opening",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}

/// Which side of the link started multiplexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Sends `AT+CMUX` and opens channels (the host side).
    #[default]
    Initiator,
    /// Accepts channels opened by the peer (modem emulators).
    Responder,
}

/// Why a channel open did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    /// No UA after every attempt.
    Timeout,
    /// The peer answered DM.
    Refused,
    /// The physical link went away.
    LinkDown,
}

/// Why a channel ended up closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Closed on request and acknowledged by the peer.
    Local,
    /// Closed on request, but the peer never acknowledged.
    Timeout,
    /// The peer closed the channel.
    Remote,
    /// The physical link went away.
    LinkDown,
    /// The multiplexer was torn down.
    Terminated,
}

/// Upward notifications from a multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// A channel reached the open state. `remote` is true when the peer opened it.
    ChannelOpened { channel: u8, remote: bool },
    /// An open request failed; the channel is closed again.
    ChannelOpenFailed { channel: u8, reason: OpenFailure },
    /// A channel reached the closed state.
    ChannelClosed { channel: u8, cause: CloseCause },
    /// Inbound bytes are waiting in the channel buffer.
    DataReady { channel: u8 },
    /// The peer reported new V.24 signals for a channel.
    ModemStatus { channel: u8, signals: ModemSignals },
    /// The decoder entered or left a desync episode.
    LinkHealth(HealthChange),
    /// The physical link was lost; every channel is closed.
    LinkDown,
    /// The multiplexer session ended; every handle is invalid.
    Terminated,
}

/// Configuration for multiplexer sessions.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Basic or advanced framing.
    pub mode: FramingMode,
    /// N1: largest information field sent in one frame. Default: 31.
    pub frame_size: usize,
    /// Physical port speed, reported to the modem in `AT+CMUX`.
    pub port_speed: u32,
    /// Initiator (host) or responder (emulator) side.
    pub role: Role,
    /// Wait for UA after SABM or DISC. Default: 500 ms.
    pub ack_timeout: Duration,
    /// SABM/DISC transmissions before giving up. Default: 3.
    pub max_attempts: u32,
    /// Send a modem status command after each channel opens.
    pub send_modem_status: bool,
    /// V.24 signals advertised for newly opened channels.
    pub signals: ModemSignals,
    /// Largest inbound payload accepted by the decoder.
    pub max_payload_size: usize,
    /// Consecutive bad frames before a desync is reported.
    pub desync_threshold: u32,
    /// Wait for the `AT+CMUX` answer. Default: 5 s.
    pub probe_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            mode: FramingMode::Basic,
            frame_size: DEFAULT_FRAME_SIZE,
            port_speed: 115_200,
            role: Role::Initiator,
            ack_timeout: Duration::from_millis(500),
            max_attempts: 3,
            send_modem_status: true,
            signals: ModemSignals::default(),
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            desync_threshold: cmux_frame::health::DEFAULT_DESYNC_THRESHOLD,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl MuxConfig {
    /// Codec settings derived from this configuration.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            mode: self.mode,
            max_payload_size: self.max_payload_size.max(self.frame_size),
            desync_threshold: self.desync_threshold,
            ..FrameConfig::default()
        }
    }
}

/// A way of exposing virtual channels over one physical stream.
///
/// Implementations are sans-IO: bytes read from the stream go to
/// [`receive`](Self::receive), bytes to write come out of
/// [`poll_transmit`](Self::poll_transmit), and timers are driven through
/// [`poll_timeout`](Self::poll_timeout) and
/// [`handle_timeout`](Self::handle_timeout). Channels are addressed by DLCI.
pub trait SerialMultiplexer: Send {
    /// Variant name for diagnostics.
    fn name(&self) -> &'static str;

    /// Begin the session (opens the control channel where there is one).
    fn start(&mut self, now: Instant);

    /// Resolve `name` to a channel and start opening it.
    ///
    /// Completion is reported with [`MuxEvent::ChannelOpened`] or
    /// [`MuxEvent::ChannelOpenFailed`].
    fn open(&mut self, name: &str, now: Instant) -> Result<u8>;

    /// Start closing a channel. Completion is reported with
    /// [`MuxEvent::ChannelClosed`].
    fn close(&mut self, channel: u8, now: Instant) -> Result<()>;

    /// Queue data for an open channel.
    fn write(&mut self, channel: u8, data: &[u8]) -> Result<()>;

    /// Take every inbound byte buffered for a channel.
    fn read(&mut self, channel: u8) -> Option<Bytes>;

    /// Current state of a channel (`Closed` for channels never opened).
    fn state(&self, channel: u8) -> ChannelState;

    /// Update the V.24 signals advertised for a channel.
    fn set_signals(&mut self, channel: u8, signals: ModemSignals) -> Result<()>;

    /// Feed bytes read from the physical stream.
    fn receive(&mut self, now: Instant, bytes: &[u8]);

    /// Next chunk of bytes to write to the physical stream.
    fn poll_transmit(&mut self) -> Option<Bytes>;

    /// Earliest pending timer.
    fn poll_timeout(&self) -> Option<Instant>;

    /// Fire every timer due at `now`.
    fn handle_timeout(&mut self, now: Instant);

    /// Next upward event.
    fn poll_event(&mut self) -> Option<MuxEvent>;

    /// The physical stream failed: close everything without wire traffic.
    /// Frames queued but not yet taken by `poll_transmit` are discarded.
    fn link_down(&mut self);

    /// Close every channel and end the session.
    fn shutdown(&mut self);

    /// Whether the session has ended.
    fn is_terminated(&self) -> bool;

    /// Decoder statistics, for variants that frame the stream.
    fn link_health(&self) -> Option<&LinkHealth> {
        None
    }
}

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use cmux_frame::channel::is_logical;
use cmux_frame::codec::MAX_BASIC_PAYLOAD;
use cmux_frame::{
    channel_for_name, decode_control, encode_frame, ControlFrame, ControlMessage, Frame,
    FrameDecoder, FrameType, LinkHealth, ModemSignals, CONTROL, MAX_CHANNEL,
};
use tracing::{debug, info, trace, warn};

use crate::error::{MuxError, Result};
use crate::multiplexer::{
    ChannelState, CloseCause, MuxConfig, MuxEvent, OpenFailure, Role, SerialMultiplexer,
};

/// Low bits of a control type byte as received with C/R and EA set.
const CONTROL_TYPE_LOW_BITS: u8 = 0x03;

#[derive(Debug, Clone, Copy)]
struct Pending {
    attempts: u32,
    deadline: Instant,
}

#[derive(Debug)]
struct Channel {
    state: ChannelState,
    pending: Option<Pending>,
    inbound: BytesMut,
    held: VecDeque<Bytes>,
    local_signals: ModemSignals,
    remote_signals: Option<ModemSignals>,
}

impl Channel {
    fn new(signals: ModemSignals) -> Self {
        Self {
            state: ChannelState::Closed,
            pending: None,
            inbound: BytesMut::new(),
            held: VecDeque::new(),
            local_signals: signals,
            remote_signals: None,
        }
    }

    fn reset(&mut self) {
        self.state = ChannelState::Closed;
        self.pending = None;
        self.inbound.clear();
        self.held.clear();
        self.remote_signals = None;
    }

    fn remote_flow_stopped(&self) -> bool {
        self.remote_signals
            .is_some_and(|s| s.contains(ModemSignals::FC))
    }
}

/// GSM 07.10 multiplexer session over one physical stream.
///
/// DLCI 0 is the control channel; logical channels use 1..=63. SABM and
/// DISC are retransmitted every `ack_timeout` until the peer answers or
/// `max_attempts` transmissions have gone unanswered.
pub struct Gsm0710Multiplexer {
    config: MuxConfig,
    decoder: FrameDecoder,
    channels: BTreeMap<u8, Channel>,
    names: BTreeMap<String, u8>,
    transmit: VecDeque<Bytes>,
    events: VecDeque<MuxEvent>,
    flow_stopped: bool,
    link_down: bool,
    terminated: bool,
}

impl Gsm0710Multiplexer {
    pub fn new(mut config: MuxConfig) -> Self {
        config.frame_size = config.frame_size.clamp(1, MAX_BASIC_PAYLOAD);
        let decoder = FrameDecoder::with_config(&config.frame_config());
        Self {
            config,
            decoder,
            channels: BTreeMap::new(),
            names: BTreeMap::new(),
            transmit: VecDeque::new(),
            events: VecDeque::new(),
            flow_stopped: false,
            link_down: false,
            terminated: false,
        }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    /// Decoder statistics for the physical link.
    pub fn health(&self) -> &LinkHealth {
        self.decoder.health()
    }

    /// Last V.24 signals the peer reported for a channel.
    pub fn remote_signals(&self, channel: u8) -> Option<ModemSignals> {
        self.channels.get(&channel).and_then(|c| c.remote_signals)
    }

    fn is_initiator(&self) -> bool {
        self.config.role == Role::Initiator
    }

    fn check_usable(&self) -> Result<()> {
        if self.terminated {
            return Err(MuxError::Terminated);
        }
        if self.link_down {
            return Err(MuxError::LinkDown);
        }
        Ok(())
    }

    fn is_live(&self, id: u8) -> bool {
        self.channels
            .get(&id)
            .is_some_and(|c| c.state != ChannelState::Closed)
    }

    /// Map a channel name to a DLCI.
    ///
    /// Numeric names address their DLCI directly. A conventional name gets
    /// its DLCI unless an unrelated name holds it, and shares the channel of
    /// a bound alias; any other name gets the lowest free DLCI. Bindings
    /// last while the channel is not Closed.
    fn resolve(&mut self, name: &str) -> Result<u8> {
        let unknown = || MuxError::UnknownChannelName(name.to_string());
        if !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()) {
            return name
                .parse::<u8>()
                .ok()
                .filter(|id| is_logical(*id))
                .ok_or_else(unknown);
        }

        let channels = &self.channels;
        self.names.retain(|_, id| {
            channels
                .get(id)
                .is_some_and(|c| c.state != ChannelState::Closed)
        });
        if let Some(&id) = self.names.get(name) {
            return Ok(id);
        }
        let alias = channel_for_name(name).and_then(|preferred| {
            self.names
                .iter()
                .find(|(other, _)| channel_for_name(other) == Some(preferred))
                .map(|(_, &id)| id)
        });
        if let Some(id) = alias {
            self.names.insert(name.to_string(), id);
            return Ok(id);
        }

        let conventional = channel_for_name(name).filter(|&id| {
            !self
                .names
                .iter()
                .any(|(other, &bound)| bound == id && channel_for_name(other) != Some(id))
        });
        let id = match conventional {
            Some(id) => id,
            None => (1..=MAX_CHANNEL)
                .find(|&id| !self.is_live(id) && !self.names.values().any(|&b| b == id))
                .ok_or_else(unknown)?,
        };
        self.names.insert(name.to_string(), id);
        Ok(id)
    }

    fn send_frame(&mut self, channel: u8, frame_type: FrameType, payload: Bytes) {
        let command = !matches!(frame_type, FrameType::Ua | FrameType::Dm);
        // Commands carry C/R=1 from the initiator and C/R=0 from the responder.
        let cr = command == self.is_initiator();
        let frame = Frame::new(channel, frame_type, payload).with_cr(cr);

        let mut buf = BytesMut::with_capacity(2 * frame.wire_size(self.config.mode));
        match encode_frame(self.config.mode, &frame, &mut buf) {
            Ok(()) => self.transmit.push_back(buf.freeze()),
            Err(err) => warn!(dlci = channel, error = %err, "failed to encode frame"),
        }
    }

    fn send_control(&mut self, frame: ControlFrame) {
        trace!(message = ?frame.message, command = frame.command, "sending control message");
        self.send_frame(CONTROL, FrameType::Uih, frame.to_bytes());
    }

    fn send_modem_status(&mut self, channel: u8, signals: ModemSignals) {
        self.send_control(ControlFrame::command(ControlMessage::ModemStatus {
            channel,
            signals,
            break_signal: None,
        }));
    }

    fn flush_held(&mut self) {
        if self.flow_stopped {
            return;
        }
        let mut ready = Vec::new();
        for (&id, channel) in self.channels.iter_mut() {
            if channel.state != ChannelState::Open || channel.remote_flow_stopped() {
                continue;
            }
            ready.extend(channel.held.drain(..).map(|payload| (id, payload)));
        }
        for (id, payload) in ready {
            self.send_frame(id, FrameType::Uih, payload);
        }
    }

    fn note_health(&mut self) {
        if let Some(change) = self.decoder.take_health_change() {
            warn!(?change, health = ?self.decoder.health(), "link health changed");
            self.events.push_back(MuxEvent::LinkHealth(change));
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        let id = frame.channel;
        match frame.frame_type {
            FrameType::Sabm => self.on_sabm(id),
            FrameType::Ua => self.on_ua(id),
            FrameType::Dm => self.on_dm(id),
            FrameType::Disc => self.on_disc(id),
            FrameType::Uih | FrameType::Ui if id == CONTROL => self.on_control(&frame.payload),
            FrameType::Uih | FrameType::Ui => self.on_data(id, &frame.payload),
        }
    }

    fn on_sabm(&mut self, id: u8) {
        if self.is_initiator() {
            debug!(dlci = id, "refusing channel opened by peer");
            self.send_frame(id, FrameType::Dm, Bytes::new());
            return;
        }

        self.send_frame(id, FrameType::Ua, Bytes::new());
        let signals = self.config.signals;
        let channel = self.channels.entry(id).or_insert_with(|| Channel::new(signals));
        if channel.state == ChannelState::Open {
            return;
        }
        channel.state = ChannelState::Open;
        channel.pending = None;
        info!(dlci = id, "channel opened by peer");
        if id != CONTROL {
            self.events.push_back(MuxEvent::ChannelOpened {
                channel: id,
                remote: true,
            });
        }
    }

    fn on_ua(&mut self, id: u8) {
        let Some(channel) = self.channels.get_mut(&id) else {
            debug!(dlci = id, "ignoring UA for unknown channel");
            return;
        };
        match channel.state {
            ChannelState::Opening => {
                channel.state = ChannelState::Open;
                channel.pending = None;
                let signals = channel.local_signals;
                info!(dlci = id, "channel open");
                if id == CONTROL {
                    return;
                }
                self.events.push_back(MuxEvent::ChannelOpened {
                    channel: id,
                    remote: false,
                });
                if self.config.send_modem_status {
                    self.send_modem_status(id, signals);
                }
            }
            ChannelState::Closing => {
                channel.reset();
                info!(dlci = id, "channel closed");
                if id != CONTROL {
                    self.events.push_back(MuxEvent::ChannelClosed {
                        channel: id,
                        cause: CloseCause::Local,
                    });
                }
            }
            state => debug!(dlci = id, state = state.as_str(), "ignoring unexpected UA"),
        }
    }

    fn on_dm(&mut self, id: u8) {
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let state = channel.state;
        channel.reset();
        match state {
            ChannelState::Opening => {
                warn!(dlci = id, "channel open refused");
                self.events.push_back(MuxEvent::ChannelOpenFailed {
                    channel: id,
                    reason: OpenFailure::Refused,
                });
                if id == CONTROL {
                    self.terminate();
                }
            }
            ChannelState::Closing => self.events.push_back(MuxEvent::ChannelClosed {
                channel: id,
                cause: CloseCause::Local,
            }),
            ChannelState::Open => self.events.push_back(MuxEvent::ChannelClosed {
                channel: id,
                cause: CloseCause::Remote,
            }),
            ChannelState::Closed => {}
        }
    }

    fn on_disc(&mut self, id: u8) {
        if id == CONTROL {
            info!("peer closed the multiplexer");
            self.send_frame(CONTROL, FrameType::Ua, Bytes::new());
            self.terminate();
            return;
        }
        match self.channels.get_mut(&id) {
            Some(channel) if channel.state != ChannelState::Closed => {
                channel.reset();
                info!(dlci = id, "channel closed by peer");
                self.send_frame(id, FrameType::Ua, Bytes::new());
                self.events.push_back(MuxEvent::ChannelClosed {
                    channel: id,
                    cause: CloseCause::Remote,
                });
            }
            _ => self.send_frame(id, FrameType::Dm, Bytes::new()),
        }
    }

    fn on_data(&mut self, id: u8, payload: &[u8]) {
        match self.channels.get_mut(&id) {
            Some(channel) if channel.state == ChannelState::Open => {
                let was_empty = channel.inbound.is_empty();
                channel.inbound.extend_from_slice(payload);
                if was_empty && !payload.is_empty() {
                    self.events.push_back(MuxEvent::DataReady { channel: id });
                }
            }
            _ => debug!(
                dlci = id,
                len = payload.len(),
                "discarding data for channel that is not open"
            ),
        }
    }

    fn on_control(&mut self, payload: &[u8]) {
        let frames = match decode_control(payload) {
            Ok(frames) => frames,
            Err(err) => {
                debug!(error = %err, "malformed control message");
                return;
            }
        };
        for frame in frames {
            if frame.command {
                self.on_control_command(frame.message);
            } else {
                self.on_control_response(frame.message);
            }
        }
    }

    fn on_control_command(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::ModemStatus {
                channel,
                signals,
                break_signal,
            } => {
                self.send_control(ControlFrame::response(ControlMessage::ModemStatus {
                    channel,
                    signals,
                    break_signal,
                }));
                if let Some(ch) = self.channels.get_mut(&channel) {
                    if ch.remote_signals != Some(signals) {
                        ch.remote_signals = Some(signals);
                        debug!(dlci = channel, signals = signals.bits(), "modem status");
                        self.events
                            .push_back(MuxEvent::ModemStatus { channel, signals });
                    }
                }
                self.flush_held();
            }
            ControlMessage::Test(value) => {
                self.send_control(ControlFrame::response(ControlMessage::Test(value)));
            }
            ControlMessage::FlowControlOn => {
                debug!("peer resumed flow");
                self.flow_stopped = false;
                self.send_control(ControlFrame::response(ControlMessage::FlowControlOn));
                self.flush_held();
            }
            ControlMessage::FlowControlOff => {
                debug!("peer stopped flow");
                self.flow_stopped = true;
                self.send_control(ControlFrame::response(ControlMessage::FlowControlOff));
            }
            ControlMessage::CloseDown => {
                info!("peer requested multiplexer close down");
                self.send_control(ControlFrame::response(ControlMessage::CloseDown));
                self.terminate();
            }
            ControlMessage::NonSupported { command_type } => {
                debug!(command_type, "ignoring NSC sent as a command");
            }
            ControlMessage::Other { code, .. } => {
                debug!(code, "answering unsupported control command");
                self.send_control(ControlFrame::response(ControlMessage::NonSupported {
                    command_type: code | CONTROL_TYPE_LOW_BITS,
                }));
            }
        }
    }

    fn on_control_response(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::NonSupported { command_type } => {
                debug!(command_type, "peer does not support control command");
            }
            other => trace!(message = ?other, "control response"),
        }
    }

    fn retry_or_fail(&mut self, id: u8, now: Instant) {
        let max_attempts = self.config.max_attempts.max(1);
        let ack_timeout = self.config.ack_timeout;
        let Some(channel) = self.channels.get_mut(&id) else {
            return;
        };
        let Some(pending) = channel.pending else {
            return;
        };
        let state = channel.state;

        if pending.attempts < max_attempts {
            channel.pending = Some(Pending {
                attempts: pending.attempts + 1,
                deadline: now + ack_timeout,
            });
            let frame_type = if state == ChannelState::Opening {
                FrameType::Sabm
            } else {
                FrameType::Disc
            };
            debug!(
                dlci = id,
                attempt = pending.attempts + 1,
                frame_type = %frame_type,
                "retransmitting"
            );
            self.send_frame(id, frame_type, Bytes::new());
            return;
        }

        channel.reset();
        match state {
            ChannelState::Opening => {
                warn!(dlci = id, attempts = pending.attempts, "channel open timed out");
                self.events.push_back(MuxEvent::ChannelOpenFailed {
                    channel: id,
                    reason: OpenFailure::Timeout,
                });
                if id == CONTROL {
                    self.link_down();
                }
            }
            ChannelState::Closing => {
                warn!(dlci = id, attempts = pending.attempts, "channel close timed out");
                self.events.push_back(MuxEvent::ChannelClosed {
                    channel: id,
                    cause: CloseCause::Timeout,
                });
            }
            _ => {}
        }
    }

    /// End the session, leaving queued frames in place so they still go out.
    fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        for (&id, channel) in self.channels.iter_mut() {
            if id != CONTROL && channel.state != ChannelState::Closed {
                self.events.push_back(MuxEvent::ChannelClosed {
                    channel: id,
                    cause: CloseCause::Terminated,
                });
            }
            channel.reset();
        }
        self.terminated = true;
        info!("multiplexer terminated");
        self.events.push_back(MuxEvent::Terminated);
    }
}

impl SerialMultiplexer for Gsm0710Multiplexer {
    fn name(&self) -> &'static str {
        "gsm0710"
    }

    fn start(&mut self, now: Instant) {
        if self.terminated || self.link_down || !self.is_initiator() {
            return;
        }
        let signals = self.config.signals;
        let deadline = now + self.config.ack_timeout;
        let control = self
            .channels
            .entry(CONTROL)
            .or_insert_with(|| Channel::new(signals));
        if control.state != ChannelState::Closed {
            return;
        }
        control.state = ChannelState::Opening;
        control.pending = Some(Pending {
            attempts: 1,
            deadline,
        });
        info!(mode = %self.config.mode, frame_size = self.config.frame_size, "starting multiplexer");
        self.send_frame(CONTROL, FrameType::Sabm, Bytes::new());
    }

    fn open(&mut self, name: &str, now: Instant) -> Result<u8> {
        self.check_usable()?;
        let id = self.resolve(name)?;
        let signals = self.config.signals;
        let deadline = now + self.config.ack_timeout;
        let channel = self.channels.entry(id).or_insert_with(|| Channel::new(signals));
        match channel.state {
            ChannelState::Open | ChannelState::Opening => return Ok(id),
            ChannelState::Closing => return Err(MuxError::ChannelBusy(id)),
            ChannelState::Closed => {}
        }
        channel.state = ChannelState::Opening;
        channel.pending = Some(Pending {
            attempts: 1,
            deadline,
        });
        debug!(dlci = id, name, "opening channel");
        self.send_frame(id, FrameType::Sabm, Bytes::new());
        Ok(id)
    }

    fn close(&mut self, channel: u8, now: Instant) -> Result<()> {
        if self.terminated {
            return Err(MuxError::Terminated);
        }
        if !is_logical(channel) {
            return Err(MuxError::UnknownChannel(channel));
        }
        let link_down = self.link_down;
        let deadline = now + self.config.ack_timeout;
        let Some(ch) = self.channels.get_mut(&channel) else {
            return Err(MuxError::UnknownChannel(channel));
        };
        match ch.state {
            ChannelState::Closed | ChannelState::Closing => return Ok(()),
            ChannelState::Opening | ChannelState::Open => {}
        }
        if link_down {
            ch.reset();
            self.events.push_back(MuxEvent::ChannelClosed {
                channel,
                cause: CloseCause::LinkDown,
            });
            return Ok(());
        }
        ch.state = ChannelState::Closing;
        ch.pending = Some(Pending {
            attempts: 1,
            deadline,
        });
        ch.held.clear();
        debug!(dlci = channel, "closing channel");
        self.send_frame(channel, FrameType::Disc, Bytes::new());
        Ok(())
    }

    fn write(&mut self, channel: u8, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        let frame_size = self.config.frame_size;
        let ch = self
            .channels
            .get_mut(&channel)
            .filter(|c| c.state == ChannelState::Open && channel != CONTROL)
            .ok_or(MuxError::ChannelNotOpen(channel))?;
        for chunk in data.chunks(frame_size) {
            ch.held.push_back(Bytes::copy_from_slice(chunk));
        }
        self.flush_held();
        Ok(())
    }

    fn read(&mut self, channel: u8) -> Option<Bytes> {
        self.channels
            .get_mut(&channel)
            .filter(|c| !c.inbound.is_empty())
            .map(|c| c.inbound.split().freeze())
    }

    fn state(&self, channel: u8) -> ChannelState {
        self.channels
            .get(&channel)
            .map_or(ChannelState::Closed, |c| c.state)
    }

    fn set_signals(&mut self, channel: u8, signals: ModemSignals) -> Result<()> {
        self.check_usable()?;
        let ch = self
            .channels
            .get_mut(&channel)
            .ok_or(MuxError::UnknownChannel(channel))?;
        ch.local_signals = signals;
        if ch.state == ChannelState::Open {
            self.send_modem_status(channel, signals);
        }
        Ok(())
    }

    fn receive(&mut self, _now: Instant, bytes: &[u8]) {
        if self.terminated || self.link_down {
            return;
        }
        self.decoder.push(bytes);
        while let Some(frame) = self.decoder.next_frame() {
            self.note_health();
            self.handle_frame(frame);
            if self.terminated {
                return;
            }
        }
        self.note_health();
    }

    fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmit.pop_front()
    }

    fn poll_timeout(&self) -> Option<Instant> {
        self.channels
            .values()
            .filter_map(|c| c.pending.map(|p| p.deadline))
            .min()
    }

    fn handle_timeout(&mut self, now: Instant) {
        let due: Vec<u8> = self
            .channels
            .iter()
            .filter(|(_, c)| c.pending.is_some_and(|p| p.deadline <= now))
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            self.retry_or_fail(id, now);
        }
    }

    fn poll_event(&mut self) -> Option<MuxEvent> {
        self.events.pop_front()
    }

    fn link_down(&mut self) {
        if self.link_down || self.terminated {
            return;
        }
        warn!("link down; closing every channel");
        self.link_down = true;
        for (&id, channel) in self.channels.iter_mut() {
            if id != CONTROL {
                match channel.state {
                    ChannelState::Opening => self.events.push_back(MuxEvent::ChannelOpenFailed {
                        channel: id,
                        reason: OpenFailure::LinkDown,
                    }),
                    ChannelState::Open | ChannelState::Closing => {
                        self.events.push_back(MuxEvent::ChannelClosed {
                            channel: id,
                            cause: CloseCause::LinkDown,
                        })
                    }
                    ChannelState::Closed => {}
                }
            }
            channel.reset();
        }
        self.transmit.clear();
        self.decoder.reset();
        self.events.push_back(MuxEvent::LinkDown);
    }

    fn shutdown(&mut self) {
        if self.terminated {
            return;
        }
        if !self.link_down {
            let open: Vec<u8> = self
                .channels
                .iter()
                .filter(|&(&id, c)| id != CONTROL && c.state != ChannelState::Closed)
                .map(|(&id, _)| id)
                .collect();
            for id in open {
                self.send_frame(id, FrameType::Disc, Bytes::new());
            }
            if self.state(CONTROL) != ChannelState::Closed {
                self.send_control(ControlFrame::command(ControlMessage::CloseDown));
            }
        }
        self.terminate();
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn link_health(&self) -> Option<&LinkHealth> {
        Some(self.decoder.health())
    }
}

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::channel::MAX_CHANNEL;
use crate::error::{FrameError, Result};
use crate::health::{HealthChange, LinkHealth, DEFAULT_DESYNC_THRESHOLD};

/// Frame delimiter in basic mode.
pub const BASIC_FLAG: u8 = 0xF9;

/// Frame delimiter in advanced mode.
pub const ADVANCED_FLAG: u8 = 0x7E;

/// Control escape in advanced mode.
pub const ADVANCED_ESCAPE: u8 = 0x7D;

const ESCAPE_XOR: u8 = 0x20;

/// Default N1 (maximum information field length).
pub const DEFAULT_FRAME_SIZE: usize = 31;

/// Largest payload the two-byte basic-mode length field can describe.
pub const MAX_BASIC_PAYLOAD: usize = 0x7FFF;

/// Default upper bound on inbound payloads.
pub const DEFAULT_MAX_PAYLOAD: usize = 4096;

pub(crate) const EA: u8 = 0x01;
pub(crate) const CR: u8 = 0x02;
const PF: u8 = 0x10;

/// Framing variant negotiated with `AT+CMUX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FramingMode {
    /// Length-delimited frames between 0xF9 flags.
    #[default]
    Basic,
    /// Byte-stuffed frames between 0x7E flags.
    Advanced,
}

impl FramingMode {
    /// The flag byte delimiting frames in this mode.
    pub fn flag(self) -> u8 {
        match self {
            Self::Basic => BASIC_FLAG,
            Self::Advanced => ADVANCED_FLAG,
        }
    }

    /// The `<mode>` parameter of `AT+CMUX`.
    pub fn cmux_value(self) -> u8 {
        match self {
            Self::Basic => 0,
            Self::Advanced => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Advanced => "advanced",
        }
    }
}

impl fmt::Display for FramingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame type carried in the control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Set asynchronous balanced mode (open).
    Sabm,
    /// Unnumbered acknowledgement.
    Ua,
    /// Disconnected mode (refusal).
    Dm,
    /// Disconnect (close).
    Disc,
    /// Unnumbered information with header check.
    Uih,
    /// Unnumbered information, payload covered by the FCS.
    Ui,
}

impl FrameType {
    /// Control field value with the P/F bit clear.
    pub const fn control_bits(self) -> u8 {
        match self {
            Self::Sabm => 0x2F,
            Self::Ua => 0x63,
            Self::Dm => 0x0F,
            Self::Disc => 0x43,
            Self::Uih => 0xEF,
            Self::Ui => 0x03,
        }
    }

    /// Parse a control field into its frame type and P/F bit.
    pub fn from_control(control: u8) -> Option<(Self, bool)> {
        let poll_final = control & PF != 0;
        let frame_type = match control & !PF {
            0x2F => Self::Sabm,
            0x63 => Self::Ua,
            0x0F => Self::Dm,
            0x43 => Self::Disc,
            0xEF => Self::Uih,
            0x03 => Self::Ui,
            _ => return None,
        };
        Some((frame_type, poll_final))
    }

    /// Whether this frame carries channel data.
    pub fn is_information(self) -> bool {
        matches!(self, Self::Uih | Self::Ui)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sabm => "SABM",
            Self::Ua => "UA",
            Self::Dm => "DM",
            Self::Disc => "DISC",
            Self::Uih => "UIH",
            Self::Ui => "UI",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single multiplexer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// DLCI this frame is addressed to.
    pub channel: u8,
    /// Frame type from the control field.
    pub frame_type: FrameType,
    /// Command/response bit of the address field.
    pub cr: bool,
    /// Poll/final bit of the control field.
    pub poll_final: bool,
    /// Information field.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with C/R set and the usual P/F bit for its type
    /// (set on SABM/UA/DM/DISC, clear on UIH/UI).
    pub fn new(channel: u8, frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            frame_type,
            cr: true,
            poll_final: !frame_type.is_information(),
            payload: payload.into(),
        }
    }

    /// Replace the command/response bit.
    pub fn with_cr(mut self, cr: bool) -> Self {
        self.cr = cr;
        self
    }

    /// Replace the poll/final bit.
    pub fn with_poll_final(mut self, poll_final: bool) -> Self {
        self.poll_final = poll_final;
        self
    }

    /// Encoded address field.
    pub fn address(&self) -> u8 {
        let cr = if self.cr { CR } else { 0 };
        (self.channel << 2) | cr | EA
    }

    /// Encoded control field.
    pub fn control(&self) -> u8 {
        let pf = if self.poll_final { PF } else { 0 };
        self.frame_type.control_bits() | pf
    }

    /// Wire size of this frame in `mode`, before advanced-mode stuffing.
    pub fn wire_size(&self, mode: FramingMode) -> usize {
        let len = self.payload.len();
        match mode {
            FramingMode::Basic => {
                let length_field = if len >= 128 { 2 } else { 1 };
                5 + length_field + len
            }
            FramingMode::Advanced => 5 + len,
        }
    }
}

const FCS_TABLE: [u8; 256] = build_fcs_table();

const fn build_fcs_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xE0
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn fcs_update(mut crc: u8, bytes: &[u8]) -> u8 {
    for &b in bytes {
        crc = FCS_TABLE[(crc ^ b) as usize];
    }
    crc
}

/// GSM 07.10 frame check sequence over `bytes`.
pub fn fcs(bytes: &[u8]) -> u8 {
    !fcs_update(0xFF, bytes)
}

fn frame_check(frame_type: FrameType, header: &[u8], payload: &[u8]) -> u8 {
    let crc = fcs_update(0xFF, header);
    if frame_type == FrameType::Ui {
        !fcs_update(crc, payload)
    } else {
        !crc
    }
}

fn put_stuffed(dst: &mut BytesMut, bytes: &[u8]) {
    for &b in bytes {
        if b == ADVANCED_FLAG || b == ADVANCED_ESCAPE {
            dst.put_u8(ADVANCED_ESCAPE);
            dst.put_u8(b ^ ESCAPE_XOR);
        } else {
            dst.put_u8(b);
        }
    }
}

/// Encode a frame into the wire format.
///
/// Basic mode:
/// ```text
/// ┌──────┬─────────┬─────────┬──────────┬─────────┬─────┬──────┐
/// │ 0xF9 │ Address │ Control │ Length   │ Payload │ FCS │ 0xF9 │
/// │      │         │         │ (1-2 B)  │         │     │      │
/// └──────┴─────────┴─────────┴──────────┴─────────┴─────┴──────┘
/// ```
/// Advanced mode drops the length field and byte-stuffs everything between
/// the 0x7E flags.
pub fn encode_frame(mode: FramingMode, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if frame.channel > MAX_CHANNEL {
        return Err(FrameError::InvalidChannel(frame.channel));
    }
    let len = frame.payload.len();

    match mode {
        FramingMode::Basic => {
            if len > MAX_BASIC_PAYLOAD {
                return Err(FrameError::PayloadTooLarge {
                    size: len,
                    max: MAX_BASIC_PAYLOAD,
                });
            }
            let mut header = [frame.address(), frame.control(), 0, 0];
            let header_len = if len < 128 {
                header[2] = ((len as u8) << 1) | EA;
                3
            } else {
                header[2] = ((len << 1) & 0xFE) as u8;
                header[3] = (len >> 7) as u8;
                4
            };
            let header = &header[..header_len];
            let check = frame_check(frame.frame_type, header, &frame.payload);

            dst.reserve(header_len + len + 3);
            dst.put_u8(BASIC_FLAG);
            dst.put_slice(header);
            dst.put_slice(&frame.payload);
            dst.put_u8(check);
            dst.put_u8(BASIC_FLAG);
        }
        FramingMode::Advanced => {
            let header = [frame.address(), frame.control()];
            let check = frame_check(frame.frame_type, &header, &frame.payload);

            dst.reserve(2 * (len + 3) + 2);
            dst.put_u8(ADVANCED_FLAG);
            put_stuffed(dst, &header);
            put_stuffed(dst, &frame.payload);
            put_stuffed(dst, &[check]);
            dst.put_u8(ADVANCED_FLAG);
        }
    }

    trace!(
        mode = %mode,
        dlci = frame.channel,
        frame_type = %frame.frame_type,
        len,
        "encoded frame"
    );
    Ok(())
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Basic or advanced framing.
    pub mode: FramingMode,
    /// Maximum inbound payload size; longer frames are dropped. Default: 4 KiB.
    pub max_payload_size: usize,
    /// Consecutive bad frames that mark the link desynchronized. Default: 3.
    pub desync_threshold: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            mode: FramingMode::Basic,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            desync_threshold: DEFAULT_DESYNC_THRESHOLD,
        }
    }
}

enum Step {
    Frame(Frame),
    NeedMore,
    Drop(FrameError, usize),
}

enum Basic {
    Frame {
        address: u8,
        frame_type: FrameType,
        poll_final: bool,
        header_end: usize,
        len: usize,
    },
    NeedMore,
    Bad(FrameError, usize),
}

/// Incremental frame decoder.
///
/// Bytes may arrive in arbitrary fragments. Bad frames are dropped and
/// decoding resumes at the next flag byte; the damage is only visible
/// through [`FrameDecoder::health`].
#[derive(Debug)]
pub struct FrameDecoder {
    mode: FramingMode,
    buf: BytesMut,
    max_payload: usize,
    desync_threshold: u32,
    health: LinkHealth,
    pending_change: Option<HealthChange>,
}

impl FrameDecoder {
    /// Create a decoder for `mode` with default limits.
    pub fn new(mode: FramingMode) -> Self {
        Self::with_config(&FrameConfig {
            mode,
            ..FrameConfig::default()
        })
    }

    /// Create a decoder from explicit configuration.
    pub fn with_config(config: &FrameConfig) -> Self {
        Self {
            mode: config.mode,
            buf: BytesMut::with_capacity(1024),
            max_payload: config.max_payload_size.min(MAX_BASIC_PAYLOAD),
            desync_threshold: config.desync_threshold,
            health: LinkHealth::default(),
            pending_change: None,
        }
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decoder statistics.
    pub fn health(&self) -> &LinkHealth {
        &self.health
    }

    /// Take the latest desync/recovery transition, if any.
    pub fn take_health_change(&mut self) -> Option<HealthChange> {
        self.pending_change.take()
    }

    /// Drop all buffered bytes.
    pub fn reset(&mut self) {
        self.health.record_discarded(self.buf.len());
        self.buf.clear();
    }

    /// Decode the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let step = match self.mode {
                FramingMode::Basic => self.decode_basic(),
                FramingMode::Advanced => self.decode_advanced(),
            };
            match step {
                Step::Frame(frame) => {
                    if let Some(change) = self.health.record_frame() {
                        self.pending_change = Some(change);
                    }
                    trace!(
                        dlci = frame.channel,
                        frame_type = %frame.frame_type,
                        len = frame.payload.len(),
                        "decoded frame"
                    );
                    return Some(frame);
                }
                Step::NeedMore => return None,
                Step::Drop(err, consumed) => {
                    debug!(error = %err, consumed, "dropping frame");
                    if let Some(change) = self.health.record_error(&err, self.desync_threshold) {
                        self.pending_change = Some(change);
                    }
                    self.health.record_discarded(consumed);
                    self.buf.advance(consumed);
                }
            }
        }
    }

    /// Discard everything before the next flag.
    fn sync_to_flag(&mut self) -> bool {
        let flag = self.mode.flag();
        match self.buf.iter().position(|&b| b == flag) {
            Some(pos) => {
                if pos > 0 {
                    self.health.record_discarded(pos);
                    self.buf.advance(pos);
                }
                true
            }
            None => {
                self.health.record_discarded(self.buf.len());
                self.buf.clear();
                false
            }
        }
    }

    /// Parse the basic frame whose opening flag sits at `start`.
    fn parse_basic(&self, start: usize) -> Basic {
        let buf = &self.buf[start..];
        if buf.len() < 4 {
            return Basic::NeedMore;
        }

        let address = buf[1];
        if address & EA == 0 {
            return Basic::Bad(FrameError::Malformed("address extension bit clear"), 1);
        }
        let Some((frame_type, poll_final)) = FrameType::from_control(buf[2]) else {
            return Basic::Bad(FrameError::Malformed("unknown control field"), 1);
        };
        let (len, header_end) = if buf[3] & EA != 0 {
            ((buf[3] >> 1) as usize, 4)
        } else {
            if buf.len() < 5 {
                return Basic::NeedMore;
            }
            ((buf[3] >> 1) as usize | (buf[4] as usize) << 7, 5)
        };
        if len > self.max_payload {
            return Basic::Bad(
                FrameError::PayloadTooLarge {
                    size: len,
                    max: self.max_payload,
                },
                1,
            );
        }

        let total = header_end + len + 2;
        if buf.len() < total {
            return Basic::NeedMore;
        }
        if buf[total - 1] != BASIC_FLAG {
            return Basic::Bad(FrameError::Malformed("missing closing flag"), 1);
        }

        let payload_end = header_end + len;
        let expected = frame_check(
            frame_type,
            &buf[1..header_end],
            &buf[header_end..payload_end],
        );
        let actual = buf[payload_end];
        if expected != actual {
            return Basic::Bad(FrameError::Fcs { expected, actual }, total - 1);
        }
        Basic::Frame {
            address,
            frame_type,
            poll_final,
            header_end,
            len,
        }
    }

    fn decode_basic(&mut self) -> Step {
        if !self.sync_to_flag() {
            return Step::NeedMore;
        }

        // 0xF9 is also the address of a DLCI 62 response, so a second flag
        // is idle fill only if the bytes after it hold a frame.
        while self.buf.len() >= 2 && self.buf[1] == BASIC_FLAG {
            match (self.parse_basic(1), self.parse_basic(0)) {
                (Basic::Frame { .. }, _) | (Basic::Bad(..), Basic::Bad(..)) => self.buf.advance(1),
                (_, Basic::Frame { .. }) => break,
                _ => return Step::NeedMore,
            }
        }

        match self.parse_basic(0) {
            Basic::NeedMore => Step::NeedMore,
            Basic::Bad(err, consumed) => Step::Drop(err, consumed),
            Basic::Frame {
                address,
                frame_type,
                poll_final,
                header_end,
                len,
            } => {
                self.buf.advance(header_end);
                let payload = self.buf.split_to(len).freeze();
                // Keep the closing flag: it may also open the next frame.
                self.buf.advance(1);

                Step::Frame(Frame {
                    channel: address >> 2,
                    frame_type,
                    cr: address & CR != 0,
                    poll_final,
                    payload,
                })
            }
        }
    }

    fn decode_advanced(&mut self) -> Step {
        if !self.sync_to_flag() {
            return Step::NeedMore;
        }
        // The flag never appears inside a stuffed frame.
        while self.buf.len() >= 2 && self.buf[1] == ADVANCED_FLAG {
            self.buf.advance(1);
        }
        if self.buf.len() < 2 {
            return Step::NeedMore;
        }

        let Some(end) = self.buf[1..]
            .iter()
            .position(|&b| b == ADVANCED_FLAG)
            .map(|pos| pos + 1)
        else {
            let limit = 2 * (self.max_payload + 3) + 2;
            if self.buf.len() > limit {
                return Step::Drop(FrameError::Malformed("no closing flag in range"), 1);
            }
            return Step::NeedMore;
        };

        let mut content = Vec::with_capacity(end);
        let mut escaped = false;
        for &b in &self.buf[1..end] {
            if escaped {
                content.push(b ^ ESCAPE_XOR);
                escaped = false;
            } else if b == ADVANCED_ESCAPE {
                escaped = true;
            } else {
                content.push(b);
            }
        }
        if escaped {
            return Step::Drop(FrameError::Malformed("dangling escape"), end);
        }
        if content.len() < 3 {
            return Step::Drop(FrameError::Malformed("frame too short"), end);
        }
        if content.len() - 3 > self.max_payload {
            return Step::Drop(
                FrameError::PayloadTooLarge {
                    size: content.len() - 3,
                    max: self.max_payload,
                },
                end,
            );
        }

        let address = content[0];
        if address & EA == 0 {
            return Step::Drop(FrameError::Malformed("address extension bit clear"), end);
        }
        let Some((frame_type, poll_final)) = FrameType::from_control(content[1]) else {
            return Step::Drop(FrameError::Malformed("unknown control field"), end);
        };
        let payload_end = content.len() - 1;
        let expected = frame_check(frame_type, &content[..2], &content[2..payload_end]);
        let actual = content[payload_end];
        if expected != actual {
            return Step::Drop(FrameError::Fcs { expected, actual }, end);
        }

        self.buf.advance(end);
        Step::Frame(Frame {
            channel: address >> 2,
            frame_type,
            cr: address & CR != 0,
            poll_final,
            payload: Bytes::copy_from_slice(&content[2..payload_end]),
        })
    }
}

//! Messages carried in UIH frames on the control channel (DLCI 0).
//!
//! Each message is a type byte, an EA-extended length and a value:
//! ```text
//! ┌──────────────────────┬──────────────┬───────┐
//! │ code | C/R<<1 | EA   │ length (EA)  │ value │
//! └──────────────────────┴──────────────┴───────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{CR, EA};
use crate::error::{FrameError, Result};

/// Parameter negotiation.
pub const PN: u8 = 0x80;
/// Power saving control.
pub const PSC: u8 = 0x40;
/// Multiplexer close down.
pub const CLD: u8 = 0xC0;
/// Test command.
pub const TEST: u8 = 0x20;
/// Flow control on (all channels).
pub const FCON: u8 = 0xA0;
/// Flow control off (all channels).
pub const FCOFF: u8 = 0x60;
/// Modem status command.
pub const MSC: u8 = 0xE0;
/// Non supported command response.
pub const NSC: u8 = 0x10;
/// Remote port negotiation.
pub const RPN: u8 = 0x90;
/// Remote line status.
pub const RLS: u8 = 0x50;
/// Service negotiation.
pub const SNC: u8 = 0xD0;

/// V.24 signals carried by a modem status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModemSignals(u8);

impl ModemSignals {
    /// Flow control: the sender cannot accept frames.
    pub const FC: Self = Self(0x02);
    /// Ready to communicate (DTR/DSR).
    pub const RTC: Self = Self(0x04);
    /// Ready to receive (RTS/CTS).
    pub const RTR: Self = Self(0x08);
    /// Incoming call indicator (RI).
    pub const IC: Self = Self(0x40);
    /// Data valid (DCD).
    pub const DV: Self = Self(0x80);

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build from a wire octet; the EA bit is ignored.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & !EA)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl Default for ModemSignals {
    /// DTR, RTS and DCD asserted (0x8D on the wire).
    fn default() -> Self {
        Self::RTC.union(Self::RTR).union(Self::DV)
    }
}

impl std::ops::BitOr for ModemSignals {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// A decoded control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// V.24 signal update for a channel.
    ModemStatus {
        channel: u8,
        signals: ModemSignals,
        break_signal: Option<u8>,
    },
    /// Shut the multiplexer down.
    CloseDown,
    /// Echo test; the response carries the same bytes.
    Test(Bytes),
    /// Resume transmission on all channels.
    FlowControlOn,
    /// Stop transmission on all channels.
    FlowControlOff,
    /// The peer did not understand the message with this type byte.
    NonSupported { command_type: u8 },
    /// Any message this crate does not interpret (PN, RPN, RLS, SNC, PSC, ...).
    Other { code: u8, value: Bytes },
}

impl ControlMessage {
    /// Type code with the C/R and EA bits clear.
    pub fn code(&self) -> u8 {
        match self {
            Self::ModemStatus { .. } => MSC,
            Self::CloseDown => CLD,
            Self::Test(_) => TEST,
            Self::FlowControlOn => FCON,
            Self::FlowControlOff => FCOFF,
            Self::NonSupported { .. } => NSC,
            Self::Other { code, .. } => *code,
        }
    }

    fn value(&self) -> Bytes {
        match self {
            Self::ModemStatus {
                channel,
                signals,
                break_signal,
            } => {
                let mut value = BytesMut::with_capacity(3);
                value.put_u8((*channel << 2) | CR | EA);
                let ea = if break_signal.is_some() { 0 } else { EA };
                value.put_u8(signals.bits() | ea);
                if let Some(brk) = break_signal {
                    value.put_u8(*brk | EA);
                }
                value.freeze()
            }
            Self::CloseDown | Self::FlowControlOn | Self::FlowControlOff => Bytes::new(),
            Self::Test(value) | Self::Other { value, .. } => value.clone(),
            Self::NonSupported { command_type } => Bytes::copy_from_slice(&[*command_type]),
        }
    }
}

/// A control message together with its command/response bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    /// True for commands, false for responses.
    pub command: bool,
    pub message: ControlMessage,
}

impl ControlFrame {
    pub fn command(message: ControlMessage) -> Self {
        Self {
            command: true,
            message,
        }
    }

    pub fn response(message: ControlMessage) -> Self {
        Self {
            command: false,
            message,
        }
    }

    /// Append the encoded message to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        let value = self.message.value();
        let cr = if self.command { CR } else { 0 };
        dst.put_u8(self.message.code() | cr | EA);
        put_length(dst, value.len());
        dst.put_slice(&value);
    }

    /// Encode into a fresh buffer, ready to be sent as a UIH payload.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

fn put_length(dst: &mut BytesMut, mut len: usize) {
    loop {
        let chunk = ((len & 0x7F) as u8) << 1;
        len >>= 7;
        if len == 0 {
            dst.put_u8(chunk | EA);
            return;
        }
        dst.put_u8(chunk);
    }
}

/// Decode every message in a control-channel payload.
pub fn decode_control(mut src: &[u8]) -> Result<Vec<ControlFrame>> {
    let mut out = Vec::new();
    while !src.is_empty() {
        let type_byte = src[0];
        if type_byte & EA == 0 {
            return Err(FrameError::Malformed("extended control type not supported"));
        }
        let command = type_byte & CR != 0;
        let code = type_byte & !(CR | EA);

        let mut len = 0usize;
        let mut shift = 0;
        let mut pos = 1;
        loop {
            let Some(&b) = src.get(pos) else {
                return Err(FrameError::Malformed("truncated control length"));
            };
            pos += 1;
            len |= ((b >> 1) as usize) << shift;
            if b & EA != 0 {
                break;
            }
            shift += 7;
            if shift > 21 {
                return Err(FrameError::Malformed("control length too long"));
            }
        }
        if src.len() < pos + len {
            return Err(FrameError::Malformed("truncated control value"));
        }
        let value = &src[pos..pos + len];
        src = &src[pos + len..];

        let message = match code {
            MSC => parse_modem_status(value)?,
            CLD => ControlMessage::CloseDown,
            TEST => ControlMessage::Test(Bytes::copy_from_slice(value)),
            FCON => ControlMessage::FlowControlOn,
            FCOFF => ControlMessage::FlowControlOff,
            NSC => ControlMessage::NonSupported {
                command_type: value.first().copied().unwrap_or(0),
            },
            _ => ControlMessage::Other {
                code,
                value: Bytes::copy_from_slice(value),
            },
        };
        out.push(ControlFrame { command, message });
    }
    Ok(out)
}

fn parse_modem_status(value: &[u8]) -> Result<ControlMessage> {
    if value.len() < 2 {
        return Err(FrameError::Malformed("modem status too short"));
    }
    let break_signal = if value[1] & EA == 0 {
        value.get(2).map(|b| b & !EA)
    } else {
        None
    };
    Ok(ControlMessage::ModemStatus {
        channel: value[0] >> 2,
        signals: ModemSignals::from_bits(value[1]),
        break_signal,
    })
}

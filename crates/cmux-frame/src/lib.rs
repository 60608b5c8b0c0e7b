//! GSM 07.10 / 3GPP TS 27.010 framing for cellular modem multiplexing.
//!
//! Every frame carries:
//! - A flag byte (0xF9 basic, 0x7E advanced) on each side
//! - An address byte with the DLCI and the command/response bit
//! - A control byte with the frame type and the poll/final bit
//! - A length field (basic mode only)
//! - An 8-bit frame check sequence
//!
//! Decoding is incremental and self-healing: bad frames are dropped, counted
//! in [`LinkHealth`], and the decoder resynchronizes on the next flag.

pub mod channel;
pub mod codec;
pub mod control;
pub mod error;
pub mod health;
pub mod reader;
pub mod writer;

pub use channel::{channel_for_name, channel_name, AUX, CONTROL, DATA, MAX_CHANNEL, PRIMARY, SECONDARY};
pub use codec::{
    encode_frame, fcs, Frame, FrameConfig, FrameDecoder, FrameType, FramingMode,
    DEFAULT_FRAME_SIZE, DEFAULT_MAX_PAYLOAD,
};
pub use control::{decode_control, ControlFrame, ControlMessage, ModemSignals};
pub use error::{FrameError, Result};
pub use health::{HealthChange, LinkHealth};
pub use reader::FrameReader;

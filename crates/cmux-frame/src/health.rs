use crate::error::FrameError;

/// Consecutive bad frames before the link counts as desynchronized.
pub const DEFAULT_DESYNC_THRESHOLD: u32 = 3;

/// Decoder statistics for one physical link.
///
/// Framing errors never surface as hard errors; they show up here instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkHealth {
    /// Frames that passed every check.
    pub frames_decoded: u64,
    /// Frames dropped because of a frame check sequence mismatch.
    pub fcs_errors: u64,
    /// Frames dropped for any other structural reason.
    pub malformed_frames: u64,
    /// Bytes thrown away while searching for the next flag.
    pub discarded_bytes: u64,
    /// Bad frames since the last good one.
    pub consecutive_errors: u32,
    desynced: bool,
}

/// A change in link state worth reporting upward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthChange {
    /// The error threshold was reached.
    Desynced,
    /// A good frame arrived after a desync.
    Recovered,
}

impl LinkHealth {
    /// Whether the decoder is currently in a desync episode.
    pub fn is_desynced(&self) -> bool {
        self.desynced
    }

    pub(crate) fn record_frame(&mut self) -> Option<HealthChange> {
        self.frames_decoded += 1;
        self.consecutive_errors = 0;
        if self.desynced {
            self.desynced = false;
            return Some(HealthChange::Recovered);
        }
        None
    }

    pub(crate) fn record_error(&mut self, err: &FrameError, threshold: u32) -> Option<HealthChange> {
        match err {
            FrameError::Fcs { .. } => self.fcs_errors += 1,
            _ => self.malformed_frames += 1,
        }
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        if !self.desynced && threshold > 0 && self.consecutive_errors >= threshold {
            self.desynced = true;
            return Some(HealthChange::Desynced);
        }
        None
    }

    pub(crate) fn record_discarded(&mut self, bytes: usize) {
        self.discarded_bytes += bytes as u64;
    }
}

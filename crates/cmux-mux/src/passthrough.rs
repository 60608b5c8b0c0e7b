use std::collections::VecDeque;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use cmux_frame::{ModemSignals, PRIMARY};
use tracing::debug;

use crate::error::{MuxError, Result};
use crate::multiplexer::{ChannelState, CloseCause, MuxEvent, SerialMultiplexer};

/// Fallback for modems without multiplexing: one channel, raw bytes.
///
/// Every channel name maps to the single channel, which opens at once.
#[derive(Debug, Default)]
pub struct PassthroughMultiplexer {
    state: ChannelState,
    inbound: BytesMut,
    transmit: VecDeque<Bytes>,
    events: VecDeque<MuxEvent>,
    link_down: bool,
    terminated: bool,
}

impl PassthroughMultiplexer {
    pub fn new() -> Self {
        Self::default()
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

    fn close_with(&mut self, cause: CloseCause) {
        if self.state != ChannelState::Closed {
            self.state = ChannelState::Closed;
            self.inbound.clear();
            self.events.push_back(MuxEvent::ChannelClosed {
                channel: PRIMARY,
                cause,
            });
        }
    }
}

impl SerialMultiplexer for PassthroughMultiplexer {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn start(&mut self, _now: Instant) {}

    fn open(&mut self, name: &str, _now: Instant) -> Result<u8> {
        self.check_usable()?;
        if self.state != ChannelState::Open {
            debug!(name, "passthrough channel open");
            self.state = ChannelState::Open;
            self.events.push_back(MuxEvent::ChannelOpened {
                channel: PRIMARY,
                remote: false,
            });
        }
        Ok(PRIMARY)
    }

    fn close(&mut self, channel: u8, _now: Instant) -> Result<()> {
        if self.terminated {
            return Err(MuxError::Terminated);
        }
        if channel != PRIMARY {
            return Err(MuxError::UnknownChannel(channel));
        }
        self.close_with(CloseCause::Local);
        Ok(())
    }

    fn write(&mut self, channel: u8, data: &[u8]) -> Result<()> {
        self.check_usable()?;
        if channel != PRIMARY || self.state != ChannelState::Open {
            return Err(MuxError::ChannelNotOpen(channel));
        }
        if !data.is_empty() {
            self.transmit.push_back(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    fn read(&mut self, channel: u8) -> Option<Bytes> {
        if channel != PRIMARY || self.inbound.is_empty() {
            return None;
        }
        Some(self.inbound.split().freeze())
    }

    fn state(&self, channel: u8) -> ChannelState {
        if channel == PRIMARY {
            self.state
        } else {
            ChannelState::Closed
        }
    }

    fn set_signals(&mut self, channel: u8, _signals: ModemSignals) -> Result<()> {
        self.check_usable()?;
        if channel != PRIMARY {
            return Err(MuxError::UnknownChannel(channel));
        }
        // No way to carry signals without framing.
        Ok(())
    }

    fn receive(&mut self, _now: Instant, bytes: &[u8]) {
        if self.state != ChannelState::Open || bytes.is_empty() {
            return;
        }
        let was_empty = self.inbound.is_empty();
        self.inbound.extend_from_slice(bytes);
        if was_empty {
            self.events.push_back(MuxEvent::DataReady { channel: PRIMARY });
        }
    }

    fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmit.pop_front()
    }

    fn poll_timeout(&self) -> Option<Instant> {
        None
    }

    fn handle_timeout(&mut self, _now: Instant) {}

    fn poll_event(&mut self) -> Option<MuxEvent> {
        self.events.pop_front()
    }

    fn link_down(&mut self) {
        if self.link_down || self.terminated {
            return;
        }
        self.link_down = true;
        self.close_with(CloseCause::LinkDown);
        self.transmit.clear();
        self.events.push_back(MuxEvent::LinkDown);
    }

    fn shutdown(&mut self) {
        if self.terminated {
            return;
        }
        self.close_with(CloseCause::Terminated);
        self.terminated = true;
        self.events.push_back(MuxEvent::Terminated);
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(mux: &mut PassthroughMultiplexer) -> Vec<MuxEvent> {
        std::iter::from_fn(|| mux.poll_event()).collect()
    }

    #[test]
    fn any_name_opens_the_single_channel() {
        let now = Instant::now();
        let mut mux = PassthroughMultiplexer::new();
        assert_eq!(mux.open("primary", now).unwrap(), PRIMARY);
        assert_eq!(mux.open("aux", now).unwrap(), PRIMARY);
        assert_eq!(mux.state(PRIMARY), ChannelState::Open);
        assert_eq!(
            events(&mut mux),
            vec![MuxEvent::ChannelOpened {
                channel: PRIMARY,
                remote: false
            }]
        );
        assert_eq!(mux.poll_timeout(), None);
    }

    #[test]
    fn bytes_pass_through_unframed() {
        let now = Instant::now();
        let mut mux = PassthroughMultiplexer::new();
        mux.open("primary", now).unwrap();
        events(&mut mux);

        mux.write(PRIMARY, b"AT\r").unwrap();
        assert_eq!(mux.poll_transmit().unwrap().as_ref(), b"AT\r");

        mux.receive(now, b"\r\nOK\r\n");
        assert_eq!(events(&mut mux), vec![MuxEvent::DataReady { channel: PRIMARY }]);
        assert_eq!(mux.read(PRIMARY).unwrap().as_ref(), b"\r\nOK\r\n");
    }

    #[test]
    fn closed_channel_drops_input() {
        let now = Instant::now();
        let mut mux = PassthroughMultiplexer::new();
        mux.receive(now, b"RING\r\n");
        assert!(mux.read(PRIMARY).is_none());
        assert!(matches!(
            mux.write(PRIMARY, b"AT\r"),
            Err(MuxError::ChannelNotOpen(PRIMARY))
        ));
    }

    #[test]
    fn link_down_and_shutdown() {
        let now = Instant::now();
        let mut mux = PassthroughMultiplexer::new();
        mux.open("primary", now).unwrap();
        events(&mut mux);

        mux.link_down();
        assert_eq!(
            events(&mut mux),
            vec![
                MuxEvent::ChannelClosed {
                    channel: PRIMARY,
                    cause: CloseCause::LinkDown
                },
                MuxEvent::LinkDown,
            ]
        );
        assert!(matches!(mux.open("primary", now), Err(MuxError::LinkDown)));

        mux.shutdown();
        assert_eq!(events(&mut mux), vec![MuxEvent::Terminated]);
        assert!(mux.is_terminated());
    }
}

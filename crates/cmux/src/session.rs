//! The reactive loop tying a physical stream, a multiplexer and one chat
//! engine per open channel together.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use cmux_chat::{
    ChatConfig, ChatEngine, ChatEvent, Command, CommandId, CommandResult, Notification,
    NotificationFilter, NotificationId, ResultCode, RetryChat, RetryPolicy,
};
use cmux_frame::channel::is_logical;
use cmux_frame::writer::write_all;
use cmux_frame::{FrameError, HealthChange, LinkHealth, ModemSignals};
use cmux_mux::{
    ChannelState, CloseCause, MultiplexerRegistry, MuxConfig, MuxError, MuxEvent, OpenFailure,
    SerialMultiplexer,
};
use cmux_transport::SerialStream;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

const READ_CHUNK: usize = 4096;
const PROBE_READ_TIMEOUT: Duration = Duration::from_millis(100);
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Configuration for a [`Session`].
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub mux: MuxConfig,
    /// Applied to the chat engine of every channel that opens.
    pub chat: ChatConfig,
    /// Use this registered variant without probing the device.
    pub variant: Option<String>,
}

/// Identifies a command submitted with [`Session::submit_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RetryId(pub u64);

impl fmt::Display for RetryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retry#{}", self.0)
    }
}

/// Everything a session reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Response {
        channel: u8,
        id: CommandId,
        result: CommandResult,
    },
    Notification {
        channel: u8,
        notification: Notification,
    },
    CallNotification {
        channel: u8,
        line: String,
    },
    ChannelOpened {
        channel: u8,
        remote: bool,
    },
    ChannelClosed {
        channel: u8,
        cause: CloseCause,
    },
    ChannelOpenFailed {
        channel: u8,
        reason: OpenFailure,
    },
    ModemStatus {
        channel: u8,
        signals: ModemSignals,
    },
    LinkHealth(HealthChange),
    /// The modem stopped answering on this channel.
    DeviceDead {
        channel: u8,
    },
    LinkDown,
    /// A retried command reached its final result.
    RetryFinished {
        channel: u8,
        id: RetryId,
        result: CommandResult,
    },
    Terminated,
}

/// One modem, driven from a single thread.
///
/// Every method that produces output flushes it to the stream before
/// returning, so the session is the only writer. Call
/// [`run_once`](Self::run_once) in a loop and drain
/// [`poll_event`](Self::poll_event) after each call.
pub struct Session {
    stream: SerialStream,
    mux: Box<dyn SerialMultiplexer>,
    chats: BTreeMap<u8, ChatEngine>,
    retries: BTreeMap<RetryId, (u8, RetryChat)>,
    next_retry: u64,
    events: VecDeque<SessionEvent>,
    config: SessionConfig,
    open_failure: Option<(u8, OpenFailure)>,
    read_buf: Vec<u8>,
    read_timeout: Option<Duration>,
    link_down: bool,
}

impl Session {
    /// Pick a multiplexer (probing unless `config.variant` names one) and
    /// start it.
    pub fn establish(
        mut stream: SerialStream,
        registry: &MultiplexerRegistry,
        config: SessionConfig,
    ) -> Result<Self> {
        let mut read_timeout = None;
        let mux = match &config.variant {
            Some(name) => registry.create(name, &config.mux)?,
            None => {
                stream.set_read_timeout(Some(PROBE_READ_TIMEOUT))?;
                read_timeout = Some(PROBE_READ_TIMEOUT);
                registry.select(&mut stream, &config.mux)?
            }
        };
        info!(
            variant = mux.name(),
            transport = stream.transport_name(),
            "session established"
        );

        let mut session = Self {
            stream,
            mux,
            chats: BTreeMap::new(),
            retries: BTreeMap::new(),
            next_retry: 1,
            events: VecDeque::new(),
            config,
            open_failure: None,
            read_buf: vec![0; READ_CHUNK],
            read_timeout,
            link_down: false,
        };
        let now = Instant::now();
        session.mux.start(now);
        session.pump(now);
        session.flush()?;
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Name of the selected multiplexer variant.
    pub fn variant(&self) -> &'static str {
        self.mux.name()
    }

    pub fn channel_state(&self, channel: u8) -> ChannelState {
        self.mux.state(channel)
    }

    pub fn link_health(&self) -> Option<&LinkHealth> {
        self.mux.link_health()
    }

    pub fn is_link_down(&self) -> bool {
        self.link_down
    }

    pub fn chat(&self, channel: u8) -> Option<&ChatEngine> {
        self.chats.get(&channel)
    }

    /// Direct access to a channel's engine. Output it produces goes out on
    /// the next [`run_once`](Self::run_once).
    pub fn chat_mut(&mut self, channel: u8) -> Option<&mut ChatEngine> {
        self.chats.get_mut(&channel)
    }

    /// Open a channel by name (`primary`, `data`, ... or a DLCI) and wait
    /// until it is usable.
    pub fn open_channel(&mut self, name: &str) -> Result<u8> {
        let now = Instant::now();
        let channel = self.mux.open(name, now)?;
        self.open_failure = None;
        self.pump(now);
        self.flush()?;

        let limit = self.config.mux.ack_timeout * (self.config.mux.max_attempts.max(1) + 1);
        let deadline = now + limit;
        loop {
            if self.mux.state(channel) == ChannelState::Open && self.chats.contains_key(&channel) {
                return Ok(channel);
            }
            if let Some(err) = self.open_error(channel) {
                return Err(err.into());
            }
            if self.mux.is_terminated() {
                return Err(MuxError::Terminated.into());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(limit));
            }
            if let Err(err) = self.run_once(Some(deadline - now)) {
                // A dropped link fails the open; report it as such.
                return Err(self.open_error(channel).map_or(err, Into::into));
            }
        }
    }

    fn open_error(&self, channel: u8) -> Option<MuxError> {
        match self.open_failure {
            Some((failed, reason)) if failed == channel => Some(match reason {
                OpenFailure::Timeout => MuxError::ChannelOpenTimeout(channel),
                OpenFailure::Refused => MuxError::OpenRefused(channel),
                OpenFailure::LinkDown => MuxError::LinkDown,
            }),
            _ => None,
        }
    }

    /// Start closing a channel; completion is reported as
    /// [`SessionEvent::ChannelClosed`].
    ///
    /// Commands queued on the channel fail with `ChannelClosed` right away,
    /// without waiting for the modem to acknowledge.
    pub fn close_channel(&mut self, channel: u8) -> Result<()> {
        let now = Instant::now();
        self.mux.close(channel, now)?;
        self.end_chat(now, channel, false);
        self.pump(now);
        self.flush()
    }

    /// Queue a command on a channel.
    pub fn submit(&mut self, channel: u8, command: Command) -> Result<CommandId> {
        let now = Instant::now();
        let chat = self.chats.get_mut(&channel).ok_or(Error::NoChat(channel))?;
        let id = chat.submit(now, command)?;
        self.pump(now);
        self.flush()?;
        Ok(id)
    }

    /// Queue a command that is retried per `policy`. Its final result
    /// arrives as [`SessionEvent::RetryFinished`]; individual attempts are
    /// not reported.
    pub fn submit_with_retry(
        &mut self,
        channel: u8,
        command: Command,
        policy: RetryPolicy,
    ) -> Result<RetryId> {
        let now = Instant::now();
        let chat = self.chats.get_mut(&channel).ok_or(Error::NoChat(channel))?;
        let mut retry = RetryChat::new(command, policy);
        retry.start(chat, now)?;

        let id = RetryId(self.next_retry);
        self.next_retry += 1;
        debug!(%id, channel, "retrying command");
        self.retries.insert(id, (channel, retry));
        self.pump(now);
        self.flush()?;
        Ok(id)
    }

    /// A retried command still held by the session.
    pub fn retry(&self, id: RetryId) -> Option<&RetryChat> {
        self.retries.get(&id).map(|(_, retry)| retry)
    }

    /// Drop a retried command kept because its policy does not release it.
    pub fn release_retry(&mut self, id: RetryId) -> bool {
        self.retries.remove(&id).is_some()
    }

    /// Submit and run the loop until the command's result arrives. Other
    /// events stay queued.
    pub fn execute(&mut self, channel: u8, command: Command) -> Result<CommandResult> {
        let id = self.submit(channel, command)?;
        loop {
            let position = self.events.iter().position(|event| {
                matches!(event, SessionEvent::Response { channel: c, id: i, .. } if *c == channel && *i == id)
            });
            if let Some(SessionEvent::Response { result, .. }) =
                position.and_then(|p| self.events.remove(p))
            {
                return Ok(result);
            }
            self.run_once(None)?;
        }
    }

    pub fn register_notification(
        &mut self,
        channel: u8,
        filter: NotificationFilter,
    ) -> Result<NotificationId> {
        let chat = self.chats.get_mut(&channel).ok_or(Error::NoChat(channel))?;
        Ok(chat.register_notification(filter)?)
    }

    pub fn unregister_notification(&mut self, channel: u8, id: NotificationId) -> bool {
        self.chats
            .get_mut(&channel)
            .is_some_and(|chat| chat.unregister_notification(id))
    }

    /// Hold a channel's command queue; input keeps buffering.
    pub fn suspend(&mut self, channel: u8) -> Result<()> {
        let chat = self.chats.get_mut(&channel).ok_or(Error::NoChat(channel))?;
        chat.suspend();
        Ok(())
    }

    pub fn resume(&mut self, channel: u8) -> Result<()> {
        let now = Instant::now();
        let chat = self.chats.get_mut(&channel).ok_or(Error::NoChat(channel))?;
        chat.resume(now);
        self.pump(now);
        self.flush()
    }

    /// Advertise new V.24 signals on a channel.
    pub fn set_signals(&mut self, channel: u8, signals: ModemSignals) -> Result<()> {
        self.mux.set_signals(channel, signals)?;
        self.pump(Instant::now());
        self.flush()
    }

    /// Earliest timer across the multiplexer, chats and retries.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let chats = self.chats.values().filter_map(ChatEngine::poll_timeout);
        let retries = self.retries.values().filter_map(|(_, r)| r.poll_timeout());
        self.mux
            .poll_timeout()
            .into_iter()
            .chain(chats)
            .chain(retries)
            .min()
    }

    /// One turn of the loop: flush, wait for input until the next timer or
    /// `max_wait` (forever when both are absent), feed input, fire timers.
    pub fn run_once(&mut self, max_wait: Option<Duration>) -> Result<()> {
        if self.link_down {
            return Err(Error::LinkDown);
        }
        let now = Instant::now();
        self.pump(now);
        self.flush()?;

        let wait = match (self.poll_timeout(), max_wait) {
            (Some(deadline), max) => {
                let until = deadline.saturating_duration_since(now);
                Some(max.map_or(until, |m| m.min(until)))
            }
            (None, max) => max,
        };
        self.set_read_timeout(wait.map(|w| w.max(MIN_WAIT)))?;

        match self.stream.read(&mut self.read_buf) {
            Ok(0) => {
                warn!("modem closed the stream");
                self.lose_link();
                return Err(Error::LinkDown);
            }
            Ok(n) => {
                trace!(len = n, "read");
                self.mux.receive(Instant::now(), &self.read_buf[..n]);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                warn!(error = %err, "read failed");
                self.lose_link();
                return Err(err.into());
            }
        }

        let now = Instant::now();
        self.fire_timers(now);
        self.pump(now);
        self.flush()
    }

    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Close every channel, flush the teardown and hand the stream back.
    pub fn shutdown(mut self) -> Result<SerialStream> {
        if !self.link_down {
            info!(variant = self.mux.name(), "shutting down session");
            self.mux.shutdown();
            self.pump(Instant::now());
            self.flush()?;
        }
        Ok(self.stream)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.read_timeout != timeout {
            self.stream.set_read_timeout(timeout)?;
            self.read_timeout = timeout;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.link_down {
            return Err(Error::LinkDown);
        }
        while let Some(bytes) = self.mux.poll_transmit() {
            trace!(len = bytes.len(), "write");
            let written = write_all(&mut self.stream, &bytes)
                .and_then(|()| self.stream.flush().map_err(FrameError::Io));
            if let Err(err) = written {
                warn!(error = %err, "write failed");
                self.lose_link();
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn lose_link(&mut self) {
        if self.link_down {
            return;
        }
        self.link_down = true;
        self.mux.link_down();
        self.pump(Instant::now());
    }

    fn fire_timers(&mut self, now: Instant) {
        if self.mux.poll_timeout().is_some_and(|t| t <= now) {
            self.mux.handle_timeout(now);
        }
        for chat in self.chats.values_mut() {
            if chat.poll_timeout().is_some_and(|t| t <= now) {
                chat.handle_timeout(now);
            }
        }
        for (channel, retry) in self.retries.values_mut() {
            if !retry.poll_timeout().is_some_and(|t| t <= now) {
                continue;
            }
            let channel = *channel;
            match self.chats.get_mut(&channel) {
                Some(chat) => retry.handle_timeout(chat, now),
                None => retry.cancel(ResultCode::ChannelClosed),
            }
        }
        self.settle_retries();
    }

    /// Move events and output between the layers until nothing changes.
    fn pump(&mut self, now: Instant) {
        loop {
            let mut progressed = false;
            while let Some(event) = self.mux.poll_event() {
                progressed = true;
                self.on_mux_event(now, event);
            }
            let channels: Vec<u8> = self.chats.keys().copied().collect();
            for channel in channels {
                progressed |= self.drain_chat(now, channel);
            }
            if !progressed {
                break;
            }
        }
    }

    fn on_mux_event(&mut self, now: Instant, event: MuxEvent) {
        match event {
            MuxEvent::ChannelOpened { channel, remote } => {
                if is_logical(channel) {
                    debug!(channel, remote, "channel open; starting chat");
                    self.chats
                        .entry(channel)
                        .or_insert_with(|| ChatEngine::new(self.config.chat.clone()));
                }
                self.events
                    .push_back(SessionEvent::ChannelOpened { channel, remote });
            }
            MuxEvent::ChannelOpenFailed { channel, reason } => {
                self.open_failure = Some((channel, reason));
                self.events
                    .push_back(SessionEvent::ChannelOpenFailed { channel, reason });
            }
            MuxEvent::ChannelClosed { channel, cause } => {
                self.end_chat(now, channel, cause == CloseCause::LinkDown);
                self.events
                    .push_back(SessionEvent::ChannelClosed { channel, cause });
            }
            MuxEvent::DataReady { channel } => {
                let Some(data) = self.mux.read(channel) else {
                    return;
                };
                match self.chats.get_mut(&channel) {
                    Some(chat) => chat.receive(now, &data),
                    None => trace!(channel, len = data.len(), "no chat; dropping data"),
                }
            }
            MuxEvent::ModemStatus { channel, signals } => {
                self.events
                    .push_back(SessionEvent::ModemStatus { channel, signals });
            }
            MuxEvent::LinkHealth(change) => {
                self.events.push_back(SessionEvent::LinkHealth(change));
            }
            MuxEvent::LinkDown => {
                self.link_down = true;
                let channels: Vec<u8> = self.chats.keys().copied().collect();
                for channel in channels {
                    self.end_chat(now, channel, true);
                }
                self.events.push_back(SessionEvent::LinkDown);
            }
            MuxEvent::Terminated => {
                let channels: Vec<u8> = self.chats.keys().copied().collect();
                for channel in channels {
                    self.end_chat(now, channel, false);
                }
                self.events.push_back(SessionEvent::Terminated);
            }
        }
    }

    fn end_chat(&mut self, now: Instant, channel: u8, link_lost: bool) {
        if let Some(chat) = self.chats.get_mut(&channel) {
            if link_lost {
                chat.link_down();
            } else {
                chat.channel_closed();
            }
            self.drain_chat(now, channel);
            self.chats.remove(&channel);
        }
        let code = if link_lost {
            ResultCode::LinkDown
        } else {
            ResultCode::ChannelClosed
        };
        for (owner, retry) in self.retries.values_mut() {
            if *owner == channel {
                retry.cancel(code);
            }
        }
        self.settle_retries();
    }

    fn drain_chat(&mut self, now: Instant, channel: u8) -> bool {
        let Some(chat) = self.chats.get_mut(&channel) else {
            return false;
        };
        let mut progressed = false;

        while let Some(event) = chat.poll_event() {
            progressed = true;
            match event {
                ChatEvent::Response { id, result } => {
                    let owner = self
                        .retries
                        .values_mut()
                        .find(|(owner, retry)| *owner == channel && retry.current() == Some(id));
                    match owner {
                        Some((_, retry)) => {
                            retry.on_response(chat, id, &result, now);
                        }
                        None => self.events.push_back(SessionEvent::Response {
                            channel,
                            id,
                            result,
                        }),
                    }
                }
                ChatEvent::Notification(notification) => {
                    self.events.push_back(SessionEvent::Notification {
                        channel,
                        notification,
                    });
                }
                ChatEvent::CallNotification { line } => {
                    self.events
                        .push_back(SessionEvent::CallNotification { channel, line });
                }
                ChatEvent::DeviceDead => {
                    warn!(channel, "device dead");
                    self.events.push_back(SessionEvent::DeviceDead { channel });
                }
            }
        }

        while let Some(bytes) = chat.poll_transmit() {
            progressed = true;
            if let Err(err) = self.mux.write(channel, &bytes) {
                warn!(channel, error = %err, "dropping chat output");
            }
        }

        self.settle_retries();
        progressed
    }

    fn settle_retries(&mut self) {
        let mut released = Vec::new();
        for (&id, (channel, retry)) in self.retries.iter_mut() {
            if !retry.is_finished() {
                continue;
            }
            if let Some(result) = retry.take_result() {
                self.events.push_back(SessionEvent::RetryFinished {
                    channel: *channel,
                    id,
                    result,
                });
            }
            if retry.release_on_done() {
                released.push(id);
            }
        }
        for id in released {
            self.retries.remove(&id);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("variant", &self.mux.name())
            .field("transport", &self.stream.transport_name())
            .field("channels", &self.chats.keys().collect::<Vec<_>>())
            .field("retries", &self.retries.len())
            .field("link_down", &self.link_down)
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::net::UnixStream;
    use std::thread;

    use bytes::{Bytes, BytesMut};
    use cmux_frame::{encode_frame, Frame, FrameReader, FrameType, FramingMode, CONTROL};

    use super::*;

    fn passthrough() -> SessionConfig {
        SessionConfig {
            variant: Some("passthrough".into()),
            ..SessionConfig::default()
        }
    }

    fn read_line(stream: &mut UnixStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while stream.read(&mut byte).unwrap() == 1 {
            if byte[0] == b'\r' {
                break;
            }
            line.push(byte[0]);
        }
        String::from_utf8(line).unwrap()
    }

    enum Answer {
        Send(Frame),
        Ignore,
        HangUp,
    }

    fn ua(frame: &Frame) -> Answer {
        Answer::Send(Frame::new(frame.channel, FrameType::Ua, Bytes::new()))
    }

    /// A modem that accepts `AT+CMUX` and then answers each frame through
    /// `answer`. Returns the `AT+CMUX` line and the payloads seen on
    /// logical channels.
    fn multiplexing_modem<F>(
        mut modem: UnixStream,
        mut answer: F,
    ) -> thread::JoinHandle<(String, Vec<Bytes>)>
    where
        F: FnMut(&Frame) -> Answer + Send + 'static,
    {
        thread::spawn(move || {
            let cmux = read_line(&mut modem);
            modem.write_all(b"\r\nOK\r\n").unwrap();

            let mut reader = FrameReader::new(modem.try_clone().unwrap());
            let mut payloads = Vec::new();
            while let Ok(frame) = reader.read_frame() {
                if frame.frame_type == FrameType::Uih && frame.channel != CONTROL {
                    payloads.push(frame.payload.clone());
                }
                match answer(&frame) {
                    Answer::Send(reply) => {
                        let mut wire = BytesMut::new();
                        encode_frame(FramingMode::Basic, &reply, &mut wire).unwrap();
                        if modem.write_all(&wire).is_err() {
                            break;
                        }
                    }
                    Answer::Ignore => {}
                    Answer::HangUp => break,
                }
            }
            (cmux, payloads)
        })
    }

    fn gsm0710(host: UnixStream) -> Session {
        let config = SessionConfig {
            mux: MuxConfig {
                ack_timeout: Duration::from_millis(100),
                ..MuxConfig::default()
            },
            ..SessionConfig::default()
        };
        let registry = MultiplexerRegistry::with_defaults();
        let session =
            Session::establish(SerialStream::from_unix(host), &registry, config).unwrap();
        assert_eq!(session.variant(), "gsm0710");
        session
    }

    fn run_until<F>(session: &mut Session, mut found: F) -> Vec<SessionEvent>
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        loop {
            while let Some(event) = session.poll_event() {
                let done = found(&event);
                seen.push(event);
                if done {
                    return seen;
                }
            }
            assert!(Instant::now() < deadline, "no matching event in {seen:?}");
            session.run_once(Some(Duration::from_millis(50))).unwrap();
        }
    }

    #[test]
    fn passthrough_command_exchange() {
        let (host, mut modem) = UnixStream::pair().unwrap();
        let fake = thread::spawn(move || {
            let line = read_line(&mut modem);
            modem.write_all(b"\r\n+CSQ: 20,99\r\n\r\nOK\r\n").unwrap();
            line
        });

        let registry = MultiplexerRegistry::with_defaults();
        let mut session =
            Session::establish(SerialStream::from_unix(host), &registry, passthrough()).unwrap();
        assert_eq!(session.variant(), "passthrough");
        let channel = session.open_channel("primary").unwrap();
        assert_eq!(channel, 1);

        let result = session.execute(channel, Command::new("AT+CSQ")).unwrap();
        assert!(result.ok());
        assert_eq!(result.lines, vec!["+CSQ: 20,99"]);
        assert_eq!(fake.join().unwrap(), "AT+CSQ");
        assert_eq!(
            session.poll_event(),
            Some(SessionEvent::ChannelOpened {
                channel: 1,
                remote: false
            })
        );
    }

    #[test]
    fn notification_without_command() {
        let (host, mut modem) = UnixStream::pair().unwrap();
        let registry = MultiplexerRegistry::with_defaults();
        let mut session =
            Session::establish(SerialStream::from_unix(host), &registry, passthrough()).unwrap();
        let channel = session.open_channel("primary").unwrap();
        let id = session
            .register_notification(channel, NotificationFilter::new("+CREG:"))
            .unwrap();

        modem.write_all(b"\r\n+CREG: 5\r\n").unwrap();
        let events = run_until(&mut session, |e| {
            matches!(e, SessionEvent::Notification { .. })
        });
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Notification { channel: 1, notification })
                if notification.id == id && notification.line == "+CREG: 5"
        ));
        assert!(session.unregister_notification(channel, id));
    }

    #[test]
    fn retry_reports_final_result_only() {
        let (host, mut modem) = UnixStream::pair().unwrap();
        let fake = thread::spawn(move || {
            read_line(&mut modem);
            modem.write_all(b"\r\n+CME ERROR: 14\r\n").unwrap();
            read_line(&mut modem);
            modem.write_all(b"\r\nOK\r\n").unwrap();
        });

        let registry = MultiplexerRegistry::with_defaults();
        let mut session =
            Session::establish(SerialStream::from_unix(host), &registry, passthrough()).unwrap();
        let channel = session.open_channel("primary").unwrap();
        let id = session
            .submit_with_retry(
                channel,
                Command::new("AT+CPIN?"),
                RetryPolicy {
                    interval: Duration::from_millis(10),
                    ..RetryPolicy::default()
                },
            )
            .unwrap();

        let events = run_until(&mut session, |e| {
            matches!(e, SessionEvent::RetryFinished { .. })
        });
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::Response { .. })));
        assert!(matches!(
            events.last(),
            Some(SessionEvent::RetryFinished { id: done, result, .. })
                if *done == id && result.ok()
        ));
        assert!(session.retry(id).is_none());
        fake.join().unwrap();
    }

    #[test]
    fn link_loss_fails_outstanding_commands() {
        let (host, modem) = UnixStream::pair().unwrap();
        let registry = MultiplexerRegistry::with_defaults();
        let mut session =
            Session::establish(SerialStream::from_unix(host), &registry, passthrough()).unwrap();
        let channel = session.open_channel("primary").unwrap();
        let id = session.submit(channel, Command::new("AT+CFUN=1")).unwrap();
        drop(modem);

        // EOF or a reset, depending on what the peer left unread.
        assert!(session.run_once(Some(Duration::from_secs(1))).is_err());
        assert!(matches!(
            session.run_once(Some(Duration::from_secs(1))),
            Err(Error::LinkDown)
        ));
        let events: Vec<_> = std::iter::from_fn(|| session.poll_event()).collect();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Response { id: i, result, .. }
                if *i == id && result.code == ResultCode::LinkDown
        )));
        assert!(events.contains(&SessionEvent::LinkDown));
        assert!(session.is_link_down());
        assert!(matches!(session.submit(channel, Command::new("AT")), Err(Error::NoChat(1))));
    }

    #[test]
    fn closing_channel_fails_queue() {
        let (host, _modem) = UnixStream::pair().unwrap();
        let registry = MultiplexerRegistry::with_defaults();
        let mut session =
            Session::establish(SerialStream::from_unix(host), &registry, passthrough()).unwrap();
        let channel = session.open_channel("primary").unwrap();
        session.submit(channel, Command::new("AT+COPS=?")).unwrap();
        session.close_channel(channel).unwrap();

        let events: Vec<_> = std::iter::from_fn(|| session.poll_event()).collect();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Response { result, .. } if result.code == ResultCode::ChannelClosed
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::ChannelClosed { channel: 1, cause: CloseCause::Local }
        )));
        assert!(session.chat(channel).is_none());
    }

    #[test]
    fn gsm0710_detected_and_used() {
        let (host, modem) = UnixStream::pair().unwrap();
        let fake = multiplexing_modem(modem, |frame| match frame.frame_type {
            FrameType::Sabm | FrameType::Disc => ua(frame),
            FrameType::Uih if frame.channel == 1 => Answer::Send(
                Frame::new(1, FrameType::Uih, Bytes::from_static(b"\r\nOK\r\n")).with_cr(false),
            ),
            _ => Answer::Ignore,
        });

        let mut session = gsm0710(host);
        let channel = session.open_channel("primary").unwrap();
        let result = session.execute(channel, Command::new("AT")).unwrap();
        assert!(result.ok());
        assert!(session.link_health().is_some());

        drop(session.shutdown().unwrap());
        let (cmux, payloads) = fake.join().unwrap();
        assert_eq!(cmux, "AT+CMUX=0,0,5,31");
        assert_eq!(payloads[0].as_ref(), b"AT\r");
    }

    #[test]
    fn closing_gsm0710_channel_fails_command_at_once() {
        let (host, modem) = UnixStream::pair().unwrap();
        // Never acknowledges DISC and never answers commands.
        let fake = multiplexing_modem(modem, |frame| match frame.frame_type {
            FrameType::Sabm => ua(frame),
            _ => Answer::Ignore,
        });

        let mut session = gsm0710(host);
        let channel = session.open_channel("primary").unwrap();
        let id = session.submit(channel, Command::new("AT+COPS=?")).unwrap();
        session.close_channel(channel).unwrap();

        let events: Vec<_> = std::iter::from_fn(|| session.poll_event()).collect();
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Response { id: i, result, .. }
                if *i == id && result.code == ResultCode::ChannelClosed
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, SessionEvent::ChannelClosed { .. })));
        assert!(session.chat(channel).is_none());
        assert_eq!(session.channel_state(channel), ChannelState::Closing);
        assert!(matches!(
            session.submit(channel, Command::new("AT")),
            Err(Error::NoChat(1))
        ));

        drop(session);
        let (_, payloads) = fake.join().unwrap();
        assert_eq!(payloads, vec![Bytes::from_static(b"AT+COPS=?\r")]);
    }

    #[test]
    fn refused_open_reports_open_refused() {
        let (host, modem) = UnixStream::pair().unwrap();
        let fake = multiplexing_modem(modem, |frame| match frame.frame_type {
            FrameType::Sabm if frame.channel == CONTROL => ua(frame),
            FrameType::Sabm => {
                Answer::Send(Frame::new(frame.channel, FrameType::Dm, Bytes::new()))
            }
            _ => Answer::Ignore,
        });

        let mut session = gsm0710(host);
        let err = session.open_channel("primary").unwrap_err();
        assert!(matches!(err, Error::Mux(MuxError::OpenRefused(1))), "{err:?}");
        assert!(session.chat(1).is_none());
        assert_eq!(session.channel_state(1), ChannelState::Closed);
        let events: Vec<_> = std::iter::from_fn(|| session.poll_event()).collect();
        assert!(events.contains(&SessionEvent::ChannelOpenFailed {
            channel: 1,
            reason: OpenFailure::Refused
        }));

        drop(session);
        fake.join().unwrap();
    }

    #[test]
    fn link_loss_while_opening_fails_the_open() {
        let (host, modem) = UnixStream::pair().unwrap();
        let fake = multiplexing_modem(modem, |frame| match frame.frame_type {
            FrameType::Sabm if frame.channel == CONTROL => ua(frame),
            _ => Answer::HangUp,
        });

        let mut session = gsm0710(host);
        let err = session.open_channel("primary").unwrap_err();
        assert!(matches!(err, Error::Mux(MuxError::LinkDown)), "{err:?}");
        assert!(session.is_link_down());
        let events: Vec<_> = std::iter::from_fn(|| session.poll_event()).collect();
        assert!(events.contains(&SessionEvent::ChannelOpenFailed {
            channel: 1,
            reason: OpenFailure::LinkDown
        }));
        assert!(events.contains(&SessionEvent::LinkDown));
        fake.join().unwrap();
    }

    #[test]
    fn silent_modem_is_reported_dead() {
        let (host, mut modem) = UnixStream::pair().unwrap();
        let registry = MultiplexerRegistry::with_defaults();
        let config = SessionConfig {
            chat: ChatConfig {
                dead_timeout: Some(Duration::from_millis(100)),
                echo_retry: None,
                ..ChatConfig::default()
            },
            ..passthrough()
        };
        let mut session =
            Session::establish(SerialStream::from_unix(host), &registry, config).unwrap();
        let channel = session.open_channel("primary").unwrap();
        let id = session.submit(channel, Command::new("AT+CFUN=1")).unwrap();
        assert_eq!(read_line(&mut modem), "AT+CFUN=1");

        let events = run_until(&mut session, |e| {
            matches!(e, SessionEvent::DeviceDead { .. })
        });
        assert_eq!(events.last(), Some(&SessionEvent::DeviceDead { channel: 1 }));
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Response { channel: 1, id: i, result }
                if *i == id && result.code == ResultCode::Dead
        )));
        assert!(session.chat(channel).is_some_and(ChatEngine::is_dead));
        assert!(!session.is_link_down());
    }
}

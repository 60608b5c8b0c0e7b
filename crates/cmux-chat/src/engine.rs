use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::command::{Command, CommandId, CommandState};
use crate::error::{ChatError, Result};
use crate::matcher::{LineKind, PrefixMatcher};
use crate::pdu;
use crate::result::{CommandResult, ResultCode};

const CTRL_Z: u8 = 0x1A;
const PROMPT: &[u8] = b"> ";
const NUMERIC_RESULTS: &[&str] = &["0", "1", "3", "4", "6", "7", "8"];
const DEFAULT_PDU_PREFIXES: &[&str] = &["+CMT:", "+CDS:", "+CBM:"];

/// Identifies a notification registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId(pub u64);

/// An unsolicited line (and PDU, for `+CMT:`-style notifications).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: NotificationId,
    /// The registered prefix that matched.
    pub prefix: String,
    /// The full notification line, prefix included.
    pub line: String,
    /// Decoded body for PDU notifications. Text-mode bodies are passed raw.
    pub pdu: Option<Bytes>,
}

type NotifyCallback = Box<dyn FnMut(&Notification) + Send>;
type LineCallback = Box<dyn FnOnce(String) + Send>;

/// What to listen for and how to deliver it.
pub struct NotificationFilter {
    prefix: String,
    pdu: bool,
    may_be_command: bool,
    handler: Option<NotifyCallback>,
}

impl NotificationFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            pdu: false,
            may_be_command: false,
            handler: None,
        }
    }

    /// The body arrives on the next line, hex encoded.
    pub fn with_pdu(mut self) -> Self {
        self.pdu = true;
        self
    }

    /// The prefix also answers a query command (`+CREG:` for `AT+CREG?`);
    /// while that command is active the line belongs to its result.
    pub fn may_be_command(mut self) -> Self {
        self.may_be_command = true;
        self
    }

    /// Call `handler` for each match, in addition to the emitted event.
    pub fn on_notify<F>(mut self, handler: F) -> Self
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        self.handler = Some(Box::new(handler));
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl fmt::Debug for NotificationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationFilter")
            .field("prefix", &self.prefix)
            .field("pdu", &self.pdu)
            .field("may_be_command", &self.may_be_command)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

/// Probe sent ahead of commands to modems that doze off.
#[derive(Debug, Clone)]
pub struct WakeupConfig {
    /// The probe command. Default: `AT`.
    pub command: String,
    /// Commands that need waking up. Empty means all commands.
    pub prefixes: Vec<String>,
    /// Only wake up after this long without sending. `None` wakes every time.
    pub idle: Option<Duration>,
    /// Lines received this long after the probe are discarded. Default: 1 s.
    pub settle: Duration,
}

impl Default for WakeupConfig {
    fn default() -> Self {
        Self {
            command: "AT".to_string(),
            prefixes: Vec::new(),
            idle: None,
            settle: Duration::from_secs(1),
        }
    }
}

impl WakeupConfig {
    fn applies_to(&self, line: &str) -> bool {
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| line.starts_with(p.as_str()))
    }
}

/// Configuration for a chat engine.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Declare the device dead after this long without any input while a
    /// command is outstanding. Default: 30 s.
    pub dead_timeout: Option<Duration>,
    /// Resend a command once if nothing comes back this quickly. Default: 1.5 s.
    pub echo_retry: Option<Duration>,
    /// Per-command limit unless the command sets its own. Default: 90 s.
    pub command_timeout: Duration,
    pub wakeup: Option<WakeupConfig>,
    /// Treat bare V.25ter numeric codes (`ATV0` mode) as result lines.
    pub numeric_results: bool,
    /// Longer input lines are truncated.
    pub max_line_length: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            dead_timeout: Some(Duration::from_secs(30)),
            echo_retry: Some(Duration::from_millis(1500)),
            command_timeout: Duration::from_secs(90),
            wakeup: None,
            numeric_results: false,
            max_line_length: 4096,
        }
    }
}

/// Upward notifications from a chat engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    /// A command finished.
    Response { id: CommandId, result: CommandResult },
    /// A registered notification arrived.
    Notification(Notification),
    /// `CONNECT`, `NO CARRIER`, `BUSY`... outside a call-control command.
    CallNotification { line: String },
    /// Nothing arrived within the dead timeout; the engine stays dead.
    DeviceDead,
}

struct Entry {
    id: CommandId,
    command: Command,
    state: CommandState,
    lines: Vec<String>,
    echo_retried: bool,
    woken: bool,
    aborted: bool,
}

impl Entry {
    fn new(id: CommandId, command: Command) -> Self {
        Self {
            id,
            command,
            state: CommandState::Queued,
            lines: Vec::new(),
            echo_retried: false,
            woken: false,
            aborted: false,
        }
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state,
            CommandState::Sent | CommandState::AwaitingResponse
        )
    }
}

/// AT command exchange over one channel.
///
/// Commands run strictly one at a time in submission order. Input is fed
/// with [`receive`](Self::receive); output is taken with
/// [`poll_transmit`](Self::poll_transmit). Results and notifications come
/// out of [`poll_event`](Self::poll_event), after any callbacks have run.
pub struct ChatEngine {
    config: ChatConfig,
    matcher: PrefixMatcher,
    filters: BTreeMap<NotificationId, NotificationFilter>,
    queue: VecDeque<Entry>,
    next_command: u64,
    next_notification: u64,
    rx: BytesMut,
    line: Vec<u8>,
    pending_pdu: Option<(NotificationId, String, String)>,
    line_request: Option<LineCallback>,
    transmit: VecDeque<Bytes>,
    events: VecDeque<ChatEvent>,
    dead_deadline: Option<Instant>,
    echo_deadline: Option<Instant>,
    command_deadline: Option<Instant>,
    settle_deadline: Option<Instant>,
    last_send: Option<Instant>,
    suspended: bool,
    dead: bool,
    closed: Option<ResultCode>,
}

impl ChatEngine {
    pub fn new(config: ChatConfig) -> Self {
        let mut engine = Self {
            config,
            matcher: PrefixMatcher::with_defaults(),
            filters: BTreeMap::new(),
            queue: VecDeque::new(),
            next_command: 1,
            next_notification: 1,
            rx: BytesMut::new(),
            line: Vec::new(),
            pending_pdu: None,
            line_request: None,
            transmit: VecDeque::new(),
            events: VecDeque::new(),
            dead_deadline: None,
            echo_deadline: None,
            command_deadline: None,
            settle_deadline: None,
            last_send: None,
            suspended: false,
            dead: false,
            closed: None,
        };
        for prefix in DEFAULT_PDU_PREFIXES {
            engine.insert_filter(NotificationFilter::new(*prefix).with_pdu());
        }
        engine
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Queue a command. The result arrives as [`ChatEvent::Response`] with
    /// the returned id; a dead or closed engine answers at once.
    pub fn submit(&mut self, now: Instant, command: Command) -> Result<CommandId> {
        command.validate()?;
        let id = CommandId(self.next_command);
        self.next_command += 1;

        if let Some(code) = self.failure_code() {
            debug!(id = %id, command = %command.line(), code = %code, "rejecting command");
            let result = CommandResult::failed(command.line().to_string(), Vec::new(), code);
            self.deliver(id, command, result);
            return Ok(id);
        }

        debug!(id = %id, command = %command.line(), queued = self.queue.len(), "queueing command");
        self.queue.push_back(Entry::new(id, command));
        self.prime(now);
        Ok(id)
    }

    /// Watch for lines starting with the filter's prefix.
    pub fn register_notification(&mut self, filter: NotificationFilter) -> Result<NotificationId> {
        if filter.prefix.is_empty() {
            return Err(ChatError::EmptyPrefix);
        }
        Ok(self.insert_filter(filter))
    }

    pub fn unregister_notification(&mut self, id: NotificationId) -> bool {
        self.matcher.remove_notification(id);
        self.filters.remove(&id).is_some()
    }

    /// Lines starting with `prefix` end the active command as an error.
    pub fn register_error_prefix(&mut self, prefix: &str) {
        self.matcher.add(prefix, LineKind::Terminator);
    }

    /// Lines starting with `prefix` end the active command successfully
    /// (for modems that answer `AT+CPIN?` without `OK`).
    pub fn register_fuzzy_terminator(&mut self, prefix: &str) {
        self.matcher.add(prefix, LineKind::FuzzyTerminator);
    }

    /// Hand the next unclassified line to `callback` instead of the active command.
    pub fn request_next_line<F>(&mut self, callback: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        self.line_request = Some(Box::new(callback));
    }

    /// Write a line now, ahead of anything queued.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        if line.contains(['\r', '\n']) {
            return Err(ChatError::InvalidCommand(line.to_string()));
        }
        self.write_line(line);
        Ok(())
    }

    /// Abort an active `ATD` by sending an empty line. The dial's result
    /// will not count as ok.
    pub fn abort_dial(&mut self) -> bool {
        let Some(entry) = self.queue.front_mut() else {
            return false;
        };
        if !entry.is_active() || !entry.command.is_dial() {
            return false;
        }
        entry.aborted = true;
        debug!(id = %entry.id, "aborting dial");
        self.write_line("");
        true
    }

    /// Stop sending; input keeps buffering without being processed.
    pub fn suspend(&mut self) {
        if !self.suspended {
            debug!("chat suspended");
            self.suspended = true;
        }
    }

    /// Process buffered input and carry on with the queue.
    pub fn resume(&mut self, now: Instant) {
        if self.suspended {
            debug!(buffered = self.rx.len(), "chat resumed");
            self.suspended = false;
            self.process_input(now);
            self.prime(now);
        }
    }

    /// Feed bytes received on the channel.
    pub fn receive(&mut self, now: Instant, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        // Any input proves the device alive, even while it sits buffered.
        if self.queue.front().is_some_and(Entry::is_active) {
            if let Some(timeout) = self.config.dead_timeout {
                self.dead_deadline = Some(now + timeout);
            }
        }
        self.rx.extend_from_slice(bytes);
        if self.suspended {
            trace!(buffered = self.rx.len(), "suspended; buffering input");
            return;
        }
        self.process_input(now);
    }

    /// Fail everything because the channel closed; later commands fail at once.
    pub fn channel_closed(&mut self) {
        self.close(ResultCode::ChannelClosed);
    }

    /// Fail everything because the physical link went away.
    pub fn link_down(&mut self) {
        self.close(ResultCode::LinkDown);
    }

    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmit.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<ChatEvent> {
        self.events.pop_front()
    }

    /// Earliest pending timer.
    pub fn poll_timeout(&self) -> Option<Instant> {
        [
            self.dead_deadline,
            self.echo_deadline,
            self.command_deadline,
            self.settle_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        if self.settle_deadline.is_some_and(|d| d <= now) {
            self.settle_deadline = None;
            debug!("wakeup settled");
            self.prime(now);
        }

        if self.dead_deadline.is_some_and(|d| d <= now) {
            self.go_dead();
            return;
        }

        if self.command_deadline.is_some_and(|d| d <= now) {
            warn!(
                command = self.queue.front().map(|e| e.command.line()),
                "command timed out"
            );
            self.fail_head(now, ResultCode::Timeout);
        }

        if self.echo_deadline.is_some_and(|d| d <= now) {
            self.echo_deadline = None;
            let retry = self.queue.front_mut().and_then(|entry| {
                (entry.state == CommandState::Sent && !entry.echo_retried).then(|| {
                    entry.echo_retried = true;
                    entry.command.line().to_string()
                })
            });
            if let Some(line) = retry {
                debug!(command = %line, "no echo; resending");
                self.write_line(&line);
            }
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Commands waiting or in flight.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Id and state of the command at the head of the queue.
    pub fn active_command(&self) -> Option<(CommandId, CommandState)> {
        self.queue.front().map(|e| (e.id, e.state))
    }

    fn insert_filter(&mut self, filter: NotificationFilter) -> NotificationId {
        let id = NotificationId(self.next_notification);
        self.next_notification += 1;
        self.filters.retain(|_, existing| existing.prefix != filter.prefix);
        let kind = if filter.pdu {
            LineKind::NotificationWithPdu(id)
        } else {
            LineKind::Notification(id)
        };
        self.matcher.add(&filter.prefix, kind);
        debug!(prefix = %filter.prefix, pdu = filter.pdu, "registered notification");
        self.filters.insert(id, filter);
        id
    }

    fn failure_code(&self) -> Option<ResultCode> {
        if self.dead {
            Some(ResultCode::Dead)
        } else {
            self.closed
        }
    }

    fn active_mut(&mut self) -> Option<&mut Entry> {
        self.queue.front_mut().filter(|e| e.is_active())
    }

    fn write_line(&mut self, line: &str) {
        trace!(line, "send");
        let mut buf = BytesMut::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r");
        self.transmit.push_back(buf.freeze());
    }

    fn prime(&mut self, now: Instant) {
        if self.suspended || self.dead || self.closed.is_some() || self.settle_deadline.is_some() {
            return;
        }
        let Some(entry) = self.queue.front_mut() else {
            return;
        };
        if entry.state != CommandState::Queued {
            return;
        }

        if !entry.woken {
            if let Some(wakeup) = &self.config.wakeup {
                let idle = match (wakeup.idle, self.last_send) {
                    (Some(idle), Some(last)) => now.saturating_duration_since(last) >= idle,
                    _ => true,
                };
                if idle && wakeup.applies_to(entry.command.line()) {
                    entry.woken = true;
                    let probe = wakeup.command.clone();
                    let settle = wakeup.settle;
                    debug!(probe = %probe, "waking modem");
                    self.write_line(&probe);
                    self.last_send = Some(now);
                    self.settle_deadline = Some(now + settle);
                    return;
                }
            }
        }

        entry.state = CommandState::Sent;
        let id = entry.id;
        let line = entry.command.line().to_string();
        let timeout = entry.command.timeout().unwrap_or(self.config.command_timeout);
        debug!(id = %id, command = %line, "sending command");
        self.write_line(&line);
        self.last_send = Some(now);
        self.dead_deadline = self.config.dead_timeout.map(|d| now + d);
        self.echo_deadline = self.config.echo_retry.map(|d| now + d);
        self.command_deadline = Some(now + timeout);
    }

    fn clear_timers(&mut self) {
        self.dead_deadline = None;
        self.echo_deadline = None;
        self.command_deadline = None;
    }

    fn deliver(&mut self, id: CommandId, mut command: Command, result: CommandResult) {
        if let Some(callback) = command.take_on_done() {
            callback(&result);
        }
        self.events.push_back(ChatEvent::Response { id, result });
    }

    fn finish(&mut self, now: Instant, result_line: String) {
        let Some(entry) = self.queue.pop_front() else {
            return;
        };
        self.clear_timers();
        let mut result =
            CommandResult::from_line(entry.command.line().to_string(), entry.lines, result_line);
        result.aborted = entry.aborted;
        debug!(id = %entry.id, command = %result.command, code = %result.code, "command finished");
        self.deliver(entry.id, entry.command, result);
        self.prime(now);
    }

    fn fail_head(&mut self, now: Instant, code: ResultCode) {
        let Some(entry) = self.queue.pop_front() else {
            return;
        };
        self.clear_timers();
        let result = CommandResult::failed(entry.command.line().to_string(), entry.lines, code);
        self.deliver(entry.id, entry.command, result);
        self.prime(now);
    }

    fn fail_all(&mut self, code: ResultCode) {
        self.clear_timers();
        self.settle_deadline = None;
        self.pending_pdu = None;
        while let Some(entry) = self.queue.pop_front() {
            let result = CommandResult::failed(entry.command.line().to_string(), entry.lines, code);
            self.deliver(entry.id, entry.command, result);
        }
    }

    fn go_dead(&mut self) {
        warn!(pending = self.queue.len(), "device not responding; failing all commands");
        self.dead = true;
        self.fail_all(ResultCode::Dead);
        self.events.push_back(ChatEvent::DeviceDead);
    }

    fn close(&mut self, code: ResultCode) {
        if self.closed.is_none() {
            debug!(code = %code, pending = self.queue.len(), "chat closed");
            self.closed = Some(code);
        }
        self.fail_all(code);
    }

    fn process_input(&mut self, now: Instant) {
        if self.rx.is_empty() {
            return;
        }

        let data = self.rx.split();
        for &byte in data.iter() {
            match byte {
                b'\n' => {
                    let raw = std::mem::take(&mut self.line);
                    let line = String::from_utf8_lossy(&raw).into_owned();
                    self.process_line(now, line);
                }
                0 | b'\r' => {}
                _ if self.line.len() < self.config.max_line_length => self.line.push(byte),
                _ => trace!("input line too long; truncating"),
            }
        }

        if self.line == PROMPT {
            self.answer_prompt();
        }
    }

    fn answer_prompt(&mut self) {
        let Some(entry) = self.queue.front_mut().filter(|e| e.is_active()) else {
            return;
        };
        self.line.clear();
        entry.state = CommandState::AwaitingResponse;
        let Some(body) = entry.command.pdu().cloned() else {
            return;
        };
        self.echo_deadline = None;
        let encoded = pdu::encode(&body);
        let mut buf = BytesMut::with_capacity(encoded.len() + 1);
        buf.extend_from_slice(encoded.as_bytes());
        buf.extend_from_slice(&[CTRL_Z]);
        debug!(len = body.len(), "sending PDU after prompt");
        self.transmit.push_back(buf.freeze());
    }

    fn classify(&self, line: &str) -> Option<(String, LineKind)> {
        if self.config.numeric_results && NUMERIC_RESULTS.contains(&line) {
            let kind = if matches!(line, "0" | "4") {
                LineKind::Terminator
            } else {
                LineKind::TerminatorOrNotification
            };
            return Some((line.to_string(), kind));
        }
        if let Some(entry) = self.queue.front().filter(|e| e.is_active()) {
            if entry.command.terminates_on(line) {
                return Some((line.to_string(), LineKind::FuzzyTerminator));
            }
        }
        self.matcher
            .lookup(line)
            .map(|(prefix, kind)| (prefix.to_string(), kind))
    }

    fn process_line(&mut self, now: Instant, line: String) {
        if line.is_empty() {
            return;
        }
        let classified = self.classify(&line);

        if self.settle_deadline.is_some() {
            match classified {
                Some((prefix, LineKind::Notification(id))) => {
                    self.dispatch(id, prefix, line, None)
                }
                _ => trace!(line = %line, "discarded during wakeup"),
            }
            return;
        }

        let Some((prefix, kind)) = classified else {
            self.unclassified(line);
            return;
        };
        let active = self.queue.front().is_some_and(Entry::is_active);

        match kind {
            LineKind::OkTerminator | LineKind::Terminator if active => self.finish(now, line),
            LineKind::FuzzyTerminator if active => {
                if let Some(entry) = self.active_mut() {
                    entry.lines.push(line);
                }
                self.finish(now, "OK".to_string());
            }
            LineKind::OkTerminator | LineKind::Terminator | LineKind::FuzzyTerminator => {
                trace!(line = %line, "result line with no command");
            }
            LineKind::TerminatorOrNotification => {
                let call_control = self
                    .queue
                    .front()
                    .is_some_and(|e| e.is_active() && e.command.is_call_control());
                if call_control {
                    self.finish(now, line);
                } else {
                    debug!(line = %line, "call notification");
                    self.events.push_back(ChatEvent::CallNotification { line });
                }
            }
            LineKind::CommandEcho => {
                self.pending_pdu = None;
                if let Some(entry) = self.active_mut() {
                    entry.state = CommandState::AwaitingResponse;
                    self.echo_deadline = None;
                }
                trace!(line = %line, "echo");
            }
            LineKind::Notification(id) => {
                let may_be_command = self.filters.get(&id).is_some_and(|f| f.may_be_command);
                match self.active_mut() {
                    Some(entry)
                        if entry.command.captures(&line)
                            || (may_be_command && entry.command.queries(&prefix)) =>
                    {
                        entry.lines.push(line);
                        entry.state = CommandState::AwaitingResponse;
                        self.echo_deadline = None;
                    }
                    _ => self.dispatch(id, prefix, line, None),
                }
            }
            LineKind::NotificationWithPdu(id) => {
                if let Some(entry) = self.active_mut().filter(|e| e.command.captures(&line)) {
                    entry.lines.push(line);
                    return;
                }
                if line.len() > 9 && !line.contains(',') && line.is_char_boundary(8) {
                    // Header and PDU run together on one line.
                    let (header, body) = line.split_at(8);
                    let body = self.decode_body(body);
                    self.dispatch(id, prefix, header.to_string(), Some(body));
                } else {
                    self.pending_pdu = Some((id, prefix, line));
                }
            }
        }
    }

    fn unclassified(&mut self, line: String) {
        if let Some((id, prefix, header)) = self.pending_pdu.take() {
            let body = if header.matches(',').count() >= 2 {
                Bytes::from(line.into_bytes())
            } else {
                self.decode_body(&line)
            };
            self.dispatch(id, prefix, header, Some(body));
            return;
        }

        if let Some(callback) = self.line_request.take() {
            trace!(line = %line, "delivering requested line");
            callback(line);
            return;
        }

        match self.active_mut() {
            Some(entry) => {
                entry.lines.push(line);
                entry.state = CommandState::AwaitingResponse;
                self.echo_deadline = None;
            }
            None => trace!(line = %line, "ignoring unsolicited line"),
        }
    }

    fn decode_body(&self, text: &str) -> Bytes {
        pdu::decode(text).unwrap_or_else(|err| {
            warn!(error = %err, "undecodable PDU; passing raw text");
            Bytes::copy_from_slice(text.as_bytes())
        })
    }

    fn dispatch(&mut self, id: NotificationId, prefix: String, line: String, body: Option<Bytes>) {
        let notification = Notification {
            id,
            prefix,
            line,
            pdu: body,
        };
        debug!(prefix = %notification.prefix, line = %notification.line, "notification");
        if let Some(handler) = self.filters.get_mut(&id).and_then(|f| f.handler.as_mut()) {
            handler(&notification);
        }
        self.events.push_back(ChatEvent::Notification(notification));
    }
}

impl fmt::Debug for ChatEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatEngine")
            .field("pending", &self.queue.len())
            .field("suspended", &self.suspended)
            .field("dead", &self.dead)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    fn quiet() -> ChatConfig {
        ChatConfig {
            dead_timeout: None,
            echo_retry: None,
            ..ChatConfig::default()
        }
    }

    fn sent(engine: &mut ChatEngine) -> Vec<String> {
        std::iter::from_fn(|| engine.poll_transmit())
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .collect()
    }

    fn events(engine: &mut ChatEngine) -> Vec<ChatEvent> {
        std::iter::from_fn(|| engine.poll_event()).collect()
    }

    fn responses(engine: &mut ChatEngine) -> Vec<(CommandId, CommandResult)> {
        events(engine)
            .into_iter()
            .filter_map(|e| match e {
                ChatEvent::Response { id, result } => Some((id, result)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn command_with_echo_and_content() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(ChatConfig::default());
        let (tx, rx) = mpsc::channel();
        let id = engine
            .submit(
                now,
                Command::new("AT+CSQ").on_done(move |result| {
                    tx.send(result.clone()).unwrap();
                }),
            )
            .unwrap();
        assert_eq!(sent(&mut engine), vec!["AT+CSQ\r"]);
        assert_eq!(
            engine.active_command(),
            Some((id, CommandState::Sent))
        );

        engine.receive(now, b"AT+CSQ\r\r\n+CSQ: 21,99\r\n\r\nOK\r\n");
        let results = responses(&mut engine);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, id);
        assert_eq!(results[0].1.lines, vec!["+CSQ: 21,99"]);
        assert_eq!(results[0].1.code, ResultCode::Ok);
        assert!(results[0].1.ok());
        assert_eq!(rx.try_recv().unwrap(), results[0].1);
        assert_eq!(engine.poll_timeout(), None);
    }

    #[test]
    fn second_command_waits_for_first() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine.submit(now, Command::new("AT+CGMI")).unwrap();
        engine.submit(now, Command::new("AT+CGMM")).unwrap();
        assert_eq!(sent(&mut engine), vec!["AT+CGMI\r"]);

        engine.receive(now, b"\r\nACME\r\n");
        assert!(sent(&mut engine).is_empty());

        engine.receive(now, b"\r\nOK\r\n");
        assert_eq!(sent(&mut engine), vec!["AT+CGMM\r"]);
        assert_eq!(engine.pending(), 1);
    }

    #[test]
    fn fragmented_input() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine.submit(now, Command::new("ATI")).unwrap();
        for chunk in [&b"\r\nMod"[..], b"em v1\r", b"\n\r\nO", b"K\r\n"] {
            engine.receive(now, chunk);
        }
        let results = responses(&mut engine);
        assert_eq!(results[0].1.lines, vec!["Modem v1"]);
        assert!(results[0].1.ok());
    }

    #[test]
    fn error_lines_terminate() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine.submit(now, Command::new("AT+CPIN?")).unwrap();
        engine.receive(now, b"\r\n+CME ERROR: 10\r\n");
        engine.submit(now, Command::new("AT+XYZ")).unwrap();
        engine.receive(now, b"\r\nERROR\r\n");

        let results = responses(&mut engine);
        assert_eq!(results[0].1.code, ResultCode::CmeError(10));
        assert_eq!(results[1].1.code, ResultCode::Error);
    }

    #[test]
    fn registered_error_prefix() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine.register_error_prefix("+XERR");
        engine.submit(now, Command::new("AT+VENDOR")).unwrap();
        engine.receive(now, b"+XERR: 12\r\n");
        let results = responses(&mut engine);
        assert_eq!(results[0].1.code, ResultCode::Error);
        assert_eq!(results[0].1.result_line, "+XERR: 12");
    }

    #[test]
    fn fuzzy_terminator_completes_as_ok() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine.register_fuzzy_terminator("+CPIN:");
        engine.submit(now, Command::new("AT+CPIN?")).unwrap();
        engine.receive(now, b"\r\n+CPIN: READY\r\n");
        let results = responses(&mut engine);
        assert!(results[0].1.ok());
        assert_eq!(results[0].1.lines, vec!["+CPIN: READY"]);
    }

    #[test]
    fn per_command_terminator() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine
            .submit(now, Command::new("AT+CUSD=1").with_terminator("+CUSD:"))
            .unwrap();
        engine.receive(now, b"+CUSD: 0,\"Balance\"\r\n");
        let results = responses(&mut engine);
        assert!(results[0].1.ok());
        assert_eq!(results[0].1.lines, vec!["+CUSD: 0,\"Balance\""]);
    }

    #[test]
    fn timeout_yields_one_result_and_unblocks_queue() {
        let t0 = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        let first = engine
            .submit(t0, Command::new("AT+COPS=?").with_timeout(Duration::from_secs(5)))
            .unwrap();
        engine.submit(t0, Command::new("AT")).unwrap();
        sent(&mut engine);
        assert_eq!(engine.poll_timeout(), Some(t0 + Duration::from_secs(5)));

        engine.handle_timeout(t0 + Duration::from_secs(4));
        assert!(events(&mut engine).is_empty());

        let t5 = t0 + Duration::from_secs(5);
        engine.handle_timeout(t5);
        let results = responses(&mut engine);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, first);
        assert_eq!(results[0].1.code, ResultCode::Timeout);
        assert_eq!(sent(&mut engine), vec!["AT\r"]);

        // A late answer to the first command completes the second.
        engine.receive(t5, b"OK\r\n");
        engine.handle_timeout(t5 + Duration::from_secs(100));
        let results = responses(&mut engine);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.command, "AT");
    }

    #[test]
    fn dead_device_fails_everything() {
        let t0 = Instant::now();
        let mut engine = ChatEngine::new(ChatConfig {
            echo_retry: None,
            ..ChatConfig::default()
        });
        engine.submit(t0, Command::new("AT+CFUN=1")).unwrap();
        engine.submit(t0, Command::new("AT+COPS?")).unwrap();

        let deadline = t0 + Duration::from_secs(30);
        assert_eq!(engine.poll_timeout(), Some(deadline));
        engine.handle_timeout(deadline);

        let all = events(&mut engine);
        assert_eq!(all.len(), 3);
        assert!(all[..2].iter().all(|e| matches!(
            e,
            ChatEvent::Response { result, .. } if result.code == ResultCode::Dead
        )));
        assert_eq!(all[2], ChatEvent::DeviceDead);
        assert!(engine.is_dead());

        sent(&mut engine);
        engine.submit(deadline, Command::new("AT")).unwrap();
        assert!(sent(&mut engine).is_empty());
        let results = responses(&mut engine);
        assert_eq!(results[0].1.code, ResultCode::Dead);
    }

    #[test]
    fn input_keeps_device_alive() {
        let t0 = Instant::now();
        let mut engine = ChatEngine::new(ChatConfig {
            echo_retry: None,
            ..ChatConfig::default()
        });
        engine.submit(t0, Command::new("AT+COPS=?")).unwrap();

        let t20 = t0 + Duration::from_secs(20);
        engine.receive(t20, b"\r\n");
        engine.handle_timeout(t0 + Duration::from_secs(35));
        assert!(!engine.is_dead());
        assert_eq!(engine.poll_timeout(), Some(t20 + Duration::from_secs(30)));
    }

    #[test]
    fn buffered_input_keeps_suspended_device_alive() {
        let t0 = Instant::now();
        let mut engine = ChatEngine::new(ChatConfig {
            echo_retry: None,
            ..ChatConfig::default()
        });
        engine.submit(t0, Command::new("AT+COPS=?")).unwrap();
        engine.suspend();

        let t20 = t0 + Duration::from_secs(20);
        engine.receive(t20, b"\r\n+COPS: (2,\"Operator\",,\"26201\")\r\n");
        engine.handle_timeout(t0 + Duration::from_secs(35));
        assert!(!engine.is_dead());
        assert_eq!(engine.poll_timeout(), Some(t20 + Duration::from_secs(30)));

        let t40 = t0 + Duration::from_secs(40);
        engine.receive(t40, b"\r\nOK\r\n");
        engine.resume(t40);
        let results = responses(&mut engine);
        assert_eq!(results.len(), 1);
        assert!(results[0].1.ok());
        assert_eq!(results[0].1.lines, vec!["+COPS: (2,\"Operator\",,\"26201\")"]);
    }

    #[test]
    fn empty_input_does_not_count_as_activity() {
        let t0 = Instant::now();
        let mut engine = ChatEngine::new(ChatConfig {
            echo_retry: None,
            ..ChatConfig::default()
        });
        engine.submit(t0, Command::new("AT+CFUN=1")).unwrap();
        engine.receive(t0 + Duration::from_secs(10), b"");
        assert_eq!(engine.poll_timeout(), Some(t0 + Duration::from_secs(30)));
    }

    #[test]
    fn missing_echo_resends_once() {
        let t0 = Instant::now();
        let mut engine = ChatEngine::new(ChatConfig::default());
        engine.submit(t0, Command::new("AT+CREG?")).unwrap();
        assert_eq!(sent(&mut engine), vec!["AT+CREG?\r"]);

        engine.handle_timeout(t0 + Duration::from_millis(1500));
        assert_eq!(sent(&mut engine), vec!["AT+CREG?\r"]);
        engine.handle_timeout(t0 + Duration::from_secs(3));
        assert!(sent(&mut engine).is_empty());

        // The resend did not push the dead timer out.
        assert_eq!(engine.poll_timeout(), Some(t0 + Duration::from_secs(30)));
    }

    #[test]
    fn echo_cancels_resend() {
        let t0 = Instant::now();
        let mut engine = ChatEngine::new(ChatConfig::default());
        engine.submit(t0, Command::new("AT+CREG?")).unwrap();
        sent(&mut engine);
        engine.receive(t0, b"AT+CREG?\r");
        engine.receive(t0, b"\n");
        engine.handle_timeout(t0 + Duration::from_secs(2));
        assert!(sent(&mut engine).is_empty());
        assert_eq!(
            engine.active_command().map(|(_, s)| s),
            Some(CommandState::AwaitingResponse)
        );
    }

    #[test]
    fn notifications_with_and_without_command() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        let (tx, rx) = mpsc::channel();
        let id = engine
            .register_notification(NotificationFilter::new("+CREG:").on_notify(move |n| {
                tx.send(n.line.clone()).unwrap();
            }))
            .unwrap();

        engine.receive(now, b"\r\n+CREG: 1\r\n");
        engine.submit(now, Command::new("AT+CSQ")).unwrap();
        engine.receive(now, b"\r\n+CREG: 5\r\n+CSQ: 10,0\r\nOK\r\n");

        let all = events(&mut engine);
        assert_eq!(all.len(), 3);
        assert!(matches!(
            &all[0],
            ChatEvent::Notification(n) if n.id == id && n.line == "+CREG: 1"
        ));
        assert!(matches!(
            &all[1],
            ChatEvent::Notification(n) if n.line == "+CREG: 5"
        ));
        assert!(matches!(
            &all[2],
            ChatEvent::Response { result, .. } if result.lines == vec!["+CSQ: 10,0".to_string()]
        ));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["+CREG: 1", "+CREG: 5"]);

        assert!(engine.unregister_notification(id));
        engine.receive(now, b"+CREG: 1\r\n");
        assert!(events(&mut engine).is_empty());
    }

    #[test]
    fn query_captures_its_own_notification() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine
            .register_notification(NotificationFilter::new("+CREG:").may_be_command())
            .unwrap();
        engine.submit(now, Command::new("AT+CREG?")).unwrap();
        engine.receive(now, b"+CREG: 0,1\r\nOK\r\n");

        let all = events(&mut engine);
        assert_eq!(all.len(), 1);
        assert!(matches!(
            &all[0],
            ChatEvent::Response { result, .. } if result.lines == vec!["+CREG: 0,1".to_string()]
        ));
    }

    #[test]
    fn explicit_capture() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine
            .register_notification(NotificationFilter::new("+CGEV:"))
            .unwrap();
        engine
            .submit(now, Command::new("AT+CGACT=1").capturing("+CGEV:"))
            .unwrap();
        engine.receive(now, b"+CGEV: ME PDN ACT 1\r\nOK\r\n");
        let results = responses(&mut engine);
        assert_eq!(results[0].1.lines, vec!["+CGEV: ME PDN ACT 1"]);
    }

    #[test]
    fn pdu_notification_decoded() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine.receive(now, b"+CMT: ,4\r\n0791AB12\r\n");
        let all = events(&mut engine);
        assert_eq!(
            all,
            vec![ChatEvent::Notification(Notification {
                id: NotificationId(1),
                prefix: "+CMT:".into(),
                line: "+CMT: ,4".into(),
                pdu: Some(Bytes::from_static(&[0x07, 0x91, 0xAB, 0x12])),
            })]
        );
    }

    #[test]
    fn text_mode_notification_passes_raw_body() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine.receive(now, b"+CMT: \"+15551234\",,\"24/01/01\"\r\nhello\r\n");
        let all = events(&mut engine);
        assert!(matches!(
            &all[0],
            ChatEvent::Notification(n) if n.pdu.as_deref() == Some(&b"hello"[..])
        ));
    }

    #[test]
    fn pdu_on_same_line() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine.receive(now, b"+CBM: 880102\r\n");
        let all = events(&mut engine);
        assert!(matches!(
            &all[0],
            ChatEvent::Notification(n)
                if n.line == "+CBM: 88" && n.pdu.as_deref() == Some(&[0x01, 0x02][..])
        ));
    }

    #[test]
    fn prompt_sends_pdu() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine
            .submit(now, Command::new("AT+CMGS=2").with_pdu(vec![0x00, 0x1F]))
            .unwrap();
        assert_eq!(sent(&mut engine), vec!["AT+CMGS=2\r"]);

        engine.receive(now, b"AT+CMGS=2\r\r\n> ");
        assert_eq!(sent(&mut engine), vec!["001F\x1a"]);

        engine.receive(now, b"\r\n+CMGS: 4\r\n\r\nOK\r\n");
        let results = responses(&mut engine);
        assert!(results[0].1.ok());
        assert_eq!(results[0].1.values("+CMGS:").next(), Some("4"));
    }

    #[test]
    fn call_progress_lines() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine.receive(now, b"NO CARRIER\r\n");
        assert_eq!(
            events(&mut engine),
            vec![ChatEvent::CallNotification {
                line: "NO CARRIER".into()
            }]
        );

        engine.submit(now, Command::new("ATD+15551234;")).unwrap();
        engine.receive(now, b"BUSY\r\n");
        let results = responses(&mut engine);
        assert_eq!(results[0].1.code, ResultCode::Busy);
    }

    #[test]
    fn abort_dial_marks_result() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        assert!(!engine.abort_dial());
        engine.submit(now, Command::new("ATD5551234;")).unwrap();
        sent(&mut engine);

        assert!(engine.abort_dial());
        assert_eq!(sent(&mut engine), vec!["\r"]);
        engine.receive(now, b"OK\r\n");
        let results = responses(&mut engine);
        assert_eq!(results[0].1.code, ResultCode::Ok);
        assert!(results[0].1.aborted);
        assert!(!results[0].1.ok());
    }

    #[test]
    fn suspend_buffers_until_resume() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine
            .register_notification(NotificationFilter::new("+CREG:"))
            .unwrap();
        engine.suspend();
        engine.receive(now, b"+CREG: 1\r\n");
        engine.submit(now, Command::new("AT")).unwrap();
        assert!(events(&mut engine).is_empty());
        assert!(sent(&mut engine).is_empty());

        engine.resume(now);
        assert_eq!(events(&mut engine).len(), 1);
        assert_eq!(sent(&mut engine), vec!["AT\r"]);
    }

    #[test]
    fn wakeup_precedes_matching_commands() {
        let t0 = Instant::now();
        let mut engine = ChatEngine::new(ChatConfig {
            wakeup: Some(WakeupConfig {
                prefixes: vec!["AT+COPS".into()],
                ..WakeupConfig::default()
            }),
            ..quiet()
        });
        engine
            .register_notification(NotificationFilter::new("+CREG:"))
            .unwrap();
        engine.submit(t0, Command::new("AT+COPS?")).unwrap();
        assert_eq!(sent(&mut engine), vec!["AT\r"]);

        engine.receive(t0, b"OK\r\n+CREG: 2\r\n");
        let all = events(&mut engine);
        assert_eq!(all.len(), 1);
        assert!(matches!(&all[0], ChatEvent::Notification(_)));

        engine.handle_timeout(t0 + Duration::from_secs(1));
        assert_eq!(sent(&mut engine), vec!["AT+COPS?\r"]);

        // Commands without the prefix go straight out.
        engine.receive(t0, b"OK\r\n");
        engine.submit(t0, Command::new("AT+CSQ")).unwrap();
        assert_eq!(sent(&mut engine), vec!["AT+CSQ\r"]);
    }

    #[test]
    fn wakeup_only_after_idle() {
        let t0 = Instant::now();
        let mut engine = ChatEngine::new(ChatConfig {
            wakeup: Some(WakeupConfig {
                idle: Some(Duration::from_secs(10)),
                ..WakeupConfig::default()
            }),
            ..quiet()
        });
        engine.submit(t0, Command::new("AT+CSQ")).unwrap();
        engine.handle_timeout(t0 + Duration::from_secs(1));
        engine.receive(t0 + Duration::from_secs(1), b"OK\r\n");
        assert_eq!(sent(&mut engine), vec!["AT\r", "AT+CSQ\r"]);

        let t2 = t0 + Duration::from_secs(2);
        engine.submit(t2, Command::new("AT+CSQ")).unwrap();
        assert_eq!(sent(&mut engine), vec!["AT+CSQ\r"]);
    }

    #[test]
    fn next_line_request() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        let (tx, rx) = mpsc::channel();
        engine.request_next_line(move |line| tx.send(line).unwrap());
        engine.receive(now, b"\r\nextra data\r\nmore\r\n");
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["extra data"]);
    }

    #[test]
    fn channel_close_fails_queue() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(quiet());
        engine.submit(now, Command::new("AT+CGATT=1")).unwrap();
        engine.submit(now, Command::new("AT+CGACT=1")).unwrap();
        engine.channel_closed();
        engine.submit(now, Command::new("AT")).unwrap();

        let codes: Vec<ResultCode> = responses(&mut engine)
            .into_iter()
            .map(|(_, r)| r.code)
            .collect();
        assert_eq!(codes, vec![ResultCode::ChannelClosed; 3]);
        assert_eq!(engine.poll_timeout(), None);
    }

    #[test]
    fn numeric_mode_results() {
        let now = Instant::now();
        let mut engine = ChatEngine::new(ChatConfig {
            numeric_results: true,
            ..quiet()
        });
        engine.submit(now, Command::new("ATI")).unwrap();
        engine.receive(now, b"Modem\r\n0\r\n");
        engine.submit(now, Command::new("AT+BAD")).unwrap();
        engine.receive(now, b"4\r\n");
        let codes: Vec<ResultCode> = responses(&mut engine)
            .into_iter()
            .map(|(_, r)| r.code)
            .collect();
        assert_eq!(codes, vec![ResultCode::Ok, ResultCode::Error]);
    }

    #[test]
    fn invalid_commands_rejected() {
        let mut engine = ChatEngine::new(quiet());
        assert!(matches!(
            engine.submit(Instant::now(), Command::new("AT\r\nATZ")),
            Err(ChatError::InvalidCommand(_))
        ));
        assert!(engine.send_line("ATH").is_ok());
        assert!(engine.send_line("ATH\r").is_err());
        assert!(matches!(
            engine.register_notification(NotificationFilter::new("")),
            Err(ChatError::EmptyPrefix)
        ));
    }
}

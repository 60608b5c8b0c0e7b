use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{ChatError, Result};
use crate::result::CommandResult;

/// Identifies a submitted command in [`ChatEvent::Response`](crate::ChatEvent::Response).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where a command is in its exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Waiting behind the active command.
    Queued,
    /// Written; no echo or response seen yet.
    Sent,
    /// Echo or response lines seen; waiting for the terminal line.
    AwaitingResponse,
    /// Finished, successfully or not.
    Done,
}

pub(crate) type DoneCallback = Box<dyn FnOnce(&CommandResult) + Send>;

/// An AT command plus how to run it.
///
/// ```ignore
/// let cmd = Command::new("AT+CMGS=23")
///     .with_pdu(pdu)
///     .with_timeout(Duration::from_secs(30));
/// ```
pub struct Command {
    pub(crate) line: String,
    pub(crate) pdu: Option<Bytes>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) terminators: Vec<String>,
    pub(crate) captures: Vec<String>,
    pub(crate) on_done: Option<DoneCallback>,
}

impl Command {
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            pdu: None,
            timeout: None,
            terminators: Vec::new(),
            captures: Vec::new(),
            on_done: None,
        }
    }

    /// Send `pdu` (hex encoded, Ctrl-Z terminated) after the `>` prompt.
    pub fn with_pdu(mut self, pdu: impl Into<Bytes>) -> Self {
        self.pdu = Some(pdu.into());
        self
    }

    /// Override the engine's command timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Treat lines starting with `prefix` as the end of this command
    /// (kept as content, completing as `OK`).
    pub fn with_terminator(mut self, prefix: impl Into<String>) -> Self {
        self.terminators.push(prefix.into());
        self
    }

    /// Keep lines starting with `prefix` in this command's result even when
    /// the prefix is registered as a notification.
    pub fn capturing(mut self, prefix: impl Into<String>) -> Self {
        self.captures.push(prefix.into());
        self
    }

    /// Run `callback` with the result when the command finishes.
    pub fn on_done<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&CommandResult) + Send + 'static,
    {
        self.on_done = Some(Box::new(callback));
        self
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    pub fn pdu(&self) -> Option<&Bytes> {
        self.pdu.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Check that the command can go out as one line.
    pub fn validate(&self) -> Result<()> {
        if self.line.is_empty() || self.line.contains(['\r', '\n', '\x1a']) {
            return Err(ChatError::InvalidCommand(self.line.clone()));
        }
        Ok(())
    }

    /// Copy of this command without its callback, for re-submission.
    pub(crate) fn attempt(&self) -> Self {
        Self {
            line: self.line.clone(),
            pdu: self.pdu.clone(),
            timeout: self.timeout,
            terminators: self.terminators.clone(),
            captures: self.captures.clone(),
            on_done: None,
        }
    }

    pub(crate) fn take_on_done(&mut self) -> Option<DoneCallback> {
        self.on_done.take()
    }

    /// Dial, answer, hangup, online and call-hold commands end on call
    /// progress lines such as `CONNECT` or `NO CARRIER`.
    pub(crate) fn is_call_control(&self) -> bool {
        ["ATD", "ATA", "ATH", "ATO", "AT+CHLD="]
            .iter()
            .any(|prefix| self.line.starts_with(prefix))
    }

    pub(crate) fn is_dial(&self) -> bool {
        self.line.starts_with("ATD")
    }

    pub(crate) fn captures(&self, line: &str) -> bool {
        self.captures.iter().any(|prefix| line.starts_with(prefix.as_str()))
    }

    pub(crate) fn terminates_on(&self, line: &str) -> bool {
        self.terminators
            .iter()
            .any(|prefix| line.starts_with(prefix.as_str()))
    }

    /// Whether the notification `prefix` answers this command, as in
    /// `+CREG:` for `AT+CREG?`.
    pub(crate) fn queries(&self, prefix: &str) -> bool {
        let name = prefix.trim_end_matches(':');
        self.line
            .strip_prefix("AT")
            .is_some_and(|rest| !name.is_empty() && rest.starts_with(name))
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("line", &self.line)
            .field("pdu_len", &self.pdu.as_ref().map(Bytes::len))
            .field("timeout", &self.timeout)
            .field("terminators", &self.terminators)
            .field("captures", &self.captures)
            .field("on_done", &self.on_done.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rejects_multiline() {
        assert!(Command::new("AT+CSQ").validate().is_ok());
        assert!(Command::new("").validate().is_err());
        assert!(Command::new("AT\rATZ").validate().is_err());
        assert!(Command::new("AT+CMGS=\x1a").validate().is_err());
    }

    #[test]
    fn call_control_detection() {
        assert!(Command::new("ATD+15551234;").is_call_control());
        assert!(Command::new("ATH").is_call_control());
        assert!(Command::new("AT+CHLD=1").is_call_control());
        assert!(!Command::new("AT+CHLD?").is_call_control());
        assert!(Command::new("ATD123").is_dial());
        assert!(!Command::new("ATA").is_dial());
    }

    #[test]
    fn query_matches_notification_prefix() {
        let cmd = Command::new("AT+CREG?");
        assert!(cmd.queries("+CREG:"));
        assert!(!cmd.queries("+CGREG:"));
        assert!(!Command::new("ATI").queries(":"));
    }

    #[test]
    fn attempt_drops_callback() {
        let cmd = Command::new("AT+CFUN=1")
            .with_timeout(Duration::from_secs(5))
            .capturing("+CFUN:")
            .on_done(|_| {});
        let copy = cmd.attempt();
        assert_eq!(copy.line(), "AT+CFUN=1");
        assert_eq!(copy.timeout(), Some(Duration::from_secs(5)));
        assert!(copy.captures("+CFUN: 1"));
        assert!(copy.on_done.is_none());
        assert!(cmd.on_done.is_some());
    }
}

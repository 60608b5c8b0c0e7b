//! Repeat a command until it succeeds or the attempts run out.
//!
//! [`RetryChat`] does not own the engine. The caller submits through it,
//! routes every [`ChatEvent::Response`](crate::ChatEvent::Response) to
//! [`RetryChat::on_response`], and drives its timer alongside the engine's.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::command::{Command, CommandId, DoneCallback};
use crate::engine::ChatEngine;
use crate::error::Result;
use crate::result::{CommandResult, ResultCode};

/// How often and how fast to retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first included. Default: 15.
    pub attempts: u32,
    /// Pause between a failed attempt and the next. Default: 1 s.
    pub interval: Duration,
    /// Per-attempt timeout; `None` keeps the command's own.
    pub attempt_timeout: Option<Duration>,
    /// Whether the owner should drop the decorator once it has a result.
    pub release_on_done: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 15,
            interval: Duration::from_secs(1),
            attempt_timeout: None,
            release_on_done: true,
        }
    }
}

fn is_fatal(code: ResultCode) -> bool {
    matches!(
        code,
        ResultCode::Dead | ResultCode::ChannelClosed | ResultCode::LinkDown
    )
}

/// A command retried through a [`ChatEngine`].
pub struct RetryChat {
    command: Command,
    on_done: Option<DoneCallback>,
    policy: RetryPolicy,
    attempts: u32,
    current: Option<CommandId>,
    next_attempt: Option<Instant>,
    result: Option<CommandResult>,
    finished: bool,
}

impl RetryChat {
    /// Takes over the command's `on_done` callback; it runs once, with the
    /// final result.
    pub fn new(mut command: Command, policy: RetryPolicy) -> Self {
        let on_done = command.take_on_done();
        Self {
            command,
            on_done,
            policy,
            attempts: 0,
            current: None,
            next_attempt: None,
            result: None,
            finished: false,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Attempts submitted so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Id of the attempt in flight, if any.
    pub fn current(&self) -> Option<CommandId> {
        self.current
    }

    /// Submit the first attempt.
    pub fn start(&mut self, engine: &mut ChatEngine, now: Instant) -> Result<()> {
        self.command.validate()?;
        self.submit(engine, now)
    }

    /// Feed a response from the engine. Returns false if `id` is not this
    /// decorator's attempt.
    pub fn on_response(
        &mut self,
        engine: &mut ChatEngine,
        id: CommandId,
        result: &CommandResult,
        now: Instant,
    ) -> bool {
        if self.current != Some(id) {
            return false;
        }
        self.current = None;

        if result.ok() || is_fatal(result.code) || self.attempts >= self.policy.attempts.max(1) {
            self.finish(result.clone());
            return true;
        }

        debug!(
            command = %self.command.line(),
            attempt = self.attempts,
            code = %result.code,
            "attempt failed; retrying"
        );
        self.result = Some(result.clone());
        if self.policy.interval.is_zero() {
            self.resubmit(engine, now);
        } else {
            self.next_attempt = Some(now + self.policy.interval);
        }
        true
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.next_attempt
    }

    pub fn handle_timeout(&mut self, engine: &mut ChatEngine, now: Instant) {
        if self.next_attempt.is_some_and(|t| t <= now) {
            self.next_attempt = None;
            self.resubmit(engine, now);
        }
    }

    /// Stop retrying and finish with `code`. No-op once finished.
    pub fn cancel(&mut self, code: ResultCode) {
        if self.finished {
            return;
        }
        self.current = None;
        let lines = self
            .result
            .take()
            .map(|last| last.lines)
            .unwrap_or_default();
        self.finish(CommandResult::failed(
            self.command.line().to_string(),
            lines,
            code,
        ));
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn release_on_done(&self) -> bool {
        self.policy.release_on_done
    }

    /// The aggregated result, once finished.
    pub fn take_result(&mut self) -> Option<CommandResult> {
        if self.finished {
            self.result.take()
        } else {
            None
        }
    }

    fn submit(&mut self, engine: &mut ChatEngine, now: Instant) -> Result<()> {
        let mut attempt = self.command.attempt();
        if let Some(timeout) = self.policy.attempt_timeout {
            attempt = attempt.with_timeout(timeout);
        }
        self.attempts += 1;
        let id = engine.submit(now, attempt)?;
        self.current = Some(id);
        Ok(())
    }

    fn resubmit(&mut self, engine: &mut ChatEngine, now: Instant) {
        if let Err(err) = self.submit(engine, now) {
            debug!(error = %err, "retry submission rejected");
            let last = self.result.take().unwrap_or_else(|| {
                CommandResult::failed(self.command.line().to_string(), Vec::new(), ResultCode::Error)
            });
            self.finish(last);
        }
    }

    fn finish(&mut self, result: CommandResult) {
        debug!(
            command = %self.command.line(),
            attempts = self.attempts,
            code = %result.code,
            "retry finished"
        );
        self.next_attempt = None;
        self.finished = true;
        if let Some(callback) = self.on_done.take() {
            callback(&result);
        }
        self.result = Some(result);
    }
}

impl fmt::Debug for RetryChat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryChat")
            .field("command", &self.command.line())
            .field("attempts", &self.attempts)
            .field("current", &self.current)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

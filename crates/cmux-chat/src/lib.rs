//! AT command chat over a modem channel.
//!
//! [`ChatEngine`] queues commands, writes them one at a time, splits the
//! reply into lines and sorts each line into echo, response content,
//! terminal result or unsolicited notification. It does no I/O itself:
//!
//! ```ignore
//! let mut chat = ChatEngine::new(ChatConfig::default());
//! let id = chat.submit(Instant::now(), Command::new("AT+CSQ"))?;
//! while let Some(bytes) = chat.poll_transmit() {
//!     channel.write_all(&bytes)?;
//! }
//! chat.receive(Instant::now(), &reply);
//! while let Some(event) = chat.poll_event() {
//!     // ChatEvent::Response { id, result } ...
//! }
//! ```
//!
//! [`RetryChat`] layers bounded retries on top of an engine.

pub mod command;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod pdu;
pub mod result;
pub mod retry;

pub use command::{Command, CommandId, CommandState};
pub use engine::{
    ChatConfig, ChatEngine, ChatEvent, Notification, NotificationFilter, NotificationId,
    WakeupConfig,
};
pub use error::{ChatError, Result};
pub use matcher::{LineKind, PrefixMatcher};
pub use result::{CommandResult, ResultCode};
pub use retry::{RetryChat, RetryPolicy};

//! Chat event and payload types for the relay.
//!
//! A [`ChatEvent`] arrives on the admission endpoint, is turned into a
//! [`Payload`] exactly once, and the payload is what travels through the
//! delivery queue to the worker.

use chrono::{Local, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest message (in characters) forwarded without truncation.
pub const MAX_MESSAGE_CHARS: usize = 1800;

/// Marker appended to truncated messages.
pub const ELLIPSIS: &str = "...";

/// A chat line received from the game server.
///
/// # Example
///
/// ```text
/// GET /webhook?sender=Bob&message=Hello
/// ```
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    /// Character or player name that said the line
    pub sender: String,

    /// The chat text
    pub message: String,
}

impl ChatEvent {
    /// Create a new chat event
    pub fn new(sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            message: message.into(),
        }
    }
}

/// A formatted, immutable outbound message.
///
/// The content looks like ``14:05 [**Bob**]: `Hello` `` and is sent to the
/// destination as `{"content": "<content>"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    id: Uuid,
    content: String,
}

impl Payload {
    /// Format a payload using the current local time.
    pub fn from_event(event: &ChatEvent) -> Self {
        Self::format(event, Local::now().time())
    }

    /// Format a payload for the given wall-clock time.
    ///
    /// Backticks in both fields become single quotes so they cannot close
    /// the inline code span, and over-long messages are truncated to
    /// `MAX_MESSAGE_CHARS - 1` characters plus [`ELLIPSIS`].
    pub fn format(event: &ChatEvent, time: NaiveTime) -> Self {
        let sender = strip_backticks(&event.sender);
        let message = truncate_message(&strip_backticks(&event.message));

        let content = format!("{} [**{}**]: `{}`", time.format("%H:%M"), sender, message);

        Self::from_content(content)
    }

    /// Wrap already formatted content.
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            content: content.into(),
        }
    }

    /// Identifier used to correlate log lines for this payload
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The formatted text
    pub fn content(&self) -> &str {
        &self.content
    }
}

fn strip_backticks(text: &str) -> String {
    text.replace('`', "'")
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MAX_MESSAGE_CHARS {
        return message.to_string();
    }

    let mut truncated: String = message.chars().take(MAX_MESSAGE_CHARS - 1).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

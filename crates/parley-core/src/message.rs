//! Chat message value type and the server's notice texts.

use std::fmt;

use chrono::{DateTime, Local};

/// Label used in place of a sender for server-originated notices.
pub const SYSTEM_SENDER: &str = "SERVER";

const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("Sender cannot be empty")]
    EmptySender,
    #[error("Cannot send empty message")]
    EmptyBody,
}

/// An immutable chat message. Sender and body are stored trimmed and are
/// never empty.
#[derive(Debug, Clone)]
pub struct Message {
    sender: String,
    body: String,
    timestamp: DateTime<Local>,
}

impl Message {
    pub fn new(sender: &str, body: &str) -> Result<Self, MessageError> {
        let sender = sender.trim();
        if sender.is_empty() {
            return Err(MessageError::EmptySender);
        }
        let body = body.trim();
        if body.is_empty() {
            return Err(MessageError::EmptyBody);
        }
        Ok(Self {
            sender: sender.to_string(),
            body: body.to_string(),
            timestamp: Local::now(),
        })
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn timestamp(&self) -> DateTime<Local> {
        self.timestamp
    }

    /// `[HH:MM:SS] sender: body`
    pub fn format_line(&self) -> String {
        format!(
            "[{}] {}: {}",
            self.timestamp.format(TIME_FORMAT),
            self.sender,
            self.body
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format_line())
    }
}

/// True if `text` has content after trimming.
pub fn is_valid_body(text: &str) -> bool {
    !text.trim().is_empty()
}

/// `[HH:MM:SS] SERVER: text`
pub fn system_line(text: &str) -> String {
    format!(
        "[{}] {}: {}",
        Local::now().format(TIME_FORMAT),
        SYSTEM_SENDER,
        text
    )
}

pub fn join_notice(name: &str) -> String {
    system_line(&format!("{name} has joined the chat!"))
}

pub fn leave_notice(name: &str) -> String {
    system_line(&format!("{name} has left the chat."))
}

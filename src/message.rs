//! Message protocol definitions
//!
//! JSON envelope exchanged between the hub and its clients. Both directions
//! use Serde's internally tagged enums keyed on `type`, so the set of kinds is
//! closed and every consumer matches it exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Sender name used for hub-originated messages
pub const SYSTEM_SENDER: &str = "System";

/// Greeting sent only to a newly registered client
pub const WELCOME_TEXT: &str = "Welcome to the chat!";

/// Reference to a file handled by the upload service
///
/// Only metadata travels through the hub, never the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub url: String,
}

/// Kind-specific part of an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Chat text from a user
    Text { content: String },
    /// Hub announcement (join, leave, welcome)
    System { content: String },
    /// Typing indicator
    Typing { content: String },
    /// Shared file reference
    File {
        content: String,
        attachment: Attachment,
    },
    /// Protocol error, sent only to the offending client
    Error { code: ErrorCode, content: String },
    /// Presence list
    UserList { content: Vec<String> },
}

/// Discriminant of [`Payload`], handy for logging and routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    System,
    Typing,
    File,
    Error,
    UserList,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::System => "system",
            MessageKind::Typing => "typing",
            MessageKind::File => "file",
            MessageKind::Error => "error",
            MessageKind::UserList => "user_list",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes for `error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Record could not be decoded
    InvalidMessage,
    /// Record carried an unknown `type`
    UnknownType,
    /// `file` record without attachment
    MissingAttachment,
    /// Frame over the size limit
    MessageTooLarge,
    /// Binary or otherwise unsupported frame
    UnsupportedFrame,
    /// Store could not serve a history request
    HistoryUnavailable,
}

/// Hub → Client envelope
///
/// Immutable once built; the hub shares one instance between all queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    payload: Payload,
    sender: String,
    sent_at: DateTime<Utc>,
}

impl Message {
    pub fn new(payload: Payload, sender: impl Into<String>, sent_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            sender: sender.into(),
            sent_at,
        }
    }

    pub fn text(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            Payload::Text {
                content: content.into(),
            },
            sender,
            Utc::now(),
        )
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(
            Payload::System {
                content: content.into(),
            },
            SYSTEM_SENDER,
            Utc::now(),
        )
    }

    pub fn typing(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(
            Payload::Typing {
                content: content.into(),
            },
            sender,
            Utc::now(),
        )
    }

    pub fn file(
        sender: impl Into<String>,
        content: impl Into<String>,
        attachment: Attachment,
    ) -> Self {
        Self::new(
            Payload::File {
                content: content.into(),
                attachment,
            },
            sender,
            Utc::now(),
        )
    }

    pub fn error(code: ErrorCode, content: impl Into<String>) -> Self {
        Self::new(
            Payload::Error {
                code,
                content: content.into(),
            },
            SYSTEM_SENDER,
            Utc::now(),
        )
    }

    pub fn user_list(users: Vec<String>) -> Self {
        Self::new(Payload::UserList { content: users }, SYSTEM_SENDER, Utc::now())
    }

    pub fn joined(name: &str) -> Self {
        Self::system(format!("{} has joined the chat", name))
    }

    pub fn left(name: &str) -> Self {
        Self::system(format!("{} has left the chat", name))
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn kind(&self) -> MessageKind {
        match self.payload {
            Payload::Text { .. } => MessageKind::Text,
            Payload::System { .. } => MessageKind::System,
            Payload::Typing { .. } => MessageKind::Typing,
            Payload::File { .. } => MessageKind::File,
            Payload::Error { .. } => MessageKind::Error,
            Payload::UserList { .. } => MessageKind::UserList,
        }
    }

    /// Text content, if this kind carries any
    pub fn content(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text { content }
            | Payload::System { content }
            | Payload::Typing { content }
            | Payload::File { content, .. }
            | Payload::Error { content, .. } => Some(content.as_str()),
            Payload::UserList { .. } => None,
        }
    }
}

/// Client → Hub record
///
/// Carries no sender or timestamp: both are stamped by the client actor.
/// Unknown fields (including a forged `sender`) are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Chat text for everyone
    Text { content: String },
    /// Typing indicator, relayed without persistence
    Typing {
        #[serde(default)]
        content: String,
    },
    /// Reference to an already uploaded file
    File {
        #[serde(default)]
        content: String,
        attachment: Option<Attachment>,
    },
    /// Ask for recent history
    GetHistory,
}

impl ClientMessage {
    /// Every `type` a client may send
    pub const KINDS: [&'static str; 4] = ["text", "typing", "file", "get_history"];

    /// Decode one record, separating unknown kinds from malformed input
    pub fn decode(record: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(record).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing field `type`".to_string()))?;

        if !Self::KINDS.contains(&kind) {
            return Err(ProtocolError::UnknownKind(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Convert ProtocolError to an `error` Message for the originating client
impl From<ProtocolError> for Message {
    fn from(err: ProtocolError) -> Self {
        let code = match &err {
            ProtocolError::Malformed(_) => ErrorCode::InvalidMessage,
            ProtocolError::UnknownKind(_) => ErrorCode::UnknownType,
            ProtocolError::MissingAttachment => ErrorCode::MissingAttachment,
            ProtocolError::Oversize { .. } => ErrorCode::MessageTooLarge,
            ProtocolError::UnsupportedFrame => ErrorCode::UnsupportedFrame,
        };
        Message::error(code, err.to_string())
    }
}

/// Clean up user supplied text
///
/// Trims surrounding whitespace, strips control characters other than
/// newline and tab, and caps the length at `max_chars` characters.
pub fn sanitize_content(content: &str, max_chars: usize) -> String {
    content
        .trim()
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(max_chars)
        .collect()
}

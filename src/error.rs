//! Error types for the chat hub
//!
//! One enum per concern: connection-level failures, admission refusals,
//! protocol violations reported back to a client, store failures, and
//! configuration problems. Uses thiserror for ergonomic error definitions.

use std::time::Duration;

use thiserror::Error;

/// Application-level errors
///
/// Anything that ends a connection handler or prevents startup.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection refused at admission or at registration
    #[error("Admission refused: {0}")]
    Admission(#[from] AdmissionError),

    /// Message store could not be opened
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The hub task is gone (fatal - internal channel broken)
    #[error("Hub is no longer running")]
    HubClosed,

    /// A socket write did not complete within the write deadline
    #[error("Write did not complete within {0:?}")]
    WriteTimeout(Duration),
}

/// Reasons a connection is refused before it becomes a live client
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    /// Display name missing or not 3-20 letters, digits or underscores
    #[error("Invalid username: '{0}'")]
    InvalidUsername(String),

    /// No bearer credential in the subprotocol header
    #[error("Missing credential")]
    MissingCredential,

    /// Bearer credential failed verification or has expired
    #[error("Invalid or expired credential: {0}")]
    InvalidCredential(String),

    /// Another registered client already uses this name
    #[error("Username '{0}' is already taken")]
    NameTaken(String),
}

/// Malformed or unsupported input from a connected client
///
/// Reported to the originating client as an `error` message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Record is not a valid envelope
    #[error("Invalid message format: {0}")]
    Malformed(String),

    /// Record carries a `type` outside the known set
    #[error("Unknown message type '{0}'")]
    UnknownKind(String),

    /// `file` record without attachment metadata
    #[error("File message requires an attachment")]
    MissingAttachment,

    /// Frame larger than the configured limit
    #[error("Frame exceeds the {max} byte limit")]
    Oversize { max: usize },

    /// Binary frames are not part of the protocol
    #[error("Only text frames are supported")]
    UnsupportedFrame,
}

/// Message store failures (logged and swallowed by the hub)
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backing file could not be read or written
    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Backing file holds invalid JSON
    #[error("Store encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable could not be parsed
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },

    /// Keepalive pings must fit inside the idle window
    #[error("Ping interval {ping:?} must be shorter than idle timeout {idle:?}")]
    PingNotBelowIdle { ping: Duration, idle: Duration },

    /// A size or duration that must be positive was zero
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    /// The messages a client receives on joining would not fit its queue
    #[error("Queue capacity {capacity} is below the {needed} messages sent on join")]
    QueueTooSmall { needed: usize, capacity: usize },
}

/// Outbound queue errors
///
/// Occurs when the hub tries to enqueue onto a client's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The queue is at capacity (consumer too slow)
    #[error("Queue full")]
    Full,
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}

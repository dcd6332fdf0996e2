//! Client struct definition
//!
//! The hub's view of a connected client: identity plus the producing end of
//! its bounded outbound queue. Also holds the per-connection state machine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::SendError;
use crate::message::Message;
use crate::types::{ClientId, Username};

/// Outbound queue item; one envelope shared by every recipient
pub type Outbound = Arc<Message>;

/// Connected client information
///
/// Owned by the hub while registered. Dropping it drops the only sender of
/// the outbound queue, which closes the queue and stops the writer.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for this connection
    pub id: ClientId,
    /// Display name, unique among registered clients
    pub name: Username,
    /// Hub → writer queue
    sender: mpsc::Sender<Outbound>,
    /// Time the connection was admitted
    pub connected_at: DateTime<Utc>,
}

impl Client {
    /// Create a new client with the given ID, name and queue sender
    pub fn new(id: ClientId, name: Username, sender: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            name,
            sender,
            connected_at: Utc::now(),
        }
    }

    /// Enqueue without waiting
    ///
    /// Fails with `Full` when the writer is not keeping up.
    pub fn try_deliver(&self, msg: &Outbound) -> Result<(), SendError> {
        self.sender
            .try_send(Arc::clone(msg))
            .map_err(|e| match e {
                TrySendError::Full(_) => SendError::Full,
                TrySendError::Closed(_) => SendError::ChannelClosed,
            })
    }

    /// Get the display name for this client
    pub fn display_name(&self) -> &str {
        self.name.as_str()
    }
}

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Handshake and admission in progress
    Connecting,
    /// Accepted by the hub, loops not yet running
    Registered,
    /// Reader and writer running
    Active,
    /// A loop has stopped; unregistering and closing
    Disconnecting,
    /// Both loops exited, socket closed
    Terminated,
}

impl ClientState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_advance_to(self, next: ClientState) -> bool {
        use ClientState::*;
        matches!(
            (self, next),
            (Connecting, Registered)
                | (Connecting, Terminated)
                | (Registered, Active)
                | (Registered, Disconnecting)
                | (Active, Disconnecting)
                | (Disconnecting, Terminated)
        )
    }
}

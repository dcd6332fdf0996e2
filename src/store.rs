//! Message store
//!
//! The hub appends messages best-effort and serves recent history from here.
//! Two implementations: an in-memory ring and a JSON file that mirrors it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::message::Message;

/// Persistence collaborator used by the hub
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one message
    async fn save_message(&self, message: &Message) -> Result<(), StoreError>;

    /// Up to `limit` most recent messages, oldest first
    async fn recent_messages(&self, limit: usize) -> Result<Vec<Message>, StoreError>;
}

/// Bounded history shared by both stores
#[derive(Debug)]
struct Ring {
    messages: VecDeque<Message>,
    retain: usize,
}

impl Ring {
    fn new(retain: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            retain: retain.max(1),
        }
    }

    fn from_messages(messages: Vec<Message>, retain: usize) -> Self {
        let mut ring = Self::new(retain);
        for message in messages {
            ring.push(message);
        }
        ring
    }

    /// Insert in timestamp order, ties keep arrival order
    ///
    /// Messages are stamped before they reach the hub, so arrival order can
    /// lag slightly; the search almost always lands at the back.
    fn push(&mut self, message: Message) {
        let sent_at = message.sent_at();
        let at = self.messages.partition_point(|m| m.sent_at() <= sent_at);
        self.messages.insert(at, message);
        while self.messages.len() > self.retain {
            self.messages.pop_front();
        }
    }

    fn recent(&self, limit: usize) -> Vec<Message> {
        let start = self.messages.len().saturating_sub(limit);
        self.messages.iter().skip(start).cloned().collect()
    }
}

/// In-memory store keeping the most recent `retain` messages
#[derive(Debug)]
pub struct MemoryStore {
    ring: RwLock<Ring>,
}

impl MemoryStore {
    pub fn new(retain: usize) -> Self {
        Self {
            ring: RwLock::new(Ring::new(retain)),
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        self.ring.write().await.push(message.clone());
        Ok(())
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        Ok(self.ring.read().await.recent(limit))
    }
}

/// Store that rewrites a JSON file after every append
///
/// The file holds a JSON array of envelopes and is loaded on open. Each
/// rewrite goes to a sibling `.tmp` file that is then renamed over the
/// original, so the file on disk is always a complete snapshot.
#[derive(Debug)]
pub struct JsonFileStore {
    ring: RwLock<Ring>,
    path: PathBuf,
    tmp_path: PathBuf,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`
    pub async fn open(path: impl AsRef<Path>, retain: usize) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }

        let messages: Vec<Message> = match tokio::fs::read(&path).await {
            Ok(data) if data.is_empty() => Vec::new(),
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(messages) => messages,
                Err(e) => {
                    // History is best-effort; the next save replaces the file
                    warn!(
                        "Ignoring unreadable history in {}: {}",
                        path.display(),
                        e
                    );
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} messages from {}", messages.len(), path.display());

        let mut tmp_path = path.clone().into_os_string();
        tmp_path.push(".tmp");

        Ok(Self {
            ring: RwLock::new(Ring::from_messages(messages, retain)),
            path,
            tmp_path: PathBuf::from(tmp_path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MessageStore for JsonFileStore {
    async fn save_message(&self, message: &Message) -> Result<(), StoreError> {
        // Lock held across the write so the file matches the ring
        let mut ring = self.ring.write().await;
        ring.push(message.clone());
        let data = serde_json::to_vec(&ring.messages)?;
        tokio::fs::write(&self.tmp_path, data).await?;
        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        Ok(())
    }

    async fn recent_messages(&self, limit: usize) -> Result<Vec<Message>, StoreError> {
        Ok(self.ring.read().await.recent(limit))
    }
}

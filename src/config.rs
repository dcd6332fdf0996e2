//! Runtime configuration
//!
//! Defaults suit a single small deployment. Every value can be overridden with
//! a `CHAT_*` environment variable; the bind address can also be given as the
//! first command line argument.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::keepalive::{self, KeepalivePolicy};

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Default outbound queue capacity per client
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default largest accepted inbound frame (512 KiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024;

/// Default number of messages returned for a history request
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Default cap on a text message, in characters
pub const DEFAULT_MAX_CONTENT_CHARS: usize = 2000;

/// Default number of messages a store keeps
pub const DEFAULT_STORE_RETAIN: usize = 1000;

/// Welcome, join notice and presence list sent to every new client
const JOIN_NOTICES: usize = 3;

/// Hub settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Messages returned for history requests and on join
    pub history_limit: usize,
    /// Send recent history to a client right after it registers
    pub history_on_join: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_on_join: true,
        }
    }
}

/// Full server configuration
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub bind_addr: String,
    pub keepalive: KeepalivePolicy,
    pub max_frame_size: usize,
    pub queue_capacity: usize,
    pub max_content_chars: usize,
    pub hub: HubConfig,
    pub store_retain: usize,
    /// JSON file backing the message store; in-memory when unset
    pub store_path: Option<PathBuf>,
    /// HMAC secret for bearer credentials; `?username=` admission when unset
    pub jwt_secret: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_ADDR.to_string(),
            keepalive: KeepalivePolicy::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            hub: HubConfig::default(),
            store_retain: DEFAULT_STORE_RETAIN,
            store_path: None,
            jwt_secret: None,
        }
    }
}

impl ChatConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHAT_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(secs) = parse::<u64, _>(&lookup, "CHAT_IDLE_TIMEOUT_SECS")? {
            config.keepalive = KeepalivePolicy::from_idle_timeout(Duration::from_secs(secs));
        }
        config.keepalive.ping_interval = match parse::<u64, _>(&lookup, "CHAT_PING_INTERVAL_SECS")? {
            Some(secs) => Duration::from_secs(secs),
            None => keepalive::default_ping_interval(config.keepalive.idle_timeout),
        };
        if let Some(secs) = parse::<u64, _>(&lookup, "CHAT_WRITE_TIMEOUT_SECS")? {
            config.keepalive.write_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse(&lookup, "CHAT_MAX_FRAME_BYTES")? {
            config.max_frame_size = bytes;
        }
        if let Some(capacity) = parse(&lookup, "CHAT_QUEUE_CAPACITY")? {
            config.queue_capacity = capacity;
        }
        if let Some(chars) = parse(&lookup, "CHAT_MAX_CONTENT_CHARS")? {
            config.max_content_chars = chars;
        }
        if let Some(limit) = parse(&lookup, "CHAT_HISTORY_LIMIT")? {
            config.hub.history_limit = limit;
        }
        if let Some(on_join) = parse(&lookup, "CHAT_HISTORY_ON_JOIN")? {
            config.hub.history_on_join = on_join;
        }
        if let Some(retain) = parse(&lookup, "CHAT_STORE_RETAIN")? {
            config.store_retain = retain;
        }
        config.store_path = lookup("CHAT_STORE_PATH").map(PathBuf::from);
        config.jwt_secret = lookup("CHAT_JWT_SECRET").filter(|secret| !secret.is_empty());

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.keepalive.validate()?;
        if self.max_frame_size == 0 {
            return Err(ConfigError::Zero("max frame size"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero("queue capacity"));
        }
        if self.max_content_chars == 0 {
            return Err(ConfigError::Zero("max content chars"));
        }
        if self.store_retain == 0 {
            return Err(ConfigError::Zero("store retain"));
        }
        let needed = self.join_burst();
        if self.queue_capacity < needed {
            return Err(ConfigError::QueueTooSmall {
                needed,
                capacity: self.queue_capacity,
            });
        }
        Ok(())
    }

    /// Messages queued for a client before its writer can drain any:
    /// welcome, history when enabled, own join notice and presence list
    pub fn join_burst(&self) -> usize {
        let history = if self.hub.history_on_join {
            self.hub.history_limit
        } else {
            0
        };
        JOIN_NOTICES + history
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

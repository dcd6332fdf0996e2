//! Keepalive timing and peer activity tracking
//!
//! The writer pings on `ping_interval`; the reader gives up after
//! `idle_timeout` without a frame; the writer tears the connection down once
//! the peer has been silent for twice the idle window.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::ConfigError;

/// Default idle window
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default per-write deadline
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Timers enforced by a client actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepalivePolicy {
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
}

impl KeepalivePolicy {
    /// Ping at 9/10 of the idle window
    pub fn from_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            ping_interval: default_ping_interval(idle_timeout),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Silence after which the writer tears the connection down
    pub fn teardown_after(&self) -> Duration {
        self.idle_timeout * 2
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Zero("idle timeout"));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::Zero("ping interval"));
        }
        if self.write_timeout.is_zero() {
            return Err(ConfigError::Zero("write timeout"));
        }
        if self.ping_interval >= self.idle_timeout {
            return Err(ConfigError::PingNotBelowIdle {
                ping: self.ping_interval,
                idle: self.idle_timeout,
            });
        }
        Ok(())
    }
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self::from_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }
}

pub fn default_ping_interval(idle_timeout: Duration) -> Duration {
    idle_timeout * 9 / 10
}

/// Last inbound activity, shared by a client's reader and writer
///
/// The reader touches it on every frame; the writer reads it on each tick.
#[derive(Debug, Clone)]
pub struct Activity {
    origin: Instant,
    last_millis: Arc<AtomicU64>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record inbound activity now
    pub fn touch(&self) {
        let millis = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_millis.store(millis, Ordering::Relaxed);
    }

    /// Time since the last recorded activity
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_millis.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

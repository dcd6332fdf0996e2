//! Basic type definitions for the chat hub
//!
//! Provides newtype wrappers for type safety:
//! - `ClientId`: UUID-based unique connection identifier
//! - `Username`: validated display name

use uuid::Uuid;

use crate::error::AdmissionError;

/// Unique client identifier (newtype pattern)
///
/// Wraps a UUID v4 for type-safe client identification.
/// Implements Hash and Eq for use as HashMap keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Display name (3-20 letters, digits or underscores)
///
/// Uniqueness is enforced by the hub, not here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    pub const MIN_LEN: usize = 3;
    pub const MAX_LEN: usize = 20;

    /// Trim and validate a raw display name
    pub fn parse(raw: &str) -> Result<Self, AdmissionError> {
        let name = raw.trim();
        let len = name.chars().count();
        let well_formed = (Self::MIN_LEN..=Self::MAX_LEN).contains(&len)
            && name.chars().all(|c| c.is_alphanumeric() || c == '_');

        if well_formed {
            Ok(Self(name.to_string()))
        } else {
            Err(AdmissionError::InvalidUsername(name.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Username {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

//! Common types used throughout Lockbox.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum encoded length of a slot identifier (stored behind a `u8` length).
pub const MAX_SLOT_ID_LENGTH: usize = 255;

/// Identifier of a key slot inside a vault container.
///
/// Slot ids are opaque and never carry the identity label in the clear;
/// new slots get a random UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(String);

impl SlotId {
    /// Create a SlotId from a string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty and at most `MAX_SLOT_ID_LENGTH` bytes
    ///
    /// # Errors
    /// - Returns error if id is empty or too long
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "SlotId cannot be empty".to_string(),
            ));
        }
        if id.len() > MAX_SLOT_ID_LENGTH {
            return Err(crate::Error::InvalidInput(format!(
                "SlotId exceeds {} bytes",
                MAX_SLOT_ID_LENGTH
            )));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random slot id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sensitive data wrapper that zeroizes on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, PartialEq, Eq)]
pub struct SensitiveBytes(Vec<u8>);

impl SensitiveBytes {
    /// Create new sensitive bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Copy a borrowed slice into a zeroizing buffer.
    pub fn from_slice(data: &[u8]) -> Self {
        Self(data.to_vec())
    }

    /// Get a reference to the inner bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Get the length.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for SensitiveBytes {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl fmt::Debug for SensitiveBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveBytes([REDACTED; {} bytes])", self.0.len())
    }
}

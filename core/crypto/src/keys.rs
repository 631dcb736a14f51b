//! Key types with secure memory handling.
//!
//! All key types automatically zeroize their memory on drop to prevent
//! sensitive data from persisting in memory.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use lockbox_common::{Error, Result};

/// Length of encryption keys in bytes (256-bit).
pub const KEY_LENGTH: usize = 32;

/// Length of freshly generated salts.
pub const SALT_LENGTH: usize = 32;

/// Shortest salt accepted by the KDF.
pub const MIN_SALT_LENGTH: usize = 16;

/// Longest salt a container can record (`u8` length prefix keeps it small).
pub const MAX_SALT_LENGTH: usize = 64;

/// Fill a fixed-size array from the operating system CSPRNG.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Data encryption key.
///
/// Exactly one exists per vault. It encrypts the payload and is only ever
/// stored wrapped under a key encryption key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DataKey {
    key: [u8; KEY_LENGTH],
}

impl DataKey {
    /// Create a data key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    ///
    /// # Security
    /// The returned slice should be used immediately and not stored.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Generate a random data key.
    pub fn generate() -> Self {
        Self {
            key: random_array(),
        }
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataKey([REDACTED])")
    }
}

/// Key encryption key derived from an authentication factor.
///
/// Never persisted. Lives for one derive-then-wrap or derive-then-unwrap.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyEncryptionKey {
    key: [u8; KEY_LENGTH],
}

impl KeyEncryptionKey {
    /// Create a key encryption key from raw bytes.
    pub fn from_bytes(key: [u8; KEY_LENGTH]) -> Self {
        Self { key }
    }

    /// Get the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.key
    }

    /// Reinterpret this KEK as a payload key.
    ///
    /// Version 1 containers have no wrapped key: the password-derived key
    /// encrypts the body directly.
    pub fn into_data_key(self) -> DataKey {
        DataKey::from_bytes(self.key)
    }
}

impl fmt::Debug for KeyEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyEncryptionKey([REDACTED])")
    }
}

/// Salt for key derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Salt(Vec<u8>);

impl Salt {
    /// Generate a random salt of `SALT_LENGTH` bytes.
    pub fn generate() -> Self {
        Self(random_array::<SALT_LENGTH>().to_vec())
    }

    /// Create from bytes.
    ///
    /// # Errors
    /// - Returns error if the salt is shorter than `MIN_SALT_LENGTH`
    ///   or longer than `MAX_SALT_LENGTH`
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_SALT_LENGTH {
            return Err(Error::InvalidInput(format!(
                "Salt must be at least {} bytes, got {}",
                MIN_SALT_LENGTH,
                bytes.len()
            )));
        }
        if bytes.len() > MAX_SALT_LENGTH {
            return Err(Error::InvalidInput(format!(
                "Salt must be at most {} bytes, got {}",
                MAX_SALT_LENGTH,
                bytes.len()
            )));
        }
        Ok(Self(bytes.to_vec()))
    }

    /// Get the salt bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_key_generate() {
        let key1 = DataKey::generate();
        let key2 = DataKey::generate();

        // Random keys should be different
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_salt_generate() {
        let salt1 = Salt::generate();
        let salt2 = Salt::generate();

        assert_eq!(salt1.as_bytes().len(), SALT_LENGTH);
        assert_ne!(salt1.as_bytes(), salt2.as_bytes());
    }

    #[test]
    fn test_salt_length_bounds() {
        assert!(Salt::from_bytes(&[0u8; 15]).is_err());
        assert!(Salt::from_bytes(&[0u8; 16]).is_ok());
        assert!(Salt::from_bytes(&[0u8; 64]).is_ok());
        assert!(Salt::from_bytes(&[0u8; 65]).is_err());
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let key = DataKey::from_bytes([0xAB; KEY_LENGTH]);
        assert_eq!(format!("{:?}", key), "DataKey([REDACTED])");

        let kek = KeyEncryptionKey::from_bytes([0xAB; KEY_LENGTH]);
        assert_eq!(format!("{:?}", kek), "KeyEncryptionKey([REDACTED])");
    }
}

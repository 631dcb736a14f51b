//! Device transport trait definition.
//!
//! The adapter owns all sequencing, validation and timing; a transport only
//! moves bytes to and from one kind of device.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::algorithm::{ChallengeAlgorithm, CHALLENGE_BLOCK_SIZE};
use lockbox_common::{Error, Result, SensitiveBytes};

/// Description of a connected security key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device serial number.
    pub serial: String,
    /// Product name.
    pub product: String,
    /// Firmware version string.
    pub firmware: String,
    /// Algorithms the device itself can compute.
    pub algorithms: Vec<ChallengeAlgorithm>,
}

/// Opaque handle naming one enrolled credential on a device.
///
/// The handle carries no key material; it only tells the device which
/// credential should answer a challenge.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CredentialHandle(Vec<u8>);

impl CredentialHandle {
    /// Wrap raw handle bytes.
    ///
    /// # Errors
    /// - Returns error if the handle is empty
    pub fn new(bytes: Vec<u8>) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput(
                "Credential handle cannot be empty".to_string(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Raw handle bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode for storage in slot metadata.
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    /// Decode a stored handle.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::Serialization(format!("Invalid credential handle: {}", e)))?;
        Self::new(bytes)
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CredentialHandle({} bytes)", self.0.len())
    }
}

impl Serialize for CredentialHandle {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for CredentialHandle {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        Self::from_base64(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Transport to a family of challenge-response devices.
///
/// Calls may block for tens of seconds waiting for a touch. Transports that
/// wrap a blocking driver should run it on `tokio::task::spawn_blocking`.
/// The adapter may drop an in-flight future on timeout or cancellation, so
/// implementations must commit credential state only once a call has
/// completed.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Transport name for logs (e.g., "fido2-hid", "software").
    fn name(&self) -> &str;

    /// List connected devices.
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    /// Create a new credential for `identity`.
    ///
    /// # Preconditions
    /// - The PIN has already been validated for length
    ///
    /// # Errors
    /// - `WrongPin`, `PinLocked`, `Transport`
    async fn make_credential(
        &self,
        device: &DeviceInfo,
        identity: &str,
        pin: &str,
    ) -> Result<CredentialHandle>;

    /// Compute the device's HMAC over a padded challenge.
    ///
    /// # Errors
    /// - `WrongPin`, `PinLocked`, `CredentialNotFound`, `Transport`
    async fn challenge_response(
        &self,
        device: &DeviceInfo,
        credential: &CredentialHandle,
        pin: &str,
        algorithm: ChallengeAlgorithm,
        challenge: &[u8; CHALLENGE_BLOCK_SIZE],
    ) -> Result<SensitiveBytes>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_handle_base64_roundtrip() {
        let handle = CredentialHandle::new(vec![1, 2, 3, 250]).unwrap();
        let decoded = CredentialHandle::from_base64(&handle.to_base64()).unwrap();
        assert_eq!(handle, decoded);
    }

    #[test]
    fn test_credential_handle_rejects_empty() {
        assert!(CredentialHandle::new(Vec::new()).is_err());
        assert!(CredentialHandle::from_base64("").is_err());
        assert!(CredentialHandle::from_base64("not base64!").is_err());
    }
}

//! Key slots and authentication factors.
//!
//! A key slot holds the data key wrapped under one user's factor. Its
//! metadata (role, identity hash, hardware binding) travels as JSON in the
//! container header next to the wrapped key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroizing;

use lockbox_common::{Error, Result, SlotId};
use lockbox_crypto::{IdentityHashRecord, KdfAlgorithm, KdfParams, Salt, WrappedKey};
use lockbox_hardware::{ChallengeAlgorithm, CredentialHandle};
use lockbox_storage::SlotRecord;

/// Length of the per-slot hardware challenge.
pub const HARDWARE_CHALLENGE_LENGTH: usize = 32;

/// Permission level of a slot's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotRole {
    /// May add, remove and rotate factors.
    Administrator,
    /// May read and edit records and change their own password.
    Standard,
}

impl SlotRole {
    /// Whether this role may manage slots and rotate keys.
    pub fn is_admin(self) -> bool {
        self == Self::Administrator
    }
}

impl fmt::Display for SlotRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Administrator => write!(f, "administrator"),
            Self::Standard => write!(f, "standard"),
        }
    }
}

/// Hardware credential bound to a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareBinding {
    /// Device credential that answers the challenge.
    pub credential: CredentialHandle,
    /// Fixed challenge sent on every unlock.
    pub challenge: [u8; HARDWARE_CHALLENGE_LENGTH],
    /// HMAC family.
    pub algorithm: ChallengeAlgorithm,
    /// Serial of the enrolling device, for display.
    pub device_serial: String,
    /// Enrollment time.
    pub enrolled_at: DateTime<Utc>,
}

/// Auxiliary slot data stored alongside the wrapped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotMetadata {
    /// Permission level.
    pub role: SlotRole,
    /// Salted hash of the owner's username.
    pub identity: Option<IdentityHashRecord>,
    /// Hardware credential, if the slot needs one.
    #[serde(default)]
    pub hardware: Option<HardwareBinding>,
    /// Slot creation time.
    pub created_at: DateTime<Utc>,
}

impl SlotMetadata {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Corrupted(format!("Invalid slot metadata: {}", e)))
    }
}

/// One unlock path to the data key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySlot {
    pub id: SlotId,
    pub kdf: KdfAlgorithm,
    pub params: KdfParams,
    pub salt: Salt,
    pub wrapped_key: WrappedKey,
    pub metadata: SlotMetadata,
}

impl KeySlot {
    pub fn role(&self) -> SlotRole {
        self.metadata.role
    }

    pub fn hardware(&self) -> Option<&HardwareBinding> {
        self.metadata.hardware.as_ref()
    }

    /// Convert to the on-disk record.
    pub fn to_record(&self) -> Result<SlotRecord> {
        Ok(SlotRecord {
            slot_id: self.id.as_str().to_string(),
            kdf_algorithm: self.kdf.id(),
            pbkdf2_iterations: self.params.pbkdf2_iterations,
            argon2_memory_kib: self.params.memory_cost,
            argon2_time_cost: self.params.time_cost,
            argon2_parallelism: self.params.parallelism,
            salt: self.salt.as_bytes().to_vec(),
            wrapped_key: self.wrapped_key.as_bytes().to_vec(),
            metadata: self.metadata.to_bytes()?,
        })
    }

    /// Parse an on-disk record.
    ///
    /// # Errors
    /// - `UnsupportedAlgorithm` for an unknown KDF id
    /// - `Corrupted` for a bad salt, wrapped key or metadata
    pub fn from_record(record: &SlotRecord) -> Result<Self> {
        let kdf = KdfAlgorithm::from_id(record.kdf_algorithm)?;
        let params = KdfParams {
            pbkdf2_iterations: record.pbkdf2_iterations,
            memory_cost: record.argon2_memory_kib,
            time_cost: record.argon2_time_cost,
            parallelism: record.argon2_parallelism,
        };
        let salt = Salt::from_bytes(&record.salt)
            .map_err(|e| Error::Corrupted(format!("Slot {}: {}", record.slot_id, e)))?;
        let wrapped_key = WrappedKey::from_slice(&record.wrapped_key).map_err(|_| {
            Error::Corrupted(format!("Slot {}: wrapped key has wrong length", record.slot_id))
        })?;

        Ok(Self {
            id: SlotId::new(record.slot_id.clone())?,
            kdf,
            params,
            salt,
            wrapped_key,
            metadata: SlotMetadata::from_bytes(&record.metadata)?,
        })
    }
}

/// Secret material a user presents to unlock or enroll a slot.
#[derive(Clone)]
pub struct Factor {
    password: Zeroizing<Vec<u8>>,
    pin: Option<Zeroizing<String>>,
}

impl Factor {
    /// Password-only factor.
    pub fn password(password: impl AsRef<[u8]>) -> Self {
        Self {
            password: Zeroizing::new(password.as_ref().to_vec()),
            pin: None,
        }
    }

    /// Add a hardware key PIN.
    ///
    /// On enrollment this makes the new slot hardware-bound; on unlock it
    /// is sent to the device of a hardware-bound slot.
    pub fn with_pin(mut self, pin: impl Into<String>) -> Self {
        self.pin = Some(Zeroizing::new(pin.into()));
        self
    }

    pub fn password_bytes(&self) -> &[u8] {
        &self.password
    }

    pub fn pin(&self) -> Option<&str> {
        self.pin.as_deref().map(String::as_str)
    }

    pub fn has_hardware(&self) -> bool {
        self.pin.is_some()
    }
}

impl fmt::Debug for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Factor([REDACTED], hardware: {})", self.pin.is_some())
    }
}

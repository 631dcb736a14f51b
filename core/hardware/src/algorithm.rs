//! Challenge-response algorithm identifiers.

use serde::{Deserialize, Serialize};

use lockbox_common::{HardwareError, Result};

/// Fixed challenge block size. Shorter challenges are zero-padded to it.
pub const CHALLENGE_BLOCK_SIZE: usize = 64;

/// HMAC family used by the device to answer a challenge.
///
/// Only `HmacSha256` is implemented by the adapter; the other identifiers
/// are reserved so containers written by newer builds still parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChallengeAlgorithm {
    /// HMAC-SHA1, 20-byte response. Reserved.
    HmacSha1 = 0x01,
    /// HMAC-SHA256, 32-byte response.
    HmacSha256 = 0x02,
    /// HMAC-SHA512, 64-byte response. Reserved.
    HmacSha512 = 0x03,
    /// HMAC-SHA3-256, 32-byte response. Reserved.
    HmacSha3_256 = 0x10,
    /// HMAC-SHA3-512, 64-byte response. Reserved.
    HmacSha3_512 = 0x11,
}

impl ChallengeAlgorithm {
    /// Identifier stored in slot metadata.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Resolve a stored identifier.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(Self::HmacSha1),
            0x02 => Ok(Self::HmacSha256),
            0x03 => Ok(Self::HmacSha512),
            0x10 => Ok(Self::HmacSha3_256),
            0x11 => Ok(Self::HmacSha3_512),
            other => Err(HardwareError::UnsupportedAlgorithm(format!("id 0x{:02x}", other)).into()),
        }
    }

    /// Response length in bytes.
    pub fn response_size(self) -> usize {
        match self {
            Self::HmacSha1 => 20,
            Self::HmacSha256 | Self::HmacSha3_256 => 32,
            Self::HmacSha512 | Self::HmacSha3_512 => 64,
        }
    }

    /// Whether the adapter can drive this algorithm today.
    pub fn is_supported(self) -> bool {
        matches!(self, Self::HmacSha256)
    }

    /// Fail with `UnsupportedAlgorithm` unless the adapter supports `self`.
    pub fn ensure_supported(self) -> Result<()> {
        if self.is_supported() {
            Ok(())
        } else {
            Err(HardwareError::UnsupportedAlgorithm(format!("{:?}", self)).into())
        }
    }
}

impl Default for ChallengeAlgorithm {
    fn default() -> Self {
        Self::HmacSha256
    }
}

//! Algorithm policy shared by the crypto services.

use serde::{Deserialize, Serialize};

/// Policy applied to algorithm selection.
///
/// In restricted mode only standards-approved constructions may be used:
/// PBKDF2-HMAC-SHA256 for key derivation, the SHA-3 family and PBKDF2 for
/// identity hashing, and AES-256-GCM for the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoPolicy {
    /// Reject algorithms outside the approved set.
    pub restricted: bool,
}

impl CryptoPolicy {
    /// Policy with every supported algorithm allowed.
    pub const fn permissive() -> Self {
        Self { restricted: false }
    }

    /// Policy limited to approved algorithms.
    pub const fn restricted() -> Self {
        Self { restricted: true }
    }
}

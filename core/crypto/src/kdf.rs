//! Key derivation from passwords.
//!
//! Two constructions are available: PBKDF2-HMAC-SHA256, a work-factor
//! tunable iterative HMAC, and Argon2id, a memory-hard function that
//! resists GPU and time-memory trade-off attacks. Restricted mode allows
//! only the former.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;

use crate::keys::{KeyEncryptionKey, Salt, KEY_LENGTH, MIN_SALT_LENGTH};
use crate::policy::CryptoPolicy;
use lockbox_common::{Error, Result};

/// Fewest PBKDF2 iterations accepted.
pub const MIN_PBKDF2_ITERATIONS: u32 = 1_000;
/// Most PBKDF2 iterations accepted.
pub const MAX_PBKDF2_ITERATIONS: u32 = 10_000_000;
/// Default PBKDF2 iteration count.
pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 600_000;

/// Smallest Argon2id memory cost in KiB (8 MiB).
pub const MIN_ARGON2_MEMORY_KIB: u32 = 8_192;
/// Largest Argon2id memory cost in KiB (1 GiB).
pub const MAX_ARGON2_MEMORY_KIB: u32 = 1_048_576;
/// Argon2id time cost bounds.
pub const ARGON2_TIME_COST_RANGE: std::ops::RangeInclusive<u32> = 1..=10;
/// Argon2id parallelism bounds.
pub const ARGON2_PARALLELISM_RANGE: std::ops::RangeInclusive<u32> = 1..=16;

/// Key derivation algorithm.
///
/// Discriminants are the identifiers written into key slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum KdfAlgorithm {
    /// PBKDF2 with HMAC-SHA256.
    Pbkdf2HmacSha256 = 0x04,
    /// Argon2id, version 0x13.
    Argon2id = 0x05,
}

impl KdfAlgorithm {
    /// Identifier stored in containers.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Resolve a stored identifier.
    ///
    /// # Errors
    /// - Returns `UnsupportedAlgorithm` for any other byte
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x04 => Ok(Self::Pbkdf2HmacSha256),
            0x05 => Ok(Self::Argon2id),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "KDF id 0x{:02x}",
                other
            ))),
        }
    }

    /// Parse a user-facing label such as `"pbkdf2"` or `"argon2id"`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "pbkdf2" | "pbkdf2-sha256" | "pbkdf2-hmac-sha256" => Some(Self::Pbkdf2HmacSha256),
            "argon2" | "argon2id" => Some(Self::Argon2id),
            _ => None,
        }
    }

    /// Canonical label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pbkdf2HmacSha256 => "pbkdf2-hmac-sha256",
            Self::Argon2id => "argon2id",
        }
    }

    /// Whether the algorithm may be used in restricted mode.
    pub fn is_approved(self) -> bool {
        matches!(self, Self::Pbkdf2HmacSha256)
    }
}

/// Tunable KDF parameters.
///
/// Only the fields for the chosen algorithm are consulted; all of them are
/// stored so a slot can be re-derived without outside knowledge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// PBKDF2 iteration count.
    pub pbkdf2_iterations: u32,
    /// Argon2id memory cost in KiB (e.g., 65536 = 64 MiB).
    pub memory_cost: u32,
    /// Argon2id number of passes.
    pub time_cost: u32,
    /// Argon2id degree of parallelism.
    pub parallelism: u32,
}

impl KdfParams {
    /// Create parameters suitable for interactive use.
    ///
    /// These parameters provide a balance between security and usability,
    /// targeting approximately 0.5-1 second of derivation time.
    pub fn interactive() -> Self {
        Self {
            pbkdf2_iterations: DEFAULT_PBKDF2_ITERATIONS,
            memory_cost: 65536, // 64 MiB
            time_cost: 3,
            parallelism: 4,
        }
    }

    /// Create parameters suitable for sensitive data.
    ///
    /// Higher security parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self {
            pbkdf2_iterations: 1_200_000,
            memory_cost: 262144, // 256 MiB
            time_cost: 4,
            parallelism: 4,
        }
    }

    /// Create moderate parameters for constrained devices.
    pub fn moderate() -> Self {
        Self {
            pbkdf2_iterations: 310_000,
            memory_cost: 32768, // 32 MiB
            time_cost: 3,
            parallelism: 2,
        }
    }

    /// Check that the parameters relevant to `algorithm` are within bounds.
    ///
    /// # Errors
    /// - Returns `InvalidInput` naming the offending parameter
    pub fn validate(&self, algorithm: KdfAlgorithm) -> Result<()> {
        match algorithm {
            KdfAlgorithm::Pbkdf2HmacSha256 => {
                if !(MIN_PBKDF2_ITERATIONS..=MAX_PBKDF2_ITERATIONS)
                    .contains(&self.pbkdf2_iterations)
                {
                    return Err(Error::InvalidInput(format!(
                        "PBKDF2 iterations must be within {}..={}, got {}",
                        MIN_PBKDF2_ITERATIONS, MAX_PBKDF2_ITERATIONS, self.pbkdf2_iterations
                    )));
                }
            }
            KdfAlgorithm::Argon2id => {
                if !(MIN_ARGON2_MEMORY_KIB..=MAX_ARGON2_MEMORY_KIB).contains(&self.memory_cost) {
                    return Err(Error::InvalidInput(format!(
                        "Argon2id memory cost must be within {}..={} KiB, got {}",
                        MIN_ARGON2_MEMORY_KIB, MAX_ARGON2_MEMORY_KIB, self.memory_cost
                    )));
                }
                if !ARGON2_TIME_COST_RANGE.contains(&self.time_cost) {
                    return Err(Error::InvalidInput(format!(
                        "Argon2id time cost must be within 1..=10, got {}",
                        self.time_cost
                    )));
                }
                if !ARGON2_PARALLELISM_RANGE.contains(&self.parallelism) {
                    return Err(Error::InvalidInput(format!(
                        "Argon2id parallelism must be within 1..=16, got {}",
                        self.parallelism
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Pick the KDF for a caller's request under `policy`.
///
/// - No request, or an empty one, yields PBKDF2-HMAC-SHA256.
/// - An explicit request for Argon2id in restricted mode is rejected.
/// - An unrecognized label falls back to PBKDF2-HMAC-SHA256 with a warning.
///
/// # Errors
/// - Returns `NotPermitted` for Argon2id under restricted mode
pub fn select_kdf(requested: Option<&str>, policy: CryptoPolicy) -> Result<KdfAlgorithm> {
    let label = match requested.map(str::trim) {
        Some(label) if !label.is_empty() => label,
        _ => return Ok(KdfAlgorithm::Pbkdf2HmacSha256),
    };

    match KdfAlgorithm::from_label(label) {
        Some(algorithm) if policy.restricted && !algorithm.is_approved() => Err(
            Error::NotPermitted(format!("{} is disabled in restricted mode", algorithm.label())),
        ),
        Some(algorithm) => Ok(algorithm),
        None => {
            warn!(
                requested = label,
                restricted = policy.restricted,
                "Requested KDF is not approved, using PBKDF2-HMAC-SHA256"
            );
            Ok(KdfAlgorithm::Pbkdf2HmacSha256)
        }
    }
}

/// Derive a key encryption key from a secret.
///
/// # Preconditions
/// - `secret` must not be empty
/// - `salt` is at least 16 bytes (guaranteed by `Salt`)
/// - `params` must be within bounds for `algorithm`
///
/// # Postconditions
/// - Returns a 32-byte key that is deterministic given the same inputs
///
/// # Errors
/// - `InvalidInput` for an empty secret or out-of-range parameters
/// - `NotPermitted` for Argon2id under restricted mode
/// - `Crypto` if the primitive itself fails
///
/// # Security
/// - The secret is treated as raw bytes and never logged
pub fn derive_key(
    secret: &[u8],
    algorithm: KdfAlgorithm,
    salt: &Salt,
    params: &KdfParams,
    policy: CryptoPolicy,
) -> Result<KeyEncryptionKey> {
    if secret.is_empty() {
        return Err(Error::InvalidInput("Secret cannot be empty".to_string()));
    }
    if salt.as_bytes().len() < MIN_SALT_LENGTH {
        return Err(Error::InvalidInput(format!(
            "Salt must be at least {} bytes",
            MIN_SALT_LENGTH
        )));
    }
    if policy.restricted && !algorithm.is_approved() {
        return Err(Error::NotPermitted(format!(
            "{} is disabled in restricted mode",
            algorithm.label()
        )));
    }
    params.validate(algorithm)?;

    let mut key_bytes = [0u8; KEY_LENGTH];
    match algorithm {
        KdfAlgorithm::Pbkdf2HmacSha256 => {
            pbkdf2::pbkdf2_hmac::<Sha256>(
                secret,
                salt.as_bytes(),
                params.pbkdf2_iterations,
                &mut key_bytes,
            );
        }
        KdfAlgorithm::Argon2id => {
            let argon2_params = Params::new(
                params.memory_cost,
                params.time_cost,
                params.parallelism,
                Some(KEY_LENGTH),
            )
            .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))?;

            Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params)
                .hash_password_into(secret, salt.as_bytes(), &mut key_bytes)
                .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;
        }
    }

    Ok(KeyEncryptionKey::from_bytes(key_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN: CryptoPolicy = CryptoPolicy::permissive();
    const PBKDF2: KdfAlgorithm = KdfAlgorithm::Pbkdf2HmacSha256;

    fn fast_params() -> KdfParams {
        KdfParams {
            pbkdf2_iterations: MIN_PBKDF2_ITERATIONS,
            memory_cost: MIN_ARGON2_MEMORY_KIB,
            time_cost: 1,
            parallelism: 1,
        }
    }

    fn salt(byte: u8) -> Salt {
        Salt::from_bytes(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_derive_key_deterministic() {
        for algorithm in [KdfAlgorithm::Pbkdf2HmacSha256, KdfAlgorithm::Argon2id] {
            let params = fast_params();
            let key1 = derive_key(b"password-123", algorithm, &salt(42), &params, OPEN).unwrap();
            let key2 = derive_key(b"password-123", algorithm, &salt(42), &params, OPEN).unwrap();
            assert_eq!(key1.as_bytes(), key2.as_bytes());
        }
    }

    #[test]
    fn test_derive_key_different_salt() {
        let params = fast_params();
        let key1 = derive_key(b"pw", PBKDF2, &salt(1), &params, OPEN).unwrap();
        let key2 = derive_key(b"pw", PBKDF2, &salt(2), &params, OPEN).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_algorithms_produce_different_keys() {
        let params = fast_params();
        let pbkdf2 = derive_key(b"pw", PBKDF2, &salt(7), &params, OPEN).unwrap();
        let argon2 = derive_key(b"pw", KdfAlgorithm::Argon2id, &salt(7), &params, OPEN).unwrap();
        assert_ne!(pbkdf2.as_bytes(), argon2.as_bytes());
    }

    #[test]
    fn test_pbkdf2_matches_reference() {
        let params = fast_params();
        let a = derive_key(b"password", PBKDF2, &salt(0), &params, OPEN).unwrap();
        let mut expected = [0u8; KEY_LENGTH];
        pbkdf2::pbkdf2_hmac::<Sha256>(b"password", &[0u8; 32], 1_000, &mut expected);
        assert_eq!(a.as_bytes(), &expected);
    }

    #[test]
    fn test_derive_key_empty_secret_fails() {
        let result = derive_key(b"", PBKDF2, &Salt::generate(), &fast_params(), OPEN);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_non_utf8_secret_accepted() {
        let secret = [0xff, 0xfe, 0x00, 0xc3];
        assert!(derive_key(&secret, PBKDF2, &salt(3), &fast_params(), OPEN).is_ok());
    }

    #[test]
    fn test_parameter_bounds_rejected() {
        let mut params = fast_params();
        params.pbkdf2_iterations = 999;
        assert!(matches!(
            derive_key(b"pw", PBKDF2, &salt(1), &params, OPEN),
            Err(Error::InvalidInput(_))
        ));

        let mut params = fast_params();
        params.memory_cost = MIN_ARGON2_MEMORY_KIB - 1;
        assert!(matches!(
            derive_key(b"pw", KdfAlgorithm::Argon2id, &salt(1), &params, OPEN),
            Err(Error::InvalidInput(_))
        ));

        let mut params = fast_params();
        params.parallelism = 0;
        assert!(params.validate(KdfAlgorithm::Argon2id).is_err());
        // PBKDF2 ignores the Argon2id fields
        assert!(params.validate(KdfAlgorithm::Pbkdf2HmacSha256).is_ok());
    }

    #[test]
    fn test_restricted_mode_rejects_argon2id() {
        let restricted = CryptoPolicy::restricted();
        let params = fast_params();
        let result = derive_key(b"pw", KdfAlgorithm::Argon2id, &salt(1), &params, restricted);
        assert!(matches!(result, Err(Error::NotPermitted(_))));

        assert!(matches!(
            select_kdf(Some("argon2id"), CryptoPolicy::restricted()),
            Err(Error::NotPermitted(_))
        ));
    }

    #[test]
    fn test_restricted_mode_defaults_to_pbkdf2() {
        let policy = CryptoPolicy::restricted();
        assert_eq!(select_kdf(None, policy).unwrap(), KdfAlgorithm::Pbkdf2HmacSha256);
        assert_eq!(select_kdf(Some(""), policy).unwrap(), KdfAlgorithm::Pbkdf2HmacSha256);
        assert_eq!(select_kdf(Some("sha3-512"), policy).unwrap(), KdfAlgorithm::Pbkdf2HmacSha256);
    }

    #[test]
    fn test_select_kdf_permissive() {
        let policy = CryptoPolicy::permissive();
        assert_eq!(select_kdf(Some("Argon2id"), policy).unwrap(), KdfAlgorithm::Argon2id);
        assert_eq!(select_kdf(Some("pbkdf2"), policy).unwrap(), KdfAlgorithm::Pbkdf2HmacSha256);
        assert_eq!(select_kdf(Some("bcrypt"), policy).unwrap(), KdfAlgorithm::Pbkdf2HmacSha256);
    }

    #[test]
    fn test_algorithm_ids() {
        assert_eq!(KdfAlgorithm::from_id(0x04).unwrap(), KdfAlgorithm::Pbkdf2HmacSha256);
        assert_eq!(KdfAlgorithm::from_id(0x05).unwrap(), KdfAlgorithm::Argon2id);
        assert!(matches!(KdfAlgorithm::from_id(0x01), Err(Error::UnsupportedAlgorithm(_))));
    }
}

//! Salted identity-label hashing.
//!
//! Usernames are stored as salted digests so a container never reveals who
//! may unlock it. This service shares no key material with the KDF; its
//! output is only ever compared, never used as a key.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sha3::{Digest, Sha3_256, Sha3_384, Sha3_512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::keys::random_array;
use crate::policy::CryptoPolicy;
use lockbox_common::{Error, Result};

/// Salt length for identity hashes.
pub const LABEL_SALT_LENGTH: usize = 16;

/// Memory cost used by the Argon2id label hash (64 MiB).
pub const LABEL_ARGON2_MEMORY_KIB: u32 = 65_536;

/// Time cost used by the Argon2id label hash. The iteration argument is ignored.
pub const LABEL_ARGON2_TIME_COST: u32 = 3;

/// PBKDF2 floor for label hashing; lower requests are raised to it.
const LABEL_PBKDF2_MIN_ITERATIONS: u32 = 1_000;

/// Identity-label hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum HashAlgorithm {
    /// Label stored as-is. Insecure; only kept so old containers can be read.
    PlaintextLegacy = 0x00,
    /// SHA3-256 over label and salt.
    Sha3_256 = 0x01,
    /// SHA3-384 over label and salt.
    Sha3_384 = 0x02,
    /// SHA3-512 over label and salt.
    Sha3_512 = 0x03,
    /// PBKDF2-HMAC-SHA256 with a tunable iteration count.
    Pbkdf2Sha256 = 0x04,
    /// Argon2id with fixed 64 MiB memory and time cost 3.
    Argon2id = 0x05,
}

impl HashAlgorithm {
    /// Identifier stored in containers.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Resolve a stored identifier.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x00 => Ok(Self::PlaintextLegacy),
            0x01 => Ok(Self::Sha3_256),
            0x02 => Ok(Self::Sha3_384),
            0x03 => Ok(Self::Sha3_512),
            0x04 => Ok(Self::Pbkdf2Sha256),
            0x05 => Ok(Self::Argon2id),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "hash id 0x{:02x}",
                other
            ))),
        }
    }

    /// Digest size in bytes, or `None` for the passthrough variant whose
    /// output is as long as the label.
    pub fn digest_size(self) -> Option<usize> {
        match self {
            Self::PlaintextLegacy => None,
            Self::Sha3_256 | Self::Pbkdf2Sha256 | Self::Argon2id => Some(32),
            Self::Sha3_384 => Some(48),
            Self::Sha3_512 => Some(64),
        }
    }

    /// Whether the iteration argument affects the digest.
    pub fn uses_iterations(self) -> bool {
        matches!(self, Self::Pbkdf2Sha256)
    }

    /// Whether the algorithm may be used in restricted mode.
    pub fn is_approved(self) -> bool {
        !matches!(self, Self::Argon2id)
    }
}

/// Hash an identity label.
///
/// The digest covers `label || salt`.
///
/// # Errors
/// - `InvalidInput` if the label is empty
/// - `NotPermitted` for Argon2id under restricted mode
/// - `Crypto` if the underlying primitive fails
pub fn hash_label(
    label: &[u8],
    algorithm: HashAlgorithm,
    salt: &[u8; LABEL_SALT_LENGTH],
    iterations: u32,
    policy: CryptoPolicy,
) -> Result<Zeroizing<Vec<u8>>> {
    if label.is_empty() {
        return Err(Error::InvalidInput("Identity label cannot be empty".to_string()));
    }
    if policy.restricted && !algorithm.is_approved() {
        return Err(Error::NotPermitted(format!(
            "{:?} label hashing is disabled in restricted mode",
            algorithm
        )));
    }

    let digest = match algorithm {
        HashAlgorithm::PlaintextLegacy => label.to_vec(),
        HashAlgorithm::Sha3_256 => sha3_digest::<Sha3_256>(label, salt),
        HashAlgorithm::Sha3_384 => sha3_digest::<Sha3_384>(label, salt),
        HashAlgorithm::Sha3_512 => sha3_digest::<Sha3_512>(label, salt),
        HashAlgorithm::Pbkdf2Sha256 => {
            let mut out = vec![0u8; 32];
            pbkdf2::pbkdf2_hmac::<Sha256>(
                label,
                salt,
                iterations.max(LABEL_PBKDF2_MIN_ITERATIONS),
                &mut out,
            );
            out
        }
        HashAlgorithm::Argon2id => {
            let params = Params::new(LABEL_ARGON2_MEMORY_KIB, LABEL_ARGON2_TIME_COST, 1, Some(32))
                .map_err(|e| Error::Crypto(format!("Invalid Argon2id parameters: {}", e)))?;
            let mut out = vec![0u8; 32];
            Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
                .hash_password_into(label, salt, &mut out)
                .map_err(|e| Error::Crypto(format!("Label hashing failed: {}", e)))?;
            out
        }
    };

    Ok(Zeroizing::new(digest))
}

fn sha3_digest<D: Digest>(label: &[u8], salt: &[u8]) -> Vec<u8> {
    let mut hasher = D::new();
    hasher.update(label);
    hasher.update(salt);
    hasher.finalize().to_vec()
}

/// Verify an identity label against a stored digest.
///
/// Returns `false` on any failure, including a digest whose length does not
/// match the algorithm, so callers cannot distinguish error paths.
pub fn verify_label(
    label: &[u8],
    expected: &[u8],
    algorithm: HashAlgorithm,
    salt: &[u8; LABEL_SALT_LENGTH],
    iterations: u32,
    policy: CryptoPolicy,
) -> bool {
    if let Some(size) = algorithm.digest_size() {
        if expected.len() != size {
            return false;
        }
    }

    let computed = match hash_label(label, algorithm, salt, iterations, policy) {
        Ok(digest) => digest,
        Err(_) => return false,
    };

    if computed.len() != expected.len() {
        return false;
    }
    computed.as_slice().ct_eq(expected).into()
}

/// Stored hash of one identity label.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityHashRecord {
    /// Algorithm that produced `digest`.
    pub algorithm: HashAlgorithm,
    /// Per-record salt.
    pub salt: [u8; LABEL_SALT_LENGTH],
    /// Iteration or cost parameter (ignored by the fixed-cost digests).
    pub iterations: u32,
    /// Digest bytes.
    pub digest: Vec<u8>,
}

impl IdentityHashRecord {
    /// Hash `label` with a fresh random salt.
    pub fn create(
        label: &[u8],
        algorithm: HashAlgorithm,
        iterations: u32,
        policy: CryptoPolicy,
    ) -> Result<Self> {
        let salt = random_array::<LABEL_SALT_LENGTH>();
        let digest = hash_label(label, algorithm, &salt, iterations, policy)?;
        Ok(Self {
            algorithm,
            salt,
            iterations,
            digest: digest.to_vec(),
        })
    }

    /// Check whether `label` produced this record.
    pub fn matches(&self, label: &[u8], policy: CryptoPolicy) -> bool {
        verify_label(
            label,
            &self.digest,
            self.algorithm,
            &self.salt,
            self.iterations,
            policy,
        )
    }
}

impl std::fmt::Debug for IdentityHashRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityHashRecord")
            .field("algorithm", &self.algorithm)
            .field("iterations", &self.iterations)
            .field("digest_len", &self.digest.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN: CryptoPolicy = CryptoPolicy::permissive();

    const SALT: [u8; LABEL_SALT_LENGTH] = [9u8; LABEL_SALT_LENGTH];

    #[test]
    fn test_digest_sizes() {
        for (algorithm, size) in [
            (HashAlgorithm::Sha3_256, 32),
            (HashAlgorithm::Sha3_384, 48),
            (HashAlgorithm::Sha3_512, 64),
            (HashAlgorithm::Pbkdf2Sha256, 32),
        ] {
            let digest = hash_label(b"alice", algorithm, &SALT, 1_000, OPEN).unwrap();
            assert_eq!(digest.len(), size);
            assert_eq!(algorithm.digest_size(), Some(size));
        }
    }

    #[test]
    fn test_sha3_digest_covers_label_and_salt() {
        let digest = hash_label(b"alice", HashAlgorithm::Sha3_256, &SALT, 0, OPEN).unwrap();

        let mut hasher = Sha3_256::new();
        hasher.update(b"alice");
        hasher.update(SALT);
        assert_eq!(digest.as_slice(), hasher.finalize().as_slice());

        let other_salt = [1u8; LABEL_SALT_LENGTH];
        let salted = hash_label(b"alice", HashAlgorithm::Sha3_256, &other_salt, 0, OPEN).unwrap();
        assert_ne!(digest.as_slice(), salted.as_slice());
    }

    #[test]
    fn test_plaintext_legacy_passthrough() {
        let digest = hash_label(b"bob", HashAlgorithm::PlaintextLegacy, &SALT, 0, OPEN).unwrap();
        assert_eq!(digest.as_slice(), b"bob");
        assert!(verify_label(b"bob", b"bob", HashAlgorithm::PlaintextLegacy, &SALT, 0, OPEN));
        assert!(!verify_label(b"bob", b"bobby", HashAlgorithm::PlaintextLegacy, &SALT, 0, OPEN));
    }

    #[test]
    fn test_pbkdf2_iterations_clamped() {
        let low = hash_label(b"carol", HashAlgorithm::Pbkdf2Sha256, &SALT, 1, OPEN).unwrap();
        let floor = hash_label(b"carol", HashAlgorithm::Pbkdf2Sha256, &SALT, 1_000, OPEN).unwrap();
        assert_eq!(low.as_slice(), floor.as_slice());
    }

    #[test]
    fn test_verify_roundtrip() {
        for algorithm in [HashAlgorithm::Sha3_384, HashAlgorithm::Pbkdf2Sha256] {
            let digest = hash_label(b"dave", algorithm, &SALT, 2_000, OPEN).unwrap();
            assert!(verify_label(b"dave", &digest, algorithm, &SALT, 2_000, OPEN));
            assert!(!verify_label(b"Dave", &digest, algorithm, &SALT, 2_000, OPEN));
        }
    }

    #[test]
    fn test_verify_rejects_length_mismatch() {
        let digest = hash_label(b"erin", HashAlgorithm::Sha3_512, &SALT, 0, OPEN).unwrap();
        assert!(!verify_label(b"erin", &digest[..32], HashAlgorithm::Sha3_512, &SALT, 0, OPEN));
        assert!(!verify_label(b"erin", &[], HashAlgorithm::Sha3_256, &SALT, 0, OPEN));
    }

    #[test]
    fn test_verify_false_on_internal_error() {
        // Empty label is an error for hash_label; verify must swallow it.
        assert!(!verify_label(b"", &[0u8; 32], HashAlgorithm::Sha3_256, &SALT, 0, OPEN));
        assert!(hash_label(b"", HashAlgorithm::Sha3_256, &SALT, 0, OPEN).is_err());
    }

    #[test]
    fn test_argon2id_excluded_in_restricted_mode() {
        let restricted = CryptoPolicy::restricted();
        let result = hash_label(b"frank", HashAlgorithm::Argon2id, &SALT, 3, restricted);
        assert!(matches!(result, Err(Error::NotPermitted(_))));
        assert!(!verify_label(
            b"frank",
            &[0u8; 32],
            HashAlgorithm::Argon2id,
            &SALT,
            3,
            restricted
        ));
    }

    #[test]
    fn test_argon2id_label_hash() {
        let record =
            IdentityHashRecord::create(b"grace", HashAlgorithm::Argon2id, 1, OPEN).unwrap();
        assert_eq!(record.digest.len(), 32);
        assert!(record.matches(b"grace", OPEN));
        assert!(!record.matches(b"heidi", OPEN));
    }

    #[test]
    fn test_argon2id_time_cost_ignores_iterations() {
        assert!(!HashAlgorithm::Argon2id.uses_iterations());
        let low = hash_label(b"judy", HashAlgorithm::Argon2id, &SALT, 1, OPEN).unwrap();
        let high = hash_label(b"judy", HashAlgorithm::Argon2id, &SALT, 7, OPEN).unwrap();
        assert_eq!(*low, *high);
    }

    #[test]
    fn test_identity_record_fresh_salt() {
        let a = IdentityHashRecord::create(b"ivan", HashAlgorithm::Sha3_256, 0, OPEN).unwrap();
        let b = IdentityHashRecord::create(b"ivan", HashAlgorithm::Sha3_256, 0, OPEN).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.digest, b.digest);
        assert!(a.matches(b"ivan", OPEN));
        assert!(b.matches(b"ivan", OPEN));
    }

    #[test]
    fn test_algorithm_ids_roundtrip() {
        for id in 0x00..=0x05 {
            assert_eq!(HashAlgorithm::from_id(id).unwrap().id(), id);
        }
        assert!(HashAlgorithm::from_id(0x06).is_err());
    }
}

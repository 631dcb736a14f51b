//! Cryptographic primitives for Lockbox.
//!
//! This module provides:
//! - Key derivation using PBKDF2-HMAC-SHA256 or Argon2id
//! - Salted identity-label hashing with constant-time verification
//! - AES-256 key wrapping and hardware-response combination
//! - Authenticated payload encryption (AES-256-GCM, XChaCha20-Poly1305)
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons
//! - Every function here is pure; concurrent calls share no state

pub mod aead;
pub mod hash;
pub mod kdf;
pub mod keys;
pub mod policy;
pub mod wrap;

pub use aead::{decrypt, encrypt, PayloadCipher, SealedPayload};
pub use hash::{hash_label, verify_label, HashAlgorithm, IdentityHashRecord, LABEL_SALT_LENGTH};
pub use kdf::{derive_key, select_kdf, KdfAlgorithm, KdfParams};
pub use keys::{random_array, DataKey, KeyEncryptionKey, Salt, KEY_LENGTH, SALT_LENGTH};
pub use policy::CryptoPolicy;
pub use wrap::{combine, unwrap_key, wrap_key, WrappedKey, WRAPPED_KEY_LENGTH};

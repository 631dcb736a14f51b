//! Authenticated payload encryption.
//!
//! AES-256-GCM is the default and the only cipher allowed in restricted
//! mode. XChaCha20-Poly1305 is available otherwise; its 24-byte nonce is
//! safe for random generation at any volume.
//!
//! Every encryption draws a fresh nonce from the operating system CSPRNG.
//! Nothing in this module accepts a caller-supplied nonce for encryption.

use aes_gcm::aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::XChaCha20Poly1305;
use serde::{Deserialize, Serialize};

use crate::keys::DataKey;
use crate::policy::CryptoPolicy;
use lockbox_common::{Error, Result};

/// Authentication tag size (16 bytes) for both ciphers.
pub const TAG_SIZE: usize = 16;

/// Payload cipher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum PayloadCipher {
    /// AES-256-GCM with a 12-byte nonce.
    #[default]
    Aes256Gcm = 0x01,
    /// XChaCha20-Poly1305 with a 24-byte nonce.
    XChaCha20Poly1305 = 0x02,
}

impl PayloadCipher {
    /// Identifier stored in containers.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Resolve a stored identifier.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0x01 => Ok(Self::Aes256Gcm),
            0x02 => Ok(Self::XChaCha20Poly1305),
            other => Err(Error::UnsupportedAlgorithm(format!(
                "payload cipher id 0x{:02x}",
                other
            ))),
        }
    }

    /// Nonce length in bytes.
    pub fn nonce_size(self) -> usize {
        match self {
            Self::Aes256Gcm => 12,
            Self::XChaCha20Poly1305 => 24,
        }
    }

    /// Whether the cipher may be used in restricted mode.
    pub fn is_approved(self) -> bool {
        matches!(self, Self::Aes256Gcm)
    }

    /// Check the cipher against `policy`.
    ///
    /// # Errors
    /// - `NotPermitted` for a non-approved cipher under restricted mode
    pub fn ensure_allowed(self, policy: CryptoPolicy) -> Result<()> {
        if policy.restricted && !self.is_approved() {
            return Err(Error::NotPermitted(format!(
                "{:?} is disabled in restricted mode",
                self
            )));
        }
        Ok(())
    }
}

/// Ciphertext together with the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    /// Nonce, `cipher.nonce_size()` bytes.
    pub nonce: Vec<u8>,
    /// Ciphertext followed by the authentication tag.
    pub ciphertext: Vec<u8>,
}

/// Encrypt a payload under the data key.
///
/// # Postconditions
/// - The nonce is freshly generated
/// - `ciphertext.len() == plaintext.len() + TAG_SIZE`
///
/// # Errors
/// - Returns error if encryption fails
pub fn encrypt(cipher: PayloadCipher, key: &DataKey, plaintext: &[u8]) -> Result<SealedPayload> {
    let key = GenericArray::from_slice(key.as_bytes());
    let (nonce, ciphertext) = match cipher {
        PayloadCipher::Aes256Gcm => {
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let ciphertext = Aes256Gcm::new(key)
                .encrypt(&nonce, plaintext)
                .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;
            (nonce.to_vec(), ciphertext)
        }
        PayloadCipher::XChaCha20Poly1305 => {
            let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
            let ciphertext = XChaCha20Poly1305::new(key)
                .encrypt(&nonce, plaintext)
                .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;
            (nonce.to_vec(), ciphertext)
        }
    };

    Ok(SealedPayload { nonce, ciphertext })
}

/// Decrypt a payload.
///
/// # Errors
/// - `AuthenticationFailure` for any failure: wrong nonce length,
///   truncated ciphertext, wrong key or tag mismatch all look the same
pub fn decrypt(
    cipher: PayloadCipher,
    key: &DataKey,
    nonce: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if nonce.len() != cipher.nonce_size() || ciphertext.len() < TAG_SIZE {
        return Err(Error::AuthenticationFailure);
    }

    let key = GenericArray::from_slice(key.as_bytes());
    let plaintext = match cipher {
        PayloadCipher::Aes256Gcm => {
            Aes256Gcm::new(key).decrypt(GenericArray::from_slice(nonce), ciphertext)
        }
        PayloadCipher::XChaCha20Poly1305 => {
            XChaCha20Poly1305::new(key).decrypt(GenericArray::from_slice(nonce), ciphertext)
        }
    };

    plaintext.map_err(|_| Error::AuthenticationFailure)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const CIPHERS: [PayloadCipher; 2] =
        [PayloadCipher::Aes256Gcm, PayloadCipher::XChaCha20Poly1305];

    #[test]
    fn test_encrypt_decrypt() {
        let key = DataKey::generate();
        let plaintext = b"Hello, World!";

        for cipher in CIPHERS {
            let sealed = encrypt(cipher, &key, plaintext).unwrap();
            assert_eq!(sealed.nonce.len(), cipher.nonce_size());
            assert_eq!(sealed.ciphertext.len(), plaintext.len() + TAG_SIZE);

            let decrypted = decrypt(cipher, &key, &sealed.nonce, &sealed.ciphertext).unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_decrypt_wrong_key_fails() {
        let key1 = DataKey::generate();
        let key2 = DataKey::generate();

        for cipher in CIPHERS {
            let sealed = encrypt(cipher, &key1, b"Secret message").unwrap();
            let result = decrypt(cipher, &key2, &sealed.nonce, &sealed.ciphertext);
            assert!(matches!(result, Err(Error::AuthenticationFailure)));
        }
    }

    #[test]
    fn test_decrypt_detects_any_flipped_byte() {
        let key = DataKey::generate();
        let sealed = encrypt(PayloadCipher::Aes256Gcm, &key, b"vault body").unwrap();

        for i in 0..sealed.ciphertext.len() {
            let mut tampered = sealed.ciphertext.clone();
            tampered[i] ^= 0x01;
            let result = decrypt(PayloadCipher::Aes256Gcm, &key, &sealed.nonce, &tampered);
            assert!(matches!(result, Err(Error::AuthenticationFailure)), "byte {}", i);
        }
        for i in 0..sealed.nonce.len() {
            let mut nonce = sealed.nonce.clone();
            nonce[i] ^= 0x01;
            let result = decrypt(PayloadCipher::Aes256Gcm, &key, &nonce, &sealed.ciphertext);
            assert!(matches!(result, Err(Error::AuthenticationFailure)));
        }
    }

    #[test]
    fn test_malformed_input_is_authentication_failure() {
        let key = DataKey::generate();
        let sealed = encrypt(PayloadCipher::Aes256Gcm, &key, b"data").unwrap();

        let (nonce, ciphertext) = (&sealed.nonce, &sealed.ciphertext);

        let short_nonce = decrypt(PayloadCipher::Aes256Gcm, &key, &nonce[..8], ciphertext);
        assert!(matches!(short_nonce, Err(Error::AuthenticationFailure)));

        let truncated = decrypt(PayloadCipher::Aes256Gcm, &key, nonce, &ciphertext[..4]);
        assert!(matches!(truncated, Err(Error::AuthenticationFailure)));

        let wrong_cipher = decrypt(PayloadCipher::XChaCha20Poly1305, &key, nonce, ciphertext);
        assert!(matches!(wrong_cipher, Err(Error::AuthenticationFailure)));
    }

    #[test]
    fn test_nonce_never_repeats() {
        let key = DataKey::generate();
        let mut seen = HashSet::with_capacity(10_000);

        for _ in 0..10_000 {
            let sealed = encrypt(PayloadCipher::Aes256Gcm, &key, b"same plaintext").unwrap();
            assert!(seen.insert(sealed.nonce), "nonce reused");
        }
    }

    #[test]
    fn test_empty_plaintext() {
        let key = DataKey::generate();
        let sealed = encrypt(PayloadCipher::Aes256Gcm, &key, b"").unwrap();
        let decrypted =
            decrypt(PayloadCipher::Aes256Gcm, &key, &sealed.nonce, &sealed.ciphertext).unwrap();
        assert!(decrypted.is_empty());
    }

    #[test]
    fn test_restricted_mode_cipher_policy() {
        assert!(PayloadCipher::Aes256Gcm.ensure_allowed(CryptoPolicy::restricted()).is_ok());
        assert!(matches!(
            PayloadCipher::XChaCha20Poly1305.ensure_allowed(CryptoPolicy::restricted()),
            Err(Error::NotPermitted(_))
        ));
        assert!(PayloadCipher::XChaCha20Poly1305
            .ensure_allowed(CryptoPolicy::permissive())
            .is_ok());
    }
}

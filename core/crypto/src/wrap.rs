//! Key wrapping and factor combination.
//!
//! The data key is wrapped with AES-256 Key Wrap (RFC 3394), which carries
//! its own integrity check independent of the payload cipher's tag.

use aes_gcm::aead::generic_array::GenericArray;
use aes_kw::KekAes256;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::keys::{DataKey, KeyEncryptionKey, KEY_LENGTH};
use lockbox_common::{Error, Result};

/// Size of a wrapped 32-byte key (key plus 8-byte integrity block).
pub const WRAPPED_KEY_LENGTH: usize = KEY_LENGTH + 8;

/// A data key wrapped under a key encryption key.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey([u8; WRAPPED_KEY_LENGTH]);

impl WrappedKey {
    /// Parse stored wrapped-key bytes.
    ///
    /// # Errors
    /// - `IntegrityFailure` if the length is wrong; a truncated wrap is
    ///   treated like any other damaged wrap
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; WRAPPED_KEY_LENGTH] =
            bytes.try_into().map_err(|_| Error::IntegrityFailure)?;
        Ok(Self(array))
    }

    /// Get the wrapped bytes.
    pub fn as_bytes(&self) -> &[u8; WRAPPED_KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrappedKey({} bytes)", WRAPPED_KEY_LENGTH)
    }
}

/// Wrap a data key.
///
/// # Postconditions
/// - `unwrap_key(kek, &wrap_key(kek, dek)?)` yields `dek`
///
/// # Errors
/// - `Crypto` if the wrap primitive fails
pub fn wrap_key(kek: &KeyEncryptionKey, dek: &DataKey) -> Result<WrappedKey> {
    let wrapper = KekAes256::new(GenericArray::from_slice(kek.as_bytes()));
    let mut out = [0u8; WRAPPED_KEY_LENGTH];
    wrapper
        .wrap(dek.as_bytes(), &mut out)
        .map_err(|e| Error::Crypto(format!("Key wrap failed: {}", e)))?;
    Ok(WrappedKey(out))
}

/// Unwrap a data key.
///
/// # Errors
/// - `IntegrityFailure` if the KEK is wrong or the wrapped bytes were
///   altered; no partial key is ever returned
pub fn unwrap_key(kek: &KeyEncryptionKey, wrapped: &WrappedKey) -> Result<DataKey> {
    let wrapper = KekAes256::new(GenericArray::from_slice(kek.as_bytes()));
    let mut out = Zeroizing::new([0u8; KEY_LENGTH]);
    wrapper
        .unwrap(wrapped.as_bytes(), out.as_mut())
        .map_err(|_| Error::IntegrityFailure)?;
    Ok(DataKey::from_bytes(*out))
}

/// Stretch or compress a hardware response to exactly `KEY_LENGTH` bytes.
///
/// - Shorter responses are repeated cyclically: byte `i` is
///   `response[i % response.len()]`. A 20-byte HMAC-SHA1 response therefore
///   contributes its first 12 bytes twice.
/// - A 32-byte response is used unchanged.
/// - Longer responses are reduced with SHA-256.
///
/// Repetition adds no entropy; the combined key is only as strong as the
/// response length allows. Existing enrollments depend on this exact
/// expansion, so it must not change.
fn expand_response(response: &[u8]) -> Zeroizing<[u8; KEY_LENGTH]> {
    let mut expanded = Zeroizing::new([0u8; KEY_LENGTH]);
    if response.len() > KEY_LENGTH {
        expanded.copy_from_slice(&Sha256::digest(response));
    } else {
        for (i, byte) in expanded.iter_mut().enumerate() {
            *byte = response[i % response.len()];
        }
    }
    expanded
}

/// Combine a password-derived KEK with a hardware response.
///
/// The mix is a byte-wise XOR of the KEK and the expanded response, so it
/// is deterministic and does not depend on argument order.
///
/// # Errors
/// - `InvalidInput` if the response is empty
pub fn combine(password_kek: &KeyEncryptionKey, response: &[u8]) -> Result<KeyEncryptionKey> {
    if response.is_empty() {
        return Err(Error::InvalidInput(
            "Hardware response cannot be empty".to_string(),
        ));
    }

    let expanded = expand_response(response);
    let mut combined = [0u8; KEY_LENGTH];
    for (out, (a, b)) in combined
        .iter_mut()
        .zip(password_kek.as_bytes().iter().zip(expanded.iter()))
    {
        *out = a ^ b;
    }
    Ok(KeyEncryptionKey::from_bytes(combined))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_wrap_unwrap() {
        let kek = KeyEncryptionKey::from_bytes([7u8; KEY_LENGTH]);
        let dek = DataKey::generate();

        let wrapped = wrap_key(&kek, &dek).unwrap();
        assert_ne!(&wrapped.as_bytes()[..KEY_LENGTH], dek.as_bytes());

        let unwrapped = unwrap_key(&kek, &wrapped).unwrap();
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn test_rfc3394_vector() {
        // RFC 3394 section 4.6: 256-bit key data with a 256-bit KEK.
        let kek: [u8; 32] = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
            0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B,
            0x1C, 0x1D, 0x1E, 0x1F,
        ];
        let key_data: [u8; 32] = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B,
            0x0C, 0x0D, 0x0E, 0x0F,
        ];
        let expected: [u8; 40] = [
            0x28, 0xC9, 0xF4, 0x04, 0xC4, 0xB8, 0x10, 0xF4, 0xCB, 0xCC, 0xB3, 0x5C, 0xFB, 0x87,
            0xF8, 0x26, 0x3F, 0x57, 0x86, 0xE2, 0xD8, 0x0E, 0xD3, 0x26, 0xCB, 0xC7, 0xF0, 0xE7,
            0x1A, 0x99, 0xF4, 0x3B, 0xFB, 0x98, 0x8B, 0x9B, 0x7A, 0x02, 0xDD, 0x21,
        ];

        let wrapped = wrap_key(
            &KeyEncryptionKey::from_bytes(kek),
            &DataKey::from_bytes(key_data),
        )
        .unwrap();
        assert_eq!(wrapped.as_bytes(), &expected);
    }

    #[test]
    fn test_unwrap_wrong_kek_fails() {
        let dek = DataKey::generate();
        let wrapped = wrap_key(&KeyEncryptionKey::from_bytes([1u8; KEY_LENGTH]), &dek).unwrap();

        let result = unwrap_key(&KeyEncryptionKey::from_bytes([2u8; KEY_LENGTH]), &wrapped);
        assert!(matches!(result, Err(Error::IntegrityFailure)));
    }

    #[test]
    fn test_unwrap_detects_any_flipped_byte() {
        let kek = KeyEncryptionKey::from_bytes([3u8; KEY_LENGTH]);
        let wrapped = wrap_key(&kek, &DataKey::generate()).unwrap();

        for i in 0..WRAPPED_KEY_LENGTH {
            let mut tampered = *wrapped.as_bytes();
            tampered[i] ^= 0x01;
            let result = unwrap_key(&kek, &WrappedKey::from_slice(&tampered).unwrap());
            assert!(matches!(result, Err(Error::IntegrityFailure)), "byte {}", i);
        }
    }

    #[test]
    fn test_wrapped_key_length_checked() {
        assert!(matches!(
            WrappedKey::from_slice(&[0u8; 39]),
            Err(Error::IntegrityFailure)
        ));
        assert!(WrappedKey::from_slice(&[0u8; 40]).is_ok());
    }

    #[test]
    fn test_combine_short_response_repeats() {
        let kek = KeyEncryptionKey::from_bytes([0u8; KEY_LENGTH]);
        let response: Vec<u8> = (1..=20).collect();

        let combined = combine(&kek, &response).unwrap();
        // XOR with a zero KEK exposes the expanded response
        let expected: Vec<u8> = (0..KEY_LENGTH).map(|i| response[i % 20]).collect();
        assert_eq!(combined.as_bytes().as_slice(), expected.as_slice());
    }

    #[test]
    fn test_combine_long_response_hashed() {
        let kek = KeyEncryptionKey::from_bytes([0u8; KEY_LENGTH]);
        let response = [0x5Au8; 64];

        let combined = combine(&kek, &response).unwrap();
        assert_eq!(combined.as_bytes().as_slice(), Sha256::digest(response).as_slice());
    }

    #[test]
    fn test_combine_empty_response_rejected() {
        let kek = KeyEncryptionKey::from_bytes([1u8; KEY_LENGTH]);
        assert!(matches!(combine(&kek, &[]), Err(Error::InvalidInput(_))));
    }

    proptest! {
        #[test]
        fn prop_wrap_roundtrip(kek in any::<[u8; 32]>(), dek in any::<[u8; 32]>()) {
            let kek = KeyEncryptionKey::from_bytes(kek);
            let dek = DataKey::from_bytes(dek);
            let wrapped = wrap_key(&kek, &dek).unwrap();
            let unwrapped = unwrap_key(&kek, &wrapped).unwrap();
            prop_assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
        }

        #[test]
        fn prop_combine_deterministic_and_input_sensitive(
            kek in any::<[u8; 32]>(),
            response in proptest::collection::vec(any::<u8>(), 1..=64),
            flip in any::<usize>(),
        ) {
            let base = KeyEncryptionKey::from_bytes(kek);
            let first = combine(&base, &response).unwrap();
            let second = combine(&base, &response).unwrap();
            prop_assert_eq!(first.as_bytes(), second.as_bytes());

            let mut other_kek = kek;
            other_kek[flip % KEY_LENGTH] ^= 0x80;
            let changed = combine(&KeyEncryptionKey::from_bytes(other_kek), &response).unwrap();
            prop_assert_ne!(first.as_bytes(), changed.as_bytes());

            let mut other_response = response.clone();
            let idx = flip % other_response.len();
            other_response[idx] ^= 0x80;
            let changed = combine(&base, &other_response).unwrap();
            prop_assert_ne!(first.as_bytes(), changed.as_bytes());
        }
    }
}

//! Sealing and opening container payloads.
//!
//! This is where typed keys and slots meet the raw container layout. Key
//! derivation is not done here; callers pass in keys they already hold.

use lockbox_common::{Error, Result};
use lockbox_crypto::{
    decrypt, encrypt, CryptoPolicy, DataKey, KeyEncryptionKey, PayloadCipher, Salt, SALT_LENGTH,
};
use lockbox_storage::{HeaderV2, V1Container, V2Container};

use crate::config::SecurityPolicy;
use crate::slot::KeySlot;

/// v1 payload nonce length.
const V1_NONCE_LENGTH: usize = 12;

/// Parsed version 1 container.
pub(crate) struct ParsedV1 {
    pub iterations: u32,
    pub salt: Salt,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl ParsedV1 {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let container = V1Container::decode(bytes)?;
        let body = &container.body;
        if body.len() < SALT_LENGTH + V1_NONCE_LENGTH {
            return Err(Error::Corrupted("v1 body truncated".to_string()));
        }
        let (salt, rest) = body.split_at(SALT_LENGTH);
        let (nonce, ciphertext) = rest.split_at(V1_NONCE_LENGTH);

        Ok(Self {
            iterations: container.iterations,
            salt: Salt::from_bytes(salt)?,
            nonce: nonce.to_vec(),
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Decrypt the payload with the password-derived key.
    pub fn decrypt(&self, key: &DataKey) -> Result<Vec<u8>> {
        decrypt(PayloadCipher::Aes256Gcm, key, &self.nonce, &self.ciphertext)
    }
}

/// Seal a version 1 container under a fresh nonce.
pub(crate) fn seal_v1(
    iterations: u32,
    salt: &Salt,
    key: &DataKey,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    if salt.as_bytes().len() != SALT_LENGTH {
        return Err(Error::InvalidInput("v1 containers need a 32-byte salt".to_string()));
    }
    let sealed = encrypt(PayloadCipher::Aes256Gcm, key, plaintext)?;

    let mut body = Vec::with_capacity(SALT_LENGTH + sealed.nonce.len() + sealed.ciphertext.len());
    body.extend_from_slice(salt.as_bytes());
    body.extend_from_slice(&sealed.nonce);
    body.extend_from_slice(&sealed.ciphertext);

    Ok(V1Container { iterations, body }.encode())
}

/// Version 1 containers use the password-derived key directly.
pub(crate) fn v1_key(kek: KeyEncryptionKey) -> DataKey {
    kek.into_data_key()
}

/// Parsed version 2 container with typed slots.
pub(crate) struct ParsedV2 {
    pub cipher: PayloadCipher,
    pub fec_redundancy: u8,
    pub policy: SecurityPolicy,
    pub slots: Vec<KeySlot>,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl ParsedV2 {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let container = V2Container::decode(bytes)?;
        let header = container.header;
        let slots = header
            .slots
            .iter()
            .map(KeySlot::from_record)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            cipher: PayloadCipher::from_id(header.cipher)?,
            fec_redundancy: header.fec_redundancy,
            policy: SecurityPolicy::from_header(header.policy_flags, header.min_password_length),
            slots,
            nonce: header.nonce,
            ciphertext: container.ciphertext,
        })
    }

    pub fn decrypt(&self, key: &DataKey, policy: CryptoPolicy) -> Result<Vec<u8>> {
        self.cipher.ensure_allowed(policy)?;
        decrypt(self.cipher, key, &self.nonce, &self.ciphertext)
    }
}

/// Everything needed to write a version 2 container.
pub(crate) struct SealV2<'a> {
    pub cipher: PayloadCipher,
    pub fec_redundancy: u8,
    pub policy: SecurityPolicy,
    pub slots: &'a [KeySlot],
}

impl SealV2<'_> {
    /// Encrypt `plaintext` under a fresh nonce and encode the container.
    pub fn seal(&self, key: &DataKey, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = encrypt(self.cipher, key, plaintext)?;
        let slots = self
            .slots
            .iter()
            .map(KeySlot::to_record)
            .collect::<Result<Vec<_>>>()?;

        V2Container {
            header: HeaderV2 {
                cipher: self.cipher.id(),
                nonce: sealed.nonce,
                fec_redundancy: self.fec_redundancy,
                policy_flags: self.policy.flags(),
                min_password_length: self.policy.min_password_length,
                slots,
            },
            ciphertext: sealed.ciphertext,
        }
        .encode()
    }
}

//! Container byte layout.
//!
//! Two versions exist and are told apart from the first eight bytes alone.
//!
//! Version 1 (flat):
//! `["KPT\0"][u32 version = 1][u32 iterations][body]`
//!
//! Version 2 (structured):
//! `[u32 magic 0x4B505457][u32 version = 2][u32 header_len][u8 flags][header][body]`
//!
//! All integers are little-endian. The v2 header is optionally wrapped in
//! an FEC block (flag `0x01`), and so is the body (flag `0x02`). The header
//! never holds secrets in the clear: salts, parameters, wrapped keys and
//! opaque per-slot metadata only.

use lockbox_common::{Error, Result, MAX_SLOT_ID_LENGTH};

use crate::fec;

/// Magic bytes of a version 1 container.
pub const V1_MAGIC: [u8; 4] = *b"KPT\0";
/// Magic number of a version 2 container, stored little-endian ("WTPK").
pub const V2_MAGIC: u32 = 0x4B50_5457;
/// Length of the v1 fixed header.
pub const V1_HEADER_LEN: usize = 12;
/// Length of the v2 fixed header.
pub const V2_FIXED_HEADER_LEN: usize = 13;
/// Largest header section accepted.
pub const MAX_HEADER_SIZE: usize = 1024 * 1024;
/// Largest number of key slots in one container.
pub const MAX_KEY_SLOTS: usize = 32;

/// Flag: the header section is FEC-encoded.
pub const FLAG_HEADER_FEC: u8 = 0x01;
/// Flag: the body is FEC-encoded.
pub const FLAG_BODY_FEC: u8 = 0x02;

/// Policy flag: every new factor must include a hardware key.
pub const POLICY_REQUIRE_HARDWARE: u8 = 0x01;

/// Container format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatVersion {
    /// Flat header, single implicit slot, fixed KDF.
    V1,
    /// Structured header with an explicit slot table.
    V2,
}

impl FormatVersion {
    /// Version number written in the header.
    pub fn number(self) -> u32 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

/// Identify a container from its leading bytes without parsing it.
///
/// Returns `None` for anything that is not exactly a known magic followed
/// by its matching version number.
pub fn detect_version(bytes: &[u8]) -> Option<FormatVersion> {
    if bytes.len() < 8 {
        return None;
    }
    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    match (magic, version) {
        (V1_MAGIC, 1) => Some(FormatVersion::V1),
        (m, 2) if u32::from_le_bytes(m) == V2_MAGIC => Some(FormatVersion::V2),
        _ => None,
    }
}

/// Explain why `detect_version` rejected `bytes`.
pub(crate) fn unrecognized(bytes: &[u8]) -> Error {
    if bytes.len() >= 8 {
        let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if magic == V1_MAGIC || u32::from_le_bytes(magic) == V2_MAGIC {
            let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
            return Error::UnsupportedVersion(version);
        }
    }
    Error::Corrupted("Unrecognized container header".to_string())
}

/// Bounds-checked little-endian reader.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| Error::Corrupted(format!("Truncated {}", what)))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        slice
    }
}

fn push_short_bytes(out: &mut Vec<u8>, bytes: &[u8], what: &str) -> Result<()> {
    let len = u8::try_from(bytes.len())
        .map_err(|_| Error::InvalidInput(format!("{} exceeds 255 bytes", what)))?;
    out.push(len);
    out.extend_from_slice(bytes);
    Ok(())
}

/// Version 1 container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V1Container {
    /// PBKDF2 iteration count.
    pub iterations: u32,
    /// Everything after the fixed header.
    pub body: Vec<u8>,
}

impl V1Container {
    /// Serialize to container bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(V1_HEADER_LEN + self.body.len());
        out.extend_from_slice(&V1_MAGIC);
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.iterations.to_le_bytes());
        out.extend_from_slice(&self.body);
        out
    }

    /// Parse container bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if detect_version(bytes) != Some(FormatVersion::V1) {
            return Err(unrecognized(bytes));
        }
        let mut reader = Reader::new(&bytes[8..]);
        let iterations = reader.u32("v1 iteration count")?;
        Ok(Self {
            iterations,
            body: reader.rest().to_vec(),
        })
    }
}

/// One key slot as stored on disk.
///
/// Algorithm identifiers are raw bytes here; the vault layer maps them to
/// its typed enums and rejects unknown ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    /// Slot identifier.
    pub slot_id: String,
    /// KDF algorithm id.
    pub kdf_algorithm: u8,
    /// PBKDF2 iterations.
    pub pbkdf2_iterations: u32,
    /// Argon2id memory cost in KiB.
    pub argon2_memory_kib: u32,
    /// Argon2id time cost.
    pub argon2_time_cost: u32,
    /// Argon2id parallelism.
    pub argon2_parallelism: u32,
    /// KDF salt.
    pub salt: Vec<u8>,
    /// Wrapped data key.
    pub wrapped_key: Vec<u8>,
    /// Opaque auxiliary metadata.
    pub metadata: Vec<u8>,
}

impl SlotRecord {
    fn encode_into(&self, out: &mut Vec<u8>) -> Result<()> {
        if self.slot_id.is_empty() || self.slot_id.len() > MAX_SLOT_ID_LENGTH {
            return Err(Error::InvalidInput("Slot id length out of range".to_string()));
        }
        push_short_bytes(out, self.slot_id.as_bytes(), "slot id")?;
        out.push(self.kdf_algorithm);
        out.extend_from_slice(&self.pbkdf2_iterations.to_le_bytes());
        out.extend_from_slice(&self.argon2_memory_kib.to_le_bytes());
        out.extend_from_slice(&self.argon2_time_cost.to_le_bytes());
        out.extend_from_slice(&self.argon2_parallelism.to_le_bytes());
        push_short_bytes(out, &self.salt, "salt")?;
        push_short_bytes(out, &self.wrapped_key, "wrapped key")?;

        let meta_len = u16::try_from(self.metadata.len())
            .map_err(|_| Error::InvalidInput("Slot metadata exceeds 64 KiB".to_string()))?;
        out.extend_from_slice(&meta_len.to_le_bytes());
        out.extend_from_slice(&self.metadata);
        Ok(())
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let id_len = reader.u8("slot id")? as usize;
        let slot_id = std::str::from_utf8(reader.take(id_len, "slot id")?)
            .map_err(|_| Error::Corrupted("Slot id is not UTF-8".to_string()))?
            .to_string();
        if slot_id.is_empty() {
            return Err(Error::Corrupted("Empty slot id".to_string()));
        }
        let kdf_algorithm = reader.u8("slot KDF id")?;
        let pbkdf2_iterations = reader.u32("slot parameters")?;
        let argon2_memory_kib = reader.u32("slot parameters")?;
        let argon2_time_cost = reader.u32("slot parameters")?;
        let argon2_parallelism = reader.u32("slot parameters")?;
        let salt_len = reader.u8("slot salt")? as usize;
        let salt = reader.take(salt_len, "slot salt")?.to_vec();
        let wrapped_len = reader.u8("wrapped key")? as usize;
        let wrapped_key = reader.take(wrapped_len, "wrapped key")?.to_vec();
        let meta_len = reader.u16("slot metadata")? as usize;
        let metadata = reader.take(meta_len, "slot metadata")?.to_vec();

        Ok(Self {
            slot_id,
            kdf_algorithm,
            pbkdf2_iterations,
            argon2_memory_kib,
            argon2_time_cost,
            argon2_parallelism,
            salt,
            wrapped_key,
            metadata,
        })
    }
}

/// Decoded version 2 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderV2 {
    /// Payload cipher id.
    pub cipher: u8,
    /// Payload nonce.
    pub nonce: Vec<u8>,
    /// FEC redundancy percentage, 0 when disabled.
    pub fec_redundancy: u8,
    /// Security policy flags (`POLICY_*`).
    pub policy_flags: u8,
    /// Minimum password length for new factors.
    pub min_password_length: u8,
    /// Key slot table.
    pub slots: Vec<SlotRecord>,
}

impl HeaderV2 {
    fn encode(&self) -> Result<Vec<u8>> {
        if self.slots.is_empty() || self.slots.len() > MAX_KEY_SLOTS {
            return Err(Error::InvalidInput(format!(
                "A container needs 1 to {} key slots, got {}",
                MAX_KEY_SLOTS,
                self.slots.len()
            )));
        }
        let mut out = Vec::new();
        out.push(self.cipher);
        push_short_bytes(&mut out, &self.nonce, "nonce")?;
        out.push(self.fec_redundancy);
        out.push(self.policy_flags);
        out.push(self.min_password_length);
        out.push(self.slots.len() as u8);
        for slot in &self.slots {
            slot.encode_into(&mut out)?;
        }
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(bytes);
        let cipher = reader.u8("cipher id")?;
        let nonce_len = reader.u8("nonce")? as usize;
        let nonce = reader.take(nonce_len, "nonce")?.to_vec();
        let fec_redundancy = reader.u8("FEC parameters")?;
        let policy_flags = reader.u8("policy")?;
        let min_password_length = reader.u8("policy")?;
        let slot_count = reader.u8("slot count")? as usize;
        if slot_count == 0 || slot_count > MAX_KEY_SLOTS {
            return Err(Error::Corrupted(format!("Invalid slot count {}", slot_count)));
        }

        let slots = (0..slot_count)
            .map(|_| SlotRecord::decode_from(&mut reader))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            cipher,
            nonce,
            fec_redundancy,
            policy_flags,
            min_password_length,
            slots,
        })
    }
}

/// Version 2 container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct V2Container {
    /// Structured header.
    pub header: HeaderV2,
    /// Payload ciphertext and tag.
    pub ciphertext: Vec<u8>,
}

impl V2Container {
    /// Serialize to container bytes.
    ///
    /// With a non-zero `fec_redundancy` the header is protected with at
    /// least `HEADER_MIN_REDUNDANCY` percent parity and the body with the
    /// configured percentage.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty or oversized slot table, oversized
    ///   fields, or an out-of-range redundancy
    pub fn encode(&self) -> Result<Vec<u8>> {
        let raw_header = self.header.encode()?;
        let redundancy = self.header.fec_redundancy;

        let (flags, header_section, body) = if redundancy == 0 {
            (0u8, raw_header, self.ciphertext.clone())
        } else {
            fec::validate_redundancy(redundancy)?;
            (
                FLAG_HEADER_FEC | FLAG_BODY_FEC,
                fec::encode(&raw_header, redundancy.max(fec::HEADER_MIN_REDUNDANCY))?,
                fec::encode(&self.ciphertext, redundancy)?,
            )
        };

        if header_section.len() > MAX_HEADER_SIZE {
            return Err(Error::InvalidInput(format!(
                "Header of {} bytes exceeds {} byte limit",
                header_section.len(),
                MAX_HEADER_SIZE
            )));
        }

        let mut out = Vec::with_capacity(V2_FIXED_HEADER_LEN + header_section.len() + body.len());
        out.extend_from_slice(&V2_MAGIC.to_le_bytes());
        out.extend_from_slice(&2u32.to_le_bytes());
        out.extend_from_slice(&(header_section.len() as u32).to_le_bytes());
        out.push(flags);
        out.extend_from_slice(&header_section);
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Parse container bytes, repairing FEC-protected sections if needed.
    ///
    /// # Errors
    /// - `Corrupted` for malformed or unrecoverable bytes
    /// - `UnsupportedVersion` for a v2 magic with another version number
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if detect_version(bytes) != Some(FormatVersion::V2) {
            return Err(unrecognized(bytes));
        }
        let mut reader = Reader::new(&bytes[8..]);
        let header_len = reader.u32("header length")? as usize;
        if header_len > MAX_HEADER_SIZE {
            return Err(Error::Corrupted(format!(
                "Header length {} exceeds limit",
                header_len
            )));
        }
        let flags = reader.u8("flags")?;
        if flags & !(FLAG_HEADER_FEC | FLAG_BODY_FEC) != 0 {
            return Err(Error::Corrupted(format!("Unknown header flags 0x{:02x}", flags)));
        }

        let header_section = reader.take(header_len, "header")?;
        let header = if flags & FLAG_HEADER_FEC != 0 {
            HeaderV2::decode(&fec::decode(header_section)?)?
        } else {
            HeaderV2::decode(header_section)?
        };

        let body = reader.rest();
        let ciphertext = if flags & FLAG_BODY_FEC != 0 {
            fec::decode(body)?
        } else {
            body.to_vec()
        };

        Ok(Self { header, ciphertext })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(id: &str) -> SlotRecord {
        SlotRecord {
            slot_id: id.to_string(),
            kdf_algorithm: 0x04,
            pbkdf2_iterations: 600_000,
            argon2_memory_kib: 65_536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
            salt: vec![1u8; 32],
            wrapped_key: vec![2u8; 40],
            metadata: br#"{"role":"administrator"}"#.to_vec(),
        }
    }

    fn container(fec_redundancy: u8) -> V2Container {
        V2Container {
            header: HeaderV2 {
                cipher: 0x01,
                nonce: vec![3u8; 12],
                fec_redundancy,
                policy_flags: POLICY_REQUIRE_HARDWARE,
                min_password_length: 12,
                slots: vec![slot("alpha"), slot("beta")],
            },
            ciphertext: (0..500u32).map(|i| i as u8).collect(),
        }
    }

    #[test]
    fn test_detect_v1() {
        let mut header = b"KPT\0".to_vec();
        header.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        header.extend_from_slice(&100_000u32.to_le_bytes());
        assert_eq!(detect_version(&header), Some(FormatVersion::V1));
    }

    #[test]
    fn test_detect_v2() {
        let bytes = container(0).encode().unwrap();
        assert_eq!(&bytes[..4], b"WTPK");
        assert_eq!(detect_version(&bytes), Some(FormatVersion::V2));
    }

    #[test]
    fn test_detect_unknown() {
        assert_eq!(detect_version(b""), None);
        assert_eq!(detect_version(b"KPT\0"), None);
        assert_eq!(detect_version(&[0u8; 12]), None);
        assert_eq!(detect_version(b"KPT\0\x02\0\0\0\0\0\0\0"), None);
        assert_eq!(detect_version(b"WTPK\x01\0\0\0\0\0\0\0"), None);
        assert_eq!(detect_version(b"PK\x03\x04\0\0\0\0\0\0\0\0"), None);
    }

    #[test]
    fn test_unrecognized_reports_future_version() {
        let bytes = b"WTPK\x03\0\0\0\0\0\0\0";
        assert!(matches!(V2Container::decode(bytes), Err(Error::UnsupportedVersion(3))));
        assert!(matches!(V1Container::decode(b"garbage!!"), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_v1_layout() {
        let v1 = V1Container {
            iterations: 100_000,
            body: vec![9u8; 60],
        };
        let bytes = v1.encode();
        assert_eq!(&bytes[..8], b"KPT\0\x01\0\0\0");
        assert_eq!(&bytes[8..12], &100_000u32.to_le_bytes());
        assert_eq!(V1Container::decode(&bytes).unwrap(), v1);
    }

    #[test]
    fn test_v2_roundtrip_plain_and_fec() {
        for redundancy in [0, 10] {
            let original = container(redundancy);
            let bytes = original.encode().unwrap();
            assert_eq!(bytes[12] != 0, redundancy != 0);
            assert_eq!(V2Container::decode(&bytes).unwrap(), original);
        }
    }

    #[test]
    fn test_v2_fec_repairs_header_damage() {
        let original = container(20);
        let mut bytes = original.encode().unwrap();
        // First data shard of the header section
        bytes[V2_FIXED_HEADER_LEN + 15 + 4 + 2] ^= 0xFF;
        assert_eq!(V2Container::decode(&bytes).unwrap(), original);
    }

    #[test]
    fn test_v2_without_fec_detects_truncation() {
        let bytes = container(0).encode().unwrap();
        let header_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let truncated = &bytes[..V2_FIXED_HEADER_LEN + header_len - 3];
        assert!(matches!(V2Container::decode(truncated), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_slot_table_limits() {
        let mut c = container(0);
        c.header.slots.clear();
        assert!(c.encode().is_err());

        c.header.slots = (0..=MAX_KEY_SLOTS).map(|i| slot(&format!("s{}", i))).collect();
        assert!(c.encode().is_err());
    }

    #[test]
    fn test_unknown_flags_rejected() {
        let mut bytes = container(0).encode().unwrap();
        bytes[12] = 0x80;
        assert!(matches!(V2Container::decode(&bytes), Err(Error::Corrupted(_))));
    }
}

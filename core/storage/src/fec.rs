//! Reed-Solomon forward error correction for container sections.
//!
//! Data is split into equal shards, parity shards are appended, and every
//! shard carries a CRC32. A shard whose checksum fails is treated as an
//! erasure and rebuilt from the survivors.
//!
//! Block layout (little-endian):
//! `[redundancy u8][data_shards u8][parity_shards u8][shard_len u32][original_len u32]`
//! `[preamble crc32 u32]`, followed by `data_shards + parity_shards` entries
//! of `[crc32 u32][shard]`. The preamble checksum covers the first 11 bytes;
//! geometry cannot be repaired, only detected as damaged.

use reed_solomon_erasure::galois_8::ReedSolomon;
use tracing::warn;

use lockbox_common::{Error, Result};

/// Smallest redundancy percentage a user may configure.
pub const MIN_REDUNDANCY: u8 = 5;
/// Largest redundancy percentage a user may configure.
pub const MAX_REDUNDANCY: u8 = 50;
/// Floor applied to header redundancy; the header is small and critical.
pub const HEADER_MIN_REDUNDANCY: u8 = 20;

const GEOMETRY_LEN: usize = 11;
const PREAMBLE_LEN: usize = GEOMETRY_LEN + 4;
const TARGET_SHARD_LEN: usize = 256;
const MAX_DATA_SHARDS: usize = 128;

/// Check a user-supplied redundancy percentage.
pub fn validate_redundancy(redundancy: u8) -> Result<()> {
    if !(MIN_REDUNDANCY..=MAX_REDUNDANCY).contains(&redundancy) {
        return Err(Error::InvalidInput(format!(
            "FEC redundancy must be {}-{}%, got {}%",
            MIN_REDUNDANCY, MAX_REDUNDANCY, redundancy
        )));
    }
    Ok(())
}

struct Geometry {
    data_shards: usize,
    parity_shards: usize,
    shard_len: usize,
    original_len: usize,
}

impl Geometry {
    fn encoded_len(&self) -> usize {
        PREAMBLE_LEN + (self.data_shards + self.parity_shards) * (4 + self.shard_len)
    }
}

fn read_geometry(block: &[u8]) -> Result<Geometry> {
    if block.len() < PREAMBLE_LEN {
        return Err(Error::Corrupted("FEC block truncated".to_string()));
    }
    let (geometry, crc) = block[..PREAMBLE_LEN].split_at(GEOMETRY_LEN);
    if crc32fast::hash(geometry) != u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]) {
        return Err(Error::Corrupted("FEC preamble checksum mismatch".to_string()));
    }

    let geometry = Geometry {
        data_shards: block[1] as usize,
        parity_shards: block[2] as usize,
        shard_len: u32::from_le_bytes([block[3], block[4], block[5], block[6]]) as usize,
        original_len: u32::from_le_bytes([block[7], block[8], block[9], block[10]]) as usize,
    };
    if geometry.data_shards == 0 || geometry.parity_shards == 0 || geometry.shard_len == 0 {
        return Err(Error::Corrupted("FEC geometry is empty".to_string()));
    }
    if geometry.original_len > geometry.data_shards * geometry.shard_len {
        return Err(Error::Corrupted("FEC length exceeds shard capacity".to_string()));
    }
    Ok(geometry)
}

fn codec(data_shards: usize, parity_shards: usize) -> Result<ReedSolomon> {
    ReedSolomon::new(data_shards, parity_shards)
        .map_err(|e| Error::Storage(format!("Invalid FEC geometry: {:?}", e)))
}

/// Encode `data` with `redundancy` percent parity.
///
/// # Errors
/// - `InvalidInput` if redundancy is outside 5-50%
pub fn encode(data: &[u8], redundancy: u8) -> Result<Vec<u8>> {
    validate_redundancy(redundancy)?;
    let original_len = u32::try_from(data.len())
        .map_err(|_| Error::InvalidInput("FEC input exceeds 4 GiB".to_string()))?;

    let data_shards = data.len().div_ceil(TARGET_SHARD_LEN).clamp(1, MAX_DATA_SHARDS);
    let shard_len = data.len().div_ceil(data_shards).max(1);
    let parity_shards = (data_shards * redundancy as usize).div_ceil(100).max(1);

    let mut shards: Vec<Vec<u8>> = (0..data_shards + parity_shards)
        .map(|i| {
            let start = (i * shard_len).min(data.len());
            let end = ((i + 1) * shard_len).min(data.len());
            let mut shard = if i < data_shards {
                data[start..end].to_vec()
            } else {
                Vec::new()
            };
            shard.resize(shard_len, 0);
            shard
        })
        .collect();

    codec(data_shards, parity_shards)?
        .encode(&mut shards)
        .map_err(|e| Error::Storage(format!("FEC encode failed: {:?}", e)))?;

    let mut out = Vec::with_capacity(PREAMBLE_LEN + shards.len() * (4 + shard_len));
    out.push(redundancy);
    out.push(data_shards as u8);
    out.push(parity_shards as u8);
    out.extend_from_slice(&(shard_len as u32).to_le_bytes());
    out.extend_from_slice(&original_len.to_le_bytes());
    let preamble_crc = crc32fast::hash(&out[..GEOMETRY_LEN]);
    out.extend_from_slice(&preamble_crc.to_le_bytes());
    for shard in &shards {
        out.extend_from_slice(&crc32fast::hash(shard).to_le_bytes());
        out.extend_from_slice(shard);
    }
    Ok(out)
}

/// Decode a block produced by `encode`, repairing damaged shards.
///
/// # Errors
/// - `Corrupted` if the preamble is damaged or invalid, or more shards are
///   damaged than there is parity to rebuild them
pub fn decode(block: &[u8]) -> Result<Vec<u8>> {
    let Geometry {
        data_shards,
        parity_shards,
        shard_len,
        original_len,
    } = read_geometry(block)?;

    let total = data_shards + parity_shards;
    let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(total);
    let mut damaged = 0usize;
    let mut offset = PREAMBLE_LEN;
    for _ in 0..total {
        let entry = block.get(offset..offset + 4 + shard_len);
        offset += 4 + shard_len;

        let shard = entry.and_then(|entry| {
            let (crc, shard) = entry.split_at(4);
            let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
            (crc32fast::hash(shard) == expected).then(|| shard.to_vec())
        });
        if shard.is_none() {
            damaged += 1;
        }
        shards.push(shard);
    }

    if damaged > parity_shards {
        return Err(Error::Corrupted(format!(
            "{} of {} FEC shards damaged, only {} recoverable",
            damaged, total, parity_shards
        )));
    }
    if damaged > 0 {
        codec(data_shards, parity_shards)?
            .reconstruct_data(&mut shards)
            .map_err(|e| Error::Corrupted(format!("FEC reconstruction failed: {:?}", e)))?;
        warn!(damaged, total, "Repaired damaged container shards");
    }

    let mut data = Vec::with_capacity(data_shards * shard_len);
    for shard in shards.into_iter().take(data_shards) {
        let shard = shard.ok_or_else(|| Error::Corrupted("FEC shard missing".to_string()))?;
        data.extend_from_slice(&shard);
    }
    data.truncate(original_len);
    Ok(data)
}

/// Total encoded length of a block, read from its preamble.
///
/// Lets a parser find where an FEC section ends without decoding it.
pub fn encoded_len(block: &[u8]) -> Result<usize> {
    Ok(read_geometry(block)?.encoded_len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_encode_decode_clean() {
        for len in [0, 1, 255, 256, 1000, 40_000] {
            let data = sample(len);
            let block = encode(&data, 20).unwrap();
            assert_eq!(encoded_len(&block).unwrap(), block.len());
            assert_eq!(decode(&block).unwrap(), data);
        }
    }

    #[test]
    fn test_repairs_corrupted_shard() {
        let data = sample(2_000);
        let mut block = encode(&data, 25).unwrap();

        // Damage bytes inside the first data shard
        block[PREAMBLE_LEN + 10] ^= 0xFF;
        block[PREAMBLE_LEN + 11] ^= 0xFF;

        assert_eq!(decode(&block).unwrap(), data);
    }

    #[test]
    fn test_too_much_damage_is_corruption() {
        let data = sample(2_000);
        let mut block = encode(&data, 5).unwrap();
        let shard_len = u32::from_le_bytes([block[3], block[4], block[5], block[6]]) as usize;

        // Hit two data shards while only one parity shard exists
        block[PREAMBLE_LEN + 4] ^= 0x01;
        block[PREAMBLE_LEN + (4 + shard_len) + 4] ^= 0x01;

        assert!(matches!(decode(&block), Err(Error::Corrupted(_))));
    }

    #[test]
    fn test_truncated_block_recovers_missing_tail() {
        let data = sample(3_000);
        let block = encode(&data, 30).unwrap();
        let shard_len = u32::from_le_bytes([block[3], block[4], block[5], block[6]]) as usize;

        // Losing the last parity shard is within budget
        let truncated = &block[..block.len() - (4 + shard_len)];
        assert_eq!(decode(truncated).unwrap(), data);
    }

    #[test]
    fn test_damaged_preamble_is_reported() {
        let data = sample(2_000);
        for index in [0, 3, 8, GEOMETRY_LEN + 1] {
            let mut block = encode(&data, 20).unwrap();
            block[index] ^= 0x01;
            let err = decode(&block).unwrap_err();
            assert!(matches!(&err, Error::Corrupted(msg) if msg.contains("preamble checksum")));
            assert!(matches!(encoded_len(&block), Err(Error::Corrupted(_))));
        }
    }

    #[test]
    fn test_redundancy_bounds() {
        assert!(encode(b"x", 4).is_err());
        assert!(encode(b"x", 51).is_err());
        assert!(encode(b"x", MIN_REDUNDANCY).is_ok());
        assert!(encode(b"x", MAX_REDUNDANCY).is_ok());
    }
}

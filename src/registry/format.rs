//! Registry region format
//!
//! ## Region Layout
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Header (32 bytes)                                            │
//! │ Magic "BREG" (4) | Version (2) | Reserved (2)                │
//! │ RecordCount (8) | UsedBytes (8) | Reserved (4) | CRC (4)     │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Record 1 | Record 2 | ... (append order, later wins)         │
//! └──────────────────────────────────────────────────────────────┘
//!
//! Record:
//! ┌──────┬─────────┬──────┬────────┬────────┬──────────┬─────────┬──────────┬─────┐
//! │ Kind │ NameLen │ Name │ Offset │ Length │ Checksum │ Created │ Modified │ CRC │
//! │ (1)  │  (4)    │ (n)  │  (8)   │  (8)   │   (4)    │   (8)   │   (8)    │ (4) │
//! └──────┴─────────┴──────┴────────┴────────┴──────────┴─────────┴──────────┴─────┘
//! ```

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

pub const REGION_MAGIC: &[u8; 4] = b"BREG";
pub const REGION_VERSION: u16 = 1;
pub const REGION_HEADER_SIZE: usize = 32;

/// Kind (1) + NameLen (4)
const RECORD_PREFIX: usize = 5;
/// Offset (8) + Length (8) + Checksum (4) + Created (8) + Modified (8) + CRC (4)
const RECORD_SUFFIX: usize = 40;

/// Location and integrity data of one stored block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockEntry {
    /// Byte offset of the block payload
    pub offset: u64,
    /// Payload length in bytes
    pub length: u64,
    /// Digest of the payload
    pub checksum: u32,
    /// Unix millis
    pub created_at: u64,
    /// Unix millis
    pub modified_at: u64,
}

impl BlockEntry {
    pub fn new(offset: u64, length: u64, checksum: u32, now: u64) -> Self {
        Self {
            offset,
            length,
            checksum,
            created_at: now,
            modified_at: now,
        }
    }

    /// End of the payload (exclusive)
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Upsert = 1,
    Remove = 2,
}

/// One decoded registry record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRecord {
    pub name: String,
    /// `None` for a removal
    pub entry: Option<BlockEntry>,
}

/// Decoded region header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionHeader {
    pub record_count: u64,
    /// Record bytes following the header
    pub used_bytes: u64,
}

impl RegionHeader {
    pub fn encode(&self) -> [u8; REGION_HEADER_SIZE] {
        let mut out = [0u8; REGION_HEADER_SIZE];
        {
            let mut buf = &mut out[..REGION_HEADER_SIZE - 4];
            buf.put_slice(REGION_MAGIC);
            buf.put_u16_le(REGION_VERSION);
            buf.put_u16_le(0);
            buf.put_u64_le(self.record_count);
            buf.put_u64_le(self.used_bytes);
            buf.put_u32_le(0);
        }
        let crc = crc32fast::hash(&out[..REGION_HEADER_SIZE - 4]);
        out[REGION_HEADER_SIZE - 4..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < REGION_HEADER_SIZE || &bytes[0..4] != REGION_MAGIC {
            return Err(VaultError::InvalidFormat("bad registry region magic".to_string()));
        }
        let stored_crc = (&bytes[REGION_HEADER_SIZE - 4..REGION_HEADER_SIZE]).get_u32_le();
        if crc32fast::hash(&bytes[..REGION_HEADER_SIZE - 4]) != stored_crc {
            return Err(VaultError::InvalidFormat(
                "registry region header checksum mismatch".to_string(),
            ));
        }

        let mut buf = &bytes[4..REGION_HEADER_SIZE - 4];
        let version = buf.get_u16_le();
        if version != REGION_VERSION {
            return Err(VaultError::UnsupportedFeature(format!(
                "registry region version {}",
                version
            )));
        }
        buf.advance(2);
        Ok(Self {
            record_count: buf.get_u64_le(),
            used_bytes: buf.get_u64_le(),
        })
    }
}

/// Encoded size of a record for `name`
pub fn record_len(name: &str) -> usize {
    RECORD_PREFIX + name.len() + RECORD_SUFFIX
}

/// Append one record to `out`
pub fn encode_record(out: &mut Vec<u8>, name: &str, entry: Option<&BlockEntry>) {
    let start = out.len();
    let kind = if entry.is_some() { RecordKind::Upsert } else { RecordKind::Remove };
    let blank = BlockEntry::new(0, 0, 0, 0);
    let entry = entry.unwrap_or(&blank);

    out.put_u8(kind as u8);
    out.put_u32_le(name.len() as u32);
    out.put_slice(name.as_bytes());
    out.put_u64_le(entry.offset);
    out.put_u64_le(entry.length);
    out.put_u32_le(entry.checksum);
    out.put_u64_le(entry.created_at);
    out.put_u64_le(entry.modified_at);
    let crc = crc32fast::hash(&out[start..]);
    out.put_u32_le(crc);
}

/// Decode up to `count` records
///
/// Decoding stops at the first record that is truncated or fails its CRC;
/// such a tail is the remains of an interrupted append. Returns the records
/// read and whether a damaged tail was skipped.
pub fn decode_records(mut bytes: &[u8], count: u64) -> (Vec<RegistryRecord>, bool) {
    let mut records = Vec::with_capacity(count.min(1 << 20) as usize);

    for _ in 0..count {
        match decode_one(bytes) {
            Some((record, consumed)) => {
                records.push(record);
                bytes = &bytes[consumed..];
            }
            None => return (records, true),
        }
    }
    (records, false)
}

fn decode_one(bytes: &[u8]) -> Option<(RegistryRecord, usize)> {
    if bytes.len() < RECORD_PREFIX {
        return None;
    }
    let mut buf = bytes;
    let kind = buf.get_u8();
    let name_len = buf.get_u32_le() as usize;
    let total = RECORD_PREFIX + name_len + RECORD_SUFFIX;
    if bytes.len() < total {
        return None;
    }

    let stored_crc = (&bytes[total - 4..total]).get_u32_le();
    if crc32fast::hash(&bytes[..total - 4]) != stored_crc {
        return None;
    }

    let name = String::from_utf8(buf[..name_len].to_vec()).ok()?;
    buf.advance(name_len);
    let entry = BlockEntry {
        offset: buf.get_u64_le(),
        length: buf.get_u64_le(),
        checksum: buf.get_u32_le(),
        created_at: buf.get_u64_le(),
        modified_at: buf.get_u64_le(),
    };

    let entry = match kind {
        k if k == RecordKind::Upsert as u8 => Some(entry),
        k if k == RecordKind::Remove as u8 => None,
        _ => return None,
    };
    Some((RegistryRecord { name, entry }, total))
}

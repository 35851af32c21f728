//! WAL region geometry and its header page

use bytes::{Buf, BufMut};

use crate::error::{Result, VaultError};
use crate::io::{PagedFile, Region};

pub const WAL_MAGIC: &[u8; 4] = b"WALR";
pub const WAL_VERSION: u16 = 1;

/// Magic (4) + Version (2) + Reserved (2) + CheckpointLsn (8) + Truncations (8) + CRC (4)
const REGION_HEADER_LEN: usize = 28;

/// Where the WAL lives in the file
///
/// The first page holds [`WalRegionHeader`]; frames fill the remaining pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalRegion {
    pub region: Region,
    pub page_size: u32,
}

impl WalRegion {
    pub fn new(region: Region, page_size: u32) -> Self {
        Self { region, page_size }
    }

    /// Byte offset of the first frame
    pub fn entries_offset(&self) -> u64 {
        self.region.offset + self.page_size as u64
    }

    /// Bytes available for frames
    pub fn capacity(&self) -> u64 {
        self.region.byte_len(self.page_size).saturating_sub(self.page_size as u64)
    }
}

/// Contents of the WAL header page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WalRegionHeader {
    /// Every LSN up to and including this one is reflected in the main file
    pub checkpoint_lsn: u64,
    /// Number of times the log was reset
    pub truncations: u64,
}

impl WalRegionHeader {
    pub fn encode(&self) -> [u8; REGION_HEADER_LEN] {
        let mut out = [0u8; REGION_HEADER_LEN];
        {
            let mut buf = &mut out[..REGION_HEADER_LEN - 4];
            buf.put_slice(WAL_MAGIC);
            buf.put_u16_le(WAL_VERSION);
            buf.put_u16_le(0);
            buf.put_u64_le(self.checkpoint_lsn);
            buf.put_u64_le(self.truncations);
        }
        let crc = crc32fast::hash(&out[..REGION_HEADER_LEN - 4]);
        out[REGION_HEADER_LEN - 4..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < REGION_HEADER_LEN || &bytes[0..4] != WAL_MAGIC {
            return Err(VaultError::ReplayFailure("WAL region header missing".to_string()));
        }
        let stored_crc = (&bytes[REGION_HEADER_LEN - 4..REGION_HEADER_LEN]).get_u32_le();
        if crc32fast::hash(&bytes[..REGION_HEADER_LEN - 4]) != stored_crc {
            return Err(VaultError::ReplayFailure(
                "WAL region header checksum mismatch".to_string(),
            ));
        }
        let mut buf = &bytes[4..REGION_HEADER_LEN - 4];
        let version = buf.get_u16_le();
        if version != WAL_VERSION {
            return Err(VaultError::UnsupportedFeature(format!("WAL version {}", version)));
        }
        buf.advance(2);
        Ok(Self {
            checkpoint_lsn: buf.get_u64_le(),
            truncations: buf.get_u64_le(),
        })
    }

    pub fn read(file: &PagedFile, wal: &WalRegion) -> Result<Self> {
        let mut bytes = [0u8; REGION_HEADER_LEN];
        file.read_exact_at(&mut bytes, wal.region.offset)?;
        Self::decode(&bytes)
    }

    /// Write and fsync
    pub fn write(&self, file: &PagedFile, wal: &WalRegion) -> Result<()> {
        file.write_all_at(&self.encode(), wal.region.offset)?;
        file.sync()
    }
}

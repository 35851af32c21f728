//! File Header
//!
//! Fixed 512-byte header describing the file's format and regions.
//!
//! ## Layout (little-endian)
//! ```text
//! ┌────────┬──────────────────────────────────────────────┐
//! │ 0..8   │ Magic "PGVAULT\0"                            │
//! │ 8..10  │ Format version (u16)                         │
//! │ 10..12 │ Header size (u16) = 512                      │
//! │ 12..16 │ Page size (u32)                              │
//! │ 16..20 │ Feature flags (u32)                          │
//! │ 20..24 │ Overflow threshold bytes (u32)               │
//! │ 24     │ Compression algorithm (u8)                   │
//! │ 25     │ Checksum algorithm (u8)                      │
//! │ 26..32 │ Reserved                                     │
//! │ 32..40 │ Sequence (u64)                               │
//! │ 40..56 │ WAL offset, length (bytes)                   │
//! │ 56..72 │ Registry offset, pages                       │
//! │ 72..88 │ FSM offset, pages                            │
//! │ 88..104│ Table directory offset, length               │
//! │104..112│ Last transaction id                          │
//! │112..120│ Checkpoint LSN                               │
//! │120..144│ Stats: total pages, block count, checkpoints │
//! │144..160│ Created / modified (unix millis)             │
//! │160..508│ Reserved (zero)                              │
//! │508..512│ CRC32 of bytes 0..508                        │
//! └────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Two copies live at byte 0 and byte 512. Each write goes to the slot
//! selected by the incremented sequence number, so the previous header
//! survives a torn write. Open picks the valid slot with the highest sequence.

use bytes::{Buf, BufMut};

use crate::error::{Result, VaultError};
use crate::io::PagedFile;

/// Magic bytes identifying a pagevault file
pub const MAGIC: &[u8; 8] = b"PGVAULT\0";

/// Current file format version
pub const FORMAT_VERSION: u16 = 1;

/// Size of one header slot
pub const HEADER_SIZE: usize = 512;

/// Byte offsets of the two header slots
pub const HEADER_SLOTS: [u64; 2] = [0, HEADER_SIZE as u64];

const CRC_OFFSET: usize = HEADER_SIZE - 4;

// =============================================================================
// Feature Flags
// =============================================================================

/// Rows larger than the inline threshold are split into overflow chains
pub const FEATURE_ROW_OVERFLOW: u32 = 1 << 0;

/// Overflow chain payloads may be compressed
pub const FEATURE_OVERFLOW_COMPRESSION: u32 = 1 << 1;

/// Overflow pages carry back pointers
pub const FEATURE_DOUBLY_LINKED_CHAINS: u32 = 1 << 2;

/// Every flag this implementation understands
pub const SUPPORTED_FEATURES: u32 =
    FEATURE_ROW_OVERFLOW | FEATURE_OVERFLOW_COMPRESSION | FEATURE_DOUBLY_LINKED_CHAINS;

// =============================================================================
// Region
// =============================================================================

/// A run of contiguous pages holding a system structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    /// Byte offset of the first page
    pub offset: u64,
    /// Number of pages
    pub pages: u64,
}

impl Region {
    pub fn new(offset: u64, pages: u64) -> Self {
        Self { offset, pages }
    }

    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    /// Capacity in bytes for a given page size
    pub fn byte_len(&self, page_size: u32) -> u64 {
        self.pages * page_size as u64
    }
}

// =============================================================================
// File Header
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub format_version: u16,
    pub page_size: u32,
    pub feature_flags: u32,
    pub overflow_threshold_bytes: u32,
    pub compression_algorithm: u8,
    pub checksum_algorithm: u8,
    /// Incremented on every header write; selects the slot
    pub sequence: u64,
    pub wal_offset: u64,
    pub wal_length: u64,
    pub registry: Region,
    pub fsm: Region,
    pub table_directory_offset: u64,
    pub table_directory_length: u64,
    pub last_txn_id: u64,
    pub checkpoint_lsn: u64,
    pub total_pages: u64,
    pub block_count: u64,
    pub checkpoint_count: u64,
    pub created_at: u64,
    pub modified_at: u64,
}

impl FileHeader {
    /// A header for a freshly created file
    pub fn new(
        page_size: u32,
        feature_flags: u32,
        overflow_threshold_bytes: u32,
        compression_algorithm: u8,
        checksum_algorithm: u8,
        wal_offset: u64,
        wal_length: u64,
    ) -> Self {
        let now = unix_millis();
        Self {
            format_version: FORMAT_VERSION,
            page_size,
            feature_flags,
            overflow_threshold_bytes,
            compression_algorithm,
            checksum_algorithm,
            sequence: 0,
            wal_offset,
            wal_length,
            registry: Region::default(),
            fsm: Region::default(),
            table_directory_offset: 0,
            table_directory_length: 0,
            last_txn_id: 0,
            checkpoint_lsn: 0,
            total_pages: 0,
            block_count: 0,
            checkpoint_count: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn has_feature(&self, flag: u32) -> bool {
        self.feature_flags & flag != 0
    }

    /// Reject files written by a newer or extended implementation
    pub fn validate_features(&self) -> Result<()> {
        if self.format_version > FORMAT_VERSION {
            return Err(VaultError::UnsupportedFeature(format!(
                "format version {} (this build supports up to {})",
                self.format_version, FORMAT_VERSION
            )));
        }
        let unknown = self.feature_flags & !SUPPORTED_FEATURES;
        if unknown != 0 {
            return Err(VaultError::UnsupportedFeature(format!(
                "feature flags {:#010x}",
                unknown
            )));
        }
        Ok(())
    }

    /// Serialize into one 512-byte slot
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        {
            let mut buf = &mut out[..CRC_OFFSET];
            buf.put_slice(MAGIC);
            buf.put_u16_le(self.format_version);
            buf.put_u16_le(HEADER_SIZE as u16);
            buf.put_u32_le(self.page_size);
            buf.put_u32_le(self.feature_flags);
            buf.put_u32_le(self.overflow_threshold_bytes);
            buf.put_u8(self.compression_algorithm);
            buf.put_u8(self.checksum_algorithm);
            buf.put_bytes(0, 6);
            buf.put_u64_le(self.sequence);
            buf.put_u64_le(self.wal_offset);
            buf.put_u64_le(self.wal_length);
            buf.put_u64_le(self.registry.offset);
            buf.put_u64_le(self.registry.pages);
            buf.put_u64_le(self.fsm.offset);
            buf.put_u64_le(self.fsm.pages);
            buf.put_u64_le(self.table_directory_offset);
            buf.put_u64_le(self.table_directory_length);
            buf.put_u64_le(self.last_txn_id);
            buf.put_u64_le(self.checkpoint_lsn);
            buf.put_u64_le(self.total_pages);
            buf.put_u64_le(self.block_count);
            buf.put_u64_le(self.checkpoint_count);
            buf.put_u64_le(self.created_at);
            buf.put_u64_le(self.modified_at);
        }
        let crc = crc32fast::hash(&out[..CRC_OFFSET]);
        out[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse one slot, validating magic and CRC
    pub fn decode(slot: &[u8]) -> Result<Self> {
        if slot.len() < HEADER_SIZE {
            return Err(VaultError::InvalidFormat(format!(
                "header slot too short: {} bytes",
                slot.len()
            )));
        }
        if &slot[0..8] != MAGIC {
            return Err(VaultError::InvalidFormat(
                "not a pagevault file (bad magic)".to_string(),
            ));
        }
        let stored_crc = (&slot[CRC_OFFSET..HEADER_SIZE]).get_u32_le();
        if crc32fast::hash(&slot[..CRC_OFFSET]) != stored_crc {
            return Err(VaultError::InvalidFormat("header checksum mismatch".to_string()));
        }

        let mut buf = &slot[8..CRC_OFFSET];
        let format_version = buf.get_u16_le();
        let header_size = buf.get_u16_le();
        if header_size as usize != HEADER_SIZE {
            return Err(VaultError::InvalidFormat(format!(
                "unexpected header size {}",
                header_size
            )));
        }
        let page_size = buf.get_u32_le();
        let feature_flags = buf.get_u32_le();
        let overflow_threshold_bytes = buf.get_u32_le();
        let compression_algorithm = buf.get_u8();
        let checksum_algorithm = buf.get_u8();
        buf.advance(6);

        Ok(Self {
            format_version,
            page_size,
            feature_flags,
            overflow_threshold_bytes,
            compression_algorithm,
            checksum_algorithm,
            sequence: buf.get_u64_le(),
            wal_offset: buf.get_u64_le(),
            wal_length: buf.get_u64_le(),
            registry: Region::new(buf.get_u64_le(), buf.get_u64_le()),
            fsm: Region::new(buf.get_u64_le(), buf.get_u64_le()),
            table_directory_offset: buf.get_u64_le(),
            table_directory_length: buf.get_u64_le(),
            last_txn_id: buf.get_u64_le(),
            checkpoint_lsn: buf.get_u64_le(),
            total_pages: buf.get_u64_le(),
            block_count: buf.get_u64_le(),
            checkpoint_count: buf.get_u64_le(),
            created_at: buf.get_u64_le(),
            modified_at: buf.get_u64_le(),
        })
    }

    /// Read both slots and return the newest valid header
    pub fn read_latest(file: &PagedFile) -> Result<Self> {
        let mut best: Option<FileHeader> = None;
        let mut last_err = None;

        for slot_offset in HEADER_SLOTS {
            let mut slot = [0u8; HEADER_SIZE];
            if let Err(e) = file.read_exact_at(&mut slot, slot_offset) {
                last_err = Some(e);
                continue;
            }
            match Self::decode(&slot) {
                Ok(header) => {
                    if best.as_ref().map_or(true, |b| header.sequence > b.sequence) {
                        best = Some(header);
                    }
                }
                Err(e) => {
                    tracing::debug!(slot = slot_offset, error = %e, "header slot rejected");
                    last_err = Some(e);
                }
            }
        }

        match best {
            Some(header) => Ok(header),
            None => Err(last_err.unwrap_or_else(|| {
                VaultError::InvalidFormat("no valid header slot".to_string())
            })),
        }
    }

    /// Bump the sequence and write to the next slot, then fsync
    pub fn write_next(&mut self, file: &PagedFile) -> Result<()> {
        self.sequence += 1;
        self.modified_at = unix_millis();
        let slot = HEADER_SLOTS[(self.sequence % 2) as usize];
        file.write_all_at(&self.encode(), slot)?;
        file.sync()
    }
}

/// Milliseconds since the unix epoch
pub(crate) fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

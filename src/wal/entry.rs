//! WAL Entry definitions
//!
//! Defines the structure of individual WAL log entries and their frame.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::io::header::unix_millis;
use crate::registry::BlockEntry;

/// Frame header: LSN (8) + CRC (4) + Len (4)
pub const HEADER_SIZE: usize = 16;

/// Upper bound on a frame's size, not counting its image and name bytes
pub const MAX_FRAME_OVERHEAD: u64 = 128;

/// A single entry in the WAL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Log Sequence Number - monotonically increasing, never reused
    pub lsn: u64,

    /// Transaction this entry belongs to
    pub txn_id: u64,

    /// The logged action
    pub operation: Operation,

    /// Timestamp (unix millis) when entry was created
    pub timestamp: u64,
}

/// Actions that can be logged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Pages at `offset` were allocated and written
    ///
    /// `image` holds the bytes written when the transaction's image budget
    /// allowed it; otherwise the data file is synced before commit.
    PageWrite {
        offset: u64,
        page_count: u32,
        image: Option<Vec<u8>>,
    },

    /// Pages at `offset` are released when the transaction commits
    PageFree { offset: u64, page_count: u32 },

    /// Registry entry set on commit
    RegistryUpsert { name: String, entry: BlockEntry },

    /// Registry entry removed on commit
    RegistryRemove { name: String },

    /// Durability boundary of the transaction
    Commit,

    /// Transaction abandoned; its allocations are void
    Rollback,
}

/// Entry discriminant, for counting and filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    PageWrite,
    PageFree,
    RegistryUpsert,
    RegistryRemove,
    Commit,
    Rollback,
}

impl WalEntry {
    pub fn new(lsn: u64, txn_id: u64, operation: Operation) -> Self {
        Self {
            lsn,
            txn_id,
            operation,
            timestamp: unix_millis(),
        }
    }

    pub fn entry_type(&self) -> EntryType {
        match self.operation {
            Operation::PageWrite { .. } => EntryType::PageWrite,
            Operation::PageFree { .. } => EntryType::PageFree,
            Operation::RegistryUpsert { .. } => EntryType::RegistryUpsert,
            Operation::RegistryRemove { .. } => EntryType::RegistryRemove,
            Operation::Commit => EntryType::Commit,
            Operation::Rollback => EntryType::Rollback,
        }
    }

    /// File offset the entry touches, if any
    pub fn affected_offset(&self) -> Option<u64> {
        match &self.operation {
            Operation::PageWrite { offset, .. } | Operation::PageFree { offset, .. } => {
                Some(*offset)
            }
            Operation::RegistryUpsert { entry, .. } => Some(entry.offset),
            _ => None,
        }
    }

    /// Encode as a complete frame (header + bincode body)
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.put_u64_le(self.lsn);
        frame.put_u32_le(frame_crc(self.lsn, &body));
        frame.put_u32_le(body.len() as u32);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a complete frame, verifying its CRC
    pub fn deserialize(frame: &[u8]) -> Result<Self> {
        let header = FrameHeader::parse(frame)?;
        let end = HEADER_SIZE + header.len as usize;
        if frame.len() < end {
            return Err(VaultError::Serialization(format!(
                "frame truncated: {} of {} bytes",
                frame.len(),
                end
            )));
        }
        let body = &frame[HEADER_SIZE..end];
        if !header.matches(body) {
            return Err(VaultError::Serialization(format!(
                "CRC mismatch for LSN {}",
                header.lsn
            )));
        }
        let entry: WalEntry = bincode::deserialize(body)?;
        if entry.lsn != header.lsn {
            return Err(VaultError::Serialization(format!(
                "frame LSN {} does not match entry LSN {}",
                header.lsn, entry.lsn
            )));
        }
        Ok(entry)
    }
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub lsn: u64,
    pub crc: u32,
    pub len: u32,
}

impl FrameHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(VaultError::Serialization("frame header truncated".to_string()));
        }
        let mut buf = &bytes[..HEADER_SIZE];
        Ok(Self {
            lsn: buf.get_u64_le(),
            crc: buf.get_u32_le(),
            len: buf.get_u32_le(),
        })
    }

    /// Whether `body` is what this header describes
    pub fn matches(&self, body: &[u8]) -> bool {
        body.len() == self.len as usize && frame_crc(self.lsn, body) == self.crc
    }
}

/// CRC over the LSN and the body
fn frame_crc(lsn: u64, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&lsn.to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}

//! Inline/overflow split of serialized records
//!
//! ## Overflow Record
//! ```text
//! ┌──────────────────────────── metadata (36) ─────────────────────────────┐
//! ┌──────────┬───────────┬───────────┬────────────┬───────────┬───────────┬──────────────┐
//! │ Magic (4)│ Total (8) │ Pages (4) │ Inline (4) │ First (8) │ Last (8)  │ Inline bytes │
//! └──────────┴───────────┴───────────┴────────────┴───────────┴───────────┴──────────────┘
//! ```
//!
//! Read as a plain row's column count, the magic is over a billion columns.
//! A payload is only treated as overflow metadata when its length is also
//! exactly `36 + Inline`.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{Result, VaultError};
use crate::overflow::{ChainHead, ChainReader, ChainWriter};

use super::{codec, Row};

pub const OVERFLOW_MAGIC: [u8; 4] = [0xF0, b'O', b'V', b'F'];

/// Inline prefix of an overflowed record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowMetadata {
    /// Size of the complete record
    pub total_size: u64,
    pub page_count: u32,
    /// Bytes kept inline after the metadata
    pub inline_size: u32,
    pub first_offset: u64,
    pub last_offset: u64,
}

impl OverflowMetadata {
    pub const SIZE: usize = 36;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_slice(&OVERFLOW_MAGIC);
        buf.put_u64_le(self.total_size);
        buf.put_u32_le(self.page_count);
        buf.put_u32_le(self.inline_size);
        buf.put_u64_le(self.first_offset);
        buf.put_u64_le(self.last_offset);
        out
    }

    /// Parse an overflow record, or `None` if `payload` is a plain record
    pub fn parse(payload: &[u8]) -> Option<(Self, &[u8])> {
        if payload.len() < Self::SIZE || payload[..4] != OVERFLOW_MAGIC {
            return None;
        }
        let mut buf = &payload[4..Self::SIZE];
        let meta = Self {
            total_size: buf.get_u64_le(),
            page_count: buf.get_u32_le(),
            inline_size: buf.get_u32_le(),
            first_offset: buf.get_u64_le(),
            last_offset: buf.get_u64_le(),
        };
        let inline = &payload[Self::SIZE..];
        if inline.len() != meta.inline_size as usize || meta.total_size < meta.inline_size as u64 {
            return None;
        }
        Some((meta, inline))
    }

    pub fn chain_head(&self) -> ChainHead {
        ChainHead {
            first_offset: self.first_offset,
            last_offset: self.last_offset,
            page_count: self.page_count,
            data_len: self.total_size - self.inline_size as u64,
        }
    }
}

/// Size limits for the inline part of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineLimits {
    /// Records larger than this are split
    pub threshold: usize,
    /// Most bytes a single page can hold for a record
    pub page_capacity: usize,
    pub overflow_enabled: bool,
}

/// A record ready to be written to its data page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRecord {
    Inline(Bytes),
    Overflow {
        /// Metadata followed by the inline bytes
        payload: Bytes,
        metadata: OverflowMetadata,
    },
}

impl StoredRecord {
    pub fn payload(&self) -> &Bytes {
        match self {
            StoredRecord::Inline(payload) | StoredRecord::Overflow { payload, .. } => payload,
        }
    }

    pub fn is_overflow(&self) -> bool {
        matches!(self, StoredRecord::Overflow { .. })
    }

    pub fn metadata(&self) -> Option<&OverflowMetadata> {
        match self {
            StoredRecord::Overflow { metadata, .. } => Some(metadata),
            StoredRecord::Inline(_) => None,
        }
    }
}

/// Keep `bytes` inline or move its tail into an overflow chain
pub fn split_with_overflow(
    bytes: Bytes,
    limits: InlineLimits,
    writer: &mut dyn ChainWriter,
    compress: bool,
) -> Result<StoredRecord> {
    let size = bytes.len();

    if !limits.overflow_enabled || size <= limits.threshold {
        if size > limits.page_capacity {
            return Err(VaultError::RecordTooLargeForPage {
                size,
                max: limits.page_capacity,
            });
        }
        return Ok(StoredRecord::Inline(bytes));
    }

    let inline_size = limits.threshold.saturating_sub(OverflowMetadata::SIZE);
    let inline_total = OverflowMetadata::SIZE + inline_size;
    if inline_total > limits.page_capacity {
        return Err(VaultError::RecordTooLargeForPage {
            size: inline_total,
            max: limits.page_capacity,
        });
    }

    let chain = writer.write_chain(&bytes[inline_size..], compress)?;
    let metadata = OverflowMetadata {
        total_size: size as u64,
        page_count: chain.page_count,
        inline_size: inline_size as u32,
        first_offset: chain.first_offset,
        last_offset: chain.last_offset,
    };

    let mut payload = Vec::with_capacity(inline_total);
    payload.extend_from_slice(&metadata.encode());
    payload.extend_from_slice(&bytes[..inline_size]);
    Ok(StoredRecord::Overflow {
        payload: Bytes::from(payload),
        metadata,
    })
}

/// Rebuild the full record from its stored payload
///
/// Plain payloads are returned as they are.
pub fn assemble_with_overflow(payload: &[u8], reader: &dyn ChainReader) -> Result<Vec<u8>> {
    match OverflowMetadata::parse(payload) {
        Some((metadata, inline)) => assemble(&metadata, inline, reader),
        None => Ok(payload.to_vec()),
    }
}

/// Concatenate the inline bytes and the chain
pub fn assemble(metadata: &OverflowMetadata, inline: &[u8], reader: &dyn ChainReader) -> Result<Vec<u8>> {
    let tail = reader.read_chain(&metadata.chain_head())?;
    let mut out = Vec::with_capacity(metadata.total_size as usize);
    out.extend_from_slice(inline);
    out.extend_from_slice(&tail);
    if out.len() as u64 != metadata.total_size {
        return Err(VaultError::CorruptChain {
            offset: metadata.first_offset,
            reason: format!("record is {} bytes, expected {}", out.len(), metadata.total_size),
        });
    }
    Ok(out)
}

/// Serialize a row and split it when it exceeds the inline threshold
pub fn serialize_with_overflow(
    row: &Row,
    limits: InlineLimits,
    writer: &mut dyn ChainWriter,
    compress: bool,
) -> Result<StoredRecord> {
    split_with_overflow(codec::serialize(row), limits, writer, compress)
}

/// Decode a row stored inline or with an overflow chain
pub fn deserialize_with_overflow(payload: &[u8], reader: &dyn ChainReader) -> Result<Row> {
    codec::deserialize(&assemble_with_overflow(payload, reader)?)
}

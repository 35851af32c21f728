//! Overflow page format
//!
//! ## Layout (32-byte header, little-endian)
//! ```text
//! ┌───────────┬──────────┬───────────┬──────────┬──────────┐
//! │ Magic (4) │ Type (1) │ Flags (1) │ Algo (1) │ Rsvd (1) │
//! ├───────────┴──────────┴───────────┴──────────┴──────────┤
//! │ PrevOffset (8)                                         │
//! │ NextOffset (8)                                         │
//! ├──────────────────────┬──────────────────┬──────────────┤
//! │ Uncompressed (2)     │ Stored (2)       │ Checksum (4) │
//! ├──────────────────────┴──────────────────┴──────────────┤
//! │ Payload (Stored bytes)                                 │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! The checksum covers the payload only. Link fields are checked by the chain
//! walk (alignment, bounds, back links), which is what lets a chain with a
//! damaged forward link still be read from its tail.
//! `Uncompressed` is zero on pages of a compressed chain.

use bytes::{Buf, BufMut};

use crate::checksum::Checksum;
use crate::error::{Result, VaultError};

pub const OVERFLOW_PAGE_MAGIC: &[u8; 4] = b"OVFP";

/// Page type byte of overflow pages
pub const PAGE_TYPE_OVERFLOW: u8 = 2;

pub const OVERFLOW_HEADER_SIZE: usize = 32;

/// Page flag bits
pub mod flags {
    /// Payload is part of a compressed stream
    pub const COMPRESSED: u8 = 1 << 0;
    /// `prev` is populated
    pub const DOUBLY_LINKED: u8 = 1 << 1;
    /// Final page of the chain
    pub const LAST: u8 = 1 << 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowPageHeader {
    pub flags: u8,
    pub compression: u8,
    pub prev: u64,
    pub next: u64,
    pub uncompressed_size: u16,
    pub stored_size: u16,
}

impl OverflowPageHeader {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Write header and payload into `page`, returning the used length
    pub fn write_page(&self, page: &mut [u8], payload: &[u8], checksum: &dyn Checksum) -> usize {
        let used = OVERFLOW_HEADER_SIZE + payload.len();
        {
            let mut buf = &mut page[..OVERFLOW_HEADER_SIZE];
            buf.put_slice(OVERFLOW_PAGE_MAGIC);
            buf.put_u8(PAGE_TYPE_OVERFLOW);
            buf.put_u8(self.flags);
            buf.put_u8(self.compression);
            buf.put_u8(0);
            buf.put_u64_le(self.prev);
            buf.put_u64_le(self.next);
            buf.put_u16_le(self.uncompressed_size);
            buf.put_u16_le(self.stored_size);
            buf.put_u32_le(checksum.compute(payload));
        }
        page[OVERFLOW_HEADER_SIZE..used].copy_from_slice(payload);
        used
    }

    /// Parse a page read from `offset` and verify its payload
    pub fn read_page(page: &[u8], offset: u64, checksum: &dyn Checksum) -> Result<Self> {
        let corrupt = |reason: String| VaultError::CorruptChain { offset, reason };

        if page.len() < OVERFLOW_HEADER_SIZE || &page[0..4] != OVERFLOW_PAGE_MAGIC {
            return Err(corrupt("missing overflow page magic".to_string()));
        }

        let mut buf = &page[4..OVERFLOW_HEADER_SIZE];
        let page_type = buf.get_u8();
        if page_type != PAGE_TYPE_OVERFLOW {
            return Err(corrupt(format!("unexpected page type {}", page_type)));
        }
        let flags = buf.get_u8();
        let compression = buf.get_u8();
        buf.advance(1);
        let header = Self {
            flags,
            compression,
            prev: buf.get_u64_le(),
            next: buf.get_u64_le(),
            uncompressed_size: buf.get_u16_le(),
            stored_size: buf.get_u16_le(),
        };
        let stored_digest = buf.get_u32_le();

        let used = OVERFLOW_HEADER_SIZE + header.stored_size as usize;
        if used > page.len() {
            return Err(corrupt(format!(
                "payload of {} bytes does not fit the page",
                header.stored_size
            )));
        }

        if !checksum.verify(&page[OVERFLOW_HEADER_SIZE..used], stored_digest) {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        Ok(header)
    }
}

/// Payload of a page already validated by [`OverflowPageHeader::read_page`]
pub fn payload<'a>(page: &'a [u8], header: &OverflowPageHeader) -> &'a [u8] {
    &page[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + header.stored_size as usize]
}

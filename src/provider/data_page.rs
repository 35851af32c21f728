//! Data page format
//!
//! ```text
//! ┌───────────┬──────────┬───────────┬──────────┬────────────────┬──────────────┐
//! │ Magic (4) │ Type (1) │ Flags (1) │ Rsvd (2) │ PayloadLen (4) │ Checksum (4) │
//! ├───────────┴──────────┴───────────┴──────────┴────────────────┴──────────────┤
//! │ Payload (block bytes or overflow metadata + inline bytes)                   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A block entry's offset points at the payload, 16 bytes into the page.

use bytes::{Buf, BufMut};

pub const DATA_PAGE_MAGIC: &[u8; 4] = b"DPG1";

pub const PAGE_TYPE_DATA: u8 = 1;

pub const DATA_HEADER_SIZE: usize = 16;

/// Payload is an overflow metadata record
pub const FLAG_OVERFLOW_RECORD: u8 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPageHeader {
    pub flags: u8,
    pub payload_len: u32,
    pub checksum: u32,
}

impl DataPageHeader {
    pub fn is_overflow_record(&self) -> bool {
        self.flags & FLAG_OVERFLOW_RECORD != 0
    }

    /// Write header and payload into `page`, returning the used length
    pub fn write_page(&self, page: &mut [u8], payload: &[u8]) -> usize {
        {
            let mut buf = &mut page[..DATA_HEADER_SIZE];
            buf.put_slice(DATA_PAGE_MAGIC);
            buf.put_u8(PAGE_TYPE_DATA);
            buf.put_u8(self.flags);
            buf.put_u16_le(0);
            buf.put_u32_le(self.payload_len);
            buf.put_u32_le(self.checksum);
        }
        let used = DATA_HEADER_SIZE + payload.len();
        page[DATA_HEADER_SIZE..used].copy_from_slice(payload);
        used
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DATA_HEADER_SIZE || &bytes[0..4] != DATA_PAGE_MAGIC {
            return None;
        }
        let mut buf = &bytes[4..DATA_HEADER_SIZE];
        if buf.get_u8() != PAGE_TYPE_DATA {
            return None;
        }
        let flags = buf.get_u8();
        buf.advance(2);
        Some(Self {
            flags,
            payload_len: buf.get_u32_le(),
            checksum: buf.get_u32_le(),
        })
    }
}

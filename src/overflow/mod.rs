//! Overflow Page Module
//!
//! Stores the part of a record that does not fit inline in a chain of
//! overflow pages.
//!
//! ## Chain Structure
//! ```text
//!  inline record                 overflow pages (any order on disk)
//! ┌──────────────┐   first   ┌─────────┐ next ┌─────────┐ next ┌─────────┐
//! │ metadata     │──────────►│ page 1  │─────►│ page 2  │─────►│ page 3  │──► 0
//! │ inline bytes │           │         │◄─────│         │◄─────│  LAST   │
//! └──────────────┘           └─────────┘ prev └─────────┘ prev └─────────┘
//!                                 ▲                                  │
//!                                 └──────────── last ────────────────┘
//! ```
//!
//! The chain is compressed as a whole (when enabled and worthwhile) before it
//! is cut into pages. Back links let a chain with one damaged forward link
//! be read from the tail.

mod chain;
mod compression;
mod page;

pub use chain::{ChainSession, ChainView, OverflowManager};
pub use compression::CompressionAlgorithm;
pub use page::{flags, OverflowPageHeader, OVERFLOW_HEADER_SIZE, OVERFLOW_PAGE_MAGIC, PAGE_TYPE_OVERFLOW};

use crate::error::Result;

/// Where a written chain ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainInfo {
    pub first_offset: u64,
    pub last_offset: u64,
    pub page_count: u32,
    /// Bytes stored across the pages (after compression)
    pub stored_len: u64,
    pub compressed: bool,
}

/// What a reader needs to find and check a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHead {
    pub first_offset: u64,
    pub last_offset: u64,
    pub page_count: u32,
    /// Length of the original (uncompressed) data
    pub data_len: u64,
}

/// Sink for chain data
pub trait ChainWriter {
    fn write_chain(&mut self, data: &[u8], compress: bool) -> Result<ChainInfo>;
}

/// Source of chain data
pub trait ChainReader {
    fn read_chain(&self, head: &ChainHead) -> Result<Vec<u8>>;
}

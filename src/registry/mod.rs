//! Block Registry Module
//!
//! Maps block names to their location in the file.
//!
//! ## Responsibilities
//! - O(1) name lookup from an in-memory hash table
//! - Track which names changed since the last flush
//! - Persist changes in batches: one contiguous append plus one fsync
//! - Compact the on-disk log into a fresh region when it fills up
//!
//! Changes are never written per operation. A crash loses unflushed changes
//! from the registry region; the WAL still holds them for committed writes.

mod format;
mod table;

pub use format::{BlockEntry, RegionHeader, RegistryRecord, REGION_HEADER_SIZE};
pub use table::{BlockRegistry, FlushOutcome, RegistryOptions};

//! Block checksums
//!
//! Block payloads and overflow pages carry a 4-byte digest. The algorithm is
//! injected into the provider as a trait object so it can be swapped without
//! touching allocator or registry logic. The algorithm id is stamped into the
//! file header; reopening with a different digest is rejected.
//!
//! Format-level integrity codes (file header, WAL frames, registry records,
//! FSM snapshots) always use CRC32 and are not affected by this choice.

use std::fmt::Debug;
use std::sync::Arc;

/// A 32-bit digest over a byte slice
pub trait Checksum: Send + Sync + Debug {
    /// Identifier stored in the file header
    fn algorithm_id(&self) -> u8;

    /// Compute the digest of `data`
    fn compute(&self, data: &[u8]) -> u32;

    fn verify(&self, data: &[u8], expected: u32) -> bool {
        self.compute(data) == expected
    }
}

/// CRC32 (IEEE) via crc32fast
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32;

impl Checksum for Crc32 {
    fn algorithm_id(&self) -> u8 {
        1
    }

    fn compute(&self, data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }
}

/// The digest used when none is supplied
pub fn default_checksum() -> Arc<dyn Checksum> {
    Arc::new(Crc32)
}

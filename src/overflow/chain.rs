//! Overflow chain allocation, traversal and release

use std::sync::Arc;

use tracing::{debug, warn};

use crate::checksum::Checksum;
use crate::error::{Result, VaultError};
use crate::io::{BufferPool, PagedFile};
use crate::txn::WriteTxn;

use super::page::{flags, payload, OverflowPageHeader, OVERFLOW_HEADER_SIZE};
use super::{ChainHead, ChainInfo, ChainReader, ChainWriter, CompressionAlgorithm};

/// Builds and walks overflow chains
///
/// Compression and page assembly happen outside the allocator lock; the
/// allocator is only entered to reserve the chain's pages.
#[derive(Debug, Clone)]
pub struct OverflowManager {
    page_size: u32,
    algorithm: CompressionAlgorithm,
    doubly_linked: bool,
    checksum: Arc<dyn Checksum>,
    pool: Arc<BufferPool>,
}

impl OverflowManager {
    pub fn new(
        page_size: u32,
        algorithm: CompressionAlgorithm,
        doubly_linked: bool,
        checksum: Arc<dyn Checksum>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            page_size,
            algorithm,
            doubly_linked,
            checksum,
            pool,
        }
    }

    /// Payload bytes one overflow page can hold
    pub fn page_capacity(&self) -> usize {
        self.page_size as usize - OVERFLOW_HEADER_SIZE
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Store `data` in a new chain owned by `txn`
    pub fn allocate_chain(&self, txn: &mut WriteTxn<'_>, data: &[u8], compress: bool) -> Result<ChainInfo> {
        let compressed = if compress {
            self.algorithm.compress(data)?
        } else {
            None
        };
        let is_compressed = compressed.is_some();
        let stored: &[u8] = compressed.as_deref().unwrap_or(data);

        let capacity = self.page_capacity();
        let page_count = stored.len().div_ceil(capacity).max(1);
        let offsets = txn.allocate_scattered(page_count as u64)?;

        let mut base_flags = 0;
        if is_compressed {
            base_flags |= flags::COMPRESSED;
        }
        if self.doubly_linked {
            base_flags |= flags::DOUBLY_LINKED;
        }

        let mut chunks = stored.chunks(capacity);
        for (i, &offset) in offsets.iter().enumerate() {
            let chunk = chunks.next().unwrap_or(&[]);
            let last = i + 1 == offsets.len();
            let header = OverflowPageHeader {
                flags: if last { base_flags | flags::LAST } else { base_flags },
                compression: if is_compressed { self.algorithm.id() } else { 0 },
                prev: if self.doubly_linked && i > 0 { offsets[i - 1] } else { 0 },
                next: if last { 0 } else { offsets[i + 1] },
                uncompressed_size: if is_compressed { 0 } else { chunk.len() as u16 },
                stored_size: chunk.len() as u16,
            };

            let mut page = self.pool.checkout();
            let used = header.write_page(&mut page, chunk, self.checksum.as_ref());
            txn.write_page(offset, &page[..used])?;
        }

        let info = ChainInfo {
            first_offset: offsets[0],
            last_offset: offsets[offsets.len() - 1],
            page_count: page_count as u32,
            stored_len: stored.len() as u64,
            compressed: is_compressed,
        };
        debug!(
            first = info.first_offset,
            pages = info.page_count,
            raw = data.len(),
            stored = info.stored_len,
            compressed = is_compressed,
            "overflow chain written"
        );
        Ok(info)
    }

    /// Log the release of every page of a chain
    ///
    /// Pages already gone (freed by an interrupted earlier release) are
    /// skipped, so re-running after a partial free is harmless.
    pub fn free_chain(&self, txn: &mut WriteTxn<'_>, head: &ChainHead) -> Result<u64> {
        let pages = self.chain_pages(txn.file(), head)?;
        for &offset in &pages {
            txn.free_pages(offset, 1)?;
        }
        Ok(pages.len() as u64)
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Reassemble the original bytes of a chain
    pub fn read_chain(&self, file: &PagedFile, head: &ChainHead) -> Result<Vec<u8>> {
        let pages = self.walk(file, head)?;
        let compressed = pages.first().is_some_and(|(_, h, _)| h.has(flags::COMPRESSED));

        let stored_len: usize = pages.iter().map(|(_, _, data)| data.len()).sum();
        let mut stored = Vec::with_capacity(stored_len);
        for (_, _, data) in &pages {
            stored.extend_from_slice(data);
        }

        let data = if compressed {
            let algorithm = CompressionAlgorithm::from_id(pages[0].1.compression)?;
            algorithm
                .decompress(&stored, head.data_len as usize)
                .map_err(|e| VaultError::CorruptChain {
                    offset: head.first_offset,
                    reason: e.to_string(),
                })?
        } else {
            stored
        };

        if data.len() as u64 != head.data_len {
            return Err(VaultError::CorruptChain {
                offset: head.first_offset,
                reason: format!("chain holds {} bytes, expected {}", data.len(), head.data_len),
            });
        }
        Ok(data)
    }

    /// Offsets of every page in a chain, in order
    pub fn chain_pages(&self, file: &PagedFile, head: &ChainHead) -> Result<Vec<u64>> {
        Ok(self.walk(file, head)?.into_iter().map(|(offset, _, _)| offset).collect())
    }

    /// Validated pages of a chain as (offset, header, payload)
    ///
    /// Walks forward from the first page. If a forward link leads to a bad
    /// page and the chain is doubly linked, the rest is recovered by walking
    /// back from the last page.
    fn walk(&self, file: &PagedFile, head: &ChainHead) -> Result<Vec<(u64, OverflowPageHeader, Vec<u8>)>> {
        let max_hops = head.page_count as usize;
        let mut pages = Vec::with_capacity(max_hops);
        let mut offset = head.first_offset;
        let mut prev = 0u64;

        while offset != 0 {
            if pages.len() >= max_hops {
                return Err(VaultError::CorruptChain {
                    offset: head.first_offset,
                    reason: format!("chain does not terminate within {} pages", max_hops),
                });
            }

            if offset % self.page_size as u64 != 0 || offset + self.page_size as u64 > file.len() {
                let err = VaultError::CorruptChain {
                    offset,
                    reason: "link points outside the file's pages".to_string(),
                };
                return self.repair(file, head, pages, err);
            }

            let page = match self.read_page(file, offset) {
                Ok((header, data)) if !header.has(flags::DOUBLY_LINKED) || header.prev == prev => {
                    (header, data)
                }
                Ok((header, _)) => {
                    let err = VaultError::CorruptChain {
                        offset,
                        reason: format!("back link {} does not match {}", header.prev, prev),
                    };
                    return self.repair(file, head, pages, err);
                }
                Err(err) => return self.repair(file, head, pages, err),
            };

            let next = page.0.next;
            let last = page.0.has(flags::LAST);
            pages.push((offset, page.0, page.1));
            if next == 0 && !last {
                let err = VaultError::CorruptChain {
                    offset,
                    reason: "chain ends before its last page".to_string(),
                };
                return self.repair(file, head, pages, err);
            }
            prev = offset;
            offset = next;
        }

        if pages.len() != max_hops {
            return Err(VaultError::CorruptChain {
                offset: head.first_offset,
                reason: format!("chain has {} pages, expected {}", pages.len(), max_hops),
            });
        }
        Ok(pages)
    }

    /// Finish a broken forward walk from the tail
    fn repair(
        &self,
        file: &PagedFile,
        head: &ChainHead,
        mut good: Vec<(u64, OverflowPageHeader, Vec<u8>)>,
        err: VaultError,
    ) -> Result<Vec<(u64, OverflowPageHeader, Vec<u8>)>> {
        let doubly = good
            .first()
            .map_or(self.doubly_linked, |(_, h, _)| h.has(flags::DOUBLY_LINKED));
        // The first page has no predecessor to walk back to
        if !doubly || head.last_offset == 0 || good.is_empty() {
            return Err(err);
        }

        let join = good[good.len() - 1].0;
        let remaining = head.page_count as usize - good.len();
        let mut tail = Vec::with_capacity(remaining);
        let mut offset = head.last_offset;

        while offset != join {
            if tail.len() >= remaining || offset == 0 {
                return Err(err);
            }
            let Ok((header, data)) = self.read_page(file, offset) else {
                return Err(err);
            };
            let prev = header.prev;
            tail.push((offset, header, data));
            offset = prev;
        }

        if tail.len() != remaining {
            return Err(err);
        }
        warn!(
            first = head.first_offset,
            join,
            recovered_pages = tail.len(),
            cause = %err,
            "overflow chain repaired through back links"
        );
        tail.reverse();
        good.extend(tail);
        Ok(good)
    }

    fn read_page(&self, file: &PagedFile, offset: u64) -> Result<(OverflowPageHeader, Vec<u8>)> {
        let mut page = self.pool.checkout();
        file.read_exact_at(&mut page, offset)?;
        let header = OverflowPageHeader::read_page(&page, offset, self.checksum.as_ref())?;
        Ok((header, payload(&page, &header).to_vec()))
    }

    // =========================================================================
    // Adapters
    // =========================================================================

    /// A [`ChainWriter`] that allocates inside `txn`
    pub fn session<'m, 't, 'a>(&'m self, txn: &'t mut WriteTxn<'a>) -> ChainSession<'m, 't, 'a> {
        ChainSession { manager: self, txn }
    }

    /// A [`ChainReader`] over `file`
    pub fn view<'m>(&'m self, file: &'m PagedFile) -> ChainView<'m> {
        ChainView { manager: self, file }
    }
}

/// Chain writes bound to a transaction
pub struct ChainSession<'m, 't, 'a> {
    manager: &'m OverflowManager,
    txn: &'t mut WriteTxn<'a>,
}

impl ChainWriter for ChainSession<'_, '_, '_> {
    fn write_chain(&mut self, data: &[u8], compress: bool) -> Result<ChainInfo> {
        self.manager.allocate_chain(self.txn, data, compress)
    }
}

/// Chain reads against the storage file
pub struct ChainView<'m> {
    manager: &'m OverflowManager,
    file: &'m PagedFile,
}

impl ChainReader for ChainView<'_> {
    fn read_chain(&self, head: &ChainHead) -> Result<Vec<u8>> {
        self.manager.read_chain(self.file, head)
    }
}

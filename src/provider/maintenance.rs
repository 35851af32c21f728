//! Orphan reclamation and consistency checks

use tracing::{info, warn};

use crate::error::{Result, VaultError};
use crate::fsm::PageBitmap;
use crate::io::Region;
use crate::row::OverflowMetadata;

use super::StorageProvider;

/// Outcome of [`StorageProvider::reclaim_orphans`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanReport {
    /// Pages reachable from the header, registry and blocks
    pub referenced_pages: u64,
    /// Allocated pages nothing referenced
    pub freed_pages: u64,
    /// Referenced pages the allocator had as free
    pub restored_pages: u64,
    /// Blocks whose pages could not all be traced
    pub unreadable_blocks: usize,
}

/// Outcome of [`StorageProvider::verify`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub blocks_checked: usize,
    /// (name, error) for every block that failed to read back
    pub corrupt_blocks: Vec<(String, String)>,
    /// Pairs of blocks whose byte ranges overlap
    pub overlapping_blocks: usize,
    /// Blocks whose data page the allocator considers free
    pub unallocated_blocks: usize,
    pub fsm_consistent: bool,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt_blocks.is_empty()
            && self.overlapping_blocks == 0
            && self.unallocated_blocks == 0
            && self.fsm_consistent
    }
}

impl StorageProvider {
    /// Bring the allocator in line with what is actually referenced
    ///
    /// Pages left allocated by interrupted writes, or by system regions
    /// retired before a crash, are freed. Referenced pages marked free are
    /// taken back. Runs with all writers excluded.
    pub fn reclaim_orphans(&self) -> Result<OrphanReport> {
        let _gate = self.gate_exclusive()?;

        let page_size = self.page_size() as u64;
        let mut referenced = PageBitmap::new(self.fsm.total_pages());
        referenced.set_range(0, self.fsm.reserved_pages());

        let header = self.header();
        for region in [header.registry, self.registry.region(), header.fsm] {
            mark_region(&mut referenced, region, page_size);
        }

        let mut unreadable_blocks = 0;
        for (name, entry) in self.registry.entries() {
            let page_offset = match self.data_page_of(&name, &entry) {
                Ok(offset) => offset,
                Err(e) => {
                    warn!(name = %name, error = %e, "block has no traceable data page");
                    unreadable_blocks += 1;
                    continue;
                }
            };
            mark_region(&mut referenced, Region::new(page_offset, 1), page_size);

            let payload = match self.read_data_page(&name, &entry) {
                Ok((header, payload)) if header.is_overflow_record() => payload,
                Ok(_) => continue,
                Err(e) => {
                    warn!(name = %name, error = %e, "block unreadable during orphan scan");
                    unreadable_blocks += 1;
                    continue;
                }
            };
            let Some((metadata, _)) = OverflowMetadata::parse(&payload) else {
                unreadable_blocks += 1;
                continue;
            };

            let head = metadata.chain_head();
            match self.overflow.chain_pages(&self.file, &head) {
                Ok(pages) => {
                    for offset in pages {
                        mark_region(&mut referenced, Region::new(offset, 1), page_size);
                    }
                }
                Err(e) => {
                    warn!(name = %name, error = %e, "overflow chain unreadable; keeping its end pages");
                    unreadable_blocks += 1;
                    for offset in [head.first_offset, head.last_offset] {
                        mark_region(&mut referenced, Region::new(offset, 1), page_size);
                    }
                }
            }
        }

        let (freed_pages, restored_pages) = self.fsm.reconcile(&referenced)?;
        let report = OrphanReport {
            referenced_pages: referenced.count_set(),
            freed_pages,
            restored_pages,
            unreadable_blocks,
        };
        info!(
            referenced = report.referenced_pages,
            freed = freed_pages,
            restored = restored_pages,
            unreadable = unreadable_blocks,
            "orphan scan complete"
        );
        Ok(report)
    }

    /// Read every block end to end and cross-check the allocator
    ///
    /// Corruption is collected into the report; only lock timeouts and
    /// cancellation abort the walk.
    pub fn verify(&self) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let mut ranges = Vec::new();

        for (name, _) in self.registry.entries() {
            let _stripe = self
                .stripe(&name)
                .try_read_for(self.lock_timeout)
                .ok_or(VaultError::Timeout("block"))?;
            let Some(entry) = self.registry.try_get(&name) else {
                continue;
            };
            report.blocks_checked += 1;

            match self.load_block(&name, &entry) {
                Ok(_) => {}
                Err(e @ (VaultError::Timeout(_) | VaultError::Cancelled)) => return Err(e),
                Err(e) => {
                    warn!(name = %name, error = %e, "block failed verification");
                    report.corrupt_blocks.push((name.clone(), e.to_string()));
                }
            }

            if let Ok(page_offset) = self.data_page_of(&name, &entry) {
                if !self.fsm.is_allocated(page_offset).unwrap_or(false) {
                    report.unallocated_blocks += 1;
                }
            }
            ranges.push((entry.offset, entry.end()));
        }

        ranges.sort_unstable();
        report.overlapping_blocks = ranges.windows(2).filter(|w| w[0].1 > w[1].0).count();
        report.fsm_consistent = self.fsm.invariant_holds()?;
        report.corrupt_blocks.sort();

        info!(
            blocks = report.blocks_checked,
            corrupt = report.corrupt_blocks.len(),
            overlapping = report.overlapping_blocks,
            fsm_consistent = report.fsm_consistent,
            "verification complete"
        );
        Ok(report)
    }
}

/// Mark the pages of `region` that fall inside the bitmap
fn mark_region(bitmap: &mut PageBitmap, region: Region, page_size: u64) {
    if region.is_empty() || region.offset % page_size != 0 {
        return;
    }
    let start = region.offset / page_size;
    if start >= bitmap.len() {
        return;
    }
    let count = region.pages.min(bitmap.len() - start);
    bitmap.set_range(start, count);
}

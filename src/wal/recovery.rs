//! WAL Recovery
//!
//! Replays the log after an unclean shutdown.
//!
//! Transactions are applied at the position of their `Commit` entry, in log
//! order. A rolled-back or unfinished transaction has its allocations
//! returned to the allocator. Replay only sets state to what the log says,
//! so running it again over the same log changes nothing.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::error::{Result, VaultError};
use crate::fsm::FreeSpaceManager;
use crate::io::{PagedFile, Region};
use crate::registry::BlockRegistry;

use super::{Operation, WalEntry, WalReader, WalRegion, WalRegionHeader};

/// Summary of a replay or verification pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Valid entries read from the log
    pub entries_scanned: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    /// Transactions with neither `Commit` nor `Rollback`
    pub transactions_incomplete: u64,
    /// Committed transactions already reflected in the main file
    pub transactions_skipped: u64,
    /// Pages restored from logged images
    pub pages_rewritten: u64,
    /// Pages whose allocator bit was set by replay
    pub pages_allocated: u64,
    /// Pages whose allocator bit was cleared by replay
    pub pages_freed: u64,
    pub registry_updates: u64,
    /// Highest LSN in the log (the checkpoint LSN when empty)
    pub last_lsn: u64,
    pub last_txn_id: u64,
    /// The log ended in a damaged frame
    pub torn_tail: bool,
}

/// Raw view of the log
#[derive(Debug, Clone)]
pub struct WalScan {
    pub header: WalRegionHeader,
    pub entries: Vec<WalEntry>,
    pub torn_tail: bool,
}

/// What replay does with one transaction
enum Step {
    Apply { commit_lsn: u64, entries: Vec<WalEntry> },
    Discard { entries: Vec<WalEntry> },
}

pub struct WalRecovery;

impl WalRecovery {
    /// Read the header and every valid frame
    pub fn scan(file: &PagedFile, wal: WalRegion) -> Result<WalScan> {
        let header = WalRegionHeader::read(file, &wal)?;
        let mut reader = WalReader::new(file, wal, header.checkpoint_lsn + 1);
        let entries = reader.read_all()?;
        Ok(WalScan {
            header,
            entries,
            torn_tail: reader.torn_tail(),
        })
    }

    /// Count what replay would do without changing anything
    pub fn verify(file: &PagedFile, wal: WalRegion, applied_through: u64) -> Result<RecoveryResult> {
        let scan = Self::scan(file, wal)?;
        let (_, result) = Self::plan(scan, applied_through);
        Ok(result)
    }

    /// Bring the allocator, registry and data pages in line with the log
    ///
    /// Transactions whose `Commit` LSN is at or below `applied_through` are
    /// skipped. Page images are never written over `protected` regions
    /// (system structures placed after the log was written).
    pub fn replay(
        file: &PagedFile,
        wal: WalRegion,
        applied_through: u64,
        protected: &[Region],
        fsm: &FreeSpaceManager,
        registry: &BlockRegistry,
    ) -> Result<RecoveryResult> {
        let scan = Self::scan(file, wal)?;
        let (steps, mut result) = Self::plan(scan, applied_through);
        let page_size = wal.page_size as u64;

        // Only the newest committed image of a page is written back
        let mut newest_write: HashMap<u64, u64> = HashMap::new();
        for step in &steps {
            if let Step::Apply { entries, .. } = step {
                for entry in entries {
                    if let Operation::PageWrite { offset, page_count, .. } = entry.operation {
                        for i in 0..page_count as u64 {
                            newest_write.insert(offset + i * page_size, entry.lsn);
                        }
                    }
                }
            }
        }

        for step in steps {
            match step {
                Step::Apply { commit_lsn, entries } => {
                    debug!(commit_lsn, entries = entries.len(), "replaying transaction");
                    for entry in entries {
                        Self::apply(file, entry, page_size, protected, &newest_write, fsm, registry, &mut result)?;
                    }
                }
                Step::Discard { entries } => {
                    for entry in entries {
                        if let Operation::PageWrite { offset, page_count, .. } = entry.operation {
                            result.pages_freed += fsm
                                .mark_free(offset, page_count as u64)
                                .map_err(|e| replay_error(entry.lsn, e))?;
                        }
                    }
                }
            }
        }

        if result.pages_rewritten > 0 {
            file.sync()?;
        }

        info!(
            entries = result.entries_scanned,
            committed = result.transactions_committed,
            rolled_back = result.transactions_rolled_back,
            incomplete = result.transactions_incomplete,
            skipped = result.transactions_skipped,
            pages_rewritten = result.pages_rewritten,
            last_lsn = result.last_lsn,
            "WAL replay complete"
        );
        Ok(result)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Group entries by transaction and order the outcomes by log position
    fn plan(scan: WalScan, applied_through: u64) -> (Vec<Step>, RecoveryResult) {
        let mut result = RecoveryResult {
            entries_scanned: scan.entries.len() as u64,
            last_lsn: scan.header.checkpoint_lsn,
            torn_tail: scan.torn_tail,
            ..Default::default()
        };

        let mut pending: HashMap<u64, Vec<WalEntry>> = HashMap::new();
        let mut open_order: Vec<u64> = Vec::new();
        let mut steps = Vec::new();

        for entry in scan.entries {
            result.last_lsn = result.last_lsn.max(entry.lsn);
            result.last_txn_id = result.last_txn_id.max(entry.txn_id);
            let txn_id = entry.txn_id;

            match entry.operation {
                Operation::Commit => {
                    let entries = pending.remove(&txn_id).unwrap_or_default();
                    if entry.lsn <= applied_through {
                        result.transactions_skipped += 1;
                    } else {
                        result.transactions_committed += 1;
                        steps.push(Step::Apply {
                            commit_lsn: entry.lsn,
                            entries,
                        });
                    }
                }
                Operation::Rollback => {
                    let entries = pending.remove(&txn_id).unwrap_or_default();
                    result.transactions_rolled_back += 1;
                    if entry.lsn > applied_through {
                        steps.push(Step::Discard { entries });
                    }
                }
                _ => {
                    let list = pending.entry(txn_id).or_default();
                    if list.is_empty() {
                        open_order.push(txn_id);
                    }
                    list.push(entry);
                }
            }
        }

        for txn_id in open_order {
            if let Some(entries) = pending.remove(&txn_id) {
                warn!(txn_id, entries = entries.len(), "discarding unfinished transaction");
                result.transactions_incomplete += 1;
                steps.push(Step::Discard { entries });
            }
        }

        (steps, result)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply(
        file: &PagedFile,
        entry: WalEntry,
        page_size: u64,
        protected: &[Region],
        newest_write: &HashMap<u64, u64>,
        fsm: &FreeSpaceManager,
        registry: &BlockRegistry,
        result: &mut RecoveryResult,
    ) -> Result<()> {
        let lsn = entry.lsn;
        match entry.operation {
            Operation::PageWrite { offset, page_count, image } => {
                let pages = page_count as u64;
                result.pages_allocated += fsm
                    .mark_allocated(offset, pages)
                    .map_err(|e| replay_error(lsn, e))?;

                let Some(image) = image else {
                    return Ok(());
                };
                let newest = (0..pages)
                    .all(|i| newest_write.get(&(offset + i * page_size)) == Some(&lsn));
                let end = offset + pages * page_size;
                let overlaps_system = protected
                    .iter()
                    .filter(|r| !r.is_empty())
                    .any(|r| offset < r.offset + r.pages * page_size && r.offset < end);
                if newest && !overlaps_system {
                    file.write_all_at(&image, offset)?;
                    result.pages_rewritten += pages;
                }
            }
            Operation::PageFree { offset, page_count } => {
                result.pages_freed += fsm
                    .mark_free(offset, page_count as u64)
                    .map_err(|e| replay_error(lsn, e))?;
            }
            Operation::RegistryUpsert { name, entry } => {
                registry.upsert(&name, entry);
                result.registry_updates += 1;
            }
            Operation::RegistryRemove { name } => {
                registry.remove(&name);
                result.registry_updates += 1;
            }
            Operation::Commit | Operation::Rollback => {}
        }
        Ok(())
    }
}

fn replay_error(lsn: u64, err: VaultError) -> VaultError {
    match err {
        VaultError::InvalidRange(reason) => {
            VaultError::ReplayFailure(format!("entry at LSN {} is out of range: {}", lsn, reason))
        }
        other => other,
    }
}

//! Write transactions
//!
//! A [`WriteTxn`] is the unit of work behind every block write or free:
//!
//! ```text
//! begin ──► allocate ──► log PageWrite ──► write page ──► ... ──► commit
//!                                                            │
//!                                  drop / error / cancel ────┴──► rollback
//! ```
//!
//! Registry changes and page frees are logged as they happen but only take
//! effect once `Commit` is durable. Dropping an unfinished transaction rolls
//! it back: its allocations go back to the allocator and a `Rollback` entry
//! is logged.

use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::cancel::{CancelToken, WriteOptions};
use crate::error::{Result, VaultError};
use crate::fsm::FreeSpaceManager;
use crate::io::PagedFile;
use crate::registry::{BlockEntry, BlockRegistry};
use crate::wal::{Operation, WalWriter};

/// Shared structures a transaction works against
#[derive(Clone, Copy)]
pub struct TxnContext<'a> {
    pub file: &'a PagedFile,
    pub fsm: &'a FreeSpaceManager,
    pub registry: &'a BlockRegistry,
    pub wal: &'a Mutex<WalWriter>,
}

pub struct WriteTxn<'a> {
    id: u64,
    ctx: TxnContext<'a>,
    cancel: Option<CancelToken>,
    lock_timeout: Duration,
    /// Bytes of page images this transaction may still log
    image_budget: u64,
    /// Some page was written without an image; data must be synced before commit
    images_skipped: bool,
    /// (offset, pages) allocated by this transaction
    allocated: Vec<(u64, u64)>,
    /// (offset, pages) released at commit
    deferred_frees: Vec<(u64, u64)>,
    /// Registry changes applied at commit
    registry_changes: Vec<(String, Option<BlockEntry>)>,
    finished: bool,
}

impl<'a> WriteTxn<'a> {
    pub fn begin(
        ctx: TxnContext<'a>,
        options: &WriteOptions,
        lock_timeout: Duration,
        image_budget: u64,
    ) -> Result<Self> {
        Self::begin_reserved(ctx, options, lock_timeout, image_budget, 0)
    }

    /// Begin holding `wal_reserve` bytes of log space
    ///
    /// `WalFull` here means the log cannot take the transaction right now;
    /// nothing has been allocated or logged.
    pub fn begin_reserved(
        ctx: TxnContext<'a>,
        options: &WriteOptions,
        lock_timeout: Duration,
        image_budget: u64,
        wal_reserve: u64,
    ) -> Result<Self> {
        let lock_timeout = options.lock_timeout.unwrap_or(lock_timeout);
        if options.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        let id = ctx
            .wal
            .try_lock_for(lock_timeout)
            .ok_or(VaultError::Timeout("wal"))?
            .begin_reserved(wal_reserve)?;

        Ok(Self {
            id,
            ctx,
            cancel: options.cancel.clone(),
            lock_timeout,
            image_budget,
            images_skipped: false,
            allocated: Vec::new(),
            deferred_frees: Vec::new(),
            registry_changes: Vec::new(),
            finished: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn file(&self) -> &'a PagedFile {
        self.ctx.file
    }

    pub fn page_size(&self) -> u32 {
        self.ctx.fsm.page_size()
    }

    /// Offsets of every page allocated so far
    pub fn allocated_pages(&self) -> Vec<u64> {
        let page_size = self.page_size() as u64;
        self.allocated
            .iter()
            .flat_map(|&(offset, pages)| (0..pages).map(move |i| offset + i * page_size))
            .collect()
    }

    /// Fail with `Cancelled` once the caller's token fires
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(VaultError::Cancelled);
        }
        Ok(())
    }

    // =========================================================================
    // Pages
    // =========================================================================

    /// Allocate contiguous pages owned by this transaction until commit
    pub fn allocate_pages(&mut self, page_count: u64) -> Result<u64> {
        self.check_cancelled()?;
        let offset = self.ctx.fsm.allocate(page_count, self.ctx.file)?;
        self.allocated.push((offset, page_count));
        Ok(offset)
    }

    /// Allocate single pages, not necessarily contiguous
    pub fn allocate_scattered(&mut self, page_count: u64) -> Result<Vec<u64>> {
        self.check_cancelled()?;
        let offsets = self.ctx.fsm.allocate_scattered(page_count, self.ctx.file)?;
        self.allocated.extend(offsets.iter().map(|&offset| (offset, 1)));
        Ok(offsets)
    }

    /// Log then write `data` at `offset`
    pub fn write_page(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.check_cancelled()?;
        let page_count = (data.len() as u64).div_ceil(self.page_size() as u64).max(1) as u32;

        let image = if data.len() as u64 <= self.image_budget {
            self.image_budget -= data.len() as u64;
            Some(data.to_vec())
        } else {
            self.images_skipped = true;
            None
        };

        self.log(Operation::PageWrite {
            offset,
            page_count,
            image,
        })?;
        self.ctx.file.write_all_at(data, offset)
    }

    /// Release pages when the transaction commits
    pub fn free_pages(&mut self, offset: u64, page_count: u64) -> Result<()> {
        self.log(Operation::PageFree {
            offset,
            page_count: page_count as u32,
        })?;
        self.deferred_frees.push((offset, page_count));
        Ok(())
    }

    // =========================================================================
    // Registry
    // =========================================================================

    pub fn upsert_entry(&mut self, name: &str, entry: BlockEntry) -> Result<()> {
        self.log(Operation::RegistryUpsert {
            name: name.to_string(),
            entry,
        })?;
        self.registry_changes.push((name.to_string(), Some(entry)));
        Ok(())
    }

    pub fn remove_entry(&mut self, name: &str) -> Result<()> {
        self.log(Operation::RegistryRemove {
            name: name.to_string(),
        })?;
        self.registry_changes.push((name.to_string(), None));
        Ok(())
    }

    // =========================================================================
    // Outcome
    // =========================================================================

    /// Make the transaction durable and apply its deferred effects
    pub fn commit(mut self) -> Result<u64> {
        self.check_cancelled()?;
        if self.images_skipped {
            self.ctx.file.sync()?;
        }

        let lsn = self.wal()?.commit(self.ctx.file, self.id)?;
        self.finished = true;

        for (name, change) in self.registry_changes.drain(..) {
            match change {
                Some(entry) => {
                    self.ctx.registry.upsert(&name, entry);
                }
                None => {
                    self.ctx.registry.remove(&name);
                }
            }
        }
        for (offset, pages) in self.deferred_frees.drain(..) {
            if let Err(e) = self.ctx.fsm.free(offset, pages) {
                warn!(txn_id = self.id, offset, pages, error = %e, "deferred free failed after commit");
            }
        }
        Ok(lsn)
    }

    /// Abandon the transaction
    pub fn rollback(mut self) -> Result<()> {
        self.abort()
    }

    fn abort(&mut self) -> Result<()> {
        self.finished = true;

        let mut first_err = None;
        for (offset, pages) in self.allocated.drain(..) {
            if let Err(e) = self.ctx.fsm.free(offset, pages) {
                first_err.get_or_insert(e);
            }
        }

        let logged = self.wal().and_then(|mut wal| wal.rollback(self.ctx.file, self.id));
        if let Err(e) = logged {
            first_err.get_or_insert(e);
        }

        debug!(txn_id = self.id, "transaction rolled back");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn log(&mut self, operation: Operation) -> Result<u64> {
        self.check_cancelled()?;
        let timeout = self.lock_timeout;
        self.ctx
            .wal
            .try_lock_for(timeout)
            .ok_or(VaultError::Timeout("wal"))?
            .append(self.ctx.file, self.id, operation)
    }

    fn wal(&self) -> Result<MutexGuard<'a, WalWriter>> {
        self.ctx
            .wal
            .try_lock_for(self.lock_timeout)
            .ok_or(VaultError::Timeout("wal"))
    }
}

impl Drop for WriteTxn<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.abort() {
            warn!(txn_id = self.id, error = %e, "rollback of dropped transaction incomplete");
        }
    }
}

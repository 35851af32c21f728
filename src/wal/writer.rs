//! WAL Writer
//!
//! Appends frames to the WAL region and tracks transaction states.
//!
//! A transaction may reserve log space when it begins. Reserved bytes are
//! withheld from every other transaction, so a writer admitted with a
//! worst-case reservation never runs into `WalFull` halfway through.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::config::WalSyncStrategy;
use crate::error::{Result, VaultError};
use crate::io::PagedFile;

use super::{Operation, WalEntry, WalRegion, WalRegionHeader};

/// Space held back so an open transaction can always log its outcome
pub const OUTCOME_RESERVE: u64 = 1024;

/// Transaction lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    Committed,
    RolledBack,
}

/// Single append cursor over the WAL region
///
/// Callers serialize access (the provider wraps it in a mutex); readers of
/// the main file never touch it.
pub struct WalWriter {
    wal: WalRegion,
    header: WalRegionHeader,
    sync_strategy: WalSyncStrategy,
    /// Bytes of frames written since the last truncation
    write_pos: u64,
    next_lsn: u64,
    next_txn_id: u64,
    txns: HashMap<u64, TxnState>,
    /// Unused reservation per open transaction
    reservations: HashMap<u64, u64>,
    /// Sum of `reservations`
    reserved: u64,
}

impl WalWriter {
    /// Format an empty WAL region
    pub fn create(
        file: &PagedFile,
        wal: WalRegion,
        sync_strategy: WalSyncStrategy,
    ) -> Result<Self> {
        let header = WalRegionHeader::default();
        header.write(file, &wal)?;
        Ok(Self::new(wal, header, sync_strategy, 1))
    }

    /// A writer positioned at the start of an empty (just truncated) log
    pub fn new(
        wal: WalRegion,
        header: WalRegionHeader,
        sync_strategy: WalSyncStrategy,
        next_txn_id: u64,
    ) -> Self {
        Self {
            wal,
            header,
            sync_strategy,
            write_pos: 0,
            next_lsn: header.checkpoint_lsn + 1,
            next_txn_id: next_txn_id.max(1),
            txns: HashMap::new(),
            reservations: HashMap::new(),
            reserved: 0,
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Open a transaction and return its id
    pub fn begin(&mut self) -> u64 {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        self.txns.insert(id, TxnState::Open);
        id
    }

    /// Open a transaction that holds `reserve` bytes of log space
    ///
    /// Fails with `WalFull` when the reservation does not fit beside the
    /// frames already written and the space other transactions hold.
    pub fn begin_reserved(&mut self, reserve: u64) -> Result<u64> {
        let available = self.unreserved_bytes();
        if reserve > available {
            return Err(VaultError::WalFull {
                needed: reserve,
                available,
            });
        }
        let id = self.begin();
        if reserve > 0 {
            self.reservations.insert(id, reserve);
            self.reserved += reserve;
        }
        Ok(id)
    }

    /// Append an entry to an open transaction, returning its LSN
    pub fn append(&mut self, file: &PagedFile, txn_id: u64, operation: Operation) -> Result<u64> {
        if matches!(operation, Operation::Commit | Operation::Rollback) {
            return Err(VaultError::InvalidRange(
                "commit and rollback go through commit()/rollback()".to_string(),
            ));
        }
        self.ensure_open(txn_id)?;
        let lsn = self.write_frame(file, txn_id, operation, OUTCOME_RESERVE)?;
        if self.sync_strategy == WalSyncStrategy::EveryWrite {
            file.sync()?;
        }
        Ok(lsn)
    }

    /// Log `Commit` and fsync; the transaction is durable once this returns
    pub fn commit(&mut self, file: &PagedFile, txn_id: u64) -> Result<u64> {
        self.ensure_open(txn_id)?;
        let lsn = self.write_frame(file, txn_id, Operation::Commit, 0)?;
        file.sync()?;
        self.txns.remove(&txn_id);
        self.release(txn_id);
        debug!(txn_id, lsn, "transaction committed");
        Ok(lsn)
    }

    /// Log `Rollback`
    pub fn rollback(&mut self, file: &PagedFile, txn_id: u64) -> Result<u64> {
        self.ensure_open(txn_id)?;
        self.txns.insert(txn_id, TxnState::RolledBack);
        let lsn = self.write_frame(file, txn_id, Operation::Rollback, 0);
        self.txns.remove(&txn_id);
        self.release(txn_id);
        let lsn = lsn?;
        if self.sync_strategy == WalSyncStrategy::EveryWrite {
            file.sync()?;
        }
        debug!(txn_id, lsn, "transaction rolled back");
        Ok(lsn)
    }

    /// State of a transaction still known to the writer
    ///
    /// Terminal transactions are forgotten once their outcome is logged.
    pub fn state(&self, txn_id: u64) -> Option<TxnState> {
        self.txns.get(&txn_id).copied()
    }

    pub fn open_transactions(&self) -> usize {
        self.txns.values().filter(|s| **s == TxnState::Open).count()
    }

    // =========================================================================
    // Log Maintenance
    // =========================================================================

    /// Force sync to disk
    pub fn sync(&self, file: &PagedFile) -> Result<()> {
        file.sync()
    }

    /// Discard every frame; all LSNs so far are reflected in the main file
    ///
    /// Requires that no transaction is open.
    pub fn truncate(&mut self, file: &PagedFile) -> Result<()> {
        let open = self.open_transactions();
        if open > 0 {
            return Err(VaultError::InvalidRange(format!(
                "cannot truncate WAL with {} open transactions",
                open
            )));
        }

        let header = WalRegionHeader {
            checkpoint_lsn: self.current_lsn(),
            truncations: self.header.truncations + 1,
        };
        header.write(file, &self.wal)?;

        info!(
            checkpoint_lsn = header.checkpoint_lsn,
            discarded_bytes = self.write_pos,
            "WAL truncated"
        );
        self.header = header;
        self.write_pos = 0;
        Ok(())
    }

    /// Last LSN handed out
    pub fn current_lsn(&self) -> u64 {
        self.next_lsn - 1
    }

    /// Highest transaction id handed out
    pub fn last_txn_id(&self) -> u64 {
        self.next_txn_id - 1
    }

    pub fn checkpoint_lsn(&self) -> u64 {
        self.header.checkpoint_lsn
    }

    /// Bytes of frames in the log
    pub fn used_bytes(&self) -> u64 {
        self.write_pos
    }

    pub fn capacity(&self) -> u64 {
        self.wal.capacity()
    }

    /// Log space held by open transactions and not yet written
    pub fn reserved_bytes(&self) -> u64 {
        self.reserved
    }

    /// Space a new reservation can claim
    pub fn unreserved_bytes(&self) -> u64 {
        self.capacity()
            .saturating_sub(self.write_pos)
            .saturating_sub(self.reserved)
            .saturating_sub(OUTCOME_RESERVE)
    }

    /// Used space as a percentage of capacity
    pub fn usage_percent(&self) -> u8 {
        match self.capacity() {
            0 => 100,
            cap => (self.write_pos * 100 / cap).min(100) as u8,
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_open(&self, txn_id: u64) -> Result<()> {
        match self.txns.get(&txn_id) {
            Some(TxnState::Open) => Ok(()),
            _ => Err(VaultError::TransactionClosed(txn_id)),
        }
    }

    fn release(&mut self, txn_id: u64) {
        if let Some(left) = self.reservations.remove(&txn_id) {
            self.reserved -= left;
        }
    }

    fn write_frame(
        &mut self,
        file: &PagedFile,
        txn_id: u64,
        operation: Operation,
        reserve: u64,
    ) -> Result<u64> {
        let lsn = self.next_lsn;
        let frame = WalEntry::new(lsn, txn_id, operation).serialize()?;

        let own = self.reservations.get(&txn_id).copied().unwrap_or(0);
        let available = self
            .capacity()
            .saturating_sub(self.write_pos)
            .saturating_sub(self.reserved - own)
            .saturating_sub(reserve);
        if frame.len() as u64 > available {
            return Err(VaultError::WalFull {
                needed: frame.len() as u64,
                available,
            });
        }

        file.write_all_at(&frame, self.wal.entries_offset() + self.write_pos)?;
        self.write_pos += frame.len() as u64;
        self.next_lsn += 1;
        if own > 0 {
            let used = own.min(frame.len() as u64);
            self.reserved -= used;
            if own == used {
                self.reservations.remove(&txn_id);
            } else {
                self.reservations.insert(txn_id, own - used);
            }
        }
        Ok(lsn)
    }
}

//! Block reads, writes and frees

use std::time::Instant;

use bytes::Bytes;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::cancel::WriteOptions;
use crate::error::{Result, VaultError};
use crate::io::header::unix_millis;
use crate::overflow::ChainWriter;
use crate::registry::BlockEntry;
use crate::row::{self, OverflowMetadata, Row, StoredRecord};
use crate::txn::WriteTxn;
use crate::wal::{MAX_FRAME_OVERHEAD, OUTCOME_RESERVE};

use super::data_page::{DataPageHeader, DATA_HEADER_SIZE, FLAG_OVERFLOW_RECORD};
use super::StorageProvider;

/// Reserved block holding the table directory
pub const TABLE_DIRECTORY_BLOCK: &str = "__pagevault.table_directory";

/// A write admitted into the critical section of one block
///
/// Fields drop in order: an unfinished transaction rolls back while the
/// stripe and the checkpoint gate are still held.
struct Admitted<'p> {
    txn: WriteTxn<'p>,
    _stripe: RwLockWriteGuard<'p, ()>,
    _gate: RwLockReadGuard<'p, ()>,
    /// Entry stored under the name when the write was admitted
    previous: Option<BlockEntry>,
}

impl StorageProvider {
    // =========================================================================
    // Write Path
    // =========================================================================

    /// Store `data` under `name`, replacing any previous block
    pub fn write_block(&self, name: &str, data: &[u8]) -> Result<BlockEntry> {
        self.write_block_with(name, data, &WriteOptions::default())
    }

    pub fn write_block_with(&self, name: &str, data: &[u8], options: &WriteOptions) -> Result<BlockEntry> {
        let (limits, compress) = (self.limits, self.compress);
        self.store(name, data.len(), options, |chains| {
            row::split_with_overflow(Bytes::copy_from_slice(data), limits, chains, compress)
        })
    }

    /// Serialize `row` and store it under `name`
    pub fn write_row(&self, name: &str, row: &Row) -> Result<BlockEntry> {
        self.write_row_with(name, row, &WriteOptions::default())
    }

    pub fn write_row_with(&self, name: &str, row: &Row, options: &WriteOptions) -> Result<BlockEntry> {
        let (limits, compress) = (self.limits, self.compress);
        self.store(name, row::serialized_size(row), options, |chains| {
            row::serialize_with_overflow(row, limits, chains, compress)
        })
    }

    /// Replace the table directory
    pub fn set_table_directory(&self, bytes: &[u8]) -> Result<BlockEntry> {
        self.write_block(TABLE_DIRECTORY_BLOCK, bytes)
    }

    /// One write transaction: encode, place, log, register
    ///
    /// `len` is the encoded size before any compression.
    fn store<F>(&self, name: &str, len: usize, options: &WriteOptions, encode: F) -> Result<BlockEntry>
    where
        F: FnOnce(&mut dyn ChainWriter) -> Result<StoredRecord>,
    {
        self.maybe_checkpoint()?;

        let entry = {
            let mut admitted = self.admit(name, options, |previous| {
                self.write_reservation(name, len, previous)
            })?;

            let record = {
                let mut session = self.overflow.session(&mut admitted.txn);
                let chains: &mut dyn ChainWriter = &mut session;
                encode(chains)?
            };
            let mut entry = self.write_data_page(&mut admitted.txn, &record)?;

            if let Some(previous) = admitted.previous {
                entry.created_at = previous.created_at;
                self.release_block(&mut admitted.txn, name, &previous)?;
            }
            admitted.txn.upsert_entry(name, entry)?;
            let lsn = admitted.txn.commit()?;

            debug!(
                name,
                offset = entry.offset,
                length = entry.length,
                overflow = record.is_overflow(),
                lsn,
                "block written"
            );
            entry
        };

        self.after_commit();
        Ok(entry)
    }

    fn write_data_page(&self, txn: &mut WriteTxn<'_>, record: &StoredRecord) -> Result<BlockEntry> {
        let payload = record.payload();
        let header = DataPageHeader {
            flags: if record.is_overflow() { FLAG_OVERFLOW_RECORD } else { 0 },
            payload_len: payload.len() as u32,
            checksum: self.checksum.compute(payload),
        };

        let page_offset = txn.allocate_pages(1)?;
        let mut page = self.pool.checkout();
        let used = header.write_page(&mut page, payload);
        txn.write_page(page_offset, &page[..used])?;

        Ok(BlockEntry::new(
            page_offset + DATA_HEADER_SIZE as u64,
            payload.len() as u64,
            header.checksum,
            unix_millis(),
        ))
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Bytes stored under `name`, or `None` if there is no such block
    pub fn read_block(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let _stripe = self
            .stripe(name)
            .try_read_for(self.lock_timeout)
            .ok_or(VaultError::Timeout("block"))?;

        match self.registry.try_get(name) {
            Some(entry) => self.load_block(name, &entry).map(Some),
            None => Ok(None),
        }
    }

    /// Decode the row stored under `name`
    pub fn read_row(&self, name: &str) -> Result<Option<Row>> {
        match self.read_block(name)? {
            Some(bytes) => row::deserialize(&bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn table_directory(&self) -> Result<Option<Vec<u8>>> {
        self.read_block(TABLE_DIRECTORY_BLOCK)
    }

    pub fn block_entry(&self, name: &str) -> Option<BlockEntry> {
        self.registry.try_get(name)
    }

    pub fn contains_block(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Sorted names of user blocks
    pub fn block_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .entries()
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| name != TABLE_DIRECTORY_BLOCK)
            .collect();
        names.sort();
        names
    }

    /// Full contents of a block, following its overflow chain
    pub(super) fn load_block(&self, name: &str, entry: &BlockEntry) -> Result<Vec<u8>> {
        let (header, payload) = self.read_data_page(name, entry)?;
        if !header.is_overflow_record() {
            return Ok(payload);
        }
        let (metadata, inline) = OverflowMetadata::parse(&payload).ok_or_else(|| VaultError::CorruptBlock {
            name: name.to_string(),
            reason: "malformed overflow metadata".to_string(),
        })?;
        row::assemble(&metadata, inline, &self.overflow.view(&self.file))
    }

    /// Read and check the data page behind `entry`
    pub(super) fn read_data_page(&self, name: &str, entry: &BlockEntry) -> Result<(DataPageHeader, Vec<u8>)> {
        let corrupt = |reason: String| VaultError::CorruptBlock {
            name: name.to_string(),
            reason,
        };

        let page_offset = self.data_page_of(name, entry)?;
        let capacity = self.page_size() as usize - DATA_HEADER_SIZE;
        if entry.length > capacity as u64 {
            return Err(corrupt(format!("length {} exceeds page capacity {}", entry.length, capacity)));
        }

        let used = DATA_HEADER_SIZE + entry.length as usize;
        let mut page = self.pool.checkout();
        self.file.read_exact_at(&mut page[..used], page_offset)?;

        let header = DataPageHeader::decode(&page[..DATA_HEADER_SIZE])
            .ok_or_else(|| corrupt(format!("no data page at offset {}", page_offset)))?;
        if header.payload_len as u64 != entry.length {
            return Err(corrupt(format!(
                "page holds {} bytes, registry says {}",
                header.payload_len, entry.length
            )));
        }

        let payload = &page[DATA_HEADER_SIZE..used];
        if header.checksum != entry.checksum || !self.checksum.verify(payload, entry.checksum) {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        Ok((header, payload.to_vec()))
    }

    /// Offset of the page holding a block's payload
    pub(super) fn data_page_of(&self, name: &str, entry: &BlockEntry) -> Result<u64> {
        let page_size = self.page_size() as u64;
        match entry.offset.checked_sub(DATA_HEADER_SIZE as u64) {
            Some(page_offset) if page_offset % page_size == 0 => Ok(page_offset),
            _ => Err(VaultError::CorruptBlock {
                name: name.to_string(),
                reason: format!("offset {} is not a data payload offset", entry.offset),
            }),
        }
    }

    // =========================================================================
    // Free Path
    // =========================================================================

    /// Remove `name` and release its pages; `false` if it did not exist
    pub fn free_block(&self, name: &str) -> Result<bool> {
        self.free_block_with(name, &WriteOptions::default())
    }

    pub fn free_block_with(&self, name: &str, options: &WriteOptions) -> Result<bool> {
        if !self.registry.contains(name) {
            return Ok(false);
        }
        self.maybe_checkpoint()?;

        {
            let mut admitted = self.admit(name, options, |previous| {
                (self.release_frames(name, previous) + 2) * MAX_FRAME_OVERHEAD + name.len() as u64
            })?;

            // Freed by another writer while this one waited for the stripe
            let Some(entry) = admitted.previous else {
                admitted.txn.rollback()?;
                return Ok(false);
            };
            self.release_block(&mut admitted.txn, name, &entry)?;
            admitted.txn.remove_entry(name)?;
            let lsn = admitted.txn.commit()?;
            debug!(name, offset = entry.offset, lsn, "block freed");
        }

        self.after_commit();
        Ok(true)
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Enter the write critical section of `name` with log space reserved
    ///
    /// `reserve` maps the entry currently stored under `name` to the
    /// transaction's worst-case log bytes. When the log cannot take that
    /// now, every lock is released, the log is checkpointed and admission
    /// is retried until the lock timeout runs out.
    fn admit<R>(&self, name: &str, options: &WriteOptions, reserve: R) -> Result<Admitted<'_>>
    where
        R: Fn(Option<&BlockEntry>) -> u64,
    {
        let timeout = self.timeout(options);
        let deadline = Instant::now() + timeout;
        let ceiling = self.wal_region.capacity().saturating_sub(OUTCOME_RESERVE);

        loop {
            let gate = self.gate_shared(timeout)?;
            let stripe = self
                .stripe(name)
                .try_write_for(timeout)
                .ok_or(VaultError::Timeout("block"))?;

            let previous = self.registry.try_get(name);
            let wal_reserve = reserve(previous.as_ref());
            match self.begin_txn(options, wal_reserve) {
                Ok(txn) => {
                    return Ok(Admitted {
                        txn,
                        _stripe: stripe,
                        _gate: gate,
                        previous,
                    })
                }
                Err(VaultError::WalFull { needed, available })
                    if needed <= ceiling && Instant::now() < deadline =>
                {
                    drop(stripe);
                    drop(gate);
                    debug!(name, needed, available, "WAL cannot admit write; checkpointing");
                    self.checkpoint()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Worst-case log bytes for storing `len` bytes and releasing `previous`
    ///
    /// Every page written logs at most one page image, and the images of a
    /// transaction never exceed its image budget.
    fn write_reservation(&self, name: &str, len: usize, previous: Option<&BlockEntry>) -> u64 {
        let written = (len as u64).div_ceil(self.overflow.page_capacity() as u64) + 1;
        let images = (written * self.page_size() as u64).min(self.image_budget);
        // registry upsert + commit
        let frames = written + self.release_frames(name, previous) + 2;
        images + frames * MAX_FRAME_OVERHEAD + name.len() as u64
    }

    /// Frames that releasing `entry` logs: its data page plus its chain
    fn release_frames(&self, name: &str, entry: Option<&BlockEntry>) -> u64 {
        let Some(entry) = entry else {
            return 0;
        };
        let chain = match self.read_data_page(name, entry) {
            Ok((header, payload)) if header.is_overflow_record() => {
                OverflowMetadata::parse(&payload).map_or(0, |(metadata, _)| metadata.page_count as u64)
            }
            _ => 0,
        };
        1 + chain
    }

    /// Log the release of a block's data page and overflow chain
    ///
    /// A damaged chain cannot be walked; its pages stay allocated until the
    /// next orphan scan.
    fn release_block(&self, txn: &mut WriteTxn<'_>, name: &str, entry: &BlockEntry) -> Result<()> {
        let page_offset = self.data_page_of(name, entry)?;

        match self.read_data_page(name, entry) {
            Ok((header, payload)) if header.is_overflow_record() => {
                match OverflowMetadata::parse(&payload) {
                    Some((metadata, _)) => match self.overflow.free_chain(txn, &metadata.chain_head()) {
                        Ok(pages) => debug!(name, pages, "overflow chain released"),
                        Err(e @ (VaultError::CorruptChain { .. } | VaultError::CorruptBlock { .. })) => {
                            warn!(name, error = %e, "overflow chain unreadable; leaving pages for orphan scan");
                        }
                        Err(e) => return Err(e),
                    },
                    None => warn!(name, "malformed overflow metadata; chain left for orphan scan"),
                }
            }
            Ok(_) => {}
            Err(e @ VaultError::CorruptBlock { .. }) => {
                warn!(name, error = %e, "releasing corrupt block");
            }
            Err(e) => return Err(e),
        }

        txn.free_pages(page_offset, 1)
    }

    // =========================================================================
    // Testing Hooks
    // =========================================================================

    /// Run a write up to, but not including, its `Commit`
    ///
    /// Leaves the transaction open in the log exactly as a crash would and
    /// returns the pages it allocated. The open transaction blocks every
    /// later checkpoint, so the provider can only be dropped afterwards.
    #[cfg(any(test, feature = "testing"))]
    pub fn debug_write_without_commit(&self, name: &str, data: &[u8]) -> Result<Vec<u64>> {
        let _gate = self.gate_shared(self.lock_timeout)?;
        let mut txn = self.begin_txn(&WriteOptions::default(), 0)?;
        let record = {
            let mut chains = self.overflow.session(&mut txn);
            row::split_with_overflow(Bytes::copy_from_slice(data), self.limits, &mut chains, self.compress)?
        };
        let entry = self.write_data_page(&mut txn, &record)?;
        txn.upsert_entry(name, entry)?;

        let pages = txn.allocated_pages();
        self.wal_lock()?.sync(&self.file)?;
        std::mem::forget(txn);
        Ok(pages)
    }
}

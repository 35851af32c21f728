//! In-memory block table with batched durable flush

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::fsm::FreeSpaceManager;
use crate::io::{PagedFile, Region};

use super::format::{
    decode_records, encode_record, record_len, BlockEntry, RegionHeader, REGION_HEADER_SIZE,
};

/// Flush tuning
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub page_size: u32,
    /// Dirty entry count that triggers a flush
    pub flush_threshold: usize,
    /// Maximum age of the oldest unflushed change
    pub flush_interval: Duration,
}

impl RegistryOptions {
    pub fn from_config(config: &Config, page_size: u32) -> Self {
        Self {
            page_size,
            flush_threshold: config.registry_flush_threshold,
            flush_interval: config.registry_flush_interval(),
        }
    }
}

/// Result of one flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Records written
    pub written: usize,
    /// Region now holding the table
    pub region: Region,
    /// Region abandoned by a compaction; free it once the file header
    /// points at `region`
    pub retired: Option<Region>,
}

impl FlushOutcome {
    pub fn relocated(&self) -> bool {
        self.retired.is_some()
    }
}

struct RegistryState {
    entries: HashMap<String, BlockEntry>,
    /// Names changed since the last flush (upserted or removed)
    dirty: HashSet<String>,
}

struct FlushState {
    region: Region,
    used_bytes: u64,
    record_count: u64,
    last_flush: Instant,
}

/// Name → location index
///
/// ## Concurrency:
/// - Lookups take the read side of the table lock and never wait on a flush
/// - Flushes are serialized behind their own mutex and snapshot the dirty set
///   under a short write lock
pub struct BlockRegistry {
    state: RwLock<RegistryState>,
    flush: Mutex<FlushState>,
    options: RegistryOptions,
}

impl BlockRegistry {
    /// An empty registry with no on-disk region yet
    pub fn new(options: RegistryOptions) -> Self {
        Self::with_entries(HashMap::new(), Region::default(), 0, 0, options)
    }

    /// Rebuild the table from the records in `region`
    pub fn load(file: &PagedFile, region: Region, options: RegistryOptions) -> Result<Self> {
        if region.is_empty() {
            return Ok(Self::new(options));
        }

        let mut header_bytes = [0u8; REGION_HEADER_SIZE];
        file.read_exact_at(&mut header_bytes, region.offset)?;
        let header = RegionHeader::decode(&header_bytes)?;

        let capacity = region.byte_len(options.page_size) - REGION_HEADER_SIZE as u64;
        let used = header.used_bytes.min(capacity);
        let mut body = vec![0u8; used as usize];
        file.read_exact_at(&mut body, region.offset + REGION_HEADER_SIZE as u64)?;

        let (records, torn) = decode_records(&body, header.record_count);
        if torn {
            warn!(
                expected = header.record_count,
                read = records.len(),
                "registry region has a damaged tail; later records skipped"
            );
        }

        let mut entries = HashMap::with_capacity(records.len());
        for record in &records {
            match record.entry {
                Some(entry) => {
                    entries.insert(record.name.clone(), entry);
                }
                None => {
                    entries.remove(&record.name);
                }
            }
        }

        info!(
            entries = entries.len(),
            records = records.len(),
            offset = region.offset,
            "block registry loaded"
        );

        let consumed: u64 = records.iter().map(|r| record_len(&r.name) as u64).sum();
        Ok(Self::with_entries(
            entries,
            region,
            consumed,
            records.len() as u64,
            options,
        ))
    }

    fn with_entries(
        entries: HashMap<String, BlockEntry>,
        region: Region,
        used_bytes: u64,
        record_count: u64,
        options: RegistryOptions,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                entries,
                dirty: HashSet::new(),
            }),
            flush: Mutex::new(FlushState {
                region,
                used_bytes,
                record_count,
                last_flush: Instant::now(),
            }),
            options,
        }
    }

    // =========================================================================
    // Table Operations
    // =========================================================================

    /// Look up a block; a miss is `None`, not an error
    pub fn try_get(&self, name: &str) -> Option<BlockEntry> {
        self.state.read().entries.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().entries.contains_key(name)
    }

    /// Insert or replace an entry (memory only until the next flush)
    pub fn upsert(&self, name: &str, entry: BlockEntry) -> Option<BlockEntry> {
        let mut state = self.state.write();
        state.dirty.insert(name.to_string());
        state.entries.insert(name.to_string(), entry)
    }

    /// Remove an entry (memory only until the next flush)
    pub fn remove(&self, name: &str) -> Option<BlockEntry> {
        let mut state = self.state.write();
        let old = state.entries.remove(name);
        if old.is_some() {
            state.dirty.insert(name.to_string());
        }
        old
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every live entry
    pub fn entries(&self) -> Vec<(String, BlockEntry)> {
        self.state
            .read()
            .entries
            .iter()
            .map(|(name, entry)| (name.clone(), *entry))
            .collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.state.read().dirty.len()
    }

    /// Region currently holding the table
    pub fn region(&self) -> Region {
        self.flush.lock().region
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Flush when enough changes have piled up or the interval has passed
    ///
    /// Returns `None` when no flush was due or another flush is in progress.
    pub fn flush_if_due(
        &self,
        file: &PagedFile,
        fsm: &FreeSpaceManager,
    ) -> Result<Option<FlushOutcome>> {
        let dirty = self.dirty_count();
        if dirty == 0 {
            return Ok(None);
        }

        let Some(mut flush) = self.flush.try_lock() else {
            return Ok(None);
        };
        let due = dirty >= self.options.flush_threshold
            || flush.last_flush.elapsed() >= self.options.flush_interval;
        if !due {
            return Ok(None);
        }
        self.flush_locked(&mut flush, file, fsm).map(Some)
    }

    /// Durably write every dirty entry as one batch
    pub fn flush(&self, file: &PagedFile, fsm: &FreeSpaceManager) -> Result<FlushOutcome> {
        let mut flush = self.flush.lock();
        self.flush_locked(&mut flush, file, fsm)
    }

    /// Rewrite the live table into a fresh region
    pub fn compact(&self, file: &PagedFile, fsm: &FreeSpaceManager) -> Result<FlushOutcome> {
        let mut flush = self.flush.lock();
        let names: Vec<String> = self.state.write().dirty.drain().collect();
        self.compact_locked(&mut flush, file, fsm).inspect_err(|_| self.remark_dirty(names))
    }

    fn flush_locked(
        &self,
        flush: &mut FlushState,
        file: &PagedFile,
        fsm: &FreeSpaceManager,
    ) -> Result<FlushOutcome> {
        let batch: Vec<(String, Option<BlockEntry>)> = {
            let mut state = self.state.write();
            let names: Vec<String> = state.dirty.drain().collect();
            names
                .into_iter()
                .map(|name| {
                    let entry = state.entries.get(&name).copied();
                    (name, entry)
                })
                .collect()
        };

        if batch.is_empty() {
            flush.last_flush = Instant::now();
            return Ok(FlushOutcome {
                written: 0,
                region: flush.region,
                retired: None,
            });
        }

        self.append_batch(flush, &batch, file, fsm).inspect_err(|_| {
            self.remark_dirty(batch.iter().map(|(name, _)| name.clone()).collect())
        })
    }

    fn append_batch(
        &self,
        flush: &mut FlushState,
        batch: &[(String, Option<BlockEntry>)],
        file: &PagedFile,
        fsm: &FreeSpaceManager,
    ) -> Result<FlushOutcome> {
        let mut records = Vec::with_capacity(batch.iter().map(|(n, _)| record_len(n)).sum());
        for (name, entry) in batch {
            encode_record(&mut records, name, entry.as_ref());
        }

        let capacity = flush
            .region
            .byte_len(self.options.page_size)
            .saturating_sub(REGION_HEADER_SIZE as u64);
        if flush.region.is_empty() || flush.used_bytes + records.len() as u64 > capacity {
            return self.compact_locked(flush, file, fsm);
        }

        // Pages referenced by the batch must reach disk before the entries do
        file.sync()?;

        let append_at = flush.region.offset + REGION_HEADER_SIZE as u64 + flush.used_bytes;
        file.write_all_at(&records, append_at)?;
        let header = RegionHeader {
            record_count: flush.record_count + batch.len() as u64,
            used_bytes: flush.used_bytes + records.len() as u64,
        };
        file.write_all_at(&header.encode(), flush.region.offset)?;
        file.sync()?;

        flush.record_count = header.record_count;
        flush.used_bytes = header.used_bytes;
        flush.last_flush = Instant::now();

        debug!(records = batch.len(), bytes = records.len(), "registry batch flushed");
        Ok(FlushOutcome {
            written: batch.len(),
            region: flush.region,
            retired: None,
        })
    }

    fn compact_locked(
        &self,
        flush: &mut FlushState,
        file: &PagedFile,
        fsm: &FreeSpaceManager,
    ) -> Result<FlushOutcome> {
        let live = self.entries();

        let mut records = Vec::with_capacity(live.iter().map(|(n, _)| record_len(n)).sum());
        for (name, entry) in &live {
            encode_record(&mut records, name, Some(entry));
        }

        let page_size = self.options.page_size as u64;
        let needed = (REGION_HEADER_SIZE + records.len()) as u64;
        let pages = (needed * 2).div_ceil(page_size).max(1);
        let offset = fsm.allocate(pages, file)?;
        let region = Region::new(offset, pages);

        let header = RegionHeader {
            record_count: live.len() as u64,
            used_bytes: records.len() as u64,
        };
        let mut image = Vec::with_capacity(needed as usize);
        image.extend_from_slice(&header.encode());
        image.extend_from_slice(&records);

        let written = file
            .sync()
            .and_then(|_| file.write_all_at(&image, offset))
            .and_then(|_| file.sync());
        if let Err(e) = written {
            if let Err(free_err) = fsm.free(offset, pages) {
                warn!(error = %free_err, offset, "failed to release registry region after write error");
            }
            return Err(e);
        }

        let retired = Some(flush.region).filter(|r| !r.is_empty());
        flush.region = region;
        flush.used_bytes = header.used_bytes;
        flush.record_count = header.record_count;
        flush.last_flush = Instant::now();

        info!(
            entries = live.len(),
            offset,
            pages,
            "registry compacted into new region"
        );
        Ok(FlushOutcome {
            written: live.len(),
            region,
            retired,
        })
    }

    fn remark_dirty(&self, names: Vec<String>) {
        let mut state = self.state.write();
        state.dirty.extend(names);
    }
}

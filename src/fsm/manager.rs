//! Free Space Manager
//!
//! Serves page allocation and free requests against the two-level map and
//! grows the backing file when no extent is large enough.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{AllocationStrategy, Config};
use crate::error::{Result, VaultError};
use crate::io::{PagedFile, Region};

use super::{FreeExtents, PageBitmap};

/// Magic bytes of a persisted FSM snapshot
const SNAPSHOT_MAGIC: &[u8; 4] = b"FSM1";

const SNAPSHOT_VERSION: u16 = 1;

/// Magic (4) + Version (2) + Reserved (2) + TotalPages (8) + WordCount (8)
const SNAPSHOT_HEADER_SIZE: usize = 24;

/// Allocator tuning, derived from [`Config`]
#[derive(Debug, Clone)]
pub struct FsmOptions {
    pub page_size: u32,
    pub min_extension_pages: u64,
    pub growth_percent: u32,
    pub max_pages: Option<u64>,
    pub strategy: AllocationStrategy,
    pub lock_timeout: Duration,
}

impl FsmOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.page_size,
            min_extension_pages: config.min_extension_pages(),
            growth_percent: config.growth_percent,
            max_pages: config.max_file_pages(),
            strategy: config.allocation_strategy,
            lock_timeout: config.lock_timeout(),
        }
    }
}

/// Point-in-time allocator statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmStats {
    pub total_pages: u64,
    pub allocated_pages: u64,
    pub free_pages: u64,
    pub extent_count: usize,
    pub largest_extent: u64,
}

struct FsmState {
    bitmap: PageBitmap,
    extents: FreeExtents,
    dirty: bool,
}

/// Page allocator over the backing file
///
/// ## Concurrency:
/// - All mutation happens under one allocator-wide mutex, acquired with a
///   bounded wait (`lock_timeout`)
/// - `total_pages`/`free_pages` atomics mirror the state after each mutation
///   so cheap statistics never take the lock
pub struct FreeSpaceManager {
    state: Mutex<FsmState>,
    options: FsmOptions,
    /// Header page + WAL region; permanently allocated
    reserved_pages: u64,
    total_pages: AtomicU64,
    free_pages: AtomicU64,
}

impl FreeSpaceManager {
    /// A map of `total_pages` pages where only the reserved prefix is allocated
    pub fn new(total_pages: u64, reserved_pages: u64, options: FsmOptions) -> Self {
        let mut bitmap = PageBitmap::new(total_pages);
        bitmap.set_range(0, reserved_pages.min(total_pages));
        let extents = FreeExtents::from_runs(bitmap.clear_runs());

        let fsm = Self {
            state: Mutex::new(FsmState {
                bitmap,
                extents,
                dirty: true,
            }),
            options,
            reserved_pages,
            total_pages: AtomicU64::new(0),
            free_pages: AtomicU64::new(0),
        };
        fsm.publish(&fsm.state.lock());
        fsm
    }

    /// Rebuild from a persisted snapshot
    ///
    /// Pages the file gained after the snapshot was taken are free.
    pub fn from_snapshot(
        bytes: &[u8],
        file_pages: u64,
        reserved_pages: u64,
        options: FsmOptions,
    ) -> Result<Self> {
        let (total, words) = decode_snapshot(bytes)?;
        if total > file_pages {
            return Err(VaultError::InvalidFormat(format!(
                "FSM snapshot covers {} pages but file has {}",
                total, file_pages
            )));
        }

        let mut bitmap = PageBitmap::from_words(words, total);
        bitmap.grow(file_pages);
        bitmap.set_range(0, reserved_pages.min(file_pages));
        let extents = FreeExtents::from_runs(bitmap.clear_runs());

        let fsm = Self {
            state: Mutex::new(FsmState {
                bitmap,
                extents,
                dirty: total != file_pages,
            }),
            options,
            reserved_pages,
            total_pages: AtomicU64::new(0),
            free_pages: AtomicU64::new(0),
        };
        fsm.publish(&fsm.state.lock());
        Ok(fsm)
    }

    pub fn page_size(&self) -> u32 {
        self.options.page_size
    }

    pub fn reserved_pages(&self) -> u64 {
        self.reserved_pages
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `page_count` contiguous pages, returning the byte offset
    pub fn allocate(&self, page_count: u64, file: &PagedFile) -> Result<u64> {
        if page_count == 0 {
            return Err(VaultError::InvalidRange("cannot allocate zero pages".to_string()));
        }
        let mut state = self.lock()?;
        let page = self.allocate_locked(&mut state, page_count, file)?;
        self.publish(&state);
        Ok(self.offset_of(page))
    }

    /// Allocate `page_count` single pages, contiguous when possible
    ///
    /// Falls back to stitching together smaller extents before growing the
    /// file. Returned offsets are in ascending order within each run.
    pub fn allocate_scattered(&self, page_count: u64, file: &PagedFile) -> Result<Vec<u64>> {
        if page_count == 0 {
            return Ok(Vec::new());
        }
        let mut state = self.lock()?;

        if let Some(start) = state.extents.take(page_count, self.options.strategy) {
            state.bitmap.set_range(start, page_count);
            state.dirty = true;
            self.publish(&state);
            return Ok((start..start + page_count).map(|p| self.offset_of(p)).collect());
        }

        let free = state.extents.total_free();
        if free < page_count {
            self.extend_locked(&mut state, page_count - free, file)?;
        }

        let mut pages = Vec::with_capacity(page_count as usize);
        while (pages.len() as u64) < page_count {
            let remaining = page_count - pages.len() as u64;
            let Some((_, first_len)) = state.extents.iter().next() else {
                return Err(VaultError::OutOfSpace(
                    "free extents exhausted during scattered allocation".to_string(),
                ));
            };
            let take = first_len.min(remaining);
            let Some(start) = state.extents.take(take, AllocationStrategy::FirstFit) else {
                return Err(VaultError::OutOfSpace(
                    "free extents exhausted during scattered allocation".to_string(),
                ));
            };
            state.bitmap.set_range(start, take);
            pages.extend((start..start + take).map(|p| self.offset_of(p)));
        }
        state.dirty = true;
        self.publish(&state);
        Ok(pages)
    }

    /// Free `page_count` pages starting at `offset`
    ///
    /// Pages already free are skipped, so repeating a free is harmless.
    /// Returns how many pages changed state.
    pub fn free(&self, offset: u64, page_count: u64) -> Result<u64> {
        let start = self.checked_range(offset, page_count)?;
        let mut state = self.lock()?;
        let freed = self.release_locked(&mut state, start, page_count);
        if freed < page_count {
            debug!(offset, page_count, freed, "free touched already-free pages");
        }
        self.publish(&state);
        Ok(freed)
    }

    /// Force pages to allocated (replay/reconciliation)
    pub fn mark_allocated(&self, offset: u64, page_count: u64) -> Result<u64> {
        let start = self.checked_range(offset, page_count)?;
        let mut state = self.lock()?;
        let changed = state.bitmap.set_range(start, page_count);
        state.extents.remove_range(start, page_count);
        if changed > 0 {
            state.dirty = true;
        }
        self.publish(&state);
        Ok(changed)
    }

    /// Force pages to free (replay/reconciliation)
    pub fn mark_free(&self, offset: u64, page_count: u64) -> Result<u64> {
        let start = self.checked_range(offset, page_count)?;
        let mut state = self.lock()?;
        let changed = self.release_locked(&mut state, start, page_count);
        self.publish(&state);
        Ok(changed)
    }

    /// Grow the file by at least `min_pages`
    ///
    /// Returns the new total page count.
    pub fn extend_file(&self, min_pages: u64, file: &PagedFile) -> Result<u64> {
        let mut state = self.lock()?;
        self.extend_locked(&mut state, min_pages, file)?;
        self.publish(&state);
        Ok(state.bitmap.len())
    }

    /// Whether the page at `offset` is allocated
    pub fn is_allocated(&self, offset: u64) -> Result<bool> {
        let page = offset / self.options.page_size as u64;
        Ok(self.lock()?.bitmap.is_set(page))
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Total pages as of the last mutation (lock-free)
    pub fn total_pages(&self) -> u64 {
        self.total_pages.load(Ordering::Acquire)
    }

    /// Free pages as of the last mutation (lock-free)
    pub fn free_pages(&self) -> u64 {
        self.free_pages.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Result<FsmStats> {
        let state = self.lock()?;
        Ok(FsmStats {
            total_pages: state.bitmap.len(),
            allocated_pages: state.bitmap.count_set(),
            free_pages: state.extents.total_free(),
            extent_count: state.extents.len(),
            largest_extent: state.extents.largest(),
        })
    }

    /// Free extents as `(byte offset, page count)`
    pub fn extents(&self) -> Result<Vec<(u64, u64)>> {
        let state = self.lock()?;
        Ok(state
            .extents
            .iter()
            .map(|(start, len)| (self.offset_of(start), len))
            .collect())
    }

    /// Check that both levels agree
    ///
    /// Allocated bits must equal total pages minus free extent pages, and
    /// every extent must cover only clear bits.
    pub fn invariant_holds(&self) -> Result<bool> {
        let state = self.lock()?;
        let bitmap = &state.bitmap;
        let extents = &state.extents;

        if bitmap.count_set() != bitmap.len() - extents.total_free() {
            return Ok(false);
        }
        let mut prev_end = None;
        for (start, len) in extents.iter() {
            if start + len > bitmap.len() || !bitmap.range_clear(start, len) {
                return Ok(false);
            }
            // Adjacent runs should have been coalesced
            if prev_end == Some(start) {
                return Ok(false);
            }
            prev_end = Some(start + len);
        }
        Ok(true)
    }

    /// Mutated since the last snapshot was persisted
    pub fn is_dirty(&self) -> Result<bool> {
        Ok(self.lock()?.dirty)
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Make the bitmap match the set of referenced pages
    ///
    /// Allocated pages outside `referenced` become free; referenced pages that
    /// are free become allocated. Returns `(freed, restored)`.
    pub fn reconcile(&self, referenced: &PageBitmap) -> Result<(u64, u64)> {
        let mut state = self.lock()?;
        let mut freed = 0;
        let mut restored = 0;

        for page in self.reserved_pages..state.bitmap.len() {
            let allocated = state.bitmap.is_set(page);
            let in_use = referenced.is_set(page);
            if allocated && !in_use {
                state.bitmap.clear(page);
                freed += 1;
            } else if !allocated && in_use {
                state.bitmap.set(page);
                restored += 1;
            }
        }

        if freed > 0 || restored > 0 {
            state.extents = FreeExtents::from_runs(state.bitmap.clear_runs());
            state.dirty = true;
        }
        self.publish(&state);
        Ok((freed, restored))
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Serialize the level-1 bitmap
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(encode_snapshot(&self.lock()?.bitmap))
    }

    /// Write a snapshot into `current`, relocating when it no longer fits
    ///
    /// Returns the region now holding the snapshot and, if the snapshot moved,
    /// the old region. The caller frees the old region only after the header
    /// points at the new one.
    pub fn persist(&self, file: &PagedFile, current: Region) -> Result<(Region, Option<Region>)> {
        let page_size = self.options.page_size as u64;
        let mut state = self.lock()?;
        let mut region = current;
        let mut retired = None;

        loop {
            let needed = snapshot_len(state.bitmap.len()).div_ceil(page_size);
            if !region.is_empty() && region.pages >= needed {
                break;
            }
            let pages = needed + needed / 4 + 1;
            let start = self.allocate_locked(&mut state, pages, file)?;
            if region != current {
                // Allocated on an earlier pass but outgrown by file extension
                self.release_locked(&mut state, region.offset / page_size, region.pages);
            } else if !current.is_empty() {
                retired = Some(current);
            }
            region = Region::new(self.offset_of(start), pages);
        }

        let bytes = encode_snapshot(&state.bitmap);
        state.dirty = false;
        self.publish(&state);
        drop(state);

        let written = file
            .write_all_at(&bytes, region.offset)
            .and_then(|_| file.sync());
        if let Err(e) = written {
            if let Ok(mut state) = self.lock() {
                state.dirty = true;
            }
            return Err(e);
        }

        debug!(offset = region.offset, pages = region.pages, bytes = bytes.len(), "FSM snapshot persisted");
        Ok((region, retired))
    }

    /// Read and decode the snapshot stored in `region`
    pub fn load_region(
        file: &PagedFile,
        region: Region,
        reserved_pages: u64,
        options: FsmOptions,
    ) -> Result<Self> {
        let mut bytes = vec![0u8; region.byte_len(options.page_size) as usize];
        file.read_exact_at(&mut bytes, region.offset)?;
        Self::from_snapshot(&bytes, file.total_pages(), reserved_pages, options)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn lock(&self) -> Result<MutexGuard<'_, FsmState>> {
        self.state
            .try_lock_for(self.options.lock_timeout)
            .ok_or(VaultError::Timeout("allocator"))
    }

    fn offset_of(&self, page: u64) -> u64 {
        page * self.options.page_size as u64
    }

    /// Validate alignment and bounds, returning the first page index
    fn checked_range(&self, offset: u64, page_count: u64) -> Result<u64> {
        let page_size = self.options.page_size as u64;
        if offset % page_size != 0 {
            return Err(VaultError::InvalidRange(format!(
                "offset {} is not page aligned",
                offset
            )));
        }
        let start = offset / page_size;
        if start < self.reserved_pages {
            return Err(VaultError::InvalidRange(format!(
                "page {} lies in the reserved prefix",
                start
            )));
        }
        let total = self.total_pages();
        if start + page_count > total {
            return Err(VaultError::InvalidRange(format!(
                "pages {}..{} beyond end of file ({} pages)",
                start,
                start + page_count,
                total
            )));
        }
        Ok(start)
    }

    fn allocate_locked(&self, state: &mut FsmState, page_count: u64, file: &PagedFile) -> Result<u64> {
        loop {
            if let Some(start) = state.extents.take(page_count, self.options.strategy) {
                state.bitmap.set_range(start, page_count);
                state.dirty = true;
                return Ok(start);
            }
            self.extend_locked(state, page_count, file)?;
        }
    }

    /// Clear bits and return the transitioned runs to the extent map
    fn release_locked(&self, state: &mut FsmState, start: u64, page_count: u64) -> u64 {
        let mut released = 0;
        let mut run_start = None;

        for page in start..start + page_count {
            if state.bitmap.clear(page) {
                released += 1;
                run_start.get_or_insert(page);
            } else if let Some(run) = run_start.take() {
                state.extents.insert(run, page - run);
            }
        }
        if let Some(run) = run_start {
            state.extents.insert(run, start + page_count - run);
        }

        if released > 0 {
            state.dirty = true;
        }
        released
    }

    fn extend_locked(&self, state: &mut FsmState, min_pages: u64, file: &PagedFile) -> Result<()> {
        let total = state.bitmap.len();
        let by_growth = total * self.options.growth_percent as u64 / 100;
        let mut new_total = total + self.options.min_extension_pages.max(min_pages).max(by_growth);

        if let Some(max_pages) = self.options.max_pages {
            if new_total > max_pages {
                if total + min_pages > max_pages {
                    return Err(VaultError::OutOfSpace(format!(
                        "need {} more pages but file is capped at {} pages ({} in use)",
                        min_pages, max_pages, total
                    )));
                }
                new_total = max_pages;
            }
        }

        let page_size = self.options.page_size as u64;
        file.set_len(new_total * page_size).map_err(|e| {
            warn!(error = %e, pages = new_total, "file extension rejected");
            VaultError::OutOfSpace(format!("file growth to {} pages failed: {}", new_total, e))
        })?;

        state.bitmap.grow(new_total);
        state.extents.insert(total, new_total - total);
        state.dirty = true;

        info!(from_pages = total, to_pages = new_total, "extended storage file");
        Ok(())
    }

    fn publish(&self, state: &FsmState) {
        self.total_pages.store(state.bitmap.len(), Ordering::Release);
        self.free_pages.store(state.extents.total_free(), Ordering::Release);
    }
}

// =============================================================================
// Snapshot Encoding
// =============================================================================

/// Encoded size of a snapshot covering `total_pages`
fn snapshot_len(total_pages: u64) -> u64 {
    SNAPSHOT_HEADER_SIZE as u64 + total_pages.div_ceil(64) * 8 + 4
}

fn encode_snapshot(bitmap: &PageBitmap) -> Vec<u8> {
    let words = bitmap.words();
    let mut out = Vec::with_capacity(snapshot_len(bitmap.len()) as usize);
    out.put_slice(SNAPSHOT_MAGIC);
    out.put_u16_le(SNAPSHOT_VERSION);
    out.put_u16_le(0);
    out.put_u64_le(bitmap.len());
    out.put_u64_le(words.len() as u64);
    for word in words {
        out.put_u64_le(*word);
    }
    let crc = crc32fast::hash(&out);
    out.put_u32_le(crc);
    out
}

fn decode_snapshot(bytes: &[u8]) -> Result<(u64, Vec<u64>)> {
    if bytes.len() < SNAPSHOT_HEADER_SIZE + 4 || &bytes[0..4] != SNAPSHOT_MAGIC {
        return Err(VaultError::InvalidFormat("bad FSM snapshot magic".to_string()));
    }
    let mut buf = &bytes[4..SNAPSHOT_HEADER_SIZE];
    let version = buf.get_u16_le();
    if version != SNAPSHOT_VERSION {
        return Err(VaultError::UnsupportedFeature(format!(
            "FSM snapshot version {}",
            version
        )));
    }
    buf.advance(2);
    let total_pages = buf.get_u64_le();
    let word_count = buf.get_u64_le();
    if word_count != total_pages.div_ceil(64) {
        return Err(VaultError::InvalidFormat("FSM snapshot word count mismatch".to_string()));
    }

    let body_len = SNAPSHOT_HEADER_SIZE + word_count as usize * 8;
    if bytes.len() < body_len + 4 {
        return Err(VaultError::InvalidFormat("FSM snapshot truncated".to_string()));
    }
    let stored_crc = (&bytes[body_len..body_len + 4]).get_u32_le();
    if crc32fast::hash(&bytes[..body_len]) != stored_crc {
        return Err(VaultError::InvalidFormat("FSM snapshot checksum mismatch".to_string()));
    }

    let mut words_buf = &bytes[SNAPSHOT_HEADER_SIZE..body_len];
    let words = (0..word_count).map(|_| words_buf.get_u64_le()).collect();
    Ok((total_pages, words))
}

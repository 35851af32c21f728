//! Storage Provider Module
//!
//! The single owner of the storage file. Composes the allocator, registry,
//! overflow chains and WAL behind block-level operations.
//!
//! ## Write Path
//! ```text
//! write_block(name, bytes)
//!      │
//!      ├─► codec: inline or overflow split
//!      ├─► FSM: allocate data page (+ chain pages)
//!      ├─► WAL: PageWrite entries
//!      ├─► file: page writes
//!      ├─► WAL: RegistryUpsert, Commit (fsync)
//!      └─► registry: upsert in memory, batched flush
//! ```
//!
//! ## Lock Order
//! checkpoint gate → block stripe → registry flush → allocator → header → WAL
//!
//! - Writers hold the gate shared for the whole transaction; checkpoints and
//!   the orphan scan hold it exclusively, so the WAL is never truncated under
//!   an open transaction
//! - Each block name hashes to one of 64 stripes: readers share a stripe,
//!   writers of the same name exclude each other and its readers

mod blocks;
mod data_page;
mod maintenance;

pub use blocks::TABLE_DIRECTORY_BLOCK;
pub use data_page::{DataPageHeader, DATA_HEADER_SIZE, DATA_PAGE_MAGIC, FLAG_OVERFLOW_RECORD};
pub use maintenance::{OrphanReport, VerifyReport};

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

use crate::cancel::WriteOptions;
use crate::checksum::{default_checksum, Checksum};
use crate::config::{Config, IMAGE_BUDGET_DIVISOR, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::error::{Result, VaultError};
use crate::fsm::{FreeSpaceManager, FsmOptions};
use crate::io::header::{
    FEATURE_DOUBLY_LINKED_CHAINS, FEATURE_OVERFLOW_COMPRESSION, FEATURE_ROW_OVERFLOW,
};
use crate::io::{BufferPool, FileHeader, PagedFile, Region};
use crate::overflow::{CompressionAlgorithm, OverflowManager};
use crate::registry::{BlockRegistry, RegistryOptions};
use crate::row::InlineLimits;
use crate::txn::{TxnContext, WriteTxn};
use crate::wal::{WalRecovery, WalRegion, WalRegionHeader, WalWriter};

const LOCK_STRIPES: usize = 64;

/// Point-in-time counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStats {
    pub page_size: u32,
    pub total_pages: u64,
    pub free_pages: u64,
    pub block_count: usize,
    pub file_bytes: u64,
    pub wal_used_bytes: u64,
    pub wal_capacity_bytes: u64,
    pub last_lsn: u64,
    pub checkpoint_lsn: u64,
    pub checkpoint_count: u64,
    /// Registry changes not yet on disk
    pub registry_dirty: usize,
    pub buffer_pool_misses: u64,
}

/// Single-file block store
pub struct StorageProvider {
    config: Config,
    file: PagedFile,
    header: Mutex<FileHeader>,
    fsm: FreeSpaceManager,
    registry: BlockRegistry,
    wal: Mutex<WalWriter>,
    wal_region: WalRegion,
    overflow: OverflowManager,
    checksum: Arc<dyn Checksum>,
    pool: Arc<BufferPool>,
    limits: InlineLimits,
    compress: bool,
    stripes: Vec<RwLock<()>>,
    gate: RwLock<()>,
    lock_timeout: Duration,
    image_budget: u64,
}

impl StorageProvider {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the file at `config.path`, creating it if allowed
    pub fn open(config: Config) -> Result<Self> {
        Self::open_with_checksum(config, default_checksum())
    }

    /// Open with a caller-supplied block digest
    pub fn open_with_checksum(config: Config, checksum: Arc<dyn Checksum>) -> Result<Self> {
        config.validate()?;
        if config.path.exists() {
            Self::load(config, checksum)
        } else if config.create_if_missing {
            Self::create(config, checksum)
        } else {
            Err(VaultError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("storage file {} does not exist", config.path.display()),
            )))
        }
    }

    /// Create a new file, replacing any existing one
    pub fn create(config: Config, checksum: Arc<dyn Checksum>) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let page_size = config.page_size;
        let ps = page_size as u64;
        let wal_pages = config.wal_region_pages as u64;
        let reserved = 1 + wal_pages;

        let file = PagedFile::create(&config.path, page_size)?;
        file.set_len(reserved * ps)?;

        let wal_region = WalRegion::new(Region::new(ps, wal_pages), page_size);
        let wal = WalWriter::create(&file, wal_region, config.wal_sync_strategy)?;

        let compression = if config.compression_enabled {
            config.compression_algorithm.id()
        } else {
            CompressionAlgorithm::None.id()
        };
        let mut header = FileHeader::new(
            page_size,
            config.feature_flags(),
            config.overflow_threshold_bytes(),
            compression,
            checksum.algorithm_id(),
            ps,
            wal_pages * ps,
        );
        header.write_next(&file)?;

        let fsm = FreeSpaceManager::new(reserved, reserved, FsmOptions::from_config(&config));
        let registry = BlockRegistry::new(RegistryOptions::from_config(&config, page_size));

        info!(
            path = %config.path.display(),
            page_size,
            wal_pages,
            features = header.feature_flags,
            "created storage file"
        );

        let provider = Self::assemble(config, file, header, fsm, registry, wal, wal_region, checksum)?;
        provider.checkpoint()?;
        Ok(provider)
    }

    /// Open an existing file and recover it
    ///
    /// 1. Pick the newest valid header slot and check its feature flags
    /// 2. Load the registry and the FSM snapshot
    /// 3. Replay the WAL
    /// 4. Optionally reconcile the FSM against live references
    /// 5. Checkpoint, which resets the WAL
    pub fn load(config: Config, checksum: Arc<dyn Checksum>) -> Result<Self> {
        config.validate()?;
        let file = PagedFile::open(&config.path, config.page_size)?;
        let header = FileHeader::read_latest(&file)?;
        header.validate_features()?;

        if header.checksum_algorithm != checksum.algorithm_id() {
            return Err(VaultError::UnsupportedFeature(format!(
                "file uses checksum algorithm {}, provider was given {}",
                header.checksum_algorithm,
                checksum.algorithm_id()
            )));
        }
        let page_size = header.page_size;
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(VaultError::InvalidFormat(format!("page size {} in header", page_size)));
        }

        let config = Self::effective_config(config, &header)?;
        let file = file.with_page_size(page_size);
        let ps = page_size as u64;

        let wal_region = WalRegion::new(
            Region::new(header.wal_offset, header.wal_length / ps),
            page_size,
        );
        let reserved = (header.wal_offset + header.wal_length) / ps;

        let registry = BlockRegistry::load(
            &file,
            header.registry,
            RegistryOptions::from_config(&config, page_size),
        )?;

        let fsm_options = FsmOptions::from_config(&config);
        let (fsm, rebuilt) = match FreeSpaceManager::load_region(&file, header.fsm, reserved, fsm_options.clone()) {
            Ok(fsm) => (fsm, false),
            Err(e) => {
                warn!(error = %e, "FSM snapshot unusable; rebuilding from live references");
                (FreeSpaceManager::new(file.total_pages(), reserved, fsm_options), true)
            }
        };

        let wal_header = WalRegionHeader::read(&file, &wal_region)?;
        let recovery = WalRecovery::replay(
            &file,
            wal_region,
            header.checkpoint_lsn,
            &[header.registry, header.fsm],
            &fsm,
            &registry,
        )?;

        // System regions may have been placed after the FSM snapshot was taken
        for region in [header.registry, header.fsm] {
            if !region.is_empty() {
                fsm.mark_allocated(region.offset, region.pages)?;
            }
        }

        let wal = WalWriter::new(
            wal_region,
            WalRegionHeader {
                checkpoint_lsn: recovery.last_lsn.max(header.checkpoint_lsn),
                truncations: wal_header.truncations,
            },
            config.wal_sync_strategy,
            header.last_txn_id.max(recovery.last_txn_id) + 1,
        );

        info!(
            path = %config.path.display(),
            blocks = registry.len(),
            pages = fsm.total_pages(),
            replayed = recovery.transactions_committed,
            "opened storage file"
        );

        let reclaim = rebuilt || config.reclaim_orphans_on_open;
        let provider = Self::assemble(config, file, header, fsm, registry, wal, wal_region, checksum)?;
        if reclaim {
            provider.reclaim_orphans()?;
        }
        provider.checkpoint()?;
        Ok(provider)
    }

    /// Checkpoint and release the file
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        info!(path = %self.config.path.display(), "storage file closed");
        Ok(())
    }

    /// Same as [`StorageProvider::checkpoint`]
    pub fn flush_all(&self) -> Result<()> {
        self.checkpoint()
    }

    /// Make the main file self-sufficient and reset the WAL
    ///
    /// Flushes the registry, persists the FSM, writes the header and then
    /// truncates the log. Waits for in-flight writes to finish.
    pub fn checkpoint(&self) -> Result<()> {
        let _gate = self.gate_exclusive()?;
        self.checkpoint_locked()
    }

    fn checkpoint_locked(&self) -> Result<()> {
        let registry = self.registry.flush(&self.file, &self.fsm)?;
        let current_fsm = self.header.lock().fsm;
        let (fsm_region, fsm_retired) = self.fsm.persist(&self.file, current_fsm)?;

        let (lsn, last_txn_id) = {
            let wal = self.wal_lock()?;
            (wal.current_lsn(), wal.last_txn_id())
        };
        let table_directory = self.registry.try_get(TABLE_DIRECTORY_BLOCK);

        {
            let mut header = self.header.lock();
            header.registry = registry.region;
            header.fsm = fsm_region;
            header.checkpoint_lsn = lsn;
            header.last_txn_id = last_txn_id;
            header.total_pages = self.fsm.total_pages();
            header.block_count = self.registry.len() as u64;
            header.checkpoint_count += 1;
            header.table_directory_offset = table_directory.map_or(0, |e| e.offset);
            header.table_directory_length = table_directory.map_or(0, |e| e.length);
            header.write_next(&self.file)?;
        }

        self.wal_lock()?.truncate(&self.file)?;

        for region in registry.retired.into_iter().chain(fsm_retired) {
            self.fsm.free(region.offset, region.pages)?;
        }

        info!(
            checkpoint_lsn = lsn,
            blocks = self.registry.len(),
            pages = self.fsm.total_pages(),
            "checkpoint complete"
        );
        Ok(())
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn page_size(&self) -> u32 {
        self.file.page_size()
    }

    /// Copy of the in-memory file header
    pub fn header(&self) -> FileHeader {
        self.header.lock().clone()
    }

    pub fn stats(&self) -> Result<ProviderStats> {
        let (wal_used, last_lsn, checkpoint_lsn) = {
            let wal = self.wal_lock()?;
            (wal.used_bytes(), wal.current_lsn(), wal.checkpoint_lsn())
        };
        Ok(ProviderStats {
            page_size: self.page_size(),
            total_pages: self.fsm.total_pages(),
            free_pages: self.fsm.free_pages(),
            block_count: self.registry.len(),
            file_bytes: self.file.len(),
            wal_used_bytes: wal_used,
            wal_capacity_bytes: self.wal_region.capacity(),
            last_lsn,
            checkpoint_lsn,
            checkpoint_count: self.header.lock().checkpoint_count,
            registry_dirty: self.registry.dirty_count(),
            buffer_pool_misses: self.pool.misses(),
        })
    }

    /// Whether the allocator considers the page at `offset` in use
    pub fn is_page_allocated(&self, offset: u64) -> Result<bool> {
        self.fsm.is_allocated(offset)
    }

    /// Free extents as (byte offset, page count)
    pub fn free_extents(&self) -> Result<Vec<(u64, u64)>> {
        self.fsm.extents()
    }

    /// Allocated-bit count agrees with the free extents
    pub fn fsm_invariant_holds(&self) -> Result<bool> {
        self.fsm.invariant_holds()
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        config: Config,
        file: PagedFile,
        header: FileHeader,
        fsm: FreeSpaceManager,
        registry: BlockRegistry,
        wal: WalWriter,
        wal_region: WalRegion,
        checksum: Arc<dyn Checksum>,
    ) -> Result<Self> {
        let page_size = header.page_size;
        let pool = Arc::new(BufferPool::new(page_size as usize, config.buffer_pool_capacity));

        let algorithm = if header.has_feature(FEATURE_OVERFLOW_COMPRESSION) {
            CompressionAlgorithm::from_id(header.compression_algorithm)?
        } else {
            CompressionAlgorithm::None
        };
        let overflow = OverflowManager::new(
            page_size,
            algorithm,
            header.has_feature(FEATURE_DOUBLY_LINKED_CHAINS),
            Arc::clone(&checksum),
            Arc::clone(&pool),
        );
        let limits = InlineLimits {
            threshold: header.overflow_threshold_bytes as usize,
            page_capacity: page_size as usize - DATA_HEADER_SIZE,
            overflow_enabled: header.has_feature(FEATURE_ROW_OVERFLOW),
        };

        Ok(Self {
            lock_timeout: config.lock_timeout(),
            image_budget: wal_region.capacity() / IMAGE_BUDGET_DIVISOR,
            compress: algorithm != CompressionAlgorithm::None,
            stripes: (0..LOCK_STRIPES).map(|_| RwLock::new(())).collect(),
            gate: RwLock::new(()),
            config,
            file,
            header: Mutex::new(header),
            fsm,
            registry,
            wal: Mutex::new(wal),
            wal_region,
            overflow,
            checksum,
            pool,
            limits,
        })
    }

    /// Config with the format-defining settings taken from the header
    fn effective_config(mut config: Config, header: &FileHeader) -> Result<Config> {
        let overflow = header.has_feature(FEATURE_ROW_OVERFLOW);
        let compression = header.has_feature(FEATURE_OVERFLOW_COMPRESSION);
        let doubly_linked = header.has_feature(FEATURE_DOUBLY_LINKED_CHAINS);

        if config.page_size != header.page_size
            || config.overflow_enabled != overflow
            || config.compression_enabled != compression
            || config.overflow_threshold_bytes() != header.overflow_threshold_bytes
        {
            warn!(
                config_page_size = config.page_size,
                file_page_size = header.page_size,
                file_features = header.feature_flags,
                "file format settings differ from config; using the file's"
            );
        }

        config.page_size = header.page_size;
        config.overflow_enabled = overflow;
        config.compression_enabled = compression;
        config.doubly_linked_chains = doubly_linked;
        if compression {
            config.compression_algorithm = CompressionAlgorithm::from_id(header.compression_algorithm)?;
        }
        Ok(config)
    }

    fn ctx(&self) -> TxnContext<'_> {
        TxnContext {
            file: &self.file,
            fsm: &self.fsm,
            registry: &self.registry,
            wal: &self.wal,
        }
    }

    fn begin_txn(&self, options: &WriteOptions, wal_reserve: u64) -> Result<WriteTxn<'_>> {
        WriteTxn::begin_reserved(self.ctx(), options, self.lock_timeout, self.image_budget, wal_reserve)
    }

    fn timeout(&self, options: &WriteOptions) -> Duration {
        options.lock_timeout.unwrap_or(self.lock_timeout)
    }

    fn wal_lock(&self) -> Result<MutexGuard<'_, WalWriter>> {
        self.wal
            .try_lock_for(self.lock_timeout)
            .ok_or(VaultError::Timeout("wal"))
    }

    fn gate_shared(&self, timeout: Duration) -> Result<RwLockReadGuard<'_, ()>> {
        self.gate
            .try_read_for(timeout)
            .ok_or(VaultError::Timeout("checkpoint gate"))
    }

    fn gate_exclusive(&self) -> Result<RwLockWriteGuard<'_, ()>> {
        self.gate
            .try_write_for(self.lock_timeout)
            .ok_or(VaultError::Timeout("checkpoint gate"))
    }

    fn stripe(&self, name: &str) -> &RwLock<()> {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        &self.stripes[hasher.finish() as usize % LOCK_STRIPES]
    }

    /// Checkpoint first when the WAL is filling up
    fn maybe_checkpoint(&self) -> Result<()> {
        let usage = self.wal_lock()?.usage_percent();
        if usage >= self.config.wal_checkpoint_percent {
            info!(usage_percent = usage, "WAL usage over threshold; checkpointing");
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Registry housekeeping after a commit
    ///
    /// The write is already durable; failures here only delay the flush.
    fn after_commit(&self) {
        let outcome = match self.registry.flush_if_due(&self.file, &self.fsm) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "registry flush failed; will retry");
                return;
            }
        };

        let relocated = {
            let mut header = self.header.lock();
            if header.registry == outcome.region {
                Ok(false)
            } else {
                header.registry = outcome.region;
                header.write_next(&self.file).map(|()| true)
            }
        };
        match relocated {
            Ok(true) => {
                if let Some(retired) = outcome.retired {
                    if let Err(e) = self.fsm.free(retired.offset, retired.pages) {
                        warn!(error = %e, offset = retired.offset, "failed to release old registry region");
                    }
                }
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "header update after registry relocation failed"),
        }
    }
}

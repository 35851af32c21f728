//! Configuration for pagevault
//!
//! Centralized configuration with sensible defaults.
//!
//! Settings that define the on-disk format (page size, overflow feature flags,
//! inline threshold, compression algorithm) are stamped into the file header
//! when the file is created. Reopening an existing file always uses the
//! header's values.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, VaultError};
use crate::io::header::{
    FEATURE_DOUBLY_LINKED_CHAINS, FEATURE_OVERFLOW_COMPRESSION, FEATURE_ROW_OVERFLOW,
};
use crate::overflow::CompressionAlgorithm;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: u32 = 4096;

/// Largest supported page size
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Share of the WAL one transaction may fill with page images
pub const IMAGE_BUDGET_DIVISOR: u64 = 8;

/// Highest checkpoint trigger; leaves room above it for one transaction's
/// page images plus its frames
pub const MAX_WAL_CHECKPOINT_PERCENT: u8 = 80;

/// Main configuration for a pagevault file
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // File Configuration
    // -------------------------------------------------------------------------
    /// Path of the single storage file
    pub path: PathBuf,

    /// Create the file when it does not exist
    pub create_if_missing: bool,

    /// Page size in bytes (power of two, 4096..=65536)
    pub page_size: u32,

    // -------------------------------------------------------------------------
    // Overflow Configuration
    // -------------------------------------------------------------------------
    /// Split rows larger than the inline threshold into overflow chains
    pub overflow_enabled: bool,

    /// Inline threshold as a percentage of the page size (50..=95)
    pub overflow_threshold_percent: u8,

    /// Link overflow pages in both directions
    pub doubly_linked_chains: bool,

    /// Compress overflow chain payloads
    pub compression_enabled: bool,

    /// Algorithm used when compression is enabled
    pub compression_algorithm: CompressionAlgorithm,

    // -------------------------------------------------------------------------
    // WAL Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync the WAL
    pub wal_sync_strategy: WalSyncStrategy,

    /// Number of pages reserved for the WAL region
    pub wal_region_pages: u32,

    /// WAL usage (percent) that triggers a checkpoint before the next write
    pub wal_checkpoint_percent: u8,

    // -------------------------------------------------------------------------
    // Block Registry Configuration
    // -------------------------------------------------------------------------
    /// Dirty entry count that triggers a registry flush
    pub registry_flush_threshold: usize,

    /// Maximum time between registry flushes (milliseconds)
    pub registry_flush_interval_ms: u64,

    // -------------------------------------------------------------------------
    // Allocation Configuration
    // -------------------------------------------------------------------------
    /// Minimum number of bytes added when the file grows
    pub min_extension_bytes: u64,

    /// Growth relative to the current file size (percent) for each extension
    pub growth_percent: u32,

    /// Hard cap on the file size; growth beyond it fails with OutOfSpace
    pub max_file_bytes: Option<u64>,

    /// Extent selection strategy
    pub allocation_strategy: AllocationStrategy,

    // -------------------------------------------------------------------------
    // Concurrency / Resource Configuration
    // -------------------------------------------------------------------------
    /// Upper bound on any single lock acquisition (milliseconds)
    pub lock_timeout_ms: u64,

    /// Number of page buffers kept for reuse
    pub buffer_pool_capacity: usize,

    /// Run the orphan scan every time the file is opened
    pub reclaim_orphans_on_open: bool,
}

/// WAL sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync after every appended entry (safest, slowest)
    EveryWrite,

    /// fsync only when a transaction commits (the durability boundary)
    OnCommit,
}

/// How the allocator picks a free extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Lowest-addressed extent that is large enough
    FirstFit,

    /// Smallest extent that is large enough (ties go to the lowest address)
    BestFit,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./pagevault.db"),
            create_if_missing: true,
            page_size: MIN_PAGE_SIZE,
            overflow_enabled: true,
            overflow_threshold_percent: 75,
            doubly_linked_chains: true,
            compression_enabled: false,
            compression_algorithm: CompressionAlgorithm::Zstd,
            wal_sync_strategy: WalSyncStrategy::OnCommit,
            wal_region_pages: 1024,
            wal_checkpoint_percent: 50,
            registry_flush_threshold: 200,
            registry_flush_interval_ms: 500,
            min_extension_bytes: 10 * 1024 * 1024, // 10 MB
            growth_percent: 100,
            max_file_bytes: None,
            allocation_strategy: AllocationStrategy::FirstFit,
            lock_timeout_ms: 5000,
            buffer_pool_capacity: 64,
            reclaim_orphans_on_open: true,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check every setting against its supported range
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(VaultError::Config(format!(
                "page_size must be a power of two in {}..={}, got {}",
                MIN_PAGE_SIZE, MAX_PAGE_SIZE, self.page_size
            )));
        }
        if !(50..=95).contains(&self.overflow_threshold_percent) {
            return Err(VaultError::Config(format!(
                "overflow_threshold_percent must be in 50..=95, got {}",
                self.overflow_threshold_percent
            )));
        }
        if self.compression_enabled && self.compression_algorithm == CompressionAlgorithm::None {
            return Err(VaultError::Config(
                "compression enabled but compression_algorithm is None".to_string(),
            ));
        }
        if self.wal_region_pages < 16 {
            return Err(VaultError::Config(format!(
                "wal_region_pages must be at least 16, got {}",
                self.wal_region_pages
            )));
        }
        if !(10..=MAX_WAL_CHECKPOINT_PERCENT).contains(&self.wal_checkpoint_percent) {
            return Err(VaultError::Config(format!(
                "wal_checkpoint_percent must be in 10..={}, got {}",
                MAX_WAL_CHECKPOINT_PERCENT, self.wal_checkpoint_percent
            )));
        }
        if self.registry_flush_threshold == 0 {
            return Err(VaultError::Config(
                "registry_flush_threshold must be positive".to_string(),
            ));
        }
        if self.growth_percent == 0 {
            return Err(VaultError::Config("growth_percent must be positive".to_string()));
        }
        if self.lock_timeout_ms == 0 {
            return Err(VaultError::Config("lock_timeout_ms must be positive".to_string()));
        }
        if self.buffer_pool_capacity == 0 {
            return Err(VaultError::Config(
                "buffer_pool_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Inline threshold in bytes derived from the page size
    pub fn overflow_threshold_bytes(&self) -> u32 {
        (self.page_size as u64 * self.overflow_threshold_percent as u64 / 100) as u32
    }

    /// Feature flags a new file is stamped with
    pub fn feature_flags(&self) -> u32 {
        let mut flags = 0;
        if self.overflow_enabled {
            flags |= FEATURE_ROW_OVERFLOW;
            if self.compression_enabled {
                flags |= FEATURE_OVERFLOW_COMPRESSION;
            }
            if self.doubly_linked_chains {
                flags |= FEATURE_DOUBLY_LINKED_CHAINS;
            }
        }
        flags
    }

    /// Minimum extension expressed in pages
    pub fn min_extension_pages(&self) -> u64 {
        (self.min_extension_bytes / self.page_size as u64).max(1)
    }

    /// File size cap expressed in pages
    pub fn max_file_pages(&self) -> Option<u64> {
        self.max_file_bytes.map(|bytes| bytes / self.page_size as u64)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn registry_flush_interval(&self) -> Duration {
        Duration::from_millis(self.registry_flush_interval_ms)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the storage file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.config.create_if_missing = create;
        self
    }

    /// Set the page size (in bytes)
    pub fn page_size(mut self, size: u32) -> Self {
        self.config.page_size = size;
        self
    }

    pub fn overflow_enabled(mut self, enabled: bool) -> Self {
        self.config.overflow_enabled = enabled;
        self
    }

    /// Set the inline threshold percentage
    pub fn overflow_threshold_percent(mut self, percent: u8) -> Self {
        self.config.overflow_threshold_percent = percent;
        self
    }

    pub fn doubly_linked_chains(mut self, enabled: bool) -> Self {
        self.config.doubly_linked_chains = enabled;
        self
    }

    /// Enable overflow compression with the given algorithm
    pub fn compression(mut self, algorithm: CompressionAlgorithm) -> Self {
        self.config.compression_enabled = algorithm != CompressionAlgorithm::None;
        self.config.compression_algorithm = algorithm;
        self
    }

    /// Set the WAL sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    pub fn wal_region_pages(mut self, pages: u32) -> Self {
        self.config.wal_region_pages = pages;
        self
    }

    pub fn wal_checkpoint_percent(mut self, percent: u8) -> Self {
        self.config.wal_checkpoint_percent = percent;
        self
    }

    /// Set the registry batch-flush thresholds
    pub fn registry_flush(mut self, dirty_threshold: usize, interval_ms: u64) -> Self {
        self.config.registry_flush_threshold = dirty_threshold;
        self.config.registry_flush_interval_ms = interval_ms;
        self
    }

    pub fn min_extension_bytes(mut self, bytes: u64) -> Self {
        self.config.min_extension_bytes = bytes;
        self
    }

    pub fn growth_percent(mut self, percent: u32) -> Self {
        self.config.growth_percent = percent;
        self
    }

    pub fn max_file_bytes(mut self, bytes: u64) -> Self {
        self.config.max_file_bytes = Some(bytes);
        self
    }

    pub fn allocation_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.config.allocation_strategy = strategy;
        self
    }

    /// Set the lock timeout (in milliseconds)
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_timeout_ms = ms;
        self
    }

    pub fn buffer_pool_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_pool_capacity = capacity;
        self
    }

    pub fn reclaim_orphans_on_open(mut self, enabled: bool) -> Self {
        self.config.reclaim_orphans_on_open = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

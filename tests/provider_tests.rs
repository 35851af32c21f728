//! Integration tests for the Storage Provider
//!
//! These tests verify:
//! - Block and row writes through inline and overflow storage
//! - Updates, frees and page reuse
//! - The table directory
//! - Cancellation, checksum injection and consistency checks
//! - Persistence across close and reopen

use std::path::Path;
use std::sync::Arc;

use pagevault::cancel::{CancelToken, WriteOptions};
use pagevault::checksum::{default_checksum, Checksum};
use pagevault::io::PagedFile;
use pagevault::overflow::{flags, OverflowPageHeader, OVERFLOW_HEADER_SIZE};
use pagevault::row::OverflowMetadata;
use pagevault::provider::{TABLE_DIRECTORY_BLOCK, DATA_HEADER_SIZE};
use pagevault::{CompressionAlgorithm, Config, Row, StorageProvider, Value, VaultError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const PAGE_SIZE: u32 = 4096;

/// Small files, no timed registry flushes
fn test_config(dir: &Path) -> Config {
    Config::builder()
        .path(dir.join("vault.db"))
        .page_size(PAGE_SIZE)
        .wal_region_pages(64)
        .min_extension_bytes(64 * PAGE_SIZE as u64)
        .registry_flush(1000, 60_000)
        .build()
}

fn setup() -> (TempDir, StorageProvider) {
    let temp_dir = TempDir::new().unwrap();
    let provider = StorageProvider::open(test_config(temp_dir.path())).unwrap();
    (temp_dir, provider)
}

fn cafe_row() -> Row {
    Row::new()
        .with("id", 1i32)
        .with("name", "Café")
        .with("bio", "x".repeat(5000))
}

/// Deterministic bytes that do not compress
fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 32) as u8
        })
        .collect()
}

/// Digest used to check that the provider honours an injected checksum
#[derive(Debug)]
struct Adler;

impl Checksum for Adler {
    fn algorithm_id(&self) -> u8 {
        9
    }

    fn compute(&self, data: &[u8]) -> u32 {
        let (mut a, mut b) = (1u32, 0u32);
        for &byte in data {
            a = (a + byte as u32) % 65521;
            b = (b + a) % 65521;
        }
        (b << 16) | a
    }
}

// =============================================================================
// Row Storage Tests
// =============================================================================

#[test]
fn test_cafe_row_goes_through_overflow() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        compression_enabled: true,
        compression_algorithm: CompressionAlgorithm::Zstd,
        ..test_config(temp_dir.path())
    };
    let provider = StorageProvider::open(config).unwrap();
    let row = cafe_row();

    let entry = provider.write_row("user:1", &row).unwrap();

    assert_eq!(entry.length, 3072, "inline part fills the threshold exactly");

    let raw = PagedFile::open(&temp_dir.path().join("vault.db"), PAGE_SIZE).unwrap();
    let mut payload = vec![0u8; entry.length as usize];
    raw.read_exact_at(&mut payload, entry.offset).unwrap();
    let (metadata, inline) = OverflowMetadata::parse(&payload).unwrap();
    assert_eq!(metadata.total_size as usize, pagevault::row::serialized_size(&row));
    assert_eq!(metadata.inline_size as usize, 3072 - OverflowMetadata::SIZE);
    assert_eq!(inline.len(), metadata.inline_size as usize);

    let mut page = vec![0u8; PAGE_SIZE as usize];
    raw.read_exact_at(&mut page, metadata.first_offset).unwrap();
    let first = OverflowPageHeader::read_page(&page, metadata.first_offset, default_checksum().as_ref()).unwrap();
    assert!(first.has(flags::COMPRESSED));
    assert_eq!(first.compression, CompressionAlgorithm::Zstd.id());

    // A run of 'x' compresses into a single overflow page
    let capacity = PAGE_SIZE as usize - OVERFLOW_HEADER_SIZE;
    assert!(first.has(flags::LAST));
    assert_eq!(metadata.page_count as usize, (first.stored_size as usize).div_ceil(capacity));
    assert_eq!(metadata.page_count, 1);
    assert_eq!(metadata.first_offset, metadata.last_offset);

    let read = provider.read_row("user:1").unwrap().unwrap();
    assert_eq!(read, row);
    assert_eq!(read.get("name"), Some(&Value::String("Café".to_string())));
    assert!(provider.verify().unwrap().is_clean());
}

#[test]
fn test_small_row_stays_inline() {
    let (_temp, provider) = setup();
    let row = Row::new().with("id", 7i64).with("active", true);

    let entry = provider.write_row("small", &row).unwrap();

    assert_eq!(entry.length as usize, pagevault::row::serialized_size(&row));
    assert_eq!(provider.read_row("small").unwrap(), Some(row));
}

#[test]
fn test_missing_block_reads_none() {
    let (_temp, provider) = setup();
    assert_eq!(provider.read_block("nothing").unwrap(), None);
    assert_eq!(provider.read_row("nothing").unwrap(), None);
    assert!(!provider.contains_block("nothing"));
}

// =============================================================================
// Block Storage Tests
// =============================================================================

#[test]
fn test_large_block_roundtrip() {
    let (_temp, provider) = setup();
    let data = noise(100 * 1024);

    provider.write_block("big", &data).unwrap();

    assert_eq!(provider.read_block("big").unwrap(), Some(data));
    assert!(provider.fsm_invariant_holds().unwrap());
}

#[test]
fn test_page_fit_boundary_without_overflow() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        overflow_enabled: false,
        ..test_config(temp_dir.path())
    };
    let provider = StorageProvider::open(config).unwrap();
    let capacity = PAGE_SIZE as usize - DATA_HEADER_SIZE;

    provider.write_block("fits", &vec![1u8; capacity]).unwrap();
    assert_eq!(provider.read_block("fits").unwrap().unwrap().len(), capacity);

    let free_before = provider.stats().unwrap().free_pages;
    let result = provider.write_block("too-big", &vec![1u8; capacity + 1]);

    assert!(matches!(
        result,
        Err(VaultError::RecordTooLargeForPage { size, max }) if size == capacity + 1 && max == capacity
    ));
    assert!(!provider.contains_block("too-big"));
    assert_eq!(provider.stats().unwrap().free_pages, free_before);
}

#[test]
fn test_update_replaces_and_releases_old_pages() {
    let (_temp, provider) = setup();
    let first = provider.write_block("doc", &noise(20_000)).unwrap();
    let old_page = first.offset - DATA_HEADER_SIZE as u64;

    let second = provider.write_block("doc", b"short").unwrap();

    assert_ne!(second.offset, first.offset);
    assert_eq!(second.created_at, first.created_at);
    assert!(!provider.is_page_allocated(old_page).unwrap());
    assert_eq!(provider.read_block("doc").unwrap(), Some(b"short".to_vec()));
    assert!(provider.verify().unwrap().is_clean());
}

#[test]
fn test_free_block() {
    let (_temp, provider) = setup();
    let entry = provider.write_block("gone", &noise(10_000)).unwrap();
    let free_with_block = provider.stats().unwrap().free_pages;

    assert!(provider.free_block("gone").unwrap());
    assert!(!provider.free_block("gone").unwrap());

    assert_eq!(provider.read_block("gone").unwrap(), None);
    assert!(!provider.is_page_allocated(entry.offset - DATA_HEADER_SIZE as u64).unwrap());
    // data page plus a two-page chain
    assert_eq!(provider.stats().unwrap().free_pages, free_with_block + 3);
}

#[test]
fn test_freed_pages_are_reused() {
    let (_temp, provider) = setup();
    let a = provider.write_block("a", b"first").unwrap();
    provider.free_block("a").unwrap();
    let pages_before = provider.stats().unwrap().total_pages;

    let b = provider.write_block("b", b"second").unwrap();

    assert_eq!(b.offset, a.offset);
    assert_eq!(provider.stats().unwrap().total_pages, pages_before);
}

#[test]
fn test_block_names_sorted_without_directory() {
    let (_temp, provider) = setup();
    for name in ["zeta", "alpha", "mid"] {
        provider.write_block(name, name.as_bytes()).unwrap();
    }
    provider.set_table_directory(b"tables").unwrap();

    assert_eq!(provider.block_names(), vec!["alpha", "mid", "zeta"]);
    assert!(provider.contains_block(TABLE_DIRECTORY_BLOCK));
}

// =============================================================================
// Table Directory Tests
// =============================================================================

#[test]
fn test_table_directory_recorded_in_header() {
    let (_temp, provider) = setup();
    assert_eq!(provider.table_directory().unwrap(), None);

    let entry = provider.set_table_directory(b"{\"users\": 1}").unwrap();
    provider.checkpoint().unwrap();

    let header = provider.header();
    assert_eq!(header.table_directory_offset, entry.offset);
    assert_eq!(header.table_directory_length, 12);
    assert_eq!(provider.table_directory().unwrap(), Some(b"{\"users\": 1}".to_vec()));
}

// =============================================================================
// Cancellation Tests
// =============================================================================

#[test]
fn test_cancelled_write_changes_nothing() {
    let (_temp, provider) = setup();
    let before = provider.stats().unwrap();
    let token = CancelToken::new();
    token.cancel();
    let options = WriteOptions::default().with_cancel(token);

    let result = provider.write_block_with("never", &noise(50_000), &options);

    assert!(matches!(result, Err(VaultError::Cancelled)));
    assert!(!provider.contains_block("never"));
    let after = provider.stats().unwrap();
    assert_eq!(after.free_pages, before.free_pages);
    assert_eq!(after.total_pages, before.total_pages);
}

#[test]
fn test_cancelled_free_keeps_block() {
    let (_temp, provider) = setup();
    provider.write_block("kept", b"data").unwrap();
    let token = CancelToken::new();
    token.cancel();

    let result = provider.free_block_with("kept", &WriteOptions::default().with_cancel(token));

    assert!(matches!(result, Err(VaultError::Cancelled)));
    assert_eq!(provider.read_block("kept").unwrap(), Some(b"data".to_vec()));
}

// =============================================================================
// Integrity Tests
// =============================================================================

#[test]
fn test_corrupt_payload_detected() {
    let (temp_dir, provider) = setup();
    let entry = provider.write_block("victim", b"precious bytes").unwrap();
    provider.write_block("bystander", b"fine").unwrap();

    let raw = PagedFile::open(&temp_dir.path().join("vault.db"), PAGE_SIZE).unwrap();
    raw.write_all_at(b"X", entry.offset + 3).unwrap();

    let result = provider.read_block("victim");
    assert!(matches!(result, Err(VaultError::CorruptBlock { .. })));

    let report = provider.verify().unwrap();
    assert_eq!(report.blocks_checked, 2);
    assert_eq!(report.corrupt_blocks.len(), 1);
    assert_eq!(report.corrupt_blocks[0].0, "victim");
    assert!(!report.is_clean());
}

#[test]
fn test_injected_checksum_is_stamped_and_enforced() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path());

    let provider = StorageProvider::open_with_checksum(config.clone(), Arc::new(Adler)).unwrap();
    let entry = provider.write_block("a", b"abc").unwrap();
    assert_eq!(entry.checksum, Adler.compute(b"abc"));
    assert_eq!(provider.header().checksum_algorithm, 9);
    provider.close().unwrap();

    let reopened = StorageProvider::open(config.clone());
    assert!(matches!(reopened, Err(VaultError::UnsupportedFeature(_))));

    let provider = StorageProvider::open_with_checksum(config, Arc::new(Adler)).unwrap();
    assert_eq!(provider.read_block("a").unwrap(), Some(b"abc".to_vec()));
}

#[test]
fn test_reclaim_on_clean_file_frees_nothing() {
    let (_temp, provider) = setup();
    provider.write_block("a", &noise(9000)).unwrap();
    provider.write_row("b", &cafe_row()).unwrap();
    provider.checkpoint().unwrap();

    let report = provider.reclaim_orphans().unwrap();

    assert_eq!(report.freed_pages, 0);
    assert_eq!(report.restored_pages, 0);
    assert_eq!(report.unreadable_blocks, 0);
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_reopen_keeps_blocks() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path());

    let provider = StorageProvider::open(config.clone()).unwrap();
    for i in 0..20 {
        provider.write_block(&format!("block-{:02}", i), &noise(i * 700 + 1)).unwrap();
    }
    provider.write_row("row", &cafe_row()).unwrap();
    provider.close().unwrap();

    let provider = StorageProvider::open(config).unwrap();
    assert_eq!(provider.stats().unwrap().block_count, 21);
    for i in 0..20 {
        let data = provider.read_block(&format!("block-{:02}", i)).unwrap();
        assert_eq!(data, Some(noise(i * 700 + 1)));
    }
    assert_eq!(provider.read_row("row").unwrap(), Some(cafe_row()));
    assert!(provider.verify().unwrap().is_clean());
}

#[test]
fn test_file_format_settings_come_from_header() {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    StorageProvider::open(config.clone()).unwrap().close().unwrap();

    let different = Config {
        page_size: 8192,
        overflow_threshold_percent: 60,
        ..config
    };
    let provider = StorageProvider::open(different).unwrap();

    assert_eq!(provider.page_size(), PAGE_SIZE);
    assert_eq!(provider.config().page_size, PAGE_SIZE);
    assert_eq!(provider.header().overflow_threshold_bytes, 3072);
}

#[test]
fn test_missing_file_without_create_fails() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        create_if_missing: false,
        ..test_config(temp_dir.path())
    };

    assert!(matches!(StorageProvider::open(config), Err(VaultError::Io(_))));
}

#[test]
fn test_invalid_config_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        page_size: 5000,
        ..test_config(temp_dir.path())
    };

    assert!(matches!(StorageProvider::open(config), Err(VaultError::Config(_))));
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_writers_and_readers() {
    let (_temp, provider) = setup();

    std::thread::scope(|s| {
        for t in 0..8 {
            let provider = &provider;
            s.spawn(move || {
                for i in 0..25 {
                    let name = format!("t{}-{}", t, i);
                    let data = noise(200 + (t * 25 + i) * 97);
                    provider.write_block(&name, &data).unwrap();
                    assert_eq!(provider.read_block(&name).unwrap(), Some(data));
                    if i % 5 == 0 {
                        provider.free_block(&name).unwrap();
                    }
                }
            });
        }
    });

    let stats = provider.stats().unwrap();
    assert_eq!(stats.block_count, 8 * 20);
    assert!(provider.fsm_invariant_holds().unwrap());
    assert!(provider.verify().unwrap().is_clean());
}

#[test]
fn test_stats_track_writes() {
    let (_temp, provider) = setup();
    let before = provider.stats().unwrap();

    provider.write_block("one", b"1").unwrap();

    let after = provider.stats().unwrap();
    assert_eq!(after.page_size, PAGE_SIZE);
    assert_eq!(after.block_count, 1);
    assert!(after.last_lsn > before.last_lsn);
    assert!(after.wal_used_bytes > 0);
    assert_eq!(after.registry_dirty, 1);
}

#[test]
fn test_wal_checkpoints_automatically_when_filling() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        wal_checkpoint_percent: 10,
        ..test_config(temp_dir.path())
    };
    let provider = StorageProvider::open(config).unwrap();

    // Each write logs roughly one page image; 30 of them would fill half the WAL
    for i in 0..30u8 {
        provider.write_block(&format!("page-{}", i), &vec![i; 4000]).unwrap();
    }

    let stats = provider.stats().unwrap();
    assert!(stats.wal_used_bytes < 40_000, "WAL holds {} bytes", stats.wal_used_bytes);
    for i in 0..30u8 {
        assert_eq!(provider.read_block(&format!("page-{}", i)).unwrap(), Some(vec![i; 4000]));
    }
}

// =============================================================================
// WAL Capacity Tests
// =============================================================================

/// A log of 15 pages of frames with the highest allowed checkpoint trigger
fn small_wal_config(dir: &Path) -> Config {
    Config {
        wal_region_pages: 16,
        wal_checkpoint_percent: 80,
        ..test_config(dir)
    }
}

#[test]
fn test_large_write_near_checkpoint_trigger_succeeds() {
    let temp_dir = TempDir::new().unwrap();
    let provider = StorageProvider::open(small_wal_config(temp_dir.path())).unwrap();
    let capacity = provider.stats().unwrap().wal_capacity_bytes;

    // Small writes bring the log just under the trigger without firing it
    let mut i = 0;
    while provider.stats().unwrap().wal_used_bytes < capacity * 75 / 100 {
        provider.write_block(&format!("small-{}", i), b"tiny").unwrap();
        i += 1;
    }
    let checkpoints = provider.stats().unwrap().checkpoint_count;

    let big = noise(400_000);
    provider.write_block("big", &big).unwrap();

    assert!(provider.stats().unwrap().checkpoint_count > checkpoints);
    assert_eq!(provider.read_block("big").unwrap(), Some(big));
    assert_eq!(provider.read_block("small-0").unwrap(), Some(b"tiny".to_vec()));
    assert!(provider.verify().unwrap().is_clean());
}

#[test]
fn test_block_larger_than_wal_fails_before_allocating() {
    let temp_dir = TempDir::new().unwrap();
    let provider = StorageProvider::open(small_wal_config(temp_dir.path())).unwrap();
    let before = provider.stats().unwrap();

    let result = provider.write_block("huge", &noise(5_000_000));

    assert!(matches!(result, Err(VaultError::WalFull { .. })));
    let after = provider.stats().unwrap();
    assert_eq!(after.free_pages, before.free_pages);
    assert_eq!(after.total_pages, before.total_pages);
    assert!(!provider.contains_block("huge"));

    // The provider keeps working
    provider.write_block("after", &noise(20_000)).unwrap();
    assert!(provider.verify().unwrap().is_clean());
}

#[test]
fn test_concurrent_multi_page_writers_share_small_wal() {
    let temp_dir = TempDir::new().unwrap();
    let provider = StorageProvider::open(small_wal_config(temp_dir.path())).unwrap();
    let data = noise(40_000);

    std::thread::scope(|scope| {
        for t in 0..4 {
            let provider = &provider;
            let data = &data;
            scope.spawn(move || {
                for i in 0..6 {
                    provider.write_block(&format!("t{}-{}", t, i), data).unwrap();
                }
            });
        }
    });

    assert_eq!(provider.stats().unwrap().block_count, 24);
    for t in 0..4 {
        for i in 0..6 {
            assert_eq!(provider.read_block(&format!("t{}-{}", t, i)).unwrap().as_ref(), Some(&data));
        }
    }
    assert!(provider.fsm_invariant_holds().unwrap());
    assert!(provider.verify().unwrap().is_clean());
}

#[test]
fn test_checkpoint_trigger_above_limit_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        wal_checkpoint_percent: 90,
        ..test_config(temp_dir.path())
    };

    let result = StorageProvider::open(config);
    assert!(matches!(result, Err(VaultError::Config(_))));
}

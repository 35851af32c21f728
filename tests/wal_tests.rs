//! Tests for the write-ahead log
//!
//! These tests verify:
//! - LSN sequencing and the per-transaction state machine
//! - Reader end-of-log rules (torn tail vs corruption inside the log)
//! - Space accounting and truncation
//! - Replay of committed, rolled-back and unfinished transactions

use std::time::Duration;

use pagevault::config::{AllocationStrategy, WalSyncStrategy};
use pagevault::fsm::{FreeSpaceManager, FsmOptions};
use pagevault::io::{PagedFile, Region};
use pagevault::registry::{BlockEntry, BlockRegistry, RegistryOptions};
use pagevault::wal::{
    EntryType, Operation, TxnState, WalReader, WalRecovery, WalRegion, WalWriter, HEADER_SIZE,
};
use pagevault::VaultError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const PAGE_SIZE: u32 = 4096;
const PS: u64 = PAGE_SIZE as u64;
const WAL_PAGES: u64 = 16;
const DATA_PAGES: u64 = 16;
/// First page after the reserved prefix and the log
const DATA: u64 = (1 + WAL_PAGES) * PS;

fn setup_wal(wal_pages: u64) -> (TempDir, PagedFile, WalRegion, WalWriter) {
    let temp_dir = TempDir::new().unwrap();
    let file = PagedFile::create(&temp_dir.path().join("wal.db"), PAGE_SIZE).unwrap();
    file.set_len((1 + wal_pages + DATA_PAGES) * PS).unwrap();
    let wal = WalRegion::new(Region::new(PS, wal_pages), PAGE_SIZE);
    let writer = WalWriter::create(&file, wal, WalSyncStrategy::OnCommit).unwrap();
    (temp_dir, file, wal, writer)
}

/// A freshly started allocator, as after a restart
fn fresh_fsm() -> FreeSpaceManager {
    FreeSpaceManager::new(
        1 + WAL_PAGES + DATA_PAGES,
        1 + WAL_PAGES,
        FsmOptions {
            page_size: PAGE_SIZE,
            min_extension_pages: 16,
            growth_percent: 100,
            max_pages: None,
            strategy: AllocationStrategy::FirstFit,
            lock_timeout: Duration::from_secs(5),
        },
    )
}

fn fresh_registry() -> BlockRegistry {
    BlockRegistry::new(RegistryOptions {
        page_size: PAGE_SIZE,
        flush_threshold: 200,
        flush_interval: Duration::from_secs(60),
    })
}

fn page_write(offset: u64, fill: u8) -> Operation {
    Operation::PageWrite {
        offset,
        page_count: 1,
        image: Some(vec![fill; PAGE_SIZE as usize]),
    }
}

fn read_page(file: &PagedFile, offset: u64) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE as usize];
    file.read_exact_at(&mut page, offset).unwrap();
    page
}

/// Position of the `n`th frame (0-based) in the log
fn frame_position(file: &PagedFile, wal: WalRegion, n: usize) -> u64 {
    let mut reader = WalReader::new(file, wal, 1);
    for _ in 0..n {
        reader.next_entry().unwrap().unwrap();
    }
    reader.position()
}

fn flip_body_byte(file: &PagedFile, wal: WalRegion, frame: usize) {
    let at = wal.entries_offset() + frame_position(file, wal, frame) + HEADER_SIZE as u64;
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, at).unwrap();
    file.write_all_at(&[byte[0] ^ 0xFF], at).unwrap();
}

// =============================================================================
// Writer Tests
// =============================================================================

#[test]
fn test_lsns_are_sequential() {
    let (_temp, file, _wal, mut writer) = setup_wal(WAL_PAGES);

    let txn = writer.begin();
    let lsns: Vec<u64> = (0..3)
        .map(|i| {
            writer
                .append(&file, txn, Operation::PageFree { offset: DATA + i * PS, page_count: 1 })
                .unwrap()
        })
        .collect();
    let commit = writer.commit(&file, txn).unwrap();

    assert_eq!(lsns, vec![1, 2, 3]);
    assert_eq!(commit, 4);
    assert_eq!(writer.current_lsn(), 4);
}

#[test]
fn test_transaction_ids_increase() {
    let (_temp, _file, _wal, mut writer) = setup_wal(WAL_PAGES);

    let a = writer.begin();
    let b = writer.begin();

    assert!(b > a);
    assert_eq!(writer.last_txn_id(), b);
    assert_eq!(writer.open_transactions(), 2);
    assert_eq!(writer.state(a), Some(TxnState::Open));
}

#[test]
fn test_finished_transaction_rejects_entries() {
    let (_temp, file, _wal, mut writer) = setup_wal(WAL_PAGES);

    let txn = writer.begin();
    writer.commit(&file, txn).unwrap();

    let append = writer.append(&file, txn, Operation::RegistryRemove { name: "a".to_string() });
    assert!(matches!(append, Err(VaultError::TransactionClosed(id)) if id == txn));
    assert!(matches!(writer.commit(&file, txn), Err(VaultError::TransactionClosed(_))));
    assert!(matches!(writer.rollback(&file, txn), Err(VaultError::TransactionClosed(_))));
}

#[test]
fn test_outcome_entries_go_through_commit_and_rollback() {
    let (_temp, file, _wal, mut writer) = setup_wal(WAL_PAGES);
    let txn = writer.begin();

    let result = writer.append(&file, txn, Operation::Commit);

    assert!(matches!(result, Err(VaultError::InvalidRange(_))));
    assert_eq!(writer.state(txn), Some(TxnState::Open));
}

#[test]
fn test_rollback_closes_transaction() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);

    let txn = writer.begin();
    writer.append(&file, txn, page_write(DATA, 1)).unwrap();
    writer.rollback(&file, txn).unwrap();

    assert_eq!(writer.state(txn), None);
    assert_eq!(writer.open_transactions(), 0);

    let entries = WalReader::new(&file, wal, 1).read_all().unwrap();
    let types: Vec<EntryType> = entries.iter().map(|e| e.entry_type()).collect();
    assert_eq!(types, vec![EntryType::PageWrite, EntryType::Rollback]);
}

#[test]
fn test_wal_full_keeps_room_for_outcome() {
    // Two pages: header plus one page of frames
    let (_temp, file, _wal, mut writer) = setup_wal(2);
    let txn = writer.begin();

    let result = writer.append(&file, txn, page_write(DATA, 9));
    assert!(matches!(result, Err(VaultError::WalFull { .. })));

    // Small entries fill up to the reserve, never into it
    loop {
        let op = Operation::RegistryRemove { name: "x".repeat(64) };
        if writer.append(&file, txn, op).is_err() {
            break;
        }
    }
    assert!(writer.used_bytes() <= writer.capacity() - 1024);
    writer.commit(&file, txn).unwrap();
}

#[test]
fn test_reservation_is_withheld_from_other_transactions() {
    // Three pages of frames: 12288 bytes, 1024 of them kept for outcomes
    let (_temp, file, _wal, mut writer) = setup_wal(4);
    assert_eq!(writer.unreserved_bytes(), 12288 - 1024);

    let big = writer.begin_reserved(9000).unwrap();
    assert_eq!(writer.reserved_bytes(), 9000);

    let result = writer.begin_reserved(4096);
    assert!(matches!(
        result,
        Err(VaultError::WalFull { needed: 4096, available: 2264 })
    ));

    // An unreserved transaction cannot eat into the reservation either
    let small = writer.begin();
    let result = writer.append(&file, small, page_write(DATA, 1));
    assert!(matches!(result, Err(VaultError::WalFull { .. })));

    writer.append(&file, big, page_write(DATA, 2)).unwrap();
    writer.append(&file, big, page_write(DATA + PS, 3)).unwrap();
    assert!(writer.reserved_bytes() < 9000 - 2 * PS);

    writer.commit(&file, big).unwrap();
    assert_eq!(writer.reserved_bytes(), 0);
    writer.commit(&file, small).unwrap();
}

#[test]
fn test_rollback_releases_reservation() {
    let (_temp, file, _wal, mut writer) = setup_wal(WAL_PAGES);
    let free = writer.unreserved_bytes();

    let txn = writer.begin_reserved(free).unwrap();
    assert_eq!(writer.unreserved_bytes(), 0);
    assert!(matches!(writer.begin_reserved(1), Err(VaultError::WalFull { .. })));

    writer.rollback(&file, txn).unwrap();
    assert_eq!(writer.reserved_bytes(), 0);
    assert!(writer.begin_reserved(writer.unreserved_bytes()).is_ok());
}

#[test]
fn test_truncate_requires_no_open_transactions() {
    let (_temp, file, _wal, mut writer) = setup_wal(WAL_PAGES);
    let txn = writer.begin();

    assert!(matches!(writer.truncate(&file), Err(VaultError::InvalidRange(_))));

    writer.commit(&file, txn).unwrap();
    writer.truncate(&file).unwrap();
    assert_eq!(writer.used_bytes(), 0);
    assert_eq!(writer.checkpoint_lsn(), writer.current_lsn());
}

#[test]
fn test_truncated_frames_are_never_read_again() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);

    for fill in 0..3u8 {
        let txn = writer.begin();
        writer.append(&file, txn, page_write(DATA, fill)).unwrap();
        writer.commit(&file, txn).unwrap();
    }
    writer.truncate(&file).unwrap();

    let txn = writer.begin();
    writer
        .append(&file, txn, Operation::PageFree { offset: DATA, page_count: 1 })
        .unwrap();
    writer.commit(&file, txn).unwrap();

    let scan = WalRecovery::scan(&file, wal).unwrap();
    assert_eq!(scan.header.checkpoint_lsn, 6);
    assert_eq!(scan.header.truncations, 1);
    assert_eq!(scan.entries.len(), 2);
    assert_eq!(scan.entries[0].lsn, 7);
    assert!(!scan.torn_tail);
}

// =============================================================================
// Reader Tests
// =============================================================================

#[test]
fn test_reader_returns_entries_in_order() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);

    let txn = writer.begin();
    writer.append(&file, txn, page_write(DATA, 1)).unwrap();
    let entry = BlockEntry::new(DATA + 16, 10, 0, 1);
    writer
        .append(&file, txn, Operation::RegistryUpsert { name: "a".to_string(), entry })
        .unwrap();
    writer.commit(&file, txn).unwrap();

    let entries = WalReader::new(&file, wal, 1).read_all().unwrap();

    assert_eq!(entries.len(), 3);
    assert!(entries.iter().all(|e| e.txn_id == txn));
    assert_eq!(entries[1].affected_offset(), Some(DATA + 16));
    assert_eq!(entries[2].operation, Operation::Commit);
}

#[test]
fn test_empty_log_reads_nothing() {
    let (_temp, file, wal, _writer) = setup_wal(WAL_PAGES);
    let mut reader = WalReader::new(&file, wal, 1);

    assert!(reader.next_entry().unwrap().is_none());
    assert!(!reader.torn_tail());
}

#[test]
fn test_torn_tail_is_discarded() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);
    let txn = writer.begin();
    for i in 0..3 {
        writer
            .append(&file, txn, Operation::PageFree { offset: DATA + i * PS, page_count: 1 })
            .unwrap();
    }

    flip_body_byte(&file, wal, 2);

    let mut reader = WalReader::new(&file, wal, 1);
    let entries = reader.read_all().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(reader.torn_tail());
    assert_eq!(reader.expected_lsn(), 3);
}

#[test]
fn test_corruption_inside_log_fails_replay() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);
    let txn = writer.begin();
    for i in 0..4 {
        writer
            .append(&file, txn, Operation::PageFree { offset: DATA + i * PS, page_count: 1 })
            .unwrap();
    }

    flip_body_byte(&file, wal, 1);

    let result = WalReader::new(&file, wal, 1).read_all();
    assert!(matches!(result, Err(VaultError::ReplayFailure(_))));

    let replay = WalRecovery::replay(&file, wal, 0, &[], &fresh_fsm(), &fresh_registry());
    assert!(matches!(replay, Err(VaultError::ReplayFailure(_))));
}

// =============================================================================
// Replay Tests
// =============================================================================

#[test]
fn test_replay_applies_committed_and_discards_unfinished() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);

    let committed = writer.begin();
    writer.append(&file, committed, page_write(DATA, 7)).unwrap();
    let entry = BlockEntry::new(DATA + 16, 100, 42, 1);
    writer
        .append(&file, committed, Operation::RegistryUpsert { name: "a".to_string(), entry })
        .unwrap();
    writer.commit(&file, committed).unwrap();

    let unfinished = writer.begin();
    writer.append(&file, unfinished, page_write(DATA + PS, 8)).unwrap();

    let fsm = fresh_fsm();
    fsm.mark_allocated(DATA + PS, 1).unwrap();
    let registry = fresh_registry();
    let result = WalRecovery::replay(&file, wal, 0, &[], &fsm, &registry).unwrap();

    assert_eq!(result.transactions_committed, 1);
    assert_eq!(result.transactions_incomplete, 1);
    assert_eq!(result.pages_rewritten, 1);
    assert_eq!(result.last_txn_id, unfinished);
    assert_eq!(read_page(&file, DATA), vec![7u8; PAGE_SIZE as usize]);
    assert_eq!(registry.try_get("a"), Some(entry));
    assert!(fsm.is_allocated(DATA).unwrap());
    assert!(!fsm.is_allocated(DATA + PS).unwrap());
}

#[test]
fn test_replay_releases_rolled_back_pages() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);
    let txn = writer.begin();
    writer.append(&file, txn, page_write(DATA, 3)).unwrap();
    writer.rollback(&file, txn).unwrap();

    let fsm = fresh_fsm();
    fsm.mark_allocated(DATA, 1).unwrap();
    let result = WalRecovery::replay(&file, wal, 0, &[], &fsm, &fresh_registry()).unwrap();

    assert_eq!(result.transactions_rolled_back, 1);
    assert_eq!(result.pages_freed, 1);
    assert!(!fsm.is_allocated(DATA).unwrap());
    assert_eq!(read_page(&file, DATA), vec![0u8; PAGE_SIZE as usize]);
}

#[test]
fn test_replay_skips_checkpointed_transactions() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);
    let txn = writer.begin();
    writer.append(&file, txn, page_write(DATA, 5)).unwrap();
    let commit_lsn = writer.commit(&file, txn).unwrap();

    let registry = fresh_registry();
    let result = WalRecovery::replay(&file, wal, commit_lsn, &[], &fresh_fsm(), &registry).unwrap();

    assert_eq!(result.transactions_skipped, 1);
    assert_eq!(result.transactions_committed, 0);
    assert_eq!(result.pages_rewritten, 0);
    assert_eq!(read_page(&file, DATA), vec![0u8; PAGE_SIZE as usize]);
}

#[test]
fn test_replay_writes_only_newest_image() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);
    for fill in [1u8, 2] {
        let txn = writer.begin();
        writer.append(&file, txn, page_write(DATA, fill)).unwrap();
        writer.commit(&file, txn).unwrap();
    }

    let result = WalRecovery::replay(&file, wal, 0, &[], &fresh_fsm(), &fresh_registry()).unwrap();

    assert_eq!(result.transactions_committed, 2);
    assert_eq!(result.pages_rewritten, 1);
    assert_eq!(read_page(&file, DATA), vec![2u8; PAGE_SIZE as usize]);
}

#[test]
fn test_replay_never_overwrites_protected_regions() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);
    let txn = writer.begin();
    writer.append(&file, txn, page_write(DATA, 4)).unwrap();
    writer.commit(&file, txn).unwrap();
    file.write_all_at(&[0xEE; 16], DATA).unwrap();

    let protected = [Region::new(DATA, 1)];
    let result = WalRecovery::replay(&file, wal, 0, &protected, &fresh_fsm(), &fresh_registry()).unwrap();

    assert_eq!(result.pages_rewritten, 0);
    assert_eq!(&read_page(&file, DATA)[..16], &[0xEE; 16]);
}

#[test]
fn test_replay_is_idempotent() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);
    let txn = writer.begin();
    writer.append(&file, txn, page_write(DATA, 6)).unwrap();
    writer
        .append(&file, txn, Operation::PageFree { offset: DATA + 2 * PS, page_count: 1 })
        .unwrap();
    writer.commit(&file, txn).unwrap();

    let fsm = fresh_fsm();
    let registry = fresh_registry();
    let first = WalRecovery::replay(&file, wal, 0, &[], &fsm, &registry).unwrap();
    let stats = fsm.stats().unwrap();
    let second = WalRecovery::replay(&file, wal, 0, &[], &fsm, &registry).unwrap();

    assert_eq!(first.pages_allocated, 1);
    assert_eq!(second.pages_allocated, 0);
    assert_eq!(fsm.stats().unwrap(), stats);
    assert_eq!(read_page(&file, DATA), vec![6u8; PAGE_SIZE as usize]);
}

#[test]
fn test_verify_reports_without_changing_state() {
    let (_temp, file, wal, mut writer) = setup_wal(WAL_PAGES);
    let txn = writer.begin();
    writer.append(&file, txn, page_write(DATA, 1)).unwrap();
    writer.commit(&file, txn).unwrap();
    let open = writer.begin();
    writer.append(&file, open, page_write(DATA + PS, 1)).unwrap();

    let result = WalRecovery::verify(&file, wal, 0).unwrap();

    assert_eq!(result.entries_scanned, 3);
    assert_eq!(result.transactions_committed, 1);
    assert_eq!(result.transactions_incomplete, 1);
    assert_eq!(result.pages_rewritten, 0);
    // Only the log was written; the data page is untouched
    assert_eq!(read_page(&file, DATA), vec![0u8; PAGE_SIZE as usize]);
}

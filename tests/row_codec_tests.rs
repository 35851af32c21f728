//! Tests for the Binary Row Codec
//!
//! These tests verify:
//! - Round trips across every value kind, including Unicode names and text
//! - The exact wire layout
//! - Strict rejection of malformed input
//! - The inline/overflow split and page-fit boundary

use std::cell::RefCell;
use std::collections::HashMap;

use pagevault::overflow::{ChainHead, ChainInfo, ChainReader, ChainWriter};
use pagevault::row::{
    self, InlineLimits, OverflowMetadata, Row, StoredRecord, Value, OVERFLOW_MAGIC,
};
use pagevault::{Result, VaultError};
use proptest::prelude::*;

// =============================================================================
// Helper Functions
// =============================================================================

/// In-memory chain store keyed by a fake first offset
#[derive(Default)]
struct MemoryChains {
    chains: RefCell<HashMap<u64, Vec<u8>>>,
    next: RefCell<u64>,
}

impl ChainWriter for MemoryChains {
    fn write_chain(&mut self, data: &[u8], _compress: bool) -> Result<ChainInfo> {
        let mut next = self.next.borrow_mut();
        *next += 4096;
        self.chains.borrow_mut().insert(*next, data.to_vec());
        Ok(ChainInfo {
            first_offset: *next,
            last_offset: *next,
            page_count: 1,
            stored_len: data.len() as u64,
            compressed: false,
        })
    }
}

impl ChainReader for MemoryChains {
    fn read_chain(&self, head: &ChainHead) -> Result<Vec<u8>> {
        self.chains
            .borrow()
            .get(&head.first_offset)
            .cloned()
            .ok_or(VaultError::CorruptChain {
                offset: head.first_offset,
                reason: "unknown chain".to_string(),
            })
    }
}

fn limits(threshold: usize) -> InlineLimits {
    InlineLimits {
        threshold,
        page_capacity: 4080,
        overflow_enabled: true,
    }
}

fn every_kind() -> Row {
    Row::new()
        .with("null", Value::Null)
        .with("i32", i32::MIN)
        .with("i64", i64::MAX)
        .with("f64", -1234.5678f64)
        .with("bool", true)
        .with("ts", Value::Timestamp(1_700_000_000_123_456))
        .with("text", "hello")
        .with("blob", vec![0u8, 255, 7, 42])
        .with("price", Value::Decimal { mantissa: -123_456_789_012_345_678_901, scale: 4 })
}

// =============================================================================
// Round-Trip Tests
// =============================================================================

#[test]
fn test_roundtrip_every_value_kind() {
    let row = every_kind();
    let bytes = row::serialize(&row);
    let decoded = row::deserialize(&bytes).unwrap();

    assert_eq!(decoded, row);
    assert_eq!(bytes.len(), row::serialized_size(&row));
}

#[test]
fn test_roundtrip_unicode() {
    let row = Row::new()
        .with("名前", "Café ☕ naïve façade")
        .with("emoji", "🦀🚀👩‍💻")
        .with("ключ", "значение")
        .with("", "empty column name");

    let decoded = row::deserialize(&row::serialize(&row)).unwrap();

    assert_eq!(decoded, row);
    assert_eq!(decoded.get("emoji"), Some(&Value::String("🦀🚀👩‍💻".to_string())));
}

#[test]
fn test_roundtrip_preserves_column_order() {
    let row: Row = vec![("z", 1i32), ("a", 2), ("m", 3)].into_iter().collect();
    let decoded = row::deserialize(&row::serialize(&row)).unwrap();

    let names: Vec<&str> = decoded.iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["z", "a", "m"]);
}

#[test]
fn test_roundtrip_extreme_floats() {
    for v in [f64::MIN, f64::MAX, f64::EPSILON, -0.0, f64::INFINITY] {
        let row = Row::new().with("v", v);
        assert_eq!(row::deserialize(&row::serialize(&row)).unwrap(), row);
    }
}

// =============================================================================
// Wire Layout Tests
// =============================================================================

#[test]
fn test_wire_layout_is_little_endian_and_unpadded() {
    let row = Row::new().with("id", 1i32).with("ok", false);
    let bytes = row::serialize(&row);

    let mut expected = Vec::new();
    expected.extend_from_slice(&2i32.to_le_bytes());
    expected.extend_from_slice(&2i32.to_le_bytes());
    expected.extend_from_slice(b"id");
    expected.push(1);
    expected.extend_from_slice(&1i32.to_le_bytes());
    expected.extend_from_slice(&2i32.to_le_bytes());
    expected.extend_from_slice(b"ok");
    expected.push(4);
    expected.push(0);
    assert_eq!(&bytes[..], &expected[..]);
}

#[test]
fn test_should_overflow_uses_serialized_size() {
    let row = Row::new().with("bio", "x".repeat(100));
    let size = row::serialized_size(&row);

    assert!(!row::should_overflow(&row, size));
    assert!(row::should_overflow(&row, size - 1));
}

// =============================================================================
// Malformed Input Tests
// =============================================================================

#[test]
fn test_truncated_input_rejected_at_every_cut() {
    let bytes = row::serialize(&every_kind());
    for cut in 0..bytes.len() {
        let result = row::deserialize(&bytes[..cut]);
        assert!(
            matches!(result, Err(VaultError::Serialization(_))),
            "cut at {} was accepted",
            cut
        );
    }
}

#[test]
fn test_unknown_type_tag_rejected() {
    let mut bytes = row::serialize(&Row::new().with("a", 1i32)).to_vec();
    // count (4) + name len (4) + "a" (1) → tag
    bytes[9] = 99;
    assert!(matches!(row::deserialize(&bytes), Err(VaultError::Serialization(_))));
}

#[test]
fn test_negative_length_rejected() {
    let mut bytes = row::serialize(&Row::new().with("s", "abc")).to_vec();
    // count (4) + name len (4) + "s" (1) + tag (1) → string length
    bytes[10..14].copy_from_slice(&(-1i32).to_le_bytes());
    assert!(matches!(row::deserialize(&bytes), Err(VaultError::Serialization(_))));
}

#[test]
fn test_invalid_utf8_rejected() {
    let mut bytes = row::serialize(&Row::new().with("s", "ab")).to_vec();
    let len = bytes.len();
    bytes[len - 1] = 0xFF;
    assert!(matches!(row::deserialize(&bytes), Err(VaultError::Serialization(_))));
}

#[test]
fn test_invalid_bool_rejected() {
    let mut bytes = row::serialize(&Row::new().with("b", true)).to_vec();
    let len = bytes.len();
    bytes[len - 1] = 2;
    assert!(matches!(row::deserialize(&bytes), Err(VaultError::Serialization(_))));
}

// =============================================================================
// Overflow Split Tests
// =============================================================================

#[test]
fn test_small_row_stays_inline() {
    let mut chains = MemoryChains::default();
    let row = Row::new().with("id", 1i32);

    let stored = row::serialize_with_overflow(&row, limits(3072), &mut chains, false).unwrap();

    assert!(!stored.is_overflow());
    assert_eq!(stored.payload(), &row::serialize(&row));
    assert_eq!(row::deserialize_with_overflow(stored.payload(), &chains).unwrap(), row);
}

#[test]
fn test_large_row_splits_at_threshold_minus_metadata() {
    let mut chains = MemoryChains::default();
    let row = Row::new()
        .with("id", 1i32)
        .with("name", "Café")
        .with("bio", "x".repeat(5000));
    let total = row::serialized_size(&row);

    let stored = row::serialize_with_overflow(&row, limits(3072), &mut chains, true).unwrap();

    let StoredRecord::Overflow { payload, metadata } = &stored else {
        panic!("expected an overflow record");
    };
    assert_eq!(&payload[..4], &OVERFLOW_MAGIC);
    assert_eq!(metadata.inline_size as usize, 3072 - OverflowMetadata::SIZE);
    assert_eq!(metadata.total_size as usize, total);
    assert_eq!(payload.len(), 3072);

    let decoded = row::deserialize_with_overflow(payload, &chains).unwrap();
    assert_eq!(decoded, row);
}

#[test]
fn test_overflow_metadata_parse_rejects_plain_rows() {
    let plain = row::serialize(&Row::new().with("a", "b"));
    assert!(OverflowMetadata::parse(&plain).is_none());
}

#[test]
fn test_page_fit_boundary_without_overflow() {
    let mut chains = MemoryChains::default();
    let no_overflow = InlineLimits {
        threshold: 4080,
        page_capacity: 4080,
        overflow_enabled: false,
    };

    let fits = bytes::Bytes::from(vec![7u8; 4080]);
    let stored = row::split_with_overflow(fits, no_overflow, &mut chains, false).unwrap();
    assert!(!stored.is_overflow());

    let too_big = bytes::Bytes::from(vec![7u8; 4081]);
    let result = row::split_with_overflow(too_big, no_overflow, &mut chains, false);
    assert!(matches!(
        result,
        Err(VaultError::RecordTooLargeForPage { size: 4081, max: 4080 })
    ));
}

#[test]
fn test_page_fit_boundary_at_threshold() {
    let mut chains = MemoryChains::default();
    let at_page = limits(4080);

    let exact = bytes::Bytes::from(vec![1u8; 4080]);
    assert!(!row::split_with_overflow(exact, at_page, &mut chains, false).unwrap().is_overflow());

    let over = bytes::Bytes::from(vec![1u8; 4081]);
    let stored = row::split_with_overflow(over, at_page, &mut chains, false).unwrap();
    assert!(stored.is_overflow());
    assert_eq!(stored.payload().len(), 4080);
}

#[test]
fn test_inline_portion_larger_than_page_rejected() {
    let mut chains = MemoryChains::default();
    let bad = InlineLimits {
        threshold: 5000,
        page_capacity: 4080,
        overflow_enabled: true,
    };

    let data = bytes::Bytes::from(vec![0u8; 6000]);
    let result = row::split_with_overflow(data, bad, &mut chains, false);
    assert!(matches!(result, Err(VaultError::RecordTooLargeForPage { .. })));
}

// =============================================================================
// Property Tests
// =============================================================================

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i32>().prop_map(Value::Int32),
        any::<i64>().prop_map(Value::Int64),
        prop::num::f64::NORMAL.prop_map(Value::Float64),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Timestamp),
        ".{0,40}".prop_map(Value::String),
        prop::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
        (any::<i128>(), any::<u8>()).prop_map(|(mantissa, scale)| Value::Decimal { mantissa, scale }),
    ]
}

fn row_strategy() -> impl Strategy<Value = Row> {
    prop::collection::vec(("[a-zA-Z_\\p{L}]{0,12}", value_strategy()), 0..16)
        .prop_map(|columns| columns.into_iter().collect())
}

proptest! {
    #[test]
    fn prop_row_roundtrip(row in row_strategy()) {
        let bytes = row::serialize(&row);
        prop_assert_eq!(bytes.len(), row::serialized_size(&row));
        prop_assert_eq!(row::deserialize(&bytes).unwrap(), row);
    }

    #[test]
    fn prop_overflow_roundtrip(row in row_strategy(), pad in 0usize..9000) {
        let row = row.with("pad", "p".repeat(pad));
        let mut chains = MemoryChains::default();
        let stored = row::serialize_with_overflow(&row, limits(3072), &mut chains, false).unwrap();
        prop_assert!(stored.payload().len() <= 4080);
        prop_assert_eq!(row::deserialize_with_overflow(stored.payload(), &chains).unwrap(), row);
    }
}

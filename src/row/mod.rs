//! Binary Row Codec Module
//!
//! Turns rows (ordered, named, typed values) into self-describing bytes and
//! back, and decides when a serialized row must spill into an overflow chain.
//!
//! ## Responsibilities
//! - Exact-size, length-prefixed little-endian encoding
//! - Strict decoding (truncation, bad tags, trailing bytes are errors)
//! - Inline vs. overflow split at the configured threshold

pub mod codec;
mod overflow;
mod value;

pub use codec::{deserialize, serialize, serialized_size, should_overflow};
pub use overflow::{
    assemble, assemble_with_overflow, deserialize_with_overflow, serialize_with_overflow,
    split_with_overflow, InlineLimits, OverflowMetadata, StoredRecord, OVERFLOW_MAGIC,
};
pub use value::{Row, TypeTag, Value};

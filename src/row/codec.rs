//! Binary row codec
//!
//! ## Wire Format (little-endian)
//! ```text
//! ┌──────────────────┬──────────────────────────────────────────────┐
//! │ ColumnCount (i32)│ Column 1 | Column 2 | ...                    │
//! └──────────────────┴──────────────────────────────────────────────┘
//!
//! Column:
//! ┌───────────────┬────────────┬─────────┬───────────────────────┐
//! │ NameLen (i32) │ Name utf-8 │ Tag (1) │ Value                 │
//! └───────────────┴────────────┴─────────┴───────────────────────┘
//!
//! Value by tag:
//!   Null      -
//!   Int32     i32
//!   Int64     i64
//!   Float64   f64 (IEEE-754 bits)
//!   Bool      u8 (0 / 1)
//!   Timestamp i64 micros
//!   String    len (i32) + utf-8
//!   Bytes     len (i32) + raw
//!   Decimal   mantissa (i128) + scale (u8)
//! ```
//!
//! No padding and no fixed column positions: the read cursor advances by
//! exactly what each field consumed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, VaultError};

use super::{Row, TypeTag, Value};

/// ColumnCount prefix
const COUNT_SIZE: usize = 4;

/// NameLen (4) + Tag (1)
const COLUMN_OVERHEAD: usize = 5;

/// Exact encoded size of `row`
pub fn serialized_size(row: &Row) -> usize {
    COUNT_SIZE
        + row
            .iter()
            .map(|(name, value)| COLUMN_OVERHEAD + name.len() + value.encoded_len())
            .sum::<usize>()
}

/// Whether `row` would exceed the inline threshold
///
/// Computed from lengths alone; nothing is encoded.
pub fn should_overflow(row: &Row, threshold_bytes: usize) -> bool {
    serialized_size(row) > threshold_bytes
}

/// Encode a row
pub fn serialize(row: &Row) -> Bytes {
    let mut buf = BytesMut::with_capacity(serialized_size(row));
    buf.put_i32_le(row.len() as i32);

    for (name, value) in row.iter() {
        buf.put_i32_le(name.len() as i32);
        buf.put_slice(name.as_bytes());
        buf.put_u8(value.tag() as u8);
        put_value(&mut buf, value);
    }

    debug_assert_eq!(buf.len(), serialized_size(row));
    buf.freeze()
}

/// Decode a row, rejecting truncated input and trailing bytes
pub fn deserialize(bytes: &[u8]) -> Result<Row> {
    let mut buf = bytes;
    let count = get_len(&mut buf, "column count")?;

    let mut row = Row::new();
    for index in 0..count {
        let name_len = get_len(&mut buf, "column name length")?;
        let name = get_utf8(&mut buf, name_len, "column name")?;
        ensure(&buf, 1, "type tag")?;
        let tag = TypeTag::try_from(buf.get_u8())?;
        let value = get_value(&mut buf, tag)?;

        if row.get(&name).is_some() {
            return Err(VaultError::Serialization(format!(
                "duplicate column '{}' at index {}",
                name, index
            )));
        }
        row.push_unchecked(name, value);
    }

    if buf.has_remaining() {
        return Err(VaultError::Serialization(format!(
            "{} trailing bytes after row",
            buf.remaining()
        )));
    }
    Ok(row)
}

// =============================================================================
// Private Helpers
// =============================================================================

fn put_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => {}
        Value::Int32(v) => buf.put_i32_le(*v),
        Value::Int64(v) | Value::Timestamp(v) => buf.put_i64_le(*v),
        Value::Float64(v) => buf.put_f64_le(*v),
        Value::Bool(v) => buf.put_u8(u8::from(*v)),
        Value::String(s) => {
            buf.put_i32_le(s.len() as i32);
            buf.put_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_i32_le(b.len() as i32);
            buf.put_slice(b);
        }
        Value::Decimal { mantissa, scale } => {
            buf.put_i128_le(*mantissa);
            buf.put_u8(*scale);
        }
    }
}

fn get_value(buf: &mut &[u8], tag: TypeTag) -> Result<Value> {
    Ok(match tag {
        TypeTag::Null => Value::Null,
        TypeTag::Int32 => {
            ensure(buf, 4, "int32")?;
            Value::Int32(buf.get_i32_le())
        }
        TypeTag::Int64 => {
            ensure(buf, 8, "int64")?;
            Value::Int64(buf.get_i64_le())
        }
        TypeTag::Float64 => {
            ensure(buf, 8, "float64")?;
            Value::Float64(buf.get_f64_le())
        }
        TypeTag::Bool => {
            ensure(buf, 1, "bool")?;
            match buf.get_u8() {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => {
                    return Err(VaultError::Serialization(format!(
                        "invalid bool byte {}",
                        other
                    )))
                }
            }
        }
        TypeTag::Timestamp => {
            ensure(buf, 8, "timestamp")?;
            Value::Timestamp(buf.get_i64_le())
        }
        TypeTag::String => {
            let len = get_len(buf, "string length")?;
            Value::String(get_utf8(buf, len, "string")?)
        }
        TypeTag::Bytes => {
            let len = get_len(buf, "bytes length")?;
            ensure(buf, len, "bytes")?;
            let out = buf[..len].to_vec();
            buf.advance(len);
            Value::Bytes(out)
        }
        TypeTag::Decimal => {
            ensure(buf, 17, "decimal")?;
            let mantissa = buf.get_i128_le();
            let scale = buf.get_u8();
            Value::Decimal { mantissa, scale }
        }
    })
}

/// Read an i32 length prefix, rejecting negatives
fn get_len(buf: &mut &[u8], what: &str) -> Result<usize> {
    ensure(buf, 4, what)?;
    let len = buf.get_i32_le();
    if len < 0 {
        return Err(VaultError::Serialization(format!("negative {}: {}", what, len)));
    }
    Ok(len as usize)
}

fn get_utf8(buf: &mut &[u8], len: usize, what: &str) -> Result<String> {
    ensure(buf, len, what)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| VaultError::Serialization(format!("{} is not utf-8: {}", what, e)))?
        .to_string();
    buf.advance(len);
    Ok(s)
}

fn ensure(buf: &[u8], needed: usize, what: &str) -> Result<()> {
    if buf.len() < needed {
        return Err(VaultError::Serialization(format!(
            "truncated {}: need {} bytes, {} left",
            what,
            needed,
            buf.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_matches_encoding() {
        let row = Row::new()
            .with("id", 7i32)
            .with("name", "Zoë")
            .with("blob", vec![1u8, 2, 3])
            .with("missing", Value::Null);
        assert_eq!(serialize(&row).len(), serialized_size(&row));
    }

    #[test]
    fn test_empty_row() {
        let bytes = serialize(&Row::new());
        assert_eq!(&bytes[..], &[0, 0, 0, 0]);
        assert!(deserialize(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = serialize(&Row::new().with("a", 1i32)).to_vec();
        bytes.push(0);
        assert!(deserialize(&bytes).is_err());
    }
}

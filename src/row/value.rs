//! Row values and the row container

use crate::error::VaultError;

/// Wire type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeTag {
    Null = 0,
    Int32 = 1,
    Int64 = 2,
    Float64 = 3,
    Bool = 4,
    Timestamp = 5,
    String = 6,
    Bytes = 7,
    Decimal = 8,
}

impl TryFrom<u8> for TypeTag {
    type Error = VaultError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => TypeTag::Null,
            1 => TypeTag::Int32,
            2 => TypeTag::Int64,
            3 => TypeTag::Float64,
            4 => TypeTag::Bool,
            5 => TypeTag::Timestamp,
            6 => TypeTag::String,
            7 => TypeTag::Bytes,
            8 => TypeTag::Decimal,
            other => {
                return Err(VaultError::Serialization(format!(
                    "unknown type tag {}",
                    other
                )))
            }
        })
    }
}

/// A single column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    /// Microseconds since the unix epoch
    Timestamp(i64),
    String(String),
    Bytes(Vec<u8>),
    /// `mantissa * 10^-scale`
    Decimal { mantissa: i128, scale: u8 },
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Int32(_) => TypeTag::Int32,
            Value::Int64(_) => TypeTag::Int64,
            Value::Float64(_) => TypeTag::Float64,
            Value::Bool(_) => TypeTag::Bool,
            Value::Timestamp(_) => TypeTag::Timestamp,
            Value::String(_) => TypeTag::String,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::Decimal { .. } => TypeTag::Decimal,
        }
    }

    /// Encoded size of the value body (excluding the tag byte)
    pub fn encoded_len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Int32(_) => 4,
            Value::Int64(_) | Value::Float64(_) | Value::Timestamp(_) => 8,
            Value::Bool(_) => 1,
            Value::String(s) => 4 + s.len(),
            Value::Bytes(b) => 4 + b.len(),
            Value::Decimal { .. } => 17,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Ordered column name → value mapping
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column, replacing an existing value in place
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.columns.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => *slot = value,
            None => self.columns.push((name, value)),
        }
    }

    /// Builder-style `set`
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub(crate) fn push_unchecked(&mut self, name: String, value: Value) {
        self.columns.push((name, value));
    }
}

impl<N: Into<String>, V: Into<Value>> FromIterator<(N, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (name, value) in iter {
            row.set(name, value);
        }
        row
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Column types understood by the batch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Utf8,
    DateTime,
    Utf8List,
    NullableUtf8List,
}

/// One typed cell of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    String(String),
    DateTime(DateTime<Utc>),
    StringArray(Vec<String>),
    NullableStringArray(Vec<Option<String>>),
}

pub type Row = Vec<Value>;

impl Value {
    /// Type carried by this value; `None` for `Null`.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(DataType::Boolean),
            Value::UInt8(_) => Some(DataType::UInt8),
            Value::UInt16(_) => Some(DataType::UInt16),
            Value::UInt32(_) => Some(DataType::UInt32),
            Value::UInt64(_) => Some(DataType::UInt64),
            Value::String(_) => Some(DataType::Utf8),
            Value::DateTime(_) => Some(DataType::DateTime),
            Value::StringArray(_) => Some(DataType::Utf8List),
            Value::NullableStringArray(_) => Some(DataType::NullableUtf8List),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::UInt8(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UInt16(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Empty strings are stored as absent.
pub fn nullable_string(s: &str) -> Value {
    if s.is_empty() {
        Value::Null
    } else {
        Value::String(s.to_string())
    }
}

/// Zero means "not measured" for tracker timings.
pub fn nullable_u16(v: u64) -> Value {
    match v as u16 {
        0 => Value::Null,
        v => Value::UInt16(v),
    }
}

pub fn nullable_u32(v: u64) -> Value {
    match v as u32 {
        0 => Value::Null,
        v => Value::UInt32(v),
    }
}

/// Epoch milliseconds to a UTC timestamp. Out-of-range input becomes `Null`.
pub fn datetime(ms: u64) -> Value {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .map(Value::DateTime)
        .unwrap_or(Value::Null)
}

/// Cuts `s` down to at most `max_bytes`, backing off to a char boundary.
pub fn truncate_to_bytes(s: &mut String, max_bytes: usize) -> bool {
    if s.len() <= max_bytes {
        return false;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    true
}

//! Decoded column values.

use std::fmt;

/// A value decoded from one record column.
///
/// Covers SQLite's five storage classes. Text is decoded lossily: a forensic
/// dump must render whatever bytes are present, so invalid UTF-8 sequences
/// become replacement characters instead of failing the decode.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub enum ColumnValue {
    /// SQL NULL.
    Null,
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit IEEE 754 floating-point number.
    Float(f64),
    /// A text string (lossily decoded as UTF-8).
    Text(String),
    /// A binary large object.
    Blob(Vec<u8>),
}

impl ColumnValue {
    /// Returns true if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// The integer value, if this is an integer.
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// The text value, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Blob(b) => write!(f, "BLOB({} bytes)", b.len()),
        }
    }
}

//! Osprey Result Serializer
//!
//! Append-only record encoder with three output formats:
//!
//! - [`Format::Json`]: one JSON object per line
//! - [`Format::Tlv`]: compact, self-describing typed-length-value bytes
//! - [`Format::Csv`]: one flat line per record, header taken from the first record
//!
//! Keys are written in a single pass; nothing already in the buffer is
//! rewritten except by [`Serializer::rollback`], which discards everything
//! written since the last [`Serializer::snapshot`].

mod serializer;
mod tlv;
mod verdict;

pub use serializer::Serializer;
pub use tlv::{ItemKey, TlvDeserializer, TlvItem, TlvValue, TLV_VERSION};
pub use verdict::{read_verdict_json, read_verdict_tlv, write_verdict};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Output encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Json,
    Tlv,
    Csv,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Json => "json",
            Format::Tlv => "tlv",
            Format::Csv => "csv",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = SerializerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Format::Json),
            "tlv" => Ok(Format::Tlv),
            "csv" => Ok(Format::Csv),
            other => Err(SerializerError::UnknownFormat(other.to_string())),
        }
    }
}

/// Record key: a numeric id or a name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key<'a> {
    Id(u32),
    Name(&'a str),
}

impl From<u32> for Key<'static> {
    fn from(id: u32) -> Self {
        Key::Id(id)
    }
}

impl<'a> From<&'a str> for Key<'a> {
    fn from(name: &'a str) -> Self {
        Key::Name(name)
    }
}

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Id(id) => write!(f, "{}", id),
            Key::Name(name) => f.write_str(name),
        }
    }
}

/// Serializer errors
#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("Unknown format: {0}")]
    UnknownFormat(String),

    #[error("{format} does not support {what}")]
    Unsupported { format: Format, what: &'static str },

    #[error("Unbalanced container: {0}")]
    Unbalanced(&'static str),

    #[error("No snapshot to roll back to")]
    NoSnapshot,

    #[error("Value too long for {format}: {len} bytes")]
    TooLong { format: Format, len: usize },

    #[error("CSV row has {found} fields, header has {expected}")]
    ColumnCount { expected: usize, found: usize },

    #[error("Truncated input at offset {0}")]
    Truncated(usize),

    #[error("Unknown item type {ty:#04x} at offset {offset}")]
    UnknownType { ty: u8, offset: usize },

    #[error("Unsupported TLV version {0}")]
    Version(u8),

    #[error("Invalid UTF-8 in string at offset {0}")]
    Utf8(usize),

    #[error("Missing or invalid field '{0}'")]
    Field(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for serializer operations
pub type SerializerResult<T> = Result<T, SerializerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!("JSON".parse::<Format>().unwrap(), Format::Json);
        assert_eq!("tlv".parse::<Format>().unwrap(), Format::Tlv);
        assert!(matches!(
            "xml".parse::<Format>(),
            Err(SerializerError::UnknownFormat(_))
        ));
        assert_eq!(Format::Csv.to_string(), "csv");
    }

    #[test]
    fn test_key_conversions() {
        assert_eq!(Key::from(7u32), Key::Id(7));
        assert_eq!(Key::from("proto"), Key::Name("proto"));
        assert_eq!(Key::Id(42).to_string(), "42");
    }
}

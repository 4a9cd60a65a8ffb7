//! Property values observed on content nodes and written by sequencers.
//!
//! Large values are never carried inline through the pipeline: a binary
//! property holds a content-addressed `BinaryKey`, and the bytes are read
//! through the binary store when a sequencer asks for them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content-addressed identifier of a binary value (BLAKE3 of its bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BinaryKey([u8; 32]);

impl BinaryKey {
    /// Computes the key for the given content.
    #[must_use]
    pub fn for_content(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Wraps raw hash bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BinaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", blake3::Hash::from(self.0).to_hex())
    }
}

/// Possible values a content property can hold.
///
/// # Examples
///
/// ```
/// use sequencing::PropertyValue;
///
/// let name = PropertyValue::from("photo.jpg");
/// let size = PropertyValue::from(1024_i64);
///
/// assert_eq!(name.as_string(), Some("photo.jpg"));
/// assert_eq!(size.as_long(), Some(1024));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
    Strings(Vec<String>),
    Date(DateTime<Utc>),
    Binary(BinaryKey),
}

impl PropertyValue {
    pub const fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_long(&self) -> Option<i64> {
        match self {
            Self::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub const fn as_double(&self) -> Option<f64> {
        match self {
            Self::Double(v) => Some(*v),
            Self::Long(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            Self::Strings(v) => Some(v),
            _ => None,
        }
    }

    pub const fn as_binary(&self) -> Option<BinaryKey> {
        match self {
            Self::Binary(k) => Some(*k),
            _ => None,
        }
    }

    /// Returns a human-readable type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "boolean",
            Self::Long(_) => "long",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Strings(_) => "strings",
            Self::Date(_) => "date",
            Self::Binary(_) => "binary",
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v}"),
            // Multi-valued properties render space-separated.
            Self::Strings(v) => write!(f, "{}", v.join(" ")),
            Self::Date(v) => write!(f, "{}", v.to_rfc3339()),
            Self::Binary(k) => write!(f, "binary:{k}"),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(v: Vec<String>) -> Self {
        Self::Strings(v)
    }
}

impl From<BinaryKey> for PropertyValue {
    fn from(k: BinaryKey) -> Self {
        Self::Binary(k)
    }
}

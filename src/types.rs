//! Core types shared by the listing and download engines

use serde::{Deserialize, Serialize};

/// One listed object: full name (caller prefix included) and size in bytes.
///
/// Listing results form a set keyed by both fields, so re-listed page
/// boundaries deduplicate for free.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub name: String,
    pub size: u64,
}

impl ObjectDescriptor {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }
}

/// Storage class reported by the object store for a listed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageClass {
    Standard,
    Nearline,
    Coldline,
    Archive,
    Other(String),
}

impl From<&str> for StorageClass {
    fn from(value: &str) -> Self {
        match value {
            "STANDARD" => StorageClass::Standard,
            "NEARLINE" => StorageClass::Nearline,
            "COLDLINE" => StorageClass::Coldline,
            "ARCHIVE" => StorageClass::Archive,
            other => StorageClass::Other(other.to_string()),
        }
    }
}

/// Half-open lexicographic key interval `[start, end)`.
///
/// An empty `start` means the beginning of the namespace; an empty `end`
/// means no upper bound. Worker ranges are expressed with the caller's
/// prefix stripped so that range arithmetic stays prefix-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    pub start: String,
    pub end: String,
}

impl KeyRange {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The whole namespace.
    pub fn whole() -> Self {
        Self::new("", "")
    }
}

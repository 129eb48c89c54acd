//! Data models for Versicle
//!
//! Records stored in the shared document's containers. All of them serialize
//! with camelCase field names and are stored as nested document maps, so
//! concurrent edits to different fields of one record merge.
//!
//! Timestamps are Unix epoch milliseconds.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::containers::names;

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// A record that lives in one map container, keyed by one of its fields
pub trait Record: Serialize + DeserializeOwned {
    /// Container the record is stored in
    const CONTAINER: &'static str;

    /// Key of this record inside the container
    fn key(&self) -> String;

    fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }

    fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

/// Metadata for a book in the library
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    pub added_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read: Option<i64>,
}

impl BookSummary {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            author: String::new(),
            cover_url: None,
            file_hash: None,
            added_at: now_ms(),
            last_read: None,
        }
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = author.into();
        self
    }

    /// Most recent activity timestamp, used when merging legacy manifests
    pub fn activity(&self) -> i64 {
        self.last_read.unwrap_or(self.added_at).max(self.added_at)
    }
}

impl Record for BookSummary {
    const CONTAINER: &'static str = names::LIBRARY;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// Reading progress of one book on one device
///
/// Stored in the `progress` container as `bookId → { deviceId → progress }`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadingProgress {
    pub book_id: String,
    pub device_id: String,
    /// Fraction read, 0.0 to 1.0
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfi: Option<String>,
    #[serde(default)]
    pub read_ranges: Vec<String>,
    pub updated_at: i64,
}

impl ReadingProgress {
    pub fn new(book_id: impl Into<String>, device_id: impl Into<String>, percentage: f64) -> Self {
        Self {
            book_id: book_id.into(),
            device_id: device_id.into(),
            percentage,
            cfi: None,
            read_ranges: Vec::new(),
            updated_at: now_ms(),
        }
    }
}

/// A highlight or note inside a book
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    pub book_id: String,
    pub cfi_range: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default = "default_color")]
    pub color: String,
    pub created: i64,
}

fn default_color() -> String {
    "yellow".to_string()
}

impl Annotation {
    pub fn new(book_id: impl Into<String>, cfi_range: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            book_id: book_id.into(),
            cfi_range: cfi_range.into(),
            text: text.into(),
            note: None,
            color: default_color(),
            created: now_ms(),
        }
    }
}

impl Record for Annotation {
    const CONTAINER: &'static str = names::ANNOTATIONS;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// A pronunciation rule applied before text-to-speech
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LexiconRule {
    pub id: String,
    pub original: String,
    pub replacement: String,
    #[serde(default)]
    pub is_regex: bool,
    /// Book the rule is scoped to; global when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub book_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<i64>,
    pub created: i64,
}

impl LexiconRule {
    pub fn new(original: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            original: original.into(),
            replacement: replacement.into(),
            is_regex: false,
            book_id: None,
            order: None,
            created: now_ms(),
        }
    }
}

impl Record for LexiconRule {
    const CONTAINER: &'static str = names::LEXICON;

    fn key(&self) -> String {
        self.id.clone()
    }
}

/// An entry in the reading list, keyed by source filename
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadingListEntry {
    pub filename: String,
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
    pub last_updated: i64,
}

impl ReadingListEntry {
    pub fn new(filename: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            title: title.into(),
            author: String::new(),
            percentage: 0.0,
            status: None,
            rating: None,
            last_updated: now_ms(),
        }
    }
}

impl Record for ReadingListEntry {
    const CONTAINER: &'static str = names::READING_LIST;

    fn key(&self) -> String {
        self.filename.clone()
    }
}

/// Last text-to-speech position in a book
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TtsPosition {
    pub book_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfi: Option<String>,
    #[serde(default)]
    pub queue_index: u32,
    pub updated_at: i64,
}

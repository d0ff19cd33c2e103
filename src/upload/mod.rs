//! Upload module
//!
//! The durable Upload Record plus the transient descriptors protocol handlers
//! hand to the storage layer (create init, metadata patch, chunk write,
//! query/delete selector).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

/// Client supplied key/value metadata, kept sorted so hashing and encoding
/// are deterministic.
pub type Metadata = BTreeMap<String, String>;

/// Request body delivered to `Storage::write` chunk by chunk.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Content type used when the client does not declare one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Wrap an in-memory buffer as a single-chunk [`ByteStream`]
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    stream::once(async move { Ok(data) }).boxed()
}

/// Upload lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Created,
    Part,
    Completed,
    Deleted,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Part => "part",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
        }
    }

    /// Whether `next` is reachable from `self`.
    ///
    /// Statuses only move forward along `created -> part -> completed`;
    /// any live status may become `deleted` and nothing leaves `deleted`.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        match (self, next) {
            (Self::Deleted, _) => false,
            (_, Self::Deleted) => true,
            (current, next) => next.rank() >= current.rank(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Part => 1,
            Self::Completed => 2,
            Self::Deleted => 3,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One upload session's progress and metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub size: u64,
    pub bytes_written: u64,
    pub status: UploadStatus,
    #[serde(default)]
    pub metadata: Metadata,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    /// Upload URI handed out by an external backend instead of a local URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_uri: Option<String>,
}

impl UploadRecord {
    /// Create a fresh record with nothing written yet
    pub fn new(id: impl Into<String>, size: u64, init: &FileInit) -> Self {
        Self {
            id: id.into(),
            user_id: init.user_id.clone(),
            size,
            bytes_written: 0,
            status: UploadStatus::Created,
            metadata: init.metadata.clone(),
            content_type: init
                .content_type
                .clone()
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            created_at: Utc::now(),
            upload_uri: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == UploadStatus::Completed
    }

    /// Bytes still expected before the upload completes
    pub fn remaining(&self) -> u64 {
        self.size.saturating_sub(self.bytes_written)
    }

    /// Record `bytes_written` as the new durable offset and derive the status.
    ///
    /// The offset is clamped to `size`.
    pub fn advance_to(&mut self, bytes_written: u64) {
        self.bytes_written = bytes_written.min(self.size);
        self.status = if self.bytes_written == self.size {
            UploadStatus::Completed
        } else if self.bytes_written > 0 {
            UploadStatus::Part
        } else {
            UploadStatus::Created
        };
    }

    /// Whether `user_id` may act on this record
    pub fn owned_by(&self, user_id: Option<&str>) -> bool {
        match &self.user_id {
            Some(owner) => user_id == Some(owner.as_str()),
            None => true,
        }
    }
}

/// Parameters for `Storage::create`
#[derive(Debug, Clone, Default)]
pub struct FileInit {
    /// Declared total length; `None` when absent or unparsable
    pub size: Option<u64>,
    pub user_id: Option<String>,
    pub metadata: Metadata,
    pub content_type: Option<String>,
}

/// Metadata-only mutation for `Storage::update`
#[derive(Debug, Clone, Default)]
pub struct FilePatch {
    pub user_id: Option<String>,
    pub metadata: Metadata,
}

/// One chunk delivered for an upload.
///
/// A chunk without a `start` is a status query: nothing is written and the
/// offset check is skipped.
pub struct ChunkWrite {
    pub id: String,
    pub user_id: Option<String>,
    pub start: Option<u64>,
    pub content_length: Option<u64>,
    pub body: Option<ByteStream>,
}

impl ChunkWrite {
    /// Chunk starting at `start` with its bytes in `body`
    pub fn new(id: impl Into<String>, start: u64, body: ByteStream) -> Self {
        Self {
            id: id.into(),
            user_id: None,
            start: Some(start),
            content_length: None,
            body: Some(body),
        }
    }

    /// Zero-length write that only reports the current record
    pub fn query(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user_id: None,
            start: None,
            content_length: None,
            body: None,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    #[must_use]
    pub fn with_content_length(mut self, content_length: Option<u64>) -> Self {
        self.content_length = content_length;
        self
    }
}

impl fmt::Debug for ChunkWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkWrite")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("start", &self.start)
            .field("content_length", &self.content_length)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// Filter used by `Storage::get` and `Storage::delete`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selector {
    pub id: Option<String>,
    pub user_id: Option<String>,
}

impl Selector {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            user_id: None,
        }
    }

    pub fn by_user(user_id: impl Into<String>) -> Self {
        Self {
            id: None,
            user_id: Some(user_id.into()),
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn matches(&self, record: &UploadRecord) -> bool {
        let id_matches = self.id.as_deref().map_or(true, |id| id == record.id);
        let user_matches = self
            .user_id
            .as_deref()
            .map_or(true, |user| record.user_id.as_deref() == Some(user));
        id_matches && user_matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(size: u64) -> UploadRecord {
        UploadRecord::new("abc", size, &FileInit::default())
    }

    #[test]
    fn test_new_record_defaults() {
        let record = record(100);
        assert_eq!(record.bytes_written, 0);
        assert_eq!(record.status, UploadStatus::Created);
        assert_eq!(record.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn test_advance_derives_status() {
        let mut record = record(100);
        record.advance_to(60);
        assert_eq!(record.status, UploadStatus::Part);
        assert_eq!(record.remaining(), 40);

        record.advance_to(100);
        assert!(record.is_completed());
    }

    #[test]
    fn test_advance_clamps_to_size() {
        let mut record = record(10);
        record.advance_to(25);
        assert_eq!(record.bytes_written, 10);
        assert!(record.is_completed());
    }

    #[test]
    fn test_status_transitions() {
        assert!(UploadStatus::Created.can_transition_to(UploadStatus::Part));
        assert!(UploadStatus::Part.can_transition_to(UploadStatus::Completed));
        assert!(UploadStatus::Completed.can_transition_to(UploadStatus::Deleted));
        assert!(!UploadStatus::Completed.can_transition_to(UploadStatus::Part));
        assert!(!UploadStatus::Deleted.can_transition_to(UploadStatus::Created));
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let json = serde_json::to_value(record(5)).unwrap();
        assert_eq!(json["bytesWritten"], 0);
        assert_eq!(json["status"], "created");
        assert!(json.get("userId").is_none());
    }

    #[test]
    fn test_selector_matches() {
        let mut owned = record(1);
        owned.user_id = Some("alice".into());

        assert!(Selector::by_id("abc").matches(&owned));
        assert!(Selector::by_user("alice").matches(&owned));
        assert!(!Selector::by_user("bob").matches(&owned));
        assert!(!Selector::by_id("xyz").matches(&owned));
    }

    #[test]
    fn test_ownership() {
        let mut owned = record(1);
        assert!(owned.owned_by(None));
        owned.user_id = Some("alice".into());
        assert!(owned.owned_by(Some("alice")));
        assert!(!owned.owned_by(Some("bob")));
        assert!(!owned.owned_by(None));
    }
}

//! Storage contract
//!
//! Protocol handlers manipulate uploads only through [`Storage`]. Backends
//! own the persisted [`UploadRecord`]s and their byte payloads; handlers only
//! ever see request-scoped copies.
//!
//! Every backend must enforce offset reconciliation in `write`: a chunk whose
//! start differs from the record's `bytes_written` fails with `FileConflict`
//! and leaves the record untouched.

use crate::codec::stable_hash;
use crate::config::{IdPolicy, StorageConfig};
use crate::error::{ErrorCode, UploadError, UploadResult};
use crate::upload::{ChunkWrite, FileInit, FilePatch, Metadata, Selector, UploadRecord};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

pub mod disk;

pub use disk::DiskStorage;

/// Capacity of the lifecycle event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Upload lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadEventKind {
    Created,
    Completed,
    Deleted,
}

/// Lifecycle event carrying a snapshot of the record
#[derive(Debug, Clone)]
pub struct UploadEvent {
    pub kind: UploadEventKind,
    pub record: UploadRecord,
}

/// Storage backend contract
#[async_trait]
pub trait Storage: Send + Sync {
    /// Limits and URL options shared with the protocol handlers
    fn config(&self) -> &StorageConfig;

    /// Whether the backend can serve requests
    fn is_ready(&self) -> bool {
        true
    }

    /// Subscribe to lifecycle events
    fn subscribe(&self) -> broadcast::Receiver<UploadEvent>;

    /// Allocate a new upload, or return the existing one when the id policy
    /// maps this init onto an upload that already exists
    async fn create(&self, init: FileInit) -> UploadResult<UploadRecord>;

    /// Append a chunk at `chunk.start`, or report the record for a query chunk
    async fn write(&self, chunk: ChunkWrite) -> UploadResult<UploadRecord>;

    /// Merge metadata into an existing upload
    async fn update(&self, id: &str, patch: FilePatch) -> UploadResult<UploadRecord>;

    /// Uploads matching the selector; empty when nothing matches
    async fn get(&self, selector: &Selector) -> UploadResult<Vec<UploadRecord>>;

    /// Remove matching uploads and their payloads
    async fn delete(&self, selector: &Selector) -> UploadResult<Vec<UploadRecord>>;
}

/// Validate a create request against the configured limits.
///
/// Returns the declared size.
pub fn validate_init(config: &StorageConfig, init: &FileInit) -> UploadResult<u64> {
    let size = match init.size {
        Some(size) if size > 0 => size,
        Some(_) => return Err(UploadError::invalid_size("Upload size must be positive")),
        None => return Err(UploadError::invalid_size("Upload size is missing or invalid")),
    };

    if size > config.max_upload_size {
        return Err(UploadError::new(
            ErrorCode::FileTooLarge,
            format!(
                "Upload size {} exceeds the limit of {} bytes",
                size, config.max_upload_size
            ),
        ));
    }

    check_metadata_size(config, &init.metadata)?;
    Ok(size)
}

/// Reject metadata whose encoded form exceeds `max_metadata_size`
pub fn check_metadata_size(config: &StorageConfig, metadata: &Metadata) -> UploadResult<()> {
    let size = serde_json::to_vec(metadata)?.len() as u64;
    if size > config.max_metadata_size {
        return Err(UploadError::bad_request(format!(
            "Metadata size {} exceeds the limit of {} bytes",
            size, config.max_metadata_size
        )));
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityKey<'a> {
    user_id: Option<&'a str>,
    size: u64,
    content_type: Option<&'a str>,
    metadata: &'a Metadata,
}

/// Assign an id for a new upload according to `policy`
pub fn generate_id(policy: IdPolicy, init: &FileInit, size: u64) -> UploadResult<String> {
    match policy {
        IdPolicy::Unique => Ok(uuid::Uuid::new_v4().simple().to_string()),
        IdPolicy::ContentHash => {
            let key = IdentityKey {
                user_id: init.user_id.as_deref(),
                size,
                content_type: init.content_type.as_deref(),
                metadata: &init.metadata,
            };
            let mut digest = stable_hash(&key).map_err(|e| UploadError::internal(e.to_string()))?;
            digest.truncate(32);
            Ok(digest)
        }
    }
}

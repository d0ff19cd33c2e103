//! Local filesystem storage
//!
//! Layout under the configured root:
//!
//! - `<id>` holds the payload bytes, grown chunk by chunk
//! - `<id>.META` holds the JSON encoded [`UploadRecord`]
//!
//! Payload bytes are synced before the sidecar advances `bytes_written`, so
//! the sidecar never acknowledges bytes that are not on disk. A payload that
//! is longer than the acknowledged offset (crash between the two steps) is
//! truncated back on the next write. Writes to one id are serialized by a
//! per-id async mutex; different ids never share a lock.

use super::{
    check_metadata_size, generate_id, validate_init, Storage, UploadEvent, UploadEventKind,
    EVENT_CHANNEL_CAPACITY,
};
use crate::config::{IdPolicy, StorageConfig};
use crate::error::{ErrorCode, UploadError, UploadResult};
use crate::metrics;
use crate::upload::{
    ByteStream, ChunkWrite, FileInit, FilePatch, Selector, UploadRecord, UploadStatus,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tracing::{debug, info, instrument, warn};

/// Sidecar file suffix
const META_SUFFIX: &str = ".META";

/// Exclusive access to one upload id.
///
/// The registry entry is dropped together with the last handle to its mutex,
/// so the map only ever holds ids with a writer running or queued.
struct IdLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Filesystem backed [`Storage`]
pub struct DiskStorage {
    config: StorageConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
    events: broadcast::Sender<UploadEvent>,
    ready: AtomicBool,
}

impl DiskStorage {
    /// Open (creating if needed) the storage root and recover persisted uploads
    pub async fn new(config: StorageConfig) -> UploadResult<Self> {
        ensure_dir(&config.directory).await?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let storage = Self {
            config,
            locks: DashMap::new(),
            events,
            ready: AtomicBool::new(false),
        };

        let recovered = storage.recover().await?;
        storage.ready.store(true, Ordering::Release);

        info!(
            root = %storage.root().display(),
            uploads = recovered,
            "Disk storage ready"
        );

        Ok(storage)
    }

    /// Storage root directory
    pub fn root(&self) -> &Path {
        &self.config.directory
    }

    /// Payload path of an upload, `None` for ids that cannot name a file here
    pub fn payload_path(&self, id: &str) -> Option<PathBuf> {
        is_valid_id(id).then(|| self.root().join(id))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root().join(format!("{}{}", id, META_SUFFIX))
    }

    async fn lock(&self, id: &str) -> IdLock<'_> {
        let mut held = IdLock {
            locks: &self.locks,
            id: id.to_string(),
            guard: None,
        };
        let lock = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        held.guard = Some(lock.lock_owned().await);
        held
    }

    fn emit(&self, kind: UploadEventKind, record: &UploadRecord) {
        // No subscribers is fine
        let _ = self.events.send(UploadEvent {
            kind,
            record: record.clone(),
        });
    }

    /// Reconcile every sidecar with its payload after a restart
    async fn recover(&self) -> UploadResult<usize> {
        let ids = self.list_ids().await?;
        for id in &ids {
            match self.read_record(id).await {
                Ok((record, true)) => self.save(&record).await?,
                Ok((_, false)) => {}
                Err(e) => warn!(upload.id = %id, error = %e, "Skipping unreadable upload state"),
            }
        }
        Ok(ids.len())
    }

    async fn list_ids(&self) -> UploadResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(self.root()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(META_SUFFIX)) else {
                continue;
            };
            if is_valid_id(id) {
                ids.push(id.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Load a record and clamp `bytes_written` to the payload length.
    ///
    /// The flag reports whether the sidecar disagreed with the payload.
    async fn read_record(&self, id: &str) -> UploadResult<(UploadRecord, bool)> {
        let payload = self.payload_path(id).ok_or_else(|| UploadError::not_found(id))?;
        let raw = match fs::read(self.meta_path(id)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(UploadError::not_found(id)),
            Err(e) => return Err(e.into()),
        };
        let mut record: UploadRecord = serde_json::from_slice(&raw)?;

        let on_disk = payload_len(&payload).await?;
        if on_disk < record.bytes_written {
            warn!(
                upload.id = %id,
                persisted = record.bytes_written,
                on_disk,
                "Payload shorter than recorded offset, rolling back"
            );
            record.advance_to(on_disk);
            return Ok((record, true));
        }

        Ok((record, false))
    }

    /// Atomically replace the sidecar
    async fn save(&self, record: &UploadRecord) -> UploadResult<()> {
        let meta = self.meta_path(&record.id);
        let tmp = self.root().join(format!("{}{}.tmp", record.id, META_SUFFIX));

        let json = serde_json::to_vec_pretty(record)?;
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, &meta).await?;
        Ok(())
    }

    async fn delete_one(&self, id: &str, user_id: Option<&str>) -> UploadResult<UploadRecord> {
        let payload = self.payload_path(id).ok_or_else(|| UploadError::not_found(id))?;
        let guard = self.lock(id).await;

        let (mut record, _) = self.read_record(id).await?;
        if !record.owned_by(user_id) {
            return Err(UploadError::forbidden());
        }

        remove_if_exists(&self.meta_path(id)).await?;
        remove_if_exists(&payload).await?;
        debug_assert!(record.status.can_transition_to(UploadStatus::Deleted));
        record.status = UploadStatus::Deleted;

        drop(guard);

        info!(upload.id = %id, bytes_written = record.bytes_written, "Upload deleted");
        metrics::record_upload_event("deleted");
        self.emit(UploadEventKind::Deleted, &record);

        Ok(record)
    }
}

#[async_trait]
impl Storage for DiskStorage {
    fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    #[instrument(
        name = "storage.disk.create",
        skip(self, init),
        fields(upload.size = ?init.size, upload.id = tracing::field::Empty),
        err
    )]
    async fn create(&self, init: FileInit) -> UploadResult<UploadRecord> {
        let size = validate_init(&self.config, &init)?;
        let id = generate_id(self.config.id_policy, &init, size)?;
        tracing::Span::current().record("upload.id", id.as_str());

        let payload = self
            .payload_path(&id)
            .ok_or_else(|| UploadError::internal(format!("generated invalid id {}", id)))?;
        let _guard = self.lock(&id).await;

        if self.config.id_policy == IdPolicy::ContentHash {
            match self.read_record(&id).await {
                Ok((existing, _)) => {
                    info!(
                        upload.id = %id,
                        bytes_written = existing.bytes_written,
                        "Create matched an existing upload"
                    );
                    return Ok(existing);
                }
                Err(e) if e.code() == ErrorCode::FileNotFound => {}
                Err(e) => return Err(e),
            }
        }

        ensure_dir(self.root()).await?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&payload)
            .await?;
        file.sync_all().await?;

        let record = UploadRecord::new(id, size, &init);
        self.save(&record).await?;

        info!(upload.id = %record.id, size, "Upload created");
        metrics::record_upload_event("created");
        self.emit(UploadEventKind::Created, &record);

        Ok(record)
    }

    #[instrument(
        name = "storage.disk.write",
        skip(self, chunk),
        fields(upload.id = %chunk.id, upload.offset = ?chunk.start),
        err
    )]
    async fn write(&self, chunk: ChunkWrite) -> UploadResult<UploadRecord> {
        let ChunkWrite {
            id,
            user_id,
            start,
            content_length,
            body,
        } = chunk;

        let payload = self.payload_path(&id).ok_or_else(|| UploadError::not_found(&id))?;
        let _guard = self.lock(&id).await;

        let (mut record, _) = self.read_record(&id).await?;
        if !record.owned_by(user_id.as_deref()) {
            return Err(UploadError::forbidden());
        }

        let Some(start) = start else {
            return Ok(record);
        };

        if start != record.bytes_written {
            warn!(
                upload.id = %id,
                expected = record.bytes_written,
                received = start,
                "Rejected chunk with stale offset"
            );
            metrics::record_offset_conflict();
            return Err(UploadError::conflict(record.bytes_written, start));
        }

        let limit = record.remaining();
        if let Some(len) = content_length {
            if len > limit {
                return Err(UploadError::new(
                    ErrorCode::FileTooLarge,
                    format!("Chunk of {} bytes exceeds the {} bytes remaining", len, limit),
                ));
            }
        }

        let Some(body) = body else {
            return Ok(record);
        };

        let started = Instant::now();
        let (written, failure) =
            append_chunk(&payload, start, body, content_length.unwrap_or(limit)).await?;

        if written > 0 {
            let previous = record.status;
            record.advance_to(start + written);
            debug_assert!(previous.can_transition_to(record.status));
            self.save(&record).await?;
        }

        let failure = failure.or_else(|| match content_length {
            Some(expected) if written < expected => Some(UploadError::storage(format!(
                "Short body: expected {} bytes, received {}",
                expected, written
            ))),
            _ => None,
        });
        metrics::record_chunk_write(
            written,
            started.elapsed().as_secs_f64(),
            failure.is_none(),
        );
        if let Some(err) = failure {
            return Err(err);
        }

        debug!(
            upload.id = %id,
            bytes_written = record.bytes_written,
            chunk = written,
            "Chunk written"
        );

        if record.is_completed() && written > 0 {
            info!(upload.id = %id, size = record.size, "Upload completed");
            metrics::record_upload_event("completed");
            self.emit(UploadEventKind::Completed, &record);
        }

        Ok(record)
    }

    #[instrument(name = "storage.disk.update", skip(self, patch), err)]
    async fn update(&self, id: &str, patch: FilePatch) -> UploadResult<UploadRecord> {
        if !is_valid_id(id) {
            return Err(UploadError::not_found(id));
        }
        let _guard = self.lock(id).await;

        let (mut record, _) = self.read_record(id).await?;
        if !record.owned_by(patch.user_id.as_deref()) {
            return Err(UploadError::forbidden());
        }

        let mut metadata = record.metadata.clone();
        metadata.extend(patch.metadata);
        check_metadata_size(&self.config, &metadata)?;
        record.metadata = metadata;

        self.save(&record).await?;
        Ok(record)
    }

    async fn get(&self, selector: &Selector) -> UploadResult<Vec<UploadRecord>> {
        if let Some(id) = &selector.id {
            if !is_valid_id(id) {
                return Ok(Vec::new());
            }
            return match self.read_record(id).await {
                Ok((record, _)) => Ok(Some(record)
                    .filter(|r| selector.matches(r))
                    .into_iter()
                    .collect()),
                Err(e) if e.code() == ErrorCode::FileNotFound => Ok(Vec::new()),
                Err(e) => Err(e),
            };
        }

        let mut records = Vec::new();
        for id in self.list_ids().await? {
            match self.read_record(&id).await {
                Ok((record, _)) if selector.matches(&record) => records.push(record),
                Ok(_) => {}
                // Deleted between listing and reading
                Err(e) if e.code() == ErrorCode::FileNotFound => {}
                Err(e) => warn!(upload.id = %id, error = %e, "Skipping unreadable upload state"),
            }
        }
        Ok(records)
    }

    #[instrument(name = "storage.disk.delete", skip(self), err)]
    async fn delete(&self, selector: &Selector) -> UploadResult<Vec<UploadRecord>> {
        let user_id = selector.user_id.as_deref();
        match &selector.id {
            Some(id) => Ok(vec![self.delete_one(id, user_id).await?]),
            None if user_id.is_some() => {
                let mut deleted = Vec::new();
                for record in self.get(selector).await? {
                    deleted.push(self.delete_one(&record.id, user_id).await?);
                }
                Ok(deleted)
            }
            None => Err(UploadError::bad_request(
                "Delete requires an upload id or a user",
            )),
        }
    }
}

/// Stream `body` into the payload at `start`.
///
/// Returns the number of bytes that reached disk and were synced, plus the
/// error that stopped streaming early, if any. An `Err` means nothing new is
/// durable and the record must not move.
async fn append_chunk(
    path: &Path,
    start: u64,
    mut body: ByteStream,
    limit: u64,
) -> UploadResult<(u64, Option<UploadError>)> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .await?;
    // Drop any unacknowledged tail left by an interrupted write
    file.set_len(start).await?;
    file.seek(SeekFrom::Start(start)).await?;

    let mut written = 0u64;
    let mut failure = None;

    while let Some(next) = body.next().await {
        match next {
            Ok(bytes) => {
                let len = bytes.len() as u64;
                // The frame crossing the limit is refused whole
                if written + len > limit {
                    failure = Some(UploadError::new(
                        ErrorCode::FileTooLarge,
                        format!("Chunk exceeds the {} bytes remaining", limit),
                    ));
                    break;
                }
                if let Err(e) = file.write_all(&bytes).await {
                    failure = Some(e.into());
                    break;
                }
                written += len;
            }
            Err(e) => {
                failure = Some(UploadError::storage(format!(
                    "Body read failed after {} bytes: {}",
                    written, e
                )));
                break;
            }
        }
    }

    file.flush().await?;
    file.sync_data().await?;

    Ok((written, failure))
}

/// Create `dir` and any missing parents, tolerating concurrent creation
async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    match fs::create_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

async fn payload_len(path: &Path) -> std::io::Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Ids map directly to file names, so only a conservative alphabet is allowed
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

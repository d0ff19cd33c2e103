//! X-header resumable upload protocol
//!
//! Sessions are created with `POST` (JSON metadata body plus
//! `X-Upload-Content-Length` / `X-Upload-Content-Type`), and bytes are sent
//! with `PUT` + `Content-Range`. Incomplete uploads answer
//! `308 Resume Incomplete` with a `Range` header. The upload id travels in
//! the `upload_id` query parameter of the returned `Location`.

use super::{
    allow_header, collect_body, parse_json_metadata, ProtocolHandler, Reply, UploadRequest,
};
use crate::codec::parse_content_range;
use crate::error::{UploadError, UploadResult};
use crate::router::{id_from_request, upload_id_location};
use crate::storage::Storage;
use crate::upload::{ChunkWrite, FileInit, FilePatch, Metadata, Selector, UploadRecord};
use async_trait::async_trait;
use hyper::header::{HeaderName, ALLOW, CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use hyper::{Method, StatusCode};
use std::sync::Arc;
use tracing::{info, instrument};

pub const X_UPLOAD_CONTENT_LENGTH: HeaderName =
    HeaderName::from_static("x-upload-content-length");
pub const X_UPLOAD_CONTENT_TYPE: HeaderName = HeaderName::from_static("x-upload-content-type");

/// Status sent while more bytes are expected
pub const RESUME_INCOMPLETE: u16 = 308;

static METHODS: [Method; 6] = [
    Method::OPTIONS,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::GET,
];

/// X-header protocol handler
pub struct UploadxHandler {
    storage: Arc<dyn Storage>,
}

impl UploadxHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    fn upload_id(req: &UploadRequest) -> UploadResult<String> {
        id_from_request(req.path(), req.query(), &req.prefix)
            .ok_or_else(|| UploadError::not_found(req.path()))
    }

    async fn read_metadata(&self, req: UploadRequest) -> UploadResult<Metadata> {
        let body = collect_body(req.body, self.storage.config().max_metadata_size).await?;
        parse_json_metadata(&body)
    }

    /// `308` with the received range while incomplete, `200` with the record once done
    fn progress_reply(record: &UploadRecord) -> UploadResult<Reply> {
        if record.is_completed() {
            return Reply::json(StatusCode::OK, record);
        }

        let status = StatusCode::from_u16(RESUME_INCOMPLETE)
            .map_err(|e| UploadError::internal(e.to_string()))?;
        let mut reply = Reply::new(status);
        if record.bytes_written > 0 {
            reply = reply.header(RANGE, format!("bytes=0-{}", record.bytes_written - 1));
        }
        Ok(reply)
    }
}

#[async_trait]
impl ProtocolHandler for UploadxHandler {
    fn name(&self) -> &'static str {
        "uploadx"
    }

    fn methods(&self) -> &'static [Method] {
        &METHODS
    }

    async fn options(&self, _req: UploadRequest) -> UploadResult<Reply> {
        Ok(Reply::no_content()
            .header(ALLOW, allow_header(&METHODS))
            .header(CONTENT_LENGTH, "0"))
    }

    #[instrument(
        name = "upload.uploadx.create",
        skip_all,
        fields(upload.id = tracing::field::Empty),
        err
    )]
    async fn post(&self, req: UploadRequest) -> UploadResult<Reply> {
        let headers = req.headers.clone();
        let path = req.path().to_string();
        let query = req.query().map(str::to_string);
        let user_id = req.user_id.clone();
        let declared_size = req.header_u64(X_UPLOAD_CONTENT_LENGTH.as_str());
        let declared_type = req
            .header(X_UPLOAD_CONTENT_TYPE.as_str())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let metadata = self.read_metadata(req).await?;
        let init = FileInit {
            size: declared_size.or_else(|| metadata.get("size").and_then(|s| s.parse().ok())),
            content_type: declared_type.or_else(|| metadata.get("mimeType").cloned()),
            user_id,
            metadata,
        };

        let record = self.storage.create(init).await?;
        tracing::Span::current().record("upload.id", record.id.as_str());

        let status = if record.bytes_written > 0 {
            StatusCode::OK
        } else {
            StatusCode::CREATED
        };
        let location = match &record.upload_uri {
            Some(uri) => uri.clone(),
            None => upload_id_location(
                &headers,
                &path,
                query.as_deref(),
                &record.id,
                self.storage.config().use_relative_location,
            ),
        };

        Ok(Reply::new(status).header(LOCATION, location))
    }

    #[instrument(
        name = "upload.uploadx.write",
        skip_all,
        fields(upload.id = tracing::field::Empty, upload.offset = tracing::field::Empty),
        err
    )]
    async fn put(&self, req: UploadRequest) -> UploadResult<Reply> {
        let id = Self::upload_id(&req)?;
        tracing::Span::current().record("upload.id", id.as_str());

        // Without Content-Range the chunk starts at 0; `bytes */total` is a status query
        let start = match req.header(CONTENT_RANGE.as_str()) {
            Some(range) => parse_content_range(range).start,
            None => Some(0),
        };
        let content_length = req.header_u64(CONTENT_LENGTH.as_str());
        let user_id = req.user_id.clone();

        let chunk = match start {
            Some(start) => {
                tracing::Span::current().record("upload.offset", start);
                ChunkWrite::new(id, start, req.body).with_content_length(content_length)
            }
            None => {
                if content_length.unwrap_or(0) > 0 {
                    return Err(UploadError::bad_request(
                        "Content-Range without a start position cannot carry a body",
                    ));
                }
                ChunkWrite::query(id)
            }
        };

        let record = self.storage.write(chunk.with_user(user_id)).await?;
        if record.is_completed() && start.is_some() {
            info!(upload.id = %record.id, size = record.size, "uploadx upload complete");
        }

        Self::progress_reply(&record)
    }

    #[instrument(name = "upload.uploadx.update", skip_all, err)]
    async fn patch(&self, req: UploadRequest) -> UploadResult<Reply> {
        let id = Self::upload_id(&req)?;
        let user_id = req.user_id.clone();

        let metadata = self.read_metadata(req).await?;
        let record = self.storage.update(&id, FilePatch { user_id, metadata }).await?;

        Reply::json(StatusCode::OK, &record.metadata)
    }

    #[instrument(name = "upload.uploadx.list", skip_all, err)]
    async fn get(&self, req: UploadRequest) -> UploadResult<Reply> {
        let selector = Selector {
            id: id_from_request(req.path(), req.query(), &req.prefix),
            user_id: req.user_id.clone(),
        };
        let records = self.storage.get(&selector).await?;
        Reply::json(StatusCode::OK, &records)
    }

    #[instrument(name = "upload.uploadx.delete", skip_all, err)]
    async fn delete(&self, req: UploadRequest) -> UploadResult<Reply> {
        let id = Self::upload_id(&req)?;
        self.storage
            .delete(&Selector::by_id(id).with_user(req.user_id.clone()))
            .await?;
        Ok(Reply::no_content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(size: u64, written: u64) -> UploadRecord {
        let mut record = UploadRecord::new("abc", size, &FileInit::default());
        record.advance_to(written);
        record
    }

    #[test]
    fn test_progress_reply_partial() {
        let reply = UploadxHandler::progress_reply(&record(100, 60)).unwrap();
        assert_eq!(reply.status.as_u16(), 308);
        assert_eq!(reply.headers[RANGE], "bytes=0-59");
    }

    #[test]
    fn test_progress_reply_nothing_received() {
        let reply = UploadxHandler::progress_reply(&record(100, 0)).unwrap();
        assert_eq!(reply.status.as_u16(), 308);
        assert!(reply.headers.get(RANGE).is_none());
    }

    #[test]
    fn test_progress_reply_complete() {
        let reply = UploadxHandler::progress_reply(&record(100, 100)).unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["bytesWritten"], 100);
    }
}

//! tus 1.0.0 resumable upload protocol
//!
//! - `OPTIONS`: capability discovery
//! - `POST`: create (`Upload-Length`, `Upload-Metadata`)
//! - `PATCH`: append at `Upload-Offset`
//! - `HEAD`: current offset and metadata
//! - `DELETE`: termination
//! - `GET`: list uploads visible to the caller

use super::{ProtocolHandler, Reply, UploadRequest};
use crate::codec::{decode_metadata, encode_metadata};
use crate::error::{ErrorCode, UploadError, UploadResult};
use crate::router::upload_location;
use crate::storage::Storage;
use crate::upload::{ChunkWrite, FileInit, Selector};
use async_trait::async_trait;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_LENGTH, LOCATION};
use hyper::{Method, StatusCode};
use std::sync::Arc;
use tracing::{info, instrument};

/// Protocol version spoken by this handler
pub const TUS_VERSION: &str = "1.0.0";

/// Supported protocol extensions
pub const TUS_EXTENSIONS: &str = "creation,termination";

/// Required `Content-Type` of `PATCH` requests
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");

static METHODS: [Method; 6] = [
    Method::OPTIONS,
    Method::POST,
    Method::PATCH,
    Method::HEAD,
    Method::DELETE,
    Method::GET,
];

/// tus protocol handler
pub struct TusHandler {
    storage: Arc<dyn Storage>,
}

impl TusHandler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Reject clients that announce another protocol version
    fn check_version(req: &UploadRequest) -> UploadResult<()> {
        match req.header(TUS_RESUMABLE.as_str()) {
            Some(version) if version != TUS_VERSION => Err(UploadError::new(
                ErrorCode::UnsupportedVersion,
                format!("Unsupported Tus-Resumable version {}", version),
            )),
            _ => Ok(()),
        }
    }

    fn upload_id(req: &UploadRequest) -> UploadResult<String> {
        req.path_id()
            .ok_or_else(|| UploadError::new(ErrorCode::FileNotFound, "File id cannot be retrieved"))
    }
}

#[async_trait]
impl ProtocolHandler for TusHandler {
    fn name(&self) -> &'static str {
        "tus"
    }

    fn methods(&self) -> &'static [Method] {
        &METHODS
    }

    fn decorate(&self, headers: &mut HeaderMap) {
        headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
        headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
        headers.insert(TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
        headers.insert(
            TUS_MAX_SIZE,
            HeaderValue::from(self.storage.config().max_upload_size),
        );
    }

    async fn options(&self, _req: UploadRequest) -> UploadResult<Reply> {
        Ok(Reply::no_content().header(CONTENT_LENGTH, "0"))
    }

    #[instrument(
        name = "upload.tus.create",
        skip_all,
        fields(upload.id = tracing::field::Empty),
        err
    )]
    async fn post(&self, req: UploadRequest) -> UploadResult<Reply> {
        Self::check_version(&req)?;

        let metadata = req
            .header(UPLOAD_METADATA.as_str())
            .map(decode_metadata)
            .unwrap_or_default();
        let init = FileInit {
            size: req.header_u64(UPLOAD_LENGTH.as_str()),
            user_id: req.user_id.clone(),
            content_type: metadata.get("filetype").cloned(),
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
            None => upload_location(
                &req.headers,
                req.path(),
                req.query(),
                &record.id,
                self.storage.config().use_relative_location,
            ),
        };

        Ok(Reply::new(status)
            .header(LOCATION, location)
            .header(UPLOAD_OFFSET, record.bytes_written.to_string()))
    }

    #[instrument(
        name = "upload.tus.write",
        skip_all,
        fields(upload.id = tracing::field::Empty, upload.offset = tracing::field::Empty),
        err
    )]
    async fn patch(&self, req: UploadRequest) -> UploadResult<Reply> {
        Self::check_version(&req)?;
        let id = Self::upload_id(&req)?;
        tracing::Span::current().record("upload.id", id.as_str());

        let content_type = req
            .header(hyper::header::CONTENT_TYPE.as_str())
            .and_then(|v| v.split(';').next())
            .map(str::trim);
        if content_type != Some(OFFSET_OCTET_STREAM) {
            return Err(UploadError::new(
                ErrorCode::UnsupportedMediaType,
                format!("Content-Type must be {}", OFFSET_OCTET_STREAM),
            ));
        }

        let offset = req
            .header_u64(UPLOAD_OFFSET.as_str())
            .ok_or_else(|| UploadError::bad_request("Missing or invalid Upload-Offset"))?;
        tracing::Span::current().record("upload.offset", offset);

        let content_length = req.header_u64(CONTENT_LENGTH.as_str());
        let user_id = req.user_id.clone();
        let chunk = ChunkWrite::new(id, offset, req.body)
            .with_user(user_id)
            .with_content_length(content_length);

        let record = self.storage.write(chunk).await?;
        if record.is_completed() {
            info!(upload.id = %record.id, size = record.size, "tus upload complete");
        }

        Ok(Reply::no_content().header(UPLOAD_OFFSET, record.bytes_written.to_string()))
    }

    #[instrument(name = "upload.tus.query", skip_all, err)]
    async fn head(&self, req: UploadRequest) -> UploadResult<Reply> {
        Self::check_version(&req)?;
        let id = Self::upload_id(&req)?;

        let record = self
            .storage
            .write(ChunkWrite::query(id).with_user(req.user_id.clone()))
            .await?;

        let mut reply = Reply::new(StatusCode::OK)
            .header(UPLOAD_OFFSET, record.bytes_written.to_string())
            .header(UPLOAD_LENGTH, record.size.to_string())
            .header(CACHE_CONTROL, "no-store");
        if !record.metadata.is_empty() {
            reply = reply.header(UPLOAD_METADATA, encode_metadata(&record.metadata));
        }
        Ok(reply)
    }

    #[instrument(name = "upload.tus.list", skip_all, err)]
    async fn get(&self, req: UploadRequest) -> UploadResult<Reply> {
        Self::check_version(&req)?;
        let selector = Selector {
            id: req.path_id(),
            user_id: req.user_id.clone(),
        };
        let records = self.storage.get(&selector).await?;
        Reply::json(StatusCode::OK, &records)
    }

    #[instrument(name = "upload.tus.delete", skip_all, err)]
    async fn delete(&self, req: UploadRequest) -> UploadResult<Reply> {
        Self::check_version(&req)?;
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
    use crate::config::StorageConfig;
    use crate::storage::DiskStorage;
    use crate::upload::bytes_stream;
    use hyper::Request;

    fn request(method: Method, uri: &str, headers: &[(&str, &str)]) -> UploadRequest {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let (parts, _) = builder.body(()).unwrap().into_parts();
        UploadRequest::new(parts, bytes_stream(""), "/files")
    }

    #[test]
    fn test_check_version() {
        let ok = request(Method::HEAD, "/files/a", &[("tus-resumable", "1.0.0")]);
        assert!(TusHandler::check_version(&ok).is_ok());

        let missing = request(Method::HEAD, "/files/a", &[]);
        assert!(TusHandler::check_version(&missing).is_ok());

        let old = request(Method::HEAD, "/files/a", &[("tus-resumable", "0.2.2")]);
        let err = TusHandler::check_version(&old).unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsupportedVersion);
        assert_eq!(err.status(), StatusCode::PRECONDITION_FAILED);
    }

    #[tokio::test]
    async fn test_decorate_adds_protocol_headers() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            max_upload_size: 1024,
            ..StorageConfig::with_directory(dir.path())
        };
        let handler = TusHandler::new(Arc::new(DiskStorage::new(config).await.unwrap()));

        let mut headers = HeaderMap::new();
        handler.decorate(&mut headers);
        assert_eq!(headers["tus-resumable"], "1.0.0");
        assert_eq!(headers["tus-version"], "1.0.0");
        assert_eq!(headers["tus-extension"], "creation,termination");
        assert_eq!(headers["tus-max-size"], "1024");
    }

    #[tokio::test]
    async fn test_patch_requires_offset_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            DiskStorage::new(StorageConfig::with_directory(dir.path()))
                .await
                .unwrap(),
        );
        let handler = TusHandler::new(storage);

        let req = request(
            Method::PATCH,
            "/files/abc",
            &[("upload-offset", "0"), ("content-type", "text/plain")],
        );
        let err = handler.patch(req).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnsupportedMediaType);

        let req = request(
            Method::PATCH,
            "/files/abc",
            &[("content-type", OFFSET_OCTET_STREAM)],
        );
        let err = handler.patch(req).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadRequest);
    }
}

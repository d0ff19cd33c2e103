//! Protocol handlers
//!
//! A [`ProtocolHandler`] is one resumable-upload state machine. It exposes
//! one hook per HTTP method; the [`Dispatcher`] does method routing,
//! readiness and identity checks, and the error to response conversion.
//! Hooks a protocol does not implement answer `405 Method Not Allowed`.

use crate::error::{ErrorCode, UploadError, UploadResult};
use crate::router::id_from_path;
use crate::upload::{ByteStream, Metadata};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http_body_util::Full;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::http::request::Parts;
use hyper::{Method, Response, StatusCode, Uri};
use serde::Serialize;
use tracing::warn;

pub mod dispatcher;
pub mod tus;
pub mod uploadx;

pub use dispatcher::Dispatcher;
pub use tus::TusHandler;
pub use uploadx::UploadxHandler;

/// Request as seen by a protocol hook
pub struct UploadRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Mount prefix the request was routed under
    pub prefix: String,
    pub user_id: Option<String>,
    pub body: ByteStream,
}

impl UploadRequest {
    pub fn new(parts: Parts, body: ByteStream, prefix: impl Into<String>) -> Self {
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            prefix: prefix.into(),
            user_id: None,
            body,
        }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Header value as trimmed text; `None` when absent or not visible ASCII
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    }

    /// Header parsed as a byte count
    pub fn header_u64(&self, name: &str) -> Option<u64> {
        self.header(name).and_then(|v| v.parse().ok())
    }

    /// Upload id from the path suffix after the mount prefix
    pub fn path_id(&self) -> Option<String> {
        id_from_path(self.path(), &self.prefix)
    }
}

/// Protocol response before it is turned into an HTTP response
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn no_content() -> Self {
        Self::new(StatusCode::NO_CONTENT)
    }

    /// JSON body with the matching content type
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> UploadResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| UploadError::internal(format!("failed to encode response: {}", e)))?;
        Ok(Self::new(status)
            .header(CONTENT_TYPE, "application/json")
            .with_body(body))
    }

    /// Set a header; values that are not valid header text are dropped
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: impl AsRef<str>) -> Self {
        match HeaderValue::from_str(value.as_ref()) {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => warn!(header = %name, "Dropped invalid response header value"),
        }
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// One resumable-upload protocol
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Protocol name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Methods this protocol routes
    fn methods(&self) -> &'static [Method];

    /// Add protocol headers to every response, errors included
    fn decorate(&self, _headers: &mut HeaderMap) {}

    async fn options(&self, _req: UploadRequest) -> UploadResult<Reply> {
        Err(ErrorCode::MethodNotAllowed.into())
    }

    async fn post(&self, _req: UploadRequest) -> UploadResult<Reply> {
        Err(ErrorCode::MethodNotAllowed.into())
    }

    async fn put(&self, _req: UploadRequest) -> UploadResult<Reply> {
        Err(ErrorCode::MethodNotAllowed.into())
    }

    async fn patch(&self, _req: UploadRequest) -> UploadResult<Reply> {
        Err(ErrorCode::MethodNotAllowed.into())
    }

    async fn head(&self, _req: UploadRequest) -> UploadResult<Reply> {
        Err(ErrorCode::MethodNotAllowed.into())
    }

    async fn get(&self, _req: UploadRequest) -> UploadResult<Reply> {
        Err(ErrorCode::MethodNotAllowed.into())
    }

    async fn delete(&self, _req: UploadRequest) -> UploadResult<Reply> {
        Err(ErrorCode::MethodNotAllowed.into())
    }
}

/// Comma separated method list for `Allow` headers
pub fn allow_header(methods: &[Method]) -> String {
    methods
        .iter()
        .map(Method::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Buffer a small request body, rejecting anything over `limit` bytes
pub async fn collect_body(mut body: ByteStream, limit: u64) -> UploadResult<Bytes> {
    let mut buffer = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk =
            chunk.map_err(|e| UploadError::bad_request(format!("Failed to read body: {}", e)))?;
        if (buffer.len() + chunk.len()) as u64 > limit {
            return Err(UploadError::bad_request(format!(
                "Request body exceeds the limit of {} bytes",
                limit
            )));
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(buffer.freeze())
}

/// Parse a JSON object body into metadata.
///
/// An empty body is empty metadata. Non-string values keep their JSON text.
pub fn parse_json_metadata(body: &[u8]) -> UploadResult<Metadata> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Metadata::new());
    }

    let object: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(body)
        .map_err(|e| UploadError::bad_request(format!("Invalid metadata: {}", e)))?;

    Ok(object
        .into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => (key, s),
            other => (key, other.to_string()),
        })
        .collect())
}

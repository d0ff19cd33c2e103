//! Request dispatcher
//!
//! Wraps one [`ProtocolHandler`] mounted under a path prefix. Every request
//! yields exactly one response: failures from any layer go through
//! [`Dispatcher::error_reply`].

use super::{allow_header, ProtocolHandler, Reply, UploadRequest};
use crate::error::{ErrorCode, UploadError, UploadResult};
use crate::identity::{Anonymous, UserIdentity};
use crate::metrics;
use crate::storage::Storage;
use crate::upload::ByteStream;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyStream, Full};
use hyper::body::Body;
use hyper::header::ALLOW;
use hyper::{Method, Request, Response};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Routes requests for one protocol mount
pub struct Dispatcher {
    handler: Arc<dyn ProtocolHandler>,
    storage: Arc<dyn Storage>,
    identity: Arc<dyn UserIdentity>,
    prefix: String,
}

impl Dispatcher {
    pub fn new(
        handler: Arc<dyn ProtocolHandler>,
        storage: Arc<dyn Storage>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            handler,
            storage,
            identity: Arc::new(Anonymous),
            prefix: prefix.into(),
        }
    }

    /// Replace the default anonymous identity hook
    #[must_use]
    pub fn with_identity(mut self, identity: Arc<dyn UserIdentity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn protocol(&self) -> &'static str {
        self.handler.name()
    }

    /// Handle one request
    pub async fn dispatch<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let mut reply = match self.route(req).await {
            Ok(reply) => reply,
            Err(err) => {
                let mut reply = self.error_reply(&err, &method, &path);
                if err.code() == ErrorCode::MethodNotAllowed {
                    reply = reply.header(ALLOW, allow_header(self.handler.methods()));
                }
                reply
            }
        };

        self.handler.decorate(&mut reply.headers);
        reply.into_response()
    }

    async fn route<B>(&self, req: Request<B>) -> UploadResult<Reply>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if !self.storage.is_ready() {
            return Err(ErrorCode::StorageNotReady.into());
        }
        if !self.handler.methods().contains(req.method()) {
            return Err(ErrorCode::MethodNotAllowed.into());
        }
        metrics::record_request(self.handler.name(), req.method().as_str());

        let (parts, body) = req.into_parts();
        let user_id = self.identity.user_id(&parts).await?;
        let request = UploadRequest::new(parts, into_byte_stream(body), self.prefix.as_str())
            .with_user(user_id);

        let handler = &self.handler;
        match request.method.clone() {
            Method::OPTIONS => handler.options(request).await,
            Method::POST => handler.post(request).await,
            Method::PUT => handler.put(request).await,
            Method::PATCH => handler.patch(request).await,
            Method::HEAD => handler.head(request).await,
            Method::GET => handler.get(request).await,
            Method::DELETE => handler.delete(request).await,
            _ => Err(ErrorCode::MethodNotAllowed.into()),
        }
    }

    /// Convert an error into its JSON response and log it
    pub fn error_reply(&self, err: &UploadError, method: &Method, path: &str) -> Reply {
        let code = err.code();
        metrics::record_error(code.as_str());

        if code.is_server_error() {
            error!(
                protocol = self.handler.name(),
                %method,
                path,
                code = %code,
                detail = err.detail(),
                "Request failed"
            );
        } else if code == ErrorCode::FileConflict {
            warn!(
                protocol = self.handler.name(),
                %method,
                path,
                detail = err.detail(),
                "Request rejected"
            );
        } else {
            debug!(
                protocol = self.handler.name(),
                %method,
                path,
                code = %code,
                detail = err.detail(),
                "Request rejected"
            );
        }

        // Serializing the fixed body shape cannot fail
        let body = serde_json::to_vec(&err.body()).unwrap_or_default();
        Reply::new(err.status())
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .with_body(body)
    }
}

/// Adapt an HTTP body into the data-only byte stream storage consumes
pub fn into_byte_stream<B>(body: B) -> ByteStream
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    BodyStream::new(body)
        .map_err(std::io::Error::other)
        .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) })
        .boxed()
}

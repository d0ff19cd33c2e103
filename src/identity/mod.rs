//! User identity extraction
//!
//! The upload core only consumes an opaque user id. A [`UserIdentity`] turns
//! the request head into that id; `Ok(None)` means anonymous.

use crate::config::IdentityConfig;
use crate::error::{UploadError, UploadResult};
use async_trait::async_trait;
use hyper::http::request::Parts;
use std::sync::Arc;

pub mod jwt;

pub use jwt::JwtIdentity;

/// Identity extraction hook
#[async_trait]
pub trait UserIdentity: Send + Sync {
    /// Resolve the requesting user, `None` for anonymous requests
    async fn user_id(&self, parts: &Parts) -> UploadResult<Option<String>>;
}

/// Every request is anonymous
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

#[async_trait]
impl UserIdentity for Anonymous {
    async fn user_id(&self, _parts: &Parts) -> UploadResult<Option<String>> {
        Ok(None)
    }
}

/// Trust a header set by an upstream proxy
#[derive(Debug, Clone)]
pub struct HeaderIdentity {
    header: String,
}

impl HeaderIdentity {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into().to_ascii_lowercase(),
        }
    }
}

#[async_trait]
impl UserIdentity for HeaderIdentity {
    async fn user_id(&self, parts: &Parts) -> UploadResult<Option<String>> {
        let Some(value) = parts.headers.get(self.header.as_str()) else {
            return Ok(None);
        };
        let user = value
            .to_str()
            .map_err(|_| UploadError::bad_request(format!("Invalid {} header", self.header)))?
            .trim();
        Ok((!user.is_empty()).then(|| user.to_string()))
    }
}

/// Build the identity hook described by the configuration.
///
/// JWT takes precedence over a trusted header.
pub fn from_config(config: &IdentityConfig) -> UploadResult<Arc<dyn UserIdentity>> {
    if let Some(jwt) = &config.jwt {
        return Ok(Arc::new(JwtIdentity::from_config(jwt)?));
    }
    if let Some(header) = &config.header {
        return Ok(Arc::new(HeaderIdentity::new(header)));
    }
    Ok(Arc::new(Anonymous))
}

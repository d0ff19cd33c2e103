//! JWT identity
//!
//! Supports HS256, RS256 and ES256. The token subject becomes the upload
//! owner. Requests without a token stay anonymous; a token that fails
//! validation is rejected with `Forbidden`.

use super::UserIdentity;
use crate::config::JwtConfig;
use crate::error::{ErrorCode, UploadError, UploadResult};
use crate::router::parse_query;
use async_trait::async_trait;
use hyper::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// JWT Claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub iat: Option<usize>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
}

/// JWT backed [`UserIdentity`]
///
/// # Example
///
/// ```
/// use resumable_uploadr::identity::JwtIdentity;
///
/// let identity = JwtIdentity::new_hs256("my-secret")
///     .with_issuer("https://auth.example.com")
///     .with_audience("uploads");
/// ```
pub struct JwtIdentity {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtIdentity {
    /// HMAC secret (HS256)
    pub fn new_hs256(secret: &str) -> Self {
        Self::with_key(
            DecodingKey::from_secret(secret.as_bytes()),
            Algorithm::HS256,
        )
    }

    /// RSA public key in PEM form (RS256)
    pub fn new_rs256(public_key_pem: &str) -> UploadResult<Self> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| UploadError::internal(format!("invalid RSA key: {}", e)))?;
        Ok(Self::with_key(key, Algorithm::RS256))
    }

    /// EC P-256 public key in PEM form (ES256)
    pub fn new_es256(public_key_pem: &str) -> UploadResult<Self> {
        let key = DecodingKey::from_ec_pem(public_key_pem.as_bytes())
            .map_err(|e| UploadError::internal(format!("invalid EC key: {}", e)))?;
        Ok(Self::with_key(key, Algorithm::ES256))
    }

    pub fn from_config(config: &JwtConfig) -> UploadResult<Self> {
        let identity = match config.algorithm.to_uppercase().as_str() {
            "HS256" => Self::new_hs256(&config.secret),
            "RS256" => Self::new_rs256(&config.secret)?,
            "ES256" => Self::new_es256(&config.secret)?,
            other => {
                return Err(UploadError::internal(format!(
                    "unsupported JWT algorithm {}",
                    other
                )))
            }
        };

        let identity = match &config.issuer {
            Some(issuer) => identity.with_issuer(issuer),
            None => identity,
        };
        Ok(match &config.audience {
            Some(audience) => identity.with_audience(audience),
            None => identity,
        })
    }

    fn with_key(decoding_key: DecodingKey, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        // Only checked once an audience is configured
        validation.validate_aud = false;

        Self {
            decoding_key,
            validation,
        }
    }

    /// Require this `iss` claim
    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Require this `aud` claim
    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    /// Bearer token from `Authorization`, falling back to the `token` query parameter
    fn extract_token(parts: &Parts) -> Option<String> {
        if let Some(auth) = parts
            .headers
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }

        parse_query(parts.uri.query()).remove("token")
    }
}

#[async_trait]
impl UserIdentity for JwtIdentity {
    async fn user_id(&self, parts: &Parts) -> UploadResult<Option<String>> {
        let Some(token) = Self::extract_token(parts) else {
            return Ok(None);
        };

        let data = decode::<Claims>(&token, &self.decoding_key, &self.validation).map_err(|e| {
            warn!(error = %e, "Rejected JWT");
            let detail = match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => "Token expired",
                jsonwebtoken::errors::ErrorKind::InvalidSignature => "Invalid token signature",
                _ => "Invalid token",
            };
            UploadError::new(ErrorCode::Forbidden, detail)
        })?;

        debug!(subject = %data.claims.sub, "JWT identity resolved");
        Ok(Some(data.claims.sub))
    }
}

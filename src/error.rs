//! Error taxonomy
//!
//! Every failure raised while serving an upload request is an [`UploadError`].
//! The dispatcher turns it into exactly one HTTP response: the status comes
//! from the [`ErrorCode`], the body is `{"error":{"message","code","name"}}`.
//! Server-side codes never echo their detail to the client.

use hyper::StatusCode;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Enumerated failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    BadRequest,
    FileNotFound,
    InvalidFileSize,
    FileConflict,
    Forbidden,
    MethodNotAllowed,
    UnsupportedVersion,
    FileTooLarge,
    UnsupportedMediaType,
    StorageError,
    StorageNotReady,
    InternalServerError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "BadRequest",
            Self::FileNotFound => "FileNotFound",
            Self::InvalidFileSize => "InvalidFileSize",
            Self::FileConflict => "FileConflict",
            Self::Forbidden => "Forbidden",
            Self::MethodNotAllowed => "MethodNotAllowed",
            Self::UnsupportedVersion => "UnsupportedVersion",
            Self::FileTooLarge => "FileTooLarge",
            Self::UnsupportedMediaType => "UnsupportedMediaType",
            Self::StorageError => "StorageError",
            Self::StorageNotReady => "StorageNotReady",
            Self::InternalServerError => "InternalServerError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest | Self::InvalidFileSize => StatusCode::BAD_REQUEST,
            Self::FileNotFound => StatusCode::NOT_FOUND,
            Self::FileConflict => StatusCode::CONFLICT,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::UnsupportedVersion => StatusCode::PRECONDITION_FAILED,
            Self::FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::StorageError | Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::StorageNotReady => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Message sent when the error carries no client-safe detail
    pub fn default_message(&self) -> &'static str {
        match self {
            Self::BadRequest => "Bad request",
            Self::FileNotFound => "Not found",
            Self::InvalidFileSize => "File size cannot be retrieved",
            Self::FileConflict => "Chunk offset does not match the upload offset",
            Self::Forbidden => "Authenticated user is not allowed access",
            Self::MethodNotAllowed => "Method not allowed",
            Self::UnsupportedVersion => "Unsupported protocol version",
            Self::FileTooLarge => "File size limit exceeded",
            Self::UnsupportedMediaType => "Unsupported media type",
            Self::StorageError => "Storage Error",
            Self::StorageNotReady => "Service Unavailable",
            Self::InternalServerError => "Internal Server Error",
        }
    }

    pub fn is_server_error(&self) -> bool {
        self.status().is_server_error()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload errors
#[derive(Error, Debug)]
#[error("{code}: {detail}")]
pub struct UploadError {
    code: ErrorCode,
    detail: String,
}

impl UploadError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, detail)
    }

    pub fn not_found(id: &str) -> Self {
        Self::new(ErrorCode::FileNotFound, format!("Upload not found: {}", id))
    }

    pub fn invalid_size(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidFileSize, detail)
    }

    pub fn conflict(expected: u64, actual: u64) -> Self {
        Self::new(
            ErrorCode::FileConflict,
            format!("Chunk starts at {} but upload offset is {}", actual, expected),
        )
    }

    pub fn forbidden() -> Self {
        Self::new(
            ErrorCode::Forbidden,
            ErrorCode::Forbidden.default_message(),
        )
    }

    pub fn storage(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::StorageError, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalServerError, detail)
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Detail for logs; may contain internal paths
    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }

    /// Message safe to send to the client
    pub fn public_message(&self) -> &str {
        if self.code.is_server_error() || self.detail.is_empty() {
            self.code.default_message()
        } else {
            &self.detail
        }
    }

    /// JSON error body
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: ErrorDetails {
                message: self.public_message().to_string(),
                code: self.code.as_str(),
                name: if self.code.is_server_error() {
                    "ServerError"
                } else {
                    "ClientError"
                },
            },
        }
    }
}

impl From<ErrorCode> for UploadError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code, String::new())
    }
}

impl From<std::io::Error> for UploadError {
    fn from(e: std::io::Error) -> Self {
        Self::storage(e.to_string())
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(e: serde_json::Error) -> Self {
        Self::storage(format!("corrupt upload state: {}", e))
    }
}

/// Serialized error response body
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub message: String,
    pub code: &'static str,
    pub name: &'static str,
}

pub type UploadResult<T> = Result<T, UploadError>;

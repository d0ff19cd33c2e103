//! Resumable Uploadr Library
//!
//! Resumable chunked uploads over HTTP, speaking the tus 1.0.0 protocol and
//! an X-header protocol (`X-Upload-*`, `Content-Range`, `308 Resume Incomplete`).
//!
//! # Features
//!
//! - **Offset reconciliation**: a chunk must start exactly where the upload left off
//! - **Durable progress**: bytes reach disk before the offset advances
//! - **Restart safe**: upload state is recovered from disk
//! - **Pluggable storage**: handlers only talk to the [`storage::Storage`] trait
//! - **Identity hook**: anonymous, trusted header, or JWT
//!
//! # Example
//!
//! ```no_run
//! use resumable_uploadr::{config::Config, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let server = Server::new(config).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod identity;
pub mod metrics;
pub mod router;
pub mod server;
pub mod storage;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use error::{ErrorCode, UploadError, UploadResult};
pub use server::Server;
pub use storage::{DiskStorage, Storage};
pub use upload::{UploadRecord, UploadStatus};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! HTTP server
//!
//! hyper HTTP/1 accept loop. Requests are routed to the protocol mount with
//! the longest matching path prefix; `GET /health` answers `ok`; everything
//! else is `404`.
//!
//! # Example
//!
//! ```no_run
//! use resumable_uploadr::config::Config;
//! use resumable_uploadr::server::Server;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = Config::default();
//! config.server.address = "127.0.0.1:0".to_string();
//! let server = Server::new(config).await?;
//! println!("listening on {}", server.local_addr());
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::Config;
use crate::error::UploadError;
use crate::handler::{Dispatcher, TusHandler, UploadxHandler};
use crate::identity::{self, UserIdentity};
use crate::router::matches_prefix;
use crate::storage::{DiskStorage, Storage};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::cmp::Reverse;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Initialization failed: {0}")]
    InitError(#[from] UploadError),
}

/// Protocol mounts ordered by descending prefix length
struct Mounts {
    dispatchers: Vec<Dispatcher>,
}

impl Mounts {
    fn build(
        config: &Config,
        storage: Arc<dyn Storage>,
        identity: Arc<dyn UserIdentity>,
    ) -> Self {
        let mut dispatchers = Vec::new();

        if config.protocols.tus.enabled {
            dispatchers.push(
                Dispatcher::new(
                    Arc::new(TusHandler::new(storage.clone())),
                    storage.clone(),
                    config.protocols.tus.path_prefix.clone(),
                )
                .with_identity(identity.clone()),
            );
        }
        if config.protocols.uploadx.enabled {
            dispatchers.push(
                Dispatcher::new(
                    Arc::new(UploadxHandler::new(storage.clone())),
                    storage,
                    config.protocols.uploadx.path_prefix.clone(),
                )
                .with_identity(identity),
            );
        }

        dispatchers.sort_by_key(|d| Reverse(d.prefix().trim_end_matches('/').len()));
        Self { dispatchers }
    }

    fn find(&self, path: &str) -> Option<&Dispatcher> {
        self.dispatchers
            .iter()
            .find(|d| matches_prefix(path, d.prefix()))
    }
}

/// Upload server
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    mounts: Arc<Mounts>,
    storage: Arc<dyn Storage>,
}

impl Server {
    /// Open disk storage and bind the configured address; port 0 picks a free port
    pub async fn new(config: Config) -> Result<Self, ServerError> {
        let storage = Arc::new(DiskStorage::new(config.storage.clone()).await?);
        Self::with_storage(config, storage).await
    }

    /// Bind the configured address serving uploads from `storage`
    pub async fn with_storage(
        config: Config,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .server
            .address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address: {}", e)))?;

        let identity = identity::from_config(&config.identity)?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        let mounts = Mounts::build(&config, storage.clone(), identity);
        for dispatcher in &mounts.dispatchers {
            info!(
                protocol = dispatcher.protocol(),
                prefix = dispatcher.prefix(),
                "Mounted upload protocol"
            );
        }
        info!("Server bound to {}", local_addr);

        Ok(Self {
            listener,
            local_addr,
            mounts: Arc::new(mounts),
            storage,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Storage backing every mount, e.g. to subscribe to upload events
    pub fn storage(&self) -> Arc<dyn Storage> {
        self.storage.clone()
    }

    /// Serve until the process exits
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` resolves; in-flight connections keep running
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        info!("Starting upload server on {}", self.local_addr);
        tokio::pin!(shutdown);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down upload server");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let mounts = Arc::clone(&self.mounts);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let mounts = Arc::clone(&mounts);
                    async move { Ok::<_, Infallible>(handle_request(req, &mounts).await) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("Error serving connection from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

async fn handle_request(req: Request<Incoming>, mounts: &Mounts) -> Response<Full<Bytes>> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = if path == "/health" && method == Method::GET {
        text_response(StatusCode::OK, "ok")
    } else {
        match mounts.find(&path) {
            Some(dispatcher) => dispatcher.dispatch(req).await,
            None => text_response(StatusCode::NOT_FOUND, "Not Found"),
        }
    };

    info!(
        %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "Handled request"
    );
    response
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain"),
    );
    response
}

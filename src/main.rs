//! Resumable Uploadr - resumable chunked upload server
//!
//! Serves tus and X-header uploads backed by local disk storage.

use clap::Parser;
use resumable_uploadr::metrics::server::MetricsServer;
use resumable_uploadr::storage::UploadEventKind;
use resumable_uploadr::{config::Config, server::Server};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Resumable Uploadr - tus and X-header resumable upload server
#[derive(Parser, Debug)]
#[command(name = "resumable-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(args.log_level.to_lowercase()))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Resumable Uploadr v{}", resumable_uploadr::VERSION);

    let config = Config::load(&args.config)?;
    info!("Loaded configuration from {:?}", args.config);

    let mut metrics_server = None;
    if config.metrics.enabled {
        let mut server = MetricsServer::bind(&format!("0.0.0.0:{}", config.metrics.port)).await?;
        server.start()?;
        info!("Metrics available on {}", server.local_addr());
        metrics_server = Some(server);
    }

    let server = Server::new(config).await?;

    let mut events = server.storage().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.kind == UploadEventKind::Completed => info!(
                    upload.id = %event.record.id,
                    size = event.record.size,
                    content_type = %event.record.content_type,
                    "Upload completed"
                ),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Upload event listener lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    if let Some(mut server) = metrics_server {
        server.shutdown().await;
    }

    Ok(())
}

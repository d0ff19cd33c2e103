//! Metrics Server Tests
//!
//! Scrapes the Prometheus endpoint over HTTP.

use reqwest::StatusCode;
use resumable_uploadr::metrics;
use resumable_uploadr::metrics::server::MetricsServer;

async fn start() -> (MetricsServer, String) {
    let mut server = MetricsServer::bind("127.0.0.1:0").await.unwrap();
    server.start().unwrap();
    let base = format!("http://{}", server.local_addr());
    (server, base)
}

/// Test: /metrics exposes upload counters in text format
#[tokio::test]
async fn test_metrics_endpoint() {
    let (mut server, base) = start().await;

    metrics::record_upload_event("created");
    metrics::record_chunk_write(1024, 0.01, true);
    metrics::record_offset_conflict();
    metrics::record_request("tus", "PATCH");
    metrics::record_error("FileConflict");

    let resp = reqwest::get(format!("{}/metrics", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = resp.text().await.unwrap();
    assert!(body.contains("uploadr_uploads_total"));
    assert!(body.contains("uploadr_upload_bytes_total"));
    assert!(body.contains("uploadr_chunk_write_duration_seconds"));
    assert!(body.contains("uploadr_offset_conflicts_total"));
    assert!(body.contains("uploadr_requests_total"));
    assert!(body.contains("uploadr_errors_total"));

    server.shutdown().await;
}

/// Test: health and unknown routes
#[tokio::test]
async fn test_health_and_not_found() {
    let (mut server, base) = start().await;

    let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");

    let resp = reqwest::get(format!("{}/files", base)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    server.shutdown().await;
}

/// Test: only GET is served
#[tokio::test]
async fn test_post_not_allowed() {
    let (mut server, base) = start().await;

    let resp = reqwest::Client::new()
        .post(format!("{}/metrics", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    server.shutdown().await;
}

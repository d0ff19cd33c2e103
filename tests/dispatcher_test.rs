//! Dispatcher Tests
//!
//! Uses a mocked storage backend to check what the dispatcher does around
//! the protocol hooks: readiness gating, method filtering, identity and
//! error mapping.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response, StatusCode};
use mockall::mock;
use resumable_uploadr::config::StorageConfig;
use resumable_uploadr::error::{UploadError, UploadResult};
use resumable_uploadr::handler::{Dispatcher, TusHandler, UploadxHandler};
use resumable_uploadr::identity::{HeaderIdentity, JwtIdentity};
use resumable_uploadr::storage::{Storage, UploadEvent};
use resumable_uploadr::upload::{ChunkWrite, FileInit, FilePatch, Selector, UploadRecord};
use std::sync::Arc;
use tokio::sync::broadcast;

mock! {
    pub Store {}

    #[async_trait]
    impl Storage for Store {
        fn config(&self) -> &StorageConfig;
        fn is_ready(&self) -> bool;
        fn subscribe(&self) -> broadcast::Receiver<UploadEvent>;
        async fn create(&self, init: FileInit) -> UploadResult<UploadRecord>;
        async fn write(&self, chunk: ChunkWrite) -> UploadResult<UploadRecord>;
        async fn update(&self, id: &str, patch: FilePatch) -> UploadResult<UploadRecord>;
        async fn get(&self, selector: &Selector) -> UploadResult<Vec<UploadRecord>>;
        async fn delete(&self, selector: &Selector) -> UploadResult<Vec<UploadRecord>>;
    }
}

/// Mock that is ready and reports default limits
fn ready_store() -> MockStore {
    let mut store = MockStore::new();
    store.expect_config().return_const(StorageConfig::default());
    store.expect_is_ready().return_const(true);
    store
}

fn tus(store: MockStore) -> Dispatcher {
    let storage: Arc<dyn Storage> = Arc::new(store);
    Dispatcher::new(Arc::new(TusHandler::new(storage.clone())), storage, "/files")
}

fn uploadx(store: MockStore) -> Dispatcher {
    let storage: Arc<dyn Storage> = Arc::new(store);
    Dispatcher::new(
        Arc::new(UploadxHandler::new(storage.clone())),
        storage,
        "/upload",
    )
}

fn request(method: Method, uri: &str, headers: &[(&str, &str)]) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Full::new(Bytes::new())).unwrap()
}

async fn body_json(resp: Response<Full<Bytes>>) -> serde_json::Value {
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

fn record(size: u64, written: u64) -> UploadRecord {
    let mut record = UploadRecord::new("3f2a9c", size, &FileInit::default());
    record.advance_to(written);
    record
}

/// Test: requests are refused until storage is ready
#[tokio::test]
async fn test_not_ready_is_503() {
    let mut store = MockStore::new();
    store.expect_config().return_const(StorageConfig::default());
    store.expect_is_ready().return_const(false);
    store.expect_create().never();

    let resp = tus(store)
        .dispatch(request(Method::POST, "/files", &[("upload-length", "10")]))
        .await;

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(resp.headers().contains_key("tus-resumable"));
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "StorageNotReady");
    assert_eq!(body["error"]["name"], "ServerError");
}

/// Test: unsupported methods never reach storage
#[tokio::test]
async fn test_method_not_allowed_has_allow_header() {
    let mut store = ready_store();
    store.expect_write().never();

    let resp = uploadx(store)
        .dispatch(request(Method::HEAD, "/upload?upload_id=abc", &[]))
        .await;

    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    let allow = resp.headers().get("allow").unwrap().to_str().unwrap();
    assert_eq!(allow, "OPTIONS, POST, PUT, PATCH, DELETE, GET");
}

/// Test: storage failures become a generic 500
#[tokio::test]
async fn test_storage_error_hides_detail() {
    let mut store = ready_store();
    store
        .expect_create()
        .times(1)
        .returning(|_| Err(UploadError::storage("write /srv/uploads/abc failed: EIO")));

    let resp = tus(store)
        .dispatch(request(Method::POST, "/files", &[("upload-length", "10")]))
        .await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "StorageError");
    assert_eq!(body["error"]["message"], "Storage Error");
    assert_eq!(body["error"]["name"], "ServerError");
    assert!(!body.to_string().contains("/srv/uploads"));
}

/// Test: conflicts keep protocol headers and the conflict detail
#[tokio::test]
async fn test_conflict_maps_to_409() {
    let mut store = ready_store();
    store
        .expect_write()
        .times(1)
        .returning(|_| Err(UploadError::conflict(40, 0)));

    let resp = tus(store)
        .dispatch(request(
            Method::PATCH,
            "/files/3f2a9c",
            &[
                ("content-type", "application/offset+octet-stream"),
                ("upload-offset", "0"),
            ],
        ))
        .await;

    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(resp.headers().get("tus-resumable").unwrap(), "1.0.0");
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "FileConflict");
    assert_eq!(body["error"]["name"], "ClientError");
}

/// Test: the PATCH offset reaches storage as the chunk start
#[tokio::test]
async fn test_patch_passes_offset_and_length() {
    let mut store = ready_store();
    store
        .expect_write()
        .withf(|chunk| {
            chunk.id == "3f2a9c" && chunk.start == Some(60) && chunk.content_length == Some(40)
        })
        .times(1)
        .returning(|_| Ok(record(100, 100)));

    let resp = tus(store)
        .dispatch(request(
            Method::PATCH,
            "/files/3f2a9c",
            &[
                ("content-type", "application/offset+octet-stream"),
                ("upload-offset", "60"),
                ("content-length", "40"),
            ],
        ))
        .await;

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert_eq!(resp.headers().get("upload-offset").unwrap(), "100");
}

/// Test: header identity is handed to storage as the owner
#[tokio::test]
async fn test_header_identity_sets_owner() {
    let mut store = ready_store();
    store
        .expect_create()
        .withf(|init| init.user_id.as_deref() == Some("alice") && init.size == Some(10))
        .times(1)
        .returning(|_| Ok(record(10, 0)));

    let dispatcher = tus(store).with_identity(Arc::new(HeaderIdentity::new("X-User-Id")));
    let resp = dispatcher
        .dispatch(request(
            Method::POST,
            "/files",
            &[("upload-length", "10"), ("x-user-id", "alice")],
        ))
        .await;

    assert_eq!(resp.status(), StatusCode::CREATED);
}

/// Test: an invalid bearer token is rejected before storage
#[tokio::test]
async fn test_invalid_jwt_is_forbidden() {
    let mut store = ready_store();
    store.expect_create().never();

    let dispatcher = tus(store).with_identity(Arc::new(JwtIdentity::new_hs256("secret")));
    let resp = dispatcher
        .dispatch(request(
            Method::POST,
            "/files",
            &[
                ("upload-length", "10"),
                ("authorization", "Bearer not-a-token"),
            ],
        ))
        .await;

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(resp).await["error"]["code"], "Forbidden");
}

/// Test: an external upload URI replaces the generated Location
#[tokio::test]
async fn test_external_upload_uri_is_location() {
    let mut store = ready_store();
    store.expect_create().times(1).returning(|_| {
        let mut record = record(10, 0);
        record.upload_uri = Some("https://bucket.example.com/session/77".into());
        Ok(record)
    });

    let resp = uploadx(store)
        .dispatch(request(
            Method::POST,
            "/upload",
            &[("x-upload-content-length", "10"), ("host", "localhost")],
        ))
        .await;

    assert_eq!(resp.status(), StatusCode::CREATED);
    assert_eq!(
        resp.headers().get("location").unwrap(),
        "https://bucket.example.com/session/77"
    );
}

//! Transport-contract tests against the real router.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use recall_proto::{ORIGINAL_SIZE_HEADER, SYNC_HEADER};
use recall_server::{routes, ServerConfig, ServerState};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

fn test_app() -> (axum::Router, Arc<ServerState>, TempDir) {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig::new(dir.path().join("data"));
    let state = Arc::new(ServerState::new(config).unwrap());
    (routes::router(Arc::clone(&state)), state, dir)
}

fn compress(value: &Value) -> Vec<u8> {
    let raw = serde_json::to_vec(value).unwrap();
    zstd::stream::encode_all(std::io::Cursor::new(raw), 0).unwrap()
}

fn sync_header(key: &str) -> String {
    json!({"v": 11, "k": key, "c": "anki,2.1.60 (abcdef12),linux", "s": "host-1"}).to_string()
}

async fn post(
    app: &axum::Router,
    path: &str,
    header: Option<String>,
    body: Vec<u8>,
) -> (StatusCode, Vec<u8>, Option<String>) {
    let mut builder = Request::builder().method("POST").uri(path);
    if let Some(header) = header {
        builder = builder.header(SYNC_HEADER, header);
    }
    let response = app
        .clone()
        .oneshot(builder.body(Body::from(body)).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let original_size = response
        .headers()
        .get(ORIGINAL_SIZE_HEADER)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, bytes, original_size)
}

fn decompress(bytes: &[u8]) -> Value {
    let raw = zstd::stream::decode_all(std::io::Cursor::new(bytes)).unwrap();
    serde_json::from_slice(&raw).unwrap()
}

#[tokio::test]
async fn discovery_probe_gets_expected_auth() {
    let (app, _state, _dir) = test_app();
    // Empty body, no session key: the client wants its login dialog.
    let (status, body, _) = post(&app, "/sync/hostKey", None, Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, b"expected auth".to_vec());
}

#[tokio::test]
async fn bad_credentials_are_forbidden() {
    let (app, _state, _dir) = test_app();
    // The accept-all gateway still refuses an empty username.
    let body = compress(&json!({"u": "", "p": "pw"}));
    let (status, _, _) = post(&app, "/sync/hostKey", Some(sync_header("")), body).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_operation_is_bad_request() {
    let (app, _state, _dir) = test_app();
    let (status, _, _) = post(&app, "/sync/frobnicate", None, Vec::new()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_session_key_is_forbidden() {
    let (app, _state, _dir) = test_app();
    let body = compress(&json!({"v": 11, "cv": ""}));
    let (status, _, _) = post(&app, "/sync/meta", Some(sync_header("deadbeef")), body).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn login_then_meta_round_trip() {
    let (app, _state, _dir) = test_app();

    let body = compress(&json!({"u": "alice", "p": "whatever"}));
    let (status, body, original_size) =
        post(&app, "/sync/hostKey", Some(sync_header("")), body).await;
    assert_eq!(status, StatusCode::OK);
    assert!(original_size.is_some());
    let login = decompress(&body);
    let key = login["key"].as_str().unwrap().to_string();
    assert_eq!(key.len(), 32);
    assert_eq!(login["host"], json!("host-1"));

    let body = compress(&json!({"v": 11, "cv": "anki,2.1.60 (abcdef12),linux"}));
    let (status, body, original_size) =
        post(&app, "/sync/meta", Some(sync_header(&key)), body).await;
    assert_eq!(status, StatusCode::OK);

    // The compressed body advertises its uncompressed size.
    let raw = zstd::stream::decode_all(std::io::Cursor::new(body.as_slice())).unwrap();
    assert_eq!(original_size.unwrap(), raw.len().to_string());

    let meta: Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(meta["cont"], json!(true));
    assert_eq!(meta["empty"], json!(true));
    assert_eq!(meta["uname"], json!("alice"));
    assert_eq!(meta["hostNum"], json!(0));
    assert!(meta["usn"].is_i64());
}

#[tokio::test]
async fn malformed_zstd_body_is_bad_request() {
    let (app, _state, _dir) = test_app();

    let login = compress(&json!({"u": "alice", "p": "pw"}));
    let (_, body, _) = post(&app, "/sync/hostKey", Some(sync_header("")), login).await;
    let key = decompress(&body)["key"].as_str().unwrap().to_string();

    // A v11 client must send zstd; raw JSON is a compression error.
    let (status, _, _) = post(
        &app,
        "/sync/meta",
        Some(sync_header(&key)),
        br#"{"v":11}"#.to_vec(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sessions_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    let key = {
        let config = ServerConfig::new(dir.path().join("data"));
        let state = Arc::new(ServerState::new(config).unwrap());
        let app = routes::router(Arc::clone(&state));
        let body = compress(&json!({"u": "alice", "p": "pw"}));
        let (_, body, _) = post(&app, "/sync/hostKey", Some(sync_header("")), body).await;
        state.store.close_all();
        decompress(&body)["key"].as_str().unwrap().to_string()
    };

    // A fresh state over the same data root accepts the old key.
    let config = ServerConfig::new(dir.path().join("data"));
    let state = Arc::new(ServerState::new(config).unwrap());
    let app = routes::router(state);
    let body = compress(&json!({"v": 11, "cv": ""}));
    let (status, _, _) = post(&app, "/sync/meta", Some(sync_header(&key)), body).await;
    assert_eq!(status, StatusCode::OK);
}

//! HTTP surface

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

use larder_common::config::PipelineConfig;
use larder_common::events::EventBus;
use larder_ingest::db::init_database_pool;
use larder_ingest::{build_router, AppState, Pipeline};

async fn app(temp_dir: &TempDir) -> (axum::Router, Arc<Pipeline>) {
    let mut config = PipelineConfig::default();
    config.database_path = temp_dir.path().join("api.db");
    config.gate.retry_delay_ms = 10;
    config.gate.max_attempts = 200;

    let pool = init_database_pool(&config.database_path).await.unwrap();
    let pipeline = Arc::new(Pipeline::start(&config, pool, EventBus::new(256)).unwrap());
    (build_router(AppState::new(pipeline.clone())), pipeline)
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _pipeline) = app(&temp_dir).await;

    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "larder-ingest");
    assert_eq!(body["tracked_notes"], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_import_then_status() {
    let temp_dir = TempDir::new().unwrap();
    let (app, pipeline) = app(&temp_dir).await;

    let request = Request::builder()
        .method("POST")
        .uri("/notes/N1/import")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "lines": ["1 cup flour", "2 eggs"] }).to_string(),
        ))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["noteId"], "N1");
    assert_eq!(body["totalUnits"], 2);

    tokio::time::timeout(Duration::from_secs(10), pipeline.pool.wait_idle())
        .await
        .unwrap();

    let (status, body) = send(&app, get("/notes/N1/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stage"]["status"], "completed");
    assert_eq!(body["savedUnits"], 2);
    assert_eq!(body["progress"]["isComplete"], false);
}

#[tokio::test]
async fn test_unknown_note_is_404() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _pipeline) = app(&temp_dir).await;

    let (status, body) = send(&app, get("/notes/ghost/status")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_malformed_import_body_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let (app, _pipeline) = app(&temp_dir).await;

    let request = Request::builder()
        .method("POST")
        .uri("/notes/N1/import")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"ingredients": []}"#))
        .unwrap();
    let (status, _) = send(&app, request).await;

    assert!(status.is_client_error());
}

#[tokio::test]
async fn test_cache_stats_and_invalidation() {
    let temp_dir = TempDir::new().unwrap();
    let (app, pipeline) = app(&temp_dir).await;
    pipeline
        .parser
        .parse("1 cup flour", &Default::default())
        .await;

    let (status, body) = send(&app, get("/cache/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["misses"], 1);
    assert_eq!(body["shared_keys"], 1);

    let delete = |uri: &str| {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    };

    let (status, _) = send(&app, delete("/cache")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, delete("/cache?prefix=parse:")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], 1);
}

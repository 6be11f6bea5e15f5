//! API endpoint integration tests

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use beacon_wake::{ApiServerBuilder, StreamingPipelineDispatcher, WakeWordDetector};
use tower::ServiceExt;

mod common;
use common::{MissingLoader, detector_config, peak_detector, quick_dispatcher};

/// Build a test API router
fn build_test_router(
    detector: Arc<WakeWordDetector>,
    dispatcher: Arc<StreamingPipelineDispatcher>,
) -> axum::Router {
    ApiServerBuilder::new(detector, dispatcher).build().router()
}

async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = build_test_router(peak_detector(), quick_dispatcher());

    let (status, json) = get_json(app, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_ready_endpoint() {
    let app = build_test_router(peak_detector(), quick_dispatcher());

    let (status, json) = get_json(app, "/ready").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["checks"]["detector"]["status"], "ok");
    assert_eq!(json["checks"]["pipeline"]["status"], "ok");
}

#[tokio::test]
async fn test_ready_without_providers_is_still_ready() {
    let dispatcher = Arc::new(StreamingPipelineDispatcher::builder().build());
    let app = build_test_router(peak_detector(), dispatcher);

    let (status, json) = get_json(app, "/ready").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["checks"]["pipeline"]["status"], "unavailable");
}

#[tokio::test]
async fn test_ready_fails_when_models_missing() {
    let detector = Arc::new(WakeWordDetector::with_loader(detector_config(), MissingLoader));
    let app = build_test_router(detector, quick_dispatcher());

    let (status, json) = get_json(app, "/ready").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["checks"]["detector"]["status"], "fail");
    assert!(
        json["checks"]["detector"]["message"]
            .as_str()
            .unwrap()
            .contains("model file not found")
    );
}

#[tokio::test]
async fn test_websocket_route_requires_upgrade() {
    let app = build_test_router(peak_detector(), quick_dispatcher());

    let response = app
        .oneshot(Request::builder().uri("/ws/listen").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let app = build_test_router(peak_detector(), quick_dispatcher());

    let response = app
        .oneshot(Request::builder().uri("/api/admin/sessions").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

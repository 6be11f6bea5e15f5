//! Health check endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde::Serialize;

use super::ApiState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Detailed readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
}

/// Individual readiness checks
#[derive(Serialize)]
pub struct ReadinessChecks {
    pub detector: CheckResult,
    pub pipeline: CheckResult,
}

/// Result of a single health check
#[derive(Serialize)]
pub struct CheckResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    const fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            status: "fail",
            message: Some(message.into()),
        }
    }

    fn unavailable() -> Self {
        Self {
            status: "unavailable",
            message: Some("not configured".to_string()),
        }
    }
}

/// Liveness probe - is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe - can a connection detect wake words right now?
///
/// A missing pipeline provider is reported but does not fail readiness,
/// since the wake word stream works without one.
async fn ready(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let detector_check = check_detector(&state).await;
    let pipeline_check = check_pipeline(&state);

    let ready = detector_check.status == "ok";
    let status = if ready { "ok" } else { "degraded" };
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(ReadinessResponse {
            status,
            checks: ReadinessChecks {
                detector: detector_check,
                pipeline: pipeline_check,
            },
        }),
    )
}

async fn check_detector(state: &ApiState) -> CheckResult {
    let detector = Arc::clone(&state.detector);
    // First call may load model assets from disk
    let loaded = tokio::task::spawn_blocking(move || detector.load().map(|_| ())).await;

    match loaded {
        Ok(Ok(())) => CheckResult::ok(),
        Ok(Err(e)) => CheckResult::fail(e.to_string()),
        Err(e) => CheckResult::fail(format!("detector check panicked: {e}")),
    }
}

fn check_pipeline(state: &ApiState) -> CheckResult {
    if state.dispatcher.is_configured() {
        CheckResult::ok()
    } else {
        CheckResult::unavailable()
    }
}

/// Liveness route
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Readiness route
pub fn ready_router(state: Arc<ApiState>) -> Router {
    Router::new().route("/ready", get(ready)).with_state(state)
}

//! Health check routes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::api::server::AppState;
use crate::manager::{HealthReport, HealthStatus};

/// Create the health router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/collectors", get(collectors_health))
}

/// Liveness: the process is up and serving.
async fn health_check() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct CollectorsHealthResponse {
    version: &'static str,
    uptime_secs: u64,
    #[serde(flatten)]
    report: HealthReport,
}

/// Per-collector health. Answers 503 when every collector that ran is
/// unhealthy.
async fn collectors_health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.manager.health_snapshot();
    let status = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let response = CollectorsHealthResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        report,
    };
    (status, Json(response))
}

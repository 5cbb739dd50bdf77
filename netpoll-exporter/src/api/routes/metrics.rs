//! Prometheus scrape endpoint.

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Router, routing::get};

use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics))
}

/// Render the registry as it is now. Series are never expired here.
async fn metrics(State(state): State<AppState>) -> Response {
    match state.exporter.export() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, state.exporter.content_type())],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

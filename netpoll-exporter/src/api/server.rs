//! API server setup and configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::Request;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::Span;

use crate::api::routes;
use crate::config::Settings;
use crate::manager::CollectorManager;
use crate::metrics::PrometheusExporter;
use crate::{Error, Result};

/// API server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
}

impl ApiServerConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            bind_address: settings.http_bind_address.clone(),
            port: settings.http_port,
        }
    }

    fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e| Error::config(format!("Invalid HTTP address: {}", e)))
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server start time for uptime calculation
    pub start_time: Instant,
    pub exporter: PrometheusExporter,
    pub manager: Arc<CollectorManager>,
}

impl AppState {
    pub fn new(exporter: PrometheusExporter, manager: Arc<CollectorManager>) -> Self {
        Self {
            start_time: Instant::now(),
            exporter,
            manager,
        }
    }
}

/// HTTP server exposing `/metrics` and the health endpoints.
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
    cancel_token: CancellationToken,
}

impl ApiServer {
    /// The server stops when `cancel_token` is cancelled.
    pub fn new(config: ApiServerConfig, state: AppState, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            state,
            cancel_token,
        }
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .merge(routes::metrics::router())
            .nest("/health", routes::health::router())
            .with_state(self.state.clone())
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|req: &Request| {
                        // Scrapes and probes would drown everything else.
                        let path = req.uri().path();
                        if path == "/metrics" || path.starts_with("/health") {
                            Span::none()
                        } else {
                            tracing::info_span!("http_request", method = %req.method(), uri = %req.uri())
                        }
                    })
                    .on_response(
                        |res: &axum::http::Response<_>, latency: Duration, span: &Span| {
                            if span.is_disabled() {
                                return;
                            }
                            tracing::debug!(
                                status = res.status().as_u16(),
                                latency_ms = latency.as_millis() as u64,
                                "Request finished"
                            );
                        },
                    ),
            )
    }

    /// Serve until the cancel token fires.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.socket_addr()?;
        let router = self.build_router();
        let listener = TcpListener::bind(addr).await?;

        tracing::info!("Metrics server listening on http://{}", addr);

        let cancel_token = self.cancel_token.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel_token.cancelled().await;
                tracing::info!("Metrics server shutting down...");
            })
            .await?;

        Ok(())
    }
}

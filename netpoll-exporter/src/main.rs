use std::sync::Arc;

use anyhow::Context;
use netpoll_exporter::api::{ApiServer, ApiServerConfig, AppState};
use netpoll_exporter::client::{ApiClient, HttpApiClient};
use netpoll_exporter::collector::builtin;
use netpoll_exporter::config::Settings;
use netpoll_exporter::logging;
use netpoll_exporter::manager::CollectorManager;
use netpoll_exporter::metrics::{MetricsRegistry, PrometheusExporter, SchedulingMetrics};
use netpoll_exporter::scheduler::Application;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let settings = Arc::new(Settings::from_env().context("loading settings")?);
    let _log_guard = logging::init_logging(&settings).context("initializing logging")?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        api = %settings.api_base_url,
        "Starting netpoll-exporter"
    );

    let metrics = Arc::new(MetricsRegistry::new(settings.metrics_namespace.clone()));
    let scheduling = SchedulingMetrics::register(&metrics)?;
    let client: Arc<dyn ApiClient> = Arc::new(HttpApiClient::new(&settings)?);

    let manager = Arc::new(CollectorManager::new(
        &builtin::registry(),
        client,
        settings.clone(),
        metrics.clone(),
        scheduling,
    ));

    let shutdown = CancellationToken::new();
    let server = ApiServer::new(
        ApiServerConfig::from_settings(&settings),
        AppState::new(PrometheusExporter::new(&metrics), manager.clone()),
        shutdown.clone(),
    );
    let server_token = shutdown.clone();
    let server_task = tokio::spawn(async move {
        let result = server.run().await;
        if result.is_err() {
            server_token.cancel();
        }
        result
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received");
        signal_token.cancel();
    });

    let mut app = Application::new(manager, shutdown.clone());
    app.start().await;

    // Shutdown comes from the signal handler, the server failing or a tier
    // loop giving up.
    shutdown.cancelled().await;
    let report = app.shutdown().await;
    if !report.all_graceful() {
        tracing::warn!(?report, "Some tier loops did not stop gracefully");
    }

    server_task
        .await
        .context("metrics server task")?
        .context("metrics server")?;

    tracing::info!("netpoll-exporter stopped");
    Ok(())
}

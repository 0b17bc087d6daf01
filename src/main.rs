use anyhow::{Context, Result};
use batchgate::api::{start_api_server, AppState};
use batchgate::batch_store::PgBatchStore;
use batchgate::blob_store::S3BlobStore;
use batchgate::config::Config;
use batchgate::dispatcher::Dispatcher;
use batchgate::expected::StaticResolver;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting batch gate service");

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let batch_store = Arc::new(
        PgBatchStore::new(&config.database)
            .await
            .context("Failed to initialize batch state store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        batch_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_store = Arc::new(
        S3BlobStore::new(&config.blob)
            .await
            .context("Failed to initialize blob store")?,
    );

    let resolver = Arc::new(StaticResolver::new(
        config.batch.expected_file_types.clone(),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        batch_store,
        blob_store,
        resolver,
        &config.batch,
    ));

    let api_state = AppState {
        dispatcher: dispatcher.clone(),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Batch gate service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down batch gate service");

    api_handle.abort();
    // let in-flight batch instances finish their current step
    dispatcher.join_all().await;

    info!("Batch gate service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

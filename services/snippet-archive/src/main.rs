use anyhow::{Context, Result};
use snippet_archive::api::{start_api_server, AppState};
use snippet_archive::blob_store::S3BlobStore;
use snippet_archive::config::Config;
use snippet_archive::snippet_store::{PgSnippetStore, SnippetRepository};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Snippet Archive Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Initialize components
    let snippet_store = PgSnippetStore::new(&config.database)
        .await
        .context("Failed to initialize snippet store")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        snippet_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_store = S3BlobStore::new(&config.s3)
        .await
        .context("Failed to initialize S3 blob store")?;

    let api_state = AppState::new(
        Arc::new(blob_store),
        SnippetRepository::new(Arc::new(snippet_store)),
        &config.uploads,
    );

    let shutdown = CancellationToken::new();

    // Spawn API server task
    let api_config = config.api.clone();
    let server_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, server_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Snippet archive service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down snippet archive service");

    // Let in-flight uploads finish
    shutdown.cancel();
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    info!("Snippet archive service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

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
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

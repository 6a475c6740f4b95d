use anyhow::{Context, Result};
use frame_queue::{
    start_api_server, ActiveTables, AgentAuth, AppState, Clock, Config, FrameQueue, QueueSettings,
    RefreshCommands, SystemClock,
};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Tablespy Frame Queue"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let queue = Arc::new(FrameQueue::with_clock(
        QueueSettings::from(&config.queue),
        clock.clone(),
    ));

    let active_tables = Arc::new(
        ActiveTables::load(config.active_tables_path(), clock.clone())
            .context("Failed to initialize active table state")?,
    );

    let refresh = Arc::new(
        RefreshCommands::load(config.refresh_command_path(), clock)
            .context("Failed to initialize refresh command state")?,
    );

    if AgentAuth::new(config.api.agent_key.clone()).is_open() {
        warn!("No agent key configured, agent routes are unauthenticated");
    }

    info!(
        capacity = config.queue.capacity,
        state_dir = %config.state.dir.display(),
        address = %config.api_addr(),
        "Frame queue configured"
    );

    let api_state = AppState {
        queue,
        active_tables,
        refresh,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Frame queue started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down frame queue");

    api_handle.abort();

    info!("Frame queue stopped");

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
    metrics_exporter_prometheus::PrometheusBuilder::new()
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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

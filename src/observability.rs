//! Observability for masterswitch.
//!
//! Provides logging initialization and a Prometheus metrics endpoint.

use crate::config::ObservabilityConfig;
use crate::error::{RecoveryError, Result};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| RecoveryError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| RecoveryError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics server.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let builder = PrometheusBuilder::new();

    let handle = builder
        .install_recorder()
        .map_err(|e| RecoveryError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();

    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| RecoveryError::Internal(e.to_string()))?;

    Ok(())
}

/// Register the recovery metrics so they render with zero values before
/// the first recovery.
fn register_metrics() {
    counter!("recover.dead_master.start").absolute(0);
    counter!("recover.dead_master.success").absolute(0);
    counter!("recover.dead_master.fail").absolute(0);
    counter!("recover.dead_intermediate_master.start").absolute(0);
    counter!("recover.dead_intermediate_master.success").absolute(0);
    counter!("recover.dead_intermediate_master.fail").absolute(0);
    counter!("recover.dead_co_master.start").absolute(0);
    counter!("recover.dead_co_master.success").absolute(0);
    counter!("recover.dead_co_master.fail").absolute(0);
    gauge!("recover.pending").set(0.0);
}

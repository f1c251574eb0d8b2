//! Logging and metrics exporter setup.

use crate::config::{LogFormat, LoggingConfig, MetricsConfig};
use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,tasklane=debug";

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured filter.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER)));

    let registry = tracing_subscriber::registry().with(filter);
    match config.format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
    }
    .context("Failed to install tracing subscriber")
}

/// Starts the Prometheus scrape endpoint and describes the job metrics.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", config.listen_addr))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    tasklane_jobs::register_metrics();

    info!(addr = %addr, "Metrics exporter listening");
    Ok(())
}

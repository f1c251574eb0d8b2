//! Worker process configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tasklane_jobs::{ConsumeOptions, QueueConfig};

/// Root configuration of a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Deployment environment, used to pick `config/{environment}.toml`.
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Drivers, default driver and tracking.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Consume defaults for `work`.
    #[serde(default)]
    pub worker: WorkerSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            queue: QueueConfig::default(),
            worker: WorkerSettings::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_environment() -> String {
    "development".to_string()
}

/// Defaults applied to `work` before command-line flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Driver to consume; the queue's default driver when unset.
    #[serde(default)]
    pub driver: Option<String>,

    /// Queue to consume; the driver's configured queue when unset.
    #[serde(default)]
    pub queue: Option<String>,

    /// Sleep between empty polls in milliseconds.
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,

    /// Jobs reserved per poll.
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Attempt budget.
    #[serde(default)]
    pub attempts: Option<u32>,
}

impl WorkerSettings {
    pub fn consume_options(&self) -> ConsumeOptions {
        ConsumeOptions {
            queue: self.queue.clone(),
            poll_interval: self.poll_interval_ms.map(Duration::from_millis),
            batch_size: self.batch_size,
            attempts: self.attempts,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Filter used when `RUST_LOG` is unset.
    #[serde(default)]
    pub filter: Option<String>,
}

/// Prometheus exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Address of the scrape endpoint.
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9000".to_string()
}

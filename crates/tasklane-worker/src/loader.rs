//! Configuration loader with layered sources.

use crate::config::WorkerConfig;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use std::path::Path;
use tracing::debug;

/// Loads [`WorkerConfig`] from a config directory and the environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_dir: String,
}

impl ConfigLoader {
    /// Creates a loader reading from `config_dir`.
    ///
    /// Sources, later ones winning:
    /// 1. `{config_dir}/default.toml`
    /// 2. `{config_dir}/{environment}.toml`
    /// 3. `{config_dir}/local.toml`
    /// 4. Environment variables with the `TASKLANE__` prefix
    ///
    /// The environment name comes from `TASKLANE_ENVIRONMENT`.
    pub fn new(config_dir: impl Into<String>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Loader for `./config`.
    pub fn from_default_location() -> Self {
        Self::new("./config")
    }

    /// Reads and validates the configuration.
    pub fn load(&self) -> Result<WorkerConfig> {
        if let Err(e) = dotenvy::dotenv() {
            debug!("No .env file loaded: {}", e);
        }
        let environment = std::env::var("TASKLANE_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
        self.load_for(&environment)
    }

    /// Reads the configuration for a named environment.
    pub fn load_for(&self, environment: &str) -> Result<WorkerConfig> {
        let mut builder = Config::builder().set_default("environment", environment)?;

        for name in ["default", environment, "local"] {
            let path = format!("{}/{}.toml", self.config_dir, name);
            if Path::new(&path).exists() {
                debug!("Loading config from: {}", path);
                builder = builder.add_source(File::with_name(&path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKLANE")
                .separator("__")
                .try_parsing(true),
        );

        let config: WorkerConfig = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.queue.validate()?;
        Ok(config)
    }
}

//! Tasklane Worker - worker process and operator commands.
//!
//! Applications embed [`run`] in their own binary with the registry of job
//! types they handle:
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = JobRegistry::new();
//!     registry.register::<SendEmailJob>();
//!     tasklane_worker::run(Arc::new(registry)).await
//! }
//! ```

pub mod cli;
pub mod config;
pub mod loader;
pub mod telemetry;
pub mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use std::sync::Arc;
use tasklane_jobs::{ExecutionContext, JobResolver, Queue};
use tracing::info;

pub use config::WorkerConfig;
pub use loader::ConfigLoader;
pub use worker::{shutdown_signal, Worker};

/// Parses the command line and runs the selected command.
pub async fn run(resolver: Arc<dyn JobResolver>) -> Result<()> {
    run_with(Cli::parse(), resolver).await
}

/// Runs an already parsed command line.
pub async fn run_with(cli: Cli, resolver: Arc<dyn JobResolver>) -> Result<()> {
    let config = ConfigLoader::new(&cli.config_dir).load()?;
    telemetry::init_logging(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        default_driver = %config.queue.default,
        "Starting tasklane worker"
    );

    if config.metrics.enabled {
        telemetry::init_metrics(&config.metrics)?;
    }

    let queue = Queue::from_config(&config.queue, resolver)
        .await
        .context("Failed to initialize queue")?;
    let command = execute(cli.command, &config, Arc::new(queue));

    if cli.sync {
        ExecutionContext::sync(command).await
    } else {
        command.await
    }
}

async fn execute(command: Command, config: &WorkerConfig, queue: Arc<Queue>) -> Result<()> {
    match command {
        Command::Work(args) => {
            let options = config.worker.consume_options().merge(&args.consume_options());
            let driver = args.target.driver.or_else(|| config.worker.driver.clone());
            Worker::new(queue)
                .with_driver(driver)
                .with_options(options)
                .run()
                .await?;
        }
        Command::Retry(args) => {
            let moved = queue.retry(args.driver.as_deref(), &args.consume_options()).await?;
            info!(moved, "Moved failed jobs back to pending");
            println!("{moved}");
        }
        Command::Stats { queue: name } => {
            let stats = queue.job_stats(name.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

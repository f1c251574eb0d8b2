//! Long-running consumer with graceful shutdown.

use std::future::Future;
use std::sync::Arc;
use tasklane_jobs::{ConsumeOptions, JobResult, Queue};
use tokio::signal;
use tracing::{error, info, warn};

/// Runs one driver's consume loop until told to stop.
pub struct Worker {
    queue: Arc<Queue>,
    driver: Option<String>,
    options: ConsumeOptions,
}

impl Worker {
    pub fn new(queue: Arc<Queue>) -> Self {
        Self {
            queue,
            driver: None,
            options: ConsumeOptions::default(),
        }
    }

    /// Consumes from `driver` instead of the queue's default.
    pub fn with_driver(mut self, driver: Option<String>) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_options(mut self, options: ConsumeOptions) -> Self {
        self.options = options;
        self
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> JobResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs until `shutdown` resolves or the consume loop fails.
    ///
    /// A job still executing when `shutdown` fires is dropped at its next
    /// await point.
    pub async fn run_until<F>(&self, shutdown: F) -> JobResult<()>
    where
        F: Future<Output = ()>,
    {
        let driver = self.driver.as_deref().unwrap_or(self.queue.default_driver());
        info!(driver = %driver, queue = ?self.options.queue, "Worker started");

        tokio::select! {
            result = self.queue.consume(self.driver.as_deref(), &self.options) => {
                if let Err(e) = &result {
                    error!(driver = %driver, error = %e, "Worker stopped with error");
                }
                result
            }
            () = shutdown => {
                let interrupted = self.queue.get_active_jobs().len();
                if interrupted > 0 {
                    warn!(interrupted, "Stopping with jobs still running");
                }
                info!(driver = %driver, "Worker stopped");
                Ok(())
            }
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down worker...");
        }
        () = terminate => {
            info!("Received terminate signal, shutting down worker...");
        }
    }
}

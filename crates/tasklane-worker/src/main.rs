//! Stand-alone worker binary.
//!
//! Knows no job types, so it serves `retry` and `stats`. Applications that
//! run `work` embed [`tasklane_worker::run`] with their own registry.

use std::sync::Arc;
use tasklane_jobs::JobRegistry;

#[tokio::main]
async fn main() {
    if let Err(e) = tasklane_worker::run(Arc::new(JobRegistry::new())).await {
        eprintln!("Application error: {:#}", e);
        std::process::exit(1);
    }
}

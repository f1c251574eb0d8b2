//! Shared jobs and stores for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sqlx::any::AnyPoolOptions;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasklane_jobs::{
    Cancellable, Job, JobContext, JobError, JobExecutor, JobRegistry, JobResult, JobStateManager, SqlRecordStore,
};

/// Counts successful runs per test through a shared counter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CountJob {
    pub label: String,
}

pub static COUNT_RUNS: AtomicUsize = AtomicUsize::new(0);

#[async_trait]
impl Job for CountJob {
    const NAME: &'static str = "count";

    async fn handle(&self, _ctx: &JobContext) -> JobResult<()> {
        COUNT_RUNS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Always fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokenJob {
    pub reason: String,
}

#[async_trait]
impl Job for BrokenJob {
    const NAME: &'static str = "broken";

    async fn handle(&self, _ctx: &JobContext) -> JobResult<()> {
        Err(JobError::ExecutionFailed(self.reason.clone()))
    }
}

/// Long-running job that polls for cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptJob {
    pub receipt_id: String,
    pub steps: u32,
}

#[async_trait]
impl Job for ReceiptJob {
    const NAME: &'static str = "receipt";

    async fn handle(&self, ctx: &JobContext) -> JobResult<()> {
        for _ in 0..self.steps {
            ctx.check_cancelled()?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(())
    }

    fn cancellable(&self) -> Option<&dyn Cancellable> {
        Some(self)
    }
}

impl Cancellable for ReceiptJob {
    fn cancellation_context(&self) -> Map<String, Value> {
        let mut context = Map::new();
        context.insert("receipt_id".into(), json!(self.receipt_id));
        context
    }
}

pub fn registry() -> Arc<JobRegistry> {
    let registry = JobRegistry::new();
    registry
        .register::<CountJob>()
        .register::<BrokenJob>()
        .register::<ReceiptJob>();
    Arc::new(registry)
}

pub fn executor() -> JobExecutor {
    JobExecutor::new(registry(), Arc::new(JobStateManager::new()))
}

/// In-memory SQLite store with the jobs and failed jobs tables.
pub async fn sqlite_store() -> SqlRecordStore {
    sqlx::any::install_default_drivers();
    let pool = AnyPoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open sqlite");

    sqlx::query(
        "CREATE TABLE job (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id TEXT,
            name TEXT,
            payload TEXT,
            queue TEXT,
            attempts INTEGER,
            available_at TEXT,
            reserved_at TEXT,
            status TEXT,
            started_at TEXT,
            completed_at TEXT,
            cancelled_at TEXT,
            metadata TEXT,
            job_class TEXT,
            entity_id TEXT,
            created_at TEXT
        )",
    )
    .execute(&pool)
    .await
    .expect("Failed to create job table");

    sqlx::query(
        "CREATE TABLE failed_job (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            driver TEXT,
            queue TEXT,
            name TEXT,
            connection TEXT,
            payload TEXT,
            exception TEXT,
            created_at TEXT,
            failed_at TEXT
        )",
    )
    .execute(&pool)
    .await
    .expect("Failed to create failed_job table");

    SqlRecordStore::new(pool, "sqlite::memory:")
}

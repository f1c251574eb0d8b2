//! Database driver: jobs are rows polled from a table.
//!
//! Reservation is optimistic. Selected rows are marked `processing` before
//! any of them runs, which narrows but does not close the window in which two
//! workers polling the same table pick up the same row. Handlers must be
//! idempotent, or the table must have a single consumer.

use super::{ConsumeOptions, DispatchOptions, Driver, When};
use crate::config::{format_timestamp, parse_tz, DatabaseDriverConfig};
use crate::envelope::{Envelope, QueuedJob};
use crate::error::JobResult;
use crate::executor::{Execution, ExecutionReport, JobExecutor, Outcome};
use crate::job::{JobId, JobStatus};
use crate::metrics::JobMetrics;
use crate::store::{Op, Query, RecordStore, Row};
use crate::tracker::{job_stats, merge_metadata, JobStats};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

const NAME: &str = "database";

/// Driver storing envelopes as rows of a jobs table.
pub struct DatabaseDriver {
    store: Arc<dyn RecordStore>,
    config: DatabaseDriverConfig,
    executor: JobExecutor,
    tz: FixedOffset,
}

impl DatabaseDriver {
    /// Creates a driver over `store`.
    pub fn new(store: Arc<dyn RecordStore>, config: DatabaseDriverConfig, executor: JobExecutor) -> JobResult<Self> {
        let tz = parse_tz(&config.tz)?;
        Ok(Self {
            store,
            config,
            executor,
            tz,
        })
    }

    fn timestamp(&self, at: DateTime<Utc>) -> String {
        format_timestamp(at, self.tz)
    }

    fn now(&self) -> String {
        self.timestamp(Utc::now())
    }

    /// Counts rows of the jobs table per status.
    pub async fn stats(&self, queue: Option<&str>) -> JobResult<JobStats> {
        job_stats(self.store.as_ref(), &self.config.table, queue).await
    }

    async fn insert(&self, job: QueuedJob, queue: &str, available_at: DateTime<Utc>) -> JobResult<JobId> {
        let envelope = job.into_envelope(queue, available_at);

        let mut row = Row::new();
        row.insert("job_id".into(), json!(envelope.job_id));
        row.insert("name".into(), json!(envelope.display_name()));
        row.insert("payload".into(), json!(envelope.encode()?));
        row.insert("queue".into(), json!(queue));
        row.insert("attempts".into(), json!(0));
        row.insert("available_at".into(), json!(self.timestamp(available_at)));
        row.insert("reserved_at".into(), Value::Null);
        row.insert("status".into(), json!(JobStatus::Pending.as_str()));
        row.insert("created_at".into(), json!(self.now()));

        let id = self.store.create(&self.config.table, row).await?;
        debug!(job_id = %envelope.job_id, record_id = id, queue, "Enqueued job");
        Ok(envelope.job_id)
    }

    /// Reserves and runs one batch of due rows. Returns how many ran.
    ///
    /// A row whose bookkeeping fails is put back to pending and the rest of
    /// the batch still runs.
    pub async fn process_batch(&self, options: &ConsumeOptions) -> JobResult<usize> {
        let queue = options.queue.as_deref().unwrap_or(&self.config.queue);
        let batch_size = options.batch_size.unwrap_or(self.config.batch_size);
        let max_attempts = options.attempts.unwrap_or(self.config.attempts);
        let now = self.now();

        let due = Query::table(&self.config.table)
            .eq("queue", queue)
            .filter("available_at", Op::Le, now.clone())
            .eq("status", JobStatus::Pending.as_str())
            .order_by("id")
            .limit(batch_size);
        let mut rows = self.store.get(&due).await?;
        if rows.len() < batch_size {
            rows.extend(self.stale_rows(queue, batch_size - rows.len()).await?);
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let mut reserved = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(id) = row.get("id").and_then(Value::as_i64) else {
                warn!(table = %self.config.table, "Skipping job row without id");
                continue;
            };
            let mut changes = Row::new();
            changes.insert("reserved_at".into(), json!(now));
            changes.insert("status".into(), json!(JobStatus::Processing.as_str()));
            changes.insert("started_at".into(), json!(now));
            match self.store.update(&self.by_id(id), changes).await {
                Ok(_) => reserved.push((id, row)),
                Err(e) => warn!(record_id = id, error = %e, "Failed to reserve job row"),
            }
        }

        let count = reserved.len();
        for (id, row) in reserved {
            if let Err(e) = self.process_row(id, &row, max_attempts).await {
                warn!(record_id = id, error = %e, "Failed to settle job row, returning it to pending");
                self.unreserve(id).await;
            }
        }
        Ok(count)
    }

    /// Rows left in `processing` longer than the reservation timeout.
    async fn stale_rows(&self, queue: &str, limit: usize) -> JobResult<Vec<Row>> {
        let Some(timeout) = self.config.reservation_timeout() else {
            return Ok(Vec::new());
        };
        let Some(cutoff) = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| Utc::now().checked_sub_signed(t))
        else {
            return Ok(Vec::new());
        };

        let stale = Query::table(&self.config.table)
            .eq("queue", queue)
            .eq("status", JobStatus::Processing.as_str())
            .filter("reserved_at", Op::Le, self.timestamp(cutoff))
            .order_by("id")
            .limit(limit);
        let rows = self.store.get(&stale).await?;
        if !rows.is_empty() {
            warn!(queue, count = rows.len(), "Reclaiming job rows whose reservation expired");
        }
        Ok(rows)
    }

    async fn unreserve(&self, id: i64) {
        let mut changes = Row::new();
        changes.insert("status".into(), json!(JobStatus::Pending.as_str()));
        changes.insert("reserved_at".into(), Value::Null);
        if let Err(e) = self.store.update(&self.by_id(id), changes).await {
            warn!(record_id = id, error = %e, "Failed to return job row to pending");
        }
    }

    fn by_id(&self, id: i64) -> Query {
        Query::table(&self.config.table).eq("id", id)
    }

    async fn process_row(&self, id: i64, row: &Row, max_attempts: u32) -> JobResult<()> {
        let payload = row.get("payload").and_then(Value::as_str).unwrap_or_default();
        let attempts = row
            .get("attempts")
            .and_then(Value::as_u64)
            .and_then(|a| u32::try_from(a).ok())
            .unwrap_or(0);

        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(record_id = id, error = %e, "Dropping undecodable job row");
                JobMetrics::job_dropped(NAME);
                return self.discard(id, row, &e.to_string()).await;
            }
        };

        let exec = Execution { driver: NAME, attempts };
        let report = self.executor.execute(&envelope, exec).await;
        let duration_ms = u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX);

        match &report.outcome {
            Outcome::Completed => {
                info!(record_id = id, job_id = %envelope.job_id, duration_ms, "Job successfully processed");
                self.store.delete(&self.by_id(id)).await?;
            }
            Outcome::Cancelled { reason } => {
                info!(record_id = id, job_id = %envelope.job_id, reason = %reason, duration_ms, "Job was cancelled");
                self.mark_cancelled(id, row, &report, reason).await?;
            }
            Outcome::Failed { error } => {
                if self.config.failed_table.is_some() {
                    self.discard(id, row, error).await?;
                } else {
                    self.release(id, row, attempts, max_attempts, &report, error).await?;
                }
            }
        }
        Ok(())
    }

    /// Keeps a cancelled row as the record of the cancellation.
    async fn mark_cancelled(&self, id: i64, row: &Row, report: &ExecutionReport, reason: &str) -> JobResult<()> {
        let mut changes = Row::new();
        changes.insert("status".into(), json!(JobStatus::Cancelled.as_str()));
        changes.insert("cancelled_at".into(), json!(self.now()));
        changes.insert("reserved_at".into(), Value::Null);
        changes.insert("metadata".into(), json!(report_metadata(row, report, "cancel_reason", reason)));
        if let Some(job_class) = &report.job_class {
            changes.insert("job_class".into(), json!(job_class));
        }
        self.store.update(&self.by_id(id), changes).await?;
        Ok(())
    }

    /// Puts a failed row back to pending with one more attempt recorded.
    async fn release(
        &self,
        id: i64,
        row: &Row,
        attempts: u32,
        max_attempts: u32,
        report: &ExecutionReport,
        error: &str,
    ) -> JobResult<()> {
        let attempts = attempts.saturating_add(1);
        if attempts >= max_attempts {
            warn!(
                record_id = id,
                attempts,
                max_attempts,
                "Job exhausted its attempts but no failed table is configured; it stays queued"
            );
        }

        let mut changes = Row::new();
        changes.insert("attempts".into(), json!(attempts));
        changes.insert("status".into(), json!(JobStatus::Pending.as_str()));
        changes.insert("reserved_at".into(), Value::Null);
        changes.insert("metadata".into(), json!(report_metadata(row, report, "error", error)));
        if let Some(job_class) = &report.job_class {
            changes.insert("job_class".into(), json!(job_class));
        }
        self.store.update(&self.by_id(id), changes).await?;
        Ok(())
    }

    /// Moves a row to the failed table when one is configured, else deletes it.
    async fn discard(&self, id: i64, row: &Row, error: &str) -> JobResult<()> {
        if let Some(failed_table) = &self.config.failed_table {
            let now = self.now();
            let mut failed = Row::new();
            failed.insert("driver".into(), json!(NAME));
            failed.insert("queue".into(), row.get("queue").cloned().unwrap_or(Value::Null));
            failed.insert("name".into(), row.get("name").cloned().unwrap_or(Value::Null));
            failed.insert("connection".into(), json!(self.config.connection));
            failed.insert("created_at".into(), json!(now));
            failed.insert("exception".into(), json!(error));
            failed.insert("payload".into(), row.get("payload").cloned().unwrap_or(Value::Null));
            failed.insert("failed_at".into(), json!(now));
            self.store.create(failed_table, failed).await?;
            debug!(record_id = id, table = %failed_table, "Moved job to failed table");
        }
        self.store.delete(&self.by_id(id)).await?;
        Ok(())
    }

    async fn consume_loop(&self, options: &ConsumeOptions, poll_interval: Duration) -> JobResult<()> {
        info!("Database consumer started");
        loop {
            tokio::time::sleep(poll_interval).await;
            match self.process_batch(options).await {
                Ok(0) => debug!("No available jobs"),
                Ok(count) => debug!(count, "Processed job batch"),
                Err(e) => warn!(error = %e, "Database poll failed"),
            }
        }
    }
}

/// Row metadata with `key: value` and the job's cancellation context merged in.
fn report_metadata(row: &Row, report: &ExecutionReport, key: &str, value: &str) -> String {
    let metadata = merge_metadata(Some(row), key, value);
    if report.context.is_empty() {
        return metadata;
    }
    let mut map: serde_json::Map<String, Value> = serde_json::from_str(&metadata).unwrap_or_default();
    map.insert("context".into(), Value::Object(report.context.clone()));
    Value::Object(map).to_string()
}

#[async_trait]
impl Driver for DatabaseDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn push(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>> {
        let available_at = options.delay.unwrap_or_default().resolve(Utc::now());
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let queue = options.queue_for(&job, &self.config.queue).to_string();
            ids.push(self.insert(job, &queue, available_at).await?);
            JobMetrics::jobs_pushed(NAME, &queue, 1);
        }
        Ok(ids)
    }

    async fn consume(&self, options: &ConsumeOptions) -> JobResult<()> {
        let queue = options.queue.clone().unwrap_or_else(|| self.config.queue.clone());
        let poll_interval = options.poll_interval.unwrap_or_else(|| self.config.poll_interval());
        let span = tracing::info_span!("consume", driver = NAME, queue = %queue, table = %self.config.table);
        self.consume_loop(options, poll_interval).instrument(span).await
    }

    async fn retry(&self, options: &ConsumeOptions) -> JobResult<u64> {
        let Some(failed_table) = &self.config.failed_table else {
            info!("No failed table configured, nothing to retry");
            return Ok(0);
        };
        let queue = options.queue.as_deref().unwrap_or(&self.config.queue);

        let failed = self
            .store
            .get(&Query::table(failed_table).eq("queue", queue).order_by("id"))
            .await?;
        if failed.is_empty() {
            info!(queue, "No failed jobs found");
            return Ok(0);
        }

        let mut moved = 0u64;
        for row in failed {
            let Some(id) = row.get("id").and_then(Value::as_i64) else {
                continue;
            };
            let payload = row.get("payload").cloned().unwrap_or(Value::Null);
            let job_id = payload
                .as_str()
                .and_then(|p| Envelope::decode(p).ok())
                .map_or(Value::Null, |e| json!(e.job_id));

            let now = self.now();
            let mut pending = Row::new();
            pending.insert("job_id".into(), job_id);
            pending.insert("name".into(), row.get("name").cloned().unwrap_or(Value::Null));
            pending.insert("payload".into(), payload);
            pending.insert("queue".into(), json!(queue));
            pending.insert("attempts".into(), json!(0));
            pending.insert("available_at".into(), json!(now));
            pending.insert("reserved_at".into(), Value::Null);
            pending.insert("status".into(), json!(JobStatus::Pending.as_str()));
            pending.insert("created_at".into(), json!(now));
            self.store.create(&self.config.table, pending).await?;

            self.store.delete(&Query::table(failed_table).eq("id", id)).await?;
            moved += 1;
        }

        info!(queue, count = moved, "Added failed jobs back to the queue");
        JobMetrics::jobs_retried(NAME, queue, moved);
        Ok(moved)
    }

    /// Pushes job N with an extra N second delay, approximating order.
    async fn chain(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>> {
        let base = options.delay.unwrap_or_default().resolve(Utc::now());
        let mut ids = Vec::with_capacity(jobs.len());
        for (step, job) in (0i64..).zip(jobs) {
            let at = base + chrono::Duration::seconds(step);
            ids.extend(self.push(vec![job], &options.clone().delay(When::At(at))).await?);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::job::{Job, JobContext};
    use crate::registry::JobRegistry;
    use crate::state::JobStateManager;
    use crate::store::MemoryRecordStore;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Serialize, Deserialize)]
    struct Invoice {
        fail: bool,
        #[serde(default)]
        cancel: bool,
    }

    /// Memory store whose first `failing_deletes` deletes fail.
    struct FlakyStore {
        inner: Arc<MemoryRecordStore>,
        failing_deletes: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for FlakyStore {
        async fn get(&self, query: &Query) -> JobResult<Vec<Row>> {
            self.inner.get(query).await
        }

        async fn create(&self, table: &str, row: Row) -> JobResult<i64> {
            self.inner.create(table, row).await
        }

        async fn update(&self, query: &Query, changes: Row) -> JobResult<u64> {
            self.inner.update(query, changes).await
        }

        async fn delete(&self, query: &Query) -> JobResult<u64> {
            let fail = self
                .failing_deletes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(JobError::Store("transient delete failure".into()));
            }
            self.inner.delete(query).await
        }
    }

    #[async_trait]
    impl Job for Invoice {
        const NAME: &'static str = "invoice";

        async fn handle(&self, _ctx: &JobContext) -> JobResult<()> {
            if self.cancel {
                return Err(JobError::cancelled("invoice voided"));
            }
            if self.fail {
                return Err(JobError::ExecutionFailed("ledger closed".into()));
            }
            Ok(())
        }
    }

    fn config(failed_table: Option<&str>) -> DatabaseDriverConfig {
        let mut config = DatabaseDriverConfig::new("sqlite::memory:");
        config.failed_table = failed_table.map(str::to_string);
        config.attempts = 2;
        config
    }

    fn executor() -> JobExecutor {
        let registry = JobRegistry::new();
        registry.register::<Invoice>();
        JobExecutor::new(Arc::new(registry), Arc::new(JobStateManager::new()))
    }

    fn driver(failed_table: Option<&str>) -> (Arc<MemoryRecordStore>, DatabaseDriver) {
        let store = Arc::new(MemoryRecordStore::new());
        let driver = DatabaseDriver::new(store.clone(), config(failed_table), executor()).unwrap();
        (store, driver)
    }

    fn job(fail: bool) -> QueuedJob {
        QueuedJob::new(&Invoice { fail, cancel: false }).unwrap()
    }

    fn stuck_row(reserved_at: &str) -> Row {
        let mut row = Row::new();
        row.insert("payload".into(), json!(job(false).into_envelope("default", Utc::now()).encode().unwrap()));
        row.insert("queue".into(), json!("default"));
        row.insert("attempts".into(), json!(0));
        row.insert("available_at".into(), json!("2000-01-01 00:00:00"));
        row.insert("reserved_at".into(), json!(reserved_at));
        row.insert("status".into(), json!("processing"));
        row
    }

    #[tokio::test]
    async fn test_push_writes_pending_row() {
        let (store, driver) = driver(None);
        let ids = driver.push(vec![job(false)], &DispatchOptions::default()).await.unwrap();

        let rows = store.rows("job");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], json!("pending"));
        assert_eq!(rows[0]["attempts"], json!(0));
        assert_eq!(rows[0]["job_id"], json!(ids[0]));
        assert_eq!(rows[0]["name"], json!("invoice"));
    }

    #[tokio::test]
    async fn test_success_deletes_row() {
        let (store, driver) = driver(None);
        driver
            .push(vec![job(false), job(false)], &DispatchOptions::default())
            .await
            .unwrap();

        let ran = driver.process_batch(&ConsumeOptions::default()).await.unwrap();

        assert_eq!(ran, 2);
        assert!(store.rows("job").is_empty());
    }

    #[tokio::test]
    async fn test_delayed_rows_are_not_selected() {
        let (store, driver) = driver(None);
        driver
            .schedule(job(false), When::In(Duration::from_secs(3600)), &DispatchOptions::default())
            .await
            .unwrap();

        assert_eq!(driver.process_batch(&ConsumeOptions::default()).await.unwrap(), 0);
        assert_eq!(store.rows("job").len(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_limits_selection() {
        let (store, driver) = driver(None);
        driver
            .push((0..5).map(|_| job(false)).collect(), &DispatchOptions::default())
            .await
            .unwrap();

        let options = ConsumeOptions {
            batch_size: Some(3),
            ..ConsumeOptions::default()
        };
        assert_eq!(driver.process_batch(&options).await.unwrap(), 3);
        assert_eq!(store.rows("job").len(), 2);
    }

    #[tokio::test]
    async fn test_failure_without_failed_table_increments_attempts() {
        let (store, driver) = driver(None);
        driver.push(vec![job(true)], &DispatchOptions::default()).await.unwrap();

        driver.process_batch(&ConsumeOptions::default()).await.unwrap();
        driver.process_batch(&ConsumeOptions::default()).await.unwrap();
        driver.process_batch(&ConsumeOptions::default()).await.unwrap();

        let rows = store.rows("job");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["attempts"], json!(3));
        assert_eq!(rows[0]["status"], json!("pending"));
        assert_eq!(rows[0]["reserved_at"], Value::Null);
        assert!(rows[0]["metadata"].as_str().unwrap().contains("ledger closed"));
    }

    #[tokio::test]
    async fn test_failure_with_failed_table_is_terminal() {
        let (store, driver) = driver(Some("failed_job"));
        driver.push(vec![job(true)], &DispatchOptions::default()).await.unwrap();

        driver.process_batch(&ConsumeOptions::default()).await.unwrap();

        assert!(store.rows("job").is_empty());
        let failed = store.rows("failed_job");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["driver"], json!("database"));
        assert!(failed[0]["exception"].as_str().unwrap().contains("ledger closed"));
    }

    #[tokio::test]
    async fn test_retry_moves_failed_rows_back() {
        let (store, driver) = driver(Some("failed_job"));
        let ids = driver.push(vec![job(true)], &DispatchOptions::default()).await.unwrap();
        driver.process_batch(&ConsumeOptions::default()).await.unwrap();

        let moved = driver.retry(&ConsumeOptions::default()).await.unwrap();

        assert_eq!(moved, 1);
        assert!(store.rows("failed_job").is_empty());
        let rows = store.rows("job");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["attempts"], json!(0));
        assert_eq!(rows[0]["job_id"], json!(ids[0]));
    }

    #[tokio::test]
    async fn test_retry_without_failed_table() {
        let (_, driver) = driver(None);
        assert_eq!(driver.retry(&ConsumeOptions::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_row_is_removed() {
        let (store, driver) = driver(Some("failed_job"));
        let mut row = Row::new();
        row.insert("payload".into(), json!("not base64!"));
        row.insert("queue".into(), json!("default"));
        row.insert("attempts".into(), json!(0));
        row.insert("available_at".into(), json!("2000-01-01 00:00:00"));
        row.insert("status".into(), json!("pending"));
        store.create("job", row).await.unwrap();

        assert_eq!(driver.process_batch(&ConsumeOptions::default()).await.unwrap(), 1);
        assert!(store.rows("job").is_empty());
        assert_eq!(store.rows("failed_job").len(), 1);
    }

    #[tokio::test]
    async fn test_chain_staggers_available_at() {
        let (store, driver) = driver(None);
        driver
            .chain(vec![job(false), job(false), job(false)], &DispatchOptions::default())
            .await
            .unwrap();

        let times: Vec<String> = store
            .rows("job")
            .iter()
            .map(|r| r["available_at"].as_str().unwrap().to_string())
            .collect();
        assert!(times[0] < times[1]);
        assert!(times[1] < times[2]);
    }

    #[tokio::test]
    async fn test_stats_counts_by_status() {
        let (_, driver) = driver(None);
        driver
            .push(vec![job(false), job(false)], &DispatchOptions::on_queue("billing"))
            .await
            .unwrap();

        let stats = driver.stats(Some("billing")).await.unwrap();
        assert_eq!(stats.pending_jobs, 2);
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(driver.stats(Some("other")).await.unwrap().total_jobs, 0);
    }

    #[tokio::test]
    async fn test_store_failure_does_not_strand_rest_of_batch() {
        let memory = Arc::new(MemoryRecordStore::new());
        let store = Arc::new(FlakyStore {
            inner: memory.clone(),
            failing_deletes: AtomicUsize::new(1),
        });
        let driver = DatabaseDriver::new(store, config(None), executor()).unwrap();
        driver
            .push(vec![job(false), job(false)], &DispatchOptions::default())
            .await
            .unwrap();

        assert_eq!(driver.process_batch(&ConsumeOptions::default()).await.unwrap(), 2);

        let rows = memory.rows("job");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["status"], json!("pending"));
        assert_eq!(rows[0]["reserved_at"], Value::Null);

        assert_eq!(driver.process_batch(&ConsumeOptions::default()).await.unwrap(), 1);
        assert!(memory.rows("job").is_empty());
    }

    #[tokio::test]
    async fn test_expired_reservation_is_reclaimed() {
        let (store, driver) = driver(None);
        store.create("job", stuck_row("2000-01-01 00:00:00")).await.unwrap();

        assert_eq!(driver.process_batch(&ConsumeOptions::default()).await.unwrap(), 1);
        assert!(store.rows("job").is_empty());
    }

    #[tokio::test]
    async fn test_live_reservation_is_left_alone() {
        let (store, driver) = driver(None);
        let reserved_at = format_timestamp(Utc::now(), parse_tz("UTC").unwrap());
        store.create("job", stuck_row(&reserved_at)).await.unwrap();

        assert_eq!(driver.process_batch(&ConsumeOptions::default()).await.unwrap(), 0);
        assert_eq!(store.rows("job")[0]["status"], json!("processing"));
    }

    #[tokio::test]
    async fn test_cancelled_row_is_kept_with_reason() {
        let (store, driver) = driver(Some("failed_job"));
        driver
            .push(
                vec![QueuedJob::new(&Invoice { fail: false, cancel: true }).unwrap()],
                &DispatchOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(driver.process_batch(&ConsumeOptions::default()).await.unwrap(), 1);

        let rows = store.rows("job");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], json!("cancelled"));
        assert!(rows[0]["cancelled_at"].is_string());
        assert_eq!(rows[0]["reserved_at"], Value::Null);
        let metadata: Value = serde_json::from_str(rows[0]["metadata"].as_str().unwrap()).unwrap();
        assert_eq!(metadata["cancel_reason"], json!("invoice voided"));
        assert!(store.rows("failed_job").is_empty());

        assert_eq!(driver.process_batch(&ConsumeOptions::default()).await.unwrap(), 0);
        assert_eq!(driver.stats(None).await.unwrap().cancelled_jobs, 1);
    }
}

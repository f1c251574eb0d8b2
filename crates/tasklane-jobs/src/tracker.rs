//! Durable job status history.
//!
//! The tracker writes one row per execution to a history table. Write
//! failures are logged and never reach the job.
//!
//! The table is also how a job is cancelled from another process: a row
//! flipped to `cancelled` is seen by the running job the next time it calls
//! [`JobContext::validate_or_cancel`](crate::job::JobContext::validate_or_cancel).
//! Starting a job for an entity supersedes older pending or processing jobs
//! of the same type for that entity.

use crate::config::{format_timestamp, parse_tz, TrackingConfig};
use crate::envelope::Envelope;
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobStatus};
use crate::store::{Op, Query, RecordStore, Row};
use chrono::{FixedOffset, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Job counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending_jobs: u64,
    pub processing_jobs: u64,
    pub completed_jobs: u64,
    pub cancelled_jobs: u64,
    pub failed_jobs: u64,
    pub total_jobs: u64,
}

impl JobStats {
    fn set(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending_jobs = count,
            JobStatus::Processing => self.processing_jobs = count,
            JobStatus::Completed => self.completed_jobs = count,
            JobStatus::Cancelled => self.cancelled_jobs = count,
            JobStatus::Failed => self.failed_jobs = count,
        }
        self.total_jobs = self.pending_jobs
            + self.processing_jobs
            + self.completed_jobs
            + self.cancelled_jobs
            + self.failed_jobs;
    }
}

/// Counts rows of `table` per status, optionally for one queue.
pub async fn job_stats(store: &dyn RecordStore, table: &str, queue: Option<&str>) -> JobResult<JobStats> {
    let mut stats = JobStats::default();
    for status in JobStatus::all() {
        let mut query = Query::table(table).eq("status", status.as_str());
        if let Some(queue) = queue {
            query = query.eq("queue", queue);
        }
        stats.set(status, store.count(&query).await?);
    }
    Ok(stats)
}

/// Records job lifecycle transitions in a record store.
pub struct JobTracker {
    store: Arc<dyn RecordStore>,
    config: TrackingConfig,
    tz: FixedOffset,
    enabled: AtomicBool,
}

impl JobTracker {
    /// Creates a tracker; `config.enabled` sets the initial state.
    pub fn new(store: Arc<dyn RecordStore>, config: TrackingConfig) -> JobResult<Self> {
        let tz = parse_tz(&config.tz)?;
        let enabled = AtomicBool::new(config.enabled);
        Ok(Self {
            store,
            config,
            tz,
            enabled,
        })
    }

    /// Returns true if transitions are recorded.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Turns recording on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    fn now(&self) -> String {
        format_timestamp(Utc::now(), self.tz)
    }

    /// Records a job entering `processing`. Returns the history row ID.
    ///
    /// With an `entity_id`, older live jobs of the same type for that entity
    /// are cancelled first.
    pub async fn track_job_started(
        &self,
        envelope: &Envelope,
        driver: &str,
        attempts: u32,
        context: &Map<String, Value>,
        entity_id: Option<&str>,
    ) -> Option<i64> {
        if !self.is_enabled() {
            return None;
        }
        if let Some(entity_id) = entity_id {
            self.cancel_conflicting_jobs(&envelope.job_type, entity_id, &envelope.job_id)
                .await;
        }

        let metadata = json!({
            "job_id": envelope.job_id,
            "context": context,
            "driver": driver,
            "attempts": attempts,
        });
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %envelope.job_id, error = %e, "Failed to encode payload for tracking");
                return None;
            }
        };

        let mut row = Row::new();
        row.insert("job_id".into(), json!(envelope.job_id));
        row.insert("name".into(), json!(envelope.display_name()));
        row.insert("payload".into(), json!(payload));
        row.insert("queue".into(), json!(envelope.queue));
        row.insert("attempts".into(), json!(attempts));
        row.insert("status".into(), json!(JobStatus::Processing.as_str()));
        row.insert("available_at".into(), json!(format_timestamp(envelope.available_at, self.tz)));
        row.insert("started_at".into(), json!(self.now()));
        row.insert("job_class".into(), json!(envelope.job_type));
        if let Some(entity_id) = entity_id {
            row.insert("entity_id".into(), json!(entity_id));
        }
        row.insert("metadata".into(), json!(metadata.to_string()));

        match self.store.create(&self.config.table, row).await {
            Ok(id) => {
                debug!(job_id = %envelope.job_id, record_id = id, "Tracked job start");
                Some(id)
            }
            Err(e) => {
                warn!(job_id = %envelope.job_id, error = %e, "Failed to track job start");
                None
            }
        }
    }

    /// Records success.
    pub async fn track_job_completed(&self, record_id: i64) {
        let mut changes = Row::new();
        changes.insert("status".into(), json!(JobStatus::Completed.as_str()));
        changes.insert("completed_at".into(), json!(self.now()));
        self.update(record_id, changes, None).await;
    }

    /// Records a cancellation.
    pub async fn track_job_cancelled(&self, record_id: i64, reason: &str) {
        let mut changes = Row::new();
        changes.insert("status".into(), json!(JobStatus::Cancelled.as_str()));
        changes.insert("cancelled_at".into(), json!(self.now()));
        self.update(record_id, changes, Some(("cancel_reason", reason))).await;
    }

    /// Records a failure, mirrored into the failed table when configured.
    pub async fn track_job_failed(&self, record_id: i64, envelope: &Envelope, driver: &str, error: &str) {
        let mut changes = Row::new();
        changes.insert("status".into(), json!(JobStatus::Failed.as_str()));
        changes.insert("completed_at".into(), json!(self.now()));
        self.update(record_id, changes, Some(("error", error))).await;

        if !self.config.track_failed {
            return;
        }
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(job_id = %envelope.job_id, error = %e, "Failed to encode failed job payload");
                return;
            }
        };
        let mut row = Row::new();
        row.insert("driver".into(), json!(driver));
        row.insert("queue".into(), json!(envelope.queue));
        row.insert("name".into(), json!(envelope.display_name()));
        row.insert("connection".into(), json!(driver));
        row.insert("payload".into(), json!(payload));
        row.insert("exception".into(), json!(error));
        row.insert("failed_at".into(), json!(self.now()));
        if let Err(e) = self.store.create(&self.config.failed_table, row).await {
            warn!(job_id = %envelope.job_id, error = %e, "Failed to record failed job");
        }
    }

    async fn update(&self, record_id: i64, mut changes: Row, note: Option<(&str, &str)>) {
        if !self.is_enabled() {
            return;
        }
        let query = Query::table(&self.config.table).eq("id", record_id);

        if let Some((key, value)) = note {
            match self.store.first(&query).await {
                Ok(row) => {
                    let metadata = merge_metadata(row.as_ref(), key, value);
                    changes.insert("metadata".into(), json!(metadata));
                }
                Err(e) => warn!(record_id, error = %e, "Failed to read tracked job"),
            }
        }

        if let Err(e) = self.store.update(&query, changes).await {
            warn!(record_id, error = %e, "Failed to update tracked job");
        }
    }

    /// Returns false once the job's latest history row is `cancelled`.
    ///
    /// Unknown jobs and read failures count as "continue".
    pub async fn should_job_continue(&self, job_id: &JobId) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let query = Query::table(&self.config.table)
            .eq("job_id", job_id.as_str())
            .order_by("id");
        match self.store.get(&query).await {
            Ok(rows) => rows
                .last()
                .and_then(|row| row.get("status"))
                .and_then(Value::as_str)
                .map_or(true, |status| status != JobStatus::Cancelled.as_str()),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to read job status");
                true
            }
        }
    }

    /// Returns `Err(JobError::Cancelled)` if the job was cancelled in history.
    pub async fn validate_job_or_cancel(&self, job_id: &JobId, operation: &str) -> JobResult<()> {
        if self.should_job_continue(job_id).await {
            return Ok(());
        }
        Err(JobError::cancelled(format!(
            "Job {job_id} cancelled during {operation}"
        )))
    }

    /// Marks every live history row of `job_id` as cancelled, whichever
    /// process runs it. Returns the rows changed.
    pub async fn cancel_job(&self, job_id: &JobId, reason: &str) -> JobResult<u64> {
        let query = Query::table(&self.config.table).eq("job_id", job_id.as_str());
        let cancelled = self.cancel_live_rows(query, reason).await?;
        if cancelled > 0 {
            info!(job_id = %job_id, reason = %reason, "Cancelled tracked job");
        }
        Ok(cancelled)
    }

    /// Cancels live jobs of `job_type` for `entity_id`, except `current`.
    pub async fn cancel_conflicting_jobs(&self, job_type: &str, entity_id: &str, current: &JobId) -> u64 {
        let query = Query::table(&self.config.table)
            .eq("job_class", job_type)
            .eq("entity_id", entity_id)
            .filter("job_id", Op::Ne, current.as_str());
        let reason = format!("Superseded by job {current}");
        match self.cancel_live_rows(query, &reason).await {
            Ok(0) => 0,
            Ok(count) => {
                info!(job_type, entity_id, count, "Cancelled conflicting jobs");
                count
            }
            Err(e) => {
                warn!(job_type, entity_id, error = %e, "Failed to cancel conflicting jobs");
                0
            }
        }
    }

    async fn cancel_live_rows(&self, query: Query, reason: &str) -> JobResult<u64> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let mut cancelled = 0;
        for status in [JobStatus::Pending, JobStatus::Processing] {
            let rows = self.store.get(&query.clone().eq("status", status.as_str())).await?;
            for row in rows {
                let Some(id) = row.get("id").and_then(Value::as_i64) else {
                    continue;
                };
                let mut changes = Row::new();
                changes.insert("status".into(), json!(JobStatus::Cancelled.as_str()));
                changes.insert("cancelled_at".into(), json!(self.now()));
                changes.insert("metadata".into(), json!(merge_metadata(Some(&row), "cancel_reason", reason)));
                cancelled += self
                    .store
                    .update(&Query::table(&self.config.table).eq("id", id), changes)
                    .await?;
            }
        }
        Ok(cancelled)
    }

    /// Counts tracked jobs per status.
    pub async fn get_job_stats(&self, queue: Option<&str>) -> JobResult<JobStats> {
        job_stats(self.store.as_ref(), &self.config.table, queue).await
    }
}

impl fmt::Debug for JobTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTracker")
            .field("table", &self.config.table)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// Adds `key: value` to the JSON object stored in a row's `metadata` column.
pub fn merge_metadata(row: Option<&Row>, key: &str, value: &str) -> String {
    let mut metadata = row
        .and_then(|r| r.get("metadata"))
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_str::<Map<String, Value>>(s).ok())
        .unwrap_or_default();
    metadata.insert(key.to_string(), json!(value));
    Value::Object(metadata).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::QueuedJob;
    use crate::store::MemoryRecordStore;

    fn tracker(store: Arc<MemoryRecordStore>) -> JobTracker {
        JobTracker::new(store, TrackingConfig::default()).unwrap()
    }

    fn envelope() -> Envelope {
        QueuedJob::named("report", Map::new()).into_envelope("reports", Utc::now())
    }

    #[tokio::test]
    async fn test_started_then_completed() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(store.clone());

        let id = tracker
            .track_job_started(&envelope(), "redis", 0, &Map::new(), None)
            .await
            .unwrap();
        tracker.track_job_completed(id).await;

        let rows = store.rows("job");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], json!("completed"));
        assert_eq!(rows[0]["job_class"], json!("report"));
        assert!(rows[0]["completed_at"].is_string());

        let metadata: Value = serde_json::from_str(rows[0]["metadata"].as_str().unwrap()).unwrap();
        assert_eq!(metadata["driver"], json!("redis"));
    }

    #[tokio::test]
    async fn test_failed_mirrors_to_failed_table() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(store.clone());
        let envelope = envelope();

        let id = tracker
            .track_job_started(&envelope, "amqp", 1, &Map::new(), None)
            .await
            .unwrap();
        tracker.track_job_failed(id, &envelope, "amqp", "boom").await;

        let row = &store.rows("job")[0];
        assert_eq!(row["status"], json!("failed"));
        let metadata: Value = serde_json::from_str(row["metadata"].as_str().unwrap()).unwrap();
        assert_eq!(metadata["error"], json!("boom"));
        assert_eq!(metadata["attempts"], json!(1));

        let failed = store.rows("failed_job");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["exception"], json!("boom"));
        assert_eq!(failed[0]["queue"], json!("reports"));
    }

    #[tokio::test]
    async fn test_cancelled_records_reason() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(store.clone());

        let id = tracker
            .track_job_started(&envelope(), "redis", 0, &Map::new(), None)
            .await
            .unwrap();
        tracker.track_job_cancelled(id, "superseded").await;

        let row = &store.rows("job")[0];
        assert_eq!(row["status"], json!("cancelled"));
        assert!(row["metadata"].as_str().unwrap().contains("superseded"));
        assert!(store.rows("failed_job").is_empty());
    }

    #[tokio::test]
    async fn test_disabled_tracker_writes_nothing() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(store.clone());
        tracker.set_enabled(false);

        assert!(tracker
            .track_job_started(&envelope(), "redis", 0, &Map::new(), None)
            .await
            .is_none());
        assert!(store.rows("job").is_empty());
    }

    #[tokio::test]
    async fn test_job_stats() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(store.clone());

        let a = tracker.track_job_started(&envelope(), "redis", 0, &Map::new(), None).await.unwrap();
        let b = tracker.track_job_started(&envelope(), "redis", 0, &Map::new(), None).await.unwrap();
        tracker.track_job_started(&envelope(), "redis", 0, &Map::new(), None).await.unwrap();
        tracker.track_job_completed(a).await;
        tracker.track_job_cancelled(b, "stop").await;

        let stats = tracker.get_job_stats(Some("reports")).await.unwrap();
        assert_eq!(stats.processing_jobs, 1);
        assert_eq!(stats.completed_jobs, 1);
        assert_eq!(stats.cancelled_jobs, 1);
        assert_eq!(stats.total_jobs, 3);

        let other = tracker.get_job_stats(Some("mail")).await.unwrap();
        assert_eq!(other.total_jobs, 0);
    }

    #[tokio::test]
    async fn test_cancel_job_is_seen_by_should_continue() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(store.clone());
        let envelope = envelope();

        tracker
            .track_job_started(&envelope, "redis", 0, &Map::new(), None)
            .await
            .unwrap();
        assert!(tracker.should_job_continue(&envelope.job_id).await);
        assert!(tracker.validate_job_or_cancel(&envelope.job_id, "export").await.is_ok());

        assert_eq!(tracker.cancel_job(&envelope.job_id, "operator request").await.unwrap(), 1);

        assert!(!tracker.should_job_continue(&envelope.job_id).await);
        let err = tracker
            .validate_job_or_cancel(&envelope.job_id, "export")
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
        assert!(err.to_string().contains("export"));

        let row = &store.rows("job")[0];
        assert!(row["metadata"].as_str().unwrap().contains("operator request"));
        assert!(row["cancelled_at"].is_string());
    }

    #[tokio::test]
    async fn test_cancel_job_leaves_finished_rows() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(store.clone());
        let envelope = envelope();

        let id = tracker
            .track_job_started(&envelope, "redis", 0, &Map::new(), None)
            .await
            .unwrap();
        tracker.track_job_completed(id).await;

        assert_eq!(tracker.cancel_job(&envelope.job_id, "late").await.unwrap(), 0);
        assert!(tracker.should_job_continue(&envelope.job_id).await);
        assert_eq!(store.rows("job")[0]["status"], json!("completed"));
    }

    #[tokio::test]
    async fn test_unknown_job_continues() {
        let tracker = tracker(Arc::new(MemoryRecordStore::new()));
        assert!(tracker.should_job_continue(&JobId::new()).await);
    }

    #[tokio::test]
    async fn test_new_job_for_entity_supersedes_older_ones() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = tracker(store.clone());
        let first = envelope();
        let other_entity = envelope();
        let second = envelope();

        tracker
            .track_job_started(&first, "redis", 0, &Map::new(), Some("order-1"))
            .await
            .unwrap();
        tracker
            .track_job_started(&other_entity, "redis", 0, &Map::new(), Some("order-2"))
            .await
            .unwrap();
        tracker
            .track_job_started(&second, "redis", 0, &Map::new(), Some("order-1"))
            .await
            .unwrap();

        assert!(!tracker.should_job_continue(&first.job_id).await);
        assert!(tracker.should_job_continue(&other_entity.job_id).await);
        assert!(tracker.should_job_continue(&second.job_id).await);

        let rows = store.rows("job");
        let superseded = rows
            .iter()
            .find(|row| row["job_id"] == json!(first.job_id))
            .unwrap();
        assert!(superseded["metadata"].as_str().unwrap().contains("Superseded"));
    }

    #[test]
    fn test_merge_metadata_keeps_existing_keys() {
        let mut row = Row::new();
        row.insert("metadata".into(), json!("{\"driver\":\"redis\"}"));
        let merged: Value = serde_json::from_str(&merge_metadata(Some(&row), "error", "boom")).unwrap();
        assert_eq!(merged["driver"], json!("redis"));
        assert_eq!(merged["error"], json!("boom"));

        let fresh: Value = serde_json::from_str(&merge_metadata(None, "error", "x")).unwrap();
        assert_eq!(fresh["error"], json!("x"));
    }
}

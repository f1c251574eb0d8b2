//! Runs a decoded envelope and reports what happened.

use crate::envelope::Envelope;
use crate::error::JobError;
use crate::job::{JobContext, JobFailure, JobStatus};
use crate::metrics::JobMetrics;
use crate::registry::{ErasedJob, JobResolver};
use crate::state::{CancellationToken, JobStateManager};
use crate::tracker::JobTracker;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Final state of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Callback returned `Ok`.
    Completed,
    /// Callback returned a cancellation.
    Cancelled { reason: String },
    /// Callback, resolution or the job itself failed.
    Failed { error: String },
}

impl Outcome {
    /// Status recorded for this outcome.
    pub fn status(&self) -> JobStatus {
        match self {
            Outcome::Completed => JobStatus::Completed,
            Outcome::Cancelled { .. } => JobStatus::Cancelled,
            Outcome::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// Result of running an envelope.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// How the job ended.
    pub outcome: Outcome,

    /// Job type, once resolved.
    pub job_class: Option<String>,

    /// Cancellation context of cancellable jobs.
    pub context: Map<String, Value>,

    /// Time spent in the callback.
    pub duration: Duration,
}

/// Where an execution happens.
#[derive(Debug, Clone, Copy)]
pub struct Execution<'a> {
    /// Driver running the job.
    pub driver: &'a str,

    /// Failed attempts before this one.
    pub attempts: u32,
}

/// Shared job runner used by every driver.
#[derive(Clone)]
pub struct JobExecutor {
    resolver: Arc<dyn JobResolver>,
    state: Arc<JobStateManager>,
    tracker: Option<Arc<JobTracker>>,
}

impl JobExecutor {
    /// Creates an executor without history tracking.
    pub fn new(resolver: Arc<dyn JobResolver>, state: Arc<JobStateManager>) -> Self {
        Self {
            resolver,
            state,
            tracker: None,
        }
    }

    /// Records history through `tracker` when it is enabled.
    pub fn with_tracker(mut self, tracker: Arc<JobTracker>) -> Self {
        self.tracker = tracker.is_enabled().then_some(tracker);
        self
    }

    /// State manager cancellable jobs register with.
    pub fn state(&self) -> &Arc<JobStateManager> {
        &self.state
    }

    /// Decodes and runs a raw payload.
    ///
    /// Returns `None` for payloads that cannot be decoded; callers drop them.
    pub async fn execute_payload(
        &self,
        payload: &[u8],
        exec: Execution<'_>,
    ) -> Option<(Envelope, ExecutionReport)> {
        match Envelope::decode(payload) {
            Ok(envelope) => {
                let report = self.execute(&envelope, exec).await;
                Some((envelope, report))
            }
            Err(e) => {
                warn!(driver = exec.driver, error = %e, "Dropping undecodable job payload");
                JobMetrics::job_dropped(exec.driver);
                None
            }
        }
    }

    /// Runs an envelope to completion.
    pub async fn execute(&self, envelope: &Envelope, exec: Execution<'_>) -> ExecutionReport {
        let started = Instant::now();
        let job = match self.resolver.resolve(envelope) {
            Ok(job) => job,
            Err(e) => {
                warn!(job_id = %envelope.job_id, job_type = %envelope.job_type, error = %e, "Failed to resolve job");
                let record = self.track_started(envelope, exec, &Map::new(), None).await;
                let outcome = Outcome::Failed {
                    error: e.to_string(),
                };
                self.track_finished(record, envelope, exec, &outcome).await;
                JobMetrics::job_finished(&envelope.queue, &envelope.job_type, &outcome, started.elapsed());
                return ExecutionReport {
                    outcome,
                    job_class: None,
                    context: Map::new(),
                    duration: started.elapsed(),
                };
            }
        };

        let context = job
            .cancellable()
            .map(|c| c.cancellation_context())
            .unwrap_or_default();
        let token = if job.cancellable().is_some() {
            self.state.register_job(&envelope.job_id, context.clone())
        } else {
            CancellationToken::new()
        };

        let entity_id = job.cancellable().and_then(|c| c.entity_id());
        let record = self
            .track_started(envelope, exec, &context, entity_id.as_deref())
            .await;
        let ctx = JobContext {
            job_id: envelope.job_id.clone(),
            job_type: envelope.job_type.clone(),
            queue: envelope.queue.clone(),
            driver: exec.driver.to_string(),
            attempts: exec.attempts,
            args: envelope.args.clone(),
            token,
            tracker: self.tracker.clone(),
        };

        debug!(job_id = %envelope.job_id, job_type = %envelope.job_type, driver = exec.driver, "Processing job");
        let result = AssertUnwindSafe(job.call(&envelope.callback, &ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(JobError::ExecutionFailed("job panicked".to_string())));

        if job.cancellable().is_some() {
            self.state.unregister_job(&envelope.job_id);
        }

        let outcome = self.settle(job.as_ref(), &ctx, exec, result);
        self.track_finished(record, envelope, exec, &outcome).await;
        JobMetrics::job_finished(&envelope.queue, &envelope.job_type, &outcome, started.elapsed());

        ExecutionReport {
            outcome,
            job_class: Some(job.job_type().to_string()),
            context,
            duration: started.elapsed(),
        }
    }

    fn settle(
        &self,
        job: &dyn ErasedJob,
        ctx: &JobContext,
        exec: Execution<'_>,
        result: Result<(), JobError>,
    ) -> Outcome {
        match result {
            Ok(()) => {
                debug!(job_id = %ctx.job_id, "Job completed successfully");
                job.on_complete(ctx);
                Outcome::Completed
            }
            Err(JobError::Cancelled { reason }) => {
                debug!(job_id = %ctx.job_id, reason = %reason, "Job cancelled");
                if let Some(cancellable) = job.cancellable() {
                    cancellable.on_cancelled(&reason);
                }
                Outcome::Cancelled { reason }
            }
            Err(e) => {
                let error = e.to_string();
                warn!(job_id = %ctx.job_id, attempts = exec.attempts, error = %error, "Job execution failed");
                let failure = JobFailure {
                    job_id: ctx.job_id.clone(),
                    job_type: ctx.job_type.clone(),
                    queue: ctx.queue.clone(),
                    driver: exec.driver.to_string(),
                    attempts: exec.attempts,
                };
                job.failed(&failure, &error);
                Outcome::Failed { error }
            }
        }
    }

    async fn track_started(
        &self,
        envelope: &Envelope,
        exec: Execution<'_>,
        context: &Map<String, Value>,
        entity_id: Option<&str>,
    ) -> Option<i64> {
        match &self.tracker {
            Some(tracker) => {
                tracker
                    .track_job_started(envelope, exec.driver, exec.attempts, context, entity_id)
                    .await
            }
            None => None,
        }
    }

    async fn track_finished(
        &self,
        record: Option<i64>,
        envelope: &Envelope,
        exec: Execution<'_>,
        outcome: &Outcome,
    ) {
        let (Some(tracker), Some(record)) = (&self.tracker, record) else {
            return;
        };
        match outcome {
            Outcome::Completed => tracker.track_job_completed(record).await,
            Outcome::Cancelled { reason } => tracker.track_job_cancelled(record, reason).await,
            Outcome::Failed { error } => tracker.track_job_failed(record, envelope, exec.driver, error).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::QueuedJob;
    use crate::error::JobResult;
    use crate::job::{Cancellable, Job};
    use crate::config::TrackingConfig;
    use crate::registry::JobRegistry;
    use crate::store::MemoryRecordStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static FAILED_HOOK: AtomicUsize = AtomicUsize::new(0);
    static CANCELLED_HOOK: AtomicUsize = AtomicUsize::new(0);
    static COMPLETE_HOOK: AtomicUsize = AtomicUsize::new(0);

    #[derive(Serialize, Deserialize)]
    struct Flaky {
        fail: bool,
    }

    #[async_trait]
    impl Job for Flaky {
        const NAME: &'static str = "flaky";

        async fn handle(&self, _ctx: &JobContext) -> JobResult<()> {
            if self.fail {
                Err(JobError::ExecutionFailed("boom".into()))
            } else {
                Ok(())
            }
        }

        fn failed(&self, _failure: &JobFailure, _error: &str) {
            FAILED_HOOK.fetch_add(1, Ordering::SeqCst);
        }

        fn on_complete(&self, _ctx: &JobContext) {
            COMPLETE_HOOK.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Watcher {
        receipt: String,
    }

    #[async_trait]
    impl Job for Watcher {
        const NAME: &'static str = "watcher";

        async fn handle(&self, ctx: &JobContext) -> JobResult<()> {
            for _ in 0..100 {
                ctx.check_cancelled()?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(())
        }

        fn cancellable(&self) -> Option<&dyn Cancellable> {
            Some(self)
        }
    }

    impl Cancellable for Watcher {
        fn cancellation_context(&self) -> Map<String, Value> {
            let mut ctx = Map::new();
            ctx.insert("receipt_id".into(), json!(self.receipt));
            ctx
        }

        fn on_cancelled(&self, _reason: &str) {
            CANCELLED_HOOK.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Export {
        order: String,
    }

    #[async_trait]
    impl Job for Export {
        const NAME: &'static str = "export";

        async fn handle(&self, ctx: &JobContext) -> JobResult<()> {
            for _ in 0..200 {
                ctx.validate_or_cancel("export").await?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(())
        }

        fn cancellable(&self) -> Option<&dyn Cancellable> {
            Some(self)
        }
    }

    impl Cancellable for Export {
        fn cancellation_context(&self) -> Map<String, Value> {
            Map::new()
        }

        fn entity_id(&self) -> Option<String> {
            Some(self.order.clone())
        }
    }

    fn executor() -> JobExecutor {
        let registry = JobRegistry::new();
        registry
            .register::<Flaky>()
            .register::<Watcher>()
            .register::<Export>();
        JobExecutor::new(Arc::new(registry), Arc::new(JobStateManager::new()))
    }

    fn exec() -> Execution<'static> {
        Execution {
            driver: "test",
            attempts: 0,
        }
    }

    #[tokio::test]
    async fn test_completed() {
        let before = COMPLETE_HOOK.load(Ordering::SeqCst);
        let envelope = QueuedJob::new(&Flaky { fail: false })
            .unwrap()
            .into_envelope("default", Utc::now());
        let report = executor().execute(&envelope, exec()).await;
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.job_class.as_deref(), Some("flaky"));
        assert!(COMPLETE_HOOK.load(Ordering::SeqCst) > before);
    }

    #[tokio::test]
    async fn test_failed_invokes_hook() {
        let before = FAILED_HOOK.load(Ordering::SeqCst);
        let envelope = QueuedJob::new(&Flaky { fail: true })
            .unwrap()
            .into_envelope("default", Utc::now());

        let report = executor().execute(&envelope, exec()).await;

        assert!(matches!(report.outcome, Outcome::Failed { ref error } if error.contains("boom")));
        assert_eq!(FAILED_HOOK.load(Ordering::SeqCst), before + 1);
    }

    #[tokio::test]
    async fn test_unknown_type_fails_without_panicking() {
        let envelope = QueuedJob::named("nope", Map::new()).into_envelope("default", Utc::now());
        let report = executor().execute(&envelope, exec()).await;
        assert_eq!(report.outcome.status(), JobStatus::Failed);
        assert!(report.job_class.is_none());
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let executor = executor();
        let state = executor.state().clone();
        let envelope = QueuedJob::new(&Watcher { receipt: "R1".into() })
            .unwrap()
            .into_envelope("default", Utc::now());
        let job_id = envelope.job_id.clone();

        let handle = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute(&envelope, exec()).await }
        });

        let mut cancelled = false;
        for _ in 0..100 {
            if state.cancel_job(&job_id, "superseded") {
                cancelled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(cancelled);

        let report = handle.await.unwrap();
        assert_eq!(
            report.outcome,
            Outcome::Cancelled {
                reason: "superseded".into()
            }
        );
        assert_eq!(report.context["receipt_id"], json!("R1"));
        assert!(CANCELLED_HOOK.load(Ordering::SeqCst) >= 1);
        assert!(state.get_job_status(&job_id).is_none());
    }

    #[tokio::test]
    async fn test_cancellation_recorded_by_another_process_stops_job() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = Arc::new(JobTracker::new(store.clone(), TrackingConfig::default()).unwrap());
        let executor = executor().with_tracker(tracker);
        // A second tracker over the same table stands in for another process.
        let remote = JobTracker::new(store.clone(), TrackingConfig::default()).unwrap();

        let envelope = QueuedJob::new(&Export { order: "O-1".into() })
            .unwrap()
            .into_envelope("default", Utc::now());
        let job_id = envelope.job_id.clone();
        let handle = tokio::spawn({
            let executor = executor.clone();
            async move { executor.execute(&envelope, exec()).await }
        });

        let mut cancelled = false;
        for _ in 0..100 {
            if remote.cancel_job(&job_id, "operator request").await.unwrap() > 0 {
                cancelled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(cancelled);

        let report = handle.await.unwrap();
        assert!(matches!(report.outcome, Outcome::Cancelled { ref reason } if reason.contains("export")));
        assert_eq!(store.rows("job")[0]["status"], json!("cancelled"));
    }

    #[tokio::test]
    async fn test_entity_job_supersedes_tracked_predecessor() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = Arc::new(JobTracker::new(store.clone(), TrackingConfig::default()).unwrap());
        let executor = executor().with_tracker(tracker.clone());

        let first = QueuedJob::new(&Export { order: "O-2".into() })
            .unwrap()
            .into_envelope("default", Utc::now());
        let second = QueuedJob::new(&Export { order: "O-2".into() })
            .unwrap()
            .into_envelope("default", Utc::now());

        let running = tokio::spawn({
            let executor = executor.clone();
            let first = first.clone();
            async move { executor.execute(&first, exec()).await }
        });
        while store.rows("job").is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let replacement = tokio::spawn({
            let executor = executor.clone();
            let second = second.clone();
            async move { executor.execute(&second, exec()).await }
        });

        let report = running.await.unwrap();
        assert_eq!(report.outcome.status(), JobStatus::Cancelled);

        while store.rows("job").len() < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tracker.cancel_job(&second.job_id, "test over").await.unwrap();
        assert_eq!(replacement.await.unwrap().outcome.status(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_corrupt_payload_is_dropped() {
        assert!(executor().execute_payload(b"garbage", exec()).await.is_none());
    }
}

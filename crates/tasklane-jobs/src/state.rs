//! In-process registry of executing jobs and cooperative cancellation.
//!
//! Entries live only as long as the job runs in this process. Nothing is
//! persisted; every worker process owns an independent manager.

use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobStatus};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Flag shared between a running job and whoever wants to stop it.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancellationToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the token as cancelled. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut slot = self.inner.reason.lock();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Reason given to `cancel`, if any.
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.lock().clone()
    }

    /// Returns `Err(JobError::Cancelled)` if the token was cancelled.
    ///
    /// Long-running jobs call this between units of work and propagate the
    /// error with `?`.
    pub fn check(&self) -> JobResult<()> {
        if self.is_cancelled() {
            return Err(JobError::cancelled(
                self.reason().unwrap_or_else(|| "Job cancelled".to_string()),
            ));
        }
        Ok(())
    }
}

/// Callback invoked with the cancellation reason.
pub type CancelCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Snapshot of an executing job.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    /// Job ID.
    pub job_id: JobId,

    /// `Processing` while running, `Cancelled` once marked.
    pub status: JobStatus,

    /// When the job registered itself.
    pub start_time: DateTime<Utc>,

    /// Caller-supplied description of what the job is working on.
    pub context: Map<String, Value>,

    /// Reason given when the job was cancelled.
    pub cancel_reason: Option<String>,

    /// When the job was cancelled.
    pub cancelled_at: Option<DateTime<Utc>>,
}

struct Entry {
    info: ActiveJob,
    token: CancellationToken,
    on_cancel: Option<CancelCallback>,
}

/// Registry of jobs currently executing in this process.
#[derive(Default)]
pub struct JobStateManager {
    jobs: RwLock<HashMap<JobId, Entry>>,
}

impl JobStateManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a job as processing and returns the token it should poll.
    pub fn register_job(&self, job_id: &JobId, context: Map<String, Value>) -> CancellationToken {
        self.insert(job_id, context, None)
    }

    /// Like [`register_job`](Self::register_job), with a callback fired when
    /// the job is cancelled.
    pub fn register_job_with_callback(
        &self,
        job_id: &JobId,
        context: Map<String, Value>,
        callback: CancelCallback,
    ) -> CancellationToken {
        self.insert(job_id, context, Some(callback))
    }

    fn insert(
        &self,
        job_id: &JobId,
        context: Map<String, Value>,
        on_cancel: Option<CancelCallback>,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let entry = Entry {
            info: ActiveJob {
                job_id: job_id.clone(),
                status: JobStatus::Processing,
                start_time: Utc::now(),
                context,
                cancel_reason: None,
                cancelled_at: None,
            },
            token: token.clone(),
            on_cancel,
        };

        self.jobs.write().insert(job_id.clone(), entry);
        debug!(job_id = %job_id, "Registered active job");
        token
    }

    /// Removes a job from the registry.
    pub fn unregister_job(&self, job_id: &JobId) -> Option<ActiveJob> {
        let removed = self.jobs.write().remove(job_id).map(|e| e.info);
        if removed.is_some() {
            debug!(job_id = %job_id, "Unregistered active job");
        }
        removed
    }

    /// Returns true if the job is registered and marked cancelled.
    pub fn is_job_cancelled(&self, job_id: &JobId) -> bool {
        self.jobs
            .read()
            .get(job_id)
            .is_some_and(|e| e.token.is_cancelled())
    }

    /// Marks a running job for cancellation.
    ///
    /// Returns false when the job is unknown or already cancelled. The job
    /// itself observes the token and stops.
    pub fn cancel_job(&self, job_id: &JobId, reason: &str) -> bool {
        let callback = {
            let mut jobs = self.jobs.write();
            let Some(entry) = jobs.get_mut(job_id) else {
                return false;
            };
            if entry.info.status != JobStatus::Processing {
                return false;
            }
            Self::mark_cancelled(entry, reason);
            entry.on_cancel.clone()
        };

        info!(job_id = %job_id, reason = %reason, "Cancelled job");
        if let Some(callback) = callback {
            callback(reason);
        }
        true
    }

    /// Cancels every processing job whose context satisfies `predicate`.
    ///
    /// Returns the number of jobs cancelled. `predicate` runs without the
    /// registry lock held, so it may call back into the manager.
    pub fn cancel_jobs_by_context<F>(&self, predicate: F, reason: &str) -> usize
    where
        F: Fn(&Map<String, Value>) -> bool,
    {
        let candidates: Vec<(JobId, Map<String, Value>)> = self
            .jobs
            .read()
            .iter()
            .filter(|(_, entry)| entry.info.status == JobStatus::Processing)
            .map(|(id, entry)| (id.clone(), entry.info.context.clone()))
            .collect();

        let count = candidates
            .into_iter()
            .filter(|(_, context)| predicate(context))
            .filter(|(id, _)| self.cancel_job(id, reason))
            .count();
        if count > 0 {
            info!(count, reason = %reason, "Cancelled jobs by context");
        }
        count
    }

    fn mark_cancelled(entry: &mut Entry, reason: &str) {
        entry.token.cancel(reason);
        entry.info.status = JobStatus::Cancelled;
        entry.info.cancel_reason = Some(reason.to_string());
        entry.info.cancelled_at = Some(Utc::now());
    }

    /// Snapshot of jobs still processing.
    pub fn get_active_jobs(&self) -> Vec<ActiveJob> {
        self.jobs
            .read()
            .values()
            .filter(|e| e.info.status == JobStatus::Processing)
            .map(|e| e.info.clone())
            .collect()
    }

    /// Snapshot of a single registered job.
    pub fn get_job_status(&self, job_id: &JobId) -> Option<ActiveJob> {
        self.jobs.read().get(job_id).map(|e| e.info.clone())
    }

    /// Drops entries older than `max_age`. Returns how many were removed.
    ///
    /// Covers jobs whose executor never unregistered them.
    pub fn cleanup_old_jobs(&self, max_age: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, e| e.info.start_time > cutoff);
        let removed = before - jobs.len();
        if removed > 0 {
            warn!(removed, "Removed stale active job entries");
        }
        removed
    }

    /// Number of registered entries, cancelled ones included.
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    /// Returns true when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

//! Job trait and definitions.

use crate::error::{JobError, JobResult};
use crate::state::CancellationToken;
use crate::tracker::JobTracker;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Callback invoked when an envelope does not name one.
pub const DEFAULT_CALLBACK: &str = "handle";

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting to be picked up.
    Pending,
    /// Currently executing.
    Processing,
    /// Finished successfully.
    Completed,
    /// Handler returned an error.
    Failed,
    /// Stopped after a cancellation request.
    Cancelled,
}

impl JobStatus {
    /// Status as stored in record tables.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// All statuses, in lifecycle order.
    pub fn all() -> [JobStatus; 5] {
        [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Cancelled,
            JobStatus::Failed,
        ]
    }

    /// Returns true if the job will not run again without intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job execution context.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Registered job type.
    pub job_type: String,

    /// Queue the job was taken from.
    pub queue: String,

    /// Name of the driver executing the job.
    pub driver: String,

    /// Failed attempts before this one.
    pub attempts: u32,

    /// Arguments carried in the envelope.
    pub args: Map<String, Value>,

    /// Token flipped by the state manager when the job is cancelled.
    pub token: CancellationToken,

    /// History table consulted for cancellations made by other processes.
    pub tracker: Option<Arc<JobTracker>>,
}

impl JobContext {
    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns `Err(JobError::Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> JobResult<()> {
        self.token.check()
    }

    /// Returns false once this job was cancelled here or in the history table.
    pub async fn should_continue(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match &self.tracker {
            Some(tracker) => tracker.should_job_continue(&self.job_id).await,
            None => true,
        }
    }

    /// Like [`check_cancelled`](Self::check_cancelled), but also honours a
    /// cancellation recorded by another process. `operation` names the step
    /// in the returned reason.
    pub async fn validate_or_cancel(&self, operation: &str) -> JobResult<()> {
        self.check_cancelled()?;
        match &self.tracker {
            Some(tracker) => tracker.validate_job_or_cancel(&self.job_id, operation).await,
            None => Ok(()),
        }
    }

    /// Deserializes a single argument, if present.
    pub fn arg<T: DeserializeOwned>(&self, key: &str) -> JobResult<Option<T>> {
        self.args
            .get(key)
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(JobError::from)
    }
}

/// Details handed to [`Job::failed`].
#[derive(Debug, Clone, Serialize)]
pub struct JobFailure {
    /// Job ID.
    pub job_id: JobId,

    /// Registered job type.
    pub job_type: String,

    /// Queue the job was taken from.
    pub queue: String,

    /// Driver that ran the job.
    pub driver: String,

    /// Failed attempts before this one.
    pub attempts: u32,
}

/// Trait for defining jobs.
///
/// Implement this trait and register the type with a
/// [`JobRegistry`](crate::registry::JobRegistry) in every process that
/// consumes it.
///
/// # Example
///
/// ```rust,ignore
/// use tasklane_jobs::{Job, JobContext, JobResult};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct SendEmailJob {
///     to: String,
///     subject: String,
/// }
///
/// #[async_trait::async_trait]
/// impl Job for SendEmailJob {
///     const NAME: &'static str = "send_email";
///     const QUEUE: &'static str = "emails";
///
///     async fn handle(&self, ctx: &JobContext) -> JobResult<()> {
///         println!("Sending email to: {}", self.to);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Unique name for this job type.
    const NAME: &'static str;

    /// Queue name for this job type.
    const QUEUE: &'static str = "default";

    /// Default callback.
    async fn handle(&self, ctx: &JobContext) -> JobResult<()>;

    /// Dispatches a named callback. Override to expose more than `handle`.
    async fn call(&self, callback: &str, ctx: &JobContext) -> JobResult<()> {
        match callback {
            DEFAULT_CALLBACK => self.handle(ctx).await,
            other => Err(JobError::UnknownCallback {
                job: Self::NAME.to_string(),
                callback: other.to_string(),
            }),
        }
    }

    /// Called when a callback returns an error other than cancellation.
    fn failed(&self, _failure: &JobFailure, _error: &str) {}

    /// Called after a callback returned `Ok`.
    fn on_complete(&self, _ctx: &JobContext) {}

    /// Returns the cancellation capability if the job supports it.
    fn cancellable(&self) -> Option<&dyn Cancellable> {
        None
    }
}

/// Capability of jobs that can be cancelled while running.
///
/// Cancellable jobs are registered with the
/// [`JobStateManager`](crate::state::JobStateManager) for the duration of the
/// callback and are expected to poll [`JobContext::check_cancelled`].
pub trait Cancellable: Send + Sync {
    /// Describes what the job is working on, for example a receipt ID.
    fn cancellation_context(&self) -> Map<String, Value>;

    /// Entity the job acts on. Starting a job for an entity cancels older
    /// live jobs of the same type for it in the history table.
    fn entity_id(&self) -> Option<String> {
        None
    }

    /// Called after the job stopped because of a cancellation.
    fn on_cancelled(&self, _reason: &str) {}
}

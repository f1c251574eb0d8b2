//! Job error types.

use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job execution failed.
    #[error("Job execution failed: {0}")]
    ExecutionFailed(String),

    /// Job cancelled itself after observing its cancellation token.
    #[error("Job was cancelled: {reason}")]
    Cancelled { reason: String },

    /// Payload could not be decoded into an envelope.
    #[error("Corrupt job payload: {0}")]
    CorruptPayload(String),

    /// No constructor registered for the job type.
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// The job has no callback with the given name.
    #[error("Job {job} has no callback named {callback}")]
    UnknownCallback { job: String, callback: String },

    /// The driver does not implement the operation.
    #[error("Driver {driver} does not support {operation}")]
    Unsupported {
        driver: &'static str,
        operation: &'static str,
    },

    /// No driver registered under the name.
    #[error("Driver not registered: {0}")]
    DriverNotRegistered(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Schedule expression could not be parsed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// AMQP broker error.
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A backend could not be reached; the call may be retried.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// No queue bound to an exchange matches a routing key.
    #[error("No route: {0}")]
    NoRoute(String),

    /// Record store rejected the request.
    #[error("Record store error: {0}")]
    Store(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Shorthand for a cancellation raised from inside a job.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        JobError::Cancelled {
            reason: reason.into(),
        }
    }

    /// Returns true if the job stopped because it was cancelled.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, JobError::Cancelled { .. })
    }

    /// Returns true if the error comes from a backend connection and may
    /// succeed on a second attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JobError::Redis(_)
                | JobError::Pool(_)
                | JobError::Amqp(_)
                | JobError::Database(_)
                | JobError::Unavailable(_)
        )
    }

    /// Returns true if the error should abort startup.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            JobError::Configuration(_) | JobError::DriverNotRegistered(_)
        )
    }
}

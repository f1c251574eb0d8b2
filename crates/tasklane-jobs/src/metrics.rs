//! Metrics for queue monitoring.
//!
//! Recorded through the `metrics` facade; installing an exporter is left to
//! the application.

use crate::executor::Outcome;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use std::time::Duration;

/// Metric names for the queue system.
pub mod names {
    /// Total jobs pushed.
    pub const JOBS_PUSHED_TOTAL: &str = "tasklane_jobs_pushed_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "tasklane_jobs_completed_total";
    /// Total jobs failed.
    pub const JOBS_FAILED_TOTAL: &str = "tasklane_jobs_failed_total";
    /// Total jobs cancelled.
    pub const JOBS_CANCELLED_TOTAL: &str = "tasklane_jobs_cancelled_total";
    /// Total undecodable payloads dropped.
    pub const JOBS_DROPPED_TOTAL: &str = "tasklane_jobs_dropped_total";
    /// Total failed jobs moved back to pending.
    pub const JOBS_RETRIED_TOTAL: &str = "tasklane_jobs_retried_total";
    /// Total delayed jobs promoted to their queue.
    pub const JOBS_PROMOTED_TOTAL: &str = "tasklane_jobs_promoted_total";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "tasklane_job_duration_seconds";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_PUSHED_TOTAL, "Total number of jobs pushed");
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed");
    describe_counter!(names::JOBS_CANCELLED_TOTAL, "Total number of jobs cancelled");
    describe_counter!(
        names::JOBS_DROPPED_TOTAL,
        "Total number of undecodable payloads dropped"
    );
    describe_counter!(
        names::JOBS_RETRIED_TOTAL,
        "Total number of failed jobs moved back to pending"
    );
    describe_counter!(
        names::JOBS_PROMOTED_TOTAL,
        "Total number of delayed jobs promoted to their queue"
    );
    describe_histogram!(
        names::JOB_DURATION_SECONDS,
        "Job execution duration in seconds"
    );
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record jobs pushed.
    pub fn jobs_pushed(driver: &str, queue: &str, count: usize) {
        counter!(
            names::JOBS_PUSHED_TOTAL,
            "driver" => driver.to_string(),
            "queue" => queue.to_string()
        )
        .increment(count as u64);
    }

    /// Record the end of an execution.
    pub fn job_finished(queue: &str, job_name: &str, outcome: &Outcome, duration: Duration) {
        let (name, status) = match outcome {
            Outcome::Completed => (names::JOBS_COMPLETED_TOTAL, "completed"),
            Outcome::Cancelled { .. } => (names::JOBS_CANCELLED_TOTAL, "cancelled"),
            Outcome::Failed { .. } => (names::JOBS_FAILED_TOTAL, "failed"),
        };

        counter!(
            name,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => status
        )
        .record(duration.as_secs_f64());
    }

    /// Record an undecodable payload.
    pub fn job_dropped(driver: &str) {
        counter!(names::JOBS_DROPPED_TOTAL, "driver" => driver.to_string()).increment(1);
    }

    /// Record failed jobs moved back.
    pub fn jobs_retried(driver: &str, queue: &str, count: u64) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "driver" => driver.to_string(),
            "queue" => queue.to_string()
        )
        .increment(count);
    }

    /// Record delayed jobs promoted.
    pub fn jobs_promoted(queue: &str, count: u64) {
        counter!(names::JOBS_PROMOTED_TOTAL, "queue" => queue.to_string()).increment(count);
    }
}

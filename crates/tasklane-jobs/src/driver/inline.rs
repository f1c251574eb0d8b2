//! Inline driver: no queue, jobs run in the pushing process.

use super::{ConsumeOptions, DispatchOptions, Driver, When};
use crate::config::AsyncDriverConfig;
use crate::envelope::{Envelope, QueuedJob};
use crate::error::{JobError, JobResult};
use crate::executor::{Execution, JobExecutor, Outcome};
use crate::job::JobId;
use crate::metrics::JobMetrics;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, Instrument};

const NAME: &str = "async";

/// Driver that executes jobs as they are pushed.
///
/// With `blocking` the push awaits each job and returns its error; otherwise
/// jobs are spawned on the runtime and `push` returns at once.
pub struct AsyncDriver {
    executor: JobExecutor,
    config: AsyncDriverConfig,
}

impl AsyncDriver {
    /// Create a new inline driver.
    pub fn new(executor: JobExecutor, config: AsyncDriverConfig) -> Self {
        Self { executor, config }
    }

    /// Runs an envelope now, mapping the outcome to a result.
    pub async fn run(&self, envelope: &Envelope) -> JobResult<()> {
        let report = self.executor.execute(envelope, execution()).await;
        match report.outcome {
            Outcome::Completed => Ok(()),
            Outcome::Cancelled { reason } => Err(JobError::Cancelled { reason }),
            Outcome::Failed { error } => Err(JobError::ExecutionFailed(error)),
        }
    }
}

fn execution() -> Execution<'static> {
    Execution {
        driver: NAME,
        attempts: 0,
    }
}

#[async_trait]
impl Driver for AsyncDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn push(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>> {
        if options.delay.is_some_and(|d| d != When::Now) {
            debug!("Inline driver ignores delays, running now");
        }

        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let queue = options.queue_for(&job, &self.config.queue).to_string();
            let envelope = job.into_envelope(&queue, Utc::now());
            ids.push(envelope.job_id.clone());
            JobMetrics::jobs_pushed(NAME, &queue, 1);

            if self.config.blocking {
                self.run(&envelope).await?;
            } else {
                let executor = self.executor.clone();
                let span = tracing::info_span!("inline_job", job_id = %envelope.job_id);
                tokio::spawn(
                    async move {
                        executor.execute(&envelope, execution()).await;
                    }
                    .instrument(span),
                );
            }
        }
        Ok(ids)
    }

    async fn consume(&self, _options: &ConsumeOptions) -> JobResult<()> {
        Err(JobError::Unsupported {
            driver: NAME,
            operation: "consume",
        })
    }

    async fn retry(&self, _options: &ConsumeOptions) -> JobResult<u64> {
        Err(JobError::Unsupported {
            driver: NAME,
            operation: "retry",
        })
    }
}

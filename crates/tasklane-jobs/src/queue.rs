//! Queue facade.
//!
//! Routes dispatches to a named driver, or runs them inline when the
//! current [`ExecutionContext`] asks for synchronous execution. A dispatch
//! carrying a routing key is first resolved to a queue through the topic
//! exchange, when one is configured.

use crate::config::AsyncDriverConfig;
use crate::context::ExecutionContext;
use crate::driver::{AsyncDriver, ConsumeOptions, DatabaseDriver, DispatchOptions, Driver, When};
use crate::envelope::QueuedJob;
use crate::error::{JobError, JobResult};
use crate::exchange::{RoutingKey, TopicExchange};
use crate::executor::JobExecutor;
use crate::job::{Job, JobId};
use crate::state::{ActiveJob, JobStateManager};
use crate::tracker::{JobStats, JobTracker};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where job statistics are read from.
enum History {
    Tracker(Arc<JobTracker>),
    Database(Arc<DatabaseDriver>),
}

/// Entry point for dispatching and working jobs.
pub struct Queue {
    drivers: HashMap<String, Arc<dyn Driver>>,
    default: String,
    inline: AsyncDriver,
    state: Arc<JobStateManager>,
    history: Option<History>,
    tracker: Option<Arc<JobTracker>>,
    exchange: Option<TopicExchange>,
}

impl Queue {
    /// Creates a queue whose default driver is `default`.
    ///
    /// `executor` runs inline dispatches; its state manager is the one
    /// cancellation requests go to.
    pub fn new(default: impl Into<String>, executor: JobExecutor) -> Self {
        let state = executor.state().clone();
        let inline = AsyncDriver::new(
            executor,
            AsyncDriverConfig {
                blocking: true,
                ..AsyncDriverConfig::default()
            },
        );
        Self {
            drivers: HashMap::new(),
            default: default.into(),
            inline,
            state,
            history: None,
            tracker: None,
            exchange: None,
        }
    }

    /// Registers a driver under its name, replacing any previous one.
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.add_driver(driver);
        self
    }

    /// Registers a driver under its name, replacing any previous one.
    pub fn add_driver(&mut self, driver: Arc<dyn Driver>) -> &mut Self {
        self.drivers.insert(driver.name().to_string(), driver);
        self
    }

    /// Reads statistics from the tracker's history table and records
    /// cancellations there.
    pub fn with_tracker(mut self, tracker: Arc<JobTracker>) -> Self {
        self.tracker = Some(tracker.clone());
        self.history = Some(History::Tracker(tracker));
        self
    }

    /// Resolves routing keys through `exchange`.
    pub fn with_exchange(mut self, exchange: TopicExchange) -> Self {
        self.exchange = Some(exchange);
        self
    }

    /// Applies topic routing: the matched queue replaces `queue` and the
    /// exchange is named. Keys that fail to route dispatch unchanged.
    fn routed(&self, options: &DispatchOptions) -> DispatchOptions {
        let (Some(exchange), Some(key)) = (&self.exchange, options.routing_key.as_deref()) else {
            return options.clone();
        };
        if options.exchange.as_deref().is_some_and(|name| name != exchange.name()) {
            return options.clone();
        }
        match key.parse::<RoutingKey>().and_then(|key| exchange.route(&key)) {
            Ok(queue) => DispatchOptions {
                queue: Some(queue),
                exchange: Some(exchange.name().to_string()),
                ..options.clone()
            },
            Err(e) => {
                warn!(routing_key = %key, error = %e, "Routing failed, using standard dispatch");
                options.clone()
            }
        }
    }

    /// Reads statistics from the database driver's jobs table.
    pub fn with_database_stats(mut self, driver: Arc<DatabaseDriver>) -> Self {
        self.history = Some(History::Database(driver));
        self
    }

    /// Name of the default driver.
    pub fn default_driver(&self) -> &str {
        &self.default
    }

    /// Names of registered drivers, sorted.
    pub fn driver_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Looks up a driver, `None` meaning the default.
    pub fn driver(&self, name: Option<&str>) -> JobResult<Arc<dyn Driver>> {
        let name = name.unwrap_or(&self.default);
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::DriverNotRegistered(name.to_string()))
    }

    /// Driver a dispatch goes to, or `None` to run inline.
    fn route(&self, name: Option<&str>) -> Option<Arc<dyn Driver>> {
        if ExecutionContext::is_sync() {
            return None;
        }
        match self.driver(name) {
            Ok(driver) => Some(driver),
            Err(e) => {
                error!(error = %e, "Driver not registered, running job inline");
                None
            }
        }
    }

    async fn run_inline(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>> {
        if ExecutionContext::is_debug() {
            info!(count = jobs.len(), "Running jobs inline");
        } else {
            debug!(count = jobs.len(), "Running jobs inline");
        }
        self.inline.push(jobs, options).await
    }

    /// Pushes jobs through the default driver.
    pub async fn push(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>> {
        self.push_to(None, jobs, options).await
    }

    /// Pushes jobs through a named driver.
    pub async fn push_to(
        &self,
        driver: Option<&str>,
        jobs: Vec<QueuedJob>,
        options: &DispatchOptions,
    ) -> JobResult<Vec<JobId>> {
        let options = self.routed(options);
        match self.route(driver) {
            Some(driver) => driver.push(jobs, &options).await,
            None => self.run_inline(jobs, &options).await,
        }
    }

    async fn push_one(&self, job: QueuedJob, options: &DispatchOptions) -> JobResult<JobId> {
        self.push(vec![job], options)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| JobError::Internal("push returned no job id".to_string()))
    }

    /// Dispatches a job instance.
    pub async fn dispatch<J: Job + Serialize>(&self, job: &J) -> JobResult<JobId> {
        self.push_one(QueuedJob::new(job)?, &DispatchOptions::default()).await
    }

    /// Dispatches a job by type; the consumer constructs it from `args`.
    pub async fn dispatch_class<J: Job>(&self, args: Map<String, Value>) -> JobResult<JobId> {
        self.push_one(QueuedJob::class::<J>(args), &DispatchOptions::default())
            .await
    }

    /// Dispatches a job that becomes eligible at `when`.
    pub async fn dispatch_after<J: Job + Serialize>(&self, job: &J, when: impl Into<When>) -> JobResult<JobId> {
        self.schedule(QueuedJob::new(job)?, when.into(), &DispatchOptions::default())
            .await
    }

    /// Runs a job inline regardless of the execution context.
    pub async fn dispatch_now<J: Job + Serialize>(&self, job: &J) -> JobResult<JobId> {
        let ids = self
            .run_inline(vec![QueuedJob::new(job)?], &DispatchOptions::default())
            .await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| JobError::Internal("push returned no job id".to_string()))
    }

    /// Schedules a job on the default driver.
    pub async fn schedule(&self, job: QueuedJob, when: When, options: &DispatchOptions) -> JobResult<JobId> {
        let options = self.routed(options);
        match self.route(None) {
            Some(driver) => driver.schedule(job, when, &options).await,
            None => self.inline.schedule(job, when, &options).await,
        }
    }

    /// Pushes jobs in order on the default driver.
    pub async fn chain(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>> {
        let options = self.routed(options);
        match self.route(None) {
            Some(driver) => driver.chain(jobs, &options).await,
            None => self.inline.chain(jobs, &options).await,
        }
    }

    /// Pushes jobs with no ordering on the default driver.
    pub async fn batch(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>> {
        let options = self.routed(options);
        match self.route(None) {
            Some(driver) => driver.batch(jobs, &options).await,
            None => self.inline.batch(jobs, &options).await,
        }
    }

    /// Runs a driver's consume loop.
    pub async fn consume(&self, driver: Option<&str>, options: &ConsumeOptions) -> JobResult<()> {
        self.driver(driver)?.consume(options).await
    }

    /// Moves a driver's failed jobs back to pending.
    pub async fn retry(&self, driver: Option<&str>, options: &ConsumeOptions) -> JobResult<u64> {
        self.driver(driver)?.retry(options).await
    }

    /// Requests cancellation of a running job in this process.
    pub fn cancel_job(&self, job_id: &JobId, reason: &str) -> bool {
        self.state.cancel_job(job_id, reason)
    }

    /// Cancels running jobs whose context matches. Returns how many.
    pub fn cancel_jobs_by_context<F>(&self, predicate: F, reason: &str) -> usize
    where
        F: Fn(&Map<String, Value>) -> bool,
    {
        self.state.cancel_jobs_by_context(predicate, reason)
    }

    /// Cancels a job wherever it runs: here through the state manager, and in
    /// other processes through the tracker's history table, which running
    /// jobs poll with [`JobContext::validate_or_cancel`](crate::job::JobContext::validate_or_cancel).
    /// Returns the history rows changed.
    pub async fn cancel_tracked_job(&self, job_id: &JobId, reason: &str) -> JobResult<u64> {
        let tracker = self.tracker.as_ref().ok_or_else(|| {
            JobError::Configuration("Cross-process cancellation needs job tracking".to_string())
        })?;
        self.state.cancel_job(job_id, reason);
        tracker.cancel_job(job_id, reason).await
    }

    /// Jobs currently processing in this process.
    pub fn get_active_jobs(&self) -> Vec<ActiveJob> {
        self.state.get_active_jobs()
    }

    /// Job counts per status from whichever history is configured.
    pub async fn job_stats(&self, queue: Option<&str>) -> JobResult<JobStats> {
        match &self.history {
            Some(History::Tracker(tracker)) => tracker.get_job_stats(queue).await,
            Some(History::Database(driver)) => driver.stats(queue).await,
            None => Err(JobError::Configuration(
                "No job history configured; enable tracking or use the database driver".to_string(),
            )),
        }
    }
}

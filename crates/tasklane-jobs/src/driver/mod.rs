//! Queue drivers.
//!
//! Every backend implements [`Driver`]. Options passed to an operation are
//! merged over the driver's defaults, the call's values winning.

mod amqp;
mod database;
mod inline;
mod redis;

pub use self::redis::{MemoryRedis, PooledRedis, RedisCommands, RedisDriver, RedisKeys};
pub use amqp::{AmqpDelivery, AmqpDriver, AmqpTransport, DeliveryStream, LapinTransport, MemoryBroker, Publication};
pub use database::DatabaseDriver;
pub use inline::AsyncDriver;

use crate::envelope::QueuedJob;
use crate::error::{JobError, JobResult};
use crate::job::JobId;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use std::time::Duration;

/// When a job becomes eligible to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum When {
    /// Immediately.
    #[default]
    Now,
    /// After a delay from the moment of the push.
    In(Duration),
    /// At a point in time.
    At(DateTime<Utc>),
}

impl When {
    /// Resolves to an absolute time relative to `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            When::Now => now,
            When::In(delay) => chrono::Duration::from_std(*delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            When::At(at) => *at,
        }
    }

    /// Parses a schedule expression.
    ///
    /// Accepts `now`, `"<n> seconds|minutes|hours|days"`, RFC 3339,
    /// `YYYY-MM-DD HH:MM:SS` (read in `tz`), or a Unix timestamp.
    pub fn parse(expr: &str, tz: FixedOffset) -> JobResult<Self> {
        let expr = expr.trim();
        if expr.is_empty() || expr.eq_ignore_ascii_case("now") {
            return Ok(When::Now);
        }

        if let Some((amount, unit)) = expr.split_once(char::is_whitespace) {
            if let Ok(amount) = amount.parse::<u64>() {
                let unit = unit.trim().to_ascii_lowercase();
                let seconds = match unit.trim_end_matches('s') {
                    "second" | "sec" => 1,
                    "minute" | "min" => 60,
                    "hour" => 3600,
                    "day" => 86_400,
                    _ => return Err(JobError::InvalidSchedule(expr.to_string())),
                };
                return Ok(When::In(Duration::from_secs(amount.saturating_mul(seconds))));
            }
        }

        if let Ok(at) = DateTime::parse_from_rfc3339(expr) {
            return Ok(When::At(at.with_timezone(&Utc)));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(expr, crate::config::TIMESTAMP_FORMAT) {
            if let Some(local) = tz.from_local_datetime(&naive).single() {
                return Ok(When::At(local.with_timezone(&Utc)));
            }
        }
        if let Ok(ts) = expr.parse::<i64>() {
            if let Some(at) = DateTime::from_timestamp(ts, 0) {
                return Ok(When::At(at));
            }
        }

        Err(JobError::InvalidSchedule(expr.to_string()))
    }
}

impl From<Duration> for When {
    fn from(delay: Duration) -> Self {
        When::In(delay)
    }
}

impl From<DateTime<Utc>> for When {
    fn from(at: DateTime<Utc>) -> Self {
        When::At(at)
    }
}

/// Options for `push`, `chain`, `batch` and `schedule`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Queue to push to, overriding the job's own.
    pub queue: Option<String>,

    /// Eligibility time; defaults to now.
    pub delay: Option<When>,

    /// Topic routing key, `domain.subtype.priority`.
    pub routing_key: Option<String>,

    /// Exchange to publish through, overriding the driver's.
    pub exchange: Option<String>,
}

impl DispatchOptions {
    /// Options targeting `queue`.
    pub fn on_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Self::default()
        }
    }

    /// Sets the eligibility time.
    pub fn delay(mut self, when: impl Into<When>) -> Self {
        self.delay = Some(when.into());
        self
    }

    /// Sets the routing key.
    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    /// Sets the exchange.
    pub fn to_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Overlays `overrides` on `self`. Fields set in `overrides` win.
    pub fn merge(&self, overrides: &DispatchOptions) -> DispatchOptions {
        DispatchOptions {
            queue: overrides.queue.clone().or_else(|| self.queue.clone()),
            delay: overrides.delay.or(self.delay),
            routing_key: overrides.routing_key.clone().or_else(|| self.routing_key.clone()),
            exchange: overrides.exchange.clone().or_else(|| self.exchange.clone()),
        }
    }

    /// Queue for `job`: explicit option, then the job's, then `fallback`.
    pub fn queue_for<'a>(&'a self, job: &'a QueuedJob, fallback: &'a str) -> &'a str {
        self.queue.as_deref().or(job.queue()).unwrap_or(fallback)
    }
}

/// Options for `consume` and `retry`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Queue to work on.
    pub queue: Option<String>,

    /// Sleep between empty polls.
    pub poll_interval: Option<Duration>,

    /// Jobs taken per poll, for polling drivers.
    pub batch_size: Option<usize>,

    /// Attempt budget, for drivers that count attempts.
    pub attempts: Option<u32>,
}

impl ConsumeOptions {
    /// Options targeting `queue`.
    pub fn on_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Self::default()
        }
    }

    /// Overlays `overrides` on `self`. Fields set in `overrides` win.
    pub fn merge(&self, overrides: &ConsumeOptions) -> ConsumeOptions {
        ConsumeOptions {
            queue: overrides.queue.clone().or_else(|| self.queue.clone()),
            poll_interval: overrides.poll_interval.or(self.poll_interval),
            batch_size: overrides.batch_size.or(self.batch_size),
            attempts: overrides.attempts.or(self.attempts),
        }
    }
}

/// A queue backend.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Driver: Send + Sync {
    /// Name the driver is registered under.
    fn name(&self) -> &'static str;

    /// Enqueues jobs. Returns one ID per job, in order.
    async fn push(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>>;

    /// Processes jobs until the task is dropped. Survives job failures.
    async fn consume(&self, options: &ConsumeOptions) -> JobResult<()>;

    /// Moves failed jobs back to pending. Returns how many moved.
    async fn retry(&self, options: &ConsumeOptions) -> JobResult<u64>;

    /// Pushes jobs so that job N+1 is never pushed before job N.
    async fn chain(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.extend(self.push(vec![job], options).await?);
        }
        Ok(ids)
    }

    /// Pushes jobs with no ordering guarantee.
    async fn batch(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>> {
        self.push(jobs, options).await
    }

    /// Pushes a job that becomes eligible at `when`.
    async fn schedule(&self, job: QueuedJob, when: When, options: &DispatchOptions) -> JobResult<JobId> {
        let options = options.clone().delay(when);
        let ids = self.push(vec![job], &options).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| JobError::Internal("push returned no job id".to_string()))
    }
}

//! Redis driver: a list per queue, a sorted set for delayed jobs and a list
//! for failures.

use super::{ConsumeOptions, DispatchOptions, Driver};
use crate::config::RedisDriverConfig;
use crate::envelope::QueuedJob;
use crate::error::{JobError, JobResult};
use crate::executor::{Execution, JobExecutor, Outcome};
use crate::job::JobId;
use crate::metrics::JobMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn, Instrument};

const NAME: &str = "redis";

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisDriverConfig) -> JobResult<Pool> {
    info!("Creating Redis connection pool for job queue...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING").query_async::<String>(&mut *conn).await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for job queues.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    queue_prefix: String,
    delayed_prefix: String,
    failed_prefix: String,
}

impl RedisKeys {
    /// Key builder using the prefixes of `config`.
    pub fn new(config: &RedisDriverConfig) -> Self {
        Self {
            queue_prefix: config.queue_prefix.clone(),
            delayed_prefix: config.delayed_prefix.clone(),
            failed_prefix: config.failed_prefix.clone(),
        }
    }

    /// Pending list.
    pub fn queue(&self, queue_name: &str) -> String {
        format!("{}{}", self.queue_prefix, queue_name)
    }

    /// Delayed jobs (sorted set by due Unix seconds).
    pub fn delayed(&self, queue_name: &str) -> String {
        format!("{}{}", self.delayed_prefix, queue_name)
    }

    /// Failed list.
    pub fn failed(&self, queue_name: &str) -> String {
        format!("{}{}", self.failed_prefix, queue_name)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new(&RedisDriverConfig::default())
    }
}

/// The Redis commands the driver issues.
#[async_trait]
pub trait RedisCommands: Send + Sync {
    /// `RPUSH key value`.
    async fn rpush(&self, key: &str, value: &str) -> JobResult<()>;

    /// `LPOP key`.
    async fn lpop(&self, key: &str) -> JobResult<Option<String>>;

    /// `BLPOP key timeout`; `None` on timeout.
    async fn blpop(&self, key: &str, timeout: Duration) -> JobResult<Option<String>>;

    /// `ZADD key score member`.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> JobResult<()>;

    /// `ZRANGEBYSCORE key -inf max`.
    async fn zrangebyscore(&self, key: &str, max: i64) -> JobResult<Vec<String>>;

    /// `ZREM key member`. Returns true if the member was removed.
    async fn zrem(&self, key: &str, member: &str) -> JobResult<bool>;

    /// `LLEN key`.
    async fn llen(&self, key: &str) -> JobResult<u64>;

    /// `ZCARD key`.
    async fn zcard(&self, key: &str) -> JobResult<u64>;
}

/// Commands over a deadpool connection pool.
#[derive(Clone)]
pub struct PooledRedis {
    pool: Pool,
}

impl PooledRedis {
    /// Wraps an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl RedisCommands for PooledRedis {
    async fn rpush(&self, key: &str, value: &str) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn lpop(&self, key: &str) -> JobResult<Option<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.lpop(key, None).await?)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> JobResult<Option<String>> {
        let mut conn = self.conn().await?;
        // BLPOP 0 blocks forever
        if timeout.is_zero() {
            return Ok(conn.lpop(key, None).await?);
        }
        let popped: Option<(String, String)> = conn.blpop(key, timeout.as_secs_f64()).await?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrangebyscore(&self, key: &str, max: i64) -> JobResult<Vec<String>> {
        let mut conn = self.conn().await?;
        Ok(conn.zrangebyscore(key, "-inf", max).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> JobResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn llen(&self, key: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(key).await?)
    }

    async fn zcard(&self, key: &str) -> JobResult<u64> {
        let mut conn = self.conn().await?;
        Ok(conn.zcard(key).await?)
    }
}

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    sorted: HashMap<String, Vec<(i64, String)>>,
}

/// In-process stand-in for a Redis server.
///
/// Lists and sorted sets only. `blpop` wakes on pushes from other tasks.
#[derive(Default)]
pub struct MemoryRedis {
    state: Mutex<MemoryState>,
    pushed: Notify,
}

impl MemoryRedis {
    /// Creates an empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn pop_front(&self, key: &str) -> Option<String> {
        self.state.lock().lists.get_mut(key).and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl RedisCommands for MemoryRedis {
    async fn rpush(&self, key: &str, value: &str) -> JobResult<()> {
        self.state
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn lpop(&self, key: &str) -> JobResult<Option<String>> {
        Ok(self.pop_front(key))
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> JobResult<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.pop_front(key) {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> JobResult<()> {
        let mut state = self.state.lock();
        let set = state.sorted.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        let at = set.partition_point(|(s, m)| (*s, m.as_str()) <= (score, member));
        set.insert(at, (score, member.to_string()));
        Ok(())
    }

    async fn zrangebyscore(&self, key: &str, max: i64) -> JobResult<Vec<String>> {
        let state = self.state.lock();
        Ok(state
            .sorted
            .get(key)
            .map(|set| {
                set.iter()
                    .take_while(|(score, _)| *score <= max)
                    .map(|(_, member)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrem(&self, key: &str, member: &str) -> JobResult<bool> {
        let mut state = self.state.lock();
        let Some(set) = state.sorted.get_mut(key) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|(_, m)| m != member);
        Ok(set.len() < before)
    }

    async fn llen(&self, key: &str) -> JobResult<u64> {
        Ok(self.state.lock().lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn zcard(&self, key: &str) -> JobResult<u64> {
        Ok(self.state.lock().sorted.get(key).map_or(0, |s| s.len() as u64))
    }
}

/// Driver storing envelopes in Redis lists.
pub struct RedisDriver {
    redis: Arc<dyn RedisCommands>,
    config: RedisDriverConfig,
    executor: JobExecutor,
    keys: RedisKeys,
}

impl RedisDriver {
    /// Connects a pool and returns a driver over it.
    pub async fn connect(config: RedisDriverConfig, executor: JobExecutor) -> JobResult<Self> {
        let pool = create_pool(&config).await?;
        Ok(Self::new(Arc::new(PooledRedis::new(pool)), config, executor))
    }

    /// Creates a driver over any command implementation.
    pub fn new(redis: Arc<dyn RedisCommands>, config: RedisDriverConfig, executor: JobExecutor) -> Self {
        let keys = RedisKeys::new(&config);
        Self {
            redis,
            config,
            executor,
            keys,
        }
    }

    /// Key layout in use.
    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// Moves due delayed jobs onto the pending list.
    pub async fn promote_due(&self, queue: &str) -> JobResult<u64> {
        let delayed = self.keys.delayed(queue);
        let due = self.redis.zrangebyscore(&delayed, Utc::now().timestamp()).await?;

        let mut moved = 0u64;
        for payload in due {
            // another consumer may have promoted it already
            if self.redis.zrem(&delayed, &payload).await? {
                self.redis.rpush(&self.keys.queue(queue), &payload).await?;
                moved += 1;
            }
        }

        if moved > 0 {
            debug!(queue, count = moved, "Promoted delayed jobs");
            JobMetrics::jobs_promoted(queue, moved);
        }
        Ok(moved)
    }

    /// Runs one consume iteration: promote, pop, execute.
    ///
    /// Returns true if a job was popped.
    pub async fn work_once(&self, queue: &str) -> JobResult<bool> {
        self.promote_due(queue).await?;

        let Some(payload) = self
            .redis
            .blpop(&self.keys.queue(queue), self.config.blocking_timeout())
            .await?
        else {
            return Ok(false);
        };

        let exec = Execution {
            driver: NAME,
            attempts: 0,
        };
        let Some((envelope, report)) = self.executor.execute_payload(payload.as_bytes(), exec).await else {
            return Ok(true);
        };

        if let Outcome::Failed { error } = &report.outcome {
            debug!(job_id = %envelope.job_id, error = %error, "Moving job to failed list");
            self.redis.rpush(&self.keys.failed(queue), &payload).await?;
        }
        Ok(true)
    }

    async fn consume_loop(&self, queue: &str, poll_interval: Duration) -> JobResult<()> {
        info!("Redis consumer started");
        loop {
            match self.work_once(queue).await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(poll_interval).await,
                Err(e) => {
                    warn!(error = %e, "Redis consume iteration failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    fn queue_name(&self, options: &ConsumeOptions) -> String {
        options.queue.clone().unwrap_or_else(|| self.config.queue.clone())
    }

    async fn push_one(&self, job: QueuedJob, options: &DispatchOptions, now: DateTime<Utc>) -> JobResult<JobId> {
        let queue = options.queue_for(&job, &self.config.queue).to_string();
        let available_at = options.delay.unwrap_or_default().resolve(now);
        let envelope = job.into_envelope(&queue, available_at);
        let payload = envelope.encode()?;

        if available_at > now {
            self.redis
                .zadd(&self.keys.delayed(&queue), &payload, due_score(available_at))
                .await?;
            debug!(job_id = %envelope.job_id, queue = %queue, available_at = %available_at, "Enqueued delayed job");
        } else {
            self.redis.rpush(&self.keys.queue(&queue), &payload).await?;
            debug!(job_id = %envelope.job_id, queue = %queue, "Enqueued job");
        }

        JobMetrics::jobs_pushed(NAME, &queue, 1);
        Ok(envelope.job_id)
    }
}

/// Sorted-set score for a job due at `at`: Unix seconds, rounded up so
/// promotion never happens before `at`.
fn due_score(at: DateTime<Utc>) -> i64 {
    at.timestamp() + i64::from(at.timestamp_subsec_nanos() > 0)
}

#[async_trait]
impl Driver for RedisDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn push(&self, jobs: Vec<QueuedJob>, options: &DispatchOptions) -> JobResult<Vec<JobId>> {
        let now = Utc::now();
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            ids.push(self.push_one(job, options, now).await?);
        }
        Ok(ids)
    }

    async fn consume(&self, options: &ConsumeOptions) -> JobResult<()> {
        let queue = self.queue_name(options);
        let poll_interval = options.poll_interval.unwrap_or_else(|| self.config.poll_interval());
        let span = tracing::info_span!("consume", driver = NAME, queue = %queue);
        self.consume_loop(&queue, poll_interval).instrument(span).await
    }

    async fn retry(&self, options: &ConsumeOptions) -> JobResult<u64> {
        let queue = self.queue_name(options);
        let failed = self.keys.failed(&queue);
        let pending = self.keys.queue(&queue);

        let mut moved = 0u64;
        while let Some(payload) = self.redis.lpop(&failed).await? {
            self.redis.rpush(&pending, &payload).await?;
            moved += 1;
        }

        info!(queue = %queue, count = moved, "Moved failed jobs back to queue");
        JobMetrics::jobs_retried(NAME, &queue, moved);
        Ok(moved)
    }
}

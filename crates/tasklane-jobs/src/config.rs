//! Queue configuration.

use crate::error::{JobError, JobResult};
use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Format used for timestamps written to record tables.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Configuration for the queue system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Driver used when a dispatch does not name one.
    #[serde(default = "default_driver")]
    pub default: String,

    /// Per-driver settings. Only configured drivers are started.
    #[serde(default)]
    pub drivers: DriversConfig,

    /// Durable status history.
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Topic exchange resolving routing keys to queues.
    #[serde(default)]
    pub exchange: Option<ExchangeConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default: default_driver(),
            drivers: DriversConfig::default(),
            tracking: TrackingConfig::default(),
            exchange: None,
        }
    }
}

/// A topic exchange and its queue bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Exchange name.
    pub name: String,

    /// Queues and the patterns they bind with.
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

/// One queue bound to an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    pub queue: String,
    pub pattern: String,
}

fn default_driver() -> String {
    "async".to_string()
}

impl QueueConfig {
    /// Checks settings that must be right before anything connects.
    pub fn validate(&self) -> JobResult<()> {
        let configured = match self.default.as_str() {
            "async" => true,
            "database" => self.drivers.database.is_some(),
            "redis" => self.drivers.redis.is_some(),
            "amqp" => self.drivers.amqp.is_some(),
            other => {
                return Err(JobError::Configuration(format!(
                    "Unknown default driver: {other}"
                )))
            }
        };
        if !configured {
            return Err(JobError::Configuration(format!(
                "Default driver {} has no [drivers.{}] section",
                self.default, self.default
            )));
        }

        if let Some(db) = &self.drivers.database {
            db.validate()?;
        }
        if let Some(redis) = &self.drivers.redis {
            if redis.url.is_empty() {
                return Err(JobError::Configuration("Redis URL is required".to_string()));
            }
        }
        if let Some(amqp) = &self.drivers.amqp {
            amqp.validate()?;
        }
        parse_tz(&self.tracking.tz)?;
        Ok(())
    }

    /// Returns true if the tracker should record history.
    ///
    /// The database driver keeps status in its own table, so the tracker is
    /// off when it is the default driver.
    pub fn tracking_active(&self) -> bool {
        self.tracking.enabled && self.tracking.url.is_some() && self.default != "database"
    }
}

/// Settings of every driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriversConfig {
    /// Relational database driver.
    #[serde(default)]
    pub database: Option<DatabaseDriverConfig>,

    /// Redis driver.
    #[serde(default)]
    pub redis: Option<RedisDriverConfig>,

    /// AMQP driver.
    #[serde(default)]
    pub amqp: Option<AmqpDriverConfig>,

    /// Inline driver, always available.
    #[serde(default, rename = "async")]
    pub inline: AsyncDriverConfig,
}

/// Database driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseDriverConfig {
    /// Connection URL (`postgres://`, `mysql://`, `sqlite:`).
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Jobs table.
    #[serde(default = "default_jobs_table")]
    pub table: String,

    /// Failed jobs table. When set, any failure is terminal.
    #[serde(default)]
    pub failed_table: Option<String>,

    /// Attempt budget per job.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Sleep between polls in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Rows reserved per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds after which a `processing` row is presumed abandoned and
    /// selected again. Zero disables reclaiming.
    #[serde(default = "default_reservation_timeout")]
    pub reservation_timeout_secs: u64,

    /// Offset for stored timestamps, `UTC` or `+HH:MM`.
    #[serde(default = "default_tz")]
    pub tz: String,

    /// Queue used when neither the job nor the dispatch names one.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Connection name written to failed rows.
    #[serde(default = "default_connection")]
    pub connection: String,
}

impl DatabaseDriverConfig {
    /// Config with defaults for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: default_max_connections(),
            table: default_jobs_table(),
            failed_table: None,
            attempts: default_attempts(),
            poll_interval_ms: default_poll_interval(),
            batch_size: default_batch_size(),
            reservation_timeout_secs: default_reservation_timeout(),
            tz: default_tz(),
            queue: default_queue(),
            connection: default_connection(),
        }
    }

    /// Returns the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the reservation timeout, `None` when reclaiming is off.
    pub fn reservation_timeout(&self) -> Option<Duration> {
        (self.reservation_timeout_secs > 0).then(|| Duration::from_secs(self.reservation_timeout_secs))
    }

    fn validate(&self) -> JobResult<()> {
        if self.url.is_empty() {
            return Err(JobError::Configuration("Database URL is required".to_string()));
        }
        if self.table.is_empty() {
            return Err(JobError::Configuration("Database jobs table is required".to_string()));
        }
        if self.attempts == 0 {
            return Err(JobError::Configuration("attempts must be at least 1".to_string()));
        }
        if self.batch_size == 0 {
            return Err(JobError::Configuration("batch_size must be at least 1".to_string()));
        }
        parse_tz(&self.tz)?;
        Ok(())
    }
}

/// Redis driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisDriverConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Prefix of pending lists.
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// Prefix of delayed sorted sets.
    #[serde(default = "default_delayed_prefix")]
    pub delayed_prefix: String,

    /// Prefix of failed lists.
    #[serde(default = "default_failed_prefix")]
    pub failed_prefix: String,

    /// Sleep after an empty pop in milliseconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// BLPOP timeout in seconds.
    #[serde(default = "default_blocking_timeout")]
    pub blocking_timeout_secs: u64,

    /// Queue used when neither the job nor the dispatch names one.
    #[serde(default = "default_queue")]
    pub queue: String,
}

impl Default for RedisDriverConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            queue_prefix: default_queue_prefix(),
            delayed_prefix: default_delayed_prefix(),
            failed_prefix: default_failed_prefix(),
            poll_interval_ms: default_poll_interval(),
            blocking_timeout_secs: default_blocking_timeout(),
            queue: default_queue(),
        }
    }
}

impl RedisDriverConfig {
    /// Returns the poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the BLPOP timeout as a Duration.
    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_secs(self.blocking_timeout_secs)
    }
}

/// AMQP driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmqpDriverConfig {
    /// Broker user.
    #[serde(default)]
    pub username: String,

    /// Broker password.
    #[serde(default)]
    pub password: String,

    /// Broker host.
    #[serde(default = "default_amqp_host")]
    pub host: String,

    /// Broker port.
    #[serde(default = "default_amqp_port")]
    pub port: u16,

    /// Virtual host.
    #[serde(default = "default_vhost")]
    pub vhost: String,

    /// Exchange to publish to; empty means the default exchange.
    #[serde(default)]
    pub exchange: String,

    /// Exchange kind declared for named exchanges.
    #[serde(default = "default_exchange_type")]
    pub exchange_type: String,

    /// Queue used when neither the job nor the dispatch names one.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Unacked deliveries a consumer may hold.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,

    /// Pause before a consumer resubscribes after a broker error.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Extra URI query string, e.g. `heartbeat=30`.
    #[serde(default)]
    pub connection_options: Option<String>,
}

impl AmqpDriverConfig {
    /// Builds the `amqp://` URI with percent-encoded credentials and vhost.
    pub fn uri(&self) -> String {
        let mut uri = format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        );
        if let Some(options) = self.connection_options.as_deref().filter(|o| !o.is_empty()) {
            uri.push('?');
            uri.push_str(options.trim_start_matches('?'));
        }
        uri
    }

    fn validate(&self) -> JobResult<()> {
        if self.username.is_empty() || self.password.is_empty() {
            return Err(JobError::Configuration(
                "AMQP username and password are required".to_string(),
            ));
        }
        if self.queue.is_empty() {
            return Err(JobError::Configuration("AMQP queue is required".to_string()));
        }
        if self.prefetch == 0 {
            return Err(JobError::Configuration("AMQP prefetch must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Inline driver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncDriverConfig {
    /// Await each job before `push` returns. When false jobs are spawned.
    #[serde(default = "default_blocking")]
    pub blocking: bool,

    /// Queue name reported to jobs.
    #[serde(default = "default_queue")]
    pub queue: String,
}

impl Default for AsyncDriverConfig {
    fn default() -> Self {
        Self {
            blocking: default_blocking(),
            queue: default_queue(),
        }
    }
}

/// Job history configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Record history at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Mirror tracked failures into the failed table.
    #[serde(default = "default_true")]
    pub track_failed: bool,

    /// Record store URL. Tracking is off without one.
    #[serde(default)]
    pub url: Option<String>,

    /// Connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// History table.
    #[serde(default = "default_jobs_table")]
    pub table: String,

    /// Failed jobs table.
    #[serde(default = "default_failed_table")]
    pub failed_table: String,

    /// Offset for stored timestamps.
    #[serde(default = "default_tz")]
    pub tz: String,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            track_failed: true,
            url: None,
            max_connections: default_max_connections(),
            table: default_jobs_table(),
            failed_table: default_failed_table(),
            tz: default_tz(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_blocking() -> bool {
    true
}

fn default_max_connections() -> u32 {
    5
}

fn default_jobs_table() -> String {
    "job".to_string()
}

fn default_failed_table() -> String {
    "failed_job".to_string()
}

fn default_attempts() -> u32 {
    3
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    10
}

fn default_reservation_timeout() -> u64 {
    90
}

fn default_tz() -> String {
    "UTC".to_string()
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_connection() -> String {
    "default".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_queue_prefix() -> String {
    "queue:".to_string()
}

fn default_delayed_prefix() -> String {
    "delayed:".to_string()
}

fn default_failed_prefix() -> String {
    "failed:".to_string()
}

fn default_blocking_timeout() -> u64 {
    5
}

fn default_amqp_host() -> String {
    "localhost".to_string()
}

fn default_amqp_port() -> u16 {
    5672
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_exchange_type() -> String {
    "topic".to_string()
}

fn default_prefetch() -> u16 {
    1
}

fn default_reconnect_interval_ms() -> u64 {
    1000
}

/// Parses `UTC`, `Z`, or a `+HH:MM` / `-HH:MM` offset.
pub fn parse_tz(tz: &str) -> JobResult<FixedOffset> {
    let tz = tz.trim();
    if tz.is_empty() || tz.eq_ignore_ascii_case("utc") || tz == "Z" {
        return FixedOffset::east_opt(0)
            .ok_or_else(|| JobError::Internal("zero offset out of range".to_string()));
    }

    let invalid = || JobError::Configuration(format!("Invalid tz offset: {tz}"));
    let (sign, rest) = match tz.as_bytes()[0] {
        b'+' => (1, &tz[1..]),
        b'-' => (-1, &tz[1..]),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if hours > 23 || minutes > 59 {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

/// Formats `at` in `tz` for storage.
pub fn format_timestamp(at: DateTime<Utc>, tz: FixedOffset) -> String {
    at.with_timezone(&tz).format(TIMESTAMP_FORMAT).to_string()
}

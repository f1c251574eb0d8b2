//! Builds a [`Queue`] from configuration.
//!
//! Every configured backend is connected here, so an unreachable database,
//! Redis server or broker fails startup rather than the first dispatch.

use crate::config::QueueConfig;
use crate::driver::{AmqpDriver, AsyncDriver, DatabaseDriver, RedisDriver};
use crate::error::JobResult;
use crate::exchange::TopicExchange;
use crate::executor::JobExecutor;
use crate::queue::Queue;
use crate::registry::JobResolver;
use crate::state::JobStateManager;
use crate::store::SqlRecordStore;
use crate::tracker::JobTracker;
use std::sync::Arc;
use tracing::info;

impl Queue {
    /// Validates `config`, connects each configured driver and returns the
    /// queue.
    ///
    /// The tracker records history for every driver except the database
    /// driver, which keeps status in its own table.
    pub async fn from_config(config: &QueueConfig, resolver: Arc<dyn JobResolver>) -> JobResult<Self> {
        config.validate()?;

        let state = Arc::new(JobStateManager::new());
        let untracked = JobExecutor::new(resolver, state);

        let tracker = match (&config.tracking.url, config.tracking_active()) {
            (Some(url), true) => {
                let store = SqlRecordStore::connect(url, config.tracking.max_connections).await?;
                Some(Arc::new(JobTracker::new(Arc::new(store), config.tracking.clone())?))
            }
            _ => None,
        };
        let tracked = match &tracker {
            Some(tracker) => untracked.clone().with_tracker(tracker.clone()),
            None => untracked.clone(),
        };

        let mut queue = Queue::new(config.default.clone(), tracked.clone());
        queue.add_driver(Arc::new(AsyncDriver::new(
            tracked.clone(),
            config.drivers.inline.clone(),
        )));

        let mut database = None;
        if let Some(db) = &config.drivers.database {
            let store = SqlRecordStore::connect(&db.url, db.max_connections).await?;
            let driver = Arc::new(DatabaseDriver::new(Arc::new(store), db.clone(), untracked.clone())?);
            queue.add_driver(driver.clone());
            database = Some(driver);
        }
        if let Some(redis) = &config.drivers.redis {
            let driver = RedisDriver::connect(redis.clone(), tracked.clone()).await?;
            queue.add_driver(Arc::new(driver));
        }
        if let Some(amqp) = &config.drivers.amqp {
            let driver = AmqpDriver::connect(amqp.clone(), tracked.clone()).await?;
            queue.add_driver(Arc::new(driver));
        }

        info!(
            default = %config.default,
            drivers = ?queue.driver_names(),
            tracking = tracker.is_some(),
            exchange = ?config.exchange.as_ref().map(|e| e.name.as_str()),
            "Queue initialized"
        );

        if let Some(exchange) = &config.exchange {
            queue = queue.with_exchange(TopicExchange::from_config(exchange));
        }
        Ok(match (tracker, database) {
            (Some(tracker), _) => queue.with_tracker(tracker),
            (None, Some(database)) => queue.with_database_stats(database),
            (None, None) => queue,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseDriverConfig;
    use crate::error::JobError;
    use crate::registry::JobRegistry;

    #[tokio::test]
    async fn test_default_config_builds_inline_queue() {
        let queue = Queue::from_config(&QueueConfig::default(), Arc::new(JobRegistry::new()))
            .await
            .unwrap();

        assert_eq!(queue.default_driver(), "async");
        assert_eq!(queue.driver_names(), vec!["async"]);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_connecting() {
        let config = QueueConfig {
            default: "redis".to_string(),
            ..QueueConfig::default()
        };

        let err = Queue::from_config(&config, Arc::new(JobRegistry::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, JobError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_database_driver_from_config() {
        let mut config = QueueConfig {
            default: "database".to_string(),
            ..QueueConfig::default()
        };
        let mut db = DatabaseDriverConfig::new("sqlite::memory:");
        db.max_connections = 1;
        config.drivers.database = Some(db);

        let queue = Queue::from_config(&config, Arc::new(JobRegistry::new()))
            .await
            .unwrap();

        assert_eq!(queue.driver_names(), vec!["async", "database"]);
        assert_eq!(queue.driver(None).unwrap().name(), "database");
    }
}

//! RedisDriver over the in-process Redis stand-in.

mod common;

use chrono::Utc;
use common::{executor, BrokenJob, CountJob, COUNT_RUNS};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tasklane_jobs::{
    ConsumeOptions, DispatchOptions, Driver, MemoryRedis, QueuedJob, RedisCommands, RedisDriver, RedisDriverConfig,
    When,
};

fn driver() -> (Arc<MemoryRedis>, RedisDriver) {
    let redis = Arc::new(MemoryRedis::new());
    let config = RedisDriverConfig {
        blocking_timeout_secs: 0,
        poll_interval_ms: 10,
        ..RedisDriverConfig::default()
    };
    (redis.clone(), RedisDriver::new(redis, config, executor()))
}

#[tokio::test]
async fn test_past_delayed_jobs_are_promoted_in_one_iteration() {
    let (redis, driver) = driver();
    let past = Utc::now() - chrono::Duration::seconds(60);

    for _ in 0..3 {
        driver
            .schedule(
                QueuedJob::new(&CountJob::default()).unwrap(),
                When::At(past),
                &DispatchOptions::default(),
            )
            .await
            .unwrap();
    }
    // due times in the past push straight to the list
    assert_eq!(redis.llen("queue:default").await.unwrap(), 3);

    for _ in 0..3 {
        let payload = QueuedJob::new(&CountJob::default())
            .unwrap()
            .into_envelope("default", past)
            .encode()
            .unwrap();
        redis
            .zadd("delayed:default", &payload, past.timestamp())
            .await
            .unwrap();
    }

    assert!(driver.work_once("default").await.unwrap());
    assert_eq!(redis.zcard("delayed:default").await.unwrap(), 0);
    assert_eq!(redis.llen("queue:default").await.unwrap(), 5);
}

#[tokio::test]
async fn test_future_job_is_not_consumed_early() {
    let (redis, driver) = driver();
    driver
        .schedule(
            QueuedJob::new(&CountJob::default()).unwrap(),
            When::In(Duration::from_secs(3600)),
            &DispatchOptions::default(),
        )
        .await
        .unwrap();

    assert!(!driver.work_once("default").await.unwrap());
    assert_eq!(redis.zcard("delayed:default").await.unwrap(), 1);
}

#[tokio::test]
async fn test_consume_loop_processes_pushed_jobs() {
    let (redis, driver) = driver();
    let driver = Arc::new(driver);
    let before = COUNT_RUNS.load(Ordering::SeqCst);

    let worker = tokio::spawn({
        let driver = driver.clone();
        async move { driver.consume(&ConsumeOptions::default()).await }
    });

    driver
        .push(
            vec![
                QueuedJob::new(&CountJob::default()).unwrap(),
                QueuedJob::new(&BrokenJob { reason: "x".into() }).unwrap(),
            ],
            &DispatchOptions::default(),
        )
        .await
        .unwrap();

    for _ in 0..200 {
        if redis.llen("failed:default").await.unwrap() == 1 && redis.llen("queue:default").await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    worker.abort();

    assert!(COUNT_RUNS.load(Ordering::SeqCst) > before);
    assert_eq!(redis.llen("failed:default").await.unwrap(), 1);
}

#[tokio::test]
async fn test_retry_with_empty_failed_list_is_noop() {
    let (redis, driver) = driver();
    assert_eq!(driver.retry(&ConsumeOptions::default()).await.unwrap(), 0);
    assert_eq!(redis.llen("queue:default").await.unwrap(), 0);
}

#[tokio::test]
async fn test_job_queue_overrides_config_queue() {
    let (redis, driver) = driver();
    driver
        .push(
            vec![QueuedJob::new(&CountJob::default()).unwrap().on_queue("reports")],
            &DispatchOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(redis.llen("queue:reports").await.unwrap(), 1);
    assert_eq!(redis.llen("queue:default").await.unwrap(), 0);
}

//! DatabaseDriver against an in-memory SQLite database.

mod common;

use common::{executor, sqlite_store, BrokenJob, CountJob};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tasklane_jobs::store::Query;
use tasklane_jobs::{
    ConsumeOptions, DatabaseDriver, DatabaseDriverConfig, DispatchOptions, Driver, QueuedJob, RecordStore,
    SqlRecordStore, When,
};

async fn driver(failed_table: Option<&str>) -> (Arc<SqlRecordStore>, DatabaseDriver) {
    let store = Arc::new(sqlite_store().await);
    let mut config = DatabaseDriverConfig::new("sqlite::memory:");
    config.failed_table = failed_table.map(str::to_string);
    config.attempts = 3;
    let driver = DatabaseDriver::new(store.clone(), config, executor()).expect("Failed to build driver");
    (store, driver)
}

fn broken() -> QueuedJob {
    QueuedJob::new(&BrokenJob {
        reason: "card declined".into(),
    })
    .unwrap()
}

#[tokio::test]
async fn test_immediate_job_is_consumed_and_deleted() {
    let (store, driver) = driver(None).await;
    driver
        .push(vec![QueuedJob::new(&CountJob::default()).unwrap()], &DispatchOptions::default())
        .await
        .unwrap();

    let ran = driver.process_batch(&ConsumeOptions::default()).await.unwrap();

    assert_eq!(ran, 1);
    assert_eq!(store.count(&Query::table("job")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_failure_without_failed_table_keeps_row() {
    let (store, driver) = driver(None).await;
    driver.push(vec![broken()], &DispatchOptions::default()).await.unwrap();

    driver.process_batch(&ConsumeOptions::default()).await.unwrap();

    let rows = store.get(&Query::table("job")).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["attempts"], json!(1));
    assert_eq!(rows[0]["status"], json!("pending"));
    assert_eq!(rows[0]["reserved_at"], Value::Null);
    assert_eq!(rows[0]["job_class"], json!("broken"));
    assert_eq!(store.count(&Query::table("failed_job")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_failure_with_failed_table_moves_row() {
    let (store, driver) = driver(Some("failed_job")).await;
    driver.push(vec![broken()], &DispatchOptions::default()).await.unwrap();

    driver.process_batch(&ConsumeOptions::default()).await.unwrap();

    assert_eq!(store.count(&Query::table("job")).await.unwrap(), 0);
    let failed = store.get(&Query::table("failed_job")).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0]["exception"].as_str().unwrap().contains("card declined"));
    assert_eq!(failed[0]["driver"], json!("database"));
    assert_eq!(failed[0]["queue"], json!("default"));
}

#[tokio::test]
async fn test_scheduled_job_waits_for_its_time() {
    let (store, driver) = driver(None).await;
    driver
        .schedule(
            QueuedJob::new(&CountJob::default()).unwrap(),
            When::In(Duration::from_secs(600)),
            &DispatchOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(driver.process_batch(&ConsumeOptions::default()).await.unwrap(), 0);
    assert_eq!(store.count(&Query::table("job")).await.unwrap(), 1);
}

#[tokio::test]
async fn test_retry_round_trip() {
    let (store, driver) = driver(Some("failed_job")).await;

    assert_eq!(driver.retry(&ConsumeOptions::default()).await.unwrap(), 0);

    driver
        .push(vec![broken(), broken()], &DispatchOptions::default())
        .await
        .unwrap();
    driver.process_batch(&ConsumeOptions::default()).await.unwrap();
    assert_eq!(store.count(&Query::table("failed_job")).await.unwrap(), 2);

    assert_eq!(driver.retry(&ConsumeOptions::default()).await.unwrap(), 2);
    assert_eq!(store.count(&Query::table("failed_job")).await.unwrap(), 0);

    let rows = store.get(&Query::table("job")).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r["attempts"] == json!(0)));
    assert!(rows.iter().all(|r| r["status"] == json!("pending")));
}

#[tokio::test]
async fn test_queues_are_isolated() {
    let (store, driver) = driver(None).await;
    driver
        .push(
            vec![QueuedJob::new(&CountJob::default()).unwrap()],
            &DispatchOptions::on_queue("reports"),
        )
        .await
        .unwrap();

    assert_eq!(driver.process_batch(&ConsumeOptions::default()).await.unwrap(), 0);
    assert_eq!(
        driver
            .process_batch(&ConsumeOptions::on_queue("reports"))
            .await
            .unwrap(),
        1
    );
    assert_eq!(store.count(&Query::table("job")).await.unwrap(), 0);
}

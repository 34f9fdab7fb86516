//! End-to-end tests for workers running against a shared store.
//!
//! These tests verify scheduling, kill propagation and single-worker
//! execution through the public worker entry point.


use std::collections::HashMap;
use std::time::Duration;

use crontab_lite::job::lock_key;
use crontab_lite::scheduler::ExecutionStatus;
use crontab_lite::store::MemoryStore;
use test_harness::{assert_eventually, delete_job, put_job, put_kill_marker, TestWorker};

/// Test 1: A job defined before startup runs within its first period
#[tokio::test]
async fn test_existing_job_runs_after_startup() {
    let store = MemoryStore::new();
    put_job(&store, "hello", "echo hi", "*/1 * * * * *").await;
    let mut worker = TestWorker::start(&store, "worker-1").await;

    let result = worker
        .next_result("hello", Duration::from_secs(2))
        .await
        .expect("job should run within two seconds");

    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.output_lossy().trim(), "hi");
    assert!(result.error.is_none());
    assert!(result.info.plan_time <= result.info.real_time);

    worker.shutdown().await;
}

/// Test 2: A job saved while the worker runs is picked up from the watch
#[tokio::test]
async fn test_job_saved_at_runtime_runs() {
    let store = MemoryStore::new();
    let mut worker = TestWorker::start(&store, "worker-1").await;

    put_job(&store, "late", "echo late", "* * * * * *").await;

    let result = worker
        .next_result("late", Duration::from_secs(3))
        .await
        .expect("job saved at runtime should run");
    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.output_lossy().trim(), "late");

    worker.shutdown().await;
}

/// Test 3: A kill marker terminates the running instance
#[tokio::test]
async fn test_kill_terminates_running_job() {
    let store = MemoryStore::new();
    let mut worker = TestWorker::start(&store, "worker-1").await;
    put_job(&store, "sleeper", "sleep 60", "* * * * * *").await;

    assert_eventually(
        || async { store.get(&lock_key("sleeper")).await.is_some() },
        Duration::from_secs(3),
        "job should be running and holding its lock",
    )
    .await;

    put_kill_marker(&store, "sleeper").await;

    let result = worker
        .next_result("sleeper", Duration::from_secs(3))
        .await
        .expect("killed job should report back");
    assert_eq!(result.status, ExecutionStatus::Cancelled);
    assert!(result.duration_ms() < 10_000);

    worker.shutdown().await;
}

/// Test 4: Deleting a job stops further executions
#[tokio::test]
async fn test_deleted_job_stops_running() {
    let store = MemoryStore::new();
    put_job(&store, "tick", "true", "* * * * * *").await;
    let mut worker = TestWorker::start(&store, "worker-1").await;
    worker
        .next_result("tick", Duration::from_secs(2))
        .await
        .expect("job should run before delete");

    delete_job(&store, "tick").await;
    // let an in-flight trigger, if any, finish
    tokio::time::sleep(Duration::from_millis(1200)).await;
    while worker.results.try_recv().is_ok() {}

    assert!(worker
        .next_result("tick", Duration::from_millis(2000))
        .await
        .is_none());

    worker.shutdown().await;
}

/// Test 5: Two workers share a job and each trigger runs on exactly one
#[tokio::test]
async fn test_each_trigger_runs_on_one_worker() {
    let store = MemoryStore::new();
    put_job(&store, "shared", "sleep 0.3; echo ran", "* * * * * *").await;
    let mut a = TestWorker::start(&store, "worker-a").await;
    let mut b = TestWorker::start(&store, "worker-b").await;

    let mut by_trigger: HashMap<_, Vec<ExecutionStatus>> = HashMap::new();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(3500);
    while tokio::time::Instant::now() < deadline {
        tokio::select! {
            Some(result) = a.next_result("shared", Duration::from_millis(200)) => {
                by_trigger.entry(result.info.plan_time).or_default().push(result.status);
            }
            Some(result) = b.next_result("shared", Duration::from_millis(200)) => {
                by_trigger.entry(result.info.plan_time).or_default().push(result.status);
            }
            else => {}
        }
    }

    assert!(!by_trigger.is_empty(), "shared job should have run");
    for (plan_time, statuses) in &by_trigger {
        let ran = statuses
            .iter()
            .filter(|s| **s == ExecutionStatus::Succeeded)
            .count();
        assert!(ran <= 1, "trigger {plan_time} ran {ran} times: {statuses:?}");
    }
    assert!(by_trigger
        .values()
        .flatten()
        .any(|s| *s == ExecutionStatus::Skipped));

    a.shutdown().await;
    b.shutdown().await;
}

/// Test 6: Shutdown kills running jobs and frees their locks
#[tokio::test]
async fn test_shutdown_cancels_running_jobs() {
    let store = MemoryStore::new();
    put_job(&store, "forever", "sleep 60", "* * * * * *").await;
    let worker = TestWorker::start(&store, "worker-1").await;

    assert_eventually(
        || async { store.get(&lock_key("forever")).await.is_some() },
        Duration::from_secs(3),
        "job should be running",
    )
    .await;

    tokio::time::timeout(Duration::from_secs(6), worker.shutdown())
        .await
        .expect("worker should stop after draining");
    assert_eq!(store.get(&lock_key("forever")).await, None);
}

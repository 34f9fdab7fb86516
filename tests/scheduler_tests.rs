use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use crontab_lite::config::WorkerConfig;
use crontab_lite::job::{Job, JobEvent};
use crontab_lite::scheduler::{ExecutionStatus, JobExecuteInfo, JobExecuteResult, Scheduler};
use crontab_lite::store::MemoryStore;
use crontab_lite::worker::Executor;

fn test_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: "worker-sched".to_string(),
        idle_sleep_ms: 100,
        ..WorkerConfig::default()
    }
}

fn test_scheduler() -> Scheduler {
    let config = test_config();
    let executor = Executor::new(Arc::new(MemoryStore::new()), &config);
    let (scheduler, _handle) = Scheduler::new(executor, &config);
    scheduler
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 6, 1, h, m, s).unwrap()
}

#[tokio::test]
async fn test_save_creates_plan() {
    let mut scheduler = test_scheduler();
    let now = at(12, 0, 3);

    scheduler.handle_job_event(JobEvent::save(Job::new("a", "true", "*/5 * * * * *")), now);

    assert_eq!(scheduler.plan_count(), 1);
    assert_eq!(scheduler.plan("a").unwrap().next_time, at(12, 0, 5));
    assert!(!scheduler.is_running("a"));
}

#[tokio::test]
async fn test_save_replaces_plan() {
    let mut scheduler = test_scheduler();
    let now = at(12, 0, 3);

    scheduler.handle_job_event(JobEvent::save(Job::new("a", "true", "*/5 * * * * *")), now);
    scheduler.handle_job_event(JobEvent::save(Job::new("a", "false", "0 * * * * *")), now);

    assert_eq!(scheduler.plan_count(), 1);
    let plan = scheduler.plan("a").unwrap();
    assert_eq!(plan.job.command, "false");
    assert_eq!(plan.next_time, at(12, 1, 0));
}

#[tokio::test]
async fn test_invalid_cron_keeps_previous_plan() {
    let mut scheduler = test_scheduler();
    let now = at(12, 0, 3);

    scheduler.handle_job_event(JobEvent::save(Job::new("a", "true", "*/5 * * * * *")), now);
    scheduler.handle_job_event(JobEvent::save(Job::new("a", "true", "not a cron")), now);

    assert_eq!(scheduler.plan("a").unwrap().job.cron_expr, "*/5 * * * * *");
}

#[tokio::test]
async fn test_invalid_cron_for_new_job_is_ignored() {
    let mut scheduler = test_scheduler();

    scheduler.handle_job_event(
        JobEvent::save(Job::new("bad", "true", "61 * * * * *")),
        at(12, 0, 0),
    );

    assert_eq!(scheduler.plan_count(), 0);
}

#[tokio::test]
async fn test_delete_removes_plan() {
    let mut scheduler = test_scheduler();
    let now = at(12, 0, 0);

    scheduler.handle_job_event(JobEvent::save(Job::new("a", "true", "* * * * * *")), now);
    scheduler.handle_job_event(JobEvent::delete("a"), now);
    // unknown names are a no-op
    scheduler.handle_job_event(JobEvent::delete("ghost"), now);

    assert_eq!(scheduler.plan_count(), 0);
}

#[tokio::test]
async fn test_idle_sleep_without_plans() {
    let mut scheduler = test_scheduler();

    assert_eq!(scheduler.try_schedule(at(12, 0, 0)), Duration::from_millis(100));
}

#[tokio::test]
async fn test_sleep_until_nearest_plan() {
    let mut scheduler = test_scheduler();
    let now = at(12, 0, 1);

    scheduler.handle_job_event(JobEvent::save(Job::new("slow", "true", "0 * * * * *")), now);
    scheduler.handle_job_event(JobEvent::save(Job::new("fast", "true", "*/10 * * * * *")), now);

    // nothing due yet: sleep until 12:00:10
    assert_eq!(scheduler.try_schedule(now), Duration::from_secs(9));
    assert_eq!(scheduler.running_count(), 0);
}

#[tokio::test]
async fn test_due_plan_is_dispatched_and_advanced() {
    let mut scheduler = test_scheduler();
    let now = at(12, 0, 0);
    scheduler.handle_job_event(JobEvent::save(Job::new("a", "sleep 5", "*/5 * * * * *")), now);

    let due = at(12, 0, 5);
    let sleep = scheduler.try_schedule(due);

    assert!(scheduler.is_running("a"));
    let info = scheduler.running("a").unwrap();
    assert_eq!(info.plan_time, due);
    assert_eq!(info.real_time, due);
    assert_eq!(scheduler.plan("a").unwrap().next_time, at(12, 0, 10));
    assert_eq!(sleep, Duration::from_secs(5));
}

#[tokio::test]
async fn test_overlapping_trigger_is_dropped() {
    let mut scheduler = test_scheduler();
    scheduler.handle_job_event(
        JobEvent::save(Job::new("a", "sleep 5", "* * * * * *")),
        at(12, 0, 0),
    );

    scheduler.try_schedule(at(12, 0, 1));
    let first = scheduler.running("a").unwrap().id;

    // the next two triggers find the first execution still running
    scheduler.try_schedule(at(12, 0, 2));
    scheduler.try_schedule(at(12, 0, 3));

    assert_eq!(scheduler.running_count(), 1);
    assert_eq!(scheduler.running("a").unwrap().id, first);
    assert_eq!(scheduler.plan("a").unwrap().next_time, at(12, 0, 4));
}

#[tokio::test]
async fn test_missed_triggers_collapse_to_one() {
    let mut scheduler = test_scheduler();
    scheduler.handle_job_event(JobEvent::save(Job::new("a", "true", "* * * * * *")), at(12, 0, 0));

    // the loop was stalled for 30 seconds
    let late = at(12, 0, 31) + chrono::Duration::milliseconds(500);
    scheduler.try_schedule(late);

    assert_eq!(scheduler.running_count(), 1);
    assert_eq!(scheduler.plan("a").unwrap().next_time, at(12, 0, 32));
}

#[tokio::test]
async fn test_kill_cancels_running_execution() {
    let mut scheduler = test_scheduler();
    scheduler.handle_job_event(
        JobEvent::save(Job::new("a", "sleep 5", "* * * * * *")),
        at(12, 0, 0),
    );
    scheduler.try_schedule(at(12, 0, 1));
    let token = scheduler.running("a").unwrap().cancel.clone();

    scheduler.handle_job_event(JobEvent::kill("a"), at(12, 0, 1));

    assert!(token.is_cancelled());
    // the entry stays until the executor reports back
    assert!(scheduler.is_running("a"));
}

#[tokio::test]
async fn test_kill_without_running_execution_is_noop() {
    let mut scheduler = test_scheduler();
    scheduler.handle_job_event(JobEvent::save(Job::new("a", "true", "* * * * * *")), at(12, 0, 0));

    scheduler.handle_job_event(JobEvent::kill("a"), at(12, 0, 0));
    scheduler.handle_job_event(JobEvent::kill("ghost"), at(12, 0, 0));

    assert_eq!(scheduler.plan_count(), 1);
    assert_eq!(scheduler.running_count(), 0);
}

#[tokio::test]
async fn test_delete_does_not_kill_running_execution() {
    let mut scheduler = test_scheduler();
    scheduler.handle_job_event(
        JobEvent::save(Job::new("a", "sleep 5", "* * * * * *")),
        at(12, 0, 0),
    );
    scheduler.try_schedule(at(12, 0, 1));
    let token = scheduler.running("a").unwrap().cancel.clone();

    scheduler.handle_job_event(JobEvent::delete("a"), at(12, 0, 1));

    assert_eq!(scheduler.plan_count(), 0);
    assert!(scheduler.is_running("a"));
    assert!(!token.is_cancelled());
}

#[tokio::test]
async fn test_result_retires_running_entry_and_is_broadcast() {
    let mut scheduler = test_scheduler();
    let mut results = scheduler.subscribe_results();
    scheduler.handle_job_event(
        JobEvent::save(Job::new("a", "sleep 5", "* * * * * *")),
        at(12, 0, 0),
    );
    scheduler.try_schedule(at(12, 0, 1));
    let info = scheduler.running("a").unwrap().clone();

    // a stale result from an older execution leaves the current one alone
    let stale = JobExecuteInfo::new(info.job.clone(), at(11, 0, 0), at(11, 0, 0));
    scheduler.handle_job_result(JobExecuteResult::skipped(stale, at(11, 0, 0)));
    assert!(scheduler.is_running("a"));

    scheduler.handle_job_result(JobExecuteResult::skipped(info.clone(), at(12, 0, 1)));
    assert!(!scheduler.is_running("a"));

    let _stale = results.recv().await.unwrap();
    let current = results.recv().await.unwrap();
    assert_eq!(current.info.id, info.id);
    assert_eq!(current.status, ExecutionStatus::Skipped);
}

#[tokio::test]
async fn test_run_loop_executes_jobs() {
    let config = test_config();
    let executor = Executor::new(Arc::new(MemoryStore::new()), &config);
    let (scheduler, handle) = Scheduler::new(executor, &config);
    let mut results = scheduler.subscribe_results();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(shutdown.clone()));

    handle
        .push_job_event(JobEvent::save(Job::new("hi", "echo hi", "* * * * * *")))
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), results.recv())
        .await
        .expect("job should run within two seconds")
        .unwrap();
    assert_eq!(result.name(), "hi");
    assert_eq!(result.status, ExecutionStatus::Succeeded);
    assert_eq!(result.output_lossy(), "hi\n");
    assert!(result.info.plan_time <= result.info.real_time);

    shutdown.cancel();
    task.await.unwrap();
    assert!(handle.is_closed());
}

#[tokio::test]
async fn test_shutdown_cancels_running_jobs() {
    let config = test_config();
    let executor = Executor::new(Arc::new(MemoryStore::new()), &config);
    let (scheduler, handle) = Scheduler::new(executor, &config);
    let mut results = scheduler.subscribe_results();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(scheduler.run(shutdown.clone()));

    handle
        .push_job_event(JobEvent::save(Job::new("long", "sleep 60", "* * * * * *")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(6), task)
        .await
        .expect("scheduler should stop after draining")
        .unwrap();

    let result = results.recv().await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Cancelled);
}

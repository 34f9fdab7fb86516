
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crontab_lite::job::{job_key, killer_key, Job, JobEvent, JobEventKind};
use crontab_lite::scheduler::SchedulerHandle;
use crontab_lite::store::{CoordinationStore, MemoryStore};
use crontab_lite::sync::{SyncAgent, SyncTasks};
use test_harness::{delete_job, put_job, put_kill_marker};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn test_agent(store: &MemoryStore) -> (SyncAgent, mpsc::Receiver<JobEvent>) {
    let (tx, rx) = mpsc::channel(100);
    let agent = SyncAgent::new(
        Arc::new(store.clone()),
        SchedulerHandle::new(tx),
        Duration::from_millis(50),
    );
    (agent, rx)
}

async fn start_agent(
    store: &MemoryStore,
) -> (SyncTasks, mpsc::Receiver<JobEvent>, CancellationToken) {
    let (agent, rx) = test_agent(store);
    let shutdown = CancellationToken::new();
    let tasks = agent.start(shutdown.clone()).await.unwrap();
    (tasks, rx, shutdown)
}

async fn next_event(rx: &mut mpsc::Receiver<JobEvent>) -> JobEvent {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for job event")
        .expect("event channel closed")
}

async fn assert_no_event(rx: &mut mpsc::Receiver<JobEvent>) {
    if let Ok(Some(event)) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
        panic!("unexpected job event: {event:?}");
    }
}

#[tokio::test]
async fn test_bootstrap_publishes_existing_jobs() {
    let store = MemoryStore::new();
    put_job(&store, "a", "echo a", "* * * * * *").await;
    put_job(&store, "b", "echo b", "*/5 * * * * *").await;
    let (mut agent, mut rx) = test_agent(&store);

    let revision = agent.bootstrap().await.unwrap();

    assert_eq!(revision, store.revision().await);
    let mut names = vec![next_event(&mut rx).await, next_event(&mut rx).await]
        .into_iter()
        .inspect(|event| assert_eq!(event.kind, JobEventKind::Save))
        .map(|event| event.job.name)
        .collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(agent.mirror().len(), 2);
}

#[tokio::test]
async fn test_bootstrap_of_empty_store() {
    let store = MemoryStore::new();
    let (mut agent, mut rx) = test_agent(&store);

    assert_eq!(agent.bootstrap().await.unwrap(), 1);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_watch_publishes_changes_after_bootstrap() {
    let store = MemoryStore::new();
    put_job(&store, "a", "echo a", "* * * * * *").await;
    let (_tasks, mut rx, _shutdown) = start_agent(&store).await;
    assert_eq!(next_event(&mut rx).await, JobEvent::save(Job::new("a", "echo a", "* * * * * *")));

    put_job(&store, "b", "echo b", "* * * * * *").await;
    assert_eq!(next_event(&mut rx).await, JobEvent::save(Job::new("b", "echo b", "* * * * * *")));

    put_job(&store, "a", "echo a2", "* * * * * *").await;
    assert_eq!(next_event(&mut rx).await, JobEvent::save(Job::new("a", "echo a2", "* * * * * *")));

    delete_job(&store, "a").await;
    assert_eq!(next_event(&mut rx).await, JobEvent::delete("a"));

    // nothing bootstrapped is replayed by the watch
    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn test_undecodable_job_is_skipped() {
    let store = MemoryStore::new();
    store.put(&job_key("garbage"), b"not json".to_vec()).await.unwrap();
    let (_tasks, mut rx, _shutdown) = start_agent(&store).await;

    store.put(&job_key("worse"), b"{".to_vec()).await.unwrap();
    put_job(&store, "good", "true", "* * * * * *").await;

    assert_eq!(next_event(&mut rx).await.job.name, "good");
}

#[tokio::test]
async fn test_job_is_named_after_its_key() {
    let store = MemoryStore::new();
    let (_tasks, mut rx, _shutdown) = start_agent(&store).await;

    let job = Job::new("other", "true", "* * * * * *");
    store.put(&job_key("real"), job.pack().unwrap()).await.unwrap();

    assert_eq!(next_event(&mut rx).await.job.name, "real");
}

#[tokio::test]
async fn test_rebootstrap_after_broken_watch_recovers_missed_changes() {
    let store = MemoryStore::new();
    put_job(&store, "a", "echo a", "* * * * * *").await;
    put_job(&store, "b", "echo b", "* * * * * *").await;
    let (_tasks, mut rx, _shutdown) = start_agent(&store).await;
    next_event(&mut rx).await;
    next_event(&mut rx).await;

    store.disconnect_watchers().await;
    delete_job(&store, "a").await;
    put_job(&store, "b", "echo b2", "* * * * * *").await;
    put_job(&store, "c", "echo c", "* * * * * *").await;

    let mut events = Vec::new();
    for _ in 0..3 {
        events.push(next_event(&mut rx).await);
    }
    assert!(events.contains(&JobEvent::delete("a")));
    assert!(events.contains(&JobEvent::save(Job::new("b", "echo b2", "* * * * * *"))));
    assert!(events.contains(&JobEvent::save(Job::new("c", "echo c", "* * * * * *"))));

    // no duplicates once the watch is back
    assert_no_event(&mut rx).await;

    put_job(&store, "d", "echo d", "* * * * * *").await;
    assert_eq!(next_event(&mut rx).await.job.name, "d");
}

#[tokio::test]
async fn test_kill_marker_becomes_kill_event() {
    let store = MemoryStore::new();
    let (_tasks, mut rx, _shutdown) = start_agent(&store).await;

    put_kill_marker(&store, "a").await;
    assert_eq!(next_event(&mut rx).await, JobEvent::kill("a"));

    // removal of the marker is not an event
    store.delete(&killer_key("a")).await.unwrap();
    assert_no_event(&mut rx).await;
}

#[tokio::test]
async fn test_kill_watch_resubscribes_after_disconnect() {
    let store = MemoryStore::new();
    let (_tasks, mut rx, _shutdown) = start_agent(&store).await;

    store.disconnect_watchers().await;
    // give both watches time to come back
    tokio::time::sleep(Duration::from_millis(300)).await;

    put_kill_marker(&store, "a").await;
    assert_eq!(next_event(&mut rx).await, JobEvent::kill("a"));
}

#[tokio::test]
async fn test_shutdown_stops_watch_tasks() {
    let store = MemoryStore::new();
    let (tasks, _rx, shutdown) = start_agent(&store).await;

    shutdown.cancel();

    tokio::time::timeout(Duration::from_secs(1), tasks.join())
        .await
        .expect("watch tasks should stop on shutdown");
}

#[tokio::test]
async fn test_watch_ends_when_scheduler_is_gone() {
    let store = MemoryStore::new();
    let (tasks, rx, _shutdown) = start_agent(&store).await;
    drop(rx);

    put_job(&store, "a", "true", "* * * * * *").await;
    put_kill_marker(&store, "a").await;

    tokio::time::timeout(Duration::from_secs(1), tasks.join())
        .await
        .expect("watch tasks should stop once the scheduler is gone");
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::{
    extract_job_name, extract_killer_name, Job, JobEvent, JOB_KILLER_DIR, JOB_SAVE_DIR,
};
use crate::scheduler::SchedulerHandle;
use crate::store::{CoordinationStore, WatchEvent, WatchStream};

/// Tasks started by [`SyncAgent::start`].
pub struct SyncTasks {
    pub jobs: JoinHandle<()>,
    pub killer: JoinHandle<()>,
}

impl SyncTasks {
    pub async fn join(self) {
        let _ = self.jobs.await;
        let _ = self.killer.await;
    }

    pub fn abort(&self) {
        self.jobs.abort();
        self.killer.abort();
    }
}

/// Mirrors `/cron/jobs/` and `/cron/killer/` into scheduler events.
///
/// The job namespace is read once (bootstrap) and then watched from the
/// revision right after that read, so every change is seen exactly once
/// relative to the snapshot. When a watch breaks, the agent re-reads the
/// namespace and diffs it against its mirror, emitting Save for new or
/// changed jobs and Delete for jobs that disappeared in the meantime.
///
/// Kill markers are pulses: a put becomes a Kill event, a delete (TTL
/// expiry) is ignored.
pub struct SyncAgent {
    store: Arc<dyn CoordinationStore>,
    scheduler: SchedulerHandle,
    mirror: HashMap<String, Job>,
    retry_backoff: Duration,
}

impl SyncAgent {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        scheduler: SchedulerHandle,
        retry_backoff: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            mirror: HashMap::new(),
            retry_backoff,
        }
    }

    /// Jobs currently mirrored, keyed by name.
    pub fn mirror(&self) -> &HashMap<String, Job> {
        &self.mirror
    }

    /// Bootstrap, subscribe both watches and spawn their consumers.
    ///
    /// Errors from the initial read or subscription are returned: they are
    /// fatal at worker startup. Later watch failures are retried internally.
    pub async fn start(mut self, shutdown: CancellationToken) -> Result<SyncTasks> {
        let revision = self.bootstrap().await?;
        let jobs_stream = self
            .store
            .watch_prefix(JOB_SAVE_DIR, Some(revision + 1))
            .await?;
        let killer_stream = self.store.watch_prefix(JOB_KILLER_DIR, None).await?;
        tracing::info!(
            jobs = self.mirror.len(),
            revision,
            "Job sync bootstrapped, watching for changes"
        );

        let killer = tokio::spawn(watch_killer(
            self.store.clone(),
            self.scheduler.clone(),
            killer_stream,
            self.retry_backoff,
            shutdown.clone(),
        ));
        let jobs = tokio::spawn(self.watch_jobs(jobs_stream, shutdown));

        Ok(SyncTasks { jobs, killer })
    }

    /// List the job namespace, publish what changed relative to the mirror,
    /// and return the store revision of the listing.
    pub async fn bootstrap(&mut self) -> Result<i64> {
        let snapshot = self.store.get_prefix(JOB_SAVE_DIR).await?;

        let mut listed = HashMap::with_capacity(snapshot.kvs.len());
        for kv in snapshot.kvs {
            if let Some(job) = decode_job(&kv.key, &kv.value) {
                listed.insert(job.name.clone(), job);
            }
        }

        let vanished: Vec<String> = self
            .mirror
            .keys()
            .filter(|name| !listed.contains_key(*name))
            .cloned()
            .collect();
        for name in vanished {
            self.mirror.remove(&name);
            self.scheduler.push_job_event(JobEvent::delete(name)).await?;
        }

        for (name, job) in listed {
            if self.mirror.get(&name) == Some(&job) {
                continue;
            }
            self.mirror.insert(name, job.clone());
            self.scheduler.push_job_event(JobEvent::save(job)).await?;
        }

        Ok(snapshot.revision)
    }

    /// Fold one watch event into the mirror, returning the event to publish.
    fn apply(&mut self, event: WatchEvent) -> Option<JobEvent> {
        match event {
            WatchEvent::Put(kv) => {
                let job = decode_job(&kv.key, &kv.value)?;
                if self.mirror.get(&job.name) == Some(&job) {
                    return None;
                }
                self.mirror.insert(job.name.clone(), job.clone());
                Some(JobEvent::save(job))
            }
            WatchEvent::Delete { key } => {
                let name = extract_job_name(&key).to_string();
                self.mirror.remove(&name);
                Some(JobEvent::delete(name))
            }
        }
    }

    async fn watch_jobs(mut self, mut stream: WatchStream, shutdown: CancellationToken) {
        loop {
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(batch)) => {
                        for event in batch.events {
                            let Some(job_event) = self.apply(event) else { continue };
                            if self.scheduler.push_job_event(job_event).await.is_err() {
                                tracing::debug!("Scheduler stopped, ending job watch");
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Job watch failed, re-bootstrapping");
                        break;
                    }
                    None => {
                        tracing::warn!("Job watch closed, re-bootstrapping");
                        break;
                    }
                }
            }

            stream = loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(self.retry_backoff) => {}
                }
                match self.resubscribe().await {
                    Ok(stream) => break stream,
                    Err(_) if self.scheduler.is_closed() => return,
                    Err(e) => {
                        tracing::warn!(error = %e, "Job re-bootstrap failed, retrying");
                    }
                }
            };
        }
    }

    async fn resubscribe(&mut self) -> Result<WatchStream> {
        let revision = self.bootstrap().await?;
        let stream = self
            .store
            .watch_prefix(JOB_SAVE_DIR, Some(revision + 1))
            .await?;
        tracing::info!(jobs = self.mirror.len(), revision, "Job watch resumed");
        Ok(stream)
    }
}

async fn watch_killer(
    store: Arc<dyn CoordinationStore>,
    scheduler: SchedulerHandle,
    mut stream: WatchStream,
    retry_backoff: Duration,
    shutdown: CancellationToken,
) {
    loop {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(batch)) => {
                    for event in batch.events {
                        // expiry of the marker is not an event
                        let WatchEvent::Put(kv) = event else { continue };
                        let name = extract_killer_name(&kv.key);
                        if scheduler.push_job_event(JobEvent::kill(name)).await.is_err() {
                            tracing::debug!("Scheduler stopped, ending kill watch");
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Kill watch failed, re-subscribing");
                    break;
                }
                None => {
                    tracing::warn!("Kill watch closed, re-subscribing");
                    break;
                }
            }
        }

        stream = loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(retry_backoff) => {}
            }
            match store.watch_prefix(JOB_KILLER_DIR, None).await {
                Ok(stream) => break stream,
                Err(e) => tracing::warn!(error = %e, "Kill watch re-subscribe failed, retrying"),
            }
        };
    }
}

/// Decode a job value, naming it after its key.
fn decode_job(key: &str, value: &[u8]) -> Option<Job> {
    let name = extract_job_name(key);
    match Job::unpack(value) {
        Ok(mut job) => {
            if job.name != name {
                tracing::warn!(key, job = %job.name, "Job name does not match its key, using key");
                job.name = name.to_string();
            }
            Some(job)
        }
        Err(e) => {
            tracing::warn!(key, error = %e, "Skipping undecodable job");
            None
        }
    }
}

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::MasterConfig;
use crate::error::{CronError, Result};
use crate::job::{job_key, killer_key, Job, JOB_SAVE_DIR};
use crate::scheduler::parse_cron;
use crate::store::CoordinationStore;

/// Job CRUD and kill requests over the coordination store.
///
/// The manager only writes keys; workers observe them through their watches.
#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn CoordinationStore>,
    kill_marker_ttl_secs: i64,
    timeout: Duration,
}

impl JobManager {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &MasterConfig) -> Self {
        Self {
            store,
            kill_marker_ttl_secs: config.kill_marker_ttl_secs,
            timeout: config.api_timeout(),
        }
    }

    /// Store or replace a job. Returns the previous definition, if any.
    pub async fn save_job(&self, job: &Job) -> Result<Option<Job>> {
        Job::validate_name(&job.name)?;
        parse_cron(&job.cron_expr)?;

        let value = job.pack()?;
        let previous = self.bounded(self.store.put(&job_key(&job.name), value)).await?;
        tracing::info!(job = %job.name, cron = %job.cron_expr, "Job saved");
        Ok(previous.and_then(|old| decode_previous(&job.name, &old)))
    }

    /// Remove a job. Returns the deleted definition, if it existed.
    pub async fn delete_job(&self, name: &str) -> Result<Option<Job>> {
        Job::validate_name(name)?;
        let previous = self.bounded(self.store.delete(&job_key(name))).await?;
        if previous.is_some() {
            tracing::info!(job = %name, "Job deleted");
        }
        Ok(previous.and_then(|old| decode_previous(name, &old)))
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let snapshot = self.bounded(self.store.get_prefix(JOB_SAVE_DIR)).await?;
        let jobs = snapshot
            .kvs
            .iter()
            .filter_map(|kv| match Job::unpack(&kv.value) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Skipping undecodable job");
                    None
                }
            })
            .collect();
        Ok(jobs)
    }

    /// Ask every worker to kill its running instance of `name`.
    ///
    /// The marker is bound to a short lease so it disappears on its own;
    /// workers react to the put, not to the key's presence.
    pub async fn kill_job(&self, name: &str) -> Result<()> {
        Job::validate_name(name)?;
        let lease = self
            .bounded(self.store.grant_lease(self.kill_marker_ttl_secs))
            .await?;
        self.bounded(
            self.store
                .put_with_lease(&killer_key(name), Vec::new(), lease),
        )
        .await?;
        tracing::info!(job = %name, lease_id = lease, "Kill requested");
        Ok(())
    }

    async fn bounded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call).await.map_err(|_| {
            CronError::Internal(format!("store call timed out after {:?}", self.timeout))
        })?
    }
}

fn decode_previous(name: &str, value: &[u8]) -> Option<Job> {
    match Job::unpack(value) {
        Ok(job) => Some(job),
        Err(e) => {
            tracing::warn!(job = %name, error = %e, "Previous job value is undecodable");
            None
        }
    }
}

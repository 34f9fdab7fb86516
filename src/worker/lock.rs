use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::lock_key;
use crate::store::{CoordinationStore, LeaseId, LeaseKeepAlive};

/// Upper bound on the revoke round trip during release. The lease TTL
/// reclaims the key anyway if revoke cannot get through.
const REVOKE_TIMEOUT: Duration = Duration::from_secs(3);

/// Floor for the keep-alive period of very short leases.
const MIN_KEEP_ALIVE_PERIOD: Duration = Duration::from_millis(100);

/// Cluster-wide, non-blocking lock on a job name.
///
/// The lock key `/cron/lock/<name>` is created only if absent and bound to a
/// fresh lease, so exactly one concurrent [`try_lock`](Self::try_lock) across
/// all workers succeeds and the others fail immediately. While held, a
/// background task renews the lease every third of its TTL.
///
/// If renewals stop reaching the store (for example under a partition) the
/// lease can expire and another worker may take the lock while this holder
/// still runs. [`is_lost`](Self::is_lost) reports that this happened.
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
    job_name: String,
    owner: String,
    ttl_secs: i64,
    lease_id: Option<LeaseId>,
    keep_alive: Option<(CancellationToken, JoinHandle<()>)>,
    lost: Arc<AtomicBool>,
    released: bool,
}

impl DistributedLock {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        job_name: impl Into<String>,
        owner: impl Into<String>,
        ttl_secs: i64,
    ) -> Self {
        Self {
            store,
            job_name: job_name.into(),
            owner: owner.into(),
            ttl_secs,
            lease_id: None,
            keep_alive: None,
            lost: Arc::new(AtomicBool::new(false)),
            released: false,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lease_id
    }

    /// Whether the lease behind a held lock expired before release.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Try to take the lock once. `Ok(false)` means another holder has it.
    ///
    /// A lock instance is single-use: after a failed attempt or a release it
    /// will not try again.
    pub async fn try_lock(&mut self) -> Result<bool> {
        if self.released || self.lease_id.is_some() {
            return Ok(false);
        }

        let lease_id = self.store.grant_lease(self.ttl_secs).await?;
        // Recorded before the next await so that release() can clean up
        // after a caller-side timeout drops this future.
        self.lease_id = Some(lease_id);

        let key = lock_key(&self.job_name);
        let acquired = match self
            .store
            .put_if_absent(&key, self.owner.clone().into_bytes(), lease_id)
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                self.release().await;
                return Err(e);
            }
        };

        if !acquired {
            tracing::debug!(job = %self.job_name, "Lock held by another worker");
            self.release().await;
            return Ok(false);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(keep_alive_loop(
            self.store.clone(),
            self.job_name.clone(),
            lease_id,
            self.ttl_secs,
            self.lost.clone(),
            cancel.clone(),
        ));
        self.keep_alive = Some((cancel, handle));

        tracing::debug!(job = %self.job_name, lease_id, "Lock acquired");
        Ok(true)
    }

    /// Stop renewing and revoke the lease, which deletes the lock key.
    ///
    /// Idempotent. Failures are logged, never returned: the lease TTL
    /// bounds how long a stale key can survive.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some((cancel, handle)) = self.keep_alive.take() {
            cancel.cancel();
            // the loop exits at its next await point
            let _ = handle.await;
        }

        let Some(lease_id) = self.lease_id else {
            return;
        };
        match tokio::time::timeout(REVOKE_TIMEOUT, self.store.revoke_lease(lease_id)).await {
            Ok(Ok(())) => {
                tracing::debug!(job = %self.job_name, lease_id, "Lock released");
            }
            Ok(Err(e)) => {
                tracing::warn!(
                    job = %self.job_name,
                    lease_id,
                    error = %e,
                    "Failed to revoke lock lease"
                );
            }
            Err(_) => {
                tracing::warn!(job = %self.job_name, lease_id, "Timed out revoking lock lease");
            }
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some((cancel, _)) = self.keep_alive.take() {
            cancel.cancel();
        }
        let Some(lease_id) = self.lease_id else {
            return;
        };
        // Best effort: dropped without release(), e.g. when the owning task
        // was aborted.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            runtime.spawn(async move {
                let _ = tokio::time::timeout(REVOKE_TIMEOUT, store.revoke_lease(lease_id)).await;
            });
        }
    }
}

async fn keep_alive_loop(
    store: Arc<dyn CoordinationStore>,
    job_name: String,
    lease_id: LeaseId,
    ttl_secs: i64,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let ttl = Duration::from_secs(ttl_secs.max(1) as u64);
    let period = (ttl / 3).max(MIN_KEEP_ALIVE_PERIOD);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    interval.tick().await;

    let mut channel: Option<Box<dyn LeaseKeepAlive>> = None;
    let mut last_renewed = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        // Each attempt is bounded by the period and abandoned on cancel, so a
        // stalled store never holds up release().
        let attempt = tokio::time::timeout(period, renew(&store, &mut channel, lease_id));
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = attempt => outcome,
        };

        match outcome {
            Ok(Ok(remaining)) if remaining > 0 => {
                last_renewed = Instant::now();
                continue;
            }
            Ok(Ok(_)) => {
                mark_lost(&lost, &job_name, lease_id);
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(job = %job_name, lease_id, error = %e, "Lock lease renewal failed");
            }
            Err(_) => {
                tracing::warn!(job = %job_name, lease_id, "Lock lease renewal timed out");
            }
        }

        // reopen on the next tick
        channel = None;
        if last_renewed.elapsed() >= ttl {
            mark_lost(&lost, &job_name, lease_id);
            return;
        }
    }
}

async fn renew(
    store: &Arc<dyn CoordinationStore>,
    channel: &mut Option<Box<dyn LeaseKeepAlive>>,
    lease_id: LeaseId,
) -> Result<i64> {
    if channel.is_none() {
        *channel = Some(store.keep_alive(lease_id).await?);
    }
    match channel {
        Some(channel) => channel.renew().await,
        None => Ok(0),
    }
}

fn mark_lost(lost: &AtomicBool, job_name: &str, lease_id: LeaseId) {
    lost.store(true, Ordering::SeqCst);
    tracing::warn!(
        job = %job_name,
        lease_id,
        "Lock lease expired while held, another worker may now run this job"
    );
}

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::scheduler::{JobExecuteResult, Scheduler, SchedulerHandle};
use crate::store::{CoordinationStore, EtcdStore};
use crate::sync::{SyncAgent, SyncTasks};
use crate::worker::Executor;

/// A running worker: sync agent, scheduler and executor sharing one store.
pub struct WorkerNode {
    pub worker_id: String,
    events: SchedulerHandle,
    results: broadcast::Sender<JobExecuteResult>,
    shutdown: CancellationToken,
    scheduler: JoinHandle<()>,
    sync: SyncTasks,
}

impl WorkerNode {
    /// Connect to etcd and start a worker.
    pub async fn connect(config: WorkerConfig, shutdown: CancellationToken) -> Result<Self> {
        let store = EtcdStore::connect(&config.store).await?;
        Self::start(config, Arc::new(store), shutdown).await
    }

    /// Start all worker subsystems on `store`.
    ///
    /// 1. Spawns the scheduler loop so it drains events during bootstrap
    /// 2. Bootstraps the job namespace and subscribes both watches
    /// 3. Spawns the watch consumers
    ///
    /// # Errors
    ///
    /// Returns an error if the initial read or watch subscription fails. The
    /// scheduler is stopped in that case.
    pub async fn start(
        config: WorkerConfig,
        store: Arc<dyn CoordinationStore>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let shutdown = shutdown.child_token();

        let executor = Executor::new(store.clone(), &config);
        let (scheduler, events) = Scheduler::new(executor, &config);
        let results = scheduler.result_sender();
        let scheduler = tokio::spawn(scheduler.run(shutdown.clone()));

        let agent = SyncAgent::new(store, events.clone(), config.watch_retry_backoff());
        let sync = match agent.start(shutdown.clone()).await {
            Ok(sync) => sync,
            Err(e) => {
                tracing::error!(error = %e, "Job sync failed to start");
                shutdown.cancel();
                let _ = scheduler.await;
                return Err(e);
            }
        };

        tracing::info!(worker_id = %config.worker_id, "Worker started");
        Ok(Self {
            worker_id: config.worker_id,
            events,
            results,
            shutdown,
            scheduler,
            sync,
        })
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<JobExecuteResult> {
        self.results.subscribe()
    }

    /// Event sender into this worker's scheduler.
    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.events
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait until the worker stops (after its shutdown token is cancelled).
    pub async fn wait(self) {
        self.sync.join().await;
        let _ = self.scheduler.await;
        tracing::info!(worker_id = %self.worker_id, "Worker stopped");
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.wait().await;
    }
}

/// Log every execution result until the worker stops.
///
/// This is the default result consumer of the worker binary.
pub fn spawn_result_logger(node: &WorkerNode) -> JoinHandle<()> {
    let mut results = node.subscribe_results();
    tokio::spawn(async move {
        loop {
            match results.recv().await {
                Ok(result) => tracing::debug!(
                    job = %result.name(),
                    execution_id = %result.info.id,
                    status = %result.status,
                    plan_time = %result.info.plan_time,
                    real_time = %result.info.real_time,
                    start_time = %result.start_time,
                    end_time = %result.end_time,
                    "Execution result"
                ),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Result logger lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

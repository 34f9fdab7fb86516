use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{CronError, Result};
use crate::job::{JobEvent, JobEventKind};
use crate::scheduler::{ExecutionStatus, JobExecuteInfo, JobExecuteResult, JobSchedulePlan};
use crate::worker::Executor;

/// How long shutdown waits for cancelled executions to report back.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Results kept for slow subscribers before they start lagging.
const RESULT_BROADCAST_CAPACITY: usize = 256;

/// Sending side of the scheduler's job event channel.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<JobEvent>,
}

impl SchedulerHandle {
    pub fn new(tx: mpsc::Sender<JobEvent>) -> Self {
        Self { tx }
    }

    pub async fn push_job_event(&self, event: JobEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| CronError::Internal("scheduler stopped".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Owner of the plan table and the running table.
///
/// [`run`](Self::run) is the only place either table is touched. It waits on
/// three sources at once:
/// - the timer, armed to the earliest `next_time` across all plans
/// - job events from the sync agent
/// - execution results from executor tasks
///
/// so neither table needs a lock.
///
/// ## Per-job lifecycle
/// `unscheduled -> scheduled -> running -> scheduled`, and Delete returns
/// either state to `unscheduled`. A plan that comes due while its previous
/// execution is still running is skipped, not queued.
pub struct Scheduler {
    executor: Executor,
    plans: HashMap<String, JobSchedulePlan>,
    running: HashMap<String, JobExecuteInfo>,
    event_rx: mpsc::Receiver<JobEvent>,
    result_tx: mpsc::UnboundedSender<JobExecuteResult>,
    result_rx: mpsc::UnboundedReceiver<JobExecuteResult>,
    results: broadcast::Sender<JobExecuteResult>,
    idle_sleep: Duration,
}

impl Scheduler {
    pub fn new(executor: Executor, config: &WorkerConfig) -> (Self, SchedulerHandle) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let (results, _) = broadcast::channel(RESULT_BROADCAST_CAPACITY);

        let scheduler = Self {
            executor,
            plans: HashMap::new(),
            running: HashMap::new(),
            event_rx,
            result_tx,
            result_rx,
            results,
            idle_sleep: config.idle_sleep(),
        };
        (scheduler, SchedulerHandle::new(event_tx))
    }

    /// Every execution result, after the scheduler has retired it.
    pub fn subscribe_results(&self) -> broadcast::Receiver<JobExecuteResult> {
        self.results.subscribe()
    }

    pub fn result_sender(&self) -> broadcast::Sender<JobExecuteResult> {
        self.results.clone()
    }

    pub fn plan(&self, name: &str) -> Option<&JobSchedulePlan> {
        self.plans.get(name)
    }

    pub fn running(&self, name: &str) -> Option<&JobExecuteInfo> {
        self.running.get(name)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.contains_key(name)
    }

    pub fn plan_count(&self) -> usize {
        self.plans.len()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(worker_id = %self.executor.worker_id(), "Scheduler started");
        let mut sleep = self.try_schedule(Utc::now());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(event) = self.event_rx.recv() => {
                    self.handle_job_event(event, Utc::now());
                }
                Some(result) = self.result_rx.recv() => {
                    self.handle_job_result(result);
                }
                _ = tokio::time::sleep(sleep) => {}
            }
            sleep = self.try_schedule(Utc::now());
        }

        self.drain().await;
        tracing::info!("Scheduler stopped");
    }

    /// Cancel every running execution and wait briefly for their results,
    /// so their locks are released before the process exits.
    async fn drain(&mut self) {
        if self.running.is_empty() {
            return;
        }
        tracing::info!(running = self.running.len(), "Cancelling running jobs");
        for info in self.running.values() {
            info.cancel.cancel();
        }

        let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(deadline);
        while !self.running.is_empty() {
            tokio::select! {
                Some(result) = self.result_rx.recv() => self.handle_job_result(result),
                _ = &mut deadline => {
                    tracing::warn!(
                        running = self.running.len(),
                        "Jobs still running after shutdown grace period"
                    );
                    break;
                }
            }
        }
    }

    pub fn handle_job_event(&mut self, event: JobEvent, now: DateTime<Utc>) {
        match event.kind {
            JobEventKind::Save => {
                let name = event.job.name.clone();
                match JobSchedulePlan::build(event.job, now) {
                    Ok(plan) => {
                        tracing::info!(
                            job = %name,
                            cron = %plan.job.cron_expr,
                            next_time = %plan.next_time,
                            "Job scheduled"
                        );
                        self.plans.insert(name, plan);
                    }
                    Err(e) => {
                        let kept = self.plans.contains_key(&name);
                        tracing::error!(
                            job = %name,
                            error = %e,
                            kept_previous_plan = kept,
                            "Rejected job definition"
                        );
                    }
                }
            }
            JobEventKind::Delete => {
                if self.plans.remove(event.name()).is_some() {
                    tracing::info!(job = %event.name(), "Job unscheduled");
                }
            }
            JobEventKind::Kill => match self.running.get(event.name()) {
                Some(info) => {
                    tracing::info!(job = %event.name(), execution_id = %info.id, "Killing job");
                    info.cancel.cancel();
                }
                None => {
                    tracing::debug!(job = %event.name(), "Kill for job that is not running here");
                }
            },
        }
    }

    /// Fire every plan due at `now` and return how long to sleep until the
    /// next one.
    pub fn try_schedule(&mut self, now: DateTime<Utc>) -> Duration {
        if self.plans.is_empty() {
            return self.idle_sleep;
        }

        let mut nearest: Option<DateTime<Utc>> = None;
        let mut exhausted = Vec::new();

        for (name, plan) in self.plans.iter_mut() {
            if plan.is_due(now) {
                Self::try_start_job(
                    &mut self.running,
                    &self.executor,
                    &self.result_tx,
                    plan,
                    now,
                );
                if !plan.advance(now) {
                    exhausted.push(name.clone());
                    continue;
                }
            }
            nearest = Some(match nearest {
                Some(t) if t <= plan.next_time => t,
                _ => plan.next_time,
            });
        }

        for name in exhausted {
            tracing::info!(job = %name, "Job schedule exhausted");
            self.plans.remove(&name);
        }

        match nearest {
            Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO),
            None => self.idle_sleep,
        }
    }

    fn try_start_job(
        running: &mut HashMap<String, JobExecuteInfo>,
        executor: &Executor,
        result_tx: &mpsc::UnboundedSender<JobExecuteResult>,
        plan: &JobSchedulePlan,
        now: DateTime<Utc>,
    ) {
        if let Some(previous) = running.get(&plan.job.name) {
            tracing::info!(
                job = %plan.job.name,
                running_since = %previous.real_time,
                "Previous execution still running, skipping"
            );
            return;
        }

        let info = JobExecuteInfo::new(plan.job.clone(), plan.next_time, now);
        tracing::debug!(
            job = %info.name(),
            execution_id = %info.id,
            plan_time = %info.plan_time,
            "Dispatching job"
        );
        running.insert(info.job.name.clone(), info.clone());
        executor.spawn(info, result_tx.clone());
    }

    pub fn handle_job_result(&mut self, result: JobExecuteResult) {
        let current = self
            .running
            .get(result.name())
            .is_some_and(|info| info.id == result.info.id);
        if current {
            self.running.remove(result.name());
        } else {
            tracing::warn!(
                job = %result.name(),
                execution_id = %result.info.id,
                "Result for an execution that is not in the running table"
            );
        }

        match result.status {
            ExecutionStatus::Skipped => {
                tracing::debug!(job = %result.name(), "Job ran on another worker");
            }
            ExecutionStatus::Succeeded => {
                tracing::info!(
                    job = %result.name(),
                    execution_id = %result.info.id,
                    exit_code = ?result.exit_code,
                    duration_ms = result.duration_ms(),
                    lease_lost = result.lease_lost,
                    output = %result.output_lossy().trim_end(),
                    "Job completed"
                );
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                tracing::warn!(
                    job = %result.name(),
                    execution_id = %result.info.id,
                    status = %result.status,
                    exit_code = ?result.exit_code,
                    error = result.error.as_deref().unwrap_or_default(),
                    duration_ms = result.duration_ms(),
                    lease_lost = result.lease_lost,
                    output = %result.output_lossy().trim_end(),
                    "Job did not complete successfully"
                );
            }
        }

        // no subscribers is fine
        let _ = self.results.send(result);
    }
}

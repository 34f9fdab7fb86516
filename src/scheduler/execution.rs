use std::borrow::Cow;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::job::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Command exited with status 0
    Succeeded,
    /// Command exited non-zero, or could not be spawned
    Failed,
    /// Command was terminated by a kill request or shutdown
    Cancelled,
    /// Another worker holds the job lock; the command did not run here
    Skipped,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Succeeded => write!(f, "succeeded"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
            ExecutionStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// One in-flight local execution of a job.
///
/// Lives in the scheduler's running table from dispatch until its result
/// comes back. The cancellation token is shared with the executor task.
#[derive(Debug, Clone)]
pub struct JobExecuteInfo {
    pub id: Uuid,
    pub job: Job,
    /// When the schedule said the job should fire
    pub plan_time: DateTime<Utc>,
    /// When the scheduler actually dispatched it
    pub real_time: DateTime<Utc>,
    pub cancel: CancellationToken,
}

impl JobExecuteInfo {
    pub fn new(job: Job, plan_time: DateTime<Utc>, real_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            job,
            plan_time,
            real_time,
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }
}

/// Outcome of one execution, produced exactly once per [`JobExecuteInfo`].
#[derive(Debug, Clone)]
pub struct JobExecuteResult {
    pub info: JobExecuteInfo,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    /// Combined stdout and stderr, in arrival order
    pub output: Vec<u8>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// The lock lease expired while the command was running
    pub lease_lost: bool,
}

impl JobExecuteResult {
    /// Result for an execution that lost the lock election.
    pub fn skipped(info: JobExecuteInfo, start_time: DateTime<Utc>) -> Self {
        Self {
            info,
            status: ExecutionStatus::Skipped,
            exit_code: None,
            output: Vec::new(),
            error: None,
            start_time,
            end_time: Utc::now(),
            lease_lost: false,
        }
    }

    pub fn name(&self) -> &str {
        self.info.name()
    }

    pub fn output_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.end_time - self.start_time).num_milliseconds()
    }
}

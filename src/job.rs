use serde::{Deserialize, Serialize};

use crate::error::{CronError, Result};

/// Directory holding serialized job definitions, one key per job name.
pub const JOB_SAVE_DIR: &str = "/cron/jobs/";

/// Directory where kill markers are created to terminate a running job.
pub const JOB_KILLER_DIR: &str = "/cron/killer/";

/// Directory holding lease-bound lock keys, one per running job name.
pub const JOB_LOCK_DIR: &str = "/cron/lock/";

/// A cron job definition as stored under [`JOB_SAVE_DIR`].
///
/// The wire format (camelCase JSON) is shared with the management API, so
/// field names must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub name: String,
    pub command: String,
    pub cron_expr: String,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        cron_expr: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            cron_expr: cron_expr.into(),
        }
    }

    /// A job that carries only its name, used by Delete and Kill events.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: String::new(),
            cron_expr: String::new(),
        }
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unpack(value: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(value)?)
    }

    /// Reject names that cannot be mapped onto a single store key.
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CronError::InvalidJob("job name must not be empty".to_string()));
        }
        if name.contains('/') {
            return Err(CronError::InvalidJob(format!(
                "job name {name:?} must not contain '/'"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventKind {
    Save,
    Delete,
    Kill,
}

impl std::fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobEventKind::Save => write!(f, "save"),
            JobEventKind::Delete => write!(f, "delete"),
            JobEventKind::Kill => write!(f, "kill"),
        }
    }
}

/// A change observed in the coordination store, pushed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub kind: JobEventKind,
    pub job: Job,
}

impl JobEvent {
    pub fn save(job: Job) -> Self {
        Self {
            kind: JobEventKind::Save,
            job,
        }
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self {
            kind: JobEventKind::Delete,
            job: Job::named(name),
        }
    }

    pub fn kill(name: impl Into<String>) -> Self {
        Self {
            kind: JobEventKind::Kill,
            job: Job::named(name),
        }
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }
}

pub fn job_key(name: &str) -> String {
    format!("{JOB_SAVE_DIR}{name}")
}

pub fn killer_key(name: &str) -> String {
    format!("{JOB_KILLER_DIR}{name}")
}

pub fn lock_key(name: &str) -> String {
    format!("{JOB_LOCK_DIR}{name}")
}

/// `/cron/jobs/backup` -> `backup`
pub fn extract_job_name(key: &str) -> &str {
    key.strip_prefix(JOB_SAVE_DIR).unwrap_or(key)
}

/// `/cron/killer/backup` -> `backup`
pub fn extract_killer_name(key: &str) -> &str {
    key.strip_prefix(JOB_KILLER_DIR).unwrap_or(key)
}

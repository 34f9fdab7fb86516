use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{CronError, Result};
use crate::job::Job;

/// Parse a six-field (seconds first) or seven-field (trailing year) cron
/// expression.
pub fn parse_cron(expr: &str) -> Result<Schedule> {
    Schedule::from_str(expr).map_err(|source| CronError::InvalidCron {
        expr: expr.to_string(),
        source,
    })
}

/// Next trigger time strictly after `after`.
pub fn next_trigger(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// The schedule of one known job.
#[derive(Debug, Clone)]
pub struct JobSchedulePlan {
    pub job: Job,
    pub schedule: Schedule,
    pub next_time: DateTime<Utc>,
}

impl JobSchedulePlan {
    /// Parse the job's cron expression and compute its first trigger after
    /// `now`. Fails for malformed expressions and for expressions that never
    /// fire again.
    pub fn build(job: Job, now: DateTime<Utc>) -> Result<Self> {
        let schedule = parse_cron(&job.cron_expr)?;
        let next_time = next_trigger(&schedule, now).ok_or_else(|| {
            CronError::InvalidJob(format!(
                "cron expression {:?} of job {} has no future trigger",
                job.cron_expr, job.name
            ))
        })?;
        Ok(Self {
            job,
            schedule,
            next_time,
        })
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_time <= now
    }

    /// Move `next_time` to the first trigger after `now`. Missed triggers in
    /// between are skipped, not replayed. Returns false when the schedule is
    /// exhausted.
    pub fn advance(&mut self, now: DateTime<Utc>) -> bool {
        match next_trigger(&self.schedule, now) {
            Some(next) => {
                self.next_time = next;
                true
            }
            None => false,
        }
    }
}

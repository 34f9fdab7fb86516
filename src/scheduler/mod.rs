//! Cron scheduling on a single worker.
//!
//! - [`JobSchedulePlan`]: parsed cron schedule and next trigger of one job
//! - [`JobExecuteInfo`] / [`JobExecuteResult`]: one local execution and its outcome
//! - [`Scheduler`]: the event loop owning the plan and running tables

pub mod event_loop;
pub mod execution;
pub mod plan;

pub use event_loop::{Scheduler, SchedulerHandle};
pub use execution::{ExecutionStatus, JobExecuteInfo, JobExecuteResult};
pub use plan::{next_trigger, parse_cron, JobSchedulePlan};

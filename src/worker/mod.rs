//! Worker-side job execution.
//!
//! - [`Executor`]: runs one job invocation: lock, spawn, wait or kill, release
//! - [`DistributedLock`]: lease-backed create-if-absent lock on a job name
//!
//! # Execution Flow
//!
//! 1. The scheduler dispatches a [`JobExecuteInfo`](crate::scheduler::JobExecuteInfo)
//! 2. [`Executor::execute`] tries the job lock; a lost race ends here
//! 3. `sh -c <command>` runs in its own process group
//! 4. A kill request cancels the invocation's token and the group is killed
//! 5. The lock is released and one result goes back to the scheduler

pub mod executor;
pub mod lock;

pub use executor::Executor;
pub use lock::DistributedLock;

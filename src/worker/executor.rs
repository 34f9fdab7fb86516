use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::scheduler::{ExecutionStatus, JobExecuteInfo, JobExecuteResult};
use crate::store::CoordinationStore;
use crate::worker::DistributedLock;

const READ_CHUNK: usize = 4096;

struct CommandOutcome {
    status: ExecutionStatus,
    exit_code: Option<i32>,
    output: Vec<u8>,
    error: Option<String>,
}

/// Runs job invocations under the cluster-wide job lock.
///
/// Each invocation:
/// 1. Tries the job's [`DistributedLock`] once, bounded by
///    `lock_acquire_timeout`. Losing the race (or a store error) reports
///    [`ExecutionStatus::Skipped`] without running anything.
/// 2. Spawns `sh -c <command>` in its own process group, capturing stdout
///    and stderr into one buffer.
/// 3. Waits for exit or for the invocation's cancellation token. On
///    cancellation the whole process group is killed.
/// 4. Releases the lock and returns exactly one [`JobExecuteResult`].
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn CoordinationStore>,
    worker_id: String,
    lock_ttl_secs: i64,
    lock_acquire_timeout: Duration,
}

impl Executor {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &WorkerConfig) -> Self {
        Self {
            store,
            worker_id: config.worker_id.clone(),
            lock_ttl_secs: config.lock_ttl_secs,
            lock_acquire_timeout: config.lock_acquire_timeout(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run `info` on its own task and send the result to `results`.
    pub fn spawn(
        &self,
        info: JobExecuteInfo,
        results: mpsc::UnboundedSender<JobExecuteResult>,
    ) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            let result = executor.execute(info).await;
            if results.send(result).is_err() {
                tracing::debug!("Scheduler gone, dropping execution result");
            }
        })
    }

    pub async fn execute(&self, info: JobExecuteInfo) -> JobExecuteResult {
        let start_time = Utc::now();
        let mut lock = DistributedLock::new(
            self.store.clone(),
            info.name(),
            self.worker_id.as_str(),
            self.lock_ttl_secs,
        );

        let acquired = match tokio::time::timeout(self.lock_acquire_timeout, lock.try_lock()).await
        {
            Ok(Ok(acquired)) => acquired,
            Ok(Err(e)) => {
                tracing::debug!(job = %info.name(), error = %e, "Lock acquisition failed");
                false
            }
            Err(_) => {
                tracing::debug!(job = %info.name(), "Lock acquisition timed out");
                false
            }
        };
        if !acquired {
            lock.release().await;
            return JobExecuteResult::skipped(info, start_time);
        }

        tracing::info!(
            job = %info.name(),
            execution_id = %info.id,
            command = %info.job.command,
            "Executing job"
        );

        let start_time = Utc::now();
        let outcome = if info.cancel.is_cancelled() {
            CommandOutcome {
                status: ExecutionStatus::Cancelled,
                exit_code: None,
                output: Vec::new(),
                error: Some("job cancelled before start".to_string()),
            }
        } else {
            run_command(&info.job.command, &info.cancel).await
        };
        let end_time = Utc::now();

        let lease_lost = lock.is_lost();
        lock.release().await;

        JobExecuteResult {
            info,
            status: outcome.status,
            exit_code: outcome.exit_code,
            output: outcome.output,
            error: outcome.error,
            start_time,
            end_time,
            lease_lost,
        }
    }
}

async fn run_command(command: &str, cancel: &CancellationToken) -> CommandOutcome {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        // own process group, so a kill reaches everything the shell started
        .process_group(0);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(command, error = %e, "Failed to spawn job");
            return CommandOutcome {
                status: ExecutionStatus::Failed,
                exit_code: None,
                output: Vec::new(),
                error: Some(format!("failed to spawn: {e}")),
            };
        }
    };

    let mut output = Vec::new();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let finished = {
        let run = async {
            let (status, read) = tokio::join!(
                child.wait(),
                read_combined(stdout, stderr, &mut output)
            );
            if let Err(e) = read {
                tracing::debug!(error = %e, "Failed reading job output");
            }
            status
        };
        tokio::select! {
            status = run => Some(status),
            _ = cancel.cancelled() => None,
        }
    };

    match finished {
        Some(Ok(status)) => process_exit(status, output),
        Some(Err(e)) => CommandOutcome {
            status: ExecutionStatus::Failed,
            exit_code: None,
            output,
            error: Some(format!("failed to wait for job: {e}")),
        },
        None => {
            terminate(&mut child).await;
            CommandOutcome {
                status: ExecutionStatus::Cancelled,
                exit_code: None,
                output,
                error: Some("job killed".to_string()),
            }
        }
    }
}

fn process_exit(status: ExitStatus, output: Vec<u8>) -> CommandOutcome {
    let exit_code = status.code();
    if status.success() {
        CommandOutcome {
            status: ExecutionStatus::Succeeded,
            exit_code,
            output,
            error: None,
        }
    } else {
        let error = match exit_code {
            Some(code) => format!("exit code {code}"),
            None => format!("terminated: {status}"),
        };
        CommandOutcome {
            status: ExecutionStatus::Failed,
            exit_code,
            output,
            error: Some(error),
        }
    }
}

/// SIGKILL the child's process group, then reap the child.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let pgid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL) {
            tracing::debug!(pid, error = %e, "killpg failed");
        }
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Failed to kill job process");
    }
}

/// Drain both pipes into `out`, appending chunks as they arrive.
async fn read_combined<O, E>(
    mut stdout: Option<O>,
    mut stderr: Option<E>,
    out: &mut Vec<u8>,
) -> std::io::Result<()>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_buf = [0u8; READ_CHUNK];
    let mut err_buf = [0u8; READ_CHUNK];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            n = read_chunk(&mut stdout, &mut out_buf) => match n? {
                0 => stdout = None,
                n => out.extend_from_slice(&out_buf[..n]),
            },
            n = read_chunk(&mut stderr, &mut err_buf) => match n? {
                0 => stderr = None,
                n => out.extend_from_slice(&err_buf[..n]),
            },
        }
    }
    Ok(())
}

async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

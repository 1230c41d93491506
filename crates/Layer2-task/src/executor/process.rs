//! Process runner - launches one task process and waits for it
//!
//! Features:
//! - stdout/stderr teed to the run's log files and to memory
//! - kill switch: SIGTERM, grace period, then SIGKILL
//! - launch failures reported as an outcome, never as an error

use crate::log::{tee, TaskLogFiles, TeeCapture};
use crate::task::{ExecutionOutcome, TaskId};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How long to wait for pipe readers after the process is gone; output
/// captured until then is kept
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs processes for the dispatcher
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    /// SIGTERM to SIGKILL grace period
    grace_period: Duration,

    /// Signal the whole process group (the executor must have created one)
    kill_process_group: bool,
}

impl ProcessRunner {
    pub fn new(grace_period: Duration, kill_process_group: bool) -> Self {
        Self {
            grace_period,
            kill_process_group,
        }
    }

    /// Spawn `command`, capture its output and wait for it to exit or for
    /// `kill` to fire.
    pub async fn run(
        &self,
        task_id: &TaskId,
        mut command: Command,
        files: TaskLogFiles,
        mut kill: oneshot::Receiver<()>,
    ) -> ExecutionOutcome {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Task {} failed to start: {}", task_id, e);
                return ExecutionOutcome::launch_failed(e);
            }
        };

        debug!("Task {} spawned pid {:?}", task_id, child.id());

        let TaskLogFiles {
            stdout: stdout_file,
            stderr: stderr_file,
        } = files;
        let stdout = child
            .stdout
            .take()
            .map(|pipe| tee(pipe, stdout_file, task_id.clone(), "stdout"));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| tee(pipe, stderr_file, task_id.clone(), "stderr"));

        // A dropped sender disables the kill branch instead of firing it
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = &mut kill => {
                info!("Terminating task {}", task_id);
                self.terminate(task_id, &mut child).await
            }
        };

        let (stdout, stderr) =
            futures::future::join(drain(task_id, stdout), drain(task_id, stderr)).await;

        match status {
            Ok(status) => {
                debug!("Task {} exited: {}", task_id, status);
                ExecutionOutcome::exited(status.code(), &stdout, &stderr)
            }
            Err(e) => {
                warn!("Task {} wait failed: {}", task_id, e);
                let mut outcome = ExecutionOutcome::exited(None, &stdout, &stderr);
                if !outcome.error.is_empty() && !outcome.error.ends_with('\n') {
                    outcome.error.push('\n');
                }
                outcome
                    .error
                    .push_str(&format!("failed to wait for process: {}", e));
                outcome
            }
        }
    }

    /// SIGTERM, wait out the grace period, then SIGKILL
    async fn terminate(
        &self,
        task_id: &TaskId,
        child: &mut Child,
    ) -> std::io::Result<ExitStatus> {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                send_signal(pid, libc::SIGTERM, self.kill_process_group);
            }

            if let Ok(status) = tokio::time::timeout(self.grace_period, child.wait()).await {
                return status;
            }

            warn!(
                "Task {} ignored SIGTERM for {:.1}s, killing",
                task_id,
                self.grace_period.as_secs_f64()
            );
            if let Some(pid) = child.id() {
                send_signal(pid, libc::SIGKILL, self.kill_process_group);
            }
        }

        #[cfg(not(unix))]
        debug!("Killing task {}", task_id);

        child.kill().await?;
        child.wait().await
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int, process_group: bool) {
    let target = if process_group {
        -(pid as libc::pid_t)
    } else {
        pid as libc::pid_t
    };

    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(target, signal) };
    if rc != 0 {
        debug!(
            "kill({}, {}) failed: {}",
            target,
            signal,
            std::io::Error::last_os_error()
        );
    }
}

/// Everything a pipe reader captured, empty when the pipe was never opened
async fn drain(task_id: &TaskId, capture: Option<TeeCapture>) -> Vec<u8> {
    match capture {
        Some(capture) => capture.finish(task_id, DRAIN_TIMEOUT).await,
        None => Vec::new(),
    }
}

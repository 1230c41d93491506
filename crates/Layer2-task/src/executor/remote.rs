//! Remote executor - runs a task on the worker host over SSH
//!
//! The SSH client is the local process: its exit code, stdout and stderr are
//! the task's. The remote shell receives a single command string built from
//! the command and its arguments.
//!
//! The remote script records its shell PID in `<pid_dir>/<task id>.pid` before
//! running the command, so cancellation can signal exactly that process group
//! instead of matching `ps` output.

use crate::executor::Executor;
use crate::task::{TaskId, TaskRecord};
use async_trait::async_trait;
use std::borrow::Cow;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use trade_foundation::{Error, Result};
use tracing::{debug, info};

/// Default SSH client binary
pub const SSH_PROGRAM: &str = "ssh";

/// Upper bound for the kill round-trip
const KILL_TIMEOUT: Duration = Duration::from_secs(30);

/// Worker machine reachable over SSH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTarget {
    pub host: String,
    pub user: String,
    /// Private key passed with `-i`
    pub private_key: PathBuf,
}

impl WorkerTarget {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        private_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            private_key: private_key.into(),
        }
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Remote executor configuration
#[derive(Debug, Clone)]
pub struct RemoteExecutorConfig {
    pub target: WorkerTarget,

    /// Shell-quote each argument before joining. When false, arguments are
    /// joined verbatim and the remote shell interprets any metacharacters.
    pub quote_args: bool,

    /// Directory on the worker for PID files
    pub pid_dir: String,

    /// SSH client binary
    pub ssh_program: PathBuf,
}

impl RemoteExecutorConfig {
    pub fn new(target: WorkerTarget) -> Self {
        Self {
            target,
            quote_args: true,
            pid_dir: "/tmp".to_string(),
            ssh_program: PathBuf::from(SSH_PROGRAM),
        }
    }
}

/// Runs tasks on the worker host through the `ssh` client
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    config: RemoteExecutorConfig,
}

impl RemoteExecutor {
    pub fn new(config: RemoteExecutorConfig) -> Self {
        Self { config }
    }

    pub fn target(&self) -> &WorkerTarget {
        &self.config.target
    }

    /// `-i <key> -o StrictHostKeyChecking=no user@host <remote>`
    fn ssh_args(&self, remote: String) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.config.target.private_key.to_string_lossy().into_owned(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            self.config.target.destination(),
            remote,
        ]
    }

    /// Command followed by its arguments, space separated
    pub fn command_line(&self, task: &TaskRecord) -> Result<String> {
        let mut line = task.command.clone();
        for arg in &task.args {
            line.push(' ');
            if self.config.quote_args {
                line.push_str(&quote(arg)?);
            } else {
                line.push_str(arg);
            }
        }
        Ok(line)
    }

    /// Remote PID file for a task
    pub fn pid_file(&self, task_id: &TaskId) -> String {
        format!(
            "{}/{}.pid",
            self.config.pid_dir.trim_end_matches('/'),
            task_id
        )
    }

    /// Script run by the remote shell: record PID, run, clean up, keep exit code
    pub fn launch_script(&self, task: &TaskRecord) -> Result<String> {
        let pid_file = quote(&self.pid_file(&task.id))?.into_owned();
        let command_line = self.command_line(task)?;
        Ok(format!(
            "echo $$ > {pid}\n{cmd}\nrc=$?\nrm -f {pid}\nexit $rc",
            pid = pid_file,
            cmd = command_line
        ))
    }

    /// Script that terminates the process group recorded for `task_id`
    pub fn kill_script(&self, task_id: &TaskId) -> Result<String> {
        let pid_file = quote(&self.pid_file(task_id))?.into_owned();
        Ok(format!(
            "pid=$(cat {pid} 2>/dev/null)\n\
             if [ -n \"$pid\" ]; then kill -TERM -\"$pid\" 2>/dev/null || kill -TERM \"$pid\"; fi\n\
             rm -f {pid}",
            pid = pid_file
        ))
    }

    /// Full `ssh` argument list that launches `task`
    pub fn launch_args(&self, task: &TaskRecord) -> Result<Vec<String>> {
        Ok(self.ssh_args(self.launch_script(task)?))
    }

    /// Full `ssh` argument list that kills `task_id` on the worker
    pub fn kill_args(&self, task_id: &TaskId) -> Result<Vec<String>> {
        Ok(self.ssh_args(self.kill_script(task_id)?))
    }

    /// Signal the remote process. No confirmation beyond the SSH exit status.
    pub async fn kill_remote(&self, task_id: &TaskId) -> Result<()> {
        let mut cmd = Command::new(&self.config.ssh_program);
        cmd.args(self.kill_args(task_id)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let host = &self.target().host;
        let output = tokio::time::timeout(KILL_TIMEOUT, cmd.output())
            .await
            .map_err(|_| Error::remote_dispatch(host, "kill timed out"))?
            .map_err(|e| Error::remote_dispatch(host, e.to_string()))?;

        if !output.status.success() {
            return Err(Error::remote_dispatch(
                host,
                format!(
                    "kill exited with {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        info!("Sent remote kill for {} on {}", task_id, host);
        Ok(())
    }
}

/// POSIX shell quoting; plain words come back unchanged
fn quote(word: &str) -> Result<Cow<'_, str>> {
    shlex::try_quote(word)
        .map_err(|e| Error::ProcessLaunch(format!("cannot quote {:?}: {}", word, e)))
}

#[async_trait]
impl Executor for RemoteExecutor {
    fn command(&self, task: &TaskRecord) -> Result<Command> {
        let args = self.launch_args(task)?;
        debug!(
            "Remote command for {} on {}: {}",
            task.id,
            self.target().destination(),
            self.command_line(task)?
        );

        let mut cmd = Command::new(&self.config.ssh_program);
        cmd.args(args);

        // Own group for the ssh client so a local SIGTERM reaches it the same
        // way it reaches local tasks
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        Ok(cmd)
    }

    async fn cancel(&self, task: &TaskRecord) -> Result<()> {
        self.kill_remote(&task.id).await
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;

    fn executor(quote_args: bool) -> RemoteExecutor {
        RemoteExecutor::new(RemoteExecutorConfig {
            target: WorkerTarget::new("worker-1", "trader", "/keys/worker"),
            quote_args,
            pid_dir: "/var/run/tasks/".to_string(),
            ssh_program: PathBuf::from(SSH_PROGRAM),
        })
    }

    fn task(args: &[&str]) -> TaskRecord {
        TaskRecord::new(
            TaskId::from("sync-1700000000"),
            TaskSpec::new("sync", "python3")
                .with_args(args.iter().copied())
                .on_worker(true),
        )
    }

    #[test]
    fn test_ssh_args_layout() {
        let args = executor(true).launch_args(&task(&["sync.py"])).unwrap();
        assert_eq!(
            &args[..5],
            [
                "-i",
                "/keys/worker",
                "-o",
                "StrictHostKeyChecking=no",
                "trader@worker-1"
            ]
        );
        assert_eq!(args.len(), 6);
        assert!(args[5].contains("python3 sync.py"));
    }

    #[test]
    fn test_plain_args_are_joined_with_spaces() {
        let line = executor(true)
            .command_line(&task(&["sync.py", "--days", "3"]))
            .unwrap();
        assert_eq!(line, "python3 sync.py --days 3");
    }

    #[test]
    fn test_metacharacters_are_quoted() {
        let line = executor(true)
            .command_line(&task(&["a b", "$(reboot)", "x;y"]))
            .unwrap();
        assert_eq!(line, "python3 'a b' '$(reboot)' 'x;y'");
    }

    #[test]
    fn test_unquoted_mode_joins_verbatim() {
        let line = executor(false)
            .command_line(&task(&["a b", "$HOME"]))
            .unwrap();
        assert_eq!(line, "python3 a b $HOME");
    }

    #[test]
    fn test_launch_script_records_pid() {
        let exec = executor(true);
        let task = task(&["sync.py"]);
        assert_eq!(exec.pid_file(&task.id), "/var/run/tasks/sync-1700000000.pid");

        let script = exec.launch_script(&task).unwrap();
        let lines: Vec<_> = script.lines().collect();
        assert_eq!(lines[0], "echo $$ > /var/run/tasks/sync-1700000000.pid");
        assert_eq!(lines[1], "python3 sync.py");
        assert_eq!(lines.last(), Some(&"exit $rc"));
    }

    #[test]
    fn test_kill_script_targets_pid_file() {
        let script = executor(true)
            .kill_script(&TaskId::from("sync-1700000000"))
            .unwrap();
        assert!(script.starts_with("pid=$(cat /var/run/tasks/sync-1700000000.pid"));
        assert!(script.contains("kill -TERM -\"$pid\""));
        assert!(!script.contains("ps aux"));
    }

    #[test]
    fn test_nul_byte_cannot_be_quoted() {
        let result = executor(true).command_line(&task(&["bad\0arg"]));
        assert!(matches!(result, Err(Error::ProcessLaunch(_))));
    }
}

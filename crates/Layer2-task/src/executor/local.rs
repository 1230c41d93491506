//! Local executor - runs the command directly on this host
//!
//! `args` are passed as a real argument vector; nothing goes through a shell.

use crate::executor::Executor;
use crate::task::TaskRecord;
use async_trait::async_trait;
use tokio::process::Command;
use trade_foundation::Result;
use tracing::debug;

/// Local executor configuration
#[derive(Debug, Clone)]
pub struct LocalExecutorConfig {
    /// Start each process in its own process group (Unix only) so
    /// cancellation reaches its children too
    pub kill_process_group: bool,
}

impl Default for LocalExecutorConfig {
    fn default() -> Self {
        Self {
            kill_process_group: true,
        }
    }
}

/// Local executor that runs tasks directly on the host
#[derive(Debug, Default)]
pub struct LocalExecutor {
    config: LocalExecutorConfig,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LocalExecutorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn command(&self, task: &TaskRecord) -> Result<Command> {
        let mut cmd = Command::new(&task.command);
        cmd.args(&task.args);

        #[cfg(unix)]
        {
            if self.config.kill_process_group {
                cmd.process_group(0);
            }
        }

        debug!("Local command for {}: {} {:?}", task.id, task.command, task.args);
        Ok(cmd)
    }

    async fn cancel(&self, task: &TaskRecord) -> Result<()> {
        // the dispatcher's kill switch signals the process group
        debug!("Local cancel for {} handled by process handle", task.id);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

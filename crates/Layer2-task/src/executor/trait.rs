//! Executor trait

use crate::task::TaskRecord;
use async_trait::async_trait;
use tokio::process::Command;
use trade_foundation::Result;

/// Executor trait - one implementation per placement (local host, worker)
#[async_trait]
pub trait Executor: Send + Sync {
    /// Build the process that runs `task`. Stdio is wired by the caller.
    fn command(&self, task: &TaskRecord) -> Result<Command>;

    /// Placement-specific cancellation work, run in the background for every
    /// cancelled task. The spawned process itself is terminated through its
    /// handle by the dispatcher.
    async fn cancel(&self, task: &TaskRecord) -> Result<()>;

    /// Get executor name
    fn name(&self) -> &'static str;
}

//! Task Registry - the single source of truth for task records
//!
//! One `RwLock` guards the record table and the kill switches of running
//! tasks. Every transition re-checks the current status after taking the
//! write lock, so racing callers (cancel vs. natural completion, double
//! `run`) resolve to exactly one winner.

use crate::state::TaskStatus;
use crate::task::{ExecutionOutcome, TaskId, TaskRecord, TaskSpec};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use trade_foundation::{Error, Result};
use tracing::debug;

#[derive(Debug, Default)]
struct TaskTable {
    records: HashMap<TaskId, TaskRecord>,

    /// Present while a task is running
    kill_switches: HashMap<TaskId, oneshot::Sender<()>>,
}

/// Result of trying to finalize a run
#[derive(Debug, Clone)]
pub enum Finalized {
    /// The outcome was recorded
    Applied(TaskRecord),

    /// The record had already left `running` (cancelled); left untouched
    Superseded(TaskRecord),

    /// The record is gone (swept after cancellation)
    Missing,
}

/// Counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Concurrent map of task ID to task record
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    table: Arc<RwLock<TaskTable>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new pending record and return a copy
    pub async fn create(&self, spec: TaskSpec) -> TaskRecord {
        let mut table = self.table.write().await;

        let base = TaskId::for_name(&spec.name, Utc::now());
        let mut id = base.clone();
        let mut n = 0;
        while table.records.contains_key(&id) {
            n += 1;
            id = base.with_suffix(n);
        }

        let record = TaskRecord::new(id.clone(), spec);
        table.records.insert(id, record.clone());
        record
    }

    /// Point lookup
    pub async fn get(&self, id: &TaskId) -> Result<TaskRecord> {
        let table = self.table.read().await;
        table
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| Error::task_not_found(id))
    }

    /// Snapshot of all records, in no particular order
    pub async fn list(&self) -> Vec<TaskRecord> {
        let table = self.table.read().await;
        table.records.values().cloned().collect()
    }

    /// IDs of records currently running
    pub async fn running_ids(&self) -> Vec<TaskId> {
        let table = self.table.read().await;
        table
            .records
            .values()
            .filter(|task| task.status.is_running())
            .map(|task| task.id.clone())
            .collect()
    }

    pub async fn stats(&self) -> TaskStats {
        let table = self.table.read().await;
        let mut stats = TaskStats {
            total: table.records.len(),
            ..TaskStats::default()
        };
        for task in table.records.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Move a pending record to running.
    ///
    /// `prepare` runs under the write lock after validation and before the
    /// transition; if it fails the record stays pending.
    pub async fn begin_run<T, F>(
        &self,
        id: &TaskId,
        kill_switch: oneshot::Sender<()>,
        prepare: F,
    ) -> Result<(TaskRecord, T)>
    where
        F: FnOnce(&TaskRecord) -> Result<T>,
    {
        let mut table = self.table.write().await;

        let record = table
            .records
            .get_mut(id)
            .ok_or_else(|| Error::task_not_found(id))?;

        if !record.status.is_pending() {
            return Err(Error::InvalidState(format!(
                "task {} is {}, only pending tasks can be run",
                id, record.status
            )));
        }

        let prepared = prepare(record)?;
        record.start();
        let snapshot = record.clone();

        table.kill_switches.insert(id.clone(), kill_switch);
        Ok((snapshot, prepared))
    }

    /// Record a finished run. Skipped if the task is no longer running.
    pub async fn finalize(&self, id: &TaskId, outcome: ExecutionOutcome) -> Finalized {
        let mut table = self.table.write().await;
        table.kill_switches.remove(id);

        match table.records.get_mut(id) {
            Some(record) if record.status.is_running() => {
                record.finish(outcome);
                Finalized::Applied(record.clone())
            }
            Some(record) => {
                debug!("Task {} already {}, outcome discarded", id, record.status);
                Finalized::Superseded(record.clone())
            }
            None => Finalized::Missing,
        }
    }

    /// Mark a running record cancelled and hand back its kill switch
    pub async fn cancel(
        &self,
        id: &TaskId,
    ) -> Result<(TaskRecord, Option<oneshot::Sender<()>>)> {
        let mut table = self.table.write().await;

        let record = table
            .records
            .get_mut(id)
            .ok_or_else(|| Error::task_not_found(id))?;

        if !record.status.is_running() {
            return Err(Error::InvalidState(format!("task {} is not running", id)));
        }

        record.cancel();
        let snapshot = record.clone();
        let kill_switch = table.kill_switches.remove(id);
        Ok((snapshot, kill_switch))
    }

    /// Remove terminal records whose end time is more than `older_than` ago.
    /// Returns the number removed.
    pub async fn cleanup(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut table = self.table.write().await;
        let before = table.records.len();
        table.records.retain(|_, task| !task.ended_before(cutoff));
        let removed = before - table.records.len();

        if removed > 0 {
            debug!("Cleaned up {} tasks older than {:?}", removed, older_than);
        }
        removed
    }

    #[cfg(test)]
    async fn update<F: FnOnce(&mut TaskRecord)>(&self, id: &TaskId, f: F) {
        let mut table = self.table.write().await;
        if let Some(record) = table.records.get_mut(id) {
            f(record);
        }
    }
}

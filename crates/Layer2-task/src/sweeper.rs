//! Retention sweeper - periodically drops finished tasks from memory
//!
//! Log files and snapshots on disk are left alone.

use crate::registry::TaskRegistry;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Smallest interval accepted; `tokio::time::interval` panics on zero
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    registry: TaskRegistry,
    interval: Duration,
    retention: Duration,
}

impl RetentionSweeper {
    pub fn new(registry: TaskRegistry, interval: Duration, retention: Duration) -> Self {
        Self {
            registry,
            interval: interval.max(MIN_INTERVAL),
            retention,
        }
    }

    /// One pass; returns the number of records removed
    pub async fn sweep(&self) -> usize {
        let removed = self.registry.cleanup(self.retention).await;
        if removed > 0 {
            info!("Retention sweep removed {} tasks", removed);
        } else {
            debug!("Retention sweep: nothing older than {:?}", self.retention);
        }
        removed
    }

    /// Run [`sweep`](Self::sweep) every interval until the handle is aborted.
    /// The first pass runs immediately.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(self.interval);
            interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval_timer.tick().await;
                self.sweep().await;
            }
        })
    }
}

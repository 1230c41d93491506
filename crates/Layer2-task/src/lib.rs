//! # trade-task
//!
//! Task execution and lifecycle management for the trading backend.
//! Runs shell-level jobs (data sync, backtests, maintenance scripts) either
//! on this host or on a worker host over SSH, and tracks them through
//! `pending` -> `running` -> `completed` | `failed`.
//!
//! ## Features
//!
//! - In-memory task registry with race-free transitions
//! - Local and SSH worker execution backends
//! - Per-task `<id>.log` / `<id>.err` capture and `<id>.json` snapshots
//! - **Cancellation of local and remote processes**
//! - **Periodic retention sweeping**

pub mod executor;
pub mod log;
pub mod manager;
pub mod registry;
pub mod state;
pub mod sweeper;
pub mod task;

// Task system
pub use executor::{
    Executor, LocalExecutor, LocalExecutorConfig, ProcessRunner, RemoteExecutor,
    RemoteExecutorConfig, WorkerTarget,
};
pub use manager::{TaskManager, TaskManagerConfig};
pub use registry::{Finalized, TaskRegistry, TaskStats};
pub use state::TaskStatus;
pub use sweeper::RetentionSweeper;
pub use task::{
    ExecutionOutcome, TaskId, TaskRecord, TaskSpec, CANCELLED_MESSAGE, UNKNOWN_EXIT_CODE,
};

// Log system
pub use log::{load_stored_logs, read_snapshot, TaskLogPaths, TaskLogs};

//! Config
//!
//! - `task.rs` - TaskConfig (worker, log directory, sweeper)

mod task;

pub use task::{
    TaskConfig, ENV_TASK_LOG_DIR, ENV_WORKER_HOST, ENV_WORKER_SSH_KEY, ENV_WORKER_USER,
    TASK_CONFIG_FILE,
};

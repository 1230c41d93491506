//! Task executors
//!
//! Provides the two placements:
//! - `LocalExecutor` - runs the command on this host, no shell
//! - `RemoteExecutor` - runs the command on the worker host through `ssh`
//!
//! Both only build the process; `ProcessRunner` spawns it, captures its
//! output and handles termination.

pub mod local;
pub mod process;
pub mod remote;
pub mod r#trait;

pub use local::{LocalExecutor, LocalExecutorConfig};
pub use process::ProcessRunner;
pub use r#trait::Executor;
pub use remote::{RemoteExecutor, RemoteExecutorConfig, WorkerTarget, SSH_PROGRAM};

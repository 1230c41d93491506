//! Task Manager - create, run, cancel and inspect tasks
//!
//! Features:
//! - Task lifecycle (`pending` -> `running` -> `completed` | `failed`)
//! - Local or worker placement per task
//! - Output teed to `<log_dir>/<id>.log` / `<id>.err`, snapshot in `<id>.json`
//! - Cancellation of local and remote processes
//! - Retention sweeping of finished tasks

use crate::executor::{
    Executor, LocalExecutor, LocalExecutorConfig, ProcessRunner, RemoteExecutor,
    RemoteExecutorConfig, WorkerTarget, SSH_PROGRAM,
};
use crate::log::{read_logs, write_snapshot, TaskLogFiles, TaskLogPaths, TaskLogs};
use crate::registry::{Finalized, TaskRegistry, TaskStats};
use crate::sweeper::RetentionSweeper;
use crate::task::{ExecutionOutcome, TaskId, TaskRecord, TaskSpec};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use trade_foundation::{Error, Result, TaskConfig};
use tracing::{debug, info, warn};

/// Poll interval for [`TaskManager::wait`]
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for task manager
#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Worker host for `run_on_worker` tasks
    pub worker: WorkerTarget,

    /// Directory for `<id>.log`, `<id>.err` and `<id>.json`
    pub log_dir: PathBuf,

    /// Maximum concurrently launched processes (unbounded when `None`)
    pub max_concurrent: Option<usize>,

    /// Shell-quote arguments sent to the worker
    pub quote_remote_args: bool,

    /// PID file directory on the worker
    pub remote_pid_dir: String,

    /// SIGTERM to SIGKILL grace period on cancel
    pub kill_grace_period: Duration,

    /// Run each process in its own process group and signal the group
    pub kill_process_group: bool,

    /// SSH client used for worker tasks
    pub ssh_program: PathBuf,
}

impl TaskManagerConfig {
    pub fn new(worker: WorkerTarget, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            worker,
            log_dir: log_dir.into(),
            max_concurrent: None,
            quote_remote_args: true,
            remote_pid_dir: "/tmp".to_string(),
            kill_grace_period: Duration::from_secs(5),
            kill_process_group: true,
            ssh_program: PathBuf::from(SSH_PROGRAM),
        }
    }
}

impl From<&TaskConfig> for TaskManagerConfig {
    fn from(config: &TaskConfig) -> Self {
        Self {
            worker: WorkerTarget::new(
                config.worker_host.clone(),
                config.worker_user.clone(),
                config.worker_ssh_key.clone(),
            ),
            log_dir: config.log_dir.clone(),
            max_concurrent: config.max_concurrent,
            quote_remote_args: config.quote_remote_args,
            remote_pid_dir: config.remote_pid_dir.clone(),
            kill_grace_period: config.kill_grace_period(),
            kill_process_group: true,
            ssh_program: PathBuf::from(SSH_PROGRAM),
        }
    }
}

/// Task Manager - handles task lifecycle and execution
#[derive(Clone)]
pub struct TaskManager {
    /// All tasks by ID
    registry: TaskRegistry,

    /// Local executor
    local_executor: Arc<dyn Executor>,

    /// Worker executor
    remote_executor: Arc<dyn Executor>,

    /// Spawns and supervises processes for both executors
    runner: Arc<ProcessRunner>,

    /// Launch permits when `max_concurrent` is set
    permits: Option<Arc<Semaphore>>,

    /// Configuration
    config: Arc<TaskManagerConfig>,
}

impl TaskManager {
    /// Create a manager; the log directory is created if missing
    pub fn new(config: TaskManagerConfig) -> Result<Self> {
        if config.max_concurrent == Some(0) {
            return Err(Error::Config(
                "max_concurrent must be at least 1 when set".to_string(),
            ));
        }

        std::fs::create_dir_all(&config.log_dir).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to create {}: {}", config.log_dir.display(), e),
            ))
        })?;

        let local_executor = LocalExecutor::with_config(LocalExecutorConfig {
            kill_process_group: config.kill_process_group,
        });
        let remote_executor = RemoteExecutor::new(RemoteExecutorConfig {
            target: config.worker.clone(),
            quote_args: config.quote_remote_args,
            pid_dir: config.remote_pid_dir.clone(),
            ssh_program: config.ssh_program.clone(),
        });
        let runner = ProcessRunner::new(config.kill_grace_period, config.kill_process_group);
        let permits = config.max_concurrent.map(|n| Arc::new(Semaphore::new(n)));

        info!(
            "Task manager ready (log dir {}, worker {})",
            config.log_dir.display(),
            config.worker.destination()
        );

        Ok(Self {
            registry: TaskRegistry::new(),
            local_executor: Arc::new(local_executor),
            remote_executor: Arc::new(remote_executor),
            runner: Arc::new(runner),
            permits,
            config: Arc::new(config),
        })
    }

    /// Build from the resolved application config
    pub fn from_config(config: &TaskConfig) -> Result<Self> {
        Self::new(TaskManagerConfig::from(config))
    }

    /// Executor for the task's placement
    fn executor_for(&self, task: &TaskRecord) -> Arc<dyn Executor> {
        if task.run_on_worker {
            Arc::clone(&self.remote_executor)
        } else {
            Arc::clone(&self.local_executor)
        }
    }

    // ========== Lifecycle ==========

    /// Register a new pending task
    pub async fn create(&self, spec: TaskSpec) -> TaskRecord {
        let task = self.registry.create(spec).await;
        info!(
            "Created task {}: {} {:?} ({})",
            task.id,
            task.command,
            task.args,
            placement(&task)
        );
        task
    }

    /// Register a new pending task from its parts
    pub async fn create_task(
        &self,
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        params: HashMap<String, Value>,
        run_on_worker: bool,
    ) -> TaskRecord {
        self.create(TaskSpec {
            name: name.into(),
            command: command.into(),
            args,
            params,
            run_on_worker,
        })
        .await
    }

    /// Start a pending task in the background.
    ///
    /// Returns once the task is `running` and its log files exist. Launch
    /// failures are recorded on the task, not returned here.
    pub async fn run(&self, id: &TaskId) -> Result<()> {
        let paths = TaskLogPaths::new(&self.config.log_dir, id);
        let (kill_tx, kill_rx) = oneshot::channel();

        let (task, files) = self
            .registry
            .begin_run(id, kill_tx, |_| TaskLogFiles::create(&paths))
            .await?;

        info!("Running task {} ({})", task.id, placement(&task));

        let manager = self.clone();
        tokio::spawn(async move {
            manager.dispatch(task, files, kill_rx).await;
        });

        Ok(())
    }

    /// Execution unit of one run: wait for a permit, launch, record
    async fn dispatch(
        self,
        task: TaskRecord,
        files: TaskLogFiles,
        mut kill: oneshot::Receiver<()>,
    ) {
        let _permit = match &self.permits {
            Some(permits) => {
                tokio::select! {
                    permit = permits.clone().acquire_owned() => permit.ok(),
                    Ok(()) = &mut kill => {
                        debug!("Task {} cancelled before launch", task.id);
                        self.complete(&task.id, ExecutionOutcome::launch_failed("cancelled"))
                            .await;
                        return;
                    }
                }
            }
            None => None,
        };

        let executor = self.executor_for(&task);

        let outcome = match executor.command(&task) {
            Ok(command) => {
                debug!("Launching task {} via {} executor", task.id, executor.name());
                self.runner.run(&task.id, command, files, kill).await
            }
            Err(e) => {
                warn!("Task {} could not be prepared: {}", task.id, e);
                match e {
                    Error::ProcessLaunch(message) => ExecutionOutcome::launch_failed(message),
                    other => ExecutionOutcome::launch_failed(other),
                }
            }
        };

        self.complete(&task.id, outcome).await;
    }

    /// Record the outcome once and write the snapshot
    async fn complete(&self, id: &TaskId, outcome: ExecutionOutcome) {
        let task = match self.registry.finalize(id, outcome).await {
            Finalized::Applied(task) => {
                info!(
                    "Task {} {} (exit code {}, {:.1}s)",
                    task.id,
                    task.status,
                    task.exit_code,
                    task.duration().unwrap_or_default().as_secs_f64()
                );
                task
            }
            Finalized::Superseded(task) => task,
            Finalized::Missing => {
                debug!("Task {} no longer registered, skipping snapshot", id);
                return;
            }
        };

        if let Err(e) = write_snapshot(&self.config.log_dir, &task) {
            warn!("Failed to write snapshot for task {}: {}", task.id, e);
        }
    }

    /// Cancel a running task.
    ///
    /// The record is marked failed before this returns; process termination
    /// continues in the background.
    pub async fn cancel(&self, id: &TaskId) -> Result<TaskRecord> {
        let (task, kill_switch) = self.registry.cancel(id).await?;

        let executor = self.executor_for(&task);
        let cancelled = task.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.cancel(&cancelled).await {
                warn!(
                    "{} cancel for task {} failed: {}",
                    executor.name(),
                    cancelled.id,
                    e
                );
            }
        });

        match kill_switch {
            Some(kill) => {
                if kill.send(()).is_err() {
                    debug!("Task {} process already gone", id);
                }
            }
            None => debug!("Task {} has no kill switch", id),
        }

        info!("Cancelled task {}", id);
        Ok(task)
    }

    // ========== Queries ==========

    pub async fn get(&self, id: &TaskId) -> Result<TaskRecord> {
        self.registry.get(id).await
    }

    pub async fn list(&self) -> Vec<TaskRecord> {
        self.registry.list().await
    }

    /// IDs of tasks currently running
    pub async fn running_tasks(&self) -> Vec<TaskId> {
        self.registry.running_ids().await
    }

    pub async fn stats(&self) -> TaskStats {
        self.registry.stats().await
    }

    /// Wait for a task to reach a terminal status
    pub async fn wait(&self, id: &TaskId) -> Result<TaskRecord> {
        loop {
            let task = self.get(id).await?;
            if task.is_terminal() {
                return Ok(task);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    // ========== Log Access Methods ==========

    /// Artifact paths of a task (the files may not exist yet)
    pub fn log_paths(&self, id: &TaskId) -> TaskLogPaths {
        TaskLogPaths::new(&self.config.log_dir, id)
    }

    /// Stored stdout/stderr of a known task
    pub async fn logs(&self, id: &TaskId) -> Result<TaskLogs> {
        let task = self.get(id).await?;
        let (stdout, stderr) = read_logs(&self.log_paths(id)).await?;
        Ok(TaskLogs {
            task,
            stdout,
            stderr,
        })
    }

    // ========== Retention ==========

    /// Drop finished tasks whose end time is older than `older_than`
    pub async fn cleanup(&self, older_than: Duration) -> usize {
        let removed = self.registry.cleanup(older_than).await;
        if removed > 0 {
            info!("Removed {} tasks older than {:?}", removed, older_than);
        }
        removed
    }

    /// Start the background sweeper (runs until the handle is aborted)
    pub fn start_periodic_cleanup(
        &self,
        interval: Duration,
        retention: Duration,
    ) -> JoinHandle<()> {
        info!(
            "Starting task cleanup every {:?} (retention {:?})",
            interval, retention
        );
        RetentionSweeper::new(self.registry.clone(), interval, retention).spawn()
    }
}

fn placement(task: &TaskRecord) -> &'static str {
    if task.run_on_worker {
        "worker"
    } else {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::TaskStatus;

    fn manager(dir: &std::path::Path) -> TaskManager {
        TaskManager::new(TaskManagerConfig::new(
            WorkerTarget::new("worker", "root", "/nonexistent/key"),
            dir,
        ))
        .unwrap()
    }

    #[test]
    fn test_config_from_task_config() {
        let mut app = TaskConfig::default();
        app.worker_host = "w1".to_string();
        app.max_concurrent = Some(2);
        app.quote_remote_args = false;

        let config = TaskManagerConfig::from(&app);
        assert_eq!(config.worker.destination(), "root@w1");
        assert_eq!(config.max_concurrent, Some(2));
        assert!(!config.quote_remote_args);
        assert_eq!(config.kill_grace_period, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = TaskManagerConfig::new(
            WorkerTarget::new("worker", "root", "/nonexistent/key"),
            tmp.path(),
        );
        config.max_concurrent = Some(0);

        let result = TaskManager::new(config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_new_creates_log_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/logs");
        manager(&dir);
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn test_run_unknown_task() {
        let tmp = tempfile::tempdir().unwrap();
        let err = manager(tmp.path())
            .run(&TaskId::from("missing-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_run_fails_when_log_dir_is_gone() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("logs");
        let manager = manager(&dir);
        let task = manager.create(TaskSpec::new("echo", "echo")).await;

        std::fs::remove_dir_all(&dir).unwrap();
        let err = manager.run(&task.id).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        let task = manager.get(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.start_time.is_none());
    }

    #[tokio::test]
    async fn test_logs_for_unknown_task() {
        let tmp = tempfile::tempdir().unwrap();
        let err = manager(tmp.path())
            .logs(&TaskId::from("missing-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_logs_before_run() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = manager(tmp.path());
        let task = manager.create(TaskSpec::new("echo", "echo")).await;

        let err = manager.logs(&task.id).await.unwrap_err();
        assert!(err.to_string().contains("log file"));
    }

    #[tokio::test]
    async fn test_isolated_managers() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let first = manager(a.path());
        let second = manager(b.path());

        let task = first.create(TaskSpec::new("only-here", "true")).await;
        assert!(second.get(&task.id).await.is_err());
        assert_eq!(first.list().await.len(), 1);
        assert!(second.list().await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bounded_concurrency_queues_launches() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = TaskManagerConfig::new(
            WorkerTarget::new("worker", "root", "/nonexistent/key"),
            tmp.path(),
        );
        config.max_concurrent = Some(1);
        let manager = TaskManager::new(config).unwrap();

        let first = manager
            .create(TaskSpec::new("first", "sleep").with_args(["0.3"]))
            .await;
        let second = manager
            .create(TaskSpec::new("second", "echo").with_args(["queued"]))
            .await;

        manager.run(&first.id).await.unwrap();
        manager.run(&second.id).await.unwrap();

        let second = manager.wait(&second.id).await.unwrap();
        let first = manager.get(&first.id).await.unwrap();
        assert_eq!(first.status, TaskStatus::Completed);
        assert_eq!(second.status, TaskStatus::Completed);
        assert!(second.end_time >= first.end_time);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_while_waiting_for_permit() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = TaskManagerConfig::new(
            WorkerTarget::new("worker", "root", "/nonexistent/key"),
            tmp.path(),
        );
        config.max_concurrent = Some(1);
        let manager = TaskManager::new(config).unwrap();

        let blocker = manager
            .create(TaskSpec::new("blocker", "sleep").with_args(["30"]))
            .await;
        let queued = manager
            .create(TaskSpec::new("queued", "echo").with_args(["never"]))
            .await;

        manager.run(&blocker.id).await.unwrap();
        manager.run(&queued.id).await.unwrap();

        let cancelled = manager.cancel(&queued.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Failed);

        manager.cancel(&blocker.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let queued = manager.get(&queued.id).await.unwrap();
        assert_eq!(queued.error, crate::task::CANCELLED_MESSAGE);
        assert!(manager.log_paths(&queued.id).snapshot.exists());
    }
}

//! Task Config - worker placement, log directory and sweeper settings
//!
//! Load order: defaults, then an optional JSON file, then environment
//! overrides. The task core never reads the environment itself; it is handed
//! the resolved values.

use crate::storage::JsonStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name inside the global config directory
pub const TASK_CONFIG_FILE: &str = "config.json";

pub const ENV_WORKER_HOST: &str = "WORKER_HOST";
pub const ENV_WORKER_USER: &str = "WORKER_USER";
pub const ENV_WORKER_SSH_KEY: &str = "WORKER_SSH_KEY";
pub const ENV_TASK_LOG_DIR: &str = "TASK_LOG_DIR";

const DEFAULT_WORKER_HOST: &str = "instance-20250416-112838";
const DEFAULT_WORKER_USER: &str = "root";
const DEFAULT_WORKER_SSH_KEY: &str = "/opt/trademicro/.ssh/worker_key";
const DEFAULT_LOG_DIR: &str = "/opt/trademicro/logs/tasks";

/// Task manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(default = "default_worker_host")]
    pub worker_host: String,

    #[serde(default = "default_worker_user")]
    pub worker_user: String,

    /// Private key passed to `ssh -i`
    #[serde(default = "default_worker_ssh_key")]
    pub worker_ssh_key: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Cap on concurrently launched processes; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,

    /// Shell-quote arguments in the remote command string
    #[serde(default = "default_true")]
    pub quote_remote_args: bool,

    /// Directory on the worker where remote PID files are written
    #[serde(default = "default_remote_pid_dir")]
    pub remote_pid_dir: String,

    /// SIGTERM to SIGKILL grace period when cancelling a local process
    #[serde(default = "default_kill_grace_period_secs")]
    pub kill_grace_period_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Age after which finished tasks are swept from memory
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

fn default_worker_host() -> String {
    DEFAULT_WORKER_HOST.to_string()
}

fn default_worker_user() -> String {
    DEFAULT_WORKER_USER.to_string()
}

fn default_worker_ssh_key() -> PathBuf {
    PathBuf::from(DEFAULT_WORKER_SSH_KEY)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_DIR)
}

fn default_true() -> bool {
    true
}

fn default_remote_pid_dir() -> String {
    "/tmp".to_string()
}

fn default_kill_grace_period_secs() -> u64 {
    5
}

fn default_cleanup_interval_secs() -> u64 {
    6 * 60 * 60
}

fn default_retention_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            worker_host: default_worker_host(),
            worker_user: default_worker_user(),
            worker_ssh_key: default_worker_ssh_key(),
            log_dir: default_log_dir(),
            max_concurrent: None,
            quote_remote_args: true,
            remote_pid_dir: default_remote_pid_dir(),
            kill_grace_period_secs: default_kill_grace_period_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl TaskConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// Resolve the effective config: file (explicit path or global store),
    /// then process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_file(path)?,
            None => match JsonStore::global() {
                Ok(store) => store
                    .load_optional::<TaskConfig>(TASK_CONFIG_FILE)?
                    .unwrap_or_default(),
                Err(_) => Self::default(),
            },
        };

        config.apply_env_with(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit JSON file
    pub fn load_file(path: &Path) -> Result<Self> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::Config(format!("Invalid config path: {}", path.display())))?;
        JsonStore::new(dir).load(filename)
    }

    /// Apply `WORKER_*` / `TASK_LOG_DIR` overrides; empty values are ignored
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(host) = get(ENV_WORKER_HOST) {
            self.worker_host = host;
        }
        if let Some(user) = get(ENV_WORKER_USER) {
            self.worker_user = user;
        }
        if let Some(key) = get(ENV_WORKER_SSH_KEY) {
            self.worker_ssh_key = PathBuf::from(key);
        }
        if let Some(dir) = get(ENV_TASK_LOG_DIR) {
            self.log_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_host.trim().is_empty() {
            return Err(Error::Config("workerHost must not be empty".to_string()));
        }
        if self.worker_user.trim().is_empty() {
            return Err(Error::Config("workerUser must not be empty".to_string()));
        }
        if self.max_concurrent == Some(0) {
            return Err(Error::Config(
                "maxConcurrent must be at least 1 when set".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(Error::Config(
                "cleanupIntervalSecs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    // ========================================================================
    // Durations
    // ========================================================================

    pub fn kill_grace_period(&self) -> Duration {
        Duration::from_secs(self.kill_grace_period_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = TaskConfig::default();
        assert_eq!(config.worker_user, "root");
        assert_eq!(config.log_dir, PathBuf::from("/opt/trademicro/logs/tasks"));
        assert!(config.quote_remote_args);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(21_600));
        assert_eq!(config.retention(), Duration::from_secs(604_800));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"{ "workerHost": "worker-2", "maxConcurrent": 8 }"#,
        )
        .unwrap();

        let config = TaskConfig::load_file(&path).unwrap();
        assert_eq!(config.worker_host, "worker-2");
        assert_eq!(config.max_concurrent, Some(8));
        assert_eq!(config.worker_user, "root");
        assert_eq!(config.kill_grace_period(), Duration::from_secs(5));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_WORKER_HOST, "10.0.0.7"),
            (ENV_WORKER_USER, ""),
            (ENV_TASK_LOG_DIR, "/var/log/tasks"),
        ]
        .into_iter()
        .collect();

        let mut config = TaskConfig::default();
        config.apply_env_with(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.worker_host, "10.0.0.7");
        assert_eq!(config.worker_user, "root");
        assert_eq!(config.log_dir, PathBuf::from("/var/log/tasks"));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = TaskConfig {
            max_concurrent: Some(0),
            ..TaskConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}

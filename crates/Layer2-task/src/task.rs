//! Task record and related types

use crate::state::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Error text recorded on a task that was cancelled while running
pub const CANCELLED_MESSAGE: &str = "Task was cancelled";

/// Exit code recorded until the process exits, or when it never ran
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Unique identifier for a task: `<name>-<creation unix seconds>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// ID for a task named `name` created at `created_at`
    pub fn for_name(name: &str, created_at: DateTime<Utc>) -> Self {
        Self(format!("{}-{}", name, created_at.timestamp()))
    }

    /// Same ID with a numeric suffix, used when the base ID is taken
    pub fn with_suffix(&self, n: u32) -> Self {
        Self(format!("{}-{}", self.0, n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Caller request for a new task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub run_on_worker: bool,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn on_worker(mut self, run_on_worker: bool) -> Self {
        self.run_on_worker = run_on_worker;
        self
    }
}

/// One tracked job. Field names are the snapshot wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub status: TaskStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub output: String,
    pub error: String,
    pub exit_code: i32,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    pub run_on_worker: bool,
}

impl TaskRecord {
    /// Create a pending record
    pub fn new(id: TaskId, spec: TaskSpec) -> Self {
        Self {
            id,
            name: spec.name,
            command: spec.command,
            args: spec.args,
            status: TaskStatus::Pending,
            start_time: None,
            end_time: None,
            output: String::new(),
            error: String::new(),
            exit_code: UNKNOWN_EXIT_CODE,
            params: spec.params,
            run_on_worker: spec.run_on_worker,
        }
    }

    /// Mark task as running
    pub fn start(&mut self) {
        debug_assert!(self.status.can_transition_to(TaskStatus::Running));
        self.status = TaskStatus::Running;
        self.start_time = Some(Utc::now());
    }

    /// Record the process outcome; `completed` only for exit code 0
    pub fn finish(&mut self, outcome: ExecutionOutcome) {
        let next = if outcome.is_success() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        debug_assert!(self.status.can_transition_to(next));

        self.end_time = Some(Utc::now());
        self.output = outcome.output;
        self.error = outcome.error;
        self.exit_code = outcome.exit_code;
        self.status = next;
    }

    /// Mark task as cancelled
    pub fn cancel(&mut self) {
        debug_assert!(self.status.can_transition_to(TaskStatus::Failed));
        self.status = TaskStatus::Failed;
        self.error = CANCELLED_MESSAGE.to_string();
        self.end_time = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Terminal and finished before `cutoff`
    pub fn ended_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_terminal() && self.end_time.map(|t| t < cutoff).unwrap_or(false)
    }

    /// Get execution duration if task has started
    pub fn duration(&self) -> Option<Duration> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(Utc::now);
        Some((end - start).to_std().unwrap_or_default())
    }
}

/// What a finished process left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub output: String,
    pub error: String,
    pub exit_code: i32,
}

impl ExecutionOutcome {
    /// Process exited; `code` is `None` when it was killed by a signal
    pub fn exited(code: Option<i32>, stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            output: String::from_utf8_lossy(stdout).into_owned(),
            error: String::from_utf8_lossy(stderr).into_owned(),
            exit_code: code.unwrap_or(UNKNOWN_EXIT_CODE),
        }
    }

    /// Process could not be started at all
    pub fn launch_failed(message: impl std::fmt::Display) -> Self {
        Self {
            output: String::new(),
            error: format!("failed to start process: {}", message),
            exit_code: UNKNOWN_EXIT_CODE,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> TaskRecord {
        let id = TaskId::for_name("echo-test", Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        TaskRecord::new(id, TaskSpec::new("echo-test", "echo").with_args(["hello"]))
    }

    #[test]
    fn test_id_format() {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let id = TaskId::for_name("sync-symbols", at);
        assert_eq!(id.as_str(), "sync-symbols-1700000000");
        assert_eq!(id.with_suffix(2).as_str(), "sync-symbols-1700000000-2");
    }

    #[test]
    fn test_new_record_is_pending() {
        let task = record();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.exit_code, -1);
        assert!(task.start_time.is_none());
        assert!(task.end_time.is_none());
        assert!(task.duration().is_none());
    }

    #[test]
    fn test_finish_sets_status_from_exit_code() {
        let mut ok = record();
        ok.start();
        ok.finish(ExecutionOutcome::exited(Some(0), b"hello\n", b""));
        assert_eq!(ok.status, TaskStatus::Completed);
        assert_eq!(ok.output, "hello\n");
        assert!(ok.end_time.is_some());

        let mut bad = record();
        bad.start();
        bad.finish(ExecutionOutcome::exited(None, b"", b"killed"));
        assert_eq!(bad.status, TaskStatus::Failed);
        assert_eq!(bad.exit_code, -1);
    }

    #[test]
    fn test_cancel() {
        let mut task = record();
        task.start();
        task.cancel();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error, CANCELLED_MESSAGE);
        assert!(task.end_time.is_some());
    }

    #[test]
    fn test_snapshot_field_names() {
        let task = record();
        let value = serde_json::to_value(&task).unwrap();
        let obj = value.as_object().unwrap();
        for key in [
            "id",
            "name",
            "command",
            "args",
            "status",
            "start_time",
            "end_time",
            "output",
            "error",
            "exit_code",
            "params",
            "run_on_worker",
        ] {
            assert!(obj.contains_key(key), "missing {}", key);
        }
        assert_eq!(obj.len(), 12);
        assert_eq!(obj["id"], "echo-test-1700000000");
        assert_eq!(obj["status"], "pending");
        assert!(obj["start_time"].is_null());
    }

    #[test]
    fn test_spec_deserialize_defaults() {
        let spec: TaskSpec =
            serde_json::from_str(r#"{ "name": "n", "command": "true" }"#).unwrap();
        assert!(spec.args.is_empty());
        assert!(spec.params.is_empty());
        assert!(!spec.run_on_worker);
    }
}

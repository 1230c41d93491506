//! Task log artifacts
//!
//! Every run owns three files in the log directory:
//! - `<id>.log` - raw stdout bytes
//! - `<id>.err` - raw stderr bytes
//! - `<id>.json` - pretty JSON snapshot of the finalized record
//!
//! Output is teed: each chunk read from a pipe is appended to its log file
//! and to an in-memory buffer that ends up on the task record.

use crate::task::{TaskId, TaskRecord};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use trade_foundation::{Error, JsonStore, Result};
use tracing::{debug, warn};

/// Read chunk size for pipe capture
const CHUNK_SIZE: usize = 8 * 1024;

/// Paths of a task's artifacts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub snapshot: PathBuf,
}

impl TaskLogPaths {
    pub fn new(log_dir: &Path, task_id: &TaskId) -> Self {
        Self {
            stdout: log_dir.join(format!("{}.log", task_id)),
            stderr: log_dir.join(format!("{}.err", task_id)),
            snapshot: log_dir.join(snapshot_file_name(task_id)),
        }
    }
}

fn snapshot_file_name(task_id: &TaskId) -> String {
    format!("{}.json", task_id)
}

/// Open stdout/stderr log files for one run
#[derive(Debug)]
pub struct TaskLogFiles {
    pub stdout: File,
    pub stderr: File,
}

impl TaskLogFiles {
    /// Create (truncating) both files. Synchronous so it can run while the
    /// registry lock is held.
    pub fn create(paths: &TaskLogPaths) -> Result<Self> {
        let stdout = std::fs::File::create(&paths.stdout).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to create {}: {}", paths.stdout.display(), e),
            ))
        })?;
        let stderr = std::fs::File::create(&paths.stderr).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to create {}: {}", paths.stderr.display(), e),
            ))
        })?;

        Ok(Self {
            stdout: File::from_std(stdout),
            stderr: File::from_std(stderr),
        })
    }
}

/// Output of one pipe, captured by [`tee`]
#[derive(Debug)]
pub struct TeeCapture {
    handle: JoinHandle<()>,
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl TeeCapture {
    /// Wait up to `timeout` for the pipe to close, then return everything
    /// read so far. A reader still blocked after that (the pipe is held open
    /// by an orphaned grandchild) is aborted; its bytes are kept.
    pub async fn finish(self, task_id: &TaskId, timeout: Duration) -> Vec<u8> {
        let Self { mut handle, buffer } = self;

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Task {} output reader failed: {}", task_id, e),
            Err(_) => {
                warn!("Task {} output still open after exit, abandoning", task_id);
                handle.abort();
                // wait for the task to drop so nothing else touches the buffer
                let _ = handle.await;
            }
        }

        let mut captured = buffer.lock().await;
        std::mem::take(&mut *captured)
    }
}

/// Copy `reader` into `file` and into the returned capture.
///
/// A failing file write is logged once and capture continues in memory only.
pub fn tee<R>(mut reader: R, mut file: File, task_id: TaskId, stream: &'static str) -> TeeCapture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let captured = Arc::clone(&buffer);

    let handle = tokio::spawn(async move {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut file_ok = true;
        let mut total = 0;

        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!("Task {} {} read error: {}", task_id, stream, e);
                    break;
                }
            };

            captured.lock().await.extend_from_slice(&chunk[..n]);
            total += n;

            if file_ok {
                if let Err(e) = file.write_all(&chunk[..n]).await {
                    warn!("Task {} {} log write failed: {}", task_id, stream, e);
                    file_ok = false;
                }
            }
        }

        if file_ok {
            if let Err(e) = file.flush().await {
                warn!("Task {} {} log flush failed: {}", task_id, stream, e);
            }
        }

        debug!("Task {} {} captured {} bytes", task_id, stream, total);
    });

    TeeCapture { handle, buffer }
}

/// Write the finalized record as `<id>.json`
pub fn write_snapshot(log_dir: &Path, task: &TaskRecord) -> Result<()> {
    JsonStore::new(log_dir).save(&snapshot_file_name(&task.id), task)
}

/// Read a snapshot written by [`write_snapshot`]
pub fn read_snapshot(log_dir: &Path, task_id: &TaskId) -> Result<Option<TaskRecord>> {
    JsonStore::new(log_dir).load_optional(&snapshot_file_name(task_id))
}

/// Stored output of a task, as served to log readers
#[derive(Debug, Clone, Serialize)]
pub struct TaskLogs {
    pub task: TaskRecord,
    pub stdout: String,
    pub stderr: String,
}

/// Read `<id>.log` and `<id>.err`. The stdout file must exist; a missing
/// stderr file reads as empty.
pub async fn read_logs(paths: &TaskLogPaths) -> Result<(String, String)> {
    let stdout = match tokio::fs::read(&paths.stdout).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!(
                "log file {} not found",
                paths.stdout.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };

    let stderr = match tokio::fs::read(&paths.stderr).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };

    Ok((
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    ))
}

/// Artifacts of a finished task read back from disk alone, for callers
/// without the manager that ran it
pub async fn load_stored_logs(log_dir: &Path, task_id: &TaskId) -> Result<TaskLogs> {
    let task =
        read_snapshot(log_dir, task_id)?.ok_or_else(|| Error::task_not_found(task_id))?;
    let (stdout, stderr) = read_logs(&TaskLogPaths::new(log_dir, task_id)).await?;
    Ok(TaskLogs {
        task,
        stdout,
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;

    #[test]
    fn test_paths() {
        let id = TaskId::from("echo-test-1700000000");
        let paths = TaskLogPaths::new(Path::new("/var/log/tasks"), &id);
        assert_eq!(
            paths.stdout,
            PathBuf::from("/var/log/tasks/echo-test-1700000000.log")
        );
        assert_eq!(
            paths.stderr,
            PathBuf::from("/var/log/tasks/echo-test-1700000000.err")
        );
        assert_eq!(
            paths.snapshot,
            PathBuf::from("/var/log/tasks/echo-test-1700000000.json")
        );
    }

    #[tokio::test]
    async fn test_tee_writes_file_and_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let id = TaskId::from("tee-1");
        let paths = TaskLogPaths::new(tmp.path(), &id);
        let files = TaskLogFiles::create(&paths).unwrap();

        let input: &[u8] = b"line one\nline two\n";
        let captured = tee(input, files.stdout, id.clone(), "stdout")
            .finish(&id, Duration::from_secs(5))
            .await;

        assert_eq!(captured, input);
        assert_eq!(std::fs::read(&paths.stdout).unwrap(), input);
    }

    #[tokio::test]
    async fn test_abandoned_reader_keeps_captured_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let id = TaskId::from("open-1");
        let paths = TaskLogPaths::new(tmp.path(), &id);
        let files = TaskLogFiles::create(&paths).unwrap();

        // writer stays alive, so the reader never sees EOF
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"partial\n").await.unwrap();

        let capture = tee(reader, files.stdout, id.clone(), "stdout");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let captured = capture.finish(&id, Duration::from_millis(100)).await;

        assert_eq!(captured, b"partial\n");
        drop(writer);
    }

    #[tokio::test]
    async fn test_read_logs_missing_err_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TaskLogPaths::new(tmp.path(), &TaskId::from("t-1"));
        std::fs::write(&paths.stdout, "out").unwrap();

        let (stdout, stderr) = read_logs(&paths).await.unwrap();
        assert_eq!(stdout, "out");
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn test_read_logs_missing_log_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TaskLogPaths::new(tmp.path(), &TaskId::from("t-2"));
        assert!(matches!(read_logs(&paths).await, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_snapshot_roundtrip_file() {
        let tmp = tempfile::tempdir().unwrap();
        let task = TaskRecord::new(TaskId::from("snap-1"), TaskSpec::new("snap", "true"));

        write_snapshot(tmp.path(), &task).unwrap();
        let raw = std::fs::read_to_string(tmp.path().join("snap-1.json")).unwrap();
        assert!(raw.contains("\"status\": \"pending\""));

        let loaded = read_snapshot(tmp.path(), &task.id).unwrap().unwrap();
        assert_eq!(loaded, task);
    }

    #[tokio::test]
    async fn test_load_stored_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let task = TaskRecord::new(TaskId::from("stored-1"), TaskSpec::new("stored", "true"));
        let paths = TaskLogPaths::new(tmp.path(), &task.id);
        std::fs::write(&paths.stdout, "hello\n").unwrap();
        std::fs::write(&paths.stderr, "warn\n").unwrap();

        let missing = load_stored_logs(tmp.path(), &task.id).await.unwrap_err();
        assert!(matches!(missing, Error::NotFound(_)));

        write_snapshot(tmp.path(), &task).unwrap();
        let logs = load_stored_logs(tmp.path(), &task.id).await.unwrap();
        assert_eq!(logs.task.id, task.id);
        assert_eq!(logs.stdout, "hello\n");
        assert_eq!(logs.stderr, "warn\n");
    }
}

//! Worker-side bootstrap.
//!
//! A spawned worker reads its identity and service endpoints from the
//! environment the authority stamped onto it, loads its pinned snapshot,
//! and talks to the coordinator exclusively through the three sockets.
//! Business logic stays with the caller; this module only hands over the
//! wired-up context.

use std::path::{Path, PathBuf};
use std::time::Duration;

use foreman_authority::{
    ENV_SINK_SOCKET, ENV_SNAPSHOT_PATH, ENV_SNAPSHOT_VERSION, ENV_STORE_SOCKET, ENV_TASKS_SOCKET,
    ENV_WORKER_ID,
};
use foreman_core::types::{
    ConfigSnapshot, ConfigVersion, Level, LogRecord, Task, TaskId, WorkerId,
};
use foreman_sink::{RemoteProducer, WriteStatus};
use foreman_store::RemoteStore;
use foreman_transport::Endpoint;

use crate::error::{io_err, RuntimeError};
use crate::gateway::{TaskReply, TaskRequest};

/// Default timeout for worker-side request/response calls.
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a worker process needs to participate.
pub struct WorkerContext {
    pub worker_id: WorkerId,
    /// The consistent view this worker was cloned from.
    pub snapshot: ConfigSnapshot,
    store: Option<RemoteStore>,
    log: Option<RemoteProducer>,
    tasks: Option<TaskClient>,
}

impl WorkerContext {
    /// Bootstrap from the environment stamped by the authority.
    pub async fn from_env() -> Result<WorkerContext, RuntimeError> {
        let worker_id = WorkerId(parse_env(ENV_WORKER_ID)?);
        let snapshot_version = ConfigVersion(parse_env(ENV_SNAPSHOT_VERSION)?);

        let snapshot = match std::env::var_os(ENV_SNAPSHOT_PATH) {
            Some(path) => load_snapshot(Path::new(&path))?,
            None => ConfigSnapshot {
                version: snapshot_version,
                ..ConfigSnapshot::default()
            },
        };

        let store = match env_path(ENV_STORE_SOCKET) {
            Some(path) => Some(RemoteStore::connect(&path, CALL_TIMEOUT).await?),
            None => None,
        };
        let log = match env_path(ENV_SINK_SOCKET) {
            Some(path) => Some(RemoteProducer::connect(&path, CALL_TIMEOUT).await?),
            None => None,
        };
        let tasks = match env_path(ENV_TASKS_SOCKET) {
            Some(path) => Some(TaskClient::connect(&path).await?),
            None => None,
        };

        Ok(WorkerContext {
            worker_id,
            snapshot,
            store,
            log,
            tasks,
        })
    }

    /// Live store proxy, when the coordinator exposed one.
    pub fn store(&mut self) -> Option<&mut RemoteStore> {
        self.store.as_mut()
    }

    /// Replace the pinned snapshot with a fresh one from the store.
    pub async fn resnapshot(&mut self) -> Result<&ConfigSnapshot, RuntimeError> {
        let store = self
            .store
            .as_mut()
            .ok_or(RuntimeError::MissingEnv(ENV_STORE_SOCKET))?;
        self.snapshot = store.snapshot().await?;
        Ok(&self.snapshot)
    }

    /// Emit one structured record through the shared sink.
    pub async fn log(
        &mut self,
        level: Level,
        message: impl Into<String>,
    ) -> Result<WriteStatus, RuntimeError> {
        let producer = self
            .log
            .as_mut()
            .ok_or(RuntimeError::MissingEnv(ENV_SINK_SOCKET))?;
        let record = LogRecord::new(self.worker_id, level, message);
        Ok(producer.write(record).await?)
    }

    /// Long-poll the coordinator for this worker's next task.
    pub async fn next_task(&mut self) -> Result<Task, RuntimeError> {
        let worker = self.worker_id;
        let tasks = self
            .tasks
            .as_mut()
            .ok_or(RuntimeError::MissingEnv(ENV_TASKS_SOCKET))?;
        tasks.next_task(worker).await
    }

    /// Report a finished task.
    pub async fn complete_task(&mut self, task: TaskId) -> Result<(), RuntimeError> {
        let worker = self.worker_id;
        let tasks = self
            .tasks
            .as_mut()
            .ok_or(RuntimeError::MissingEnv(ENV_TASKS_SOCKET))?;
        tasks.complete(worker, task).await
    }
}

/// Framed client for the task delivery socket.
pub struct TaskClient {
    endpoint: Endpoint,
}

impl TaskClient {
    pub async fn connect(path: &Path) -> Result<TaskClient, RuntimeError> {
        let endpoint = Endpoint::connect_unix(path).await?;
        Ok(TaskClient { endpoint })
    }

    /// Block until the coordinator assigns this worker a task.
    pub async fn next_task(&mut self, worker: WorkerId) -> Result<Task, RuntimeError> {
        self.endpoint.send(&TaskRequest::Next { worker }).await?;
        match self.endpoint.recv_wait::<TaskReply>().await {
            Ok(TaskReply::Assigned { task }) => Ok(task),
            Ok(TaskReply::Error { message }) => Err(RuntimeError::Protocol(message)),
            Ok(other) => Err(RuntimeError::Protocol(format!(
                "unexpected reply: {other:?}"
            ))),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn complete(&mut self, worker: WorkerId, task: TaskId) -> Result<(), RuntimeError> {
        self.endpoint
            .send(&TaskRequest::Complete { worker, task })
            .await?;
        match self.endpoint.recv::<TaskReply>(CALL_TIMEOUT).await? {
            TaskReply::Ack => Ok(()),
            TaskReply::Error { message } => Err(RuntimeError::Protocol(message)),
            other => Err(RuntimeError::Protocol(format!(
                "unexpected reply: {other:?}"
            ))),
        }
    }
}

fn env_path(var: &'static str) -> Option<PathBuf> {
    std::env::var_os(var).map(PathBuf::from)
}

fn parse_env(var: &'static str) -> Result<u64, RuntimeError> {
    let raw = std::env::var(var).map_err(|_| RuntimeError::MissingEnv(var))?;
    raw.parse()
        .map_err(|_| RuntimeError::InvalidEnv { var, value: raw })
}

fn load_snapshot(path: &Path) -> Result<ConfigSnapshot, RuntimeError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_env_reports_missing_and_invalid() {
        // A variable name no other test touches.
        const VAR: &str = "FOREMAN_WORKER_ID_PARSE_TEST";
        std::env::remove_var(VAR);
        assert!(matches!(parse_env(VAR), Err(RuntimeError::MissingEnv(_))));

        std::env::set_var(VAR, "not-a-number");
        assert!(matches!(
            parse_env(VAR),
            Err(RuntimeError::InvalidEnv { .. })
        ));

        std::env::set_var(VAR, "17");
        assert_eq!(parse_env(VAR).expect("parses"), 17);
        std::env::remove_var(VAR);
    }

    #[test]
    fn snapshot_file_roundtrip() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let path = tmp.path().join("worker-1.json");
        let snapshot = ConfigSnapshot {
            version: ConfigVersion(4),
            entries: [(foreman_core::types::ConfigKey::from("a"), json!(1))]
                .into_iter()
                .collect(),
        };
        std::fs::write(&path, serde_json::to_string(&snapshot).expect("encode")).expect("write");

        let loaded = load_snapshot(&path).expect("load");
        assert_eq!(loaded, snapshot);
    }

    #[test]
    fn missing_snapshot_file_is_an_io_error() {
        let tmp = tempfile::TempDir::new().expect("tmpdir");
        let err = load_snapshot(&tmp.path().join("absent.json")).expect_err("missing file");
        assert!(matches!(err, RuntimeError::Io { .. }));
    }
}

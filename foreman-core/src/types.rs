//! Domain types for the Foreman coordination core.
//!
//! Everything that crosses a process boundary is serializable via serde +
//! serde_json; nothing in here holds a live handle or a lock.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Configuration values are immutable JSON scalars or nested mappings.
pub type ConfigValue = serde_json::Value;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// An opaque, immutable configuration key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigKey(pub String);

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ConfigKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConfigKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Monotonically increasing store version; every committed mutation
/// increments it exactly once.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ConfigVersion(pub u64);

impl ConfigVersion {
    /// The version of an empty, never-written store.
    pub const ZERO: ConfigVersion = ConfigVersion(0);

    /// The next version in the total order of committed writes.
    #[must_use]
    pub fn next(self) -> ConfigVersion {
        ConfigVersion(self.0 + 1)
    }
}

impl fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Worker identifier, unique for the authority's lifetime and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A strongly-typed identifier for a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Log records
// ---------------------------------------------------------------------------

/// Severity of a log record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Trace => write!(f, "trace"),
            Level::Debug => write!(f, "debug"),
            Level::Info => write!(f, "info"),
            Level::Warn => write!(f, "warn"),
            Level::Error => write!(f, "error"),
        }
    }
}

/// One record accepted by the log sink.
///
/// `seq` is assigned by the sink on acceptance and defines the arrival-order
/// total ordering; producers must leave it `None`. The sink never reorders by
/// `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub worker: WorkerId,
    pub level: Level,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, ConfigValue>,
}

impl LogRecord {
    /// A record with the current timestamp and no structured fields.
    pub fn new(worker: WorkerId, level: Level, message: impl Into<String>) -> Self {
        Self {
            seq: None,
            timestamp: Utc::now(),
            worker,
            level,
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Attach a structured field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: ConfigValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// A unit of work dispatched to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub payload: ConfigValue,
    /// Whether the task may be re-dispatched after a worker crash.
    #[serde(default)]
    pub retryable: bool,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, payload: ConfigValue) -> Self {
        Self {
            id: id.into(),
            payload,
            retryable: false,
        }
    }

    /// Mark the task safe to re-dispatch after a crash.
    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// Reference to what a spawned worker runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl EntryPoint {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Worker lifecycle as observed by the authority.
///
/// `Spawning -> Running -> (Terminating -> Terminated | Crashed)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Spawning,
    Running,
    Terminating,
    Terminated,
    Crashed,
}

impl WorkerState {
    /// Terminal states are never left once entered.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Terminated | WorkerState::Crashed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Spawning => write!(f, "spawning"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Terminating => write!(f, "terminating"),
            WorkerState::Terminated => write!(f, "terminated"),
            WorkerState::Crashed => write!(f, "crashed"),
        }
    }
}

/// Everything the authority knows about one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub id: WorkerId,
    pub entry_point: EntryPoint,
    /// Config version the worker's startup snapshot was pinned at.
    pub snapshot_version: ConfigVersion,
    pub state: WorkerState,
    /// OS process id; `None` until spawned or after the handle is gone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub spawned_at: DateTime<Utc>,
    /// Task in flight when the worker last reported, for crash retry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_task: Option<Task>,
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// An immutable, versioned copy of the config store mapping at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConfigSnapshot {
    pub version: ConfigVersion,
    #[serde(default)]
    pub entries: BTreeMap<ConfigKey, ConfigValue>,
}

impl ConfigSnapshot {
    pub fn get(&self, key: &ConfigKey) -> Option<&ConfigValue> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn newtype_display() {
        assert_eq!(ConfigKey::from("db.host").to_string(), "db.host");
        assert_eq!(WorkerId(3).to_string(), "worker-3");
        assert_eq!(TaskId::from("t-01").to_string(), "t-01");
        assert_eq!(ConfigVersion(5).to_string(), "v5");
    }

    #[test]
    fn version_next_is_strictly_increasing() {
        let v = ConfigVersion::ZERO;
        assert_eq!(v.next(), ConfigVersion(1));
        assert_eq!(v.next().next(), ConfigVersion(2));
        assert!(v < v.next());
    }

    #[test]
    fn terminal_states() {
        assert!(WorkerState::Terminated.is_terminal());
        assert!(WorkerState::Crashed.is_terminal());
        assert!(!WorkerState::Running.is_terminal());
        assert!(!WorkerState::Terminating.is_terminal());
    }

    #[test]
    fn log_record_serde_roundtrip() {
        let record = LogRecord::new(WorkerId(1), Level::Warn, "disk almost full")
            .with_field("free_bytes", json!(1024));
        let encoded = serde_json::to_string(&record).expect("serialize");
        let decoded: LogRecord = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(record, decoded);
        assert_eq!(decoded.seq, None, "producers never carry a seq");
    }

    #[test]
    fn level_serde_is_lowercase() {
        assert_eq!(serde_json::to_string(&Level::Error).unwrap(), "\"error\"");
        let level: Level = serde_json::from_str("\"trace\"").unwrap();
        assert_eq!(level, Level::Trace);
    }

    #[test]
    fn snapshot_lookup() {
        let mut entries = BTreeMap::new();
        entries.insert(ConfigKey::from("a"), json!(1));
        let snapshot = ConfigSnapshot {
            version: ConfigVersion(7),
            entries,
        };
        assert_eq!(snapshot.get(&ConfigKey::from("a")), Some(&json!(1)));
        assert_eq!(snapshot.get(&ConfigKey::from("b")), None);
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn task_retryable_builder() {
        let task = Task::new("t-1", json!({"n": 1}));
        assert!(!task.retryable);
        assert!(task.retryable().retryable);
    }
}

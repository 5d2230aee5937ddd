//! Recognized configuration surface for the coordinator itself.
//!
//! Loaded from `<root>/config.yaml`. Every knob has a serde default so a
//! partial (or absent) file is valid. Durations are plain integer fields
//! (`*_ms`) with accessor methods returning [`Duration`].
//!
//! # API pattern
//!
//! - `load_at(path)` — explicit file path; used in tests with `TempDir`
//! - `load()` — derives the file from `default_root()`, delegates to `_at`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Directory name under the home directory holding all runtime state.
pub const ROOT_DIR_NAME: &str = ".foreman";

/// File name of the settings document under the runtime root.
pub const SETTINGS_FILE_NAME: &str = "config.yaml";

/// What the log sink does when its buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureMode {
    /// Block the producer up to the configured write timeout, then drop.
    #[default]
    Block,
    /// Drop immediately and report `Dropped` to the producer.
    Drop,
}

/// How the pool manager picks a worker for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Selection {
    #[default]
    RoundRobin,
    LeastLoaded,
}

/// `pool.*` — worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_pool_floor")]
    pub floor: usize,
    #[serde(default = "default_pool_ceiling")]
    pub ceiling: usize,
    #[serde(default)]
    pub selection: Selection,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            floor: default_pool_floor(),
            ceiling: default_pool_ceiling(),
            selection: Selection::default(),
        }
    }
}

/// `log.*` — sink buffering and backpressure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub backpressure_mode: BackpressureMode,
    /// Upper bound on how long a blocked `write` waits for buffer space.
    #[serde(default = "default_log_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl LogSettings {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            buffer_size: default_log_buffer_size(),
            backpressure_mode: BackpressureMode::default(),
            write_timeout_ms: default_log_write_timeout_ms(),
        }
    }
}

/// `config.*` — store subscription limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Bounded per-subscriber queue; a subscriber that falls further behind
    /// is abandoned and must resubscribe.
    #[serde(default = "default_subscriber_queue_limit")]
    pub subscriber_queue_limit: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            subscriber_queue_limit: default_subscriber_queue_limit(),
        }
    }
}

/// `worker.*` — spawn and termination timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_spawn_timeout_ms")]
    pub spawn_timeout_ms: u64,
    /// Grace period between a termination request and forced kill.
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

impl WorkerSettings {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            spawn_timeout_ms: default_spawn_timeout_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

/// Root settings document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default)]
    pub config: StoreSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
}

impl Settings {
    /// Load settings from an explicit YAML file path.
    ///
    /// A missing file yields `Settings::default()`; a malformed file is an
    /// error, never a silent fallback.
    pub fn load_at(path: &Path) -> Result<Settings, SettingsError> {
        if !path.exists() {
            return Ok(Settings::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| SettingsError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load settings from `<default_root()>/config.yaml`.
    pub fn load() -> Result<Settings, SettingsError> {
        Self::load_at(&default_root()?.join(SETTINGS_FILE_NAME))
    }
}

/// `<home>/.foreman/` — default runtime root.
pub fn default_root() -> Result<PathBuf, SettingsError> {
    dirs::home_dir()
        .map(|home| home.join(ROOT_DIR_NAME))
        .ok_or(SettingsError::HomeNotFound)
}

fn default_pool_floor() -> usize {
    1
}

fn default_pool_ceiling() -> usize {
    4
}

fn default_log_buffer_size() -> usize {
    1024
}

fn default_log_write_timeout_ms() -> u64 {
    1_000
}

fn default_subscriber_queue_limit() -> usize {
    64
}

fn default_spawn_timeout_ms() -> u64 {
    10_000
}

fn default_terminate_grace_ms() -> u64 {
    2_000
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

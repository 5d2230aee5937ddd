//! The template execution environment workers are cloned from.
//!
//! The authority holds one template (base environment, working directory,
//! socket paths for the shared services) and stamps per-worker variables
//! onto it at spawn time. Workers read these back with
//! `std::env::var` during bootstrap.

use std::path::PathBuf;

use foreman_core::types::{ConfigVersion, WorkerId};

/// Worker id assigned by the authority.
pub const ENV_WORKER_ID: &str = "FOREMAN_WORKER_ID";
/// Config version the worker's startup snapshot is pinned at.
pub const ENV_SNAPSHOT_VERSION: &str = "FOREMAN_SNAPSHOT_VERSION";
/// Unix socket of the config store proxy service.
pub const ENV_STORE_SOCKET: &str = "FOREMAN_STORE_SOCKET";
/// Unix socket of the log sink producer service.
pub const ENV_SINK_SOCKET: &str = "FOREMAN_SINK_SOCKET";
/// Unix socket of the task delivery service.
pub const ENV_TASKS_SOCKET: &str = "FOREMAN_TASKS_SOCKET";
/// Path of the worker's pinned snapshot document, written at spawn time.
pub const ENV_SNAPSHOT_PATH: &str = "FOREMAN_SNAPSHOT_PATH";

/// Shared spawn-time state cloned into every worker.
#[derive(Debug, Clone, Default)]
pub struct SpawnTemplate {
    pub base_env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub store_socket: Option<PathBuf>,
    pub sink_socket: Option<PathBuf>,
    pub tasks_socket: Option<PathBuf>,
    /// Where per-worker snapshot documents are written when the authority
    /// holds a store handle.
    pub snapshot_dir: Option<PathBuf>,
}

impl SpawnTemplate {
    /// The full child environment for one worker: base variables first,
    /// then the per-worker stamps (which win on key collisions by coming
    /// last).
    pub fn environment_for(
        &self,
        worker: WorkerId,
        snapshot_version: ConfigVersion,
    ) -> Vec<(String, String)> {
        let mut env = self.base_env.clone();
        env.push((ENV_WORKER_ID.to_string(), worker.0.to_string()));
        env.push((
            ENV_SNAPSHOT_VERSION.to_string(),
            snapshot_version.0.to_string(),
        ));
        if let Some(path) = &self.store_socket {
            env.push((ENV_STORE_SOCKET.to_string(), path.display().to_string()));
        }
        if let Some(path) = &self.sink_socket {
            env.push((ENV_SINK_SOCKET.to_string(), path.display().to_string()));
        }
        if let Some(path) = &self.tasks_socket {
            env.push((ENV_TASKS_SOCKET.to_string(), path.display().to_string()));
        }
        env
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_worker_stamps_are_added_to_the_base() {
        let template = SpawnTemplate {
            base_env: vec![("APP_MODE".to_string(), "batch".to_string())],
            store_socket: Some(PathBuf::from("/run/store.sock")),
            sink_socket: Some(PathBuf::from("/run/sink.sock")),
            tasks_socket: Some(PathBuf::from("/run/tasks.sock")),
            ..SpawnTemplate::default()
        };

        let env = template.environment_for(WorkerId(7), ConfigVersion(42));
        let lookup = |key: &str| {
            env.iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(lookup("APP_MODE"), Some("batch"));
        assert_eq!(lookup(ENV_WORKER_ID), Some("7"));
        assert_eq!(lookup(ENV_SNAPSHOT_VERSION), Some("42"));
        assert_eq!(lookup(ENV_STORE_SOCKET), Some("/run/store.sock"));
        assert_eq!(lookup(ENV_SINK_SOCKET), Some("/run/sink.sock"));
        assert_eq!(lookup(ENV_TASKS_SOCKET), Some("/run/tasks.sock"));
    }

    #[test]
    fn sockets_are_optional() {
        let env = SpawnTemplate::default().environment_for(WorkerId(1), ConfigVersion(0));
        assert!(env.iter().all(|(k, _)| k != ENV_STORE_SOCKET));
        assert!(env.iter().all(|(k, _)| k != ENV_SINK_SOCKET));
    }
}

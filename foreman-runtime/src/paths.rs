//! Runtime filesystem layout, rooted at one directory (default
//! `~/.foreman/`).
//!
//! ```text
//! <root>/
//!   config.yaml        coordinator settings
//!   config.json        persisted config store document
//!   run/
//!     store.sock       config store proxy service
//!     sink.sock        log sink producer service
//!     tasks.sock       task delivery service
//!     control.sock     status/stop control socket
//!     worker-<id>.json pinned snapshot documents
//!   logs/
//!     foreman.log      JSON-lines log export (rotated)
//! ```

use std::path::{Path, PathBuf};

pub const STORE_SOCKET: &str = "store.sock";
pub const SINK_SOCKET: &str = "sink.sock";
pub const TASKS_SOCKET: &str = "tasks.sock";
pub const CONTROL_SOCKET: &str = "control.sock";
pub const LOG_FILE: &str = "foreman.log";
pub const CONFIG_DOCUMENT: &str = "config.json";

pub fn run_dir(root: &Path) -> PathBuf {
    root.join("run")
}

pub fn logs_dir(root: &Path) -> PathBuf {
    root.join("logs")
}

pub fn store_socket_path(root: &Path) -> PathBuf {
    run_dir(root).join(STORE_SOCKET)
}

pub fn sink_socket_path(root: &Path) -> PathBuf {
    run_dir(root).join(SINK_SOCKET)
}

pub fn tasks_socket_path(root: &Path) -> PathBuf {
    run_dir(root).join(TASKS_SOCKET)
}

pub fn control_socket_path(root: &Path) -> PathBuf {
    run_dir(root).join(CONTROL_SOCKET)
}

pub fn log_file_path(root: &Path) -> PathBuf {
    logs_dir(root).join(LOG_FILE)
}

pub fn config_document_path(root: &Path) -> PathBuf {
    root.join(CONFIG_DOCUMENT)
}

pub fn settings_path(root: &Path) -> PathBuf {
    root.join(foreman_core::settings::SETTINGS_FILE_NAME)
}

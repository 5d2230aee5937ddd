//! Error types for foreman-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from loading coordinator settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// Underlying I/O failure (permission denied, etc.).
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error on load — includes file path and line context.
    #[error("failed to parse settings at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None` — cannot locate `~/.foreman/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

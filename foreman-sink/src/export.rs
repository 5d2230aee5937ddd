//! JSON-lines log export with size-based rotation.
//!
//! The export collaborator consumes [`Drain`] output; the sink itself stays
//! format-agnostic. Records append to one file as JSON lines; when the file
//! exceeds the size limit it rotates through numbered backups:
//!   foreman.log → foreman.log.1 → … → foreman.log.<max>

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{io_err, SinkError};
use crate::sink::Drain;

/// Maximum log file size before rotation (10 MiB).
pub const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum number of rotated backup files to keep.
pub const MAX_ROTATED_FILES: usize = 5;

/// Appends drained records to a rotating JSON-lines file.
pub struct JsonLinesExporter {
    path: PathBuf,
    max_bytes: u64,
    max_files: usize,
}

impl JsonLinesExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_bytes: MAX_LOG_BYTES,
            max_files: MAX_ROTATED_FILES,
        }
    }

    /// Override the rotation thresholds.
    #[must_use]
    pub fn with_limits(mut self, max_bytes: u64, max_files: usize) -> Self {
        self.max_bytes = max_bytes;
        self.max_files = max_files;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consume the drain until it ends; returns how many records were
    /// written. Rotation failures are logged and never lose the record.
    pub async fn run(&self, mut drain: Drain) -> Result<u64, SinkError> {
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
            }
        }

        let mut written = 0u64;
        while let Some(record) = drain.next().await {
            match rotate_if_needed(&self.path, self.max_bytes, self.max_files) {
                Ok(true) => tracing::info!(path = %self.path.display(), "log file rotated"),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), error = %err, "log rotation failed")
                }
            }

            let line = serde_json::to_string(&record)?;
            self.append_line(&line)?;
            written += 1;
        }
        Ok(written)
    }

    fn append_line(&self, line: &str) -> Result<(), SinkError> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err(&self.path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .map_err(|e| io_err(&self.path, e))
    }
}

/// Rotate `log_path` if its size exceeds `max_bytes`.
///
/// Rotation sequence (oldest first):
///   `<name>.<max_files>` deleted
///   `<name>.<n>` → `<name>.<n+1>` for n = max_files-1 … 1
///   `<name>` → `<name>.1`
///
/// Returns `true` if rotation occurred, `false` if the file was under the
/// threshold (or did not exist yet).
pub fn rotate_if_needed(log_path: &Path, max_bytes: u64, max_files: usize) -> io::Result<bool> {
    let size = match fs::metadata(log_path) {
        Ok(meta) => meta.len(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };

    if size < max_bytes {
        return Ok(false);
    }

    // Remove the oldest file so we don't exceed max_files.
    let oldest = numbered_path(log_path, max_files);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }

    // Shift existing rotated files up by one.
    for n in (1..max_files).rev() {
        let src = numbered_path(log_path, n);
        let dst = numbered_path(log_path, n + 1);
        if src.exists() {
            fs::rename(&src, &dst)?;
        }
    }

    // Rename live log → .1; the next append re-creates the live file.
    fs::rename(log_path, numbered_path(log_path, 1))?;
    Ok(true)
}

/// Build the path for the `n`-th rotated copy of `base` (e.g. `foreman.log.2`).
fn numbered_path(base: &Path, n: usize) -> PathBuf {
    let name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("foreman.log");
    base.with_file_name(format!("{name}.{n}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

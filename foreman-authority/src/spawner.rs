//! The spawn capability: OS-level process creation behind a trait.
//!
//! The authority *calls* this capability, it never implements process
//! mechanics itself. [`LocalSpawner`] is the default implementation on top
//! of `tokio::process`; tests substitute their own [`Spawner`].

use std::path::PathBuf;

use foreman_core::types::EntryPoint;

use crate::error::SpawnError;

/// Everything the capability needs to create one worker process.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub entry_point: EntryPoint,
    /// Full child environment, already templated per worker.
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub success: bool,
    /// Exit code; `None` when the process died to a signal.
    pub code: Option<i32>,
}

/// A live worker process, owned by the authority.
pub trait ProcessHandle: Send + Sync + std::fmt::Debug {
    /// OS pid, while known.
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check; `Ok(None)` while still running.
    fn try_wait(&mut self) -> Result<Option<ExitOutcome>, SpawnError>;

    /// Ask the process to shut down (SIGTERM). Best-effort.
    fn signal_terminate(&mut self);

    /// Forced, immediate, non-cancelable kill (SIGKILL). Best-effort.
    fn kill(&mut self);
}

/// The process-creation capability.
pub trait Spawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ProcessHandle>, SpawnError>;
}

/// Spawns real OS processes with `tokio::process`.
pub struct LocalSpawner;

impl Spawner for LocalSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        if request.entry_point.program.is_empty() {
            return Err(SpawnError::InvalidEntryPoint("program is empty".into()));
        }

        let mut command = tokio::process::Command::new(&request.entry_point.program);
        command.args(&request.entry_point.args);
        command.env_clear();
        for (key, value) in &request.env {
            command.env(key, value);
        }
        if let Some(cwd) = &request.cwd {
            command.current_dir(cwd);
        }
        // If the authority dies, its workers must not outlive it.
        command.kill_on_drop(true);

        let child = command.spawn()?;
        tracing::debug!(
            program = %request.entry_point.program,
            pid = child.id(),
            "spawned worker process",
        );
        Ok(Box::new(LocalProcessHandle { child }))
    }
}

#[derive(Debug)]
struct LocalProcessHandle {
    child: tokio::process::Child,
}

impl ProcessHandle for LocalProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<ExitOutcome>, SpawnError> {
        let status = self.child.try_wait()?;
        Ok(status.map(|status| ExitOutcome {
            success: status.success(),
            code: status.code(),
        }))
    }

    fn signal_terminate(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        // SAFETY: plain kill(2) on a pid we own; no memory is touched.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            tracing::warn!(pid, "SIGTERM delivery failed");
        }
    }

    fn kill(&mut self) {
        if let Err(err) = self.child.start_kill() {
            tracing::warn!(pid = self.child.id(), error = %err, "SIGKILL delivery failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! The worker authority ("forkserver") actor.
//!
//! Exactly one authority exists per deployment; it is the only component
//! allowed to create or terminate worker processes. Serializing every spawn
//! through this actor's queue removes the races of concurrent OS-level
//! process creation against shared pre-spawn state. Everyone else,
//! including the pool manager, holds an [`AuthorityHandle`] and can only
//! *request* transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use foreman_core::settings::WorkerSettings;
use foreman_core::types::{
    ConfigSnapshot, ConfigVersion, EntryPoint, Task, WorkerDescriptor, WorkerId, WorkerState,
};
use foreman_store::StoreHandle;

use crate::error::{AuthorityError, SpawnError};
use crate::spawner::{ExitOutcome, ProcessHandle, SpawnRequest, Spawner};
use crate::template::{SpawnTemplate, ENV_SNAPSHOT_PATH};

/// Exit polling and grace-deadline granularity.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Command queue depth between handles and the actor.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Authority timing knobs.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// Upper bound on one spawn capability call.
    pub spawn_timeout: Duration,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self::from(&WorkerSettings::default())
    }
}

impl From<&WorkerSettings> for AuthorityConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            spawn_timeout: settings.spawn_timeout(),
        }
    }
}

enum Command {
    Spawn {
        entry_point: EntryPoint,
        snapshot_version: ConfigVersion,
        respond_to: oneshot::Sender<Result<WorkerDescriptor, AuthorityError>>,
    },
    Terminate {
        id: WorkerId,
        grace: Duration,
        respond_to: oneshot::Sender<Result<WorkerDescriptor, AuthorityError>>,
    },
    Reap {
        respond_to: oneshot::Sender<Vec<WorkerDescriptor>>,
    },
    Describe {
        id: WorkerId,
        respond_to: oneshot::Sender<Option<WorkerDescriptor>>,
    },
    List {
        respond_to: oneshot::Sender<Vec<WorkerDescriptor>>,
    },
    AssignTask {
        id: WorkerId,
        task: Option<Task>,
        respond_to: oneshot::Sender<Result<(), AuthorityError>>,
    },
}

/// Request-only proxy to the authority actor.
#[derive(Clone)]
pub struct AuthorityHandle {
    tx: mpsc::Sender<Command>,
}

impl AuthorityHandle {
    /// Request a new worker cloned from the template, pinned at
    /// `snapshot_version`.
    pub async fn spawn(
        &self,
        entry_point: EntryPoint,
        snapshot_version: ConfigVersion,
    ) -> Result<WorkerDescriptor, AuthorityError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Spawn {
            entry_point,
            snapshot_version,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| AuthorityError::ChannelClosed("spawn reply"))?
    }

    /// Request graceful shutdown, escalating to forced kill after `grace`
    /// with no exit. Idempotent on already-terminal workers.
    pub async fn terminate(
        &self,
        id: WorkerId,
        grace: Duration,
    ) -> Result<WorkerDescriptor, AuthorityError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Terminate {
            id,
            grace,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| AuthorityError::ChannelClosed("terminate reply"))?
    }

    /// Descriptors that turned `Terminated` or `Crashed` since the last
    /// call. Each terminal transition is reported exactly once.
    pub async fn reap(&self) -> Result<Vec<WorkerDescriptor>, AuthorityError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Reap { respond_to: tx }).await?;
        rx.await
            .map_err(|_| AuthorityError::ChannelClosed("reap reply"))
    }

    /// Current descriptor for one worker.
    pub async fn describe(&self, id: WorkerId) -> Result<Option<WorkerDescriptor>, AuthorityError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Describe { id, respond_to: tx }).await?;
        rx.await
            .map_err(|_| AuthorityError::ChannelClosed("describe reply"))
    }

    /// All descriptors the authority has ever handed out and still tracks.
    pub async fn list(&self) -> Result<Vec<WorkerDescriptor>, AuthorityError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::List { respond_to: tx }).await?;
        rx.await
            .map_err(|_| AuthorityError::ChannelClosed("list reply"))
    }

    /// Record (or clear, with `None`) the task a worker is holding, so a
    /// crash report carries it.
    pub async fn assign_task(
        &self,
        id: WorkerId,
        task: Option<Task>,
    ) -> Result<(), AuthorityError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::AssignTask {
            id,
            task,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| AuthorityError::ChannelClosed("assign reply"))?
    }

    async fn send(&self, command: Command) -> Result<(), AuthorityError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| AuthorityError::ChannelClosed("authority commands"))
    }
}

struct WorkerEntry {
    descriptor: WorkerDescriptor,
    handle: Option<Box<dyn ProcessHandle>>,
    termination_requested: bool,
    kill_deadline: Option<Instant>,
}

/// The single process-creation authority.
pub struct WorkerAuthority {
    config: AuthorityConfig,
    template: SpawnTemplate,
    spawner: Arc<dyn Spawner>,
    /// When attached, each spawn captures and pins a config snapshot.
    store: Option<StoreHandle>,
    next_id: u64,
    workers: HashMap<WorkerId, WorkerEntry>,
    newly_terminal: Vec<WorkerId>,
}

impl WorkerAuthority {
    /// Spawn the authority actor and return its handle and join handle.
    pub fn spawn(
        config: AuthorityConfig,
        template: SpawnTemplate,
        spawner: Arc<dyn Spawner>,
        store: Option<StoreHandle>,
    ) -> (AuthorityHandle, JoinHandle<()>) {
        let mut actor = WorkerAuthority {
            config,
            template,
            spawner,
            store,
            next_id: 1,
            workers: HashMap::new(),
            newly_terminal: Vec::new(),
        };

        let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let join = tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    command = rx.recv() => {
                        let Some(command) = command else { break };
                        actor.handle(command).await;
                    }
                    _ = interval.tick() => actor.poll_workers(),
                }
            }
            tracing::debug!("worker authority actor stopped");
        });

        (AuthorityHandle { tx }, join)
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Spawn {
                entry_point,
                snapshot_version,
                respond_to,
            } => {
                let result = self.handle_spawn(entry_point, snapshot_version).await;
                let _ = respond_to.send(result);
            }
            Command::Terminate {
                id,
                grace,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_terminate(id, grace));
            }
            Command::Reap { respond_to } => {
                let ids: Vec<WorkerId> = self.newly_terminal.drain(..).collect();
                let reaped: Vec<WorkerDescriptor> = ids
                    .iter()
                    .filter_map(|id| self.workers.get(id).map(|e| e.descriptor.clone()))
                    .collect();
                let _ = respond_to.send(reaped);
            }
            Command::Describe { id, respond_to } => {
                let _ = respond_to.send(self.workers.get(&id).map(|e| e.descriptor.clone()));
            }
            Command::List { respond_to } => {
                let mut descriptors: Vec<WorkerDescriptor> =
                    self.workers.values().map(|e| e.descriptor.clone()).collect();
                descriptors.sort_by_key(|d| d.id);
                let _ = respond_to.send(descriptors);
            }
            Command::AssignTask {
                id,
                task,
                respond_to,
            } => {
                let result = match self.workers.get_mut(&id) {
                    Some(entry) => {
                        entry.descriptor.last_task = task;
                        Ok(())
                    }
                    None => Err(AuthorityError::UnknownWorker(id)),
                };
                let _ = respond_to.send(result);
            }
        }
    }

    async fn handle_spawn(
        &mut self,
        entry_point: EntryPoint,
        snapshot_version: ConfigVersion,
    ) -> Result<WorkerDescriptor, AuthorityError> {
        if entry_point.program.is_empty() {
            return Err(SpawnError::InvalidEntryPoint("program is empty".into()).into());
        }

        // Ids advance even for failed spawns, so an id can never be reused.
        let id = WorkerId(self.next_id);
        self.next_id += 1;

        // Clone the template environment. With a store attached the
        // requested version is a floor: the snapshot captured here is what
        // the worker actually pins, and it is written before the process
        // exists so the worker can never observe later writes.
        let mut pinned_version = snapshot_version;
        let mut snapshot_env = None;
        if let Some(store) = &self.store {
            let snapshot = store
                .snapshot()
                .await
                .map_err(|e| SpawnError::Environment(format!("snapshot capture failed: {e}")))?;
            pinned_version = snapshot.version;
            if let Some(dir) = &self.template.snapshot_dir {
                let path = dir.join(format!("worker-{}.json", id.0));
                write_snapshot(&path, &snapshot)
                    .map_err(|e| SpawnError::Environment(e.to_string()))?;
                snapshot_env = Some((ENV_SNAPSHOT_PATH.to_string(), path.display().to_string()));
            }
        }

        let mut env = self.template.environment_for(id, pinned_version);
        env.extend(snapshot_env);

        let request = SpawnRequest {
            entry_point: entry_point.clone(),
            env,
            cwd: self.template.cwd.clone(),
        };

        tracing::info!(worker = %id, version = %pinned_version, program = %entry_point.program, "spawning worker");
        let handle = self.call_spawner(request).await?;

        let descriptor = WorkerDescriptor {
            id,
            entry_point,
            snapshot_version: pinned_version,
            state: WorkerState::Running,
            pid: handle.pid(),
            spawned_at: Utc::now(),
            last_task: None,
        };
        self.workers.insert(
            id,
            WorkerEntry {
                descriptor: descriptor.clone(),
                handle: Some(handle),
                termination_requested: false,
                kill_deadline: None,
            },
        );
        Ok(descriptor)
    }

    /// Invoke the spawn capability off the actor thread, bounded by the
    /// spawn timeout. A capability that finishes after the deadline has its
    /// stray handle dropped; `kill_on_drop` reaps the orphan process.
    async fn call_spawner(
        &self,
        request: SpawnRequest,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        let spawner = Arc::clone(&self.spawner);
        let timeout = self.config.spawn_timeout;
        let join = tokio::task::spawn_blocking(move || spawner.spawn(&request));
        match tokio::time::timeout(timeout, join).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(SpawnError::Capability(format!(
                "spawn task join failure: {join_err}"
            ))),
            Err(_elapsed) => Err(SpawnError::TimedOut(timeout)),
        }
    }

    fn handle_terminate(
        &mut self,
        id: WorkerId,
        grace: Duration,
    ) -> Result<WorkerDescriptor, AuthorityError> {
        let entry = self
            .workers
            .get_mut(&id)
            .ok_or(AuthorityError::UnknownWorker(id))?;

        // Second terminate on a terminal worker: same state, no error.
        if entry.descriptor.state.is_terminal() {
            return Ok(entry.descriptor.clone());
        }

        if entry.descriptor.state != WorkerState::Terminating {
            entry.descriptor.state = WorkerState::Terminating;
            entry.termination_requested = true;
            if let Some(handle) = entry.handle.as_mut() {
                if grace.is_zero() {
                    handle.kill();
                } else {
                    handle.signal_terminate();
                    entry.kill_deadline = Some(Instant::now() + grace);
                }
            }
            tracing::info!(worker = %id, grace_ms = grace.as_millis() as u64, "termination requested");
        }
        Ok(entry.descriptor.clone())
    }

    /// Check every live worker for exit, and enforce grace deadlines.
    fn poll_workers(&mut self) {
        let now = Instant::now();
        let mut exited = Vec::new();

        for (id, entry) in self.workers.iter_mut() {
            if entry.descriptor.state.is_terminal() {
                continue;
            }
            let Some(handle) = entry.handle.as_mut() else {
                continue;
            };
            match handle.try_wait() {
                Ok(Some(outcome)) => exited.push((*id, outcome)),
                Ok(None) => {
                    if let Some(deadline) = entry.kill_deadline {
                        if now >= deadline {
                            tracing::warn!(worker = %id, "grace elapsed without exit; forcing kill");
                            handle.kill();
                            entry.kill_deadline = None;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(worker = %id, error = %err, "exit poll failed");
                }
            }
        }

        for (id, outcome) in exited {
            self.mark_exited(id, outcome);
        }
    }

    /// A worker that exits without a termination request is `Crashed`,
    /// never silently removed; its last-known task rides on the descriptor.
    fn mark_exited(&mut self, id: WorkerId, outcome: ExitOutcome) {
        let Some(entry) = self.workers.get_mut(&id) else {
            return;
        };
        entry.handle = None;
        entry.kill_deadline = None;
        entry.descriptor.state = if entry.termination_requested {
            WorkerState::Terminated
        } else {
            WorkerState::Crashed
        };
        self.newly_terminal.push(id);

        match entry.descriptor.state {
            WorkerState::Terminated => {
                tracing::info!(worker = %id, code = ?outcome.code, "worker terminated");
            }
            _ => {
                tracing::warn!(
                    worker = %id,
                    code = ?outcome.code,
                    task = ?entry.descriptor.last_task.as_ref().map(|t| t.id.clone()),
                    "worker crashed",
                );
            }
        }
    }
}

/// Atomic write of a worker's pinned snapshot document.
fn write_snapshot(path: &std::path::Path, snapshot: &ConfigSnapshot) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| std::io::Error::other(format!("snapshot encode failed: {e}")))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

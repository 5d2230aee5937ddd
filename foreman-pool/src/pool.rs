//! The worker pool manager actor.
//!
//! The pool observes worker lifecycle through [`AuthorityHandle::reap`] and
//! requests transitions; it never performs them. Task delivery is pure
//! message passing: every assignment leaves the pool on one outbound
//! channel, and the embedder reports completions back through the handle.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use foreman_authority::AuthorityHandle;
use foreman_core::settings::{PoolSettings, Selection, WorkerSettings};
use foreman_core::types::{ConfigVersion, EntryPoint, Task, TaskId, WorkerId, WorkerState};

use crate::error::PoolError;

/// Command queue depth between handles and the actor.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Outbound assignment queue depth.
const ASSIGNMENT_QUEUE_DEPTH: usize = 64;

/// Pool sizing, selection, and timing knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub floor: usize,
    pub ceiling: usize,
    pub selection: Selection,
    /// Concurrent tasks one worker may hold.
    pub worker_capacity: usize,
    /// What spawned workers run.
    pub entry_point: EntryPoint,
    /// Grace passed to the authority on pool-initiated terminations.
    pub terminate_grace: Duration,
    /// How often the pool polls `reap` and re-checks the floor/ceiling.
    pub reap_interval: Duration,
    /// Pause after a failed spawn before the next attempt.
    pub spawn_backoff: Duration,
}

impl PoolConfig {
    pub fn new(entry_point: EntryPoint) -> Self {
        Self::from_settings(&PoolSettings::default(), &WorkerSettings::default(), entry_point)
    }

    pub fn from_settings(
        pool: &PoolSettings,
        worker: &WorkerSettings,
        entry_point: EntryPoint,
    ) -> Self {
        Self {
            floor: pool.floor,
            ceiling: pool.ceiling,
            selection: pool.selection,
            worker_capacity: 1,
            entry_point,
            terminate_grace: worker.terminate_grace(),
            reap_interval: Duration::from_millis(50),
            spawn_backoff: Duration::from_millis(500),
        }
    }
}

/// One task routed to one worker; consumed by the embedder, which owns the
/// actual worker connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAssignment {
    pub worker: WorkerId,
    pub task: Task,
}

/// Where a dispatched task went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Assigned(WorkerId),
    Queued,
}

/// Aggregate pool health: counts, not per-error detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolHealth {
    pub running: usize,
    pub queued_tasks: usize,
    pub in_flight: usize,
    pub crashed_total: u64,
    /// Non-retryable tasks lost to crashes.
    pub lost_tasks: u64,
}

enum Command {
    Dispatch {
        task: Task,
        respond_to: oneshot::Sender<Result<DispatchOutcome, PoolError>>,
    },
    Complete {
        worker: WorkerId,
        task_id: TaskId,
        respond_to: oneshot::Sender<Result<(), PoolError>>,
    },
    Health {
        respond_to: oneshot::Sender<PoolHealth>,
    },
}

/// Cloneable proxy to the pool actor.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<Command>,
}

impl PoolHandle {
    /// Hand a task to an available Running worker, or queue it.
    pub async fn dispatch(&self, task: Task) -> Result<DispatchOutcome, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Dispatch {
            task,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| PoolError::ChannelClosed("dispatch reply"))?
    }

    /// Report that `worker` finished `task_id`, freeing its capacity.
    pub async fn complete(&self, worker: WorkerId, task_id: TaskId) -> Result<(), PoolError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Complete {
            worker,
            task_id,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|_| PoolError::ChannelClosed("complete reply"))?
    }

    /// Aggregate health counts.
    pub async fn health(&self) -> Result<PoolHealth, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Health { respond_to: tx }).await?;
        rx.await
            .map_err(|_| PoolError::ChannelClosed("health reply"))
    }

    async fn send(&self, command: Command) -> Result<(), PoolError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| PoolError::ChannelClosed("pool commands"))
    }
}

struct PoolWorker {
    state: WorkerState,
    in_flight: Vec<Task>,
}

/// The pool manager actor.
pub struct PoolManager {
    config: PoolConfig,
    authority: AuthorityHandle,
    /// Current store version for pinning new workers' snapshots.
    version_rx: watch::Receiver<ConfigVersion>,
    workers: BTreeMap<WorkerId, PoolWorker>,
    queue: VecDeque<Task>,
    assignments_tx: mpsc::Sender<TaskAssignment>,
    rr_cursor: u64,
    crashed_total: u64,
    lost_tasks: u64,
    spawn_retry_after: Option<Instant>,
}

impl PoolManager {
    /// Spawn the pool actor. Returns the handle, the stream of task
    /// assignments for the embedder to deliver, and the join handle.
    ///
    /// The floor is filled before the first command is served.
    pub fn spawn(
        config: PoolConfig,
        authority: AuthorityHandle,
        version_rx: watch::Receiver<ConfigVersion>,
    ) -> (PoolHandle, mpsc::Receiver<TaskAssignment>, JoinHandle<()>) {
        let (assignments_tx, assignments_rx) = mpsc::channel(ASSIGNMENT_QUEUE_DEPTH);
        let reap_interval = config.reap_interval;

        let mut actor = PoolManager {
            config,
            authority,
            version_rx,
            workers: BTreeMap::new(),
            queue: VecDeque::new(),
            assignments_tx,
            rr_cursor: 0,
            crashed_total: 0,
            lost_tasks: 0,
            spawn_retry_after: None,
        };

        let (tx, mut rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let join = tokio::spawn(async move {
            actor.maintain().await;

            let mut interval = tokio::time::interval(reap_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    command = rx.recv() => {
                        let Some(command) = command else { break };
                        actor.handle(command).await;
                    }
                    _ = interval.tick() => {
                        actor.observe_reaped().await;
                        actor.maintain().await;
                    }
                }
            }
            tracing::debug!("pool manager actor stopped");
        });

        (PoolHandle { tx }, assignments_rx, join)
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Dispatch { task, respond_to } => {
                let result = self.dispatch(task).await;
                let _ = respond_to.send(result);
            }
            Command::Complete {
                worker,
                task_id,
                respond_to,
            } => {
                let result = self.complete(worker, task_id).await;
                let _ = respond_to.send(result);
            }
            Command::Health { respond_to } => {
                let _ = respond_to.send(self.health());
            }
        }
    }

    fn health(&self) -> PoolHealth {
        PoolHealth {
            running: self
                .workers
                .values()
                .filter(|w| w.state == WorkerState::Running)
                .count(),
            queued_tasks: self.queue.len(),
            in_flight: self.workers.values().map(|w| w.in_flight.len()).sum(),
            crashed_total: self.crashed_total,
            lost_tasks: self.lost_tasks,
        }
    }

    async fn dispatch(&mut self, task: Task) -> Result<DispatchOutcome, PoolError> {
        match self.select_worker() {
            Some(worker) => {
                self.assign(worker, task).await?;
                Ok(DispatchOutcome::Assigned(worker))
            }
            None => {
                tracing::debug!(task = %task.id, "no available worker; queueing");
                self.queue.push_back(task);
                Ok(DispatchOutcome::Queued)
            }
        }
    }

    async fn complete(&mut self, worker: WorkerId, task_id: TaskId) -> Result<(), PoolError> {
        let entry = self
            .workers
            .get_mut(&worker)
            .ok_or(PoolError::UnknownWorker(worker))?;
        let position = entry
            .in_flight
            .iter()
            .position(|t| t.id == task_id)
            .ok_or_else(|| PoolError::UnknownTask {
                worker,
                task: task_id.clone(),
            })?;
        entry.in_flight.remove(position);

        let remaining = entry.in_flight.last().cloned();
        self.authority.assign_task(worker, remaining).await?;

        tracing::debug!(worker = %worker, task = %task_id, "task completed");
        self.drain_queue().await;
        Ok(())
    }

    /// Deliver one task to one worker and record it everywhere that needs
    /// to know.
    async fn assign(&mut self, worker: WorkerId, task: Task) -> Result<(), PoolError> {
        self.assignments_tx
            .send(TaskAssignment {
                worker,
                task: task.clone(),
            })
            .await
            .map_err(|_| PoolError::ChannelClosed("assignments"))?;

        self.authority.assign_task(worker, Some(task.clone())).await?;
        if let Some(entry) = self.workers.get_mut(&worker) {
            entry.in_flight.push(task);
        }
        Ok(())
    }

    /// Pick an available Running worker per the configured selection.
    fn select_worker(&mut self) -> Option<WorkerId> {
        let capacity = self.config.worker_capacity;
        let available =
            |w: &PoolWorker| w.state == WorkerState::Running && w.in_flight.len() < capacity;

        match self.config.selection {
            Selection::RoundRobin => {
                // First candidate strictly after the cursor, wrapping.
                let after = self
                    .workers
                    .iter()
                    .find(|(id, w)| id.0 > self.rr_cursor && available(w))
                    .map(|(id, _)| *id);
                let chosen = after.or_else(|| {
                    self.workers
                        .iter()
                        .find(|(_, w)| available(w))
                        .map(|(id, _)| *id)
                });
                if let Some(id) = chosen {
                    self.rr_cursor = id.0;
                }
                chosen
            }
            Selection::LeastLoaded => self
                .workers
                .iter()
                .filter(|(_, w)| available(w))
                .min_by_key(|(id, w)| (w.in_flight.len(), id.0))
                .map(|(id, _)| *id),
        }
    }

    /// Move queued tasks onto any workers that freed up.
    async fn drain_queue(&mut self) {
        while !self.queue.is_empty() {
            let Some(worker) = self.select_worker() else {
                break;
            };
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            if let Err(err) = self.assign(worker, task).await {
                tracing::warn!(worker = %worker, error = %err, "queued assignment failed");
                break;
            }
        }
    }

    /// React to workers that turned terminal since the last poll.
    async fn observe_reaped(&mut self) {
        let reaped = match self.authority.reap().await {
            Ok(reaped) => reaped,
            Err(err) => {
                tracing::warn!(error = %err, "reap failed");
                return;
            }
        };

        for descriptor in reaped {
            match descriptor.state {
                WorkerState::Crashed => self.on_worker_crashed(descriptor.id).await,
                WorkerState::Terminated => {
                    self.workers.remove(&descriptor.id);
                }
                _ => {}
            }
        }
    }

    /// Crash policy: requeue the crashed worker's in-flight tasks when they
    /// are idempotent, count them lost otherwise; the next `maintain` pass
    /// requests the replacement spawn.
    async fn on_worker_crashed(&mut self, id: WorkerId) {
        self.crashed_total += 1;
        let Some(entry) = self.workers.remove(&id) else {
            return;
        };

        for task in entry.in_flight.into_iter().rev() {
            if task.retryable {
                tracing::info!(worker = %id, task = %task.id, "requeueing task from crashed worker");
                self.queue.push_front(task);
            } else {
                tracing::warn!(worker = %id, task = %task.id, "non-retryable task lost in crash");
                self.lost_tasks += 1;
            }
        }
    }

    /// Keep the live worker count between floor and ceiling.
    async fn maintain(&mut self) {
        let live = self
            .workers
            .values()
            .filter(|w| !w.state.is_terminal() && w.state != WorkerState::Terminating)
            .count();

        // The floor can never push the pool past the ceiling.
        let target = self.config.floor.min(self.config.ceiling);
        if live < target {
            if let Some(retry_after) = self.spawn_retry_after {
                if Instant::now() < retry_after {
                    return;
                }
                self.spawn_retry_after = None;
            }

            let wanted = target - live;
            for _ in 0..wanted {
                let version = *self.version_rx.borrow();
                match self
                    .authority
                    .spawn(self.config.entry_point.clone(), version)
                    .await
                {
                    Ok(descriptor) => {
                        tracing::info!(worker = %descriptor.id, version = %version, "pool spawned worker");
                        self.workers.insert(
                            descriptor.id,
                            PoolWorker {
                                state: WorkerState::Running,
                                in_flight: Vec::new(),
                            },
                        );
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, backoff_ms = self.config.spawn_backoff.as_millis() as u64, "spawn request failed; backing off");
                        self.spawn_retry_after = Some(Instant::now() + self.config.spawn_backoff);
                        break;
                    }
                }
            }
            self.drain_queue().await;
        } else if live > self.config.ceiling {
            let excess = live - self.config.ceiling;
            let idle: Vec<WorkerId> = self
                .workers
                .iter()
                .filter(|(_, w)| w.state == WorkerState::Running && w.in_flight.is_empty())
                .map(|(id, _)| *id)
                .take(excess)
                .collect();
            for id in idle {
                tracing::info!(worker = %id, "pool above ceiling; requesting termination");
                match self
                    .authority
                    .terminate(id, self.config.terminate_grace)
                    .await
                {
                    Ok(_) => {
                        if let Some(entry) = self.workers.get_mut(&id) {
                            entry.state = WorkerState::Terminating;
                        }
                    }
                    Err(err) => tracing::warn!(worker = %id, error = %err, "termination request failed"),
                }
            }
        }
    }
}

//! Task delivery gateway: pull-based hand-off of pool assignments to
//! worker processes.
//!
//! The pool emits [`TaskAssignment`]s addressed to a worker id; workers
//! long-poll the tasks socket for their next assignment and report
//! completions back. The gateway actor owns the per-worker pending queues;
//! connection handlers talk to it over channels only.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::{broadcast, mpsc, oneshot};

use foreman_core::types::{Task, TaskId, WorkerId};
use foreman_pool::TaskAssignment;
use foreman_transport::{Endpoint, TransportError};

use crate::error::RuntimeError;

/// Worker-to-gateway messages on the tasks socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskRequest {
    /// Long-poll for the next assignment addressed to `worker`.
    Next { worker: WorkerId },
    /// Report that `worker` finished `task`.
    Complete { worker: WorkerId, task: TaskId },
}

/// Gateway-to-worker messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum TaskReply {
    Assigned { task: Task },
    Ack,
    Error { message: String },
}

/// A completion relayed from a worker connection toward the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionReport {
    pub worker: WorkerId,
    pub task: TaskId,
}

/// Requests from connection handlers to the gateway actor.
pub enum GatewayMsg {
    Poll {
        worker: WorkerId,
        respond_to: oneshot::Sender<Task>,
    },
    /// A handed-out task whose worker connection died before delivery.
    Requeue { worker: WorkerId, task: Task },
}

/// The gateway actor: routes assignments to per-worker queues and answers
/// long-polls.
pub async fn gateway_task(
    mut assignments_rx: mpsc::Receiver<TaskAssignment>,
    mut requests_rx: mpsc::Receiver<GatewayMsg>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), RuntimeError> {
    let mut pending: HashMap<WorkerId, VecDeque<Task>> = HashMap::new();
    let mut waiters: HashMap<WorkerId, VecDeque<oneshot::Sender<Task>>> = HashMap::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            assignment = assignments_rx.recv() => {
                let Some(TaskAssignment { worker, task }) = assignment else { break };
                deliver(&mut pending, &mut waiters, worker, task);
            }
            request = requests_rx.recv() => {
                let Some(request) = request else { break };
                match request {
                    GatewayMsg::Poll { worker, respond_to } => {
                        match pending.get_mut(&worker).and_then(VecDeque::pop_front) {
                            Some(task) => {
                                if let Err(task) = respond_to.send(task) {
                                    pending.entry(worker).or_default().push_front(task);
                                }
                            }
                            None => waiters.entry(worker).or_default().push_back(respond_to),
                        }
                    }
                    GatewayMsg::Requeue { worker, task } => {
                        tracing::warn!(worker = %worker, task = %task.id, "delivery failed; requeueing assignment");
                        deliver(&mut pending, &mut waiters, worker, task);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Hand a task to a live waiter if one exists, otherwise queue it.
fn deliver(
    pending: &mut HashMap<WorkerId, VecDeque<Task>>,
    waiters: &mut HashMap<WorkerId, VecDeque<oneshot::Sender<Task>>>,
    worker: WorkerId,
    mut task: Task,
) {
    if let Some(queue) = waiters.get_mut(&worker) {
        while let Some(waiter) = queue.pop_front() {
            match waiter.send(task) {
                Ok(()) => return,
                // Waiter's connection is gone; try the next one.
                Err(returned) => task = returned,
            }
        }
    }
    pending.entry(worker).or_default().push_back(task);
}

/// Serve one worker connection on the tasks socket.
pub async fn serve_task_connection(
    mut endpoint: Endpoint,
    gateway_tx: mpsc::Sender<GatewayMsg>,
    completions_tx: mpsc::Sender<CompletionReport>,
) -> Result<(), RuntimeError> {
    loop {
        let request: TaskRequest = match endpoint.recv_wait().await {
            Ok(request) => request,
            Err(TransportError::Closed) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        match request {
            TaskRequest::Next { worker } => {
                let (tx, rx) = oneshot::channel();
                gateway_tx
                    .send(GatewayMsg::Poll {
                        worker,
                        respond_to: tx,
                    })
                    .await
                    .map_err(|_| RuntimeError::ChannelClosed("gateway requests"))?;
                let task = rx
                    .await
                    .map_err(|_| RuntimeError::ChannelClosed("gateway poll reply"))?;

                if let Err(err) = endpoint
                    .send(&TaskReply::Assigned { task: task.clone() })
                    .await
                {
                    // Delivery failed; the assignment goes back to the
                    // gateway, not into the void.
                    let _ = gateway_tx.send(GatewayMsg::Requeue { worker, task }).await;
                    return match err {
                        TransportError::Closed => Ok(()),
                        err => Err(err.into()),
                    };
                }
            }
            TaskRequest::Complete { worker, task } => {
                completions_tx
                    .send(CompletionReport { worker, task })
                    .await
                    .map_err(|_| RuntimeError::ChannelClosed("completions"))?;
                match endpoint.send(&TaskReply::Ack).await {
                    Ok(()) => {}
                    Err(TransportError::Closed) => return Ok(()),
                    Err(err) => return Err(err.into()),
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn task(n: usize) -> Task {
        Task::new(format!("t-{n}"), json!({ "n": n }))
    }

    struct Fixture {
        assignments_tx: mpsc::Sender<TaskAssignment>,
        gateway_tx: mpsc::Sender<GatewayMsg>,
        completions_rx: mpsc::Receiver<CompletionReport>,
        completions_tx: mpsc::Sender<CompletionReport>,
        _shutdown_tx: broadcast::Sender<()>,
    }

    fn start_gateway() -> Fixture {
        let (assignments_tx, assignments_rx) = mpsc::channel(8);
        let (gateway_tx, gateway_rx) = mpsc::channel(8);
        let (completions_tx, completions_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(gateway_task(assignments_rx, gateway_rx, shutdown_rx));
        Fixture {
            assignments_tx,
            gateway_tx,
            completions_rx,
            completions_tx,
            _shutdown_tx: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn pending_assignment_answers_a_later_poll() {
        let fixture = start_gateway();
        fixture
            .assignments_tx
            .send(TaskAssignment {
                worker: WorkerId(1),
                task: task(0),
            })
            .await
            .expect("send assignment");

        let (tx, rx) = oneshot::channel();
        fixture
            .gateway_tx
            .send(GatewayMsg::Poll {
                worker: WorkerId(1),
                respond_to: tx,
            })
            .await
            .expect("poll");
        assert_eq!(rx.await.expect("task"), task(0));
    }

    #[tokio::test]
    async fn waiting_poll_is_answered_by_a_later_assignment() {
        let fixture = start_gateway();

        let (tx, rx) = oneshot::channel();
        fixture
            .gateway_tx
            .send(GatewayMsg::Poll {
                worker: WorkerId(2),
                respond_to: tx,
            })
            .await
            .expect("poll");

        fixture
            .assignments_tx
            .send(TaskAssignment {
                worker: WorkerId(2),
                task: task(5),
            })
            .await
            .expect("send assignment");
        assert_eq!(rx.await.expect("task"), task(5));
    }

    #[tokio::test]
    async fn assignments_are_routed_per_worker() {
        let fixture = start_gateway();
        for (worker, n) in [(1u64, 0usize), (2, 1), (1, 2)] {
            fixture
                .assignments_tx
                .send(TaskAssignment {
                    worker: WorkerId(worker),
                    task: task(n),
                })
                .await
                .expect("send");
        }

        let poll = |worker: u64| {
            let gateway_tx = fixture.gateway_tx.clone();
            async move {
                let (tx, rx) = oneshot::channel();
                gateway_tx
                    .send(GatewayMsg::Poll {
                        worker: WorkerId(worker),
                        respond_to: tx,
                    })
                    .await
                    .expect("poll");
                rx.await.expect("task")
            }
        };

        assert_eq!(poll(2).await, task(1));
        assert_eq!(poll(1).await, task(0));
        assert_eq!(poll(1).await, task(2), "per-worker FIFO order");
    }

    #[tokio::test]
    async fn connection_roundtrip_next_and_complete() {
        let mut fixture = start_gateway();
        let (server_end, client_end) = Endpoint::pair();
        tokio::spawn(serve_task_connection(
            server_end,
            fixture.gateway_tx.clone(),
            fixture.completions_tx.clone(),
        ));

        fixture
            .assignments_tx
            .send(TaskAssignment {
                worker: WorkerId(3),
                task: task(7),
            })
            .await
            .expect("send assignment");

        let mut client = client_end;
        client
            .send(&TaskRequest::Next {
                worker: WorkerId(3),
            })
            .await
            .expect("send next");
        let reply: TaskReply = client.recv(Duration::from_secs(1)).await.expect("recv");
        assert_eq!(reply, TaskReply::Assigned { task: task(7) });

        client
            .send(&TaskRequest::Complete {
                worker: WorkerId(3),
                task: task(7).id,
            })
            .await
            .expect("send complete");
        let reply: TaskReply = client.recv(Duration::from_secs(1)).await.expect("recv");
        assert_eq!(reply, TaskReply::Ack);

        let report = fixture.completions_rx.recv().await.expect("completion");
        assert_eq!(report.worker, WorkerId(3));
        assert_eq!(report.task, task(7).id);
    }
}

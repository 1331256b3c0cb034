//! Registry coordinator.
//!
//! A single-writer actor owning all mutations of the session table. Because
//! it serves requests strictly in arrival order, two concurrent
//! `ensure_queue` calls for the same subscriber id resolve to exactly one
//! queue without any per-key locking. The coordinator also consumes
//! queue-death notifications posted by per-queue watcher tasks and purges
//! the matching rows; subscription records are left intact so the
//! subscriber still routes after a reconnect.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::metrics::RegistryMetrics;
use crate::protocol::SubscriberId;
use crate::queue::{QueueHandle, QueueSupervisor};
use crate::registry::session_table::{MonitorToken, SessionRow, SessionTable};
use crate::{DriftmqError, Result};

/// Row flags applied by `ensure_queue`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnsureOpts {
    pub balance: bool,
    pub clean: bool,
}

enum CoordinatorCommand {
    EnsureQueue {
        id: SubscriberId,
        opts: EnsureOpts,
        reply: oneshot::Sender<QueueHandle>,
    },
    QueueDown {
        queue_id: u64,
        monitor: MonitorToken,
    },
}

/// Handle used by the registry to talk to the coordinator task.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorCommand>,
}

impl CoordinatorHandle {
    /// Resolve the queue for `id`, creating it if absent. Single-flight per
    /// id by coordinator serialization.
    pub async fn ensure_queue(&self, id: SubscriberId, opts: EnsureOpts) -> Result<QueueHandle> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(CoordinatorCommand::EnsureQueue { id, opts, reply })
            .await
            .map_err(|_| DriftmqError::Internal("coordinator stopped".to_string()))?;
        rx.await
            .map_err(|_| DriftmqError::Internal("coordinator dropped request".to_string()))
    }
}

/// Spawn the coordinator task and return its handle.
pub fn spawn(
    table: Arc<SessionTable>,
    supervisor: Arc<dyn QueueSupervisor>,
    metrics: Arc<RegistryMetrics>,
) -> CoordinatorHandle {
    let (tx, rx) = mpsc::channel(1024);
    let coordinator = Coordinator {
        table,
        supervisor,
        metrics,
        tx: tx.clone(),
        next_monitor: 1,
    };
    tokio::spawn(coordinator.run(rx));
    CoordinatorHandle { tx }
}

struct Coordinator {
    table: Arc<SessionTable>,
    supervisor: Arc<dyn QueueSupervisor>,
    metrics: Arc<RegistryMetrics>,
    tx: mpsc::Sender<CoordinatorCommand>,
    next_monitor: MonitorToken,
}

impl Coordinator {
    async fn run(mut self, mut rx: mpsc::Receiver<CoordinatorCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                CoordinatorCommand::EnsureQueue { id, opts, reply } => {
                    let queue = self.ensure_queue(id, opts);
                    let _ = reply.send(queue);
                }
                CoordinatorCommand::QueueDown { queue_id, monitor } => {
                    let removed = self.table.remove_dead(queue_id, monitor);
                    if removed > 0 {
                        self.metrics.record_queue_death();
                        debug!(queue_id, removed, "purged rows for dead queue");
                    }
                }
            }
        }
    }

    fn ensure_queue(&mut self, id: SubscriberId, opts: EnsureOpts) -> QueueHandle {
        if let Some(queue) = self.table.get_queue(&id) {
            self.table.touch(&id, unix_now(), opts.balance, opts.clean);
            return queue;
        }

        let queue = self.supervisor.start_queue(&id);
        let monitor = self.next_monitor;
        self.next_monitor += 1;

        // Liveness watch: when the queue actor exits, post its death so the
        // row is purged. The monitor nonce keeps a stale notification from
        // evicting a row that a fresh queue has since replaced.
        let watched = queue.clone();
        let notify = self.tx.clone();
        tokio::spawn(async move {
            watched.closed().await;
            let _ = notify
                .send(CoordinatorCommand::QueueDown {
                    queue_id: watched.queue_id(),
                    monitor,
                })
                .await;
        });

        self.table.insert(
            id,
            SessionRow {
                queue: queue.clone(),
                monitor: Some(monitor),
                last_seen: unix_now(),
                balance: opts.balance,
                clean: opts.clean,
            },
        );
        queue
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskQueueSupervisor;
    use std::time::Duration;

    fn setup() -> (Arc<SessionTable>, CoordinatorHandle) {
        let table = Arc::new(SessionTable::new());
        let handle = spawn(
            table.clone(),
            Arc::new(TaskQueueSupervisor::new(8)),
            Arc::new(RegistryMetrics::new()),
        );
        (table, handle)
    }

    #[tokio::test]
    async fn test_ensure_queue_is_single_flight() {
        let (table, handle) = setup();
        let id = SubscriberId::new("", "c1");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                handle.ensure_queue(id, EnsureOpts::default()).await.unwrap()
            }));
        }

        let mut queues = Vec::new();
        for task in tasks {
            queues.push(task.await.unwrap());
        }

        let first = &queues[0];
        assert!(queues.iter().all(|q| q == first));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_queue_death_purges_row() {
        let (table, handle) = setup();
        let id = SubscriberId::new("", "c1");

        let queue = handle
            .ensure_queue(id.clone(), EnsureOpts::default())
            .await
            .unwrap();
        assert!(table.contains(&id));

        queue.terminate();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while table.contains(&id) {
            assert!(tokio::time::Instant::now() < deadline, "row never purged");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_restarted_queue_survives_stale_death() {
        let (table, handle) = setup();
        let id = SubscriberId::new("", "c1");

        let first = handle
            .ensure_queue(id.clone(), EnsureOpts::default())
            .await
            .unwrap();
        first.terminate();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while table.contains(&id) {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // A fresh queue for the same id gets a new monitor token; the old
        // queue's (already consumed) death must not touch it.
        let second = handle
            .ensure_queue(id.clone(), EnsureOpts::default())
            .await
            .unwrap();
        assert_ne!(first.queue_id(), second.queue_id());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(table.contains(&id));
        assert_eq!(table.get_queue(&id).unwrap(), second);
    }
}

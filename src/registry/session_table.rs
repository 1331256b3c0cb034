//! Node-local session table.
//!
//! Concurrent multimap from subscriber id to session rows. Reads are
//! lock-free and served from any task; every write goes through the
//! registry coordinator, which is the table's single logical writer. All
//! rows of one key share the same queue handle: the bag is over session
//! identity, not queue identity.

use dashmap::DashMap;

use crate::protocol::SubscriberId;
use crate::queue::QueueHandle;

/// Nonce identifying one liveness watch on a queue. A stale death
/// notification (token mismatch) must not evict a restarted queue's row.
pub type MonitorToken = u64;

/// One session row.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub queue: QueueHandle,
    pub monitor: Option<MonitorToken>,
    /// Unix seconds of the last registration touching this row.
    pub last_seen: u64,
    pub balance: bool,
    pub clean: bool,
}

/// Per-subscriber session stats derived from the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    rows: DashMap<SubscriberId, Vec<SessionRow>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue handle for `id`, from the first row. Wait-free.
    pub fn get_queue(&self, id: &SubscriberId) -> Option<QueueHandle> {
        self.rows
            .get(id)
            .and_then(|rows| rows.first().map(|row| row.queue.clone()))
    }

    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.rows.contains_key(id)
    }

    /// Insert a row. Coordinator only.
    pub(crate) fn insert(&self, id: SubscriberId, row: SessionRow) {
        self.rows.entry(id).or_default().push(row);
    }

    /// Touch existing rows for a reconnect: refresh `last_seen` and flags.
    /// Coordinator only.
    pub(crate) fn touch(&self, id: &SubscriberId, last_seen: u64, balance: bool, clean: bool) {
        if let Some(mut rows) = self.rows.get_mut(id) {
            for row in rows.iter_mut() {
                row.last_seen = last_seen;
                row.balance = balance;
                row.clean = clean;
            }
        }
    }

    /// Remove every row matching both the queue identity and the monitor
    /// token, dropping emptied keys. Coordinator only. Returns the number
    /// of rows removed.
    pub(crate) fn remove_dead(&self, queue_id: u64, monitor: MonitorToken) -> usize {
        let mut removed = 0;
        self.rows.retain(|_, rows| {
            let before = rows.len();
            rows.retain(|row| {
                !(row.queue.queue_id() == queue_id && row.monitor == Some(monitor))
            });
            removed += before - rows.len();
            !rows.is_empty()
        });
        removed
    }

    /// Total row count.
    pub fn len(&self) -> usize {
        self.rows.iter().map(|rows| rows.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn client_stats(&self) -> ClientStats {
        let mut stats = ClientStats::default();
        for rows in self.rows.iter() {
            for row in rows.iter() {
                stats.total += 1;
                if row.monitor.is_some() {
                    stats.active += 1;
                } else {
                    stats.inactive += 1;
                }
            }
        }
        stats
    }

    /// Visit every row. Best-effort snapshot: rows inserted or removed
    /// concurrently may be missed or seen twice.
    pub fn fold_sessions(&self, f: &mut dyn FnMut(&SubscriberId, &SessionRow)) {
        for entry in self.rows.iter() {
            for row in entry.value() {
                f(entry.key(), row);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{QueueSupervisor, TaskQueueSupervisor};

    fn row(queue: QueueHandle, monitor: Option<MonitorToken>) -> SessionRow {
        SessionRow {
            queue,
            monitor,
            last_seen: 0,
            balance: false,
            clean: false,
        }
    }

    #[tokio::test]
    async fn test_get_queue_returns_first_row() {
        let table = SessionTable::new();
        let id = SubscriberId::new("", "c1");
        let queue = TaskQueueSupervisor::new(8).start_queue(&id);

        assert!(table.get_queue(&id).is_none());
        table.insert(id.clone(), row(queue.clone(), Some(1)));
        table.insert(id.clone(), row(queue.clone(), Some(2)));

        assert_eq!(table.get_queue(&id).unwrap(), queue);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_dead_requires_matching_token() {
        let table = SessionTable::new();
        let id = SubscriberId::new("", "c1");
        let queue = TaskQueueSupervisor::new(8).start_queue(&id);
        table.insert(id.clone(), row(queue.clone(), Some(1)));

        // Stale notification: same queue, old token
        assert_eq!(table.remove_dead(queue.queue_id(), 99), 0);
        assert!(table.contains(&id));

        assert_eq!(table.remove_dead(queue.queue_id(), 1), 1);
        assert!(!table.contains(&id));
    }

    #[tokio::test]
    async fn test_client_stats_counts_detached_rows() {
        let table = SessionTable::new();
        let sup = TaskQueueSupervisor::new(8);
        let a = SubscriberId::new("", "a");
        let b = SubscriberId::new("", "b");
        table.insert(a.clone(), row(sup.start_queue(&a), Some(1)));
        table.insert(b.clone(), row(sup.start_queue(&b), None));

        let stats = table.client_stats();
        assert_eq!(
            stats,
            ClientStats {
                total: 2,
                active: 1,
                inactive: 1
            }
        );
    }
}

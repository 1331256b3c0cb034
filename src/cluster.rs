//! Cluster membership and registration-leader seams.
//!
//! The registry never talks to the network directly; it goes through the
//! [`Cluster`] oracle for membership, readiness, remote publish forwarding
//! and session-migration RPCs, and through [`RegisterLeader`] for the
//! cluster-wide serialization of session registration per subscriber id.
//! Single-node implementations of both live here; tests wire multi-node
//! in-process variants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::protocol::{NodeId, Publish, SubscriberId};
use crate::queue::QueueHandle;
use crate::{DriftmqError, Result};

/// Cluster membership oracle and inter-node transport.
#[async_trait]
pub trait Cluster: Send + Sync {
    /// This node's identifier.
    fn node_id(&self) -> NodeId;

    /// Whether the cluster considers itself ready for consistent operation.
    fn is_ready(&self) -> bool;

    /// All known cluster members, including this node.
    fn nodes(&self) -> Vec<NodeId>;

    /// Forward a publish to a remote node for local delivery there.
    async fn publish_to_remote(&self, node: NodeId, publish: &Publish) -> Result<()>;

    /// Ask a remote node to migrate its queue for `id` into `target`.
    /// Remote nodes without a matching queue treat this as a no-op.
    async fn migrate_session(
        &self,
        node: NodeId,
        id: &SubscriberId,
        target: QueueHandle,
    ) -> Result<()>;
}

/// Single-node cluster: always one member, remote operations fail.
#[derive(Debug)]
pub struct LocalCluster {
    node: NodeId,
    ready: AtomicBool,
}

impl LocalCluster {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            ready: AtomicBool::new(true),
        }
    }

    /// Flip readiness; exposed for operators and tests.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }
}

#[async_trait]
impl Cluster for LocalCluster {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn nodes(&self) -> Vec<NodeId> {
        vec![self.node]
    }

    async fn publish_to_remote(&self, node: NodeId, _publish: &Publish) -> Result<()> {
        Err(DriftmqError::Remote(format!("unknown node {}", node)))
    }

    async fn migrate_session(
        &self,
        node: NodeId,
        _id: &SubscriberId,
        _target: QueueHandle,
    ) -> Result<()> {
        Err(DriftmqError::Remote(format!("unknown node {}", node)))
    }
}

/// Held proof of registration leadership for one subscriber id.
/// Dropping the guard releases the slot.
pub struct LeaderGuard {
    _hold: Box<dyn std::any::Any + Send>,
}

impl LeaderGuard {
    pub fn new(hold: impl Send + 'static) -> Self {
        Self {
            _hold: Box::new(hold),
        }
    }
}

/// Serializes `register_subscriber` cluster-wide for a given subscriber id.
#[async_trait]
pub trait RegisterLeader: Send + Sync {
    async fn acquire(&self, id: &SubscriberId) -> LeaderGuard;
}

/// In-process leader: one async mutex per subscriber id. Sufficient for a
/// single node and for multi-registry tests sharing one instance.
#[derive(Debug, Default)]
pub struct LocalLeader {
    locks: DashMap<SubscriberId, Arc<Mutex<()>>>,
}

impl LocalLeader {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegisterLeader for LocalLeader {
    async fn acquire(&self, id: &SubscriberId) -> LeaderGuard {
        let lock = self
            .locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        LeaderGuard::new(lock.lock_owned().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_local_cluster_membership() {
        let cluster = LocalCluster::new(7);
        assert_eq!(cluster.node_id(), 7);
        assert!(cluster.is_ready());
        assert_eq!(cluster.nodes(), vec![7]);

        cluster.set_ready(false);
        assert!(!cluster.is_ready());
    }

    #[tokio::test]
    async fn test_local_leader_serializes_per_id() {
        let leader = Arc::new(LocalLeader::new());
        let id = SubscriberId::new("", "c1");

        let guard = leader.acquire(&id).await;

        let leader2 = leader.clone();
        let id2 = id.clone();
        let contender = tokio::spawn(async move {
            let _guard = leader2.acquire(&id2).await;
        });

        // Holder blocks the contender
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_local_leader_distinct_ids_do_not_contend() {
        let leader = LocalLeader::new();
        let _a = leader.acquire(&SubscriberId::new("", "a")).await;
        // Would deadlock if ids shared a lock
        let _b = tokio::time::timeout(
            Duration::from_secs(1),
            leader.acquire(&SubscriberId::new("", "b")),
        )
        .await
        .unwrap();
    }
}

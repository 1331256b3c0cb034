//! The subscriber registry.
//!
//! This module wires the registry's collaborators together and exposes its
//! public operations:
//!
//! - [`Registry::subscribe`] / [`Registry::unsubscribe`] /
//!   [`Registry::delete_subscriptions`] - subscription management
//! - [`Registry::publish`] - topic-routed message fan-out
//! - [`Registry::register_subscriber`] - session registration with
//!   cluster-wide queue handover
//! - introspection for operators
//!
//! The session table is read lock-free from any task and written only by
//! the [`coordinator`] actor; subscription records live in the replicated
//! metadata store behind the admission gate.

pub mod coordinator;
pub mod session_table;

mod publish;
mod session;
mod subscribe;


use std::sync::Arc;
use std::time::Duration;

use crate::admission::AdmissionGate;
use crate::auth::HookChain;
use crate::cluster::{Cluster, LocalCluster, LocalLeader, RegisterLeader};
use crate::config::RegistryConfig;
use crate::metadata::{InMemoryMetadataStore, MetadataStore};
use crate::metrics::{MetricsSnapshot, RegistryMetrics};
use crate::protocol::{NodeId, SubscriberId, Topic};
use crate::queue::{QueueSupervisor, TaskQueueSupervisor};
use crate::retained::{InMemoryRetainedStore, RetainedStore};
use crate::routing::{RegView, RouteTarget, TrieRegView};
use crate::subscriptions::SubscriptionStore;
use crate::{DriftmqError, Result};

pub use coordinator::{CoordinatorHandle, EnsureOpts};
pub use session_table::{ClientStats, MonitorToken, SessionRow, SessionTable};
pub use session::RegisterOpts;

/// The registry core. One instance per broker node.
pub struct Registry {
    config: RegistryConfig,
    node: NodeId,
    subscriptions: Arc<SubscriptionStore>,
    retained: Arc<dyn RetainedStore>,
    reg_view: Arc<dyn RegView>,
    cluster: Arc<dyn Cluster>,
    leader: Arc<dyn RegisterLeader>,
    hooks: Arc<HookChain>,
    metrics: Arc<RegistryMetrics>,
    table: Arc<SessionTable>,
    coordinator: CoordinatorHandle,
}

/// Builds a [`Registry`], defaulting every collaborator to its in-process
/// implementation. Must be built inside a tokio runtime: construction
/// spawns the coordinator and routing-view tasks.
pub struct RegistryBuilder {
    config: RegistryConfig,
    metadata: Option<Arc<dyn MetadataStore>>,
    retained: Option<Arc<dyn RetainedStore>>,
    reg_view: Option<Arc<dyn RegView>>,
    cluster: Option<Arc<dyn Cluster>>,
    leader: Option<Arc<dyn RegisterLeader>>,
    hooks: Option<HookChain>,
    supervisor: Option<Arc<dyn QueueSupervisor>>,
}

impl RegistryBuilder {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            metadata: None,
            retained: None,
            reg_view: None,
            cluster: None,
            leader: None,
            hooks: None,
            supervisor: None,
        }
    }

    pub fn metadata_store(mut self, store: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(store);
        self
    }

    pub fn retained_store(mut self, store: Arc<dyn RetainedStore>) -> Self {
        self.retained = Some(store);
        self
    }

    /// Override the routing view. Without this the default topic trie is
    /// built and kept current from the subscription change stream.
    pub fn reg_view(mut self, view: Arc<dyn RegView>) -> Self {
        self.reg_view = Some(view);
        self
    }

    pub fn cluster(mut self, cluster: Arc<dyn Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn register_leader(mut self, leader: Arc<dyn RegisterLeader>) -> Self {
        self.leader = Some(leader);
        self
    }

    pub fn hooks(mut self, hooks: HookChain) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn queue_supervisor(mut self, supervisor: Arc<dyn QueueSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn build(self) -> Result<Arc<Registry>> {
        self.config.validate().map_err(DriftmqError::Config)?;

        let cluster = self
            .cluster
            .unwrap_or_else(|| Arc::new(LocalCluster::new(self.config.node_id)));
        let node = cluster.node_id();

        let gate = AdmissionGate::new(
            self.config.max_inflight_metadata_ops,
            Duration::from_millis(self.config.retry_backoff_ms),
        );
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(InMemoryMetadataStore::new()));
        let subscriptions = Arc::new(SubscriptionStore::new(metadata, gate));

        let reg_view = self
            .reg_view
            .unwrap_or_else(|| TrieRegView::start(subscriptions.clone(), node));

        let supervisor = self.supervisor.unwrap_or_else(|| {
            Arc::new(TaskQueueSupervisor::new(self.config.max_queued_messages))
        });

        let table = Arc::new(SessionTable::new());
        let metrics = Arc::new(RegistryMetrics::new());
        let coordinator = coordinator::spawn(table.clone(), supervisor, metrics.clone());

        Ok(Arc::new(Registry {
            config: self.config,
            node,
            subscriptions,
            retained: self
                .retained
                .unwrap_or_else(|| Arc::new(InMemoryRetainedStore::new())),
            reg_view,
            cluster,
            leader: self.leader.unwrap_or_else(|| Arc::new(LocalLeader::new())),
            hooks: Arc::new(self.hooks.unwrap_or_default()),
            metrics,
            table,
            coordinator,
        }))
    }
}

impl Registry {
    /// Build a registry with default in-process collaborators.
    pub fn new(config: RegistryConfig) -> Result<Arc<Self>> {
        RegistryBuilder::new(config).build()
    }

    pub fn builder(config: RegistryConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    pub(crate) fn subscriptions(&self) -> &SubscriptionStore {
        &self.subscriptions
    }

    pub(crate) fn table(&self) -> &SessionTable {
        &self.table
    }

    pub(crate) fn retained(&self) -> &dyn RetainedStore {
        self.retained.as_ref()
    }

    pub(crate) fn reg_view(&self) -> &dyn RegView {
        self.reg_view.as_ref()
    }

    pub(crate) fn cluster(&self) -> &dyn Cluster {
        self.cluster.as_ref()
    }

    pub(crate) fn leader(&self) -> &dyn RegisterLeader {
        self.leader.as_ref()
    }

    pub(crate) fn hooks(&self) -> &HookChain {
        &self.hooks
    }

    pub(crate) fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    // --- introspection ---

    /// Session counts: total rows, rows with a live monitor, detached rows.
    pub fn client_stats(&self) -> ClientStats {
        self.table.client_stats()
    }

    /// Total session rows on this node.
    pub fn total_sessions(&self) -> usize {
        self.table.len()
    }

    /// Live subscription records cluster-wide.
    pub fn total_subscriptions(&self) -> usize {
        self.subscriptions.len()
    }

    /// Retained messages held by the retained store.
    pub fn retained_count(&self) -> usize {
        self.retained.size()
    }

    /// Queued depth of the subscriber's queue, or 0 without a local queue.
    pub fn stored(&self, id: &SubscriberId) -> usize {
        self.table.get_queue(id).map(|q| q.stored()).unwrap_or(0)
    }

    /// Visit every session row on this node. Best-effort snapshot.
    pub fn fold_sessions(&self, f: &mut dyn FnMut(&SubscriberId, &SessionRow)) {
        self.table.fold_sessions(f);
    }

    /// Visit every subscription record cluster-wide, classified as a local
    /// delivery target or a remote forwarding target relative to this node.
    /// Best-effort snapshot: concurrent deletions may be missed or
    /// double-counted.
    pub async fn fold_subscribers(
        &self,
        f: &mut (dyn FnMut(&str, &Topic, RouteTarget) + Send),
    ) -> Result<()> {
        let node = self.node;
        self.subscriptions
            .fold(&mut |id, set| {
                for sub in set {
                    let target = if sub.node == node {
                        RouteTarget::Local {
                            id: id.clone(),
                            qos: sub.qos,
                        }
                    } else {
                        RouteTarget::Remote { node: sub.node }
                    };
                    f(&id.mountpoint, &sub.topic, target);
                }
            })
            .await
    }

    /// Current subscription count for a topic filter, from the per-topic
    /// metric gauges.
    pub fn subscription_count(&self, topic: &Topic) -> i64 {
        self.metrics.topic_subscription_count(&topic.to_string())
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Block until the cluster oracle reports ready, polling every 100 ms.
    /// May loop indefinitely; callers needing a deadline wrap it in
    /// `tokio::time::timeout`.
    pub async fn wait_until_ready(&self) {
        while !self.cluster.is_ready() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    pub(crate) fn check_ready(&self, trade_consistency: bool) -> Result<()> {
        if trade_consistency || self.cluster.is_ready() {
            Ok(())
        } else {
            Err(DriftmqError::NotReady)
        }
    }
}

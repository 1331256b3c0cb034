//! Topic routing view.
//!
//! The publish router walks a [`RegView`] to find delivery targets for a
//! message: local subscribers as `(subscriber_id, qos)` and remote nodes
//! that host matching subscribers. The default implementation is a
//! per-mountpoint topic trie kept current by consuming the subscription
//! change stream, so the publish hot path never touches the metadata store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::protocol::{NodeId, QoS, SubscriberId, Subscription, Topic};
use crate::subscriptions::{SubscriptionEvent, SubscriptionStore};

/// One delivery target yielded by a routing fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteTarget {
    /// A subscriber whose queue lives on this node.
    Local { id: SubscriberId, qos: QoS },
    /// A remote node with at least one matching subscriber.
    Remote { node: NodeId },
}

/// Routing view over the cluster-wide subscription table.
pub trait RegView: Send + Sync {
    /// Visit every target matching `topic` within `mountpoint`. Remote
    /// nodes are yielded at most once per fold.
    fn fold(&self, mountpoint: &str, topic: &Topic, visit: &mut dyn FnMut(RouteTarget));
}

#[derive(Default)]
struct TrieNode {
    local: Vec<(SubscriberId, QoS)>,
    remote: Vec<(NodeId, SubscriberId, QoS)>,
    children: HashMap<String, TrieNode>,
    single: Option<Box<TrieNode>>,
    multi_local: Vec<(SubscriberId, QoS)>,
    multi_remote: Vec<(NodeId, SubscriberId, QoS)>,
}

impl TrieNode {
    fn insert(&mut self, levels: &[String], id: &SubscriberId, sub: &Subscription, this_node: NodeId) {
        if levels.is_empty() {
            if sub.node == this_node {
                self.local.retain(|(i, q)| !(i == id && *q == sub.qos));
                self.local.push((id.clone(), sub.qos));
            } else {
                self.remote
                    .retain(|(n, i, q)| !(*n == sub.node && i == id && *q == sub.qos));
                self.remote.push((sub.node, id.clone(), sub.qos));
            }
            return;
        }

        let level = &levels[0];
        let remaining = &levels[1..];
        match level.as_str() {
            "#" => {
                if sub.node == this_node {
                    self.multi_local.retain(|(i, q)| !(i == id && *q == sub.qos));
                    self.multi_local.push((id.clone(), sub.qos));
                } else {
                    self.multi_remote
                        .retain(|(n, i, q)| !(*n == sub.node && i == id && *q == sub.qos));
                    self.multi_remote.push((sub.node, id.clone(), sub.qos));
                }
            }
            "+" => {
                let child = self.single.get_or_insert_with(Default::default);
                child.insert(remaining, id, sub, this_node);
            }
            _ => {
                let child = self.children.entry(level.clone()).or_default();
                child.insert(remaining, id, sub, this_node);
            }
        }
    }

    fn remove(&mut self, levels: &[String], id: &SubscriberId, sub: &Subscription, this_node: NodeId) {
        if levels.is_empty() {
            if sub.node == this_node {
                self.local.retain(|(i, q)| !(i == id && *q == sub.qos));
            } else {
                self.remote
                    .retain(|(n, i, q)| !(*n == sub.node && i == id && *q == sub.qos));
            }
            return;
        }

        let level = &levels[0];
        let remaining = &levels[1..];
        match level.as_str() {
            "#" => {
                if sub.node == this_node {
                    self.multi_local.retain(|(i, q)| !(i == id && *q == sub.qos));
                } else {
                    self.multi_remote
                        .retain(|(n, i, q)| !(*n == sub.node && i == id && *q == sub.qos));
                }
            }
            "+" => {
                if let Some(child) = &mut self.single {
                    child.remove(remaining, id, sub, this_node);
                }
            }
            _ => {
                if let Some(child) = self.children.get_mut(level.as_str()) {
                    child.remove(remaining, id, sub, this_node);
                }
            }
        }
    }

    fn collect(
        &self,
        levels: &[String],
        is_root: bool,
        seen_nodes: &mut HashSet<NodeId>,
        visit: &mut dyn FnMut(RouteTarget),
    ) {
        // Topics starting with $ are not matched by wildcards at the root
        let skip_wildcards = is_root && levels.first().is_some_and(|l| l.starts_with('$'));

        if !skip_wildcards {
            for (id, qos) in &self.multi_local {
                visit(RouteTarget::Local {
                    id: id.clone(),
                    qos: *qos,
                });
            }
            for (node, _, _) in &self.multi_remote {
                if seen_nodes.insert(*node) {
                    visit(RouteTarget::Remote { node: *node });
                }
            }
        }

        if levels.is_empty() {
            for (id, qos) in &self.local {
                visit(RouteTarget::Local {
                    id: id.clone(),
                    qos: *qos,
                });
            }
            for (node, _, _) in &self.remote {
                if seen_nodes.insert(*node) {
                    visit(RouteTarget::Remote { node: *node });
                }
            }
            return;
        }

        let level = &levels[0];
        let remaining = &levels[1..];

        if !skip_wildcards {
            if let Some(child) = &self.single {
                child.collect(remaining, false, seen_nodes, visit);
            }
        }
        if let Some(child) = self.children.get(level.as_str()) {
            child.collect(remaining, false, seen_nodes, visit);
        }
    }
}

/// Default trie-backed routing view.
pub struct TrieRegView {
    this_node: NodeId,
    roots: RwLock<HashMap<String, TrieNode>>,
}

impl TrieRegView {
    pub fn new(this_node: NodeId) -> Arc<Self> {
        Arc::new(Self {
            this_node,
            roots: RwLock::new(HashMap::new()),
        })
    }

    /// Build a view that seeds itself from the store and follows its change
    /// stream.
    pub fn start(store: Arc<SubscriptionStore>, this_node: NodeId) -> Arc<Self> {
        let view = Self::new(this_node);
        let updater = view.clone();
        // Subscribe before seeding so no change is lost; set semantics make
        // replayed changes idempotent.
        let mut changes = store.subscribe_changes();
        tokio::spawn(async move {
            let mut seed: Vec<(SubscriberId, Vec<Subscription>)> = Vec::new();
            loop {
                seed.clear();
                let result = store
                    .fold(&mut |id, set| {
                        seed.push((id.clone(), set.iter().cloned().collect()));
                    })
                    .await;
                match result {
                    Ok(()) => break,
                    Err(crate::DriftmqError::Overloaded) => {
                        tokio::time::sleep(store.gate().backoff()).await;
                    }
                    Err(e) => {
                        debug!(error = %e, "routing view seed failed");
                        break;
                    }
                }
            }
            for (id, subs) in seed.drain(..) {
                for sub in subs {
                    updater.insert(&id, &sub);
                }
            }
            while let Some(event) = changes.recv().await {
                updater.apply(event);
            }
        });
        view
    }

    /// Apply one subscription change to the trie.
    pub fn apply(&self, event: SubscriptionEvent) {
        match event {
            SubscriptionEvent::Updated { id, removed, added } => {
                for sub in &removed {
                    self.remove(&id, sub);
                }
                for sub in &added {
                    self.insert(&id, sub);
                }
            }
            SubscriptionEvent::Deleted { id, old } => {
                for sub in &old {
                    self.remove(&id, sub);
                }
            }
        }
    }

    pub fn insert(&self, id: &SubscriberId, sub: &Subscription) {
        let mut roots = self.roots.write();
        let root = roots.entry(id.mountpoint.clone()).or_default();
        root.insert(sub.topic.levels(), id, sub, self.this_node);
    }

    pub fn remove(&self, id: &SubscriberId, sub: &Subscription) {
        let mut roots = self.roots.write();
        if let Some(root) = roots.get_mut(&id.mountpoint) {
            root.remove(sub.topic.levels(), id, sub, self.this_node);
        }
    }
}

impl RegView for TrieRegView {
    fn fold(&self, mountpoint: &str, topic: &Topic, visit: &mut dyn FnMut(RouteTarget)) {
        let roots = self.roots.read();
        if let Some(root) = roots.get(mountpoint) {
            let mut seen_nodes = HashSet::new();
            root.collect(topic.levels(), true, &mut seen_nodes, visit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionGate;
    use crate::metadata::InMemoryMetadataStore;
    use std::time::Duration;

    fn sub(topic: &str, qos: QoS, node: NodeId) -> Subscription {
        Subscription {
            topic: Topic::parse(topic).unwrap(),
            qos,
            node,
        }
    }

    fn fold(view: &TrieRegView, mountpoint: &str, topic: &str) -> Vec<RouteTarget> {
        let mut targets = Vec::new();
        view.fold(mountpoint, &Topic::parse(topic).unwrap(), &mut |t| {
            targets.push(t)
        });
        targets
    }

    #[test]
    fn test_local_and_remote_targets() {
        let view = TrieRegView::new(1);
        let here = SubscriberId::new("", "here");
        let away = SubscriberId::new("", "away");

        view.insert(&here, &sub("a/b", QoS::AtLeastOnce, 1));
        view.insert(&away, &sub("a/b", QoS::AtMostOnce, 2));

        let targets = fold(&view, "", "a/b");
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&RouteTarget::Local {
            id: here,
            qos: QoS::AtLeastOnce
        }));
        assert!(targets.contains(&RouteTarget::Remote { node: 2 }));
    }

    #[test]
    fn test_remote_nodes_deduplicated_per_fold() {
        let view = TrieRegView::new(1);
        view.insert(&SubscriberId::new("", "r1"), &sub("a/b", QoS::AtMostOnce, 2));
        view.insert(&SubscriberId::new("", "r2"), &sub("a/#", QoS::AtMostOnce, 2));

        let targets = fold(&view, "", "a/b");
        assert_eq!(targets, vec![RouteTarget::Remote { node: 2 }]);
    }

    #[test]
    fn test_wildcard_matching() {
        let view = TrieRegView::new(0);
        let id = SubscriberId::new("", "c1");
        view.insert(&id, &sub("sensors/+/temp", QoS::AtMostOnce, 0));
        view.insert(&id, &sub("logs/#", QoS::AtLeastOnce, 0));

        assert_eq!(fold(&view, "", "sensors/room1/temp").len(), 1);
        assert_eq!(fold(&view, "", "sensors/room1/hum").len(), 0);
        assert_eq!(fold(&view, "", "logs/app/error").len(), 1);
        assert_eq!(fold(&view, "", "logs").len(), 0);
    }

    #[test]
    fn test_dollar_topics_skip_root_wildcards() {
        let view = TrieRegView::new(0);
        let id = SubscriberId::new("", "c1");
        view.insert(&id, &sub("#", QoS::AtMostOnce, 0));
        view.insert(&id, &sub("$SYS/uptime", QoS::AtMostOnce, 0));

        assert_eq!(fold(&view, "", "$SYS/uptime").len(), 1);
        assert_eq!(fold(&view, "", "regular/topic").len(), 1);
    }

    #[test]
    fn test_mountpoints_are_isolated() {
        let view = TrieRegView::new(0);
        view.insert(&SubscriberId::new("a", "c1"), &sub("t", QoS::AtMostOnce, 0));

        assert_eq!(fold(&view, "a", "t").len(), 1);
        assert_eq!(fold(&view, "b", "t").len(), 0);
    }

    #[test]
    fn test_remove_subscription() {
        let view = TrieRegView::new(0);
        let id = SubscriberId::new("", "c1");
        let s0 = sub("a/b", QoS::AtMostOnce, 0);
        let s1 = sub("a/b", QoS::AtLeastOnce, 0);
        view.insert(&id, &s0);
        view.insert(&id, &s1);

        view.remove(&id, &s0);
        let targets = fold(&view, "", "a/b");
        assert_eq!(
            targets,
            vec![RouteTarget::Local {
                id,
                qos: QoS::AtLeastOnce
            }]
        );
    }

    #[tokio::test]
    async fn test_view_follows_change_stream() {
        let store = Arc::new(SubscriptionStore::new(
            Arc::new(InMemoryMetadataStore::new()),
            AdmissionGate::new(16, Duration::from_millis(10)),
        ));
        let view = TrieRegView::start(store.clone(), 0);

        let id = SubscriberId::new("", "c1");
        store
            .put(&id, [sub("a/b", QoS::AtMostOnce, 0)].into_iter().collect())
            .await
            .unwrap();

        // The updater task applies the change asynchronously
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if !fold(&view, "", "a/b").is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "view never updated");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

//! Registry metrics.
//!
//! Lock-free counters updated on the registry's hot paths with relaxed
//! atomics, plus per-topic subscription gauges. Aggregation happens only
//! when an operator asks for a [`MetricsSnapshot`].

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;

/// Lock-free registry counters.
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    subscribe_ops: AtomicU64,
    unsubscribe_ops: AtomicU64,
    register_ops: AtomicU64,
    publish_local: AtomicU64,
    publish_remote: AtomicU64,
    publish_dropped: AtomicU64,
    retained_replayed: AtomicU64,
    overload_rejections: AtomicU64,
    queue_deaths: AtomicU64,
    migrations: AtomicU64,
    /// Live subscription count per topic filter.
    topic_subscriptions: DashMap<String, AtomicI64>,
}

impl RegistryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_subscribe(&self) {
        self.subscribe_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsubscribe(&self) {
        self.unsubscribe_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_register(&self) {
        self.register_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_local(&self) {
        self.publish_local.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_remote(&self) {
        self.publish_remote.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_dropped(&self) {
        self.publish_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retained_replay(&self) {
        self.retained_replayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overload_rejection(&self) {
        self.overload_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_death(&self) {
        self.queue_deaths.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_topic_subscription(&self, topic: &str) {
        self.topic_subscriptions
            .entry(topic.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_topic_subscription(&self, topic: &str) {
        self.topic_subscriptions
            .entry(topic.to_string())
            .or_default()
            .fetch_sub(1, Ordering::Relaxed);
    }

    /// Current subscription count for one topic filter.
    pub fn topic_subscription_count(&self, topic: &str) -> i64 {
        self.topic_subscriptions
            .get(topic)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            subscribe_ops: self.subscribe_ops.load(Ordering::Relaxed),
            unsubscribe_ops: self.unsubscribe_ops.load(Ordering::Relaxed),
            register_ops: self.register_ops.load(Ordering::Relaxed),
            publish_local: self.publish_local.load(Ordering::Relaxed),
            publish_remote: self.publish_remote.load(Ordering::Relaxed),
            publish_dropped: self.publish_dropped.load(Ordering::Relaxed),
            retained_replayed: self.retained_replayed.load(Ordering::Relaxed),
            overload_rejections: self.overload_rejections.load(Ordering::Relaxed),
            queue_deaths: self.queue_deaths.load(Ordering::Relaxed),
            migrations: self.migrations.load(Ordering::Relaxed),
            topic_subscriptions: self
                .topic_subscriptions
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .filter(|(_, count)| *count != 0)
                .collect(),
        }
    }
}

/// Point-in-time view of the registry counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub subscribe_ops: u64,
    pub unsubscribe_ops: u64,
    pub register_ops: u64,
    pub publish_local: u64,
    pub publish_remote: u64,
    pub publish_dropped: u64,
    pub retained_replayed: u64,
    pub overload_rejections: u64,
    pub queue_deaths: u64,
    pub migrations: u64,
    pub topic_subscriptions: Vec<(String, i64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = RegistryMetrics::new();
        metrics.record_subscribe();
        metrics.record_subscribe();
        metrics.record_publish_local();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.subscribe_ops, 2);
        assert_eq!(snapshot.publish_local, 1);
        assert_eq!(snapshot.unsubscribe_ops, 0);
    }

    #[test]
    fn test_topic_gauges_track_net_count() {
        let metrics = RegistryMetrics::new();
        metrics.incr_topic_subscription("a/b");
        metrics.incr_topic_subscription("a/b");
        metrics.incr_topic_subscription("c");
        metrics.decr_topic_subscription("a/b");

        assert_eq!(metrics.topic_subscription_count("a/b"), 1);
        assert_eq!(metrics.topic_subscription_count("c"), 1);
        assert_eq!(metrics.topic_subscription_count("unknown"), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.topic_subscriptions.len(), 2);
    }
}

//! Subscribe/unsubscribe engine.
//!
//! Subscribes run the auth chain, merge the new `(topic, qos, node)` tuples
//! into the replicated record under one admission token, replay retained
//! messages onto the subscriber's queue, and fire the event hooks.
//! Unsubscribes retain every tuple owned by other nodes untouched.

use std::collections::HashSet;

use tracing::debug;

use crate::protocol::{Publish, QoS, SubscriberId, Subscription, Topic};
use crate::queue::QueueHandle;
use crate::registry::Registry;
use crate::{DriftmqError, Result};

impl Registry {
    /// Subscribe `id` to a list of `(topic, qos)` filters.
    ///
    /// With `trade_consistency = false` the cluster must be ready. The auth
    /// chain may substitute the topic list; the substituted list is what
    /// gets stored, replayed and reported.
    pub async fn subscribe(
        &self,
        trade_consistency: bool,
        user: Option<&str>,
        id: &SubscriberId,
        topics: Vec<(Topic, QoS)>,
    ) -> Result<()> {
        self.check_ready(trade_consistency)?;

        let topics = match self.hooks().all_till_ok(user, id, &topics).await? {
            Some(substituted) => substituted,
            None => topics,
        };

        let node = self.node_id();
        let to_add: Vec<Subscription> = topics
            .iter()
            .map(|(topic, qos)| Subscription {
                topic: topic.clone(),
                qos: *qos,
                node,
            })
            .collect();

        let result = self
            .subscriptions()
            .update(id, move |mut set| {
                for sub in to_add {
                    set.insert(sub);
                }
                set
            })
            .await;
        if let Err(err) = result {
            if matches!(err, DriftmqError::Overloaded) {
                self.metrics().record_overload_rejection();
            }
            return Err(err);
        }

        // Retained replay goes straight onto the queue; a subscriber whose
        // queue lives elsewhere gets its replay from the owning node.
        if let Some(queue) = self.table().get_queue(id) {
            for (topic, qos) in &topics {
                self.replay_retained(&queue, &id.mountpoint, topic, *qos);
            }
        }

        self.hooks().on_subscribe(user, id, &topics).await;
        for (topic, _) in &topics {
            self.metrics().incr_topic_subscription(&topic.to_string());
        }
        self.metrics().record_subscribe();
        Ok(())
    }

    /// Remove this node's subscriptions of `id` to the given topics.
    /// Tuples owned by other nodes are untouched.
    pub async fn unsubscribe(
        &self,
        trade_consistency: bool,
        user: Option<&str>,
        id: &SubscriberId,
        topics: Vec<Topic>,
    ) -> Result<()> {
        self.check_ready(trade_consistency)?;

        let node = self.node_id();
        let filters = topics.clone();
        let result = self
            .subscriptions()
            .update(id, move |set| {
                set.into_iter()
                    .filter(|sub| sub.node != node || !filters.contains(&sub.topic))
                    .collect::<HashSet<Subscription>>()
            })
            .await;
        if let Err(err) = result {
            if matches!(err, DriftmqError::Overloaded) {
                self.metrics().record_overload_rejection();
            }
            return Err(err);
        }

        self.hooks().on_unsubscribe(user, id, &topics).await;
        for topic in &topics {
            self.metrics().decr_topic_subscription(&topic.to_string());
        }
        self.metrics().record_unsubscribe();
        Ok(())
    }

    /// Tombstone the whole subscription record for `id`. No auth, no
    /// events.
    pub async fn delete_subscriptions(&self, id: &SubscriberId) -> Result<()> {
        self.subscriptions().delete(id).await
    }

    /// Enqueue every retained message matching `filter` as a synthetic
    /// delivery with `retain = true`.
    fn replay_retained(&self, queue: &QueueHandle, mountpoint: &str, filter: &Topic, qos: QoS) {
        self.retained()
            .match_fold(mountpoint, filter, &mut |topic, payload| {
                let publish = Publish {
                    mountpoint: mountpoint.to_string(),
                    routing_key: topic.clone(),
                    payload: payload.clone(),
                    retain: true,
                    qos,
                    dup: false,
                };
                match queue.enqueue(qos, publish) {
                    Ok(()) => self.metrics().record_retained_replay(),
                    Err(_) => debug!(%filter, "retained replay hit dead queue"),
                }
            });
    }
}

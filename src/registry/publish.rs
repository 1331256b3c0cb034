//! Publish router.
//!
//! Dispatches a publish according to its retain flag and the consistency
//! policy, then fans it out over the routing view: local subscribers are
//! resolved through the session table and enqueued, remote nodes receive
//! one forwarded copy each. Remote failures are logged and swallowed;
//! a missing local queue is a silent drop, the record simply had not
//! caught up with a teardown or lives on another node.

use tracing::{debug, warn};

use crate::protocol::{NodeId, Publish};
use crate::registry::Registry;
use crate::routing::RouteTarget;
use crate::{DriftmqError, Result};

impl Registry {
    /// Route a publish.
    ///
    /// Retained messages with an empty payload delete the retained record
    /// and deliver nothing; retained messages with a payload are stored and
    /// fanned out with `retain = false`. With `trade_consistency = false`
    /// the cluster must be ready, otherwise nothing happens and `NotReady`
    /// is returned.
    pub async fn publish(&self, trade_consistency: bool, publish: Publish) -> Result<()> {
        if publish.routing_key.has_wildcards() {
            return Err(DriftmqError::InvalidTopic(format!(
                "routing key '{}' contains wildcards",
                publish.routing_key
            )));
        }
        self.check_ready(trade_consistency)?;

        if publish.retain && publish.payload.is_empty() {
            self.retained()
                .delete(&publish.mountpoint, &publish.routing_key);
            return Ok(());
        }

        let outgoing = if publish.retain {
            self.retained().insert(
                &publish.mountpoint,
                &publish.routing_key,
                publish.payload.clone(),
            );
            Publish {
                retain: false,
                ..publish
            }
        } else {
            publish
        };

        self.route(&outgoing, true).await
    }

    /// Entry point for publishes forwarded from other nodes: deliver to
    /// local subscribers only, never forward again.
    pub async fn deliver_local(&self, publish: Publish) -> Result<()> {
        self.route(&publish, false).await
    }

    async fn route(&self, publish: &Publish, forward_remote: bool) -> Result<()> {
        let mut remotes: Vec<NodeId> = Vec::new();

        self.reg_view()
            .fold(&publish.mountpoint, &publish.routing_key, &mut |target| {
                match target {
                    RouteTarget::Local { id, qos } => match self.table().get_queue(&id) {
                        Some(queue) => {
                            if queue.enqueue(qos, publish.clone()).is_ok() {
                                self.metrics().record_publish_local();
                            } else {
                                debug!(subscriber = %id, "queue gone, dropping publish");
                                self.metrics().record_publish_dropped();
                            }
                        }
                        None => {
                            // Record not yet remapped or session just torn down
                            debug!(subscriber = %id, "no local queue, dropping publish");
                            self.metrics().record_publish_dropped();
                        }
                    },
                    RouteTarget::Remote { node } => {
                        if forward_remote {
                            remotes.push(node);
                        }
                    }
                }
            });

        for node in remotes {
            match self.cluster().publish_to_remote(node, publish).await {
                Ok(()) => self.metrics().record_publish_remote(),
                Err(err) => {
                    // Fire-and-forget: availability over delivery
                    warn!(node, error = %err, "remote publish failed");
                    self.metrics().record_publish_dropped();
                }
            }
        }

        Ok(())
    }
}

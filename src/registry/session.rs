//! Session registration and cross-node migration.
//!
//! Exclusive registration serializes cluster-wide through the register
//! leader, tears down prior state for clean sessions, pulls the
//! subscriber's queue home from whichever node hosted it, and remaps the
//! subscription record's owner node. Multi-session registration attaches
//! additional sessions to one shared queue and does not honor the clean
//! flag.

use std::time::Duration;

use tracing::{debug, warn};

use crate::protocol::{SessionRef, SubscriberId};
use crate::queue::{DeliverMode, QueueHandle, QueueOpts};
use crate::registry::coordinator::EnsureOpts;
use crate::registry::Registry;
use crate::Result;

/// Per-registration flags, defaulted from the node configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterOpts {
    /// Allow several sessions to share the subscriber's queue. In this
    /// mode `clean_session` is not honored.
    pub allow_multiple_sessions: bool,
    /// Balance deliveries round-robin across the shared sessions.
    pub balance_sessions: bool,
}

impl RegisterOpts {
    pub fn from_config(config: &crate::config::RegistryConfig) -> Self {
        Self {
            allow_multiple_sessions: config.allow_multiple_sessions,
            balance_sessions: config.balance_sessions,
        }
    }
}

impl Registry {
    /// Register a session for `id` and return its queue handle.
    pub async fn register_subscriber(
        &self,
        session: SessionRef,
        id: &SubscriberId,
        clean_session: bool,
        opts: RegisterOpts,
    ) -> Result<QueueHandle> {
        self.metrics().record_register();

        if opts.allow_multiple_sessions {
            let queue = self
                .coordinator()
                .ensure_queue(
                    id.clone(),
                    EnsureOpts {
                        balance: opts.balance_sessions,
                        clean: false,
                    },
                )
                .await?;
            queue.add_session(session, false, true)?;
            if opts.balance_sessions {
                queue.set_opts(QueueOpts {
                    deliver_mode: Some(DeliverMode::Balance),
                });
            }
            return Ok(queue);
        }

        let _guard = self.leader().acquire(id).await;
        let queue = self
            .register_subscriber_locked(session, id, clean_session)
            .await?;
        if !clean_session {
            self.remap_subscription(id).await?;
        }
        Ok(queue)
    }

    /// The leader-serialized registration body, run on exactly one node at
    /// a time for a given id.
    async fn register_subscriber_locked(
        &self,
        session: SessionRef,
        id: &SubscriberId,
        clean_session: bool,
    ) -> Result<QueueHandle> {
        if clean_session {
            self.subscriptions().delete_retrying(id).await?;
        }

        let queue = self
            .coordinator()
            .ensure_queue(
                id.clone(),
                EnsureOpts {
                    balance: false,
                    clean: clean_session,
                },
            )
            .await?;

        // Pull the queue home from every peer that might host it. Timeouts
        // and failures mean "peer had no queue" and are non-fatal.
        let timeout = Duration::from_millis(self.config().remote_timeout_ms);
        let this_node = self.node_id();
        for node in self.cluster().nodes() {
            if node == this_node {
                continue;
            }
            match tokio::time::timeout(
                timeout,
                self.cluster().migrate_session(node, id, queue.clone()),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    debug!(node, subscriber = %id, error = %err, "no session migrated from peer")
                }
                Err(_) => warn!(node, subscriber = %id, "session migration timed out"),
            }
        }

        queue.add_session(session, clean_session, false)?;
        Ok(queue)
    }

    /// Rewrite every subscription tuple of `id` to this node, deduplicated.
    /// Retries the admission gate until the rewrite lands.
    pub async fn remap_subscription(&self, id: &SubscriberId) -> Result<()> {
        let node = self.node_id();
        self.subscriptions()
            .update_retrying(id, move |set| {
                set.into_iter()
                    .map(|mut sub| {
                        sub.node = node;
                        sub
                    })
                    .collect()
            })
            .await?;
        Ok(())
    }

    /// Remote endpoint of the migration RPC: hand this node's queue for
    /// `id` over to `target`. A node without a matching queue does
    /// nothing.
    pub async fn migrate_to(&self, id: &SubscriberId, target: QueueHandle) -> Result<()> {
        let local = match self.table().get_queue(id) {
            Some(local) => local,
            None => return Ok(()),
        };
        if local == target {
            return Ok(());
        }
        debug!(subscriber = %id, from = local.queue_id(), to = target.queue_id(), "migrating session");
        local.migrate(target).await?;
        self.metrics().record_migration();
        Ok(())
    }
}

//! Subscription store adapter.
//!
//! Wraps the replicated metadata store with the admission gate and exposes
//! the registry-facing operations: admission-guarded reads, full-replacement
//! writes, tombstoning deletes, folds, and a derived change stream. Raw
//! store events carry whole old/new records; this adapter diffs them into
//! per-subscription add/remove sets and suppresses tombstone/absent
//! transitions.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::warn;

use crate::admission::AdmissionGate;
use crate::metadata::MetadataStore;
use crate::protocol::{SubscriberId, Subscription};
use crate::Result;

/// High-level subscription change, derived by diffing store events.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Updated {
        id: SubscriberId,
        removed: HashSet<Subscription>,
        added: HashSet<Subscription>,
    },
    Deleted {
        id: SubscriberId,
        old: HashSet<Subscription>,
    },
}

/// Admission-gated facade over the metadata store.
pub struct SubscriptionStore {
    store: Arc<dyn MetadataStore>,
    gate: AdmissionGate,
    /// Serializes read-modify-write cycles per subscriber id so that
    /// node-local concurrent updates never lose each other's tuples.
    /// Cross-node concurrency stays LWW.
    write_locks: DashMap<SubscriberId, Arc<Mutex<()>>>,
}

impl SubscriptionStore {
    pub fn new(store: Arc<dyn MetadataStore>, gate: AdmissionGate) -> Self {
        Self {
            store,
            gate,
            write_locks: DashMap::new(),
        }
    }

    fn write_lock(&self, id: &SubscriberId) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn get(&self, id: &SubscriberId) -> Result<HashSet<Subscription>> {
        let _token = self.gate.try_token()?;
        self.store.get(id).await
    }

    pub async fn put(&self, id: &SubscriberId, set: HashSet<Subscription>) -> Result<()> {
        let _token = self.gate.try_token()?;
        self.store.put(id, set).await
    }

    /// Read-modify-write under a single admission token.
    ///
    /// Returns the record as written. `Overloaded` surfaces to the caller.
    pub async fn update<F>(&self, id: &SubscriberId, f: F) -> Result<HashSet<Subscription>>
    where
        F: FnOnce(HashSet<Subscription>) -> HashSet<Subscription>,
    {
        let lock = self.write_lock(id);
        let _serialized = lock.lock().await;
        let _token = self.gate.try_token()?;
        let current = self.store.get(id).await?;
        let next = f(current);
        self.store.put(id, next.clone()).await?;
        Ok(next)
    }

    /// Like [`update`](Self::update) but retries the admission gate with the
    /// configured backoff until a token is available.
    pub async fn update_retrying<F>(
        &self,
        id: &SubscriberId,
        f: F,
    ) -> Result<HashSet<Subscription>>
    where
        F: Fn(HashSet<Subscription>) -> HashSet<Subscription>,
    {
        let lock = self.write_lock(id);
        let _serialized = lock.lock().await;
        let _token = self.gate.token_retrying().await;
        let current = self.store.get(id).await?;
        let next = f(current);
        self.store.put(id, next.clone()).await?;
        Ok(next)
    }

    pub async fn delete(&self, id: &SubscriberId) -> Result<()> {
        let lock = self.write_lock(id);
        let _serialized = lock.lock().await;
        let _token = self.gate.try_token()?;
        self.store.delete(id).await
    }

    /// Tombstone the record, retrying on admission saturation. Used by the
    /// clean-session teardown that must eventually succeed.
    pub async fn delete_retrying(&self, id: &SubscriberId) -> Result<()> {
        let lock = self.write_lock(id);
        let _serialized = lock.lock().await;
        let _token = self.gate.token_retrying().await;
        self.store.delete(id).await
    }

    pub async fn fold(
        &self,
        f: &mut (dyn FnMut(&SubscriberId, &HashSet<Subscription>) + Send),
    ) -> Result<()> {
        let _token = self.gate.try_token()?;
        self.store.fold(f).await
    }

    /// Number of live subscription records.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Derive a stream of [`SubscriptionEvent`]s from the raw store events.
    ///
    /// The consuming task runs until the store or the receiver goes away.
    /// A lagging receiver drops intermediate events; consumers treat the
    /// stream as best-effort and converge via set semantics.
    pub fn subscribe_changes(&self) -> mpsc::UnboundedReceiver<SubscriptionEvent> {
        let mut raw = self.store.watch();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let event = match raw.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "subscription change stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let derived = match (event.old, event.new) {
                    // tombstone/absent transitions carry no information
                    (None, None) => continue,
                    (Some(old), None) => SubscriptionEvent::Deleted { id: event.id, old },
                    (old, Some(new)) => {
                        let old = old.unwrap_or_default();
                        let removed: HashSet<Subscription> =
                            old.difference(&new).cloned().collect();
                        let added: HashSet<Subscription> =
                            new.difference(&old).cloned().collect();
                        if removed.is_empty() && added.is_empty() {
                            continue;
                        }
                        SubscriptionEvent::Updated {
                            id: event.id,
                            removed,
                            added,
                        }
                    }
                };

                if tx.send(derived).is_err() {
                    break;
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::InMemoryMetadataStore;
    use crate::protocol::{QoS, Topic};
    use std::time::Duration;

    fn sub(topic: &str, qos: QoS, node: u32) -> Subscription {
        Subscription {
            topic: Topic::parse(topic).unwrap(),
            qos,
            node,
        }
    }

    fn store() -> SubscriptionStore {
        SubscriptionStore::new(
            Arc::new(InMemoryMetadataStore::new()),
            AdmissionGate::new(16, Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn test_update_merges_under_one_token() {
        let store = store();
        let id = SubscriberId::new("", "c1");

        store
            .update(&id, |mut set| {
                set.insert(sub("a", QoS::AtMostOnce, 0));
                set
            })
            .await
            .unwrap();
        let merged = store
            .update(&id, |mut set| {
                set.insert(sub("b", QoS::AtLeastOnce, 0));
                set
            })
            .await
            .unwrap();

        assert_eq!(merged.len(), 2);
        assert_eq!(store.get(&id).await.unwrap(), merged);
    }

    #[tokio::test]
    async fn test_overload_surfaces_from_update() {
        let store = SubscriptionStore::new(
            Arc::new(InMemoryMetadataStore::new()),
            AdmissionGate::new(1, Duration::from_millis(10)),
        );
        let id = SubscriberId::new("", "c1");

        let _held = store.gate().try_token().unwrap();
        let err = store.update(&id, |set| set).await.unwrap_err();
        assert!(matches!(err, crate::DriftmqError::Overloaded));
    }

    #[tokio::test]
    async fn test_change_stream_diffs_updates() {
        let store = store();
        let id = SubscriberId::new("", "c1");
        let mut changes = store.subscribe_changes();

        let a = sub("a", QoS::AtMostOnce, 0);
        let b = sub("b", QoS::AtLeastOnce, 0);

        store
            .put(&id, [a.clone()].into_iter().collect())
            .await
            .unwrap();
        store
            .put(&id, [b.clone()].into_iter().collect())
            .await
            .unwrap();

        match changes.recv().await.unwrap() {
            SubscriptionEvent::Updated { added, removed, .. } => {
                assert_eq!(added, [a.clone()].into_iter().collect());
                assert!(removed.is_empty());
            }
            other => panic!("unexpected event {:?}", other),
        }
        match changes.recv().await.unwrap() {
            SubscriptionEvent::Updated { added, removed, .. } => {
                assert_eq!(added, [b].into_iter().collect());
                assert_eq!(removed, [a].into_iter().collect());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_change_stream_suppresses_tombstone_absent() {
        let store = store();
        let id = SubscriberId::new("", "c1");
        let mut changes = store.subscribe_changes();

        // Delete of an absent record: no event
        store.delete(&id).await.unwrap();

        // A real write afterwards is observed first
        let a = sub("a", QoS::AtMostOnce, 0);
        store
            .put(&id, [a.clone()].into_iter().collect())
            .await
            .unwrap();
        store.delete(&id).await.unwrap();

        match changes.recv().await.unwrap() {
            SubscriptionEvent::Updated { added, .. } => {
                assert_eq!(added, [a.clone()].into_iter().collect());
            }
            other => panic!("unexpected event {:?}", other),
        }
        match changes.recv().await.unwrap() {
            SubscriptionEvent::Deleted { old, .. } => {
                assert_eq!(old, [a].into_iter().collect());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

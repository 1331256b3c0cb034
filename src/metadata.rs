//! Replicated metadata store seam.
//!
//! The registry reads and writes subscription records through the
//! [`MetadataStore`] trait. A real deployment backs it with a replicated
//! store that resolves concurrent writes last-writer-wins at read time;
//! [`InMemoryMetadataStore`] provides the same contract for single-node
//! operation and tests, including tombstones and versioned LWW merges.
//!
//! Readers treat tombstones and absent keys identically: both read as an
//! empty record.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::protocol::{SubscriberId, Subscription};
use crate::Result;

/// Raw change event emitted by the store on every effective mutation.
///
/// `None` stands for both tombstone and absent; the subscription adapter
/// diffs `old`/`new` into higher-level events.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub id: SubscriberId,
    pub old: Option<HashSet<Subscription>>,
    pub new: Option<HashSet<Subscription>>,
}

/// Interface to the replicated metadata store.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read the record for `id`. Absent and tombstoned records read as empty.
    async fn get(&self, id: &SubscriberId) -> Result<HashSet<Subscription>>;

    /// Full-replacement write of the record for `id`.
    async fn put(&self, id: &SubscriberId, set: HashSet<Subscription>) -> Result<()>;

    /// Tombstone the record for `id`.
    async fn delete(&self, id: &SubscriberId) -> Result<()>;

    /// Iterate all live (non-tombstone) records.
    async fn fold(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a SubscriberId, &'a HashSet<Subscription>) + Send),
    ) -> Result<()>;

    /// Subscribe to raw change events.
    fn watch(&self) -> broadcast::Receiver<StoreEvent>;

    /// Number of live records.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    /// `None` is the tombstone sentinel.
    value: Option<HashSet<Subscription>>,
    version: u64,
}

/// In-memory metadata store with versioned last-writer-wins resolution.
#[derive(Debug)]
pub struct InMemoryMetadataStore {
    entries: DashMap<SubscriberId, StoredEntry>,
    clock: AtomicU64,
    events: broadcast::Sender<StoreEvent>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            entries: DashMap::new(),
            clock: AtomicU64::new(1),
            events,
        }
    }

    fn next_version(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Apply a versioned write, keeping the newer entry (LWW). Returns the
    /// previous live value when the write took effect.
    fn apply(
        &self,
        id: &SubscriberId,
        value: Option<HashSet<Subscription>>,
        version: u64,
    ) -> Option<Option<HashSet<Subscription>>> {
        let mut entry = self
            .entries
            .entry(id.clone())
            .or_insert_with(|| StoredEntry {
                value: None,
                version: 0,
            });
        if version <= entry.version {
            // A newer write already won.
            return None;
        }
        let old = entry.value.clone();
        entry.value = value;
        entry.version = version;
        Some(old)
    }

    fn emit(&self, id: &SubscriberId, old: Option<HashSet<Subscription>>, new: Option<HashSet<Subscription>>) {
        let _ = self.events.send(StoreEvent {
            id: id.clone(),
            old,
            new,
        });
    }

    /// Merge a record replicated from a peer, resolving by version.
    /// Exposed for store implementations that gossip entries directly.
    pub fn merge(
        &self,
        id: &SubscriberId,
        value: Option<HashSet<Subscription>>,
        version: u64,
    ) {
        if let Some(old) = self.apply(id, value.clone(), version) {
            self.emit(id, old, value);
        }
        let current = self.clock.load(Ordering::Relaxed);
        if version >= current {
            self.clock.store(version + 1, Ordering::Relaxed);
        }
    }
}

impl Default for InMemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn get(&self, id: &SubscriberId) -> Result<HashSet<Subscription>> {
        Ok(self
            .entries
            .get(id)
            .and_then(|e| e.value.clone())
            .unwrap_or_default())
    }

    async fn put(&self, id: &SubscriberId, set: HashSet<Subscription>) -> Result<()> {
        let version = self.next_version();
        if let Some(old) = self.apply(id, Some(set.clone()), version) {
            self.emit(id, old, Some(set));
        }
        Ok(())
    }

    async fn delete(&self, id: &SubscriberId) -> Result<()> {
        let version = self.next_version();
        if let Some(old) = self.apply(id, None, version) {
            self.emit(id, old, None);
        }
        Ok(())
    }

    async fn fold(
        &self,
        f: &mut (dyn for<'a> FnMut(&'a SubscriberId, &'a HashSet<Subscription>) + Send),
    ) -> Result<()> {
        for entry in self.entries.iter() {
            let key = entry.key().clone();
            let value = entry.value.clone();
            if let Some(value) = value {
                f(&key, &value);
            }
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.value.is_some())
            .count()
    }
}

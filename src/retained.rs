//! Retained message store seam.
//!
//! Retained messages live with a collaborator addressed through the
//! [`RetainedStore`] trait. An empty payload is a delete; `match_fold`
//! walks every retained message whose topic matches a subscription filter
//! under MQTT wildcard rules, which drives retained replay on subscribe.

use bytes::Bytes;
use dashmap::DashMap;

use crate::protocol::Topic;

/// Interface to the retained message store.
pub trait RetainedStore: Send + Sync {
    /// Store the retained payload for `(mountpoint, topic)`.
    fn insert(&self, mountpoint: &str, topic: &Topic, payload: Bytes);

    /// Remove the retained record for `(mountpoint, topic)`.
    fn delete(&self, mountpoint: &str, topic: &Topic);

    /// Visit every retained `(topic, payload)` within `mountpoint` whose
    /// topic matches `filter`.
    fn match_fold(
        &self,
        mountpoint: &str,
        filter: &Topic,
        visit: &mut dyn FnMut(&Topic, &Bytes),
    );

    /// Number of retained records across all mountpoints.
    fn size(&self) -> usize;
}

/// In-memory retained store.
///
/// Matching scans the mountpoint's records linearly; an indexed
/// implementation can be swapped in behind the trait.
#[derive(Debug, Default)]
pub struct InMemoryRetainedStore {
    entries: DashMap<(String, String), (Topic, Bytes)>,
}

impl InMemoryRetainedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RetainedStore for InMemoryRetainedStore {
    fn insert(&self, mountpoint: &str, topic: &Topic, payload: Bytes) {
        if payload.is_empty() {
            self.delete(mountpoint, topic);
            return;
        }
        self.entries.insert(
            (mountpoint.to_string(), topic.to_string()),
            (topic.clone(), payload),
        );
    }

    fn delete(&self, mountpoint: &str, topic: &Topic) {
        self.entries
            .remove(&(mountpoint.to_string(), topic.to_string()));
    }

    fn match_fold(
        &self,
        mountpoint: &str,
        filter: &Topic,
        visit: &mut dyn FnMut(&Topic, &Bytes),
    ) {
        for entry in self.entries.iter() {
            if entry.key().0 != mountpoint {
                continue;
            }
            let (topic, payload) = entry.value();
            if filter.matches(topic) {
                visit(topic, payload);
            }
        }
    }

    fn size(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(s: &str) -> Topic {
        Topic::parse(s).unwrap()
    }

    fn collect(store: &InMemoryRetainedStore, mountpoint: &str, filter: &str) -> Vec<(String, Bytes)> {
        let mut hits = Vec::new();
        store.match_fold(mountpoint, &topic(filter), &mut |t, p| {
            hits.push((t.to_string(), p.clone()));
        });
        hits.sort();
        hits
    }

    #[test]
    fn test_insert_and_match() {
        let store = InMemoryRetainedStore::new();
        store.insert("", &topic("sensors/temp"), Bytes::from_static(b"21"));
        store.insert("", &topic("sensors/hum"), Bytes::from_static(b"40"));

        let hits = collect(&store, "", "sensors/+");
        assert_eq!(hits.len(), 2);
        assert_eq!(store.size(), 2);

        let hits = collect(&store, "", "sensors/temp");
        assert_eq!(hits, vec![("sensors/temp".to_string(), Bytes::from_static(b"21"))]);
    }

    #[test]
    fn test_empty_payload_deletes() {
        let store = InMemoryRetainedStore::new();
        store.insert("", &topic("t"), Bytes::from_static(b"x"));
        assert_eq!(store.size(), 1);

        store.insert("", &topic("t"), Bytes::new());
        assert_eq!(store.size(), 0);
        assert!(collect(&store, "", "t").is_empty());
    }

    #[test]
    fn test_mountpoints_are_isolated() {
        let store = InMemoryRetainedStore::new();
        store.insert("tenant-a", &topic("t"), Bytes::from_static(b"a"));
        store.insert("tenant-b", &topic("t"), Bytes::from_static(b"b"));

        let hits = collect(&store, "tenant-a", "#");
        assert_eq!(hits, vec![("t".to_string(), Bytes::from_static(b"a"))]);
    }

    #[test]
    fn test_delete_removes_record() {
        let store = InMemoryRetainedStore::new();
        store.insert("", &topic("a/b"), Bytes::from_static(b"x"));
        store.delete("", &topic("a/b"));
        assert_eq!(store.size(), 0);
    }
}

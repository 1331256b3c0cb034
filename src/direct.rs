//! Direct registry access for host plugins.
//!
//! Plugins running inside the broker can publish and subscribe without an
//! MQTT connection. A [`DirectClient`] binds a synthetic subscriber id
//! derived from a stable hash of the plugin name and drives the registry on
//! its behalf; registering spawns a consuming loop that translates queue
//! deliveries into callback invocations.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::{Publish, QoS, SessionEvent, SubscriberId, Topic};
use crate::queue::QueueHandle;
use crate::registry::{RegisterOpts, Registry};
use crate::Result;

/// In-process registry client bound to a derived subscriber id.
pub struct DirectClient {
    registry: Arc<Registry>,
    id: SubscriberId,
    trade_consistency: bool,
}

impl DirectClient {
    /// Create a client for the plugin `name`. The same name always maps to
    /// the same subscriber id.
    pub fn new(registry: Arc<Registry>, name: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let id = SubscriberId::new("", format!("direct-{:016x}", hasher.finish()));
        let trade_consistency = registry.config().trade_consistency;
        Self {
            registry,
            id,
            trade_consistency,
        }
    }

    pub fn subscriber_id(&self) -> &SubscriberId {
        &self.id
    }

    /// Register the synthetic session. Deliveries are handed to
    /// `on_deliver` from a dedicated consuming task.
    pub async fn register<F>(&self, mut on_deliver: F) -> Result<QueueHandle>
    where
        F: FnMut(QoS, Publish) + Send + 'static,
    {
        let (session, mut events) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let SessionEvent::Deliver { qos, publish } = event {
                    on_deliver(qos, publish);
                }
            }
        });
        self.registry
            .register_subscriber(session, &self.id, false, RegisterOpts::default())
            .await
    }

    pub async fn publish(&self, routing_key: Topic, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        let publish = Publish::new("", routing_key, payload)
            .with_qos(qos)
            .with_retain(retain);
        self.registry.publish(self.trade_consistency, publish).await
    }

    pub async fn subscribe(&self, topics: Vec<(Topic, QoS)>) -> Result<()> {
        self.registry
            .subscribe(self.trade_consistency, None, &self.id, topics)
            .await
    }

    pub async fn unsubscribe(&self, topics: Vec<Topic>) -> Result<()> {
        self.registry
            .unsubscribe(self.trade_consistency, None, &self.id, topics)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_derived_id_is_stable() {
        let registry = Registry::new(RegistryConfig::default()).unwrap();
        let a = DirectClient::new(registry.clone(), "bridge");
        let b = DirectClient::new(registry.clone(), "bridge");
        let c = DirectClient::new(registry, "other");

        assert_eq!(a.subscriber_id(), b.subscriber_id());
        assert_ne!(a.subscriber_id(), c.subscriber_id());
    }

    #[tokio::test]
    async fn test_direct_publish_subscribe_roundtrip() {
        let registry = Registry::new(RegistryConfig::default()).unwrap();
        let client = DirectClient::new(registry.clone(), "sys-bridge");

        let seen: Arc<Mutex<Vec<Publish>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client
            .register(move |_qos, publish| {
                sink.lock().unwrap().push(publish);
            })
            .await
            .unwrap();
        client
            .subscribe(vec![(Topic::parse("events/#").unwrap(), QoS::AtMostOnce)])
            .await
            .unwrap();

        // The routing view applies the subscription asynchronously
        let routable = Topic::parse("events/started").unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let mut matched = false;
            registry.reg_view().fold("", &routable, &mut |_| matched = true);
            if matched {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "view never updated");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        client
            .publish(
                routable,
                Bytes::from_static(b"up"),
                QoS::AtMostOnce,
                false,
            )
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "delivery never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].payload, Bytes::from_static(b"up"));
        assert_eq!(seen[0].routing_key.to_string(), "events/started");
    }
}

//! # DriftMQ Registry Core
//!
//! DriftMQ is a distributed MQTT broker; this crate is its registry core,
//! the subsystem that keeps subscribers, subscriptions and queues mutually
//! consistent under partition and churn. It is responsible for:
//!
//! - **Subscriber registry**: mapping each subscriber id to the process
//!   holding its outgoing message queue, with ownership handover when the
//!   same subscriber reconnects on a different node
//! - **Subscription table**: the cluster-wide, last-writer-wins replicated
//!   record set that routes published messages
//! - **Publish routing**: per-operation choice between availability-favoring
//!   and consistency-favoring delivery, retained-message handling, and
//!   local-versus-remote fan-out
//! - **Admission control**: a token bucket in front of every metadata
//!   mutation that sheds load instead of queueing
//!
//! ## Architecture Overview
//!
//! - [`registry`] - the public operations (subscribe, unsubscribe, publish,
//!   register_subscriber) plus the session table and its single-writer
//!   coordinator
//! - [`queue`] - per-subscriber queue actors buffering and fanning out
//!   deliveries
//! - [`routing`] - the topic-trie routing view over the subscription table
//! - [`metadata`] / [`subscriptions`] - the replicated metadata store seam
//!   and its admission-gated adapter
//! - [`retained`] - the retained-message store seam
//! - [`cluster`] - cluster membership, remote forwarding and the
//!   registration leader
//! - [`auth`] - authorization and event plugin chains
//! - [`metrics`] - lock-free operation counters
//!
//! The MQTT wire protocol, TLS and persistent message storage live outside
//! this crate; session front-ends drive the registry through
//! [`Registry`](registry::Registry) and receive deliveries over a
//! [`SessionRef`](protocol::SessionRef) channel.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use driftmq::config::RegistryConfig;
//! use driftmq::protocol::{Publish, QoS, SubscriberId, Topic};
//! use driftmq::registry::{RegisterOpts, Registry};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Registry::new(RegistryConfig::default())?;
//!
//!     let id = SubscriberId::new("", "client-1");
//!     let (session, mut deliveries) = tokio::sync::mpsc::unbounded_channel();
//!     registry
//!         .register_subscriber(session, &id, true, RegisterOpts::default())
//!         .await?;
//!     registry
//!         .subscribe(false, None, &id, vec![(Topic::parse("sensors/#")?, QoS::AtLeastOnce)])
//!         .await?;
//!
//!     registry
//!         .publish(
//!             false,
//!             Publish::new("", Topic::parse("sensors/temp")?, Bytes::from_static(b"21")),
//!         )
//!         .await?;
//!
//!     let event = deliveries.recv().await;
//!     println!("delivered: {:?}", event);
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod auth;
pub mod cluster;
pub mod config;
pub mod direct;
pub mod metadata;
pub mod metrics;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod retained;
pub mod routing;
pub mod subscriptions;

pub use config::RegistryConfig;
pub use direct::DirectClient;
pub use protocol::{NodeId, Publish, QoS, SessionEvent, SessionRef, SubscriberId, Subscription, Topic};
pub use registry::{ClientStats, RegisterOpts, Registry, RegistryBuilder};

use thiserror::Error;

/// DriftMQ registry error values.
///
/// Every registry operation either completes or returns one of these;
/// remote-publish failures and queue deaths are handled internally and
/// never surface here.
#[derive(Debug, Error)]
pub enum DriftmqError {
    /// The authorization chain refused the request.
    #[error("not allowed")]
    NotAllowed,

    /// The admission bucket is saturated; try again later.
    #[error("overloaded")]
    Overloaded,

    /// The cluster is not ready and the operation did not trade consistency.
    #[error("cluster not ready")]
    NotReady,

    /// No session or queue exists for the subscriber id.
    #[error("not found")]
    NotFound,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed topic or routing key.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// A cross-node operation failed. Logged and swallowed on
    /// fire-and-forget paths, surfaced on others.
    #[error("remote error: {0}")]
    Remote(String),

    /// Infrastructure failure inside the registry itself.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias used throughout the registry.
pub type Result<T> = std::result::Result<T, DriftmqError>;

//! Core protocol types shared across the registry.
//!
//! This module defines the identifiers and message shapes the registry
//! operates on:
//!
//! - [`SubscriberId`] - `(mountpoint, client_id)` pair keying both the
//!   replicated subscription table and the node-local session table
//! - [`Topic`] - a parsed topic as a list of levels, with MQTT wildcard
//!   matching for `+` and `#`
//! - [`Publish`] - an application message flowing through the router
//! - [`Subscription`] - one replicated subscription record entry
//! - [`SessionEvent`] / [`SessionRef`] - the delivery channel into a
//!   session front-end

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

use crate::{DriftmqError, Result};

/// Unique identifier for broker nodes.
pub type NodeId = u32;

/// Identifies an MQTT client within a routing namespace.
///
/// The mountpoint is a namespace prefix; messages only flow between
/// subscribers sharing a mountpoint. Equality is structural and the pair is
/// the primary key of the subscription store and the session table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId {
    pub mountpoint: String,
    pub client_id: String,
}

impl SubscriberId {
    pub fn new(mountpoint: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            client_id: client_id.into(),
        }
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mountpoint, self.client_id)
    }
}

/// MQTT quality-of-service level.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = DriftmqError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(DriftmqError::Config(format!("invalid QoS value {}", other))),
        }
    }
}

/// A topic, parsed into its levels.
///
/// Topic filters may contain the MQTT wildcards `+` (one level) and `#`
/// (remaining levels, last position only). Topic names used as routing keys
/// must not contain wildcards; callers check with [`Topic::has_wildcards`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(Vec<String>);

impl Topic {
    /// Parse a `/`-separated topic string.
    ///
    /// Empty levels are allowed per MQTT (`a//b` has three levels), but the
    /// topic as a whole must be non-empty, `#` must be the last level, and
    /// wildcards must stand alone within their level.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(DriftmqError::InvalidTopic("empty topic".to_string()));
        }
        let levels: Vec<String> = s.split('/').map(|l| l.to_string()).collect();
        for (i, level) in levels.iter().enumerate() {
            if level == "#" && i != levels.len() - 1 {
                return Err(DriftmqError::InvalidTopic(format!(
                    "'#' must be the last level in '{}'",
                    s
                )));
            }
            if level.len() > 1 && (level.contains('#') || level.contains('+')) {
                return Err(DriftmqError::InvalidTopic(format!(
                    "wildcard must occupy a whole level in '{}'",
                    s
                )));
            }
        }
        Ok(Topic(levels))
    }

    pub fn levels(&self) -> &[String] {
        &self.0
    }

    pub fn has_wildcards(&self) -> bool {
        self.0.iter().any(|l| l == "#" || l == "+")
    }

    /// Match a concrete topic name against this filter.
    ///
    /// Standard MQTT rules: `+` matches exactly one level, `#` matches all
    /// remaining levels. Names whose first level starts with `$` are not
    /// matched by wildcards at the root.
    pub fn matches(&self, name: &Topic) -> bool {
        let filter = &self.0;
        let topic = &name.0;

        if topic
            .first()
            .is_some_and(|l| l.starts_with('$'))
            && filter.first().is_some_and(|l| l == "#" || l == "+")
        {
            return false;
        }

        let mut fi = 0;
        let mut ti = 0;
        while fi < filter.len() {
            if filter[fi] == "#" {
                return true;
            }
            if ti >= topic.len() {
                return false;
            }
            if filter[fi] == "+" || filter[fi] == topic[ti] {
                fi += 1;
                ti += 1;
            } else {
                return false;
            }
        }
        ti == topic.len()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// One entry of a replicated subscription record.
///
/// The record for a subscriber id is an unordered set of these, unique by
/// the full `(topic, qos, node)` triple. `node` is the node responsible for
/// delivering matching publishes to the subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: Topic,
    pub qos: QoS,
    pub node: NodeId,
}

/// An application message routed by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publish {
    pub mountpoint: String,
    pub routing_key: Topic,
    pub payload: Bytes,
    pub retain: bool,
    pub qos: QoS,
    pub dup: bool,
}

impl Publish {
    pub fn new(mountpoint: impl Into<String>, routing_key: Topic, payload: Bytes) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            routing_key,
            payload,
            retain: false,
            qos: QoS::AtMostOnce,
            dup: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Events delivered from a queue to an attached session front-end.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session was attached to a queue. `queue_present` tells the
    /// front-end whether the queue existed before this registration.
    Attached { queue_present: bool },
    /// A message to deliver, with the subscription's QoS.
    Deliver { qos: QoS, publish: Publish },
}

/// Handle to a session front-end's mailbox.
pub type SessionRef = mpsc::UnboundedSender<SessionEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_parse_and_display() {
        let t = Topic::parse("sensors/room1/temp").unwrap();
        assert_eq!(t.levels().len(), 3);
        assert_eq!(t.to_string(), "sensors/room1/temp");

        // Empty levels are legal
        let t = Topic::parse("a//b").unwrap();
        assert_eq!(t.levels(), &["a", "", "b"]);

        assert!(Topic::parse("").is_err());
        assert!(Topic::parse("a/#/b").is_err());
        assert!(Topic::parse("a/b#").is_err());
        assert!(Topic::parse("a/b+c").is_err());
    }

    #[test]
    fn test_topic_exact_match() {
        let filter = Topic::parse("sensors/temp").unwrap();
        assert!(filter.matches(&Topic::parse("sensors/temp").unwrap()));
        assert!(!filter.matches(&Topic::parse("sensors/humidity").unwrap()));
        assert!(!filter.matches(&Topic::parse("sensors/temp/x").unwrap()));
    }

    #[test]
    fn test_topic_single_wildcard() {
        let filter = Topic::parse("sensors/+/temp").unwrap();
        assert!(filter.matches(&Topic::parse("sensors/room1/temp").unwrap()));
        assert!(filter.matches(&Topic::parse("sensors/room2/temp").unwrap()));
        assert!(!filter.matches(&Topic::parse("sensors/room1/humidity").unwrap()));
        assert!(!filter.matches(&Topic::parse("sensors/temp").unwrap()));
    }

    #[test]
    fn test_topic_multi_wildcard() {
        let filter = Topic::parse("sensors/#").unwrap();
        assert!(filter.matches(&Topic::parse("sensors/temp").unwrap()));
        assert!(filter.matches(&Topic::parse("sensors/room1/floor2/temp").unwrap()));
        assert!(!filter.matches(&Topic::parse("actuators/light").unwrap()));
    }

    #[test]
    fn test_dollar_topics_not_matched_by_root_wildcards() {
        let multi = Topic::parse("#").unwrap();
        let single = Topic::parse("+/status").unwrap();
        let sys = Topic::parse("$SYS/status").unwrap();
        assert!(!multi.matches(&sys));
        assert!(!single.matches(&sys));

        let explicit = Topic::parse("$SYS/status").unwrap();
        assert!(explicit.matches(&sys));
    }

    #[test]
    fn test_qos_try_from() {
        assert_eq!(QoS::try_from(0).unwrap(), QoS::AtMostOnce);
        assert_eq!(QoS::try_from(1).unwrap(), QoS::AtLeastOnce);
        assert_eq!(QoS::try_from(2).unwrap(), QoS::ExactlyOnce);
        assert!(QoS::try_from(3).is_err());
    }
}

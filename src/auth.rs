//! Authorization and event hook chains.
//!
//! Subscribe requests pass through a chain of [`AuthHook`]s with
//! first-decision-wins semantics (`all_till_ok`): a hook may accept the
//! request as-is, substitute the topic list, reject it, or pass to the next
//! hook. If every hook passes, the request is rejected. Event hooks are
//! best-effort notifications and cannot fail the operation.

use async_trait::async_trait;
use std::sync::Arc;

use crate::protocol::{QoS, SubscriberId, Topic};
use crate::{DriftmqError, Result};

/// Decision returned by an authorization hook.
#[derive(Debug, Clone)]
pub enum AuthDecision {
    /// Allow with the original topics.
    Ok,
    /// Allow, substituting the topic list.
    OkTopics(Vec<(Topic, QoS)>),
    /// Pass to the next hook in the chain.
    Next,
    /// Reject the request.
    Reject,
}

#[async_trait]
pub trait AuthHook: Send + Sync {
    async fn auth_on_subscribe(
        &self,
        user: Option<&str>,
        id: &SubscriberId,
        topics: &[(Topic, QoS)],
    ) -> AuthDecision;
}

#[async_trait]
pub trait EventHook: Send + Sync {
    async fn on_subscribe(&self, user: Option<&str>, id: &SubscriberId, topics: &[(Topic, QoS)]);
    async fn on_unsubscribe(&self, user: Option<&str>, id: &SubscriberId, topics: &[Topic]);
}

/// Hook that allows everything. Installed by default so a registry without
/// registered plugins remains open.
pub struct AllowAll;

#[async_trait]
impl AuthHook for AllowAll {
    async fn auth_on_subscribe(
        &self,
        _user: Option<&str>,
        _id: &SubscriberId,
        _topics: &[(Topic, QoS)],
    ) -> AuthDecision {
        AuthDecision::Ok
    }
}

/// Registered plugin hooks.
pub struct HookChain {
    auth: Vec<Arc<dyn AuthHook>>,
    events: Vec<Arc<dyn EventHook>>,
}

impl HookChain {
    /// An empty chain. With no auth hooks registered every subscribe is
    /// rejected; register [`AllowAll`] or use [`HookChain::default`] for an
    /// open registry.
    pub fn new() -> Self {
        Self {
            auth: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn register_auth_hook(mut self, hook: Arc<dyn AuthHook>) -> Self {
        self.auth.push(hook);
        self
    }

    pub fn register_event_hook(mut self, hook: Arc<dyn EventHook>) -> Self {
        self.events.push(hook);
        self
    }

    /// Run the auth chain. Returns `None` to keep the original topics or
    /// `Some` with the substituted list; `NotAllowed` when a hook rejects
    /// or no hook claims the request.
    pub async fn all_till_ok(
        &self,
        user: Option<&str>,
        id: &SubscriberId,
        topics: &[(Topic, QoS)],
    ) -> Result<Option<Vec<(Topic, QoS)>>> {
        for hook in &self.auth {
            match hook.auth_on_subscribe(user, id, topics).await {
                AuthDecision::Ok => return Ok(None),
                AuthDecision::OkTopics(substituted) => return Ok(Some(substituted)),
                AuthDecision::Reject => return Err(DriftmqError::NotAllowed),
                AuthDecision::Next => continue,
            }
        }
        Err(DriftmqError::NotAllowed)
    }

    pub async fn on_subscribe(
        &self,
        user: Option<&str>,
        id: &SubscriberId,
        topics: &[(Topic, QoS)],
    ) {
        for hook in &self.events {
            hook.on_subscribe(user, id, topics).await;
        }
    }

    pub async fn on_unsubscribe(&self, user: Option<&str>, id: &SubscriberId, topics: &[Topic]) {
        for hook in &self.events {
            hook.on_unsubscribe(user, id, topics).await;
        }
    }
}

impl Default for HookChain {
    fn default() -> Self {
        Self::new().register_auth_hook(Arc::new(AllowAll))
    }
}

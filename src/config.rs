//! Registry configuration.

use serde::{Deserialize, Serialize};

use crate::protocol::NodeId;
use crate::Result;

/// Configuration for a registry node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// This node's cluster-wide identifier.
    pub node_id: NodeId,
    /// When true, subscribe/unsubscribe/publish skip the cluster-readiness
    /// gate and favor availability over consistency.
    pub trade_consistency: bool,
    /// Buffer bound passed to newly created queues.
    pub max_queued_messages: usize,
    /// Default for the per-registration multiple-sessions flag.
    pub allow_multiple_sessions: bool,
    /// Default for the per-registration session-balancing flag.
    pub balance_sessions: bool,
    /// Size of the admission bucket guarding metadata mutations.
    pub max_inflight_metadata_ops: usize,
    /// Backoff between retries for operations that must eventually succeed
    /// when the admission bucket is saturated.
    pub retry_backoff_ms: u64,
    /// Per-node timeout for cross-node RPCs during session migration.
    pub remote_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            trade_consistency: false,
            max_queued_messages: 1000,
            allow_multiple_sessions: false,
            balance_sessions: false,
            max_inflight_metadata_ops: 128,
            retry_backoff_ms: 100,
            remote_timeout_ms: 5000,
        }
    }
}

impl RegistryConfig {
    /// Load configuration from `DRIFTMQ_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("DRIFTMQ"))
            .build()
            .map_err(|e| crate::DriftmqError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<RegistryConfig>()
            .map_err(|e| crate::DriftmqError::Config(e.to_string()))?;

        config.validate().map_err(crate::DriftmqError::Config)?;
        Ok(config)
    }

    /// Validate configuration bounds.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_inflight_metadata_ops == 0 {
            return Err("max_inflight_metadata_ops must be > 0".to_string());
        }
        if self.retry_backoff_ms == 0 {
            return Err("retry_backoff_ms must be > 0".to_string());
        }
        if self.remote_timeout_ms == 0 {
            return Err("remote_timeout_ms must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RegistryConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.trade_consistency);
        assert_eq!(config.max_queued_messages, 1000);
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let config = RegistryConfig {
            max_inflight_metadata_ops: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RegistryConfig {
            remote_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}

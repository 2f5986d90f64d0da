//! Engine Configuration
//!
//! Tunables for the subscription engine. Every field has a default so a
//! partial JSON document is enough to override a single value.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a [`SubscriptionEngine`](crate::subscriptions::SubscriptionEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of root node ids a single marker may watch.
    pub max_node_ids_per_marker: usize,

    /// Maximum total length of a marker's field match list.
    pub max_fields_len: usize,

    /// Channel capacity used by [`BroadcastSink`](crate::subscriptions::BroadcastSink).
    pub broadcast_capacity: usize,

    /// Log every published event at debug level.
    pub log_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_node_ids_per_marker: 64,
            max_fields_len: 4096,
            broadcast_capacity: 1024,
            log_events: false,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::invalid(format!("engine config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_node_ids_per_marker == 0 {
            return Err(Error::invalid("max_node_ids_per_marker must be at least 1"));
        }
        if self.broadcast_capacity == 0 {
            return Err(Error::invalid("broadcast_capacity must be at least 1"));
        }
        Ok(())
    }
}

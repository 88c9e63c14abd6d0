//! Runtime configuration.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Tunables for a [`Runtime`](crate::reactive::Runtime).
///
/// Every field has a default, so partial JSON documents are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on listener deliveries in one flush. Listeners that keep
    /// writing to what they observe hit this instead of spinning forever.
    pub max_flush_rounds: usize,

    /// Default for async nodes: show `Waiting` on invalidation instead of
    /// keeping the last `Success` visible.
    pub show_waiting: bool,

    /// Default undo depth for [`History`](crate::middleware::History).
    pub history_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_flush_rounds: 100_000,
            show_waiting: false,
            history_limit: 100,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

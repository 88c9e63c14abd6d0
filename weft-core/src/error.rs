//! Error types for the reactive engine.

use std::any::Any;

use thiserror::Error;

use crate::reactive::NodeInfo;

/// Errors surfaced by writes, batches and infrastructure.
///
/// Derivation failures are not in here: they are cached as values by
/// computed nodes and reported as `Status::Error` by async nodes.
#[derive(Error, Debug)]
pub enum ReactiveError {
    #[error("node {0} has been disposed")]
    Disposed(NodeInfo),

    #[error("dependency cycle detected while computing {0}")]
    Cycle(NodeInfo),

    #[error("middleware rejected write to {node}: {reason}")]
    Rejected { node: NodeInfo, reason: String },

    #[error("middleware replaced the value of {node} with a different type (expected {expected})")]
    TypeMismatch { node: NodeInfo, expected: &'static str },

    #[error("propagation did not settle after {0} deliveries")]
    Runaway(usize),

    #[error("the runtime owning this node has been dropped")]
    RuntimeDropped,

    #[error("history cannot be replayed while a batch is open")]
    ReplayInBatch,

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ReactiveError>;

/// A listener callback panicked while being notified.
#[derive(Error, Debug, Clone)]
#[error("listener on {node} panicked: {message}")]
pub struct ListenerError {
    node: NodeInfo,
    message: String,
}

impl ListenerError {
    pub(crate) fn from_panic(node: NodeInfo, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self { node, message }
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

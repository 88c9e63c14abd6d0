//! Node Identity and Graph Edges
//!
//! Every participant in the dependency graph (cell, computed, async computed)
//! has a [`NodeId`], an optional debug name and a [`Lifecycle`]. The graph
//! itself is stored on the nodes: a dependent keeps strong [`NodeRef`]s to
//! what it read, a dependency keeps weak handles back to its dependents.
//!
//! The two sides of an edge are expressed by the crate-private [`Source`]
//! and [`Dependent`] traits so that nodes of different value types can link
//! to each other.

use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeKind {
    /// A mutable leaf value.
    Cell,
    /// A synchronously derived value.
    Computed,
    /// A derived value whose computation can suspend.
    AsyncComputed,
}

/// Whether a node is pushing updates, pulling them, or gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    /// At least one listener is attached; changes propagate eagerly.
    Active,
    /// No listeners; derived values recompute lazily on read.
    Inactive,
    /// The node was disposed and no longer takes part in propagation.
    Disposed,
}

/// Read-only description of a node, handed to middleware and error hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    id: NodeId,
    name: Option<Rc<str>>,
    kind: NodeKind,
}

impl NodeInfo {
    pub(crate) fn new(kind: NodeKind, name: Option<Rc<str>>) -> Self {
        Self {
            id: NodeId::new(),
            name,
            kind,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            NodeKind::Cell => "cell",
            NodeKind::Computed => "computed",
            NodeKind::AsyncComputed => "async",
        };
        match &self.name {
            Some(name) => write!(f, "{name}{}", self.id),
            None => write!(f, "{kind}{}", self.id),
        }
    }
}

/// How far a derived node's cache may be behind its dependencies.
///
/// Ordered so that a stronger invalidation never gets downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Freshness {
    /// The cached value is up-to-date.
    Clean,
    /// Something upstream changed; direct dependencies must be checked.
    Check,
    /// A direct dependency changed; the node must recompute.
    Dirty,
}

/// The dependency side of an edge.
pub(crate) trait Source {
    fn info(&self) -> &NodeInfo;

    /// Link a dependent so it is invalidated when this node changes.
    fn add_dependent(&self, id: NodeId, dependent: Weak<dyn Dependent>);

    fn remove_dependent(&self, id: NodeId);

    /// An active dependent started relying on this node.
    fn retain(&self);

    /// An active dependent stopped relying on this node.
    fn release(&self);

    /// Bring the cached value up-to-date. Leaf nodes have nothing to do.
    fn refresh(&self);
}

/// The dependent side of an edge.
pub(crate) trait Dependent {
    fn invalidate(&self, level: Freshness);
}

/// A node with listener notifications waiting in the current epoch.
pub(crate) trait Deliver {
    fn deliver(&self);
}

/// Opaque, cloneable handle to any node in the graph.
///
/// This is what an [`Observer`](super::Observer) receives for every read.
#[derive(Clone)]
pub struct NodeRef(Rc<dyn Source>);

impl NodeRef {
    pub(crate) fn new(source: Rc<dyn Source>) -> Self {
        Self(source)
    }

    pub(crate) fn source(&self) -> &dyn Source {
        &*self.0
    }

    pub fn id(&self) -> NodeId {
        self.0.info().id()
    }

    pub fn info(&self) -> &NodeInfo {
        self.0.info()
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(self.info()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn info_display_prefers_name() {
        let named = NodeInfo::new(NodeKind::Cell, Some(Rc::from("count")));
        let anonymous = NodeInfo::new(NodeKind::Computed, None);

        assert!(named.to_string().starts_with("count#"));
        assert!(anonymous.to_string().starts_with("computed#"));
    }

    #[test]
    fn freshness_orders_by_severity() {
        assert!(Freshness::Clean < Freshness::Check);
        assert!(Freshness::Check < Freshness::Dirty);
    }
}

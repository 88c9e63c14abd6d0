//! Dependency Tracker
//!
//! Records which nodes a derived node read during its last run. Most
//! derivations read a handful of nodes, so entries live inline in a
//! `SmallVec`; past [`INLINE_CAPACITY`] entries the tracker spills into an
//! `IndexMap`, which keeps lookups constant-time for high fan-in nodes while
//! preserving read order.

use indexmap::IndexMap;
use smallvec::SmallVec;

use super::node::{NodeId, NodeRef};

/// Entries kept inline before switching to the hashed representation.
pub(crate) const INLINE_CAPACITY: usize = 8;

enum Storage {
    Inline(SmallVec<[NodeRef; INLINE_CAPACITY]>),
    Spilled(IndexMap<NodeId, NodeRef>),
}

pub(crate) struct Tracker {
    storage: Storage,
}

impl Tracker {
    pub(crate) fn new() -> Self {
        Self {
            storage: Storage::Inline(SmallVec::new()),
        }
    }

    /// Insert `node`, returning `false` if it was already tracked.
    pub(crate) fn insert(&mut self, node: NodeRef) -> bool {
        match &mut self.storage {
            Storage::Inline(entries) => {
                if entries.iter().any(|entry| entry.id() == node.id()) {
                    return false;
                }
                if entries.len() < INLINE_CAPACITY {
                    entries.push(node);
                    return true;
                }
                let mut spilled: IndexMap<NodeId, NodeRef> = entries
                    .drain(..)
                    .map(|entry| (entry.id(), entry))
                    .collect();
                spilled.insert(node.id(), node);
                self.storage = Storage::Spilled(spilled);
                true
            }
            Storage::Spilled(entries) => {
                let id = node.id();
                if entries.contains_key(&id) {
                    return false;
                }
                entries.insert(id, node);
                true
            }
        }
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        match &self.storage {
            Storage::Inline(entries) => entries.iter().any(|entry| entry.id() == id),
            Storage::Spilled(entries) => entries.contains_key(&id),
        }
    }

    pub(crate) fn len(&self) -> usize {
        match &self.storage {
            Storage::Inline(entries) => entries.len(),
            Storage::Spilled(entries) => entries.len(),
        }
    }

    /// Entries in the order they were first read.
    pub(crate) fn iter(&self) -> Box<dyn Iterator<Item = &NodeRef> + '_> {
        match &self.storage {
            Storage::Inline(entries) => Box::new(entries.iter()),
            Storage::Spilled(entries) => Box::new(entries.values()),
        }
    }

    pub(crate) fn to_vec(&self) -> Vec<NodeRef> {
        self.iter().cloned().collect()
    }

    /// Entries of `self` that `other` does not contain.
    pub(crate) fn difference(&self, other: &Tracker) -> Vec<NodeRef> {
        self.iter()
            .filter(|entry| !other.contains(entry.id()))
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn is_spilled(&self) -> bool {
        matches!(self.storage, Storage::Spilled(_))
    }

    pub(crate) fn clear(&mut self) {
        self.storage = Storage::Inline(SmallVec::new());
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new()
    }
}

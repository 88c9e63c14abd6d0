//! Listener Registry
//!
//! The shared base of every node: external listener callbacks, the weak
//! back-edges to dependent nodes, and the counters that decide whether the
//! node is in push (active) or pull (inactive) mode.
//!
//! A node is active while it has at least one listener, where active
//! dependent nodes count as listeners too. Activation therefore cascades
//! upstream: attaching a listener to the bottom of a chain activates every
//! node above it.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;
use serde::Serialize;

use super::node::{Dependent, Freshness, Lifecycle, NodeId, NodeInfo};
use super::runtime::Runtime;
use crate::error::ListenerError;

/// Handle returned by `add_listener`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

type Listener = Rc<dyn Fn()>;

/// Listener bookkeeping embedded in every node.
pub(crate) struct Notifier {
    info: NodeInfo,
    runtime: Runtime,
    listeners: RefCell<IndexMap<ListenerId, Listener>>,
    dependents: RefCell<IndexMap<NodeId, Weak<dyn Dependent>>>,
    active_dependents: Cell<usize>,
    /// Bumped on every observable change.
    version: Cell<u64>,
    /// Version the listeners last heard about.
    delivered: Cell<u64>,
    disposed: Cell<bool>,
}

impl Notifier {
    pub(crate) fn new(runtime: &Runtime, info: NodeInfo) -> Self {
        Self {
            info,
            runtime: runtime.clone(),
            listeners: RefCell::new(IndexMap::new()),
            dependents: RefCell::new(IndexMap::new()),
            active_dependents: Cell::new(0),
            version: Cell::new(0),
            delivered: Cell::new(0),
            disposed: Cell::new(false),
        }
    }

    pub(crate) fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub(crate) fn id(&self) -> NodeId {
        self.info.id()
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.borrow().len() + self.active_dependents.get()
    }

    /// Whether external callbacks are attached (as opposed to dependents).
    pub(crate) fn has_listeners(&self) -> bool {
        !self.listeners.borrow().is_empty()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.listener_count() > 0
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.get()
    }

    pub(crate) fn lifecycle(&self) -> Lifecycle {
        if self.is_disposed() {
            Lifecycle::Disposed
        } else if self.is_active() {
            Lifecycle::Active
        } else {
            Lifecycle::Inactive
        }
    }

    /// Register a callback. Returns the id and whether the node just became active.
    pub(crate) fn add_listener(&self, listener: Listener) -> (ListenerId, bool) {
        let was_active = self.is_active();
        if !self.has_listeners() {
            // New listeners only hear about changes made after they attach.
            self.delivered.set(self.version.get());
        }
        let id = ListenerId::next();
        self.listeners.borrow_mut().insert(id, listener);
        (id, !was_active)
    }

    /// Remove a callback. Returns whether it existed and whether the node just went inactive.
    pub(crate) fn remove_listener(&self, id: ListenerId) -> (bool, bool) {
        let removed = self.listeners.borrow_mut().shift_remove(&id).is_some();
        (removed, removed && !self.is_active())
    }

    /// Count an active dependent. Returns whether the node just became active.
    pub(crate) fn retain(&self) -> bool {
        let was_active = self.is_active();
        self.active_dependents.set(self.active_dependents.get() + 1);
        !was_active
    }

    /// Drop an active dependent. Returns whether the node just went inactive.
    pub(crate) fn release(&self) -> bool {
        let count = self.active_dependents.get();
        if count == 0 {
            return false;
        }
        self.active_dependents.set(count - 1);
        !self.is_active()
    }

    pub(crate) fn add_dependent(&self, id: NodeId, dependent: Weak<dyn Dependent>) {
        self.dependents.borrow_mut().insert(id, dependent);
    }

    pub(crate) fn remove_dependent(&self, id: NodeId) {
        self.dependents.borrow_mut().shift_remove(&id);
    }

    /// Push `level` into every live dependent, pruning dropped ones.
    pub(crate) fn invalidate_dependents(&self, level: Freshness) {
        let live: Vec<Rc<dyn Dependent>> = {
            let mut dependents = self.dependents.borrow_mut();
            dependents.retain(|_, weak| weak.strong_count() > 0);
            dependents.values().filter_map(Weak::upgrade).collect()
        };
        for dependent in live {
            dependent.invalidate(level);
        }
    }

    pub(crate) fn bump_version(&self) {
        self.version.set(self.version.get() + 1);
    }

    /// Fire listeners if something changed since they last ran.
    pub(crate) fn deliver(&self) {
        let version = self.version.get();
        if version == self.delivered.get() {
            return;
        }
        self.delivered.set(version);

        let listeners: Vec<Listener> = self.listeners.borrow().values().cloned().collect();
        tracing::trace!(node = %self.info, listeners = listeners.len(), "delivering");
        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener())) {
                let error = ListenerError::from_panic(self.info.clone(), payload);
                self.runtime.report_listener_error(&error);
            }
        }
    }

    /// Tear down for disposal. Returns whether the node was active.
    pub(crate) fn dispose(&self) -> bool {
        let was_active = self.is_active();
        self.disposed.set(true);
        self.listeners.borrow_mut().clear();
        was_active
    }
}

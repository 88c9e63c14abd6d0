//! Execution Context
//!
//! The execution context tracks which computation is currently running.
//! This enables automatic dependency tracking: when a node is read, the
//! current observer records it as a dependency.
//!
//! # Implementation
//!
//! Each [`Runtime`](super::Runtime) owns one context with a single
//! "current observer" slot. Entering a context swaps a new observer into the
//! slot and hands back an [`ObserverScope`]; dropping the scope puts the
//! previous occupant back. Nesting (a computed reading another computed)
//! falls out of the save/restore, and because restoration happens in `Drop`
//! the slot is also repaired when a derivation panics.

use std::cell::RefCell;
use std::rc::Rc;

use super::node::NodeRef;

/// Anything that wants to learn which nodes were read while it was current.
///
/// Computed nodes implement this internally. UI binding layers implement it
/// for auto-tracking regions.
pub trait Observer {
    /// Called once per read of `node` while this observer is current.
    fn record(&self, node: &NodeRef);
}

/// The current-observer slot of a runtime.
#[derive(Default)]
pub struct ExecutionContext {
    current: RefCell<Option<Rc<dyn Observer>>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `observer` current until the returned scope is dropped.
    pub fn enter(&self, observer: Rc<dyn Observer>) -> ObserverScope<'_> {
        let previous = self.current.replace(Some(observer));
        ObserverScope {
            context: self,
            previous,
        }
    }

    /// Run `f` with no observer, so its reads create no dependencies.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = ObserverScope {
            previous: self.current.replace(None),
            context: self,
        };
        f()
    }

    /// Check if there is an active observer.
    pub fn is_tracking(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// Get the current observer, if any.
    pub fn current(&self) -> Option<Rc<dyn Observer>> {
        self.current.borrow().clone()
    }

    /// Report a read of `node` to the current observer.
    pub fn record(&self, node: &NodeRef) {
        // Cloned out so the observer may itself enter nested scopes.
        if let Some(observer) = self.current() {
            observer.record(node);
        }
    }
}

/// Guard that restores the previous observer when dropped.
pub struct ObserverScope<'a> {
    context: &'a ExecutionContext,
    previous: Option<Rc<dyn Observer>>,
}

impl Drop for ObserverScope<'_> {
    fn drop(&mut self) {
        *self.context.current.borrow_mut() = self.previous.take();
    }
}

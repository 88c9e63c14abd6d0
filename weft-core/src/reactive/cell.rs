//! Cell Implementation
//!
//! A Cell is the leaf reactive primitive. It holds a value and knows which
//! computations depend on it.
//!
//! # How Cells Work
//!
//! 1. When a cell is read while an observer is current, the observer
//!    records the cell as a dependency.
//!
//! 2. A write goes through the middleware `on_set` chain. If nothing vetoes
//!    it, the value is stored and every dependent is invalidated.
//!
//! 3. Listeners hear about the write right away, or when the enclosing
//!    batch commits.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};

use super::batch::{ChangeRecord, Restore};
use super::listeners::{ListenerId, Notifier};
use super::node::{Deliver, Dependent, Freshness, Lifecycle, NodeId, NodeInfo, NodeKind, NodeRef, Source};
use super::runtime::Runtime;
use crate::error::{ReactiveError, Result};

/// A mutable reactive value.
///
/// # Example
///
/// ```rust
/// use weft_core::reactive::Runtime;
///
/// let rt = Runtime::new();
/// let count = rt.cell(0);
///
/// count.set(5).unwrap();
/// assert_eq!(count.get(), 5);
/// ```
pub struct Cell<T: Clone + 'static> {
    inner: Rc<CellInner<T>>,
}

struct CellInner<T: Clone + 'static> {
    this: Weak<CellInner<T>>,
    core: Notifier,
    value: RefCell<T>,
}

impl<T: Clone + 'static> Cell<T> {
    /// Create a new cell with the given initial value.
    pub fn new(runtime: &Runtime, value: T) -> Self {
        Self::build(runtime, None, value)
    }

    /// Create a cell with a debug name shown in logs and middleware.
    pub fn named(runtime: &Runtime, name: &str, value: T) -> Self {
        Self::build(runtime, Some(Rc::from(name)), value)
    }

    fn build(runtime: &Runtime, name: Option<Rc<str>>, value: T) -> Self {
        let info = NodeInfo::new(NodeKind::Cell, name);
        let inner = Rc::new_cyclic(|this| CellInner {
            this: this.clone(),
            core: Notifier::new(runtime, info),
            value: RefCell::new(value),
        });
        tracing::trace!(node = %inner.core.info(), "cell created");
        runtime.pipeline().init(inner.core.info());
        Self { inner }
    }

    pub fn id(&self) -> NodeId {
        self.inner.core.id()
    }

    pub fn info(&self) -> &NodeInfo {
        self.inner.core.info()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.core.lifecycle()
    }

    /// Listener callbacks plus active dependent nodes.
    pub fn listener_count(&self) -> usize {
        self.inner.core.listener_count()
    }

    /// Get the current value, recording the read with the current observer.
    pub fn get(&self) -> T {
        self.track();
        self.inner.value.borrow().clone()
    }

    /// Borrow the current value, recording the read.
    ///
    /// # Panics
    ///
    /// The value stays borrowed while `f` runs, so writing this cell from
    /// inside `f` panics. Use [`update`](Self::update) to derive a new value
    /// from the current one.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        let value = self.inner.value.borrow();
        f(&value)
    }

    /// Get the current value without establishing a dependency.
    pub fn get_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Set a new value and notify dependents.
    ///
    /// Fails if the cell was disposed or if middleware rejects the write.
    pub fn set(&self, value: T) -> Result<()> {
        let inner = &self.inner;
        let info = inner.core.info().clone();
        if inner.core.is_disposed() {
            tracing::warn!(node = %info, "write to disposed cell");
            return Err(ReactiveError::Disposed(info));
        }

        let runtime = inner.core.runtime().clone();
        let old = inner.value.borrow().clone();
        let mut change = ChangeRecord::new(info.clone(), old, value, runtime.batch_state().current_id());
        runtime
            .pipeline()
            .set(&info, &mut change, &mut |change: &mut ChangeRecord| inner.store(change))?;
        runtime.flush()
    }

    /// Update the value using a function of the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<()> {
        let next = {
            let current = self.inner.value.borrow();
            f(&current)
        };
        self.set(next)
    }

    /// Register a callback invoked after the value changes.
    pub fn add_listener(&self, listener: impl Fn() + 'static) -> ListenerId {
        let (id, activated) = self.inner.core.add_listener(Rc::new(listener));
        if activated {
            tracing::debug!(node = %self.info(), "cell activated");
        }
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let (removed, deactivated) = self.inner.core.remove_listener(id);
        if deactivated {
            tracing::debug!(node = %self.info(), "cell deactivated");
        }
        removed
    }

    /// Clear listeners and refuse further writes. Reads keep working.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.core.is_disposed() {
            return;
        }
        let runtime = inner.core.runtime().clone();
        runtime.pipeline().dispose(inner.core.info(), &mut || {
            inner.core.dispose();
            tracing::debug!(node = %inner.core.info(), "cell disposed");
        });
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.core.is_disposed()
    }

    pub(crate) fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.inner.clone())
    }

    fn track(&self) {
        let context = self.inner.core.runtime().context();
        if context.is_tracking() {
            context.record(&self.node_ref());
        }
    }
}

impl<T: Clone + 'static> CellInner<T> {
    /// The base setter at the end of the `on_set` chain.
    fn store(&self, change: &mut ChangeRecord) -> Result<()> {
        let info = self.core.info();
        if self.core.is_disposed() {
            return Err(ReactiveError::Disposed(info.clone()));
        }
        let value = change
            .new_value::<T>()
            .cloned()
            .ok_or_else(|| ReactiveError::TypeMismatch {
                node: info.clone(),
                expected: std::any::type_name::<T>(),
            })?;

        let old = self.value.replace(value.clone());
        change.set_restore(self.restore(old, value));
        change.mark_applied();

        let runtime = self.core.runtime();
        runtime.batch_state().push(change.clone());

        if change.is_propagation_stopped() {
            tracing::debug!(node = %info, "cell written silently");
            return Ok(());
        }
        tracing::debug!(node = %info, batch = ?change.batch_id(), "cell written");

        self.core.bump_version();
        self.core.invalidate_dependents(Freshness::Dirty);
        if self.core.has_listeners() {
            let this: Weak<dyn Deliver> = self.this.clone();
            runtime.enqueue(self.core.id(), this);
        }
        Ok(())
    }

    fn restore(&self, old: T, new: T) -> Restore {
        let undo_target = self.this.clone();
        let redo_target = self.this.clone();
        Restore::new(
            move || write_back(&undo_target, old.clone()),
            move || write_back(&redo_target, new.clone()),
        )
    }
}

/// A cell that no longer exists has nothing left to restore.
fn write_back<T: Clone + 'static>(target: &Weak<CellInner<T>>, value: T) -> Result<()> {
    match target.upgrade() {
        Some(inner) => Cell { inner }.set(value),
        None => Ok(()),
    }
}

impl<T: Clone + 'static> Source for CellInner<T> {
    fn info(&self) -> &NodeInfo {
        self.core.info()
    }

    fn add_dependent(&self, id: NodeId, dependent: Weak<dyn Dependent>) {
        self.core.add_dependent(id, dependent);
    }

    fn remove_dependent(&self, id: NodeId) {
        self.core.remove_dependent(id);
    }

    fn retain(&self) {
        if self.core.retain() {
            tracing::trace!(node = %self.core.info(), "cell activated by dependent");
        }
    }

    fn release(&self) {
        if self.core.release() {
            tracing::trace!(node = %self.core.info(), "cell released by dependents");
        }
    }

    fn refresh(&self) {}
}

impl<T: Clone + 'static> Deliver for CellInner<T> {
    fn deliver(&self) {
        self.core.deliver();
    }
}

impl<T: Clone + 'static> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Debug + 'static> Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("node", self.info())
            .field("value", &*self.inner.value.borrow())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

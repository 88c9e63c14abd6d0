//! Computed Implementation
//!
//! A Computed node is a cached derived value that re-evaluates only when one
//! of its dependencies changes.
//!
//! # How Computed Nodes Work
//!
//! 1. On first access the derivation runs with the node installed as the
//!    current observer, so every node it reads becomes a dependency.
//!
//! 2. When a direct dependency changes the node is marked `Dirty`; when
//!    something further upstream changes it is marked `Check`.
//!
//! 3. Without listeners (pull mode) nothing else happens until the next
//!    read. With listeners (push mode) the node is refreshed in the same
//!    propagation epoch.
//!
//! 4. Refreshing a `Check` node first refreshes its dependencies in read
//!    order; it only recomputes if one of them produced a different value.
//!
//! 5. After a run the dependency set is reconciled: nodes read for the
//!    first time are subscribed, nodes no longer read are dropped.
//!
//! # Derivation Errors
//!
//! A derivation that can fail returns a `Result`, and the `Result` is cached
//! like any other value. Reading never fails because of the derivation. A
//! derivation that panics unwinds to the reader; the execution context is
//! restored and the node stays dirty so the next read tries again.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug};
use std::rc::{Rc, Weak};

use super::context::Observer;
use super::listeners::{ListenerId, Notifier};
use super::node::{Deliver, Dependent, Freshness, Lifecycle, NodeId, NodeInfo, NodeKind, NodeRef, Source};
use super::runtime::Runtime;
use super::tracker::Tracker;
use crate::error::{ReactiveError, Result};

type Equality<T> = Rc<dyn Fn(&T, &T) -> bool>;

/// Construction options for [`Computed`].
pub struct ComputedOptions<T> {
    name: Option<Rc<str>>,
    equals: Option<Equality<T>>,
}

impl<T> ComputedOptions<T> {
    pub fn new() -> Self {
        Self {
            name: None,
            equals: None,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(Rc::from(name));
        self
    }

    /// Values the function reports as equal do not notify dependents.
    /// Without one, every recomputation counts as a change.
    pub fn equals(mut self, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equals = Some(Rc::new(equals));
        self
    }
}

impl<T> Default for ComputedOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A cached derived value that recomputes only when dependencies change.
///
/// # Example
///
/// ```rust
/// use weft_core::reactive::Runtime;
///
/// let rt = Runtime::new();
/// let a = rt.cell(1);
/// let b = rt.computed({
///     let a = a.clone();
///     move || a.get() * 2
/// });
///
/// assert_eq!(b.get(), 2);
/// a.set(5).unwrap();
/// assert!(b.is_dirty());
/// assert_eq!(b.get(), 10);
/// ```
pub struct Computed<T: Clone + 'static> {
    inner: Rc<ComputedInner<T>>,
}

struct ComputedInner<T: Clone + 'static> {
    this: Weak<ComputedInner<T>>,
    core: Notifier,
    derive: Box<dyn Fn() -> T>,
    equals: Equality<T>,
    value: RefCell<Option<T>>,
    freshness: Cell<Freshness>,
    computing: Cell<bool>,
    /// Dependencies currently subscribed to.
    tracker: RefCell<Tracker>,
    /// Reads of the run in progress.
    touched: RefCell<Tracker>,
    /// Whether the run in progress subscribed to anything new.
    grew: Cell<bool>,
    runs: Cell<u64>,
}

impl<T: Clone + 'static> Computed<T> {
    /// Create a computed node compared with `PartialEq`.
    ///
    /// The derivation is not run until the node is read or observed.
    pub fn new<F>(runtime: &Runtime, derive: F) -> Self
    where
        T: PartialEq,
        F: Fn() -> T + 'static,
    {
        Self::with_options(runtime, ComputedOptions::new().equals(|a: &T, b: &T| a == b), derive)
    }

    pub fn with_options<F>(runtime: &Runtime, options: ComputedOptions<T>, derive: F) -> Self
    where
        F: Fn() -> T + 'static,
    {
        let info = NodeInfo::new(NodeKind::Computed, options.name);
        let equals = options.equals.unwrap_or_else(|| Rc::new(|_: &T, _: &T| false));
        let inner = Rc::new_cyclic(|this| ComputedInner {
            this: this.clone(),
            core: Notifier::new(runtime, info),
            derive: Box::new(derive),
            equals,
            value: RefCell::new(None),
            freshness: Cell::new(Freshness::Dirty),
            computing: Cell::new(false),
            tracker: RefCell::new(Tracker::new()),
            touched: RefCell::new(Tracker::new()),
            grew: Cell::new(false),
            runs: Cell::new(0),
        });
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

    pub fn listener_count(&self) -> usize {
        self.inner.core.listener_count()
    }

    /// Get the current value, recomputing if necessary.
    ///
    /// # Panics
    ///
    /// Panics if called from inside this node's own derivation.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(err) => panic!("{err}"),
        }
    }

    /// Like [`get`](Self::get), but reports a dependency cycle as an error.
    pub fn try_get(&self) -> Result<T> {
        let inner = &self.inner;
        if inner.computing.get() {
            return Err(ReactiveError::Cycle(inner.core.info().clone()));
        }
        if inner.core.is_disposed() {
            return Ok(inner.disposed_value());
        }
        inner.refresh();
        self.track();
        Ok(inner.current())
    }

    /// Get the current value without establishing a dependency.
    pub fn get_untracked(&self) -> T {
        let runtime = self.inner.core.runtime().clone();
        runtime.untracked(|| self.get())
    }

    /// Whether the cached value may be stale.
    pub fn is_dirty(&self) -> bool {
        self.inner.freshness.get() != Freshness::Clean
    }

    /// Number of times the derivation has run.
    pub fn run_count(&self) -> u64 {
        self.inner.runs.get()
    }

    pub fn dependency_count(&self) -> usize {
        self.inner.tracker.borrow().len()
    }

    pub fn depends_on(&self, id: NodeId) -> bool {
        self.inner.tracker.borrow().contains(id)
    }

    /// Register a callback invoked after the value changes.
    ///
    /// The first listener switches the node to push mode: it is computed
    /// if needed and every dependency is activated.
    pub fn add_listener(&self, listener: impl Fn() + 'static) -> ListenerId {
        let inner = &self.inner;
        if !inner.core.is_active() {
            inner.refresh();
        }
        let (id, activated) = inner.core.add_listener(Rc::new(listener));
        if activated {
            inner.activate_dependencies();
        }
        id
    }

    /// Remove a listener. The last one switches the node back to pull mode;
    /// the cached value is kept.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let (removed, deactivated) = self.inner.core.remove_listener(id);
        if deactivated {
            self.inner.release_dependencies();
        }
        removed
    }

    /// Unsubscribe from all dependencies and drop listeners.
    pub fn dispose(&self) {
        let inner = &self.inner;
        if inner.core.is_disposed() {
            return;
        }
        let runtime = inner.core.runtime().clone();
        runtime.pipeline().dispose(inner.core.info(), &mut || inner.teardown());
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

impl<T: Clone + 'static> ComputedInner<T> {
    fn current(&self) -> T {
        let cached = self.value.borrow().clone();
        match cached {
            Some(value) => value,
            None => self.recompute(),
        }
    }

    fn disposed_value(&self) -> T {
        let cached = self.value.borrow().clone();
        match cached {
            Some(value) => value,
            None => self.core.runtime().untracked(|| (self.derive)()),
        }
    }

    fn refresh(&self) {
        if self.computing.get() || self.core.is_disposed() {
            return;
        }
        match self.freshness.get() {
            Freshness::Clean => {}
            Freshness::Check => {
                let dependencies = self.tracker.borrow().to_vec();
                for dependency in dependencies {
                    dependency.source().refresh();
                    if self.freshness.get() == Freshness::Dirty {
                        break;
                    }
                }
                if self.freshness.get() == Freshness::Dirty {
                    self.recompute();
                } else {
                    self.freshness.set(Freshness::Clean);
                }
            }
            Freshness::Dirty => {
                self.recompute();
            }
        }
    }

    /// Run the derivation, reconcile dependencies and notify on change.
    fn recompute(&self) -> T {
        let runtime = self.core.runtime();
        self.computing.set(true);
        self.freshness.set(Freshness::Clean);
        self.touched.borrow_mut().clear();
        self.grew.set(false);

        let guard = RunGuard { node: self };
        let value = match self.this.upgrade() {
            Some(this) => {
                let observer: Rc<dyn Observer> = this;
                let _scope = runtime.context().enter(observer);
                (self.derive)()
            }
            None => runtime.untracked(|| (self.derive)()),
        };
        drop(guard);

        self.runs.set(self.runs.get() + 1);
        self.reconcile();

        let changed = match self.value.borrow().as_ref() {
            Some(old) => !(self.equals)(old, &value),
            None => true,
        };
        *self.value.borrow_mut() = Some(value.clone());

        if changed {
            tracing::trace!(node = %self.core.info(), "recomputed");
            self.core.bump_version();
            self.core.invalidate_dependents(Freshness::Dirty);
        } else {
            tracing::trace!(node = %self.core.info(), "recomputed to an equal value");
        }
        value
    }

    fn reconcile(&self) {
        let touched = std::mem::take(&mut *self.touched.borrow_mut());
        let stale = self.tracker.borrow().difference(&touched);
        let active = self.core.is_active();
        for dependency in &stale {
            dependency.source().remove_dependent(self.core.id());
            if active {
                dependency.source().release();
            }
        }
        *self.tracker.borrow_mut() = touched;

        if self.grew.get() || !stale.is_empty() {
            let dependencies: Vec<NodeInfo> = self
                .tracker
                .borrow()
                .iter()
                .map(|dependency| dependency.info().clone())
                .collect();
            tracing::trace!(
                node = %self.core.info(),
                dependencies = dependencies.len(),
                dropped = stale.len(),
                "dependencies changed"
            );
            self.core.runtime().pipeline().graph_change(self.core.info(), &dependencies);
        }
    }

    fn activate_dependencies(&self) {
        tracing::debug!(node = %self.core.info(), "computed activated");
        for dependency in self.tracker.borrow().to_vec() {
            dependency.source().retain();
        }
    }

    fn release_dependencies(&self) {
        tracing::debug!(node = %self.core.info(), "computed deactivated");
        for dependency in self.tracker.borrow().to_vec() {
            dependency.source().release();
        }
    }

    fn teardown(&self) {
        let was_active = self.core.dispose();
        let dependencies = std::mem::take(&mut *self.tracker.borrow_mut());
        for dependency in dependencies.iter() {
            dependency.source().remove_dependent(self.core.id());
            if was_active {
                dependency.source().release();
            }
        }
        tracing::debug!(node = %self.core.info(), "computed disposed");
    }
}

/// Ends a run; a panicking derivation leaves the node dirty.
struct RunGuard<'a, T: Clone + 'static> {
    node: &'a ComputedInner<T>,
}

impl<T: Clone + 'static> Drop for RunGuard<'_, T> {
    fn drop(&mut self) {
        self.node.computing.set(false);
        if std::thread::panicking() {
            self.node.freshness.set(Freshness::Dirty);
        }
    }
}

impl<T: Clone + 'static> Observer for ComputedInner<T> {
    fn record(&self, node: &NodeRef) {
        if node.id() == self.core.id() {
            return;
        }
        if !self.touched.borrow_mut().insert(node.clone()) {
            return;
        }
        let subscribed = self.tracker.borrow_mut().insert(node.clone());
        if subscribed {
            self.grew.set(true);
            let this: Weak<dyn Dependent> = self.this.clone();
            node.source().add_dependent(self.core.id(), this);
            if self.core.is_active() {
                node.source().retain();
            }
        }
    }
}

impl<T: Clone + 'static> Dependent for ComputedInner<T> {
    fn invalidate(&self, level: Freshness) {
        // Dependencies refreshed by our own reads report changes we are
        // about to observe anyway.
        if self.core.is_disposed() || self.computing.get() {
            return;
        }
        let previous = self.freshness.get();
        if level <= previous {
            return;
        }
        self.freshness.set(level);
        if previous == Freshness::Clean {
            if self.core.is_active() {
                let this: Weak<dyn Deliver> = self.this.clone();
                self.core.runtime().enqueue(self.core.id(), this);
            }
            self.core.invalidate_dependents(Freshness::Check);
        }
    }
}

impl<T: Clone + 'static> Source for ComputedInner<T> {
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
        if !self.core.is_active() {
            self.refresh();
        }
        if self.core.retain() {
            self.activate_dependencies();
        }
    }

    fn release(&self) {
        if self.core.release() {
            self.release_dependencies();
        }
    }

    fn refresh(&self) {
        ComputedInner::refresh(self);
    }
}

impl<T: Clone + 'static> Deliver for ComputedInner<T> {
    fn deliver(&self) {
        self.refresh();
        self.core.deliver();
    }
}

impl<T: Clone + 'static> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        let active = self.core.is_active();
        for dependency in self.tracker.get_mut().iter() {
            dependency.source().remove_dependent(self.core.id());
            if active {
                dependency.source().release();
            }
        }
    }
}

impl<T: Clone + 'static> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Debug + 'static> Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("node", self.info())
            .field("value", &*self.inner.value.borrow())
            .field("dirty", &self.is_dirty())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

//! Async Computed Implementation
//!
//! An async computed node derives its value from a future. Reads made while
//! the future is being built, and reads made in any later poll, register as
//! dependencies of the run that produced the future.
//!
//! Every run is an [`AsyncRun`] task object holding the node and a run
//! generation. The future is wrapped in [`Tracked`], which reinstalls the run
//! as the current observer for each poll. Invalidating the node bumps the
//! generation: older runs keep running to completion, but their reads and
//! their results are ignored.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::error::Error;
use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures_util::future::{FutureExt, LocalBoxFuture};

use super::context::Observer;
use super::listeners::{ListenerId, Notifier};
use super::node::{Deliver, Dependent, Freshness, Lifecycle, NodeId, NodeInfo, NodeKind, NodeRef, Source};
use super::runtime::Runtime;
use super::status::Status;
use super::tracker::Tracker;

/// An error and the backtrace taken in the poll that produced it.
type Failure = (Rc<dyn Error>, Rc<Backtrace>);
type Outcome<T> = std::result::Result<T, Failure>;
type Derive<T> = Box<dyn Fn() -> LocalBoxFuture<'static, Outcome<T>>>;
type Equality<T> = Rc<dyn Fn(&T, &T) -> bool>;

/// Construction options for [`AsyncComputed`].
pub struct AsyncOptions<T> {
    name: Option<Rc<str>>,
    equals: Option<Equality<T>>,
    show_waiting: Option<bool>,
}

impl<T> AsyncOptions<T> {
    pub fn new() -> Self {
        Self {
            name: None,
            equals: None,
            show_waiting: None,
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(Rc::from(name));
        self
    }

    /// Successive `Success` values the function reports as equal do not
    /// notify. Without one, every settled run counts as a change.
    pub fn equals(mut self, equals: impl Fn(&T, &T) -> bool + 'static) -> Self {
        self.equals = Some(Rc::new(equals));
        self
    }

    /// Switch to `Waiting` as soon as a new run starts instead of keeping the
    /// previous `Success` visible. Defaults to `RuntimeConfig::show_waiting`.
    pub fn show_waiting(mut self, show_waiting: bool) -> Self {
        self.show_waiting = Some(show_waiting);
        self
    }
}

impl<T> Default for AsyncOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A derived value computed by a future.
///
/// Futures are handed to the runtime's spawner, which by default is
/// `tokio::task::spawn_local`; use the node from inside a `LocalSet`.
pub struct AsyncComputed<T: Clone + 'static> {
    inner: Rc<AsyncInner<T>>,
}

struct AsyncInner<T: Clone + 'static> {
    this: Weak<AsyncInner<T>>,
    core: Notifier,
    derive: Derive<T>,
    equals: Equality<T>,
    show_waiting: bool,
    status: RefCell<Status<T>>,
    freshness: Cell<Freshness>,
    /// Set while the current run builds or polls its future.
    evaluating: Cell<bool>,
    /// Generation of the only run allowed to settle.
    generation: Cell<u64>,
    tracker: RefCell<Tracker>,
    grew: Cell<bool>,
    runs: Cell<u64>,
}

impl<T: Clone + 'static> AsyncComputed<T> {
    /// Create an async node compared with `PartialEq`.
    pub fn new<E, F, Fut>(runtime: &Runtime, derive: F) -> Self
    where
        T: PartialEq,
        E: Error + 'static,
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + 'static,
    {
        Self::with_options(runtime, AsyncOptions::new().equals(|a: &T, b: &T| a == b), derive)
    }

    pub fn with_options<E, F, Fut>(runtime: &Runtime, options: AsyncOptions<T>, derive: F) -> Self
    where
        E: Error + 'static,
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + 'static,
    {
        let info = NodeInfo::new(NodeKind::AsyncComputed, options.name);
        let equals = options.equals.unwrap_or_else(|| Rc::new(|_: &T, _: &T| false));
        let show_waiting = options.show_waiting.unwrap_or(runtime.config().show_waiting);
        let derive: Derive<T> = Box::new(move || {
            let future = derive();
            async move {
                future
                    .await
                    .map_err(|error| (Rc::new(error) as Rc<dyn Error>, Rc::new(Backtrace::capture())))
            }
            .boxed_local()
        });

        let inner = Rc::new_cyclic(|this| AsyncInner {
            this: this.clone(),
            core: Notifier::new(runtime, info),
            derive,
            equals,
            show_waiting,
            status: RefCell::new(Status::Idle),
            freshness: Cell::new(Freshness::Dirty),
            evaluating: Cell::new(false),
            generation: Cell::new(0),
            tracker: RefCell::new(Tracker::new()),
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

    /// Current status, starting a run if the node is stale.
    pub fn get(&self) -> Status<T> {
        if !self.inner.core.is_disposed() {
            self.inner.refresh();
        }
        self.track();
        self.inner.status.borrow().clone()
    }

    /// Current status without starting a run or establishing a dependency.
    pub fn peek(&self) -> Status<T> {
        self.inner.status.borrow().clone()
    }

    /// Start a new run now, superseding any run in flight.
    pub fn restart(&self) {
        if !self.inner.core.is_disposed() {
            self.inner.start();
        }
    }

    /// Number of runs started.
    pub fn run_count(&self) -> u64 {
        self.inner.runs.get()
    }

    pub fn dependency_count(&self) -> usize {
        self.inner.tracker.borrow().len()
    }

    pub fn depends_on(&self, id: NodeId) -> bool {
        self.inner.tracker.borrow().contains(id)
    }

    /// Register a callback invoked after the status changes. The first
    /// listener starts a run if needed and activates every dependency.
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

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let (removed, deactivated) = self.inner.core.remove_listener(id);
        if deactivated {
            self.inner.release_dependencies();
        }
        removed
    }

    /// Discard any run in flight, unsubscribe and drop listeners.
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

impl<T: Clone + 'static> AsyncInner<T> {
    fn refresh(&self) {
        if self.core.is_disposed() {
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
                    self.start();
                } else {
                    self.freshness.set(Freshness::Clean);
                }
            }
            Freshness::Dirty => self.start(),
        }
    }

    fn start(&self) {
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        self.freshness.set(Freshness::Clean);
        self.runs.set(self.runs.get() + 1);

        let run = Rc::new(AsyncRun {
            node: self.this.clone(),
            generation,
            touched: RefCell::new(Tracker::new()),
        });
        let runtime = self.core.runtime().clone();
        let future = {
            let guard = PrefixGuard { node: self };
            let _evaluating = Evaluating::enter(&self.evaluating);
            let observer: Rc<dyn Observer> = run.clone();
            let _scope = runtime.context().enter(observer);
            let future = (self.derive)();
            drop(guard);
            future
        };
        tracing::trace!(node = %self.core.info(), generation, "async run started");

        let waiting = {
            let status = self.status.borrow();
            match &*status {
                Status::Success(_) if !self.show_waiting => None,
                Status::Idle | Status::Waiting { .. } | Status::Success(_) | Status::Error { .. } => {
                    Some(Status::Waiting {
                        last: status.last_value(),
                    })
                }
            }
        };
        if let Some(waiting) = waiting {
            self.transition(waiting);
        }

        let tracked = Tracked {
            runtime: runtime.clone(),
            observer: run.clone(),
            future,
        };
        runtime.spawn(
            async move {
                let outcome = tracked.await;
                if let Some(node) = run.node.upgrade() {
                    node.settle(&run, outcome);
                }
            }
            .boxed_local(),
        );
    }

    fn settle(&self, run: &AsyncRun<T>, outcome: Outcome<T>) {
        if run.generation != self.generation.get() || self.core.is_disposed() {
            tracing::debug!(node = %self.core.info(), generation = run.generation, "discarding stale result");
            return;
        }
        self.reconcile(run.touched.take());

        let next = match outcome {
            Ok(value) => Status::Success(value),
            Err((error, trace)) => {
                tracing::debug!(node = %self.core.info(), %error, "async run failed");
                Status::Error {
                    error,
                    trace,
                    last: self.status.borrow().last_value(),
                }
            }
        };
        self.transition(next);
    }

    /// Store a new status, notifying if it is observably different.
    fn transition(&self, next: Status<T>) {
        let changed = !self.status.borrow().same_as(&next, &*self.equals);
        *self.status.borrow_mut() = next;
        if !changed {
            tracing::trace!(node = %self.core.info(), "status unchanged");
            return;
        }
        tracing::trace!(node = %self.core.info(), status = ?self.status.borrow().kind(), "status changed");
        self.core.bump_version();
        if self.core.is_active() {
            let this: Weak<dyn Deliver> = self.this.clone();
            self.core.runtime().enqueue(self.core.id(), this);
        }
        self.core.invalidate_dependents(Freshness::Dirty);
        if let Err(err) = self.core.runtime().flush() {
            tracing::error!(node = %self.core.info(), %err, "delivering async result failed");
        }
    }

    fn subscribe(&self, node: &NodeRef) {
        if !self.tracker.borrow_mut().insert(node.clone()) {
            return;
        }
        self.grew.set(true);
        let this: Weak<dyn Dependent> = self.this.clone();
        node.source().add_dependent(self.core.id(), this);
        if self.core.is_active() {
            node.source().retain();
        }
    }

    fn reconcile(&self, touched: Tracker) {
        let stale = self.tracker.borrow().difference(&touched);
        let active = self.core.is_active();
        for dependency in &stale {
            dependency.source().remove_dependent(self.core.id());
            if active {
                dependency.source().release();
            }
        }
        *self.tracker.borrow_mut() = touched;

        if self.grew.replace(false) || !stale.is_empty() {
            let dependencies: Vec<NodeInfo> = self
                .tracker
                .borrow()
                .iter()
                .map(|dependency| dependency.info().clone())
                .collect();
            self.core.runtime().pipeline().graph_change(self.core.info(), &dependencies);
        }
    }

    fn activate_dependencies(&self) {
        tracing::debug!(node = %self.core.info(), "async computed activated");
        for dependency in self.tracker.borrow().to_vec() {
            dependency.source().retain();
        }
    }

    fn release_dependencies(&self) {
        tracing::debug!(node = %self.core.info(), "async computed deactivated");
        for dependency in self.tracker.borrow().to_vec() {
            dependency.source().release();
        }
    }

    fn teardown(&self) {
        self.generation.set(self.generation.get() + 1);
        let was_active = self.core.dispose();
        let dependencies = std::mem::take(&mut *self.tracker.borrow_mut());
        for dependency in dependencies.iter() {
            dependency.source().remove_dependent(self.core.id());
            if was_active {
                dependency.source().release();
            }
        }
        tracing::debug!(node = %self.core.info(), "async computed disposed");
    }
}

/// Leaves the node dirty if building the future panics.
struct PrefixGuard<'a, T: Clone + 'static> {
    node: &'a AsyncInner<T>,
}

impl<T: Clone + 'static> Drop for PrefixGuard<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.node.freshness.set(Freshness::Dirty);
        }
    }
}

struct Evaluating<'a>(&'a Cell<bool>);

impl<'a> Evaluating<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for Evaluating<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// One execution of an async derivation.
struct AsyncRun<T: Clone + 'static> {
    node: Weak<AsyncInner<T>>,
    generation: u64,
    touched: RefCell<Tracker>,
}

impl<T: Clone + 'static> Observer for AsyncRun<T> {
    fn record(&self, node: &NodeRef) {
        let Some(owner) = self.node.upgrade() else {
            return;
        };
        if owner.generation.get() != self.generation || node.id() == owner.core.id() {
            return;
        }
        if self.touched.borrow_mut().insert(node.clone()) {
            owner.subscribe(node);
        }
    }
}

/// Polls a run's future with the run installed as the current observer.
struct Tracked<T: Clone + 'static> {
    runtime: Runtime,
    observer: Rc<AsyncRun<T>>,
    future: LocalBoxFuture<'static, Outcome<T>>,
}

impl<T: Clone + 'static> Future for Tracked<T> {
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let owner = this
            .observer
            .node
            .upgrade()
            .filter(|owner| owner.generation.get() == this.observer.generation);
        let _evaluating = owner.as_ref().map(|owner| Evaluating::enter(&owner.evaluating));
        let observer: Rc<dyn Observer> = this.observer.clone();
        let _scope = this.runtime.context().enter(observer);
        this.future.as_mut().poll(cx)
    }
}

impl<T: Clone + 'static> Dependent for AsyncInner<T> {
    fn invalidate(&self, level: Freshness) {
        if self.core.is_disposed() || self.evaluating.get() {
            return;
        }
        let previous = self.freshness.get();
        if level <= previous {
            return;
        }
        self.freshness.set(level);
        if level == Freshness::Dirty {
            // The run in flight read an outdated input.
            self.generation.set(self.generation.get() + 1);
        }
        if previous == Freshness::Clean {
            if self.core.is_active() {
                let this: Weak<dyn Deliver> = self.this.clone();
                self.core.runtime().enqueue(self.core.id(), this);
            }
            self.core.invalidate_dependents(Freshness::Check);
        }
    }
}

impl<T: Clone + 'static> Source for AsyncInner<T> {
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
        AsyncInner::refresh(self);
    }
}

impl<T: Clone + 'static> Deliver for AsyncInner<T> {
    fn deliver(&self) {
        self.refresh();
        self.core.deliver();
    }
}

impl<T: Clone + 'static> Drop for AsyncInner<T> {
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

impl<T: Clone + 'static> Clone for AsyncComputed<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Debug + 'static> Debug for AsyncComputed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncComputed")
            .field("node", self.info())
            .field("status", &*self.inner.status.borrow())
            .field("generation", &self.inner.generation.get())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

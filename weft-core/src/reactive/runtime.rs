//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects cells and computed
//! nodes. It owns everything that is shared across a graph: the execution
//! context, the open batch, the queue of nodes with pending notifications,
//! the middleware pipeline and the spawner for async derivations.
//!
//! # How Propagation Works
//!
//! 1. A write stores the new value and invalidates the cell's dependents:
//!    direct dependents become `Dirty`, everything further downstream
//!    becomes `Check`. Nodes with listeners attached are queued.
//!
//! 2. Unless a batch is open, the runtime then flushes the queue. Each
//!    queued node refreshes itself. A `Check` node first refreshes its own
//!    dependencies in read order and only recomputes if one of them really
//!    changed, so every recomputation sees fully updated inputs.
//!
//! 3. A node whose value changed fires its listeners once, however many of
//!    its inputs changed in the epoch.
//!
//! # Threading
//!
//! A runtime is single-threaded: nodes are `Rc`-based and all propagation
//! runs synchronously on the caller's thread. Async derivations are driven
//! by a local spawner and resume on the same thread.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use futures_util::future::LocalBoxFuture;
use indexmap::IndexMap;

use super::async_computed::{AsyncComputed, AsyncOptions};
use super::batch::{BatchRecord, BatchState};
use super::cell::Cell as ReactiveCell;
use super::computed::{Computed, ComputedOptions};
use super::context::ExecutionContext;
use super::node::{Deliver, NodeId};
use crate::config::RuntimeConfig;
use crate::error::{ListenerError, ReactiveError, Result};
use crate::middleware::{Middleware, MiddlewareId, Pipeline};

/// Runs the futures of async derivations.
pub type Spawner = Rc<dyn Fn(LocalBoxFuture<'static, ()>)>;

type ErrorHook = Rc<dyn Fn(&ListenerError)>;

/// Handle to a reactive graph. Cloning is cheap and shares the graph.
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

/// Non-owning handle to a [`Runtime`].
#[derive(Clone)]
pub struct WeakRuntime {
    inner: Weak<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    context: ExecutionContext,
    batch: BatchState,
    pending: RefCell<IndexMap<NodeId, Weak<dyn Deliver>>>,
    flushing: Cell<bool>,
    pipeline: Pipeline,
    error_hook: RefCell<ErrorHook>,
    spawner: Spawner,
}

/// Configures a [`Runtime`] before creating it.
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    spawner: Option<Spawner>,
    error_hook: Option<ErrorHook>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default `tokio::task::spawn_local` spawner.
    pub fn spawner(mut self, spawner: impl Fn(LocalBoxFuture<'static, ()>) + 'static) -> Self {
        self.spawner = Some(Rc::new(spawner));
        self
    }

    pub fn error_hook(mut self, hook: impl Fn(&ListenerError) + 'static) -> Self {
        self.error_hook = Some(Rc::new(hook));
        self
    }

    pub fn build(self) -> Runtime {
        let spawner = self.spawner.unwrap_or_else(|| {
            Rc::new(|task| {
                tokio::task::spawn_local(task);
            })
        });
        let error_hook = self.error_hook.unwrap_or_else(|| {
            Rc::new(|err: &ListenerError| {
                tracing::error!(node = %err.node(), "listener panicked: {}", err.message());
            })
        });

        Runtime {
            inner: Rc::new(RuntimeInner {
                config: self.config,
                context: ExecutionContext::new(),
                batch: BatchState::default(),
                pending: RefCell::new(IndexMap::new()),
                flushing: Cell::new(false),
                pipeline: Pipeline::default(),
                error_hook: RefCell::new(error_hook),
                spawner,
            }),
        }
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The current-observer slot used for dependency tracking.
    pub fn context(&self) -> &ExecutionContext {
        &self.inner.context
    }

    pub fn downgrade(&self) -> WeakRuntime {
        WeakRuntime {
            inner: Rc::downgrade(&self.inner),
        }
    }

    // ------------------------------------------------------------------
    // Node construction
    // ------------------------------------------------------------------

    pub fn cell<T: Clone + 'static>(&self, value: T) -> ReactiveCell<T> {
        ReactiveCell::new(self, value)
    }

    pub fn named_cell<T: Clone + 'static>(&self, name: &str, value: T) -> ReactiveCell<T> {
        ReactiveCell::named(self, name, value)
    }

    pub fn computed<T, F>(&self, derive: F) -> Computed<T>
    where
        T: Clone + PartialEq + 'static,
        F: Fn() -> T + 'static,
    {
        Computed::new(self, derive)
    }

    pub fn computed_with<T, F>(&self, options: ComputedOptions<T>, derive: F) -> Computed<T>
    where
        T: Clone + 'static,
        F: Fn() -> T + 'static,
    {
        Computed::with_options(self, options, derive)
    }

    pub fn async_computed<T, E, F, Fut>(&self, derive: F) -> AsyncComputed<T>
    where
        T: Clone + PartialEq + 'static,
        E: std::error::Error + 'static,
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + 'static,
    {
        AsyncComputed::new(self, derive)
    }

    pub fn async_computed_with<T, E, F, Fut>(&self, options: AsyncOptions<T>, derive: F) -> AsyncComputed<T>
    where
        T: Clone + 'static,
        E: std::error::Error + 'static,
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + 'static,
    {
        AsyncComputed::with_options(self, options, derive)
    }

    /// Run `f` without recording any dependencies.
    pub fn untracked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.context.untracked(f)
    }

    // ------------------------------------------------------------------
    // Batching
    // ------------------------------------------------------------------

    /// Group writes so listeners are notified once, after `f` returns.
    ///
    /// Values are stored immediately, so reads inside `f` see them. Nested
    /// calls join the outermost batch, which alone commits. The commit runs
    /// through the `on_batch` middleware chain, even when nothing was
    /// written; an error from it is returned here. If `f` panics, the batch is closed and pending notifications
    /// are delivered without running `on_batch`.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> Result<R> {
        if self.inner.batch.open() {
            tracing::trace!(batch = ?self.inner.batch.current_id(), "batch opened");
        }
        let mut scope = BatchScope {
            runtime: self,
            finished: false,
        };
        let value = f();
        scope.finished = true;

        match self.inner.batch.close() {
            None => Ok(value),
            Some(mut record) => {
                self.commit(&mut record)?;
                Ok(value)
            }
        }
    }

    pub fn is_batching(&self) -> bool {
        self.inner.batch.is_open()
    }

    fn commit(&self, record: &mut BatchRecord) -> Result<()> {
        tracing::debug!(batch = record.id(), changes = record.len(), "committing batch");
        self.inner.pipeline.batch(record, &mut |_: &mut BatchRecord| self.flush())
    }

    // ------------------------------------------------------------------
    // Middleware and hooks
    // ------------------------------------------------------------------

    pub fn add_middleware(&self, middleware: Rc<dyn Middleware>) -> MiddlewareId {
        self.inner.pipeline.add(middleware)
    }

    pub fn remove_middleware(&self, id: MiddlewareId) -> bool {
        self.inner.pipeline.remove(id)
    }

    pub fn middleware_count(&self) -> usize {
        self.inner.pipeline.len()
    }

    /// Receive panics raised by listeners. Delivery to other listeners
    /// continues regardless.
    pub fn set_error_hook(&self, hook: impl Fn(&ListenerError) + 'static) {
        *self.inner.error_hook.borrow_mut() = Rc::new(hook);
    }

    // ------------------------------------------------------------------
    // Crate internals
    // ------------------------------------------------------------------

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    pub(crate) fn batch_state(&self) -> &BatchState {
        &self.inner.batch
    }

    pub(crate) fn report_listener_error(&self, error: &ListenerError) {
        let hook = self.inner.error_hook.borrow().clone();
        hook(error);
    }

    pub(crate) fn spawn(&self, task: LocalBoxFuture<'static, ()>) {
        (self.inner.spawner)(task);
    }

    /// Queue `node` for delivery in the current epoch. Queued once per id.
    pub(crate) fn enqueue(&self, id: NodeId, node: Weak<dyn Deliver>) {
        self.inner.pending.borrow_mut().entry(id).or_insert(node);
    }

    /// Deliver every pending notification, unless a batch or another flush
    /// is in charge of doing so.
    pub(crate) fn flush(&self) -> Result<()> {
        let inner = &*self.inner;
        if inner.flushing.get() || inner.batch.is_open() {
            return Ok(());
        }
        inner.flushing.set(true);
        let _reset = FlushReset(&inner.flushing);

        let limit = inner.config.max_flush_rounds;
        let mut delivered = 0usize;
        loop {
            let round = std::mem::take(&mut *inner.pending.borrow_mut());
            if round.is_empty() {
                break;
            }
            let mut scope = RoundScope {
                pending: &inner.pending,
                current: None,
                rest: round.into_iter().collect(),
            };
            while let Some((id, node)) = scope.rest.pop_front() {
                delivered += 1;
                if delivered > limit {
                    scope.rest.clear();
                    inner.pending.borrow_mut().clear();
                    tracing::error!(limit, "propagation did not settle");
                    return Err(ReactiveError::Runaway(limit));
                }
                if let Some(live) = node.upgrade() {
                    scope.current = Some((id, node));
                    live.deliver();
                    scope.current = None;
                }
            }
        }
        Ok(())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("batching", &self.is_batching())
            .field("pending", &self.inner.pending.borrow().len())
            .field("middleware", &self.middleware_count())
            .finish()
    }
}

impl WeakRuntime {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

struct FlushReset<'a>(&'a Cell<bool>);

impl Drop for FlushReset<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

type Pending = (NodeId, Weak<dyn Deliver>);

/// Puts the undelivered part of a round back in the queue if a delivery
/// unwinds, so stale active nodes are retried by the next flush.
struct RoundScope<'a> {
    pending: &'a RefCell<IndexMap<NodeId, Weak<dyn Deliver>>>,
    current: Option<Pending>,
    rest: VecDeque<Pending>,
}

impl Drop for RoundScope<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        let mut pending = self.pending.borrow_mut();
        for (id, node) in self.current.take().into_iter().chain(self.rest.drain(..)) {
            pending.entry(id).or_insert(node);
        }
    }
}

/// Closes the batch if `f` unwinds.
struct BatchScope<'a> {
    runtime: &'a Runtime,
    finished: bool,
}

impl Drop for BatchScope<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if self.runtime.inner.batch.close().is_some() {
            if let Err(err) = self.runtime.flush() {
                tracing::error!(error = %err, "flush after aborted batch failed");
            }
        }
    }
}

//! Middleware Pipeline
//!
//! Middleware intercepts what happens to the graph: node creation, writes,
//! batch commits, disposal and dependency changes. Every hook has a
//! passthrough default, so an implementation only overrides what it cares
//! about.
//!
//! # Composition
//!
//! Middlewares compose in registration order, each wrapping the chain built
//! so far. With `a` registered before `b`, a write runs
//! `b.on_set -> a.on_set -> store`. A hook that returns without calling
//! `next` vetoes the operation; an `Err` aborts it and reaches the caller of
//! `set` or `batch` unchanged.

mod history;

pub use history::History;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde::Serialize;

use crate::error::Result;
use crate::reactive::{BatchRecord, ChangeRecord, NodeInfo};

/// The rest of a chain, as seen from inside a hook.
pub type Next<'a, R> = &'a mut dyn FnMut(&mut R) -> Result<()>;

/// Interceptor around graph operations.
pub trait Middleware {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// A node was created.
    fn on_init(&self, _node: &NodeInfo) {}

    /// A cell is being written. Call `next` to let the write through.
    fn on_set(&self, next: Next<'_, ChangeRecord>, _node: &NodeInfo, change: &mut ChangeRecord) -> Result<()> {
        next(change)
    }

    /// The outermost batch is committing. Call `next` to deliver its
    /// notifications. Batches without writes come through here too.
    ///
    /// Returning without calling `next` leaves the notifications queued;
    /// they go out with the next flush.
    fn on_batch(&self, next: Next<'_, BatchRecord>, batch: &mut BatchRecord) -> Result<()> {
        next(batch)
    }

    /// A node is being disposed. Call `next` to tear it down.
    fn on_dispose(&self, next: &mut dyn FnMut(), _node: &NodeInfo) {
        next()
    }

    /// A derived node's dependency set changed after a recomputation.
    fn on_graph_change(&self, _node: &NodeInfo, _dependencies: &[NodeInfo]) {}
}

/// Handle returned by `add_middleware`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct MiddlewareId(u64);

/// Registered middlewares of one runtime.
#[derive(Default)]
pub(crate) struct Pipeline {
    entries: RefCell<Vec<(MiddlewareId, Rc<dyn Middleware>)>>,
    next_id: Cell<u64>,
}

impl Pipeline {
    pub(crate) fn add(&self, middleware: Rc<dyn Middleware>) -> MiddlewareId {
        let id = MiddlewareId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        tracing::debug!(middleware = middleware.name(), "middleware registered");
        self.entries.borrow_mut().push((id, middleware));
        id
    }

    pub(crate) fn remove(&self, id: MiddlewareId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Copy of the chain, so hooks may register or remove middleware.
    fn snapshot(&self) -> Vec<Rc<dyn Middleware>> {
        self.entries
            .borrow()
            .iter()
            .map(|(_, middleware)| middleware.clone())
            .collect()
    }

    pub(crate) fn init(&self, node: &NodeInfo) {
        for middleware in self.snapshot() {
            middleware.on_init(node);
        }
    }

    pub(crate) fn set(
        &self,
        node: &NodeInfo,
        change: &mut ChangeRecord,
        store: &mut dyn FnMut(&mut ChangeRecord) -> Result<()>,
    ) -> Result<()> {
        run_set(&self.snapshot(), node, change, store)
    }

    pub(crate) fn batch(
        &self,
        batch: &mut BatchRecord,
        commit: &mut dyn FnMut(&mut BatchRecord) -> Result<()>,
    ) -> Result<()> {
        run_batch(&self.snapshot(), batch, commit)
    }

    pub(crate) fn dispose(&self, node: &NodeInfo, teardown: &mut dyn FnMut()) {
        run_dispose(&self.snapshot(), node, teardown)
    }

    pub(crate) fn graph_change(&self, node: &NodeInfo, dependencies: &[NodeInfo]) {
        for middleware in self.snapshot() {
            middleware.on_graph_change(node, dependencies);
        }
    }
}

fn run_set(
    chain: &[Rc<dyn Middleware>],
    node: &NodeInfo,
    change: &mut ChangeRecord,
    store: &mut dyn FnMut(&mut ChangeRecord) -> Result<()>,
) -> Result<()> {
    match chain.split_last() {
        None => store(change),
        Some((outer, inner)) => {
            outer.on_set(&mut |change: &mut ChangeRecord| run_set(inner, node, change, &mut *store), node, change)
        }
    }
}

fn run_batch(
    chain: &[Rc<dyn Middleware>],
    batch: &mut BatchRecord,
    commit: &mut dyn FnMut(&mut BatchRecord) -> Result<()>,
) -> Result<()> {
    match chain.split_last() {
        None => commit(batch),
        Some((outer, inner)) => outer.on_batch(&mut |batch: &mut BatchRecord| run_batch(inner, batch, &mut *commit), batch),
    }
}

fn run_dispose(chain: &[Rc<dyn Middleware>], node: &NodeInfo, teardown: &mut dyn FnMut()) {
    match chain.split_last() {
        None => teardown(),
        Some((outer, inner)) => outer.on_dispose(&mut || run_dispose(inner, node, &mut *teardown), node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use crate::error::ReactiveError;
    use crate::reactive::{NodeKind, Runtime};

    struct Tag {
        label: &'static str,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Middleware for Tag {
        fn on_set(&self, next: Next<'_, ChangeRecord>, _node: &NodeInfo, change: &mut ChangeRecord) -> Result<()> {
            self.log.borrow_mut().push(format!("{} before", self.label));
            let result = next(change);
            self.log.borrow_mut().push(format!("{} after", self.label));
            result
        }
    }

    struct RejectNegative;

    impl Middleware for RejectNegative {
        fn on_set(&self, next: Next<'_, ChangeRecord>, node: &NodeInfo, change: &mut ChangeRecord) -> Result<()> {
            match change.new_value::<i32>() {
                Some(v) if *v < 0 => Err(ReactiveError::Rejected {
                    node: node.clone(),
                    reason: format!("{v} is negative"),
                }),
                _ => next(change),
            }
        }
    }

    struct SilentVeto;

    impl Middleware for SilentVeto {
        fn on_set(&self, _next: Next<'_, ChangeRecord>, _node: &NodeInfo, _change: &mut ChangeRecord) -> Result<()> {
            Ok(())
        }
    }

    struct Clamp;

    impl Middleware for Clamp {
        fn on_set(&self, next: Next<'_, ChangeRecord>, _node: &NodeInfo, change: &mut ChangeRecord) -> Result<()> {
            if let Some(v) = change.new_value::<i32>().copied() {
                change.replace_new_value(v.min(10));
            }
            next(change)
        }
    }

    #[test]
    fn later_middleware_wraps_earlier() {
        let rt = Runtime::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        rt.add_middleware(Rc::new(Tag { label: "a", log: log.clone() }));
        rt.add_middleware(Rc::new(Tag { label: "b", log: log.clone() }));

        rt.cell(0).set(1).unwrap();

        assert_eq!(*log.borrow(), vec!["b before", "a before", "a after", "b after"]);
    }

    #[test]
    fn middleware_error_reaches_caller() {
        let rt = Runtime::new();
        rt.add_middleware(Rc::new(RejectNegative));
        let cell = rt.cell(1);

        let err = cell.set(-5).unwrap_err();
        assert!(matches!(err, ReactiveError::Rejected { .. }));
        assert_eq!(cell.get(), 1);
    }

    #[test]
    fn middleware_can_veto_silently() {
        let rt = Runtime::new();
        let id = rt.add_middleware(Rc::new(SilentVeto));
        let cell = rt.cell(1);

        cell.set(2).unwrap();
        assert_eq!(cell.get(), 1);

        assert!(rt.remove_middleware(id));
        cell.set(2).unwrap();
        assert_eq!(cell.get(), 2);
    }

    #[test]
    fn middleware_can_rewrite_values() {
        let rt = Runtime::new();
        rt.add_middleware(Rc::new(Clamp));
        let cell = rt.cell(0);

        cell.set(50).unwrap();
        assert_eq!(cell.get(), 10);
    }

    #[test]
    fn default_hooks_pass_through() {
        struct Nothing;
        impl Middleware for Nothing {}

        let rt = Runtime::new();
        rt.add_middleware(Rc::new(Nothing));
        let cell = rt.cell(1);
        let doubled = rt.computed({
            let cell = cell.clone();
            move || cell.get() * 2
        });

        rt.batch(|| cell.set(4)).unwrap().unwrap();
        assert_eq!(doubled.get(), 8);
        cell.dispose();
        assert!(cell.set(5).is_err());
    }

    #[derive(Default)]
    struct Created(RefCell<Vec<NodeKind>>);

    impl Middleware for Created {
        fn on_init(&self, node: &NodeInfo) {
            self.0.borrow_mut().push(node.kind());
        }
    }

    #[test]
    fn on_init_sees_every_node_kind() {
        let rt = Runtime::builder().spawner(|_| {}).build();
        let created = Rc::new(Created::default());
        rt.add_middleware(created.clone());

        let cell = rt.cell(1);
        let _doubled = rt.computed({
            let cell = cell.clone();
            move || cell.get() * 2
        });
        let _remote = rt.async_computed(|| async { Ok::<_, Infallible>(3) });

        assert_eq!(
            *created.0.borrow(),
            vec![NodeKind::Cell, NodeKind::Computed, NodeKind::AsyncComputed]
        );
    }

    struct KeepAlive;

    impl Middleware for KeepAlive {
        fn on_dispose(&self, _next: &mut dyn FnMut(), _node: &NodeInfo) {}
    }

    #[test]
    fn on_dispose_can_keep_nodes_alive() {
        let rt = Runtime::new();
        let id = rt.add_middleware(Rc::new(KeepAlive));
        let cell = rt.cell(1);
        let doubled = rt.computed({
            let cell = cell.clone();
            move || cell.get() * 2
        });
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        doubled.add_listener(move || counter.set(counter.get() + 1));

        cell.dispose();
        doubled.dispose();
        assert!(!cell.is_disposed());
        assert!(!doubled.is_disposed());

        cell.set(2).unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(doubled.get(), 4);

        rt.remove_middleware(id);
        cell.dispose();
        assert!(cell.is_disposed());
        assert!(cell.set(3).is_err());
    }

    struct HoldBatches;

    impl Middleware for HoldBatches {
        fn on_batch(&self, _next: Next<'_, BatchRecord>, _batch: &mut BatchRecord) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn vetoed_batch_notifies_on_next_flush() {
        let rt = Runtime::new();
        rt.add_middleware(Rc::new(HoldBatches));
        let held = rt.cell(0);
        let other = rt.cell(0);
        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        held.add_listener(move || counter.set(counter.get() + 1));

        rt.batch(|| held.set(7)).unwrap().unwrap();
        assert_eq!(held.get(), 7);
        assert_eq!(calls.get(), 0);

        // Writes outside a batch skip `on_batch` and flush the queue.
        other.set(1).unwrap();
        assert_eq!(calls.get(), 1);
    }

    struct FailBatches;

    impl Middleware for FailBatches {
        fn on_batch(&self, _next: Next<'_, BatchRecord>, batch: &mut BatchRecord) -> Result<()> {
            let node = batch.changes()[0].node().clone();
            Err(ReactiveError::Rejected {
                node,
                reason: format!("batch {} refused", batch.id()),
            })
        }
    }

    #[test]
    fn batch_error_reaches_caller() {
        let rt = Runtime::new();
        rt.add_middleware(Rc::new(FailBatches));
        let cell = rt.named_cell("quota", 0);

        let err = rt.batch(|| cell.set(3).unwrap()).unwrap_err();
        assert!(matches!(err, ReactiveError::Rejected { ref node, .. } if node.name() == Some("quota")));
        assert!(!rt.is_batching());
        assert_eq!(cell.get(), 3);
    }

    #[derive(Default)]
    struct BatchSizes(RefCell<Vec<usize>>);

    impl Middleware for BatchSizes {
        fn on_batch(&self, next: Next<'_, BatchRecord>, batch: &mut BatchRecord) -> Result<()> {
            self.0.borrow_mut().push(batch.len());
            next(batch)
        }
    }

    #[test]
    fn empty_batches_reach_on_batch() {
        let rt = Runtime::new();
        let sizes = Rc::new(BatchSizes::default());
        rt.add_middleware(sizes.clone());
        let cell = rt.cell(0);

        rt.batch(|| {}).unwrap();
        rt.batch(|| {
            cell.set(1).unwrap();
            cell.set(2).unwrap();
        })
        .unwrap();
        rt.batch(|| rt.batch(|| {}).unwrap()).unwrap();

        assert_eq!(*sizes.0.borrow(), vec![0, 2, 0]);
    }
}

//! Integration Tests for the Propagation Engine
//!
//! These tests verify that cells, computed nodes, batches and middleware work
//! together correctly.

use std::cell::{Cell, RefCell};
use std::convert::Infallible;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use weft_core::middleware::{History, Middleware, Next};
use weft_core::reactive::{ChangeRecord, Lifecycle, NodeId, NodeInfo, NodeRef, Observer, Runtime};
use weft_core::{ReactiveError, Result};

fn counter() -> (Rc<Cell<u32>>, impl Fn() + 'static) {
    let calls = Rc::new(Cell::new(0));
    let handle = calls.clone();
    (calls, move || handle.set(handle.get() + 1))
}

/// a = 1, b = a * 2; writing a only marks b dirty; a listener on b fires
/// once per write with the new value.
#[test]
fn worked_example() {
    let rt = Runtime::new();
    let a = rt.named_cell("a", 1);
    let b = rt.computed({
        let a = a.clone();
        move || a.get() * 2
    });

    assert_eq!(b.get(), 2);

    a.set(5).unwrap();
    assert!(b.is_dirty());
    assert_eq!(b.run_count(), 1);
    assert_eq!(b.get(), 10);

    let seen = Rc::new(RefCell::new(Vec::new()));
    b.add_listener({
        let (b, seen) = (b.clone(), seen.clone());
        move || seen.borrow_mut().push(b.get())
    });

    a.set(6).unwrap();
    assert_eq!(*seen.borrow(), vec![12]);
}

/// A -> {B, C} -> D: one update of A notifies D once with both branches updated.
#[test]
fn diamond_notifies_once() {
    let rt = Runtime::new();
    let a = rt.cell(1);
    let b = rt.computed({
        let a = a.clone();
        move || a.get() + 1
    });
    let c = rt.computed({
        let a = a.clone();
        move || a.get() * 10
    });
    let d = rt.computed({
        let (b, c) = (b.clone(), c.clone());
        move || (b.get(), c.get())
    });

    let seen = Rc::new(RefCell::new(Vec::new()));
    d.add_listener({
        let (d, seen) = (d.clone(), seen.clone());
        move || seen.borrow_mut().push(d.get())
    });
    assert_eq!(d.run_count(), 1);

    a.set(2).unwrap();
    assert_eq!(*seen.borrow(), vec![(3, 20)]);
    assert_eq!(d.run_count(), 2);
    assert_eq!(b.run_count(), 2);
    assert_eq!(c.run_count(), 2);
}

/// Derivations never observe a half-updated graph.
#[test]
fn derivations_never_see_stale_inputs() {
    let rt = Runtime::new();
    let a = rt.cell(1);
    let doubled = rt.computed({
        let a = a.clone();
        move || a.get() * 2
    });
    let quadrupled = rt.computed({
        let doubled = doubled.clone();
        move || doubled.get() * 2
    });
    let glitches = Rc::new(Cell::new(0));
    let check = rt.computed({
        let (a, quadrupled, glitches) = (a.clone(), quadrupled.clone(), glitches.clone());
        move || {
            let (x, y) = (a.get(), quadrupled.get());
            if y != x * 4 {
                glitches.set(glitches.get() + 1);
            }
            y - x
        }
    });
    check.add_listener(|| {});

    for i in 2..20 {
        a.set(i).unwrap();
        assert_eq!(check.get(), i * 3);
    }
    assert_eq!(glitches.get(), 0);
}

#[test]
fn equal_recomputations_do_not_notify() {
    let rt = Runtime::new();
    let word = rt.cell("apple".to_string());
    let length = rt.computed({
        let word = word.clone();
        move || word.get().len()
    });
    let (calls, listener) = counter();
    length.add_listener(listener);

    word.set("grape".to_string()).unwrap();
    word.set("lemon".to_string()).unwrap();
    assert_eq!(calls.get(), 0);

    word.set("kiwi".to_string()).unwrap();
    assert_eq!(calls.get(), 1);
}

#[test]
fn batch_delivers_one_notification() {
    let rt = Runtime::new();
    let cell = rt.cell(0);
    let (calls, listener) = counter();
    cell.add_listener(listener);

    rt.batch(|| {
        for i in 1..=1000 {
            cell.set(i).unwrap();
        }
    })
    .unwrap();

    assert_eq!(calls.get(), 1);
    assert_eq!(cell.get(), 1000);
}

#[test]
fn lazy_computed_pulls_once() {
    let rt = Runtime::new();
    let cell = rt.cell(0);
    let plus_one = rt.computed({
        let cell = cell.clone();
        move || cell.get() + 1
    });
    assert_eq!(plus_one.get(), 1);

    for i in 1..=50 {
        cell.set(i).unwrap();
    }
    assert_eq!(plus_one.run_count(), 1);
    assert_eq!(plus_one.get(), 51);
    assert_eq!(plus_one.run_count(), 2);
}

#[test]
fn conditional_reads_switch_subscriptions() {
    let rt = Runtime::new();
    let cond = rt.cell(true);
    let a = rt.cell("a");
    let b = rt.cell("b");
    let pick = rt.computed({
        let (cond, a, b) = (cond.clone(), a.clone(), b.clone());
        move || if cond.get() { a.get() } else { b.get() }
    });
    let (calls, listener) = counter();
    pick.add_listener(listener);
    assert_eq!(a.lifecycle(), Lifecycle::Active);
    assert_eq!(b.lifecycle(), Lifecycle::Inactive);

    cond.set(false).unwrap();
    assert_eq!(calls.get(), 1);
    assert_eq!(a.lifecycle(), Lifecycle::Inactive);
    assert_eq!(b.lifecycle(), Lifecycle::Active);

    a.set("ignored").unwrap();
    assert_eq!(calls.get(), 1);
    b.set("bee").unwrap();
    assert_eq!(calls.get(), 2);
    assert_eq!(pick.get(), "bee");
}

#[test]
fn tracker_spills_past_inline_capacity() {
    let rt = Runtime::new();
    let cells: Vec<_> = (0..64).map(|i| rt.cell(i)).collect();
    let total = rt.computed({
        let cells = cells.clone();
        move || cells.iter().map(|c| c.get()).sum::<i32>()
    });
    let (calls, listener) = counter();
    total.add_listener(listener);
    assert_eq!(total.dependency_count(), 64);

    cells[63].set(0).unwrap();
    assert_eq!(calls.get(), 1);
    assert_eq!(total.get(), (0..63).sum::<i32>());
    assert!(cells.iter().all(|c| c.lifecycle() == Lifecycle::Active));
}

#[test]
fn context_is_restored_after_panic() {
    let rt = Runtime::new();
    let trigger = rt.cell(false);
    let outer_dep = rt.cell(1);
    let failing = rt.computed({
        let trigger = trigger.clone();
        move || {
            if trigger.get() {
                panic!("boom");
            }
            0
        }
    });
    let outer = rt.computed({
        let (failing, outer_dep) = (failing.clone(), outer_dep.clone());
        move || {
            let _ = catch_unwind(AssertUnwindSafe(|| failing.get()));
            outer_dep.get()
        }
    });

    trigger.set(true).unwrap();
    assert_eq!(outer.get(), 1);
    assert!(outer.depends_on(outer_dep.id()));
    assert!(!rt.context().is_tracking());
    assert!(failing.is_dirty());
}

#[test]
fn listener_panics_are_isolated() {
    let errors = Rc::new(RefCell::new(Vec::new()));
    let rt = Runtime::builder()
        .error_hook({
            let errors = errors.clone();
            move |err| errors.borrow_mut().push(err.message().to_string())
        })
        .build();
    let cell = rt.named_cell("volume", 0);
    cell.add_listener(|| panic!("listener exploded"));
    let (calls, listener) = counter();
    cell.add_listener(listener);

    cell.set(1).unwrap();
    assert_eq!(calls.get(), 1);
    assert_eq!(*errors.borrow(), vec!["listener exploded".to_string()]);
}

struct Veto;

impl Middleware for Veto {
    fn on_set(&self, next: Next<'_, ChangeRecord>, node: &NodeInfo, change: &mut ChangeRecord) -> Result<()> {
        match change.new_value::<i32>() {
            Some(value) if *value < 0 => Err(ReactiveError::Rejected {
                node: node.clone(),
                reason: "negative".into(),
            }),
            Some(value) if *value > 100 => Ok(()),
            _ => next(change),
        }
    }
}

#[test]
fn middleware_can_veto_writes() {
    let rt = Runtime::new();
    rt.add_middleware(Rc::new(Veto));
    let cell = rt.cell(10);
    let (calls, listener) = counter();
    cell.add_listener(listener);

    assert!(matches!(cell.set(-1), Err(ReactiveError::Rejected { .. })));
    assert!(cell.set(500).is_ok());
    assert_eq!(cell.get(), 10);
    assert_eq!(calls.get(), 0);

    cell.set(50).unwrap();
    assert_eq!(cell.get(), 50);
    assert_eq!(calls.get(), 1);
}

#[derive(Default)]
struct GraphLog(RefCell<Vec<(NodeId, usize)>>);

impl Middleware for GraphLog {
    fn on_graph_change(&self, node: &NodeInfo, dependencies: &[NodeInfo]) {
        self.0.borrow_mut().push((node.id(), dependencies.len()));
    }
}

#[test]
fn graph_changes_reach_middleware() {
    let rt = Runtime::new();
    let log = Rc::new(GraphLog::default());
    rt.add_middleware(log.clone());
    let cond = rt.cell(true);
    let a = rt.cell(1);
    let b = rt.cell(2);
    let pick = rt.computed({
        let (cond, a, b) = (cond.clone(), a.clone(), b.clone());
        move || if cond.get() { a.get() } else { a.get() + b.get() }
    });

    pick.get();
    cond.set(false).unwrap();
    pick.get();
    a.set(5).unwrap();
    pick.get();

    assert_eq!(*log.0.borrow(), vec![(pick.id(), 2), (pick.id(), 3)]);
}

#[test]
fn batch_undo_is_atomic() {
    let rt = Runtime::new();
    let history = History::new(&rt);
    rt.add_middleware(history.clone());
    let cells: Vec<_> = (0..10).map(|_| rt.cell(0)).collect();
    let total = rt.computed({
        let cells = cells.clone();
        move || cells.iter().map(|c| c.get()).sum::<i32>()
    });
    let seen = Rc::new(RefCell::new(Vec::new()));
    total.add_listener({
        let (total, seen) = (total.clone(), seen.clone());
        move || seen.borrow_mut().push(total.get())
    });

    rt.batch(|| {
        for (i, cell) in cells.iter().enumerate() {
            cell.set(i as i32 + 1).unwrap();
        }
    })
    .unwrap();
    assert_eq!(*seen.borrow(), vec![55]);

    history.undo().unwrap();
    assert_eq!(*seen.borrow(), vec![55, 0]);
    assert_eq!(history.undo_len(), 0);

    history.redo().unwrap();
    assert_eq!(*seen.borrow(), vec![55, 0, 55]);
    assert_eq!(history.redo_len(), 0);
    assert_eq!(history.undo_len(), 1);
}

/// An observer outside the engine, as a UI auto-tracking region would be.
#[derive(Default)]
struct Region(RefCell<Vec<NodeId>>);

impl Observer for Region {
    fn record(&self, node: &NodeRef) {
        self.0.borrow_mut().push(node.id());
    }
}

#[test]
fn custom_observers_see_reads() {
    let rt = Runtime::new();
    let a = rt.cell(1);
    let b = rt.computed({
        let a = a.clone();
        move || a.get() + 1
    });
    let region = Rc::new(Region::default());

    {
        let _scope = rt.context().enter(region.clone());
        a.get();
        b.get();
        rt.untracked(|| a.get());
    }
    a.get();

    assert_eq!(*region.0.borrow(), vec![a.id(), b.id()]);
}

#[tokio::test]
async fn async_node_feeds_sync_graph() {
    tokio::task::LocalSet::new()
        .run_until(async {
            let rt = Runtime::new();
            let user = rt.cell(7u32);
            let profile = rt.async_computed({
                let user = user.clone();
                move || {
                    let user = user.clone();
                    async move {
                        tokio::task::yield_now().await;
                        Ok::<_, Infallible>(format!("user-{}", user.get()))
                    }
                }
            });
            let label = rt.computed({
                let profile = profile.clone();
                move || profile.get().latest().cloned().unwrap_or_else(|| "loading".into())
            });
            let seen = Rc::new(RefCell::new(Vec::new()));
            label.add_listener({
                let (label, seen) = (label.clone(), seen.clone());
                move || seen.borrow_mut().push(label.get())
            });
            assert_eq!(label.get(), "loading");

            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
            assert!(profile.depends_on(user.id()));

            user.set(8).unwrap();
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
            assert_eq!(*seen.borrow(), vec!["user-7".to_string(), "user-8".to_string()]);
        })
        .await;
}

#[test]
fn disposed_cells_reject_writes() {
    let rt = Runtime::new();
    let cell = rt.cell(1);
    cell.dispose();
    assert_eq!(cell.lifecycle(), Lifecycle::Disposed);
    assert!(matches!(cell.set(2), Err(ReactiveError::Disposed(_))));
    assert_eq!(cell.get(), 1);
}

/// Run `f` with a debug-level subscriber installed and return what it logged.
fn capture_logs(f: impl FnOnce()) -> String {
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tracing_subscriber::EnvFilter;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let buffer = Buffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("weft_core=debug"))
        .with_ansi(false)
        .without_time()
        .with_writer(move || writer.clone())
        .finish();

    tracing::subscriber::with_default(subscriber, f);

    let bytes = buffer.0.lock().unwrap().clone();
    String::from_utf8(bytes).unwrap()
}

#[test]
fn disposed_writes_are_logged() {
    let logs = capture_logs(|| {
        let rt = Runtime::new();
        let cell = rt.named_cell("gain", 1);
        cell.dispose();
        assert!(cell.set(2).is_err());
    });
    assert!(logs.contains("cell disposed"), "{logs}");
    assert!(logs.contains("write to disposed cell"), "{logs}");
}

/// Without an error hook, listener panics end up in the log.
#[test]
fn default_error_hook_logs_listener_panics() {
    let logs = capture_logs(|| {
        let rt = Runtime::new();
        let cell = rt.cell(0);
        cell.add_listener(|| panic!("listener exploded"));
        cell.set(1).unwrap();
    });
    assert!(logs.contains("ERROR"), "{logs}");
    assert!(logs.contains("listener panicked: listener exploded"), "{logs}");
}

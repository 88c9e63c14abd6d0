//! Undo/redo history built on the middleware hooks.
//!
//! Every applied write outside a batch becomes one history entry, and every
//! committed batch becomes one entry holding all of its writes. Undoing a
//! batch replays its writes backwards inside a single batch, so listeners see
//! one notification per node.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use super::{Middleware, Next};
use crate::error::{ReactiveError, Result};
use crate::reactive::{BatchRecord, ChangeRecord, NodeInfo, Runtime, WeakRuntime};

#[derive(Debug, Clone)]
enum Entry {
    Change(ChangeRecord),
    Batch(BatchRecord),
}

impl Entry {
    fn changes(&self) -> &[ChangeRecord] {
        match self {
            Entry::Change(change) => std::slice::from_ref(change),
            Entry::Batch(batch) => batch.changes(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Undo,
    Redo,
}

/// Undo/redo middleware.
///
/// ```rust
/// use weft_core::middleware::History;
/// use weft_core::reactive::Runtime;
///
/// let rt = Runtime::new();
/// let history = History::new(&rt);
/// rt.add_middleware(history.clone());
///
/// let cell = rt.cell(1);
/// cell.set(2).unwrap();
/// history.undo().unwrap();
/// assert_eq!(cell.get(), 1);
/// ```
pub struct History {
    runtime: WeakRuntime,
    limit: usize,
    undo: RefCell<VecDeque<Entry>>,
    redo: RefCell<Vec<Entry>>,
    replaying: Cell<bool>,
}

impl History {
    /// History bounded by `RuntimeConfig::history_limit`.
    pub fn new(runtime: &Runtime) -> Rc<Self> {
        Self::with_limit(runtime, runtime.config().history_limit)
    }

    pub fn with_limit(runtime: &Runtime, limit: usize) -> Rc<Self> {
        Rc::new(Self {
            runtime: runtime.downgrade(),
            limit,
            undo: RefCell::new(VecDeque::new()),
            redo: RefCell::new(Vec::new()),
            replaying: Cell::new(false),
        })
    }

    /// Revert the most recent entry. Returns `false` if there was nothing to undo.
    ///
    /// Fails with [`ReactiveError::ReplayInBatch`] inside `Runtime::batch`,
    /// since the replayed writes would be committed as a new entry.
    pub fn undo(&self) -> Result<bool> {
        if self.replaying.get() {
            return Ok(false);
        }
        self.ensure_outside_batch()?;
        let Some(entry) = self.undo.borrow_mut().pop_back() else {
            return Ok(false);
        };
        if let Err(err) = self.replay(&entry, Direction::Undo) {
            self.undo.borrow_mut().push_back(entry);
            return Err(err);
        }
        self.redo.borrow_mut().push(entry);
        Ok(true)
    }

    /// Reapply the most recently undone entry.
    pub fn redo(&self) -> Result<bool> {
        if self.replaying.get() {
            return Ok(false);
        }
        self.ensure_outside_batch()?;
        let Some(entry) = self.redo.borrow_mut().pop() else {
            return Ok(false);
        };
        if let Err(err) = self.replay(&entry, Direction::Redo) {
            self.redo.borrow_mut().push(entry);
            return Err(err);
        }
        self.undo.borrow_mut().push_back(entry);
        Ok(true)
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.borrow().is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.borrow().is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.borrow().len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.borrow().len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn clear(&self) {
        self.undo.borrow_mut().clear();
        self.redo.borrow_mut().clear();
    }

    fn ensure_outside_batch(&self) -> Result<()> {
        match self.runtime.upgrade() {
            Some(runtime) if runtime.is_batching() => Err(ReactiveError::ReplayInBatch),
            _ => Ok(()),
        }
    }

    fn replay(&self, entry: &Entry, direction: Direction) -> Result<()> {
        let runtime = self.runtime.upgrade().ok_or(ReactiveError::RuntimeDropped)?;
        self.replaying.set(true);
        let _reset = ReplayReset(&self.replaying);

        tracing::debug!(?direction, changes = entry.changes().len(), "replaying history entry");
        runtime.batch(|| -> Result<()> {
            let changes = entry.changes();
            match direction {
                Direction::Undo => {
                    for restore in changes.iter().rev().filter_map(ChangeRecord::restore) {
                        restore.undo()?;
                    }
                }
                Direction::Redo => {
                    for restore in changes.iter().filter_map(ChangeRecord::restore) {
                        restore.redo()?;
                    }
                }
            }
            Ok(())
        })?
    }

    fn record(&self, entry: Entry) {
        if self.limit == 0 {
            return;
        }
        let mut undo = self.undo.borrow_mut();
        undo.push_back(entry);
        while undo.len() > self.limit {
            undo.pop_front();
        }
        self.redo.borrow_mut().clear();
    }
}

impl Middleware for History {
    fn name(&self) -> &str {
        "history"
    }

    fn on_set(&self, next: Next<'_, ChangeRecord>, _node: &NodeInfo, change: &mut ChangeRecord) -> Result<()> {
        next(change)?;
        if !self.replaying.get() && change.is_applied() && change.batch_id().is_none() && change.restore().is_some() {
            self.record(Entry::Change(change.clone()));
        }
        Ok(())
    }

    fn on_batch(&self, next: Next<'_, BatchRecord>, batch: &mut BatchRecord) -> Result<()> {
        next(batch)?;
        if !self.replaying.get() && !batch.is_empty() {
            self.record(Entry::Batch(batch.clone()));
        }
        Ok(())
    }
}

struct ReplayReset<'a>(&'a Cell<bool>);

impl Drop for ReplayReset<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

//! Change and Batch Records
//!
//! Every write produces a [`ChangeRecord`] that travels through the
//! middleware pipeline. Writes made inside [`Runtime::batch`] are also
//! collected into the open [`BatchRecord`], which is handed to `on_batch`
//! as one unit when the outermost batch commits.
//!
//! [`Runtime::batch`]: super::Runtime::batch

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::SystemTime;

use serde::Serialize;

use super::node::NodeInfo;
use crate::error::Result;

/// Closures that put a write back (`undo`) or apply it again (`redo`).
#[derive(Clone)]
pub struct Restore {
    undo: Rc<dyn Fn() -> Result<()>>,
    redo: Rc<dyn Fn() -> Result<()>>,
}

impl Restore {
    pub fn new(
        undo: impl Fn() -> Result<()> + 'static,
        redo: impl Fn() -> Result<()> + 'static,
    ) -> Self {
        Self {
            undo: Rc::new(undo),
            redo: Rc::new(redo),
        }
    }

    pub fn undo(&self) -> Result<()> {
        (self.undo)()
    }

    pub fn redo(&self) -> Result<()> {
        (self.redo)()
    }
}

impl fmt::Debug for Restore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Restore")
    }
}

/// One write to a cell, as seen by middleware.
///
/// Values are type-erased; use [`old_value`](Self::old_value) and
/// [`new_value`](Self::new_value) with the cell's type to inspect them.
#[derive(Clone, Serialize)]
pub struct ChangeRecord {
    node: NodeInfo,
    timestamp: SystemTime,
    value_type: &'static str,
    #[serde(skip)]
    old_value: Rc<dyn Any>,
    #[serde(skip)]
    new_value: Rc<dyn Any>,
    #[serde(skip)]
    restore: Option<Restore>,
    batch_id: Option<u64>,
    propagation_stopped: bool,
    applied: bool,
}

impl ChangeRecord {
    pub(crate) fn new<T: 'static>(node: NodeInfo, old: T, new: T, batch_id: Option<u64>) -> Self {
        Self {
            node,
            timestamp: SystemTime::now(),
            value_type: std::any::type_name::<T>(),
            old_value: Rc::new(old),
            new_value: Rc::new(new),
            restore: None,
            batch_id,
            propagation_stopped: false,
            applied: false,
        }
    }

    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Type name of the cell's value.
    pub fn value_type(&self) -> &'static str {
        self.value_type
    }

    pub fn old_value<T: 'static>(&self) -> Option<&T> {
        self.old_value.downcast_ref()
    }

    pub fn new_value<T: 'static>(&self) -> Option<&T> {
        self.new_value.downcast_ref()
    }

    /// Replace the value about to be stored. The cell rejects the write
    /// with `TypeMismatch` if `T` is not its value type.
    pub fn replace_new_value<T: 'static>(&mut self, value: T) {
        self.new_value = Rc::new(value);
    }

    pub fn restore(&self) -> Option<&Restore> {
        self.restore.as_ref()
    }

    pub(crate) fn set_restore(&mut self, restore: Restore) {
        self.restore = Some(restore);
    }

    /// Id of the batch this write belongs to, if it was made inside one.
    pub fn batch_id(&self) -> Option<u64> {
        self.batch_id
    }

    /// Store the value but do not notify anyone about it.
    pub fn stop_propagation(&mut self) {
        self.propagation_stopped = true;
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.propagation_stopped
    }

    /// Whether the cell actually stored the value (no middleware vetoed it).
    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub(crate) fn mark_applied(&mut self) {
        self.applied = true;
    }
}

impl fmt::Debug for ChangeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeRecord")
            .field("node", &self.node)
            .field("value_type", &self.value_type)
            .field("batch_id", &self.batch_id)
            .field("propagation_stopped", &self.propagation_stopped)
            .field("applied", &self.applied)
            .finish()
    }
}

/// All writes of one transaction, in order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    id: u64,
    opened_at: SystemTime,
    committed_at: Option<SystemTime>,
    changes: Vec<ChangeRecord>,
}

impl BatchRecord {
    fn new(id: u64) -> Self {
        Self {
            id,
            opened_at: SystemTime::now(),
            committed_at: None,
            changes: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn opened_at(&self) -> SystemTime {
        self.opened_at
    }

    /// When the outermost batch closed. `None` while it is still open.
    pub fn committed_at(&self) -> Option<SystemTime> {
        self.committed_at
    }

    pub fn changes(&self) -> &[ChangeRecord] {
        &self.changes
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Transaction bookkeeping owned by the runtime.
#[derive(Default)]
pub(crate) struct BatchState {
    depth: Cell<u32>,
    open: RefCell<Option<BatchRecord>>,
    next_id: Cell<u64>,
}

impl BatchState {
    /// Enter a batch. Returns `true` for the outermost one.
    pub(crate) fn open(&self) -> bool {
        let depth = self.depth.get();
        self.depth.set(depth + 1);
        if depth == 0 {
            let id = self.next_id.get() + 1;
            self.next_id.set(id);
            *self.open.borrow_mut() = Some(BatchRecord::new(id));
            true
        } else {
            false
        }
    }

    /// Leave a batch. Yields the record when the outermost one closes.
    pub(crate) fn close(&self) -> Option<BatchRecord> {
        let depth = self.depth.get().saturating_sub(1);
        self.depth.set(depth);
        if depth == 0 {
            let mut record = self.open.borrow_mut().take()?;
            record.committed_at = Some(SystemTime::now());
            Some(record)
        } else {
            None
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.depth.get() > 0
    }

    pub(crate) fn current_id(&self) -> Option<u64> {
        self.open.borrow().as_ref().map(|record| record.id)
    }

    pub(crate) fn push(&self, change: ChangeRecord) {
        if let Some(record) = self.open.borrow_mut().as_mut() {
            record.changes.push(change);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::NodeKind;

    #[test]
    fn nested_batches_share_one_record() {
        let state = BatchState::default();
        assert!(state.open());
        let id = state.current_id();
        assert!(!state.open());
        assert_eq!(state.current_id(), id);

        assert!(state.close().is_none());
        assert!(state.is_open());
        let record = state.close().unwrap();
        assert_eq!(Some(record.id()), id);
        assert!(record.committed_at() >= Some(record.opened_at()));
        assert!(!state.is_open());
    }

    #[test]
    fn batch_ids_are_monotonic() {
        let state = BatchState::default();
        state.open();
        let first = state.close().unwrap().id();
        state.open();
        let second = state.close().unwrap().id();
        assert!(second > first);
    }

    #[test]
    fn change_record_exposes_typed_values() {
        let info = NodeInfo::new(NodeKind::Cell, None);
        let mut change = ChangeRecord::new(info, 1u32, 2u32, None);

        assert_eq!(change.old_value::<u32>(), Some(&1));
        assert_eq!(change.new_value::<u32>(), Some(&2));
        assert_eq!(change.new_value::<i64>(), None);
        assert_eq!(change.value_type(), "u32");

        change.replace_new_value(7u32);
        assert_eq!(change.new_value::<u32>(), Some(&7));
    }

    #[test]
    fn change_record_serializes_metadata() {
        let info = NodeInfo::new(NodeKind::Cell, None);
        let change = ChangeRecord::new(info, 1u32, 2u32, Some(4));
        let json = serde_json::to_value(&change).unwrap();

        assert_eq!(json["value_type"], "u32");
        assert_eq!(json["batch_id"], 4);
        assert_eq!(json["applied"], false);
    }
}

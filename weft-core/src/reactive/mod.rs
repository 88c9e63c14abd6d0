//! Reactive Primitives
//!
//! This module implements the propagation engine: cells, computed nodes and
//! async computed nodes, all owned by a [`Runtime`].
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell is a container for mutable state. When a cell is read while an
//! observer is installed in the execution context (such as a computed node
//! running its derivation), the observer records the cell as a dependency.
//! Writing the cell invalidates everything downstream.
//!
//! ## Computed Nodes
//!
//! A Computed node is a derived value that caches its result and re-evaluates
//! only when one of its dependencies changes. Without listeners it is pulled
//! lazily on read; with listeners it is refreshed eagerly, in dependency
//! order, before any listener fires.
//!
//! ## Async Computed Nodes
//!
//! An AsyncComputed node derives its value from a future and exposes a
//! [`Status`]. Reads made after an `.await` are still tracked, and only the
//! most recently started run may settle.
//!
//! ## Batches
//!
//! [`Runtime::batch`] groups writes so that every affected listener runs once,
//! after the outermost batch commits.
//!
//! # Implementation Notes
//!
//! The runtime is an explicit, single-threaded context object (`Rc` and
//! `RefCell` throughout). It owns the current-observer slot, the pending
//! notification queue, the open batch and the middleware pipeline.

mod node;
mod context;
mod tracker;
mod listeners;
mod batch;
mod runtime;
mod cell;
mod computed;
mod status;
mod async_computed;

pub use node::{Lifecycle, NodeId, NodeInfo, NodeKind, NodeRef};
pub use context::{ExecutionContext, Observer, ObserverScope};
pub use listeners::ListenerId;
pub use batch::{BatchRecord, ChangeRecord, Restore};
pub use runtime::{Runtime, RuntimeBuilder, Spawner, WeakRuntime};
pub use cell::Cell;
pub use computed::{Computed, ComputedOptions};
pub use status::{Status, StatusKind};
pub use async_computed::{AsyncComputed, AsyncOptions};

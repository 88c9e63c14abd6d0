//! Weft Core
//!
//! This crate provides a fine-grained reactive propagation engine. It
//! implements:
//!
//! - Mutable cells and cached computed nodes with automatic dependency tracking
//! - Glitch-free push/pull propagation through diamond-shaped graphs
//! - Async computed nodes that keep tracking reads across `.await` points
//! - Transactional batching with one notification per node
//! - A middleware pipeline, with an undo/redo history built on top of it
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: the runtime, node types and dependency tracking
//! - `middleware`: interception hooks and the `History` middleware
//! - `error`: error types shared by every operation
//! - `config`: runtime configuration
//!
//! # Example
//!
//! ```rust
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use weft_core::reactive::Runtime;
//!
//! let rt = Runtime::new();
//! let count = rt.cell(1);
//! let doubled = rt.computed({
//!     let count = count.clone();
//!     move || count.get() * 2
//! });
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! doubled.add_listener({
//!     let (doubled, seen) = (doubled.clone(), seen.clone());
//!     move || seen.borrow_mut().push(doubled.get())
//! });
//!
//! count.set(6).unwrap();
//! assert_eq!(*seen.borrow(), vec![12]);
//! ```

pub mod config;
pub mod error;
pub mod middleware;
pub mod reactive;

pub use config::RuntimeConfig;
pub use error::{ListenerError, ReactiveError, Result};

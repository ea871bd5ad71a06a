//! Relay Core
//!
//! This crate provides a small reactive dataflow kernel. It implements:
//!
//! - A graph of nodes, each running an ordered pipeline of steps
//! - An update scheduler with depth-first inline propagation and a FIFO
//!   deferred queue
//! - An effect runtime that turns sync or async handler calls into exactly
//!   one settlement each, with live concurrency counters
//! - Stores that only propagate when their value actually changes
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Nodes, step pipelines, scopes and the node registry
//! - `kernel`: The update scheduler that drives updates through the graph
//! - `reactive`: Typed units (events, stores, effects, domains) built on
//!   top of the kernel
//! - `config`: Kernel configuration
//! - `error`: Error types shared by all modules
//!
//! # Example
//!
//! ```rust,ignore
//! use relay_core::kernel::Kernel;
//! use relay_core::reactive::{Effect, HandlerResult, Store};
//!
//! let kernel = Kernel::new();
//!
//! // An effect with a synchronous handler
//! let double = Effect::with_handler(&kernel, "double", |p: i32| {
//!     HandlerResult::<i32, String>::ok(p * 2)
//! });
//!
//! // A store following the effect's results
//! let last = Store::new(&kernel, "last", 0);
//! last.on(double.done(), |_, done| done.result);
//!
//! let result = double.create(5).await?;
//! assert_eq!(result, 10);
//! assert_eq!(last.get(), 10);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod kernel;
pub mod reactive;

pub use config::KernelConfig;
pub use error::{BoxError, CallError, KernelError};
pub use kernel::Kernel;

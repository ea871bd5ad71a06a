//! Reactive Units
//!
//! Typed handles over the kernel graph. Each unit is a node (plus, for
//! effects, a handful of owned internal nodes); the handles only add types
//! and wiring on top of the kernel.
//!
//! # Units
//!
//! ## Events
//!
//! An [`Event`] is the entry point for payloads. Emitting launches the
//! payload into its node; watchers, mapped events and forwarded units
//! receive it through `next` edges.
//!
//! ## Stores
//!
//! A [`Store`] holds a value that only changes through reducers bound to
//! trigger units. A store propagates only when the reduced value differs
//! from the current one, so downstream units never see no-op updates.
//!
//! ## Effects
//!
//! An [`Effect`] wraps one replaceable handler. Every call runs the handler
//! exactly once and ends in exactly one settlement, reported through the
//! `done`/`fail`/`finally` events, while `in_flight` and `pending` count
//! the calls that have not settled yet.
//!
//! ## Domains
//!
//! A [`Domain`] groups units under one owner so they can be disposed
//! together.

mod domain;
mod effect;
mod event;
mod store;
mod subscription;
mod thenable;

pub use domain::Domain;
pub use effect::{
    Call, Done, Effect, EffectConfig, Fail, Finally, Handler, Invocation, Resolver, Status,
};
pub use event::Event;
pub use store::{Comparator, Store, StoreConfig};
pub use subscription::Subscription;
pub use thenable::{HandlerResult, Promise, Settle, Thenable};

use crate::graph::NodeId;
use crate::kernel::Kernel;

/// Bounds shared by every payload a typed unit carries.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + 'static {}

/// A typed handle to a node whose input and output payloads share one type.
pub trait Unit {
    type Payload: Value;

    /// The node updates are launched into.
    fn node(&self) -> NodeId;

    fn kernel(&self) -> &Kernel;
}

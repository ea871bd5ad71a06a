//! Event Implementation
//!
//! An event is the simplest unit: a node with an empty pipeline. Emitting
//! launches the payload into it, and everything linked downstream receives
//! the payload unchanged.

use std::fmt;
use std::marker::PhantomData;

use super::subscription::Subscription;
use super::{Unit, Value};
use crate::error::KernelError;
use crate::graph::{downcast, payload, NodeBuilder, NodeId, NodeOp, Step, UnitKind};
use crate::kernel::Kernel;

/// A unit carrying payloads of type `T`.
///
/// # Example
///
/// ```rust,ignore
/// let kernel = Kernel::new();
/// let clicks = Event::<u32>::new(&kernel, "clicks");
///
/// let _sub = clicks.watch(|n| println!("clicked {n}"));
/// clicks.emit(1)?;
/// ```
pub struct Event<T> {
    kernel: Kernel,
    id: NodeId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Value> Event<T> {
    pub fn new(kernel: &Kernel, name: impl Into<String>) -> Self {
        Self::build(kernel, NodeBuilder::new().name(name).unit(UnitKind::Event))
    }

    /// Event owned by `owner`, disposed together with it.
    pub(crate) fn owned(kernel: &Kernel, name: impl Into<String>, owner: NodeId) -> Self {
        Self::build(
            kernel,
            NodeBuilder::new()
                .name(name)
                .unit(UnitKind::Event)
                .owned_by(owner),
        )
    }

    /// Typed handle to an existing event node.
    pub(crate) fn attach(kernel: &Kernel, id: NodeId) -> Self {
        Self {
            kernel: kernel.clone(),
            id,
            _marker: PhantomData,
        }
    }

    fn build(kernel: &Kernel, builder: NodeBuilder) -> Self {
        Self::attach(kernel, kernel.add_node(builder))
    }

    /// Derived event fed by this one through a single-step node.
    fn derive<U: Value>(&self, op: NodeOp, step: Step) -> Event<U> {
        let derived = Event::build(
            &self.kernel,
            NodeBuilder::new()
                .unit(UnitKind::Event)
                .op(op)
                .owned_by(self.id)
                .step(step),
        );
        if let Err(err) = self.kernel.link(self.id, derived.id) {
            tracing::warn!(error = %err, "derived event of a disposed event is inert");
        }
        derived
    }

    /// Launch `value` into the graph as a top-level update.
    ///
    /// Returns the first error raised by a step during the resulting drain.
    pub fn emit(&self, value: T) -> Result<(), KernelError> {
        self.kernel.launch(self.id, payload(value))
    }

    /// Run `f` for every payload.
    pub fn watch<F>(&self, f: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        Subscription::watch(&self.kernel, self.id, f)
    }

    /// Event carrying `f(payload)` for every payload of this one.
    pub fn map<U, F>(&self, f: F) -> Event<U>
    where
        U: Value,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        self.derive(
            NodeOp::Map,
            Step::compute(move |p, _| Ok(payload(f(downcast::<T>(&p)?)))),
        )
    }

    /// Event carrying only the payloads for which `f` returns `true`.
    pub fn filter<F>(&self, f: F) -> Event<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.derive(
            NodeOp::Filter,
            Step::filter(move |p, _| Ok(f(downcast::<T>(p)?))),
        )
    }

    /// Send every payload of this event on to `target`.
    pub fn forward<U>(&self, target: &U) -> Result<(), KernelError>
    where
        U: Unit<Payload = T>,
    {
        self.kernel.link(self.id, target.node())
    }

    pub fn name(&self) -> Option<String> {
        self.kernel.meta(self.id).and_then(|meta| meta.name)
    }

    /// Remove the event and everything it owns.
    pub fn dispose(&self) -> usize {
        self.kernel.dispose(self.id)
    }
}

impl<T: Value> Unit for Event<T> {
    type Payload = T;

    fn node(&self) -> NodeId {
        self.id
    }

    fn kernel(&self) -> &Kernel {
        &self.kernel
    }
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            kernel: self.kernel.clone(),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn collect<T: Value>(event: &Event<T>) -> (Arc<Mutex<Vec<T>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let sub = event.watch(move |v: &T| seen_clone.lock().push(v.clone()));
        (seen, sub)
    }

    #[test]
    fn emit_reaches_watchers() {
        let kernel = Kernel::new();
        let event = Event::<i32>::new(&kernel, "numbers");
        let (seen, _sub) = collect(&event);

        event.emit(1).expect("emit");
        event.emit(2).expect("emit");

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert_eq!(event.name().as_deref(), Some("numbers"));
    }

    #[test]
    fn map_and_filter() {
        let kernel = Kernel::new();
        let event = Event::<i32>::new(&kernel, "numbers");
        let labels = event.filter(|n| n % 2 == 0).map(|n| format!("even {n}"));
        let (seen, _sub) = collect(&labels);

        for n in 1..=4 {
            event.emit(n).expect("emit");
        }

        assert_eq!(*seen.lock(), vec!["even 2".to_string(), "even 4".to_string()]);
    }

    #[test]
    fn forward_links_units() {
        let kernel = Kernel::new();
        let source = Event::<i32>::new(&kernel, "source");
        let target = Event::<i32>::new(&kernel, "target");
        source.forward(&target).expect("forward");
        let (seen, _sub) = collect(&target);

        source.emit(7).expect("emit");
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn dispose_removes_derived_units() {
        let kernel = Kernel::new();
        let event = Event::<i32>::new(&kernel, "numbers");
        let doubled = event.map(|n| n * 2);
        let sub = doubled.watch(|_| {});
        sub.detach();

        assert_eq!(kernel.node_count(), 3);
        assert_eq!(event.dispose(), 3);
        assert_eq!(kernel.node_count(), 0);
    }
}

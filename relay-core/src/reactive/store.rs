//! Store Implementation
//!
//! A store is a node whose pipeline is reduce, compare, write:
//!
//! 1. pick the reducer registered for the unit that caused the update (or
//!    take the payload as the new value when there is none);
//! 2. halt if the result equals the current value;
//! 3. write the new value to the scope and propagate it.
//!
//! Reducers live in the scope keyed by trigger node, so `on` can add one to
//! an existing node. A forked trigger uses the reducer of its origin.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::warn;

use super::subscription::Subscription;
use super::{Unit, Value};
use crate::error::{BoxError, KernelError};
use crate::graph::{downcast, payload, NodeBuilder, NodeId, Payload, Scope, Step, UnitKind};
use crate::kernel::Kernel;

const STATE: &str = "state";
const REDUCERS: &str = "reducers";

type Reducer = Arc<dyn Fn(&Payload, &Payload) -> Result<Payload, BoxError> + Send + Sync>;

#[derive(Clone, Default)]
struct Reducers(IndexMap<NodeId, Reducer>);

/// Equality used to absorb updates; `true` means "unchanged".
pub type Comparator<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Per-store configuration.
pub struct StoreConfig<T> {
    pub name: Option<String>,
    /// Replaces `PartialEq` when deciding whether a value changed.
    pub comparator: Option<Comparator<T>>,
}

impl<T> StoreConfig<T> {
    pub fn new() -> Self {
        Self {
            name: None,
            comparator: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn comparator<F>(mut self, is_equal: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.comparator = Some(Arc::new(is_equal));
        self
    }
}

impl<T> Default for StoreConfig<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A reactive value of type `T`.
///
/// ```rust,ignore
/// let kernel = Kernel::new();
/// let add = Event::<i32>::new(&kernel, "add");
/// let total = Store::new(&kernel, "total", 0);
/// total.on(&add, |total, n| total + n);
///
/// add.emit(2)?;
/// assert_eq!(total.get(), 2);
/// ```
pub struct Store<T> {
    kernel: Kernel,
    id: NodeId,
    scope: Arc<Scope>,
    derived: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Store<T>
where
    T: Value + PartialEq,
{
    pub fn new(kernel: &Kernel, name: impl Into<String>, initial: T) -> Self {
        Self::with_config(kernel, initial, StoreConfig::new().name(name))
    }

    pub fn with_config(kernel: &Kernel, initial: T, config: StoreConfig<T>) -> Self {
        let mut builder = NodeBuilder::new();
        if let Some(name) = config.name {
            builder = builder.name(name);
        }
        Self::build(kernel, builder, initial, config.comparator, false)
    }

    fn build(
        kernel: &Kernel,
        builder: NodeBuilder,
        initial: T,
        comparator: Option<Comparator<T>>,
        derived: bool,
    ) -> Self {
        let is_equal: Comparator<T> = comparator.unwrap_or_else(|| Arc::new(|a, b| a == b));

        let mut builder = builder
            .unit(UnitKind::Store)
            .scope_entry(STATE, payload(initial))
            .scope_entry(REDUCERS, payload(Reducers::default()))
            .step(Step::compute(|p, ctx| {
                let reducers = ctx.scope.require::<Reducers>(REDUCERS)?;
                let reducer = ctx.stack.caused_by().and_then(|trigger| {
                    reducers
                        .0
                        .get(&trigger)
                        .or_else(|| reducers.0.get(&ctx.kernel.origin(trigger)))
                        .cloned()
                });
                match reducer {
                    Some(reduce) => {
                        let state = ctx
                            .scope
                            .get(STATE)
                            .ok_or(KernelError::MissingScope { key: STATE })?;
                        reduce(&state, &p)
                    }
                    None => {
                        downcast::<T>(&p)?;
                        Ok(p)
                    }
                }
            }))
            .step(Step::filter(move |next, ctx| {
                let current = ctx.scope.require::<T>(STATE)?;
                Ok(!is_equal(&current, downcast::<T>(next)?))
            }))
            .step(Step::run(|next, ctx| {
                ctx.scope.set(STATE, Arc::clone(&next));
                Ok(next)
            }));
        if derived {
            builder = builder.derived();
        }

        let (id, scope) = kernel.add_node_scoped(builder);
        Self {
            kernel: kernel.clone(),
            id,
            scope,
            derived,
            _marker: PhantomData,
        }
    }

    /// Typed handle to an existing store node.
    pub(crate) fn attach(kernel: &Kernel, id: NodeId) -> Result<Self, KernelError> {
        let scope = kernel.scope(id).ok_or(KernelError::UnknownNode(id))?;
        scope.require::<T>(STATE)?;
        Ok(Self {
            kernel: kernel.clone(),
            id,
            scope,
            derived: kernel.meta(id).is_some_and(|meta| meta.derived),
            _marker: PhantomData,
        })
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.scope
            .get_as::<T>(STATE)
            .expect("store state has the declared type")
    }

    /// Replace the value, propagating if it changed.
    pub fn set(&self, value: T) -> Result<(), KernelError> {
        if self.derived {
            return Err(KernelError::DerivedStore(self.id));
        }
        self.kernel.launch(self.id, payload(value))
    }

    /// Reduce the value with `reducer` whenever `trigger` fires.
    ///
    /// Registering a second reducer for the same trigger replaces the first.
    /// Derived stores ignore the call.
    pub fn on<U, F>(&self, trigger: &U, reducer: F) -> &Self
    where
        U: Unit,
        F: Fn(&T, &U::Payload) -> T + Send + Sync + 'static,
    {
        if self.derived {
            warn!(store = %self.id, "reducers cannot be added to a derived store");
            return self;
        }
        self.on_node(trigger.node(), reducer);
        self
    }

    pub(crate) fn on_node<P, F>(&self, trigger: NodeId, reducer: F)
    where
        P: Value,
        F: Fn(&T, &P) -> T + Send + Sync + 'static,
    {
        let reducer: Reducer = Arc::new(move |state, p| {
            Ok(payload(reducer(downcast::<T>(state)?, downcast::<P>(p)?)))
        });
        self.scope.update(REDUCERS, |current| {
            let mut reducers = current
                .and_then(|p| p.downcast_ref::<Reducers>())
                .cloned()
                .unwrap_or_default();
            reducers.0.insert(trigger, reducer);
            payload(reducers)
        });
        if let Err(err) = self.kernel.link(trigger, self.id) {
            warn!(store = %self.id, error = %err, "reducer trigger is not in the graph");
        }
    }

    /// Read-only store holding `f(value)`, owned by this store.
    pub fn map<U, F>(&self, f: F) -> Store<U>
    where
        U: Value + PartialEq,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let initial = f(&self.get());
        let derived = Store::build(
            &self.kernel,
            NodeBuilder::new().owned_by(self.id),
            initial,
            None,
            true,
        );
        derived.on_node(self.id, move |_, value: &T| f(value));
        derived
    }

    /// Run `f` with the current value now and with every change after.
    pub fn watch<F>(&self, f: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        f(&self.get());
        Subscription::watch(&self.kernel, self.id, f)
    }

    pub fn is_derived(&self) -> bool {
        self.derived
    }

    pub fn name(&self) -> Option<String> {
        self.kernel.meta(self.id).and_then(|meta| meta.name)
    }

    /// Remove the store and the stores derived from it.
    pub fn dispose(&self) -> usize {
        self.kernel.dispose(self.id)
    }
}

impl<T> Unit for Store<T>
where
    T: Value + PartialEq,
{
    type Payload = T;

    fn node(&self) -> NodeId {
        self.id
    }

    fn kernel(&self) -> &Kernel {
        &self.kernel
    }
}

impl<T> Clone for Store<T> {
    fn clone(&self) -> Self {
        Self {
            kernel: self.kernel.clone(),
            id: self.id,
            scope: Arc::clone(&self.scope),
            derived: self.derived,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Store<T>
where
    T: fmt::Debug + Clone + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.id)
            .field("value", &self.scope.get_as::<T>(STATE))
            .field("derived", &self.derived)
            .finish()
    }
}

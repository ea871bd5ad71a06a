//! Domains group units under one owner node.

use std::fmt;
use std::sync::Arc;

use super::effect::{unhandled, Effect};
use super::event::Event;
use super::store::{Store, StoreConfig};
use super::thenable::HandlerResult;
use super::{Unit, Value};
use crate::graph::{NodeBuilder, NodeId, UnitKind};
use crate::kernel::Kernel;

/// Owner of the units created through it; disposing the domain disposes
/// them all.
#[derive(Clone)]
pub struct Domain {
    kernel: Kernel,
    id: NodeId,
    name: String,
}

impl Domain {
    pub fn new(kernel: &Kernel, name: impl Into<String>) -> Self {
        Self::build(kernel, name.into(), None)
    }

    fn build(kernel: &Kernel, name: String, owner: Option<NodeId>) -> Self {
        let mut builder = NodeBuilder::new().name(name.clone()).unit(UnitKind::Domain);
        if let Some(owner) = owner {
            builder = builder.owned_by(owner);
        }
        Self {
            kernel: kernel.clone(),
            id: kernel.add_node(builder),
            name,
        }
    }

    fn qualify(&self, name: impl Into<String>) -> String {
        format!("{}/{}", self.name, name.into())
    }

    pub fn event<T: Value>(&self, name: impl Into<String>) -> Event<T> {
        Event::owned(&self.kernel, self.qualify(name), self.id)
    }

    pub fn store<T>(&self, name: impl Into<String>, initial: T) -> Store<T>
    where
        T: Value + PartialEq,
    {
        self.store_with_config(initial, StoreConfig::new().name(name))
    }

    pub fn store_with_config<T>(&self, initial: T, mut config: StoreConfig<T>) -> Store<T>
    where
        T: Value + PartialEq,
    {
        config.name = config.name.map(|name| self.qualify(name));
        let store = Store::with_config(&self.kernel, initial, config);
        self.kernel.adopt(self.id, store.node());
        store
    }

    /// Effect with the default handler.
    pub fn effect<P, D, E>(&self, name: impl Into<String>) -> Effect<P, D, E>
    where
        P: Value,
        D: Value + Default,
        E: Value,
    {
        let name = self.qualify(name);
        Effect::build(&self.kernel, name.clone(), Some(self.id), unhandled(name))
    }

    pub fn effect_with_handler<P, D, E, F>(
        &self,
        name: impl Into<String>,
        handler: F,
    ) -> Effect<P, D, E>
    where
        P: Value,
        D: Value,
        E: Value,
        F: Fn(P) -> HandlerResult<D, E> + Send + Sync + 'static,
    {
        Effect::build(
            &self.kernel,
            self.qualify(name),
            Some(self.id),
            Arc::new(handler),
        )
    }

    /// Nested domain, disposed with this one.
    pub fn domain(&self, name: impl Into<String>) -> Domain {
        Self::build(&self.kernel, self.qualify(name), Some(self.id))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> NodeId {
        self.id
    }

    /// Dispose the domain and every unit it owns.
    pub fn dispose(&self) -> usize {
        self.kernel.dispose(self.id)
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

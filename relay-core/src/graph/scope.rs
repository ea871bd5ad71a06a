//! Node Scope
//!
//! A scope is the per-node mapping from names to captured values. It stands
//! in for closure capture wherever state must be copied on fork: the current
//! value of a store, the replaceable handler of an effect, and references to
//! the nodes an internal node launches into all live here.

use std::any::Any;
use std::fmt;

use indexmap::IndexMap;
use parking_lot::RwLock;

use super::node::{NodeId, NodeRef};
use super::step::{payload, Payload};
use crate::error::KernelError;

/// Mutable name → payload mapping owned by one node.
pub struct Scope {
    entries: RwLock<IndexMap<&'static str, Payload>>,
}

impl Scope {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }

    /// Get the payload stored under `key`.
    pub fn get(&self, key: &str) -> Option<Payload> {
        self.entries.read().get(key).cloned()
    }

    /// Get a clone of the value stored under `key`, if it has type `T`.
    pub fn get_as<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Clone,
    {
        self.entries
            .read()
            .get(key)
            .and_then(|value| value.downcast_ref::<T>())
            .cloned()
    }

    /// Like [`Scope::get_as`], but reports which entry was missing.
    pub fn require<T>(&self, key: &'static str) -> Result<T, KernelError>
    where
        T: Any + Clone,
    {
        let entries = self.entries.read();
        let value = entries.get(key).ok_or(KernelError::MissingScope { key })?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or(KernelError::PayloadType {
                expected: std::any::type_name::<T>(),
            })
    }

    /// Resolve a node reference stored under `key`.
    pub fn node(&self, key: &'static str) -> Result<NodeId, KernelError> {
        self.require::<NodeRef>(key).map(|NodeRef(id)| id)
    }

    /// Replace the value under `key`, returning the previous one.
    pub fn set(&self, key: &'static str, value: Payload) -> Option<Payload> {
        self.entries.write().insert(key, value)
    }

    /// Store a node reference under `key`.
    pub fn set_node(&self, key: &'static str, id: NodeId) {
        self.set(key, payload(NodeRef(id)));
    }

    /// Replace the value under `key` with `f(current)` while holding the
    /// write lock, so concurrent readers never see a half-applied update.
    pub fn update<F>(&self, key: &'static str, f: F)
    where
        F: FnOnce(Option<&Payload>) -> Payload,
    {
        let mut entries = self.entries.write();
        let next = f(entries.get(key));
        entries.insert(key, next);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Copy every entry into an independent scope.
    pub fn snapshot(&self) -> Self {
        Self {
            entries: RwLock::new(self.entries.read().clone()),
        }
    }

    pub fn keys(&self) -> Vec<&'static str> {
        self.entries.read().keys().copied().collect()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").field("keys", &self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_set() {
        let scope = Scope::new();
        assert!(scope.get("state").is_none());

        scope.set("state", payload(10_i32));
        assert_eq!(scope.get_as::<i32>("state"), Some(10));
        assert_eq!(scope.get_as::<String>("state"), None);
    }

    #[test]
    fn require_reports_missing_and_mismatched() {
        let scope = Scope::new();
        scope.set("count", payload(1_u8));

        assert!(matches!(
            scope.require::<u8>("other"),
            Err(KernelError::MissingScope { key: "other" })
        ));
        assert!(matches!(
            scope.require::<i64>("count"),
            Err(KernelError::PayloadType { .. })
        ));
        assert_eq!(scope.require::<u8>("count").ok(), Some(1));
    }

    #[test]
    fn node_refs_round_through_scope() {
        let scope = Scope::new();
        let id = NodeId::new();
        scope.set_node("runner", id);
        assert_eq!(scope.node("runner").ok(), Some(id));
    }

    #[test]
    fn update_sees_current_value() {
        let scope = Scope::new();
        scope.set("n", payload(1_i32));
        scope.update("n", |current| {
            let n = current.and_then(|p| p.downcast_ref::<i32>()).copied();
            payload(n.unwrap_or(0) + 1)
        });
        assert_eq!(scope.get_as::<i32>("n"), Some(2));
    }
}

//! Graph Nodes
//!
//! This module defines the node type that lives in the graph: an identity,
//! an immutable step pipeline, a mutable scope, metadata tags, the edges to
//! downstream nodes, and ownership links.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexSet;
use smallvec::SmallVec;

use super::scope::Scope;
use super::step::{Payload, Step};

/// Unique identifier for a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A reference to another node, stored in a scope.
///
/// Scope entries holding a `NodeRef` under a key listed in
/// [`NodeMeta::on_copy`] are followed and deep-copied by a fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef(pub NodeId);

/// The kind of unit a node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    Event,
    Store,
    Effect,
    Domain,
}

/// Role of an internal effect node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FxRole {
    /// Invokes the handler and settles the call.
    Runner,
    /// Hands the raw outcome back to a direct caller.
    Sidechain,
    /// Receives calls whose handler panicked.
    Abort,
}

/// Operation tag for nodes that are not units themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeOp {
    Watch,
    Map,
    Filter,
    Fx(FxRole),
}

/// Descriptive metadata. The kernel only reads `on_copy`; the remaining
/// tags are for the unit layers and for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct NodeMeta {
    pub name: Option<String>,
    pub unit: Option<UnitKind>,
    pub op: Option<NodeOp>,
    /// Scope keys naming owned sub-nodes that a fork must deep-copy.
    pub on_copy: SmallVec<[&'static str; 4]>,
    /// Set on stores derived through `map`.
    pub derived: bool,
    /// The node this one was forked from, followed back to the first
    /// original.
    pub origin: Option<NodeId>,
}

impl NodeMeta {
    /// Name used in logs and errors.
    pub fn display_name(&self) -> &str {
        match (&self.name, self.unit, self.op) {
            (Some(name), _, _) => name,
            (None, Some(UnitKind::Event), _) => "event",
            (None, Some(UnitKind::Store), _) => "store",
            (None, Some(UnitKind::Effect), _) => "effect",
            (None, Some(UnitKind::Domain), _) => "domain",
            (None, None, Some(NodeOp::Watch)) => "watch",
            (None, None, Some(NodeOp::Map)) => "map",
            (None, None, Some(NodeOp::Filter)) => "filter",
            (None, None, Some(NodeOp::Fx(FxRole::Runner))) => "runner",
            (None, None, Some(NodeOp::Fx(FxRole::Sidechain))) => "sidechain",
            (None, None, Some(NodeOp::Fx(FxRole::Abort))) => "abort",
            (None, None, None) => "node",
        }
    }
}

/// A node in the graph.
pub struct Node {
    id: NodeId,
    pub(crate) meta: NodeMeta,
    pub(crate) steps: Arc<[Step]>,
    pub(crate) scope: Arc<Scope>,
    /// Downstream nodes, in link order.
    pub(crate) next: IndexSet<NodeId>,
    /// Upstream nodes that list this node in their `next`.
    pub(crate) from: IndexSet<NodeId>,
    pub(crate) owner: Option<NodeId>,
    pub(crate) owned: SmallVec<[NodeId; 8]>,
}

impl Node {
    pub(crate) fn new(meta: NodeMeta, steps: Vec<Step>, scope: Scope) -> Self {
        Self {
            id: NodeId::new(),
            meta,
            steps: steps.into(),
            scope: Arc::new(scope),
            next: IndexSet::new(),
            from: IndexSet::new(),
            owner: None,
            owned: SmallVec::new(),
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// Downstream node ids, in link order.
    pub fn next(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.next.iter().copied()
    }

    pub fn owner(&self) -> Option<NodeId> {
        self.owner
    }

    pub fn owned(&self) -> &[NodeId] {
        &self.owned
    }

    /// Copy this node under a fresh id. Steps are shared, the scope is a
    /// snapshot, edges and ownership links are left for the caller to remap.
    pub(crate) fn duplicate(&self) -> Self {
        let mut meta = self.meta.clone();
        meta.origin.get_or_insert(self.id);
        Self {
            id: NodeId::new(),
            meta,
            steps: Arc::clone(&self.steps),
            scope: Arc::new(self.scope.snapshot()),
            next: self.next.clone(),
            from: IndexSet::new(),
            owner: self.owner,
            owned: self.owned.clone(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.meta.display_name())
            .field("steps", &self.steps.len())
            .field("next", &self.next)
            .field("owned", &self.owned)
            .finish()
    }
}

/// Declarative description of a node, consumed by `Kernel::add_node`.
#[derive(Default)]
pub struct NodeBuilder {
    pub(crate) meta: NodeMeta,
    pub(crate) steps: Vec<Step>,
    pub(crate) scope: Vec<(&'static str, Payload)>,
    pub(crate) owner: Option<NodeId>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.meta.name = Some(name.into());
        self
    }

    pub fn unit(mut self, unit: UnitKind) -> Self {
        self.meta.unit = Some(unit);
        self
    }

    pub fn op(mut self, op: NodeOp) -> Self {
        self.meta.op = Some(op);
        self
    }

    pub fn derived(mut self) -> Self {
        self.meta.derived = true;
        self
    }

    pub fn on_copy(mut self, keys: &[&'static str]) -> Self {
        self.meta.on_copy.extend_from_slice(keys);
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn scope_entry(mut self, key: &'static str, value: Payload) -> Self {
        self.scope.push((key, value));
        self
    }

    /// Register the new node as owned by `owner`.
    pub fn owned_by(mut self, owner: NodeId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub(crate) fn build(self) -> Node {
        let scope = Scope::new();
        for (key, value) in self.scope {
            scope.set(key, value);
        }
        let mut node = Node::new(self.meta, self.steps, scope);
        node.owner = self.owner;
        node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::step::payload;

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn builder_sets_meta_and_scope() {
        let node = NodeBuilder::new()
            .name("clicks")
            .unit(UnitKind::Event)
            .on_copy(&["runner"])
            .scope_entry("limit", payload(3_u32))
            .build();

        assert_eq!(node.meta().display_name(), "clicks");
        assert_eq!(node.meta().unit, Some(UnitKind::Event));
        assert_eq!(node.meta().on_copy.as_slice(), &["runner"]);
        assert_eq!(node.scope().get_as::<u32>("limit"), Some(3));
    }

    #[test]
    fn display_name_falls_back_to_role() {
        let meta = NodeMeta {
            op: Some(NodeOp::Fx(FxRole::Sidechain)),
            ..NodeMeta::default()
        };
        assert_eq!(meta.display_name(), "sidechain");
        assert_eq!(NodeMeta::default().display_name(), "node");
    }

    #[test]
    fn duplicate_snapshots_scope() {
        let node = NodeBuilder::new()
            .scope_entry("state", payload(1_i32))
            .build();
        let copy = node.duplicate();

        assert_ne!(node.id(), copy.id());
        assert_eq!(copy.meta().origin, Some(node.id()));
        assert_eq!(copy.duplicate().meta().origin, Some(node.id()));
        copy.scope().set("state", payload(2_i32));
        assert_eq!(node.scope().get_as::<i32>("state"), Some(1));
        assert_eq!(copy.scope().get_as::<i32>("state"), Some(2));
    }
}

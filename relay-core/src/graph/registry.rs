//! Node Registry
//!
//! The registry owns every node of a kernel, indexed by ID. It maintains both
//! edge directions (`next` and `from`) so that disposing a node can detach
//! it from its neighbours, and it implements the two structural operations
//! on the graph: cascading disposal along ownership links and forking.

use std::collections::{HashMap, HashSet, VecDeque};

use super::node::{Node, NodeId, NodeRef};
use super::step::payload;

/// Maps every forked node to its copy.
pub type ForkMap = HashMap<NodeId, NodeId>;

/// All nodes of one kernel.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node, registering it with its owner if it has one.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        if let Some(owner) = node.owner {
            if let Some(owner) = self.nodes.get_mut(&owner) {
                owner.owned.push(id);
            }
        }
        self.nodes.insert(id, node);
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Add an edge: updates of `from` propagate to `to`.
    ///
    /// Returns `false` if either node is missing.
    pub fn link(&mut self, from: NodeId, to: NodeId) -> bool {
        if !self.nodes.contains_key(&from) || !self.nodes.contains_key(&to) {
            return false;
        }
        if let Some(node) = self.nodes.get_mut(&from) {
            node.next.insert(to);
        }
        if let Some(node) = self.nodes.get_mut(&to) {
            node.from.insert(from);
        }
        true
    }

    pub fn unlink(&mut self, from: NodeId, to: NodeId) {
        if let Some(node) = self.nodes.get_mut(&from) {
            node.next.shift_remove(&to);
        }
        if let Some(node) = self.nodes.get_mut(&to) {
            node.from.shift_remove(&from);
        }
    }

    /// Make `owner` own `child`, so disposing `owner` disposes `child`.
    pub fn adopt(&mut self, owner: NodeId, child: NodeId) {
        if let Some(node) = self.nodes.get_mut(&owner) {
            if !node.owned.contains(&child) {
                node.owned.push(child);
            }
        }
        if let Some(node) = self.nodes.get_mut(&child) {
            node.owner = Some(owner);
        }
    }

    /// Remove a node and everything it owns, transitively.
    ///
    /// Also removes all edges involving the removed nodes. Returns the ids
    /// that were actually removed.
    pub fn dispose(&mut self, id: NodeId) -> Vec<NodeId> {
        let mut removed = Vec::new();
        let mut queue = VecDeque::from([id]);

        while let Some(node_id) = queue.pop_front() {
            let Some(node) = self.nodes.remove(&node_id) else {
                continue;
            };

            for upstream in &node.from {
                if let Some(up) = self.nodes.get_mut(upstream) {
                    up.next.shift_remove(&node_id);
                }
            }
            for downstream in &node.next {
                if let Some(down) = self.nodes.get_mut(downstream) {
                    down.from.shift_remove(&node_id);
                }
            }
            if let Some(owner) = node.owner.and_then(|o| self.nodes.get_mut(&o)) {
                owner.owned.retain(|child| *child != node_id);
            }

            queue.extend(node.owned.iter().copied());
            removed.push(node_id);
        }

        removed
    }

    /// Deep-copy `roots` and every node reachable from them through scope
    /// keys listed in `on_copy`.
    ///
    /// Copies get independent scopes. Edges, ownership links and `on_copy`
    /// references that point inside the copied set are redirected to the
    /// copies; edges leaving the set are kept as they are.
    pub fn fork(&mut self, roots: &[NodeId]) -> ForkMap {
        let members = self.fork_closure(roots);

        let mut mapping = ForkMap::new();
        let mut copies = Vec::with_capacity(members.len());
        for id in &members {
            if let Some(node) = self.nodes.get(id) {
                let copy = node.duplicate();
                mapping.insert(*id, copy.id());
                copies.push(copy);
            }
        }

        let remap = |id: NodeId| mapping.get(&id).copied().unwrap_or(id);
        for copy in &mut copies {
            copy.next = copy.next.iter().map(|id| remap(*id)).collect();
            copy.owned = copy
                .owned
                .iter()
                .filter_map(|id| mapping.get(id).copied())
                .collect();
            copy.owner = copy.owner.and_then(|id| mapping.get(&id).copied());
            for key in copy.meta.on_copy.clone() {
                if let Ok(target) = copy.scope.node(key) {
                    copy.scope.set(key, payload(NodeRef(remap(target))));
                }
            }
        }

        for copy in copies {
            let id = copy.id();
            let targets: Vec<NodeId> = copy.next.iter().copied().collect();
            self.nodes.insert(id, copy);
            for target in targets {
                if let Some(node) = self.nodes.get_mut(&target) {
                    node.from.insert(id);
                }
            }
        }

        mapping
    }

    /// Roots plus the transitive `on_copy` references, in discovery order.
    fn fork_closure(&self, roots: &[NodeId]) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<NodeId> = roots.iter().copied().collect();

        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            order.push(id);
            for key in node.meta.on_copy.iter().copied() {
                if let Ok(target) = node.scope.node(key) {
                    queue.push_back(target);
                }
            }
        }

        order
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::NodeBuilder;

    fn add(graph: &mut Graph, builder: NodeBuilder) -> NodeId {
        graph.add_node(builder.build())
    }

    #[test]
    fn add_and_dispose_nodes() {
        let mut graph = Graph::new();
        let a = add(&mut graph, NodeBuilder::new());
        let b = add(&mut graph, NodeBuilder::new());

        assert_eq!(graph.node_count(), 2);

        graph.dispose(a);
        assert_eq!(graph.node_count(), 1);
        assert!(!graph.contains(a));
        assert!(graph.contains(b));
    }

    #[test]
    fn link_and_unlink() {
        let mut graph = Graph::new();
        let a = add(&mut graph, NodeBuilder::new());
        let b = add(&mut graph, NodeBuilder::new());

        assert!(graph.link(a, b));
        assert!(graph.get(a).is_some_and(|n| n.next.contains(&b)));
        assert!(graph.get(b).is_some_and(|n| n.from.contains(&a)));

        graph.unlink(a, b);
        assert!(graph.get(a).is_some_and(|n| n.next.is_empty()));
        assert!(graph.get(b).is_some_and(|n| n.from.is_empty()));

        assert!(!graph.link(a, NodeId::new()));
    }

    #[test]
    fn dispose_cascades_and_detaches_edges() {
        let mut graph = Graph::new();
        let upstream = add(&mut graph, NodeBuilder::new());
        let owner = add(&mut graph, NodeBuilder::new());
        let child = add(&mut graph, NodeBuilder::new().owned_by(owner));
        let grandchild = add(&mut graph, NodeBuilder::new().owned_by(child));
        graph.link(upstream, child);

        let removed = graph.dispose(owner);

        assert_eq!(removed, vec![owner, child, grandchild]);
        assert_eq!(graph.node_count(), 1);
        assert!(graph.get(upstream).is_some_and(|n| n.next.is_empty()));
    }

    #[test]
    fn disposing_a_child_detaches_it_from_owner() {
        let mut graph = Graph::new();
        let owner = add(&mut graph, NodeBuilder::new());
        let child = add(&mut graph, NodeBuilder::new().owned_by(owner));

        graph.dispose(child);
        assert!(graph.get(owner).is_some_and(|n| n.owned.is_empty()));
    }

    #[test]
    fn fork_copies_on_copy_references() {
        let mut graph = Graph::new();
        let outside = add(&mut graph, NodeBuilder::new());
        let done = add(&mut graph, NodeBuilder::new().scope_entry("state", payload(0_i32)));
        let runner = add(
            &mut graph,
            NodeBuilder::new()
                .on_copy(&["done"])
                .scope_entry("done", payload(NodeRef(done)))
                .scope_entry("other", payload(NodeRef(outside))),
        );
        graph.link(runner, done);
        graph.link(runner, outside);

        let mapping = graph.fork(&[runner]);

        assert_eq!(mapping.len(), 2);
        let runner_copy = mapping[&runner];
        let done_copy = mapping[&done];
        assert_ne!(runner_copy, runner);
        assert_ne!(done_copy, done);

        let copy = graph.get(runner_copy).expect("fork inserted the runner");
        assert_eq!(copy.meta.origin, Some(runner));
        assert_eq!(copy.scope.node("done").ok(), Some(done_copy));
        assert_eq!(copy.scope.node("other").ok(), Some(outside));
        assert_eq!(copy.next().collect::<Vec<_>>(), vec![done_copy, outside]);
        assert!(graph.get(outside).is_some_and(|n| n.from.contains(&runner_copy)));

        // Forked state is independent of the original.
        if let Some(node) = graph.get(done_copy) {
            node.scope.set("state", payload(5_i32));
        }
        assert_eq!(
            graph.get(done).and_then(|n| n.scope.get_as::<i32>("state")),
            Some(0)
        );
    }
}

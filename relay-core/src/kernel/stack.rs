//! Call-Stack Frames
//!
//! Every time a node's pipeline runs, the scheduler creates a frame that
//! records the node and the frame of the update that caused it. Steps use
//! the chain to tell which upstream node an update came from: a store picks
//! the reducer registered for the trigger that fired, and a top-level launch
//! is recognisable by having no parent at all.
//!
//! Frames are shared through `Arc`, so a continuation (a deferred update or
//! an asynchronous settlement) can keep its causal parent alive after the
//! original drain has unwound.

use std::sync::Arc;

use crate::graph::NodeId;

/// One frame of the update call stack.
#[derive(Debug, Clone)]
pub struct Stack {
    node: NodeId,
    parent: Option<Arc<Stack>>,
}

impl Stack {
    /// Frame for a top-level launch.
    pub fn root(node: NodeId) -> Self {
        Self { node, parent: None }
    }

    /// Frame for `node`, caused by the update running in `parent`.
    pub fn new(node: NodeId, parent: Option<Arc<Stack>>) -> Self {
        Self { node, parent }
    }

    /// The node this frame belongs to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn parent(&self) -> Option<&Arc<Stack>> {
        self.parent.as_ref()
    }

    /// The node whose output caused this update, if any.
    pub fn caused_by(&self) -> Option<NodeId> {
        self.parent.as_ref().map(|frame| frame.node)
    }

    /// `true` when the update was launched from outside the graph.
    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }

    /// Number of frames in the chain, this one included.
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut frame = self.parent.as_deref();
        while let Some(current) = frame {
            depth += 1;
            frame = current.parent.as_deref();
        }
        depth
    }

    /// Node ids from this frame up to the root.
    pub fn trace(&self) -> Vec<NodeId> {
        let mut nodes = vec![self.node];
        let mut frame = self.parent.as_deref();
        while let Some(current) = frame {
            nodes.push(current.node);
            frame = current.parent.as_deref();
        }
        nodes
    }
}

//! Watcher subscriptions.
//!
//! A watcher is a leaf node running a callback for every payload its unit
//! emits. The [`Subscription`] returned when it is created removes it again.

use tracing::warn;

use super::Value;
use crate::graph::{downcast, NodeBuilder, NodeId, NodeOp, Step};
use crate::kernel::Kernel;

/// Handle to a watcher node.
///
/// Dropping the handle removes the watcher; call [`Subscription::detach`]
/// to keep it alive for as long as the watched unit exists.
#[must_use = "dropping a Subscription removes its watcher"]
pub struct Subscription {
    kernel: Kernel,
    node: Option<NodeId>,
}

impl Subscription {
    /// Add a watcher node downstream of `source`, owned by it.
    pub(crate) fn watch<T, F>(kernel: &Kernel, source: NodeId, f: F) -> Self
    where
        T: Value,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let node = kernel.add_node(
            NodeBuilder::new()
                .op(NodeOp::Watch)
                .owned_by(source)
                .step(Step::run(move |p, _| {
                    f(downcast::<T>(&p)?);
                    Ok(p)
                })),
        );

        let node = match kernel.link(source, node) {
            Ok(()) => Some(node),
            Err(err) => {
                warn!(source = %source, error = %err, "watch on a disposed unit ignored");
                kernel.dispose(node);
                None
            }
        };

        Self {
            kernel: kernel.clone(),
            node,
        }
    }

    /// The watcher node, if it is still attached.
    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn is_active(&self) -> bool {
        self.node.is_some_and(|id| self.kernel.contains(id))
    }

    /// Remove the watcher now.
    pub fn unsubscribe(mut self) {
        self.remove();
    }

    /// Keep the watcher alive after this handle is dropped.
    pub fn detach(mut self) {
        self.node = None;
    }

    fn remove(&mut self) {
        if let Some(id) = self.node.take() {
            self.kernel.dispose(id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.remove();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("node", &self.node)
            .field("active", &self.is_active())
            .finish()
    }
}

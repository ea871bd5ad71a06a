//! Update Scheduler
//!
//! The kernel owns the graph and the work queue, and drives updates through
//! node pipelines until no work is left.
//!
//! # How It Works
//!
//! 1. `launch`/`schedule` pushes the update(s) onto the work queue: inline
//!    updates onto the depth-first stack, deferred ones onto the FIFO queue.
//!
//! 2. If no drain is active, the caller becomes the drainer and processes
//!    updates on its own stack until the queue is empty. Launches made from
//!    inside a step only enqueue; they never start a nested drain.
//!
//! 3. For each update the node's pipeline runs with a fresh stack frame. If
//!    it completes, the output is pushed inline to every `next` node with the
//!    current frame as parent; a filter halts the branch; a barrier moves the
//!    rest of the pipeline to the deferred queue.
//!
//! Deferred work only runs once no inline work is left, so a completion that
//! re-enters the graph never recurses into the stack that caused it, and
//! completions raised within one tick run in enqueue order.
//!
//! # Thread Safety
//!
//! State lives behind `parking_lot` locks so handles can be sent to the
//! threads asynchronous handlers settle on. No lock is held while a step
//! runs, and at most one drain is active per kernel.

mod queue;
mod stack;

pub use queue::{Launch, Update};
pub use stack::Stack;

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, debug_span, trace, warn};

use self::queue::WorkQueue;
use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::graph::{
    run_pipeline, Flow, ForkMap, Graph, NodeBuilder, NodeId, NodeMeta, Payload, Scope,
    StepContext,
};

/// Handle to a kernel instance. Clones share the same graph and queue.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

struct KernelInner {
    config: KernelConfig,
    graph: RwLock<Graph>,
    queue: Mutex<WorkQueue>,
}

/// Resets the queue if a step panics mid-drain, so the kernel stays usable.
struct DrainGuard<'a> {
    queue: &'a Mutex<WorkQueue>,
    armed: bool,
}

impl DrainGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut queue = self.queue.lock();
            queue.clear_inline();
            queue.draining = false;
        }
    }
}

impl Kernel {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        Self {
            inner: Arc::new(KernelInner {
                config,
                graph: RwLock::new(Graph::new()),
                queue: Mutex::new(WorkQueue::default()),
            }),
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Graph
    // ------------------------------------------------------------------

    /// Build a node and add it to the graph.
    pub fn add_node(&self, builder: NodeBuilder) -> NodeId {
        self.inner.graph.write().add_node(builder.build())
    }

    /// Like [`Kernel::add_node`], also returning the node's scope.
    pub fn add_node_scoped(&self, builder: NodeBuilder) -> (NodeId, Arc<Scope>) {
        let node = builder.build();
        let scope = Arc::clone(node.scope());
        (self.inner.graph.write().add_node(node), scope)
    }

    /// Propagate the output of `from` to `to`.
    pub fn link(&self, from: NodeId, to: NodeId) -> Result<(), KernelError> {
        let mut graph = self.inner.graph.write();
        if graph.link(from, to) {
            Ok(())
        } else if graph.contains(from) {
            Err(KernelError::UnknownNode(to))
        } else {
            Err(KernelError::UnknownNode(from))
        }
    }

    pub fn unlink(&self, from: NodeId, to: NodeId) {
        self.inner.graph.write().unlink(from, to);
    }

    /// Make `owner` own `child`.
    pub fn adopt(&self, owner: NodeId, child: NodeId) {
        self.inner.graph.write().adopt(owner, child);
    }

    /// Remove a node and, transitively, everything it owns.
    ///
    /// Updates still queued for removed nodes are dropped when popped.
    /// Returns the number of nodes removed.
    pub fn dispose(&self, id: NodeId) -> usize {
        let removed = self.inner.graph.write().dispose(id);
        debug!(node = %id, removed = removed.len(), "disposed");
        removed.len()
    }

    /// Deep-copy `roots` together with the sub-nodes their `on_copy`
    /// metadata names.
    pub fn fork(&self, roots: &[NodeId]) -> ForkMap {
        let mapping = self.inner.graph.write().fork(roots);
        debug!(roots = roots.len(), copied = mapping.len(), "forked");
        mapping
    }

    pub fn scope(&self, id: NodeId) -> Option<Arc<Scope>> {
        self.inner.graph.read().get(id).map(|node| Arc::clone(node.scope()))
    }

    pub fn meta(&self, id: NodeId) -> Option<NodeMeta> {
        self.inner.graph.read().get(id).map(|node| node.meta().clone())
    }

    /// The node `id` was forked from, or `id` itself.
    pub fn origin(&self, id: NodeId) -> NodeId {
        self.inner
            .graph
            .read()
            .get(id)
            .and_then(|node| node.meta().origin)
            .unwrap_or(id)
    }

    /// Downstream nodes of `id`, in link order.
    pub fn next_of(&self, id: NodeId) -> Vec<NodeId> {
        self.inner
            .graph
            .read()
            .get(id)
            .map(|node| node.next().collect())
            .unwrap_or_default()
    }

    pub fn owned_by(&self, id: NodeId) -> Vec<NodeId> {
        self.inner
            .graph
            .read()
            .get(id)
            .map(|node| node.owned().to_vec())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.graph.read().contains(id)
    }

    pub fn node_count(&self) -> usize {
        self.inner.graph.read().node_count()
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Launch `payload` into `target` inline, as a top-level update.
    pub fn launch(&self, target: NodeId, payload: Payload) -> Result<(), KernelError> {
        self.schedule(Launch::new(target, payload))
    }

    /// Enqueue a launch and, unless a drain is already active, drain.
    ///
    /// Errors are those of steps run by this drain; launches made while a
    /// drain is active always return `Ok`.
    pub fn schedule(&self, launch: Launch) -> Result<(), KernelError> {
        {
            let mut queue = self.inner.queue.lock();
            trace!(
                targets = launch.targets.len(),
                deferred = launch.is_deferred(),
                draining = queue.draining,
                "launch"
            );
            queue.push_launch(launch);
            if queue.draining {
                return Ok(());
            }
            queue.draining = true;
        }
        self.drain()
    }

    /// Drain any work left on the queue.
    pub fn flush(&self) -> Result<(), KernelError> {
        {
            let mut queue = self.inner.queue.lock();
            if queue.draining || queue.len() == 0 {
                return Ok(());
            }
            queue.draining = true;
        }
        self.drain()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.queue.lock().draining
    }

    /// Number of updates waiting on the queue.
    pub fn pending_updates(&self) -> usize {
        self.inner.queue.lock().len()
    }

    fn drain(&self) -> Result<(), KernelError> {
        let _span = debug_span!("drain", kernel = %self.inner.config.name).entered();
        let mut guard = DrainGuard {
            queue: &self.inner.queue,
            armed: true,
        };
        let mut processed = 0_usize;
        let mut failure = None;

        loop {
            let update = {
                let mut queue = self.inner.queue.lock();
                match queue.pop() {
                    Some(update) => update,
                    None => {
                        queue.draining = false;
                        break;
                    }
                }
            };

            processed += 1;
            if let Some(limit) = self.inner.config.max_drain {
                if processed > limit {
                    let mut queue = self.inner.queue.lock();
                    queue.clear();
                    queue.draining = false;
                    guard.disarm();
                    warn!(limit, "drain limit exceeded, queue cleared");
                    return Err(KernelError::DrainLimit { limit });
                }
            }

            if let Err(err) = self.process(update) {
                let dropped = self.inner.queue.lock().clear_inline();
                warn!(error = %err, dropped, "step failed, inline work abandoned");
                failure.get_or_insert(err);
            }
        }

        guard.disarm();
        trace!(processed, "drain finished");
        failure.map_or(Ok(()), Err)
    }

    fn process(&self, update: Update) -> Result<(), KernelError> {
        let Update {
            target,
            payload,
            parent,
            resume_at,
        } = update;

        let (steps, scope, next) = {
            let graph = self.inner.graph.read();
            let Some(node) = graph.get(target) else {
                trace!(node = %target, "update for disposed node dropped");
                return Ok(());
            };
            let next: SmallVec<[NodeId; 4]> = node.next().collect();
            (Arc::clone(&node.steps), Arc::clone(node.scope()), next)
        };

        let stack = Arc::new(Stack::new(target, parent));
        let ctx = StepContext {
            node: target,
            scope: &scope,
            stack: &stack,
            kernel: self,
        };

        let flow = run_pipeline(&steps, resume_at, payload, &ctx).map_err(|source| {
            KernelError::Step {
                node: target,
                name: self.node_name(target),
                source,
            }
        })?;
        trace!(node = %target, ?flow, "node processed");

        match flow {
            Flow::Continue(payload) => {
                if !next.is_empty() {
                    let updates = next.into_iter().map(|child| Update {
                        target: child,
                        payload: Arc::clone(&payload),
                        parent: Some(Arc::clone(&stack)),
                        resume_at: 0,
                    });
                    self.inner.queue.lock().push_inline(updates);
                }
            }
            Flow::Halt => {}
            Flow::Defer { resume_at, payload } => {
                self.inner.queue.lock().push_deferred(Update {
                    target,
                    payload,
                    parent: stack.parent().cloned(),
                    resume_at,
                });
            }
        }

        Ok(())
    }

    fn node_name(&self, id: NodeId) -> String {
        self.meta(id)
            .map(|meta| meta.display_name().to_string())
            .unwrap_or_else(|| "disposed".to_string())
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.inner.config.name)
            .field("nodes", &self.node_count())
            .field("pending_updates", &self.pending_updates())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{downcast, payload, Step};
    use std::panic::{catch_unwind, AssertUnwindSafe};

    type Log = Arc<Mutex<Vec<String>>>;

    /// A node that records `label:payload` and passes the payload on.
    fn recorder(kernel: &Kernel, log: &Log, label: &'static str) -> NodeId {
        let log = Arc::clone(log);
        kernel.add_node(NodeBuilder::new().name(label).step(Step::run(move |p, _| {
            log.lock().push(format!("{label}:{}", downcast::<i32>(&p)?));
            Ok(p)
        })))
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().clone()
    }

    #[test]
    fn inline_propagation_is_depth_first() {
        let kernel = Kernel::new();
        let log = Log::default();
        let root = recorder(&kernel, &log, "root");
        let left = recorder(&kernel, &log, "left");
        let left_child = recorder(&kernel, &log, "left_child");
        let right = recorder(&kernel, &log, "right");
        kernel.link(root, left).expect("link");
        kernel.link(root, right).expect("link");
        kernel.link(left, left_child).expect("link");

        kernel.launch(root, payload(1_i32)).expect("launch");

        assert_eq!(
            entries(&log),
            vec!["root:1", "left:1", "left_child:1", "right:1"]
        );
        assert!(!kernel.is_draining());
    }

    #[test]
    fn filter_halts_only_its_branch() {
        let kernel = Kernel::new();
        let log = Log::default();
        let root = recorder(&kernel, &log, "root");
        let gate = kernel.add_node(
            NodeBuilder::new().step(Step::filter(|p, _| Ok(*downcast::<i32>(p)? > 10))),
        );
        let blocked = recorder(&kernel, &log, "blocked");
        let open = recorder(&kernel, &log, "open");
        kernel.link(root, gate).expect("link");
        kernel.link(gate, blocked).expect("link");
        kernel.link(root, open).expect("link");

        kernel.launch(root, payload(3_i32)).expect("launch");
        assert_eq!(entries(&log), vec!["root:3", "open:3"]);
    }

    #[test]
    fn deferred_work_runs_after_inline_in_fifo_order() {
        let kernel = Kernel::new();
        let log = Log::default();
        let first = recorder(&kernel, &log, "first");
        let second = recorder(&kernel, &log, "second");
        let inline = recorder(&kernel, &log, "inline");
        let trigger = kernel.add_node(NodeBuilder::new().step(Step::run(move |p, ctx| {
            ctx.kernel
                .schedule(Launch::new(first, payload(1_i32)).deferred().parent(ctx.stack))?;
            ctx.kernel
                .schedule(Launch::new(second, payload(2_i32)).deferred().parent(ctx.stack))?;
            ctx.kernel.schedule(Launch::new(inline, payload(3_i32)).parent(ctx.stack))?;
            Ok(p)
        })));

        kernel.launch(trigger, payload(())).expect("launch");
        assert_eq!(entries(&log), vec!["inline:3", "first:1", "second:2"]);
    }

    #[test]
    fn barrier_continues_on_deferred_queue() {
        let kernel = Kernel::new();
        let log = Log::default();
        let after = recorder(&kernel, &log, "after");
        let log_steps = Arc::clone(&log);
        let node = kernel.add_node(
            NodeBuilder::new()
                .step(Step::run(|p, _| Ok(payload(*downcast::<i32>(&p)? + 1))))
                .step(Step::barrier())
                .step(Step::run(move |p, _| {
                    log_steps.lock().push(format!("resumed:{}", downcast::<i32>(&p)?));
                    Ok(p)
                })),
        );
        let sibling = recorder(&kernel, &log, "sibling");
        kernel.link(node, after).expect("link");
        let root = recorder(&kernel, &log, "root");
        kernel.link(root, node).expect("link");
        kernel.link(root, sibling).expect("link");

        kernel.launch(root, payload(1_i32)).expect("launch");
        assert_eq!(
            entries(&log),
            vec!["root:1", "sibling:1", "resumed:2", "after:2"]
        );
    }

    #[test]
    fn frames_record_the_causing_node() {
        let kernel = Kernel::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_step = Arc::clone(&seen);
        let child = kernel.add_node(NodeBuilder::new().step(Step::run(move |p, ctx| {
            seen_step.lock().push(ctx.stack.caused_by());
            Ok(p)
        })));
        let root = kernel.add_node(NodeBuilder::new());
        kernel.link(root, child).expect("link");

        kernel.launch(child, payload(())).expect("launch");
        kernel.launch(root, payload(())).expect("launch");

        assert_eq!(*seen.lock(), vec![None, Some(root)]);
    }

    #[test]
    fn step_error_reaches_the_caller() {
        let kernel = Kernel::new();
        let log = Log::default();
        let node = kernel.add_node(NodeBuilder::new().name("strict").step(Step::compute(
            |p, _| Ok(payload(*downcast::<i32>(&p)?)),
        )));
        let after = recorder(&kernel, &log, "after");
        kernel.link(node, after).expect("link");

        let err = kernel.launch(node, payload("oops")).expect_err("type mismatch");
        assert!(matches!(err, KernelError::Step { ref name, .. } if name == "strict"));
        assert!(entries(&log).is_empty());

        // The kernel keeps working after a failed call.
        kernel.launch(node, payload(4_i32)).expect("launch");
        assert_eq!(entries(&log), vec!["after:4"]);
    }

    #[test]
    fn drain_limit_breaks_cycles() {
        let kernel = Kernel::with_config(KernelConfig {
            max_drain: Some(50),
            ..KernelConfig::default()
        });
        let a = kernel.add_node(NodeBuilder::new());
        let b = kernel.add_node(NodeBuilder::new());
        kernel.link(a, b).expect("link");
        kernel.link(b, a).expect("link");

        let err = kernel.launch(a, payload(())).expect_err("cycle");
        assert!(matches!(err, KernelError::DrainLimit { limit: 50 }));
        assert_eq!(kernel.pending_updates(), 0);
        assert!(!kernel.is_draining());
    }

    #[test]
    fn panicking_step_leaves_kernel_usable() {
        let kernel = Kernel::new();
        let log = Log::default();
        let bomb = kernel.add_node(NodeBuilder::new().step(Step::run(|_, _| panic!("bomb"))));
        let ok = recorder(&kernel, &log, "ok");

        let result = catch_unwind(AssertUnwindSafe(|| kernel.launch(bomb, payload(0_i32))));
        assert!(result.is_err());
        assert!(!kernel.is_draining());

        kernel.launch(ok, payload(1_i32)).expect("launch");
        assert_eq!(entries(&log), vec!["ok:1"]);
    }

    #[test]
    fn disposed_targets_are_skipped() {
        let kernel = Kernel::new();
        let log = Log::default();
        let node = recorder(&kernel, &log, "gone");
        assert_eq!(kernel.dispose(node), 1);

        kernel.launch(node, payload(1_i32)).expect("launch");
        assert!(entries(&log).is_empty());
        assert!(matches!(
            kernel.link(node, NodeId::new()),
            Err(KernelError::UnknownNode(id)) if id == node
        ));
    }
}

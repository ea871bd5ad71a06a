//! Work Queue
//!
//! Pending updates live in two places:
//!
//! - the inline stack, popped last-in first-out so propagation runs
//!   depth-first through `next` edges in declaration order;
//! - the deferred queue, popped first-in first-out, and only once no inline
//!   work remains.
//!
//! The queue also records whether a drain is active, so a launch made while
//! one is running only enqueues and lets that drain pick the work up.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::stack::Stack;
use crate::graph::{NodeId, Payload};

/// One payload on its way to one node.
pub struct Update {
    pub target: NodeId,
    pub payload: Payload,
    pub parent: Option<Arc<Stack>>,
    /// Index of the first step to run; non-zero for barrier continuations.
    pub resume_at: usize,
}

impl fmt::Debug for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Update")
            .field("target", &self.target)
            .field("parent", &self.parent.as_ref().map(|p| p.node()))
            .field("resume_at", &self.resume_at)
            .finish()
    }
}

/// A request to schedule one or more updates together.
///
/// All targets of a launch are enqueued under one lock acquisition, in
/// order, so they form one batch with respect to other launches.
pub struct Launch {
    pub(crate) targets: SmallVec<[(NodeId, Payload); 3]>,
    pub(crate) parent: Option<Arc<Stack>>,
    pub(crate) defer: bool,
}

impl Launch {
    pub fn new(target: NodeId, payload: Payload) -> Self {
        let mut targets = SmallVec::new();
        targets.push((target, payload));
        Self {
            targets,
            parent: None,
            defer: false,
        }
    }

    /// Launch several targets, each with its own payload.
    pub fn batch<I>(targets: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, Payload)>,
    {
        Self {
            targets: targets.into_iter().collect(),
            parent: None,
            defer: false,
        }
    }

    /// Run on the deferred queue instead of inline.
    pub fn deferred(mut self) -> Self {
        self.defer = true;
        self
    }

    /// Record the frame of the update that caused this launch.
    pub fn parent(mut self, parent: &Arc<Stack>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    pub fn is_deferred(&self) -> bool {
        self.defer
    }
}

#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    inline: Vec<Update>,
    deferred: VecDeque<Update>,
    pub(crate) draining: bool,
}

impl WorkQueue {
    pub(crate) fn push_launch(&mut self, launch: Launch) {
        let Launch {
            targets,
            parent,
            defer,
        } = launch;
        let updates = targets.into_iter().map(|(target, payload)| Update {
            target,
            payload,
            parent: parent.clone(),
            resume_at: 0,
        });
        if defer {
            self.deferred.extend(updates);
        } else {
            self.push_inline(updates);
        }
    }

    /// Push updates so that the first one is popped first.
    pub(crate) fn push_inline<I>(&mut self, updates: I)
    where
        I: IntoIterator<Item = Update>,
        I::IntoIter: DoubleEndedIterator,
    {
        self.inline.extend(updates.into_iter().rev());
    }

    pub(crate) fn push_deferred(&mut self, update: Update) {
        self.deferred.push_back(update);
    }

    pub(crate) fn pop(&mut self) -> Option<Update> {
        self.inline.pop().or_else(|| self.deferred.pop_front())
    }

    pub(crate) fn clear_inline(&mut self) -> usize {
        let dropped = self.inline.len();
        self.inline.clear();
        dropped
    }

    pub(crate) fn clear(&mut self) {
        self.inline.clear();
        self.deferred.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.inline.len() + self.deferred.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::payload;

    fn targets(queue: &mut WorkQueue) -> Vec<NodeId> {
        std::iter::from_fn(|| queue.pop()).map(|u| u.target).collect()
    }

    #[test]
    fn inline_work_runs_before_deferred() {
        let (a, b, c) = (NodeId::new(), NodeId::new(), NodeId::new());
        let mut queue = WorkQueue::default();

        queue.push_launch(Launch::new(a, payload(())).deferred());
        queue.push_launch(Launch::new(b, payload(())));
        queue.push_launch(Launch::new(c, payload(())).deferred());

        assert_eq!(queue.len(), 3);
        assert_eq!(targets(&mut queue), vec![b, a, c]);
    }

    #[test]
    fn batch_keeps_declaration_order() {
        let ids: Vec<NodeId> = (0..3).map(|_| NodeId::new()).collect();
        let mut queue = WorkQueue::default();

        queue.push_launch(Launch::batch(ids.iter().map(|id| (*id, payload(())))));
        assert_eq!(targets(&mut queue), ids);

        queue.push_launch(Launch::batch(ids.iter().map(|id| (*id, payload(())))).deferred());
        assert_eq!(targets(&mut queue), ids);
    }

    #[test]
    fn clear_inline_keeps_deferred() {
        let (a, b) = (NodeId::new(), NodeId::new());
        let mut queue = WorkQueue::default();
        queue.push_launch(Launch::new(a, payload(())));
        queue.push_launch(Launch::new(b, payload(())).deferred());

        assert_eq!(queue.clear_inline(), 1);
        assert_eq!(targets(&mut queue), vec![b]);
    }
}

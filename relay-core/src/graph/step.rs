//! Step Pipeline
//!
//! Every node carries an ordered list of steps that is executed against the
//! payload of an update. A step can transform the payload, veto it, or ask
//! the scheduler to continue the rest of the pipeline on the deferred queue.
//!
//! Step functions receive a [`StepContext`] giving them the node's scope, the
//! call-stack frame of the update, and the kernel to launch into.

use std::any::{type_name, Any};
use std::fmt;
use std::sync::Arc;

use super::node::NodeId;
use super::scope::Scope;
use crate::error::{BoxError, KernelError};
use crate::kernel::{Kernel, Stack};

/// A type-erased value traveling through the graph.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Wrap a value as a payload.
pub fn payload<T>(value: T) -> Payload
where
    T: Any + Send + Sync,
{
    Arc::new(value)
}

/// Borrow the payload as `T`, or report the expected type.
pub fn downcast<T>(payload: &Payload) -> Result<&T, KernelError>
where
    T: Any,
{
    payload
        .downcast_ref::<T>()
        .ok_or(KernelError::PayloadType {
            expected: type_name::<T>(),
        })
}

pub type StepFn =
    Arc<dyn Fn(Payload, &StepContext<'_>) -> Result<Payload, BoxError> + Send + Sync>;
pub type FilterFn =
    Arc<dyn Fn(&Payload, &StepContext<'_>) -> Result<bool, BoxError> + Send + Sync>;

/// Everything a step function can see while it runs.
pub struct StepContext<'a> {
    pub node: NodeId,
    pub scope: &'a Scope,
    pub stack: &'a Arc<Stack>,
    pub kernel: &'a Kernel,
}

/// One operation of a node pipeline.
#[derive(Clone)]
pub enum Step {
    /// Pure transform of the payload.
    Compute(StepFn),
    /// `false` halts propagation of this branch.
    Filter(FilterFn),
    /// Transform that is allowed to have side effects.
    Run(StepFn),
    /// Continue the remaining steps from the deferred queue.
    Barrier,
}

impl Step {
    pub fn compute<F>(f: F) -> Self
    where
        F: Fn(Payload, &StepContext<'_>) -> Result<Payload, BoxError> + Send + Sync + 'static,
    {
        Self::Compute(Arc::new(f))
    }

    pub fn filter<F>(f: F) -> Self
    where
        F: Fn(&Payload, &StepContext<'_>) -> Result<bool, BoxError> + Send + Sync + 'static,
    {
        Self::Filter(Arc::new(f))
    }

    pub fn run<F>(f: F) -> Self
    where
        F: Fn(Payload, &StepContext<'_>) -> Result<Payload, BoxError> + Send + Sync + 'static,
    {
        Self::Run(Arc::new(f))
    }

    pub fn barrier() -> Self {
        Self::Barrier
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Compute(_) => "compute",
            Self::Filter(_) => "filter",
            Self::Run(_) => "run",
            Self::Barrier => "barrier",
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Result of running a pipeline.
pub enum Flow {
    /// All steps passed; propagate this payload downstream.
    Continue(Payload),
    /// A filter vetoed the update.
    Halt,
    /// A barrier was reached; resume at `resume_at` on the deferred queue.
    Defer { resume_at: usize, payload: Payload },
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue(_) => f.write_str("Continue"),
            Self::Halt => f.write_str("Halt"),
            Self::Defer { resume_at, .. } => write!(f, "Defer({resume_at})"),
        }
    }
}

/// Run `steps[start..]` against `payload`.
pub fn run_pipeline(
    steps: &[Step],
    start: usize,
    mut payload: Payload,
    ctx: &StepContext<'_>,
) -> Result<Flow, BoxError> {
    for (index, step) in steps.iter().enumerate().skip(start) {
        match step {
            Step::Compute(f) | Step::Run(f) => payload = f(payload, ctx)?,
            Step::Filter(f) => {
                if !f(&payload, ctx)? {
                    return Ok(Flow::Halt);
                }
            }
            Step::Barrier => {
                return Ok(Flow::Defer {
                    resume_at: index + 1,
                    payload,
                })
            }
        }
    }
    Ok(Flow::Continue(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;

    fn with_ctx<R>(f: impl FnOnce(&StepContext<'_>) -> R) -> R {
        let kernel = Kernel::new();
        let scope = Scope::new();
        let node = NodeId::new();
        let stack = Arc::new(Stack::root(node));
        let ctx = StepContext {
            node,
            scope: &scope,
            stack: &stack,
            kernel: &kernel,
        };
        f(&ctx)
    }

    fn add(n: i32) -> Step {
        Step::compute(move |p, _| Ok(payload(*downcast::<i32>(&p)? + n)))
    }

    #[test]
    fn steps_run_in_order() {
        let steps = vec![
            add(1),
            Step::compute(|p, _| Ok(payload(*downcast::<i32>(&p)? * 10))),
        ];
        let flow = with_ctx(|ctx| run_pipeline(&steps, 0, payload(1_i32), ctx));
        match flow {
            Ok(Flow::Continue(p)) => assert_eq!(p.downcast_ref::<i32>(), Some(&20)),
            other => panic!("unexpected flow: {other:?}"),
        }
    }

    #[test]
    fn filter_halts() {
        let steps = vec![Step::filter(|p, _| Ok(*downcast::<i32>(p)? > 5)), add(1)];
        let flow = with_ctx(|ctx| run_pipeline(&steps, 0, payload(3_i32), ctx));
        assert!(matches!(flow, Ok(Flow::Halt)));
    }

    #[test]
    fn barrier_defers_and_resumes() {
        let steps = vec![add(1), Step::barrier(), add(100)];
        let flow = with_ctx(|ctx| run_pipeline(&steps, 0, payload(0_i32), ctx));
        let (resume_at, p) = match flow {
            Ok(Flow::Defer { resume_at, payload }) => (resume_at, payload),
            other => panic!("unexpected flow: {other:?}"),
        };
        assert_eq!(resume_at, 2);
        assert_eq!(p.downcast_ref::<i32>(), Some(&1));

        let resumed = with_ctx(|ctx| run_pipeline(&steps, resume_at, p, ctx));
        match resumed {
            Ok(Flow::Continue(p)) => assert_eq!(p.downcast_ref::<i32>(), Some(&101)),
            other => panic!("unexpected flow: {other:?}"),
        }
    }

    #[test]
    fn step_errors_propagate() {
        let steps = vec![add(1)];
        let flow = with_ctx(|ctx| run_pipeline(&steps, 0, payload("text"), ctx));
        let err = flow.err().map(|e| e.to_string()).unwrap_or_default();
        assert!(err.contains("payload type mismatch"));
    }
}

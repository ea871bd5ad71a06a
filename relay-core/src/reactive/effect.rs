//! Effect Implementation
//!
//! An effect turns one call of a pluggable handler into exactly one
//! settlement, reported back into the graph.
//!
//! # How Effects Work
//!
//! Every effect is a small cluster of nodes owned by the instance node:
//!
//! 1. The instance node accepts a call, either raw params arriving through
//!    graph propagation or a packaged direct call from [`Effect::create`].
//!    It schedules the runner on the deferred queue and passes the params
//!    on, which bumps `in_flight`.
//!
//! 2. The runner invokes the current handler. A ready result settles at
//!    once; a pending one settles whenever its thenable does, possibly on
//!    another thread.
//!
//! 3. Settlement launches one deferred batch: `finally`, then `done` or
//!    `fail`, then the sidechain. `done`/`fail` decrement `in_flight`; the
//!    sidechain completes the [`Call`] of a direct invocation.
//!
//! The settler is consumed by settling, so a call cannot settle twice.
//!
//! A handler that panics is caught in the runner. The call skips
//! `finally`/`done`/`fail`, is counted out of `in_flight` through the
//! abort node, and a direct caller receives [`CallError::Panicked`].
//!
//! # Handlers
//!
//! A handler is any `Fn(P) -> HandlerResult<D, E>`. `use_handler` swaps it
//! in place; calls already running keep the handler they started with.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{error, trace, warn};

use super::event::Event;
use super::store::{Store, StoreConfig};
use super::subscription::Subscription;
use super::thenable::HandlerResult;
use super::{Unit, Value};
use crate::error::{CallError, KernelError};
use crate::graph::{
    downcast, payload, FxRole, NodeBuilder, NodeId, NodeOp, NodeRef, Payload, Scope, Step,
    UnitKind,
};
use crate::kernel::{Kernel, Launch, Stack};

const RUNNER: &str = "runner";
const HANDLER: &str = "handler";
const DONE: &str = "done";
const FAIL: &str = "fail";
const FINALLY: &str = "finally";
const SIDECHAIN: &str = "sidechain";
const ABORT: &str = "abort";
const IN_FLIGHT: &str = "in_flight";
const PENDING: &str = "pending";

/// A replaceable effect handler.
pub type Handler<P, D, E> = Arc<dyn Fn(P) -> HandlerResult<D, E> + Send + Sync>;

/// Payload of `done`.
#[derive(Debug, Clone, PartialEq)]
pub struct Done<P, D> {
    pub params: P,
    pub result: D,
}

/// Payload of `fail`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fail<P, E> {
    pub params: P,
    pub error: E,
}

/// Payload of `finally`.
#[derive(Debug, Clone, PartialEq)]
pub enum Finally<P, D, E> {
    Done { params: P, result: D },
    Fail { params: P, error: E },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Done,
    Fail,
}

impl<P, D, E> Finally<P, D, E> {
    pub fn status(&self) -> Status {
        match self {
            Self::Done { .. } => Status::Done,
            Self::Fail { .. } => Status::Fail,
        }
    }

    pub fn params(&self) -> &P {
        match self {
            Self::Done { params, .. } | Self::Fail { params, .. } => params,
        }
    }
}

/// Completes the [`Call`] of one direct invocation.
pub struct Resolver<D, E> {
    tx: Mutex<Option<oneshot::Sender<Result<D, CallError<E>>>>>,
}

impl<D, E> Resolver<D, E> {
    fn new(tx: oneshot::Sender<Result<D, CallError<E>>>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Returns `false` if already resolved or if the caller dropped its
    /// `Call`.
    fn resolve(&self, outcome: Result<D, CallError<E>>) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}

/// How a call reached the effect.
pub enum Invocation<D, E> {
    /// Through [`Effect::create`]; a caller awaits the outcome.
    Direct(Arc<Resolver<D, E>>),
    /// Through graph propagation; nobody awaits the outcome.
    Reactive,
}

impl<D, E> Invocation<D, E> {
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct(_))
    }
}

impl<D, E> Clone for Invocation<D, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Direct(resolver) => Self::Direct(Arc::clone(resolver)),
            Self::Reactive => Self::Reactive,
        }
    }
}

impl<D, E> fmt::Debug for Invocation<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(_) => f.write_str("Direct"),
            Self::Reactive => f.write_str("Reactive"),
        }
    }
}

/// A call travelling from the instance node to the runner.
struct EffectCall<P, D, E> {
    params: P,
    invocation: Invocation<D, E>,
}

/// An outcome travelling to the sidechain.
struct SettleRequest<D, E> {
    invocation: Invocation<D, E>,
    outcome: Result<D, CallError<E>>,
}

/// The outcome of one [`Effect::create`] call.
///
/// Await it, or poll it without blocking through [`Call::try_result`].
#[must_use = "a Call does nothing unless awaited or polled"]
pub struct Call<D, E> {
    rx: oneshot::Receiver<Result<D, CallError<E>>>,
}

impl<D, E> Call<D, E> {
    /// The outcome if the call has settled. Returns `None` while pending
    /// and `Abandoned` once the outcome has been taken.
    pub fn try_result(&mut self) -> Option<Result<D, CallError<E>>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CallError::Abandoned)),
        }
    }
}

impl<D, E> Future for Call<D, E> {
    type Output = Result<D, CallError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::Abandoned),
        })
    }
}

impl<D, E> fmt::Debug for Call<D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call").finish_non_exhaustive()
    }
}

/// Per-effect configuration.
pub struct EffectConfig<P, D, E> {
    pub name: Option<String>,
    pub handler: Option<Handler<P, D, E>>,
}

impl<P, D, E> EffectConfig<P, D, E> {
    pub fn new() -> Self {
        Self {
            name: None,
            handler: None,
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(P) -> HandlerResult<D, E> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }
}

impl<P, D, E> Default for EffectConfig<P, D, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler installed when none is supplied: logs and resolves empty.
pub(crate) fn unhandled<P, D, E>(name: String) -> Handler<P, D, E>
where
    P: 'static,
    D: Default + 'static,
    E: 'static,
{
    Arc::new(move |_| {
        error!(effect = %name, "no handler used in {name}");
        HandlerResult::ok(D::default())
    })
}

/// Node ids a settlement launches into.
#[derive(Clone, Copy)]
struct Channels {
    done: NodeId,
    fail: NodeId,
    finally: NodeId,
    sidechain: NodeId,
    abort: NodeId,
}

impl Channels {
    fn from_scope(scope: &Scope) -> Result<Self, KernelError> {
        Ok(Self {
            done: scope.node(DONE)?,
            fail: scope.node(FAIL)?,
            finally: scope.node(FINALLY)?,
            sidechain: scope.node(SIDECHAIN)?,
            abort: scope.node(ABORT)?,
        })
    }
}

/// Settles one call. Consumed by [`Settler::settle`].
struct Settler<P, D, E> {
    kernel: Kernel,
    channels: Channels,
    params: P,
    invocation: Invocation<D, E>,
    parent: Arc<Stack>,
}

impl<P, D, E> Settler<P, D, E>
where
    P: Value,
    D: Value,
    E: Value,
{
    fn settle(self, outcome: Result<D, E>) {
        let Self {
            kernel,
            channels,
            params,
            invocation,
            parent,
        } = self;

        let (finally, terminal): (Payload, (NodeId, Payload)) = match &outcome {
            Ok(result) => (
                payload(Finally::<P, D, E>::Done {
                    params: params.clone(),
                    result: result.clone(),
                }),
                (
                    channels.done,
                    payload(Done {
                        params,
                        result: result.clone(),
                    }),
                ),
            ),
            Err(error) => (
                payload(Finally::<P, D, E>::Fail {
                    params: params.clone(),
                    error: error.clone(),
                }),
                (
                    channels.fail,
                    payload(Fail {
                        params,
                        error: error.clone(),
                    }),
                ),
            ),
        };
        trace!(ok = outcome.is_ok(), direct = invocation.is_direct(), "effect settled");

        let launch = Launch::batch([
            (channels.finally, finally),
            terminal,
            (
                channels.sidechain,
                payload(SettleRequest {
                    invocation,
                    outcome: outcome.map_err(CallError::Failed),
                }),
            ),
        ])
        .deferred()
        .parent(&parent);

        if let Err(err) = kernel.schedule(launch) {
            warn!(error = %err, "settlement drain reported a step failure");
        }
    }

    /// Count out a call whose handler panicked.
    fn abort(self, message: String) {
        let Self {
            kernel,
            channels,
            params,
            invocation,
            parent,
        } = self;

        let launch = Launch::batch([
            (channels.abort, payload(params)),
            (
                channels.sidechain,
                payload(SettleRequest::<D, E> {
                    invocation,
                    outcome: Err(CallError::Panicked(message)),
                }),
            ),
        ])
        .deferred()
        .parent(&parent);

        if let Err(err) = kernel.schedule(launch) {
            warn!(error = %err, "abort drain reported a step failure");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

/// Call `handler` once and settle with whatever it produces.
///
/// A panic in the handler, or in handing its thenable a callback, aborts
/// the call unless it already settled.
fn run_effect<P, D, E>(handler: &Handler<P, D, E>, params: P, settler: Settler<P, D, E>)
where
    P: Value,
    D: Value,
    E: Value,
{
    let slot = Arc::new(Mutex::new(Some(settler)));

    let started = panic::catch_unwind(AssertUnwindSafe(|| match handler(params) {
        HandlerResult::Ready(outcome) => Some(outcome),
        HandlerResult::Pending(thenable) => {
            let slot = Arc::clone(&slot);
            thenable.then(Box::new(move |outcome| {
                let settler = slot.lock().take();
                if let Some(settler) = settler {
                    settler.settle(outcome);
                }
            }));
            None
        }
    }));

    match started {
        Ok(Some(outcome)) => {
            let settler = slot.lock().take();
            if let Some(settler) = settler {
                settler.settle(outcome);
            }
        }
        Ok(None) => {}
        Err(panic) => {
            let message = panic_message(&*panic);
            error!(panic = %message, "effect handler panicked");
            let settler = slot.lock().take();
            if let Some(settler) = settler {
                settler.abort(message);
            }
        }
    }
}

/// An effect taking `P`, resolving to `D` and failing with `E`.
///
/// # Example
///
/// ```rust,ignore
/// let kernel = Kernel::new();
/// let double = Effect::with_handler(&kernel, "double", |p: i32| {
///     HandlerResult::<i32, String>::ok(p * 2)
/// });
///
/// let mut call = double.create(5);
/// assert_eq!(call.try_result(), Some(Ok(10)));
/// assert!(!double.pending().get());
/// ```
pub struct Effect<P, D, E> {
    kernel: Kernel,
    id: NodeId,
    runner: NodeId,
    runner_scope: Arc<Scope>,
    done: Event<Done<P, D>>,
    fail: Event<Fail<P, E>>,
    finally: Event<Finally<P, D, E>>,
    in_flight: Store<usize>,
    pending: Store<bool>,
}

impl<P, D, E> Effect<P, D, E>
where
    P: Value,
    D: Value,
    E: Value,
{
    /// Effect with the default handler, which logs an error and resolves
    /// `D::default()`.
    pub fn new(kernel: &Kernel, name: impl Into<String>) -> Self
    where
        D: Default,
    {
        let name = name.into();
        Self::build(kernel, name.clone(), None, unhandled(name))
    }

    pub fn with_handler<F>(kernel: &Kernel, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(P) -> HandlerResult<D, E> + Send + Sync + 'static,
    {
        Self::build(kernel, name.into(), None, Arc::new(handler))
    }

    /// Effect from `config`, falling back to the default handler when the
    /// config carries none.
    pub fn with_config(kernel: &Kernel, config: EffectConfig<P, D, E>) -> Self
    where
        D: Default,
    {
        let name = config.name.unwrap_or_else(|| "effect".to_string());
        let handler = config
            .handler
            .unwrap_or_else(|| unhandled(name.clone()));
        Self::build(kernel, name, None, handler)
    }

    /// Effect from `config` without a default handler. Fails with
    /// [`KernelError::MissingHandler`] when the config carries none.
    pub fn try_with_config(
        kernel: &Kernel,
        config: EffectConfig<P, D, E>,
    ) -> Result<Self, KernelError> {
        let name = config.name.unwrap_or_else(|| "effect".to_string());
        match config.handler {
            Some(handler) => Ok(Self::build(kernel, name, None, handler)),
            None => Err(KernelError::MissingHandler { effect: name }),
        }
    }

    pub(crate) fn build(
        kernel: &Kernel,
        name: String,
        owner: Option<NodeId>,
        handler: Handler<P, D, E>,
    ) -> Self {
        let mut instance = NodeBuilder::new()
            .name(name.clone())
            .unit(UnitKind::Effect)
            .on_copy(&[RUNNER, IN_FLIGHT, PENDING])
            .step(Step::compute(|p, _| {
                if p.is::<EffectCall<P, D, E>>() {
                    return Ok(p);
                }
                let params = downcast::<P>(&p)?.clone();
                Ok(payload(EffectCall::<P, D, E> {
                    params,
                    invocation: Invocation::Reactive,
                }))
            }))
            .step(Step::run(|p, ctx| {
                let call = downcast::<EffectCall<P, D, E>>(&p)?;
                let runner = ctx.scope.node(RUNNER)?;
                ctx.kernel.schedule(
                    Launch::new(runner, Arc::clone(&p))
                        .deferred()
                        .parent(ctx.stack),
                )?;
                Ok(payload(call.params.clone()))
            }));
        if let Some(owner) = owner {
            instance = instance.owned_by(owner);
        }
        let (id, instance_scope) = kernel.add_node_scoped(instance);

        let done: Event<Done<P, D>> = Event::owned(kernel, format!("{name}.done"), id);
        let fail: Event<Fail<P, E>> = Event::owned(kernel, format!("{name}.fail"), id);
        let finally: Event<Finally<P, D, E>> =
            Event::owned(kernel, format!("{name}.finally"), id);

        let sidechain = kernel.add_node(
            NodeBuilder::new()
                .op(NodeOp::Fx(FxRole::Sidechain))
                .owned_by(id)
                .step(Step::run(|p, _| {
                    let request = downcast::<SettleRequest<D, E>>(&p)?;
                    if let Invocation::Direct(resolver) = &request.invocation {
                        if !resolver.resolve(request.outcome.clone()) {
                            trace!("direct caller is gone");
                        }
                    }
                    Ok(p)
                })),
        );
        let abort = kernel.add_node(
            NodeBuilder::new()
                .op(NodeOp::Fx(FxRole::Abort))
                .owned_by(id),
        );

        let (runner, runner_scope) = kernel.add_node_scoped(
            NodeBuilder::new()
                .op(NodeOp::Fx(FxRole::Runner))
                .owned_by(id)
                .on_copy(&[DONE, FAIL, FINALLY, SIDECHAIN, ABORT])
                .scope_entry(HANDLER, payload(handler))
                .scope_entry(DONE, payload(NodeRef(done.node())))
                .scope_entry(FAIL, payload(NodeRef(fail.node())))
                .scope_entry(FINALLY, payload(NodeRef(finally.node())))
                .scope_entry(SIDECHAIN, payload(NodeRef(sidechain)))
                .scope_entry(ABORT, payload(NodeRef(abort)))
                .step(Step::run(|p, ctx| {
                    let call = downcast::<EffectCall<P, D, E>>(&p)?;
                    let handler = ctx.scope.require::<Handler<P, D, E>>(HANDLER)?;
                    let settler = Settler {
                        kernel: ctx.kernel.clone(),
                        channels: Channels::from_scope(ctx.scope)?,
                        params: call.params.clone(),
                        invocation: call.invocation.clone(),
                        parent: Arc::clone(ctx.stack),
                    };
                    trace!(runner = %ctx.node, "running effect handler");
                    run_effect(&handler, call.params.clone(), settler);
                    Ok(p)
                })),
        );
        instance_scope.set_node(RUNNER, runner);

        let in_flight = Store::with_config(
            kernel,
            0_usize,
            StoreConfig::new().name(format!("{name}.in_flight")),
        );
        kernel.adopt(id, in_flight.node());
        in_flight.on_node(id, |count, _: &P| count + 1);
        in_flight.on_node(done.node(), |count, _: &Done<P, D>| count.saturating_sub(1));
        in_flight.on_node(fail.node(), |count, _: &Fail<P, E>| count.saturating_sub(1));
        in_flight.on_node(abort, |count, _: &P| count.saturating_sub(1));
        let pending = in_flight.map(|count| *count > 0);

        instance_scope.set_node(IN_FLIGHT, in_flight.node());
        instance_scope.set_node(PENDING, pending.node());

        Self {
            kernel: kernel.clone(),
            id,
            runner,
            runner_scope,
            done,
            fail,
            finally,
            in_flight,
            pending,
        }
    }

    /// Replace the handler. Calls already running are unaffected.
    pub fn use_handler<F>(&self, handler: F) -> &Self
    where
        F: Fn(P) -> HandlerResult<D, E> + Send + Sync + 'static,
    {
        let handler: Handler<P, D, E> = Arc::new(handler);
        self.runner_scope.set(HANDLER, payload(handler));
        self
    }

    pub fn current_handler(&self) -> Handler<P, D, E> {
        self.runner_scope
            .get_as::<Handler<P, D, E>>(HANDLER)
            .expect("effect runner holds a handler")
    }

    /// Call the effect with `params`.
    ///
    /// A failing step elsewhere in the resulting drain is logged; use
    /// [`Effect::try_create`] to receive it instead.
    pub fn create(&self, params: P) -> Call<D, E> {
        let (call, launch) = self.direct(params);
        if let Err(err) = launch {
            warn!(effect = %self.id, error = %err, "drain after effect call failed");
        }
        call
    }

    pub fn try_create(&self, params: P) -> Result<Call<D, E>, KernelError> {
        let (call, launch) = self.direct(params);
        launch.map(|()| call)
    }

    fn direct(&self, params: P) -> (Call<D, E>, Result<(), KernelError>) {
        let (tx, rx) = oneshot::channel();
        let call = EffectCall::<P, D, E> {
            params,
            invocation: Invocation::Direct(Arc::new(Resolver::new(tx))),
        };
        let launch = self.kernel.launch(self.id, payload(call));
        (Call { rx }, launch)
    }

    pub fn done(&self) -> &Event<Done<P, D>> {
        &self.done
    }

    pub fn fail(&self) -> &Event<Fail<P, E>> {
        &self.fail
    }

    pub fn finally(&self) -> &Event<Finally<P, D, E>> {
        &self.finally
    }

    /// Number of calls that have not settled yet.
    pub fn in_flight(&self) -> &Store<usize> {
        &self.in_flight
    }

    /// `true` while `in_flight` is non-zero.
    pub fn pending(&self) -> &Store<bool> {
        &self.pending
    }

    /// Run `f` with the params of every accepted call.
    pub fn watch<F>(&self, f: F) -> Subscription
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        Subscription::watch(&self.kernel, self.id, f)
    }

    /// Independent copy of this effect with its own handler reference,
    /// channels and counters.
    ///
    /// Counters start from the values they have now. Subscriptions of the
    /// original are shared with the copy.
    pub fn fork(&self) -> Result<Self, KernelError> {
        let mapping = self.kernel.fork(&[self.id]);
        let remap = |id: NodeId| mapping.get(&id).copied().ok_or(KernelError::UnknownNode(id));

        let runner = remap(self.runner)?;
        Ok(Self {
            kernel: self.kernel.clone(),
            id: remap(self.id)?,
            runner,
            runner_scope: self
                .kernel
                .scope(runner)
                .ok_or(KernelError::UnknownNode(runner))?,
            done: Event::attach(&self.kernel, remap(self.done.node())?),
            fail: Event::attach(&self.kernel, remap(self.fail.node())?),
            finally: Event::attach(&self.kernel, remap(self.finally.node())?),
            in_flight: Store::attach(&self.kernel, remap(self.in_flight.node())?)?,
            pending: Store::attach(&self.kernel, remap(self.pending.node())?)?,
        })
    }

    pub fn name(&self) -> Option<String> {
        self.kernel.meta(self.id).and_then(|meta| meta.name)
    }

    /// Remove the effect with its channels and counters.
    ///
    /// A call that has not settled yet resolves to [`CallError::Abandoned`]
    /// once its thenable settles or is dropped. A call whose thenable never
    /// settles stays pending.
    pub fn dispose(&self) -> usize {
        self.kernel.dispose(self.id)
    }
}

impl<P, D, E> Unit for Effect<P, D, E>
where
    P: Value,
    D: Value,
    E: Value,
{
    type Payload = P;

    fn node(&self) -> NodeId {
        self.id
    }

    fn kernel(&self) -> &Kernel {
        &self.kernel
    }
}

impl<P, D, E> Clone for Effect<P, D, E> {
    fn clone(&self) -> Self {
        Self {
            kernel: self.kernel.clone(),
            id: self.id,
            runner: self.runner,
            runner_scope: Arc::clone(&self.runner_scope),
            done: self.done.clone(),
            fail: self.fail.clone(),
            finally: self.finally.clone(),
            in_flight: self.in_flight.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<P, D, E> fmt::Debug for Effect<P, D, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.id)
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}

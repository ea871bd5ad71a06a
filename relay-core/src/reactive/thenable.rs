//! Handler results and deferred settlement.
//!
//! A handler either finishes on the spot or hands back something that will
//! settle later. Anything that can report its settlement to a callback
//! implements [`Thenable`]; [`Promise`] is a manually settled one and
//! [`HandlerResult::from_future`] adapts a future.

use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;

/// Callback receiving the outcome of a thenable.
pub type Settle<T, E> = Box<dyn FnOnce(Result<T, E>) + Send>;

/// A value that settles at most once and reports it to a subscriber.
pub trait Thenable<T, E>: Send {
    /// Call `settle` with the outcome, now or once it is known.
    fn then(self: Box<Self>, settle: Settle<T, E>);
}

/// What a handler returns.
pub enum HandlerResult<D, E> {
    /// Finished synchronously. `Err` is a synchronous failure.
    Ready(Result<D, E>),
    /// Settles later.
    Pending(Box<dyn Thenable<D, E>>),
}

impl<D, E> HandlerResult<D, E> {
    pub fn ok(value: D) -> Self {
        Self::Ready(Ok(value))
    }

    pub fn err(error: E) -> Self {
        Self::Ready(Err(error))
    }

    pub fn pending<T>(thenable: T) -> Self
    where
        T: Thenable<D, E> + 'static,
    {
        Self::Pending(Box::new(thenable))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }
}

impl<D, E> HandlerResult<D, E>
where
    D: Send + 'static,
    E: Send + 'static,
{
    /// Settle with the output of `future`, driven on the ambient Tokio
    /// runtime.
    ///
    /// # Panics
    ///
    /// The future is spawned when the effect runner subscribes to it, on
    /// the thread running the handler. Without a Tokio runtime on that
    /// thread the subscription panics; an effect runner reports this as
    /// [`CallError::Panicked`](crate::error::CallError::Panicked).
    pub fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = Result<D, E>> + Send + 'static,
    {
        Self::Pending(Box::new(Spawned {
            future: future.boxed(),
        }))
    }
}

impl<D, E> From<Result<D, E>> for HandlerResult<D, E> {
    fn from(result: Result<D, E>) -> Self {
        Self::Ready(result)
    }
}

impl<D, E> From<Promise<D, E>> for HandlerResult<D, E>
where
    D: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn from(promise: Promise<D, E>) -> Self {
        Self::pending(promise)
    }
}

impl<D, E> fmt::Debug for HandlerResult<D, E>
where
    D: fmt::Debug,
    E: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

struct Spawned<D, E> {
    future: BoxFuture<'static, Result<D, E>>,
}

impl<D, E> Thenable<D, E> for Spawned<D, E>
where
    D: Send + 'static,
    E: Send + 'static,
{
    fn then(self: Box<Self>, settle: Settle<D, E>) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => panic!("future handler needs a Tokio runtime: {err}"),
        };
        let future = self.future;
        runtime.spawn(async move {
            settle(future.await);
        });
    }
}

enum PromiseState<T, E> {
    Pending(Vec<Settle<T, E>>),
    Settled(Result<T, E>),
}

/// A manually settled thenable.
///
/// Clones share state: settle one clone from anywhere, and every
/// subscriber of every clone is notified once.
///
/// ```rust,ignore
/// let promise = Promise::new();
/// effect.use_handler({
///     let promise = promise.clone();
///     move |_: u32| promise.clone().into()
/// });
/// let call = effect.create(1);
/// promise.resolve("ready".to_string());
/// ```
pub struct Promise<T, E> {
    state: Arc<Mutex<PromiseState<T, E>>>,
}

impl<T, E> Promise<T, E>
where
    T: Clone,
    E: Clone,
{
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PromiseState::Pending(Vec::new()))),
        }
    }

    pub fn resolved(value: T) -> Self {
        Self::settled(Ok(value))
    }

    pub fn rejected(error: E) -> Self {
        Self::settled(Err(error))
    }

    fn settled(result: Result<T, E>) -> Self {
        Self {
            state: Arc::new(Mutex::new(PromiseState::Settled(result))),
        }
    }

    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    /// Settle the promise. Returns `false` if it had already settled, in
    /// which case `result` is discarded.
    pub fn settle(&self, result: Result<T, E>) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                PromiseState::Settled(_) => return false,
                PromiseState::Pending(waiters) => {
                    let waiters = mem::take(waiters);
                    *state = PromiseState::Settled(result.clone());
                    waiters
                }
            }
        };
        for waiter in waiters {
            waiter(result.clone());
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        matches!(*self.state.lock(), PromiseState::Settled(_))
    }

    /// The outcome, if settled.
    pub fn result(&self) -> Option<Result<T, E>> {
        match &*self.state.lock() {
            PromiseState::Settled(result) => Some(result.clone()),
            PromiseState::Pending(_) => None,
        }
    }
}

impl<T, E> Default for Promise<T, E>
where
    T: Clone,
    E: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T, E> Thenable<T, E> for Promise<T, E>
where
    T: Clone + Send,
    E: Clone + Send,
{
    fn then(self: Box<Self>, settle: Settle<T, E>) {
        let ready = {
            let mut state = self.state.lock();
            match &mut *state {
                PromiseState::Pending(waiters) => {
                    waiters.push(settle);
                    return;
                }
                PromiseState::Settled(result) => result.clone(),
            }
        };
        settle(ready);
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let settled = matches!(*self.state.lock(), PromiseState::Settled(_));
        f.debug_struct("Promise").field("settled", &settled).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record<T, E>(thenable: impl Thenable<T, E> + 'static) -> Arc<Mutex<Vec<Result<T, E>>>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        Box::new(thenable).then(Box::new(move |result| sink.lock().push(result)));
        seen
    }

    #[test]
    fn promise_notifies_waiters_once() {
        let promise = Promise::<i32, String>::new();
        let first = record(promise.clone());
        let second = record(promise.clone());
        assert!(first.lock().is_empty());

        assert!(promise.resolve(3));
        assert!(!promise.reject("late".to_string()));

        assert_eq!(*first.lock(), vec![Ok(3)]);
        assert_eq!(*second.lock(), vec![Ok(3)]);
        assert_eq!(promise.result(), Some(Ok(3)));
    }

    #[test]
    fn settled_promise_calls_back_immediately() {
        let promise = Promise::<i32, &str>::rejected("boom");
        assert!(promise.is_settled());
        assert_eq!(*record(promise).lock(), vec![Err("boom")]);
    }

    #[test]
    fn handler_result_conversions() {
        let ready: HandlerResult<i32, ()> = Ok(1).into();
        assert!(ready.is_ready());

        let pending: HandlerResult<i32, ()> = Promise::new().into();
        assert!(!pending.is_ready());
    }

    #[tokio::test]
    async fn future_settles_on_the_runtime() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let result = HandlerResult::<i32, String>::from_future(async { Ok(42) });
        let HandlerResult::Pending(thenable) = result else {
            panic!("from_future must be pending");
        };

        thenable.then(Box::new(move |result| {
            let _ = tx.send(result);
        }));
        assert_eq!(rx.await.expect("settled"), Ok(42));
    }
}

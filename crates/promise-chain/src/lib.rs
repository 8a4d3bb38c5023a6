//! Single-threaded promises with chaining and awaitable settlement.
//!
//! A [`Promise`] runs its work function as a task on the thread's
//! scheduler (see [`spawn`]), settles exactly once with a [`Values`]
//! sequence, and runs queued reactions as separate tasks once it does.
//!
//! ```
//! use promise_chain::spawn::SimpleExecutor;
//! use promise_chain::{values, Promise};
//!
//! let executor = SimpleExecutor::new();
//! let doubled = Promise::resolved(21).then(|v| Ok(v.integer(0)? * 2));
//! let result = executor.run_until(doubled.wait()).unwrap();
//! assert_eq!(result.unwrap(), values![42]);
//! ```
use futures::FutureExt;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use thiserror::*;

pub mod spawn;
pub mod value;

use spawn::Task;
pub use value::{Value, ValueError, Values};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Fulfilled => "fulfilled",
            Self::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Returned by [`Promise::wait`] when the promise was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("promise rejected: {values}")]
pub struct Rejection {
    pub values: Values,
}

type Reaction = Box<dyn FnOnce(Values)>;

/// What a chained handler decided for the derived promise.
enum Settlement {
    Fulfilled(Values),
    Rejected(Values),
}

type Handler = Box<dyn FnOnce(Values) -> Settlement>;

struct Core {
    state: State,
    /// Present exactly when `state` is not `Pending`.
    value: Option<Values>,
    on_fulfilled: Vec<Reaction>,
    on_rejected: Vec<Reaction>,
    task: Option<Task<()>>,
}

impl Core {
    fn settled(&self) -> Option<(State, Values)> {
        match (self.state, &self.value) {
            (State::Pending, _) => None,
            (state, Some(values)) => Some((state, values.clone())),
            (state, None) => unreachable!("{state} promise has no value"),
        }
    }
}

#[derive(Clone)]
struct Settler {
    core: Rc<RefCell<Core>>,
}

impl Settler {
    fn settle(&self, state: State, values: Values) {
        let reactions = {
            let mut core = self.core.borrow_mut();
            if core.state != State::Pending {
                panic!(
                    "cannot settle a non-pending promise (already {})",
                    core.state
                );
            }
            core.state = state;
            core.value = Some(values.clone());
            let fulfilled = std::mem::take(&mut core.on_fulfilled);
            let rejected = std::mem::take(&mut core.on_rejected);
            match state {
                State::Fulfilled => fulfilled,
                State::Rejected => rejected,
                State::Pending => unreachable!("settling to pending"),
            }
        };

        log::trace!(
            "promise {state} with [{values}], dispatching {} reactions",
            reactions.len()
        );
        for reaction in reactions {
            let values = values.clone();
            spawn::spawn(async move { reaction(values) }).detach();
        }
    }

    fn apply(&self, settlement: Settlement) {
        match settlement {
            Settlement::Fulfilled(values) => self.settle(State::Fulfilled, values),
            Settlement::Rejected(values) => self.settle(State::Rejected, values),
        }
    }
}

/// Fulfills the promise it was handed out for.
#[derive(Clone)]
pub struct Resolve(Settler);

impl Resolve {
    /// Panics if the promise has already settled.
    pub fn call(&self, values: impl Into<Values>) {
        self.0.settle(State::Fulfilled, values.into());
    }
}

/// Rejects the promise it was handed out for.
#[derive(Clone)]
pub struct Reject(Settler);

impl Reject {
    /// Panics if the promise has already settled.
    pub fn call(&self, values: impl Into<Values>) {
        self.0.settle(State::Rejected, values.into());
    }
}

impl fmt::Debug for Resolve {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Resolve").finish_non_exhaustive()
    }
}

impl fmt::Debug for Reject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Reject").finish_non_exhaustive()
    }
}

/// Wrap a user callback: a returned value fulfills the derived promise,
/// a returned error rejects it with the error's description.
fn handler<F, V>(callback: F) -> Handler
where
    F: FnOnce(Values) -> anyhow::Result<V> + 'static,
    V: Into<Values>,
{
    Box::new(
        move |values| match catch_unwind(AssertUnwindSafe(|| callback(values))) {
            Ok(Ok(out)) => Settlement::Fulfilled(out.into()),
            Ok(Err(err)) => {
                log::trace!("reaction failed: {err:#}");
                Settlement::Rejected(Values::from_fault(&err))
            }
            Err(payload) => {
                let values = Values::from_panic(payload.as_ref());
                log::trace!("reaction panicked: {values}");
                Settlement::Rejected(values)
            }
        },
    )
}

/// A handle to an eventual [`Values`] sequence. Clones share the same
/// underlying promise.
#[derive(Clone)]
pub struct Promise {
    core: Rc<RefCell<Core>>,
}

impl Promise {
    fn pending() -> Self {
        Self {
            core: Rc::new(RefCell::new(Core {
                state: State::Pending,
                value: None,
                on_fulfilled: vec![],
                on_rejected: vec![],
                task: None,
            })),
        }
    }

    fn settler(&self) -> Settler {
        Settler {
            core: Rc::clone(&self.core),
        }
    }

    /// Create a promise whose `work` is spawned on the current thread's
    /// scheduler. `work` settles the promise through the handles it is
    /// given, possibly long after it has suspended; an `Err` returned by
    /// `work` rejects the promise with the error description.
    ///
    /// The returned promise may already be settled when the scheduler runs
    /// tasks immediately; don't rely on either.
    pub fn new<W, Fut>(work: W) -> Self
    where
        W: FnOnce(Resolve, Reject) -> Fut + 'static,
        Fut: Future<Output = anyhow::Result<()>> + 'static,
    {
        let promise = Self::pending();
        let settler = promise.settler();

        let task = spawn::spawn(async move {
            let resolve = Resolve(settler.clone());
            let reject = Reject(settler.clone());
            let outcome = AssertUnwindSafe(async move { work(resolve, reject).await })
                .catch_unwind()
                .await;
            let fault = match outcome {
                Ok(Ok(())) => return,
                Ok(Err(err)) => {
                    log::trace!("promise work failed: {err:#}");
                    Values::from_fault(&err)
                }
                Err(payload) => {
                    let values = Values::from_panic(payload.as_ref());
                    log::trace!("promise work panicked: {values}");
                    values
                }
            };
            // Panics if the work settled before failing.
            settler.settle(State::Rejected, fault);
        });
        promise.core.borrow_mut().task.replace(task);
        promise
    }

    /// A promise that fulfills with `values` as soon as its work runs.
    pub fn resolved(values: impl Into<Values>) -> Self {
        let values = values.into();
        Self::new(move |resolve, _| async move {
            resolve.call(values);
            Ok(())
        })
    }

    /// A promise that rejects with `values` as soon as its work runs.
    pub fn rejected(values: impl Into<Values>) -> Self {
        let values = values.into();
        Self::new(move |_, reject| async move {
            reject.call(values);
            Ok(())
        })
    }

    pub fn state(&self) -> State {
        self.core.borrow().state
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    /// The settlement values, or `None` while pending.
    pub fn value(&self) -> Option<Values> {
        self.core.borrow().value.clone()
    }

    fn chain(&self, on_fulfilled: Handler, on_rejected: Handler) -> Promise {
        let next = Promise::pending();

        let (state, values) = {
            let mut core = self.core.borrow_mut();
            match core.settled() {
                Some(settled) => settled,
                None => {
                    let settler = next.settler();
                    core.on_fulfilled.push(Box::new(move |values: Values| {
                        settler.apply(on_fulfilled(values))
                    }));
                    let settler = next.settler();
                    core.on_rejected.push(Box::new(move |values: Values| {
                        settler.apply(on_rejected(values))
                    }));
                    return next;
                }
            }
        };

        // Already settled: the handler runs right here, outside the borrow
        // so that it is free to chain onto this promise again.
        let handler = match state {
            State::Fulfilled => on_fulfilled,
            _ => on_rejected,
        };
        next.settler().apply(handler(values));
        next
    }

    /// Derive a promise from this one's fulfillment. A rejection passes
    /// through to the derived promise unchanged.
    pub fn then<F, V>(&self, on_fulfilled: F) -> Promise
    where
        F: FnOnce(Values) -> anyhow::Result<V> + 'static,
        V: Into<Values>,
    {
        self.chain(handler(on_fulfilled), Box::new(Settlement::Rejected))
    }

    /// Derive a promise from either outcome. Whatever `on_rejected`
    /// returns fulfills the derived promise; only an error from it
    /// rejects.
    pub fn then_or_else<F, R, V, U>(&self, on_fulfilled: F, on_rejected: R) -> Promise
    where
        F: FnOnce(Values) -> anyhow::Result<V> + 'static,
        R: FnOnce(Values) -> anyhow::Result<U> + 'static,
        V: Into<Values>,
        U: Into<Values>,
    {
        self.chain(handler(on_fulfilled), handler(on_rejected))
    }

    /// Recover from a rejection. Fulfillment passes through unchanged.
    pub fn catch<R, V>(&self, on_rejected: R) -> Promise
    where
        R: FnOnce(Values) -> anyhow::Result<V> + 'static,
        V: Into<Values>,
    {
        self.chain(Box::new(Settlement::Fulfilled), handler(on_rejected))
    }

    /// Run `callback` on either outcome. As with [`Promise::then_or_else`],
    /// its result settles the derived promise, so a rejection that reaches
    /// a succeeding `callback` becomes a fulfillment.
    pub fn finally<F, V>(&self, callback: F) -> Promise
    where
        F: FnOnce(Values) -> anyhow::Result<V> + 'static,
        V: Into<Values>,
    {
        let slot = Rc::new(Cell::new(Some(callback)));
        let take = |slot: Rc<Cell<Option<F>>>| {
            move |values: Values| match slot.take() {
                Some(callback) => callback(values),
                None => unreachable!("finally callback invoked twice"),
            }
        };
        let other = Rc::clone(&slot);
        self.chain(handler(take(slot)), handler(take(other)))
    }

    /// Wait for this promise to settle.
    pub fn wait(&self) -> Wait {
        Wait {
            core: Rc::clone(&self.core),
            waker: None,
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("Promise")
            .field("state", &core.state)
            .field("value", &core.value)
            .field("work_finished", &core.task.as_ref().map(Task::is_finished))
            .finish()
    }
}

impl IntoFuture for Promise {
    type Output = Result<Values, Rejection>;
    type IntoFuture = Wait;

    fn into_future(self) -> Wait {
        self.wait()
    }
}

impl IntoFuture for &Promise {
    type Output = Result<Values, Rejection>;
    type IntoFuture = Wait;

    fn into_future(self) -> Wait {
        self.wait()
    }
}

/// Future returned by [`Promise::wait`].
///
/// The first pending poll registers a wake-up on both reaction queues;
/// the outcome is always read back from the promise itself.
#[must_use = "futures do nothing unless awaited"]
pub struct Wait {
    core: Rc<RefCell<Core>>,
    waker: Option<Rc<Cell<Option<Waker>>>>,
}

impl Future for Wait {
    type Output = Result<Values, Rejection>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();

        let settled = this.core.borrow().settled();
        match settled {
            Some((State::Fulfilled, values)) => return Poll::Ready(Ok(values)),
            Some((_, values)) => return Poll::Ready(Err(Rejection { values })),
            None => {}
        }

        match &this.waker {
            Some(slot) => slot.set(Some(ctx.waker().clone())),
            None => {
                let slot = Rc::new(Cell::new(Some(ctx.waker().clone())));
                let mut core = this.core.borrow_mut();
                let core = &mut *core;
                for queue in [&mut core.on_fulfilled, &mut core.on_rejected] {
                    let slot = Rc::clone(&slot);
                    queue.push(Box::new(move |_: Values| {
                        if let Some(waker) = slot.take() {
                            waker.wake();
                        }
                    }));
                }
                this.waker.replace(slot);
            }
        }
        Poll::Pending
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        // Release the waker now; the queued wake-ups find an empty slot.
        if let Some(slot) = self.waker.take() {
            slot.take();
        }
    }
}

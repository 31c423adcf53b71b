//! Single-assignment futures with cooperative cancellation.
//!
//! A [`Deferred`] is the producing side and a [`Promise`] the observing side of
//! the same slot. The slot transitions from pending to exactly one terminal
//! state; every later `resolve`, `reject` or `cancel` is ignored. This is what
//! lets a timer and a computation race for the same result without either side
//! needing to know whether the other already won.
//!
//! Promises are confined to the thread of the [`EventLoop`](crate::EventLoop)
//! that drives them and are therefore built on `Rc`/`RefCell`.

use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::AsyncError;

/// The outcome every observer receives once a promise settles.
pub type Settlement<T> = Result<T, AsyncError>;

/// The observable lifecycle of a promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Resolved,
    Rejected,
    Cancelled,
}

impl PromiseState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        !matches!(self, PromiseState::Pending)
    }
}

type Observer<T> = Box<dyn FnOnce(&Settlement<T>)>;
type CancelHook = Box<dyn FnOnce()>;

struct Slot<T> {
    state: PromiseState,
    outcome: Option<Settlement<T>>,
    observers: Vec<Observer<T>>,
    cancel_hooks: Vec<CancelHook>,
    wakers: Vec<Waker>,
}

/// The observing side of a single-assignment result.
///
/// `Promise` is a cheap handle; clones observe the same slot. Awaiting it
/// yields `Ok(value)` when resolved and `Err(..)` when rejected or cancelled.
pub struct Promise<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

/// The producing side of a [`Promise`].
pub struct Deferred<T> {
    promise: Promise<T>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self { slot: Rc::clone(&self.slot) }
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self { promise: self.promise.clone() }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise").field("state", &self.slot.borrow().state).finish()
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("state", &self.promise.state()).finish()
    }
}

impl<T> Promise<T> {
    fn pending() -> Self {
        Self {
            slot: Rc::new(RefCell::new(Slot {
                state: PromiseState::Pending,
                outcome: None,
                observers: Vec::new(),
                cancel_hooks: Vec::new(),
                wakers: Vec::new(),
            })),
        }
    }

    pub fn state(&self) -> PromiseState {
        self.slot.borrow().state
    }

    pub fn is_settled(&self) -> bool {
        self.state().is_terminal()
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// Creates a promise that is already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        let deferred = Deferred::new();
        deferred.resolve(value);
        deferred.promise()
    }

    /// Creates a promise that is already rejected with `error`.
    pub fn rejected(error: AsyncError) -> Self {
        let deferred = Deferred::new();
        deferred.reject(error);
        deferred.promise()
    }

    /// Returns a copy of the settlement, or `None` while pending.
    pub fn outcome(&self) -> Option<Settlement<T>> {
        self.slot.borrow().outcome.clone()
    }

    /// Registers an observer invoked once with the settlement.
    ///
    /// If the promise has already settled the observer runs immediately.
    pub fn on_settle<F>(&self, observer: F)
    where
        F: FnOnce(&Settlement<T>) + 'static,
    {
        let settled = {
            let mut slot = self.slot.borrow_mut();
            match &slot.outcome {
                Some(outcome) => outcome.clone(),
                None => {
                    slot.observers.push(Box::new(observer));
                    return;
                }
            }
        };
        observer(&settled);
    }

    /// Registers cleanup that runs exactly once if the promise is cancelled.
    ///
    /// Hooks registered after cancellation run immediately; hooks registered
    /// after a resolve or reject are dropped without running.
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + 'static,
    {
        let run_now = {
            let mut slot = self.slot.borrow_mut();
            match slot.state {
                PromiseState::Pending => {
                    slot.cancel_hooks.push(Box::new(hook));
                    return;
                }
                PromiseState::Cancelled => true,
                PromiseState::Resolved | PromiseState::Rejected => false,
            }
        };
        if run_now {
            hook();
        }
    }

    /// Cancels the promise. Returns `false` if it had already settled.
    pub fn cancel(&self) -> bool {
        self.settle(PromiseState::Cancelled, Err(AsyncError::cancelled()))
    }

    /// Cancels the promise with a human readable reason.
    pub fn cancel_with<S: ToString>(&self, reason: S) -> bool {
        self.settle(PromiseState::Cancelled, Err(AsyncError::cancelled_with(reason)))
    }

    fn settle(&self, state: PromiseState, outcome: Settlement<T>) -> bool {
        let (hooks, observers, wakers) = {
            let mut slot = self.slot.borrow_mut();
            if slot.state.is_terminal() {
                return false;
            }
            slot.state = state;
            slot.outcome = Some(outcome.clone());
            let hooks = mem::take(&mut slot.cancel_hooks);
            (hooks, mem::take(&mut slot.observers), mem::take(&mut slot.wakers))
        };

        // hooks only belong to the cancellation path, the other outcomes just drop them
        if state == PromiseState::Cancelled {
            for hook in hooks {
                hook();
            }
        }

        for observer in observers {
            observer(&outcome);
        }

        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl<T: Clone + 'static> Future for Promise<T> {
    type Output = Settlement<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        if let Some(outcome) = &slot.outcome {
            return Poll::Ready(outcome.clone());
        }

        if !slot.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            slot.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T: Clone + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + 'static> Deferred<T> {
    pub fn new() -> Self {
        Self { promise: Promise::pending() }
    }

    /// Returns a handle observing this deferred's slot.
    pub fn promise(&self) -> Promise<T> {
        self.promise.clone()
    }

    pub fn resolve(&self, value: T) -> bool {
        self.promise.settle(PromiseState::Resolved, Ok(value))
    }

    pub fn reject(&self, error: AsyncError) -> bool {
        self.promise.settle(PromiseState::Rejected, Err(error))
    }

    /// Settles with `outcome`, resolving on `Ok` and rejecting on `Err`.
    pub fn complete(&self, outcome: Settlement<T>) -> bool {
        match outcome {
            Ok(value) => self.resolve(value),
            Err(error) => self.reject(error),
        }
    }

    pub fn cancel(&self) -> bool {
        self.promise.cancel()
    }

    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + 'static,
    {
        self.promise.on_cancel(hook);
    }

    pub fn state(&self) -> PromiseState {
        self.promise.state()
    }
}

//! One-shot completion primitive.
//!
//! A [`Deferred`] bridges an event arriving on another thread (a worker
//! response) to a caller blocked in [`Deferred::wait`]. It settles at most
//! once; later `resolve`/`reject` calls are ignored and report `false`.
//! Clones share the same slot, so the settling side keeps one handle and the
//! waiting side another.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

enum Settlement<T, E> {
    Pending,
    Resolved(T),
    Rejected(E),
    Observed,
}

struct Inner<T, E> {
    state: Mutex<Settlement<T, E>>,
    settled: Condvar,
}

pub struct Deferred<T, E> {
    inner: Arc<Inner<T, E>>,
}

/// Outcome of waiting on a [`Deferred`] that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unsettled<E> {
    Rejected(E),
    /// Another waiter already took the value.
    AlreadyObserved,
}

impl<T, E> Deferred<T, E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Settlement::Pending),
                settled: Condvar::new(),
            }),
        }
    }

    pub fn resolve(&self, value: T) -> bool {
        self.settle(Settlement::Resolved(value))
    }

    pub fn reject(&self, error: E) -> bool {
        self.settle(Settlement::Rejected(error))
    }

    fn settle(&self, outcome: Settlement<T, E>) -> bool {
        let mut state = self.inner.state.lock();
        if !matches!(*state, Settlement::Pending) {
            return false;
        }
        *state = outcome;
        self.inner.settled.notify_all();
        true
    }

    pub fn is_settled(&self) -> bool {
        !matches!(*self.inner.state.lock(), Settlement::Pending)
    }

    /// Block until settled and take the outcome.
    ///
    /// There is no timeout: a deferred that is never settled blocks forever.
    /// The worker client rejects everything outstanding when the worker goes
    /// away, so that only happens while a live worker is stalled.
    pub fn wait(&self) -> Result<T, Unsettled<E>> {
        let mut state = self.inner.state.lock();
        while matches!(*state, Settlement::Pending) {
            self.inner.settled.wait(&mut state);
        }
        match std::mem::replace(&mut *state, Settlement::Observed) {
            Settlement::Resolved(value) => Ok(value),
            Settlement::Rejected(error) => Err(Unsettled::Rejected(error)),
            Settlement::Observed | Settlement::Pending => Err(Unsettled::AlreadyObserved),
        }
    }
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.inner.state.lock() {
            Settlement::Pending => "pending",
            Settlement::Resolved(_) => "resolved",
            Settlement::Rejected(_) => "rejected",
            Settlement::Observed => "observed",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

use crate::{Error, Result, util::lock};
use std::{
    future::Future,
    mem,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

enum State<T> {
    Pending,
    Settled(Result<T>),
    Taken,
}

struct Inner<T> {
    state: State<T>,
    waker: Option<Waker>,
}

/// One-shot result cell.
///
/// Settles to a value or an error at most once, then wakes whoever awaits
/// [`Deferred::wait`]. The first settle wins, later attempts are reported
/// no-ops and never overwrite the stored outcome.
pub struct Deferred<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Pending,
                waker: None,
            })),
        }
    }

    /// Settle with a value. Returns whether the settle took effect.
    pub fn succeed(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settle with an error. Returns whether the settle took effect.
    pub fn fail(&self, error: Error) -> bool {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        !matches!(lock(&self.inner).state, State::Pending)
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        let mut inner = lock(&self.inner);
        if !matches!(inner.state, State::Pending) {
            log::warn!("deferred cell settled twice, keeping the first outcome");
            return false;
        }
        inner.state = State::Settled(outcome);
        if let Some(waker) = inner.waker.take() {
            waker.wake();
        }
        true
    }

    /// Future resolving to whatever the cell settles to.
    pub fn wait(&self) -> Wait<T> {
        Wait {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Awaitable half of a [`Deferred`] cell.
pub struct Wait<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Future for Wait<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = lock(&self.inner);
        match mem::replace(&mut inner.state, State::Taken) {
            State::Settled(outcome) => Poll::Ready(outcome),
            State::Pending => {
                inner.state = State::Pending;
                inner.waker = Some(cx.waker().clone());
                Poll::Pending
            }
            State::Taken => panic!("deferred cell polled after completion"),
        }
    }
}

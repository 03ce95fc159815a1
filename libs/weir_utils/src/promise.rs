// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use crate::error::{Error, Result};

enum State<T> {
    Pending(Vec<Waker>),
    Fulfilled(T),
    Rejected(Error),
}

/// A single-threaded, multi-consumer deferred result that settles exactly once.
///
/// Every clone observes the same settlement; awaiting a clone yields a copy of the value.
pub struct Promise<T: Clone> {
    shared: Rc<RefCell<State<T>>>,
}

impl<T: Clone> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: Clone> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.borrow() {
            State::Pending(_) => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Rejected(_) => "rejected",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

impl<T: Clone> Promise<T> {
    fn pending() -> Self {
        Self {
            shared: Rc::new(RefCell::new(State::Pending(Vec::new()))),
        }
    }

    pub fn resolved(value: T) -> Self {
        Self {
            shared: Rc::new(RefCell::new(State::Fulfilled(value))),
        }
    }

    pub fn rejected(e: Error) -> Self {
        Self {
            shared: Rc::new(RefCell::new(State::Rejected(e))),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.shared.borrow(), State::Pending(_))
    }

    /// The settled outcome, or `None` while pending.
    pub fn result(&self) -> Option<Result<T>> {
        match &*self.shared.borrow() {
            State::Pending(_) => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(e) => Some(Err(e.clone())),
        }
    }

    /// Whether two handles refer to the same underlying promise.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        let wakers = {
            let mut state = self.shared.borrow_mut();
            if !matches!(&*state, State::Pending(_)) {
                return false;
            }
            let next = match outcome {
                Ok(value) => State::Fulfilled(value),
                Err(e) => State::Rejected(e),
            };
            match std::mem::replace(&mut *state, next) {
                State::Pending(wakers) => wakers,
                _ => Vec::new(),
            }
        };

        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.borrow_mut();
        match &mut *state {
            State::Fulfilled(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(e) => Poll::Ready(Err(e.clone())),
            State::Pending(wakers) => {
                // Register waker only if not already registered by this task
                if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            },
        }
    }
}

/// The settling half of a [`Promise`]. Cloning it shares the same promise.
pub struct ResolveablePromise<T: Clone> {
    pub promise: Promise<T>,
}

impl<T: Clone> Clone for ResolveablePromise<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T: Clone> fmt::Debug for ResolveablePromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.promise.fmt(f)
    }
}

impl<T: Clone> Default for ResolveablePromise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ResolveablePromise<T> {
    pub fn new() -> Self {
        Self {
            promise: Promise::pending(),
        }
    }

    pub fn resolved_with(value: T) -> Self {
        Self {
            promise: Promise::resolved(value),
        }
    }

    pub fn rejected_with(e: Error) -> Self {
        Self {
            promise: Promise::rejected(e),
        }
    }

    /// Fulfils the promise. Returns false if it had already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.promise.settle(Ok(value))
    }

    /// Rejects the promise. Returns false if it had already settled.
    pub fn reject(&self, e: Error) -> bool {
        self.promise.settle(Err(e))
    }

    pub fn settle(&self, outcome: Result<T>) -> bool {
        self.promise.settle(outcome)
    }

    pub fn is_settled(&self) -> bool {
        !self.promise.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_waiter_observes_the_same_settlement() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let resolveable = ResolveablePromise::<u32>::new();

                let a = tokio::task::spawn_local(resolveable.promise.clone());
                let b = tokio::task::spawn_local(resolveable.promise.clone());

                tokio::task::yield_now().await;
                assert!(resolveable.promise.is_pending());

                assert!(resolveable.resolve(7));
                assert!(!resolveable.reject(Error::message("late")));

                assert_eq!(a.await.unwrap(), Ok(7));
                assert_eq!(b.await.unwrap(), Ok(7));
                assert_eq!(resolveable.promise.clone().await, Ok(7));
            })
            .await;
    }

    #[tokio::test]
    async fn rejection_is_shared() {
        let resolveable = ResolveablePromise::<()>::new();
        let promise = resolveable.promise.clone();
        resolveable.reject(Error::message("boom"));

        assert!(resolveable.is_settled());
        assert_eq!(promise.await, Err(Error::message("boom")));
        assert_eq!(
            resolveable.promise.result(),
            Some(Err(Error::message("boom")))
        );
    }

    #[test]
    fn ptr_eq_tracks_identity() {
        let a = Promise::resolved(());
        let b = a.clone();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&Promise::resolved(())));
    }
}

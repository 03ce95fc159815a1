// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
use std::{cell::RefCell, fmt, rc::Rc, time::Duration};

use tracing::trace;
use weir_utils::{Error, Promise, ResolveablePromise, Result};

type Listener = Box<dyn FnOnce(&Error)>;

/// Handle returned by [`AbortSignal::add_listener`], used to remove the listener again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AbortListenerId(u64);

struct Inner {
    aborted: bool,
    reason: Option<Error>,
    listeners: Vec<(AbortListenerId, Listener)>,
    next_id: u64,
    sender: ResolveablePromise<Error>,
}

/// A single-threaded cancellation signal.
///
/// Listeners run synchronously, in registration order, when the signal is aborted.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Rc<RefCell<Inner>>,
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("AbortSignal")
            .field("aborted", &inner.aborted)
            .field("reason", &inner.reason)
            .finish()
    }
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                aborted: false,
                reason: None,
                listeners: Vec::new(),
                next_id: 0,
                sender: ResolveablePromise::new(),
            })),
        }
    }

    pub fn aborted(&self) -> bool {
        self.inner.borrow().aborted
    }

    pub fn reason(&self) -> Option<Error> {
        self.inner.borrow().reason.clone()
    }

    pub fn throw_if_aborted(&self) -> Result<()> {
        let inner = self.inner.borrow();
        if inner.aborted {
            return Err(inner.reason.clone().unwrap_or(Error::Unspecified));
        }
        Ok(())
    }

    /// Resolves with the abort reason once the signal is aborted.
    pub fn on_abort(&self) -> Promise<Error> {
        self.inner.borrow().sender.promise.clone()
    }

    /// Registers `listener` to run when the signal aborts. Listeners added after the signal has
    /// aborted never run.
    pub fn add_listener(&self, listener: impl FnOnce(&Error) + 'static) -> AbortListenerId {
        let mut inner = self.inner.borrow_mut();
        let id = AbortListenerId(inner.next_id);
        inner.next_id += 1;
        if !inner.aborted {
            inner.listeners.push((id, Box::new(listener)));
        }
        id
    }

    pub fn remove_listener(&self, id: AbortListenerId) {
        self.inner
            .borrow_mut()
            .listeners
            .retain(|(listener_id, _)| *listener_id != id);
    }

    pub(crate) fn send_aborted(&self, reason: Option<Error>) {
        let (reason, listeners, sender) = {
            let mut inner = self.inner.borrow_mut();
            if inner.aborted {
                return;
            }
            inner.aborted = true;
            let reason = reason
                .unwrap_or_else(|| Error::Aborted("This operation was aborted".into()));
            inner.reason = Some(reason.clone());
            (
                reason,
                std::mem::take(&mut inner.listeners),
                inner.sender.clone(),
            )
        };

        trace!(listeners = listeners.len(), "abort signal fired");
        sender.resolve(reason.clone());

        // listeners may add or remove other listeners, so no borrow is held while they run
        for (_, listener) in listeners {
            listener(&reason);
        }
    }

    /// A signal that is already aborted.
    pub fn abort(reason: Option<Error>) -> Self {
        let signal = Self::new();
        signal.send_aborted(reason);
        signal
    }

    /// A signal that aborts as soon as any of `signals` aborts, with that signal's reason.
    pub fn any(signals: impl IntoIterator<Item = AbortSignal>) -> Self {
        let new_signal = Self::new();

        let signals: Vec<_> = signals.into_iter().collect();
        if let Some(aborted) = signals.iter().find(|signal| signal.aborted()) {
            new_signal.send_aborted(aborted.reason());
            return new_signal;
        }

        for signal in signals {
            let new_signal = new_signal.clone();
            signal.add_listener(move |reason| new_signal.send_aborted(Some(reason.clone())));
        }

        new_signal
    }

    /// A signal that aborts with a `TimeoutError` after `duration`.
    ///
    /// Must be called from within a `tokio::task::LocalSet`.
    pub fn timeout(duration: Duration) -> Self {
        let signal = Self::new();
        let timer_signal = signal.clone();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(duration).await;
            timer_signal.send_aborted(Some(Error::Timeout(
                "The operation was aborted due to timeout".into(),
            )));
        });
        signal
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, time::Duration};

    use weir_test::test_async_with;

    use super::*;
    use crate::AbortController;

    #[tokio::test]
    async fn test_abort_signal_timeout() {
        test_async_with(|| {
            Box::pin(async move {
                let signal = AbortSignal::timeout(Duration::from_millis(5));

                assert!(!signal.aborted());

                tokio::time::sleep(Duration::from_millis(50)).await;

                assert!(signal.aborted());
                assert!(matches!(signal.reason(), Some(Error::Timeout(_))));
                assert!(signal.throw_if_aborted().is_err());
            })
        })
        .await;
    }

    #[test]
    fn removed_listener_never_runs() {
        let controller = AbortController::new();
        let signal = controller.signal();
        let calls = Rc::new(Cell::new(0));

        let kept = calls.clone();
        signal.add_listener(move |_| kept.set(kept.get() + 1));
        let removed = calls.clone();
        let id = signal.add_listener(move |_| removed.set(removed.get() + 10));
        signal.remove_listener(id);

        controller.abort(None);
        controller.abort(None);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn any_follows_first_aborted_signal() {
        let a = AbortController::new();
        let b = AbortController::new();
        let combined = AbortSignal::any([a.signal(), b.signal()]);
        assert!(!combined.aborted());

        b.abort(Some(Error::message("b")));
        assert_eq!(combined.reason(), Some(Error::message("b")));
        assert_eq!(combined.on_abort().await, Ok(Error::message("b")));

        let already = AbortSignal::any([AbortSignal::abort(Some(Error::message("x")))]);
        assert_eq!(already.reason(), Some(Error::message("x")));
    }
}

use std::{
    future::Future,
    task::{Context, Poll},
};

use futures::{future::try_join_all, task::noop_waker_ref};
use weir_utils::{Promise, ResolveablePromise, Result};

/// Runs `future` until its first suspension point right away, then hands the rest to a local task.
///
/// User algorithms behave like JavaScript async functions this way: everything before their first
/// `.await` happens synchronously at the call site, and a synchronous failure and a later
/// rejection both settle the returned promise.
pub(crate) fn promise_from_future<T: Clone + 'static>(
    future: impl Future<Output = Result<T>> + 'static,
) -> Promise<T> {
    let mut future = Box::pin(future);
    let mut cx = Context::from_waker(noop_waker_ref());
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(Ok(value)) => Promise::resolved(value),
        Poll::Ready(Err(e)) => Promise::rejected(e),
        Poll::Pending => {
            let resolveable = ResolveablePromise::new();
            let promise = resolveable.promise.clone();
            tokio::task::spawn_local(async move {
                resolveable.settle(future.await);
            });
            promise
        },
    }
}

// https://webidl.spec.whatwg.org/#dfn-perform-steps-once-promise-is-settled
pub(crate) fn upon_promise<Input, Output>(
    promise: Promise<Input>,
    then: impl FnOnce(Result<Input>) -> Result<Output> + 'static,
) -> Promise<Output>
where
    Input: Clone + 'static,
    Output: Clone + 'static,
{
    let resolveable = ResolveablePromise::new();
    let result = resolveable.promise.clone();
    tokio::task::spawn_local(async move {
        resolveable.settle(then(promise.await));
    });
    result
}

pub(crate) fn upon_promise_fulfilment<Input, Output>(
    promise: Promise<Input>,
    then: impl FnOnce(Input) -> Result<Output> + 'static,
) -> Promise<Output>
where
    Input: Clone + 'static,
    Output: Clone + 'static,
{
    upon_promise(promise, |result| then(result?))
}

/// Fulfils once every promise has fulfilled, or rejects with the first rejection.
pub(crate) fn promise_all(promises: Vec<Promise<()>>) -> Promise<()> {
    if promises.is_empty() {
        return Promise::resolved(());
    }
    promise_from_future(async move {
        try_join_all(promises).await?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use weir_test::{flush_jobs, test_async_with};
    use weir_utils::Error;

    use super::*;

    #[tokio::test]
    async fn synchronous_prefix_runs_at_call_site() {
        test_async_with(|| {
            Box::pin(async move {
                let ran = Rc::new(Cell::new(false));
                let flag = ran.clone();
                let promise = promise_from_future(async move {
                    flag.set(true);
                    Ok(1)
                });
                assert!(ran.get());
                assert_eq!(promise.result(), Some(Ok(1)));

                let gate = ResolveablePromise::<()>::new();
                let waiting = gate.promise.clone();
                let promise = promise_from_future(async move {
                    waiting.await?;
                    Err::<(), _>(Error::message("late"))
                });
                assert!(promise.is_pending());
                gate.resolve(());
                assert_eq!(promise.await, Err(Error::message("late")));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn reactions_run_after_the_settling_call() {
        test_async_with(|| {
            Box::pin(async move {
                let resolveable = ResolveablePromise::new();
                let seen = Rc::new(Cell::new(0));
                let seen2 = seen.clone();
                let chained = upon_promise_fulfilment(resolveable.promise.clone(), move |v: u32| {
                    seen2.set(v);
                    Ok(v * 2)
                });

                resolveable.resolve(21);
                assert_eq!(seen.get(), 0);
                flush_jobs().await;
                assert_eq!(seen.get(), 21);
                assert_eq!(chained.await, Ok(42));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn promise_all_rejects_with_first_failure() {
        test_async_with(|| {
            Box::pin(async move {
                let a = ResolveablePromise::new();
                let b = ResolveablePromise::new();
                let all = promise_all(vec![a.promise.clone(), b.promise.clone()]);
                b.reject(Error::message("b failed"));
                assert_eq!(all.await, Err(Error::message("b failed")));

                assert_eq!(promise_all(Vec::new()).await, Ok(()));
            })
        })
        .await;
    }
}

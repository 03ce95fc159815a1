use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use tracing::debug;
use weir_utils::{Error, Promise, ResolveablePromise, Result};

use super::{
    default_controller::WeakReadableStreamDefaultController, CancelAlgorithm, PullAlgorithm,
    ReadableStream, ReadableStreamDefaultController, ReadableStreamDefaultReader,
    ReadableStreamReadRequest, StartAlgorithm,
};
use crate::utils::promise::upon_promise;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Branch {
    One,
    Two,
}

struct TeeState<T: 'static> {
    source: ReadableStream<T>,
    reader: ReadableStreamDefaultReader<T>,
    reading: bool,
    read_again: bool,
    canceled1: bool,
    canceled2: bool,
    reason1: Option<Error>,
    reason2: Option<Error>,
    // The branch algorithms own the state, so the state only refers back to the branches weakly.
    controller1: Option<WeakReadableStreamDefaultController<T>>,
    controller2: Option<WeakReadableStreamDefaultController<T>>,
    cancel_promise: ResolveablePromise<()>,
}

type SharedTeeState<T> = Rc<RefCell<TeeState<T>>>;

impl<T: 'static> TeeState<T> {
    fn branch_controllers(
        &self,
    ) -> (
        Option<ReadableStreamDefaultController<T>>,
        Option<ReadableStreamDefaultController<T>>,
    ) {
        (
            self.controller1.as_ref().and_then(|c| c.upgrade()),
            self.controller2.as_ref().and_then(|c| c.upgrade()),
        )
    }

    // The controllers of the branches that have not been cancelled.
    fn live_branch_controllers(
        &self,
    ) -> (
        Option<ReadableStreamDefaultController<T>>,
        Option<ReadableStreamDefaultController<T>>,
    ) {
        let (controller1, controller2) = self.branch_controllers();
        (
            controller1.filter(|_| !self.canceled1),
            controller2.filter(|_| !self.canceled2),
        )
    }
}

impl<T: Clone + 'static> ReadableStream<T> {
    // sequence<ReadableStream> tee();
    /// Splits the stream into two branches that each see every chunk.
    ///
    /// One upstream read feeds both branches, so the slower branch's queue grows while the faster
    /// one keeps pulling. Branch two receives a clone of each chunk. The source is cancelled only once
    /// both branches have been cancelled, with both reasons as an [`Error::Composite`].
    pub fn tee(&self) -> Result<(ReadableStream<T>, ReadableStream<T>)> {
        // Return ? ReadableStreamTee(this, false).
        self.readable_stream_default_tee()
    }

    fn readable_stream_default_tee(&self) -> Result<(ReadableStream<T>, ReadableStream<T>)> {
        // Let reader be ? AcquireReadableStreamDefaultReader(stream).
        let reader = self.get_reader()?;

        let state: SharedTeeState<T> = Rc::new(RefCell::new(TeeState {
            source: self.clone(),
            reader: reader.clone(),
            // Let reading be false.
            reading: false,
            // Let readAgain be false.
            read_again: false,
            // Let canceled1 be false.
            canceled1: false,
            // Let canceled2 be false.
            canceled2: false,
            // Let reason1 be undefined.
            reason1: None,
            // Let reason2 be undefined.
            reason2: None,
            // Let branch1 be undefined.
            controller1: None,
            // Let branch2 be undefined.
            controller2: None,
            // Let cancelPromise be a new promise.
            cancel_promise: ResolveablePromise::new(),
        }));

        let branch = |which: Branch| {
            let start_state = state.clone();
            let pull_state = state.clone();
            let cancel_state = state.clone();
            // Set branch1 to ! CreateReadableStream(startAlgorithm, pullAlgorithm, cancel1Algorithm).
            // Set branch2 to ! CreateReadableStream(startAlgorithm, pullAlgorithm, cancel2Algorithm).
            ReadableStream::create_readable_stream(
                // Let startAlgorithm be an algorithm that returns undefined.
                StartAlgorithm::new(move |controller: ReadableStreamDefaultController<T>| {
                    let mut state = start_state.borrow_mut();
                    match which {
                        Branch::One => state.controller1 = Some(controller.downgrade()),
                        Branch::Two => state.controller2 = Some(controller.downgrade()),
                    }
                    Promise::resolved(())
                }),
                PullAlgorithm::new(move |_| pull_algorithm(&pull_state)),
                CancelAlgorithm::new(move |reason| cancel_algorithm(&cancel_state, which, reason)),
                None,
                None,
            )
        };
        let branch1 = branch(Branch::One);
        let branch2 = branch(Branch::Two);

        // Upon rejection of reader.[[closedPromise]] with reason r,
        let state = Rc::downgrade(&state);
        let _ = upon_promise(reader.closed(), move |result| {
            // both branches are gone
            let Some(state) = state.upgrade() else {
                return Ok(());
            };
            if let Err(r) = result {
                let (controller1, controller2, cancel_promise, both_canceled) = {
                    let state = state.borrow();
                    let (controller1, controller2) = state.branch_controllers();
                    (
                        controller1,
                        controller2,
                        state.cancel_promise.clone(),
                        state.canceled1 && state.canceled2,
                    )
                };
                // Perform ! ReadableStreamDefaultControllerError(branch1.[[controller]], r).
                if let Some(controller1) = controller1 {
                    controller1.readable_stream_default_controller_error(r.clone());
                }
                // Perform ! ReadableStreamDefaultControllerError(branch2.[[controller]], r).
                if let Some(controller2) = controller2 {
                    controller2.readable_stream_default_controller_error(r);
                }
                // If canceled1 is false or canceled2 is false, resolve cancelPromise with undefined.
                if !both_canceled {
                    cancel_promise.resolve(());
                }
            }
            Ok(())
        });

        // Return « branch1, branch2 ».
        Ok((branch1, branch2))
    }
}

// Let pullAlgorithm be the following steps:
fn pull_algorithm<T: Clone + 'static>(state: &SharedTeeState<T>) -> Promise<()> {
    let reader = {
        let mut inner = state.borrow_mut();
        // If reading is true,
        if inner.reading {
            // Set readAgain to true.
            inner.read_again = true;
            // Return a promise resolved with undefined.
            return Promise::resolved(());
        }

        // Set reading to true.
        inner.reading = true;
        inner.reader.clone()
    };

    // Let readRequest be a read request with the following items:
    // Perform ! ReadableStreamDefaultReaderRead(reader, readRequest).
    reader.readable_stream_default_reader_read(Box::new(TeeReadRequest {
        state: Rc::downgrade(state),
    }));

    // Return a promise resolved with undefined.
    Promise::resolved(())
}

fn cancel_algorithm<T: Clone + 'static>(
    state: &SharedTeeState<T>,
    which: Branch,
    reason: Error,
) -> Promise<()> {
    let (composite_reason, source, cancel_promise) = {
        let mut inner = state.borrow_mut();
        // Set canceled1 to true.
        // Set reason1 to reason.
        let other_canceled = match which {
            Branch::One => {
                inner.canceled1 = true;
                inner.reason1 = Some(reason);
                inner.canceled2
            },
            Branch::Two => {
                inner.canceled2 = true;
                inner.reason2 = Some(reason);
                inner.canceled1
            },
        };

        // If canceled2 is true,
        if !other_canceled {
            // Return cancelPromise.
            return inner.cancel_promise.promise.clone();
        }

        // Let compositeReason be ! CreateArrayFromList(« reason1, reason2 »).
        let composite_reason = Error::composite([
            inner.reason1.clone().unwrap_or(Error::Unspecified),
            inner.reason2.clone().unwrap_or(Error::Unspecified),
        ]);
        (
            composite_reason,
            inner.source.clone(),
            inner.cancel_promise.clone(),
        )
    };
    debug!(reason = %composite_reason, "Both tee branches cancelled");

    // Let cancelResult be ! ReadableStreamCancel(stream, compositeReason).
    let cancel_result = source.readable_stream_cancel(composite_reason);

    // Resolve cancelPromise with cancelResult.
    let promise = cancel_promise.promise.clone();
    let _ = upon_promise(cancel_result, move |result| {
        cancel_promise.settle(result);
        Ok(())
    });

    // Return cancelPromise.
    promise
}

struct TeeReadRequest<T: 'static> {
    state: Weak<RefCell<TeeState<T>>>,
}

impl<T: Clone + 'static> ReadableStreamReadRequest<T> for TeeReadRequest<T> {
    // chunk steps, given chunk
    fn chunk_steps(self: Box<Self>, chunk: T) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        // Queue a microtask to perform the following steps:
        tokio::task::spawn_local(async move {
            let (controller1, controller2) = {
                let mut inner = state.borrow_mut();
                // Set readAgain to false.
                inner.read_again = false;
                inner.live_branch_controllers()
            };

            // Let chunk1 and chunk2 be chunk.
            // If canceled2 is false and cloneForBranch2 is true, set chunk2 to the result of cloning chunk.
            let chunk2 = controller2.as_ref().map(|_| chunk.clone());

            // If canceled1 is false, perform ! ReadableStreamDefaultControllerEnqueue(branch1.[[controller]], chunk1).
            if let Some(controller1) = controller1 {
                let _ = controller1.readable_stream_default_controller_enqueue(chunk);
            }

            // If canceled2 is false, perform ! ReadableStreamDefaultControllerEnqueue(branch2.[[controller]], chunk2).
            if let (Some(controller2), Some(chunk2)) = (controller2, chunk2) {
                let _ = controller2.readable_stream_default_controller_enqueue(chunk2);
            }

            let read_again = {
                let mut inner = state.borrow_mut();
                // Set reading to false.
                inner.reading = false;
                inner.read_again
            };

            // If readAgain is true, perform pullAlgorithm.
            if read_again {
                let _ = pull_algorithm(&state);
            }
        });
    }

    // close steps
    fn close_steps(self: Box<Self>) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let (controller1, controller2, cancel_promise) = {
            let mut inner = state.borrow_mut();
            // Set reading to false.
            inner.reading = false;
            let (controller1, controller2) = inner.live_branch_controllers();
            (
                controller1,
                controller2,
                // If canceled1 is false or canceled2 is false, resolve cancelPromise with undefined.
                (!inner.canceled1 || !inner.canceled2).then(|| inner.cancel_promise.clone()),
            )
        };

        // If canceled1 is false, perform ! ReadableStreamDefaultControllerClose(branch1.[[controller]]).
        if let Some(controller1) = controller1 {
            controller1.readable_stream_default_controller_close();
        }

        // If canceled2 is false, perform ! ReadableStreamDefaultControllerClose(branch2.[[controller]]).
        if let Some(controller2) = controller2 {
            controller2.readable_stream_default_controller_close();
        }

        if let Some(cancel_promise) = cancel_promise {
            cancel_promise.resolve(());
        }
    }

    // error steps
    fn error_steps(self: Box<Self>, _reason: Error) {
        // Set reading to false.
        if let Some(state) = self.state.upgrade() {
            state.borrow_mut().reading = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use async_trait::async_trait;
    use weir_test::{flush_jobs, test_async_with};

    use super::*;
    use crate::{queuing_strategy::QueuingStrategy, readable::UnderlyingSource};

    struct Counter {
        next: Cell<u32>,
        limit: u32,
    }

    #[async_trait(?Send)]
    impl UnderlyingSource<u32> for Counter {
        async fn pull(&self, controller: ReadableStreamDefaultController<u32>) -> Result<()> {
            let n = self.next.get();
            if n == self.limit {
                return controller.close();
            }
            self.next.set(n + 1);
            controller.enqueue(n)
        }
    }

    async fn drain(stream: &ReadableStream<u32>) -> Vec<u32> {
        let reader = stream.get_reader().unwrap();
        let mut chunks = Vec::new();
        loop {
            let result = reader.read().await.unwrap();
            match result.value {
                Some(chunk) if !result.done => chunks.push(chunk),
                _ => return chunks,
            }
        }
    }

    #[tokio::test]
    async fn both_branches_see_every_chunk() {
        test_async_with(|| {
            Box::pin(async move {
                let source = ReadableStream::new(
                    Counter {
                        next: Cell::new(0),
                        limit: 4,
                    },
                    QueuingStrategy::new(0.0),
                )
                .unwrap();
                let (branch1, branch2) = source.tee().unwrap();
                assert!(source.locked());
                assert!(matches!(source.tee(), Err(Error::InvalidState(_))));

                assert_eq!(drain(&branch1).await, vec![0, 1, 2, 3]);
                assert_eq!(drain(&branch2).await, vec![0, 1, 2, 3]);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn dropped_branches_free_their_queued_chunks() {
        test_async_with(|| {
            Box::pin(async move {
                let marker = Rc::new(());
                let source =
                    ReadableStream::from_stream(futures::stream::iter([Ok(marker.clone())]));
                let (branch1, branch2) = source.tee().unwrap();
                flush_jobs().await;

                // one chunk waits unread in each branch
                assert_eq!(Rc::strong_count(&marker), 3);

                drop(branch1);
                drop(branch2);
                flush_jobs().await;
                assert_eq!(Rc::strong_count(&marker), 1);
                assert!(!source.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn upstream_error_reaches_both_branches() {
        test_async_with(|| {
            Box::pin(async move {
                let source = ReadableStream::<u32>::from_stream(futures::stream::iter([Err(
                    Error::message("upstream"),
                )]));
                let (branch1, branch2) = source.tee().unwrap();
                let reader1 = branch1.get_reader().unwrap();
                let reader2 = branch2.get_reader().unwrap();
                assert_eq!(reader1.read().await, Err(Error::message("upstream")));
                flush_jobs().await;
                assert_eq!(reader2.closed().await, Err(Error::message("upstream")));
            })
        })
        .await;
    }
}

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use weir_utils::{Error, Promise, Result};

use super::{
    controller::ReadableStreamController,
    stream::{ReadableStreamInner, ReadableStreamState},
    BoxedReadRequest, CancelAlgorithm, PullAlgorithm, ReadableStream, StartAlgorithm,
};
use crate::{
    queuing_strategy::SizeAlgorithm,
    utils::{promise::upon_promise, queue::QueueWithSizes},
};

struct ReadableStreamDefaultControllerInner<T: 'static> {
    cancel_algorithm: Option<CancelAlgorithm>,
    close_requested: bool,
    pull_again: bool,
    pull_algorithm: Option<PullAlgorithm<ReadableStreamDefaultController<T>>>,
    pulling: bool,
    queue: QueueWithSizes<T>,
    started: bool,
    strategy_hwm: f64,
    strategy_size_algorithm: Option<SizeAlgorithm<T>>,
    stream: Weak<RefCell<ReadableStreamInner<T>>>,
}

/// The producer-side handle of a value stream, passed to every [`UnderlyingSource`](super::UnderlyingSource) callback.
pub struct ReadableStreamDefaultController<T: 'static> {
    inner: Rc<RefCell<ReadableStreamDefaultControllerInner<T>>>,
}

impl<T: 'static> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A controller reference that does not keep the controller, or the algorithms it owns, alive.
pub(crate) struct WeakReadableStreamDefaultController<T: 'static> {
    inner: Weak<RefCell<ReadableStreamDefaultControllerInner<T>>>,
}

impl<T: 'static> WeakReadableStreamDefaultController<T> {
    pub(crate) fn upgrade(&self) -> Option<ReadableStreamDefaultController<T>> {
        self.inner
            .upgrade()
            .map(|inner| ReadableStreamDefaultController { inner })
    }
}

impl<T: 'static> fmt::Debug for ReadableStreamDefaultController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ReadableStreamDefaultController")
            .field("queued", &inner.queue.len())
            .field("close_requested", &inner.close_requested)
            .field("started", &inner.started)
            .field("pulling", &inner.pulling)
            .finish()
    }
}

impl<T: 'static> ReadableStreamDefaultController<T> {
    pub(crate) fn set_up_readable_stream_default_controller(
        stream: &ReadableStream<T>,
        start_algorithm: StartAlgorithm<Self>,
        pull_algorithm: PullAlgorithm<Self>,
        cancel_algorithm: CancelAlgorithm,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm<T>,
    ) {
        let controller = Self {
            inner: Rc::new(RefCell::new(ReadableStreamDefaultControllerInner {
                // Set controller.[[stream]] to stream.
                stream: stream.downgrade(),

                // Perform ! ResetQueue(controller).
                queue: QueueWithSizes::new(),

                // Set controller.[[started]], controller.[[closeRequested]], controller.[[pullAgain]], and controller.[[pulling]] to false.
                started: false,
                close_requested: false,
                pull_again: false,
                pulling: false,

                // Set controller.[[strategySizeAlgorithm]] to sizeAlgorithm and controller.[[strategyHWM]] to highWaterMark.
                strategy_size_algorithm: Some(size_algorithm),
                strategy_hwm: high_water_mark,

                // Set controller.[[pullAlgorithm]] to pullAlgorithm.
                pull_algorithm: Some(pull_algorithm),
                // Set controller.[[cancelAlgorithm]] to cancelAlgorithm.
                cancel_algorithm: Some(cancel_algorithm),
            })),
        };

        // Set stream.[[controller]] to controller.
        stream.inner.borrow_mut().controller = Some(Rc::new(controller.clone()));

        // Let startResult be the result of performing startAlgorithm.
        // Let startPromise be a promise resolved with startResult.
        let start_promise = start_algorithm.call(controller.clone());

        let _ = upon_promise(start_promise, move |result| {
            match result {
                // Upon fulfillment of startPromise,
                Ok(()) => {
                    // Set controller.[[started]] to true.
                    controller.inner.borrow_mut().started = true;
                    // Assert: controller.[[pulling]] is false.
                    // Assert: controller.[[pullAgain]] is false.
                    // Perform ! ReadableStreamDefaultControllerCallPullIfNeeded(controller).
                    controller.readable_stream_default_controller_call_pull_if_needed();
                },
                // Upon rejection of startPromise with reason r,
                Err(r) => {
                    // Perform ! ReadableStreamDefaultControllerError(controller, r).
                    controller.readable_stream_default_controller_error(r);
                },
            }
            Ok(())
        });
    }

    // readonly attribute unrestricted double? desiredSize;
    /// How much the stream wants: the high-water mark minus what is queued. `None` once errored,
    /// zero once closed, and negative when the queue is over the mark.
    pub fn desired_size(&self) -> Option<f64> {
        // Return ! ReadableStreamDefaultControllerGetDesiredSize(this).
        self.readable_stream_default_controller_get_desired_size()
    }

    // undefined close();
    pub fn close(&self) -> Result<()> {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(this) is false, throw a TypeError exception.
        if !self.readable_stream_default_controller_can_close_or_enqueue() {
            return Err(Error::invalid_state(
                "The stream is not in a state that permits close",
            ));
        }

        // Perform ! ReadableStreamDefaultControllerClose(this).
        self.readable_stream_default_controller_close();
        Ok(())
    }

    // undefined enqueue(optional any chunk);
    pub fn enqueue(&self, chunk: T) -> Result<()> {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(this) is false, throw a TypeError exception.
        if !self.readable_stream_default_controller_can_close_or_enqueue() {
            return Err(Error::invalid_state(
                "The stream is not in a state that permits enqueue",
            ));
        }

        // Perform ? ReadableStreamDefaultControllerEnqueue(this, chunk).
        self.readable_stream_default_controller_enqueue(chunk)
    }

    // undefined error(optional any e);
    pub fn error(&self, e: Option<Error>) {
        // Perform ! ReadableStreamDefaultControllerError(this, e).
        self.readable_stream_default_controller_error(e.unwrap_or(Error::Unspecified));
    }

    fn stream(&self) -> Option<ReadableStream<T>> {
        ReadableStream::from_weak(&self.inner.borrow().stream)
    }

    pub(crate) fn downgrade(&self) -> WeakReadableStreamDefaultController<T> {
        WeakReadableStreamDefaultController {
            inner: Rc::downgrade(&self.inner),
        }
    }

    fn readable_stream_default_controller_call_pull_if_needed(&self) {
        // Let shouldPull be ! ReadableStreamDefaultControllerShouldCallPull(controller).
        // If shouldPull is false, return.
        if !self.readable_stream_default_controller_should_call_pull() {
            return;
        }

        let pull_algorithm = {
            let mut inner = self.inner.borrow_mut();
            // If controller.[[pulling]] is true,
            if inner.pulling {
                // Set controller.[[pullAgain]] to true.
                inner.pull_again = true;
                // Return.
                return;
            }

            // Assert: controller.[[pullAgain]] is false.
            let Some(pull_algorithm) = inner.pull_algorithm.clone() else {
                return;
            };

            // Set controller.[[pulling]] to true.
            inner.pulling = true;
            pull_algorithm
        };

        // Let pullPromise be the result of performing controller.[[pullAlgorithm]].
        let pull_promise = pull_algorithm.call(self.clone());

        let controller = self.clone();
        let _ = upon_promise(pull_promise, move |result| {
            match result {
                // Upon fulfillment of pullPromise,
                Ok(()) => {
                    let pull_again = {
                        let mut inner = controller.inner.borrow_mut();
                        // Set controller.[[pulling]] to false.
                        inner.pulling = false;
                        std::mem::take(&mut inner.pull_again)
                    };
                    // If controller.[[pullAgain]] is true,
                    if pull_again {
                        // Set controller.[[pullAgain]] to false.
                        // Perform ! ReadableStreamDefaultControllerCallPullIfNeeded(controller).
                        controller.readable_stream_default_controller_call_pull_if_needed();
                    }
                },
                // Upon rejection of pullPromise with reason e,
                Err(e) => {
                    // Perform ! ReadableStreamDefaultControllerError(controller, e).
                    controller.readable_stream_default_controller_error(e);
                },
            }
            Ok(())
        });
    }

    fn readable_stream_default_controller_should_call_pull(&self) -> bool {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return false;
        };

        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(controller) is false, return false.
        if !self.readable_stream_default_controller_can_close_or_enqueue() {
            return false;
        }

        // If controller.[[started]] is false, return false.
        if !self.inner.borrow().started {
            return false;
        }

        // If ! IsReadableStreamLocked(stream) is true and ! ReadableStreamGetNumReadRequests(stream) > 0, return true.
        if stream.is_readable_stream_locked() && stream.readable_stream_get_num_read_requests() > 0
        {
            return true;
        }

        // Let desiredSize be ! ReadableStreamDefaultControllerGetDesiredSize(controller).
        let desired_size = self.readable_stream_default_controller_get_desired_size();

        // Assert: desiredSize is not null.
        // If desiredSize > 0, return true.
        // Return false.
        desired_size.is_some_and(|desired_size| desired_size > 0.0)
    }

    fn readable_stream_default_controller_clear_algorithms(&self) {
        let mut inner = self.inner.borrow_mut();
        // Set controller.[[pullAlgorithm]] to undefined.
        inner.pull_algorithm = None;
        // Set controller.[[cancelAlgorithm]] to undefined.
        inner.cancel_algorithm = None;
        // Set controller.[[strategySizeAlgorithm]] to undefined.
        inner.strategy_size_algorithm = None;
    }

    pub(crate) fn readable_stream_default_controller_close(&self) {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(controller) is false, return.
        if !self.readable_stream_default_controller_can_close_or_enqueue() {
            return;
        }

        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        let queue_is_empty = {
            let mut inner = self.inner.borrow_mut();
            // Set controller.[[closeRequested]] to true.
            inner.close_requested = true;
            inner.queue.is_empty()
        };

        // If controller.[[queue]] is empty,
        if queue_is_empty {
            // Perform ! ReadableStreamDefaultControllerClearAlgorithms(controller).
            self.readable_stream_default_controller_clear_algorithms();
            // Perform ! ReadableStreamClose(stream).
            stream.readable_stream_close();
        }
    }

    pub(crate) fn readable_stream_default_controller_enqueue(&self, chunk: T) -> Result<()> {
        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(controller) is false, return.
        if !self.readable_stream_default_controller_can_close_or_enqueue() {
            return Ok(());
        }

        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return Ok(());
        };

        // If ! IsReadableStreamLocked(stream) is true and ! ReadableStreamGetNumReadRequests(stream) > 0, perform ! ReadableStreamFulfillReadRequest(stream, chunk, false).
        if stream.is_readable_stream_locked() && stream.readable_stream_get_num_read_requests() > 0
        {
            stream.readable_stream_fulfill_read_request(chunk, false);
        } else {
            // Otherwise,
            let size_algorithm = self
                .inner
                .borrow()
                .strategy_size_algorithm
                .clone()
                .unwrap_or(SizeAlgorithm::AlwaysOne);

            // Let result be the result of performing controller.[[strategySizeAlgorithm]], passing in chunk, and interpreting the result as a completion record.
            let chunk_size = match size_algorithm.call(&chunk) {
                Ok(chunk_size) => chunk_size,
                // If result is an abrupt completion,
                Err(e) => {
                    // Perform ! ReadableStreamDefaultControllerError(controller, result.[[Value]]).
                    self.readable_stream_default_controller_error(e.clone());
                    // Return result.
                    return Err(e);
                },
            };

            // Let enqueueResult be EnqueueValueWithSize(controller, chunk, chunkSize).
            let enqueue_result = self
                .inner
                .borrow_mut()
                .queue
                .enqueue_value_with_size(chunk, chunk_size);

            // If enqueueResult is an abrupt completion,
            if let Err(e) = enqueue_result {
                // Perform ! ReadableStreamDefaultControllerError(controller, enqueueResult.[[Value]]).
                self.readable_stream_default_controller_error(e.clone());
                // Return enqueueResult.
                return Err(e);
            }
        }

        // Perform ! ReadableStreamDefaultControllerCallPullIfNeeded(controller).
        self.readable_stream_default_controller_call_pull_if_needed();
        Ok(())
    }

    pub(crate) fn readable_stream_default_controller_error(&self, e: Error) {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // If stream.[[state]] is not "readable", return.
        if !stream.is_readable() {
            return;
        }

        // Perform ! ResetQueue(controller).
        self.inner.borrow_mut().queue.reset_queue();

        // Perform ! ReadableStreamDefaultControllerClearAlgorithms(controller).
        self.readable_stream_default_controller_clear_algorithms();

        // Perform ! ReadableStreamError(stream, e).
        stream.readable_stream_error(e);
    }

    pub(crate) fn readable_stream_default_controller_get_desired_size(&self) -> Option<f64> {
        let inner = self.inner.borrow();
        // Let state be controller.[[stream]].[[state]].
        let stream = ReadableStream::from_weak(&inner.stream)?;
        let state = stream.state();

        match state {
            // If state is "errored", return null.
            ReadableStreamState::Errored(_) => None,
            // If state is "closed", return 0.
            ReadableStreamState::Closed => Some(0.0),
            // Return controller.[[strategyHWM]] − controller.[[queueTotalSize]].
            ReadableStreamState::Readable => {
                Some(inner.strategy_hwm - inner.queue.queue_total_size())
            },
        }
    }

    // ReadableStreamDefaultControllerHasBackpressure
    pub(crate) fn readable_stream_default_controller_has_backpressure(&self) -> bool {
        // If ! ReadableStreamDefaultControllerShouldCallPull(controller) is true, return false.
        // Otherwise, return true.
        !self.readable_stream_default_controller_should_call_pull()
    }

    pub(crate) fn readable_stream_default_controller_can_close_or_enqueue(&self) -> bool {
        let inner = self.inner.borrow();
        // Let state be controller.[[stream]].[[state]].
        let Some(stream) = ReadableStream::from_weak(&inner.stream) else {
            return false;
        };

        // If controller.[[closeRequested]] is false and state is "readable", return true.
        // Otherwise, return false.
        !inner.close_requested && stream.is_readable()
    }
}

impl<T: 'static> ReadableStreamController<T> for ReadableStreamDefaultController<T> {
    fn pull_steps(&self, read_request: BoxedReadRequest<T>) {
        // Let stream be this.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // If this.[[queue]] is not empty,
        // Let chunk be ! DequeueValue(this).
        let chunk = self.inner.borrow_mut().queue.dequeue_value();
        match chunk {
            Some(chunk) => {
                let close_now = {
                    let inner = self.inner.borrow();
                    inner.close_requested && inner.queue.is_empty()
                };

                // If this.[[closeRequested]] is true and this.[[queue]] is empty,
                if close_now {
                    // Perform ! ReadableStreamDefaultControllerClearAlgorithms(this).
                    self.readable_stream_default_controller_clear_algorithms();
                    // Perform ! ReadableStreamClose(stream).
                    stream.readable_stream_close();
                } else {
                    // Otherwise, perform ! ReadableStreamDefaultControllerCallPullIfNeeded(this).
                    self.readable_stream_default_controller_call_pull_if_needed();
                }

                // Perform readRequest’s chunk steps, given chunk.
                read_request.chunk_steps(chunk);
            },
            // Otherwise,
            None => {
                // Perform ! ReadableStreamAddReadRequest(stream, readRequest).
                stream.readable_stream_add_read_request(read_request);
                // Perform ! ReadableStreamDefaultControllerCallPullIfNeeded(this).
                self.readable_stream_default_controller_call_pull_if_needed();
            },
        }
    }

    fn cancel_steps(&self, reason: Error) -> Promise<()> {
        let cancel_algorithm = {
            let mut inner = self.inner.borrow_mut();
            // Perform ! ResetQueue(this).
            inner.queue.reset_queue();
            inner.cancel_algorithm.take()
        };

        // Let result be the result of performing this.[[cancelAlgorithm]], passing reason.
        let result = cancel_algorithm
            .map(|cancel_algorithm| cancel_algorithm.call(reason))
            .unwrap_or_else(|| Promise::resolved(()));

        // Perform ! ReadableStreamDefaultControllerClearAlgorithms(this).
        self.readable_stream_default_controller_clear_algorithms();

        // Return result.
        result
    }

    fn release_steps(&self) {
        // Return.
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use async_trait::async_trait;
    use weir_test::{flush_jobs, test_async_with};

    use super::*;
    use crate::{queuing_strategy::QueuingStrategy, readable::UnderlyingSource};

    struct CountingSource {
        pulls: Rc<Cell<usize>>,
    }

    #[async_trait(?Send)]
    impl UnderlyingSource<u32> for CountingSource {
        async fn pull(&self, controller: ReadableStreamDefaultController<u32>) -> Result<()> {
            let n = self.pulls.get();
            self.pulls.set(n + 1);
            controller.enqueue(n as u32)
        }
    }

    #[tokio::test]
    async fn fills_up_to_high_water_mark_then_stops_pulling() {
        test_async_with(|| {
            Box::pin(async move {
                let pulls = Rc::new(Cell::new(0));
                let stream = ReadableStream::new(
                    CountingSource {
                        pulls: pulls.clone(),
                    },
                    QueuingStrategy::new(4.0),
                )
                .unwrap();

                flush_jobs().await;
                assert_eq!(pulls.get(), 4);

                let reader = stream.get_reader().unwrap();
                let result = reader.read().await.unwrap();
                assert_eq!(result.value, Some(0));

                flush_jobs().await;
                assert_eq!(pulls.get(), 5);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn enqueue_after_close_is_a_type_error() {
        test_async_with(|| {
            Box::pin(async move {
                struct Grab(Rc<RefCell<Option<ReadableStreamDefaultController<u32>>>>);
                #[async_trait(?Send)]
                impl UnderlyingSource<u32> for Grab {
                    async fn start(
                        &self,
                        controller: ReadableStreamDefaultController<u32>,
                    ) -> Result<()> {
                        *self.0.borrow_mut() = Some(controller);
                        Ok(())
                    }
                }

                let slot = Rc::new(RefCell::new(None));
                let _stream =
                    ReadableStream::new(Grab(slot.clone()), QueuingStrategy::default()).unwrap();
                let controller = slot.borrow_mut().take().unwrap();

                controller.enqueue(1).unwrap();
                controller.close().unwrap();
                assert!(matches!(controller.enqueue(2), Err(Error::InvalidState(_))));
                assert!(matches!(controller.close(), Err(Error::InvalidState(_))));
                assert_eq!(controller.desired_size(), Some(0.0));
            })
        })
        .await;
    }
}

use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use weir_abort::{AbortController, AbortSignal};
use weir_utils::{Error, Promise, Result};

use super::{
    AbortAlgorithm, CloseAlgorithm, WritableStream, WritableStreamInner, WritableStreamState,
    WriteAlgorithm,
};
use crate::{
    queuing_strategy::SizeAlgorithm,
    readable::StartAlgorithm,
    utils::{promise::upon_promise, queue::QueueWithSizes},
};

// The close sentinel shares the queue with chunks so that close waits behind every accepted write.
enum QueueEntry<T> {
    // taken out while its write is in flight
    Chunk(Option<T>),
    Close,
}

struct WritableStreamDefaultControllerInner<T: 'static> {
    abort_algorithm: Option<AbortAlgorithm>,
    abort_controller: AbortController,
    close_algorithm: Option<CloseAlgorithm>,
    queue: QueueWithSizes<QueueEntry<T>>,
    started: bool,
    strategy_hwm: f64,
    strategy_size_algorithm: Option<SizeAlgorithm<T>>,
    stream: Weak<RefCell<WritableStreamInner<T>>>,
    write_algorithm: Option<WriteAlgorithm<T>>,
}

/// The sink-side handle of a [`WritableStream`], passed to [`UnderlyingSink`](super::UnderlyingSink) callbacks.
pub struct WritableStreamDefaultController<T: 'static> {
    inner: Rc<RefCell<WritableStreamDefaultControllerInner<T>>>,
}

impl<T: 'static> Clone for WritableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for WritableStreamDefaultController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("WritableStreamDefaultController")
            .field("queued", &inner.queue.len())
            .field("started", &inner.started)
            .field("strategy_hwm", &inner.strategy_hwm)
            .finish()
    }
}

impl<T: 'static> WritableStreamDefaultController<T> {
    pub(crate) fn set_up_writable_stream_default_controller(
        stream: &WritableStream<T>,
        start_algorithm: StartAlgorithm<Self>,
        write_algorithm: WriteAlgorithm<T>,
        close_algorithm: CloseAlgorithm,
        abort_algorithm: AbortAlgorithm,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm<T>,
    ) {
        let controller = Self {
            inner: Rc::new(RefCell::new(WritableStreamDefaultControllerInner {
                // Set controller.[[stream]] to stream.
                stream: Rc::downgrade(&stream.inner),
                // Perform ! ResetQueue(controller).
                queue: QueueWithSizes::new(),
                // Set controller.[[abortController]] to a new AbortController.
                abort_controller: AbortController::new(),
                // Set controller.[[started]] to false.
                started: false,
                // Set controller.[[strategySizeAlgorithm]] to sizeAlgorithm.
                strategy_size_algorithm: Some(size_algorithm),
                // Set controller.[[strategyHWM]] to highWaterMark.
                strategy_hwm: high_water_mark,
                // Set controller.[[writeAlgorithm]] to writeAlgorithm.
                write_algorithm: Some(write_algorithm),
                // Set controller.[[closeAlgorithm]] to closeAlgorithm.
                close_algorithm: Some(close_algorithm),
                // Set controller.[[abortAlgorithm]] to abortAlgorithm.
                abort_algorithm: Some(abort_algorithm),
            })),
        };

        // Set stream.[[controller]] to controller.
        stream.inner.borrow_mut().controller = Some(controller.clone());

        // Let backpressure be ! WritableStreamDefaultControllerGetBackpressure(controller).
        let backpressure = controller.writable_stream_default_controller_get_backpressure();

        // Perform ! WritableStreamUpdateBackpressure(stream, backpressure).
        stream.writable_stream_update_backpressure(backpressure);

        // Let startResult be the result of performing startAlgorithm. (This may throw an exception.)
        // Let startPromise be a promise resolved with startResult.
        let start_promise = start_algorithm.call(controller.clone());

        let stream = stream.clone();
        let _ = upon_promise(start_promise, move |result| {
            // Assert: stream.[[state]] is "writable" or "erroring".
            // Set controller.[[started]] to true.
            controller.inner.borrow_mut().started = true;
            match result {
                // Upon fulfillment of startPromise,
                Ok(()) => {
                    // Perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
                    controller.writable_stream_default_controller_advance_queue_if_needed();
                },
                // Upon rejection of startPromise with reason r,
                Err(r) => {
                    // Perform ! WritableStreamDealWithRejection(stream, r).
                    stream.writable_stream_deal_with_rejection(r);
                },
            }
            Ok(())
        });
    }

    // readonly attribute AbortSignal signal;
    /// Fires when the stream is aborted, so a sink can give up on a long-running write.
    pub fn signal(&self) -> AbortSignal {
        self.inner.borrow().abort_controller.signal()
    }

    // undefined error(optional any e);
    pub fn error(&self, e: Option<Error>) {
        // Let state be this.[[stream]].[[state]].
        // If state is not "writable", return.
        let Some(stream) = self.stream() else {
            return;
        };
        if stream.state() != WritableStreamState::Writable {
            return;
        }

        // Perform ! WritableStreamDefaultControllerError(this, e).
        self.writable_stream_default_controller_error(&stream, e.unwrap_or(Error::Unspecified))
    }

    fn stream(&self) -> Option<WritableStream<T>> {
        self.inner
            .borrow()
            .stream
            .upgrade()
            .map(|inner| WritableStream { inner })
    }

    pub(crate) fn started(&self) -> bool {
        self.inner.borrow().started
    }

    pub(crate) fn signal_abort(&self, reason: Error) {
        let abort_controller = self.inner.borrow().abort_controller.clone();
        abort_controller.abort(Some(reason));
    }

    // [[AbortSteps]](reason)
    pub(crate) fn abort_steps(&self, reason: Error) -> Promise<()> {
        // Let result be the result of performing this.[[abortAlgorithm]], passing reason.
        let abort_algorithm = self.inner.borrow_mut().abort_algorithm.take();

        // Perform ! WritableStreamDefaultControllerClearAlgorithms(this).
        self.writable_stream_default_controller_clear_algorithms();

        // Return result.
        match abort_algorithm {
            Some(abort_algorithm) => abort_algorithm.call(reason),
            None => Promise::resolved(()),
        }
    }

    // [[ErrorSteps]]()
    pub(crate) fn error_steps(&self) {
        // Perform ! ResetQueue(this).
        self.inner.borrow_mut().queue.reset_queue();
    }

    pub(crate) fn writable_stream_default_controller_close(&self) {
        // Perform ! EnqueueValueWithSize(controller, close sentinel, 0).
        let _ = self
            .inner
            .borrow_mut()
            .queue
            .enqueue_value_with_size(QueueEntry::Close, 0.0);

        // Perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
        self.writable_stream_default_controller_advance_queue_if_needed()
    }

    pub(crate) fn writable_stream_default_controller_get_chunk_size(&self, chunk: &T) -> f64 {
        // If controller.[[strategySizeAlgorithm]] is undefined, then:
        let Some(size_algorithm) = self.inner.borrow().strategy_size_algorithm.clone() else {
            // Assert: controller.[[stream]].[[state]] is "erroring" or "errored".
            // Return 1.
            return 1.0;
        };

        // Let returnValue be the result of performing controller.[[strategySizeAlgorithm]], passing in chunk, and interpreting the result as a completion record.
        match size_algorithm.call(chunk) {
            // Return returnValue.[[Value]].
            Ok(size) => size,
            // If returnValue is an abrupt completion,
            Err(e) => {
                // Perform ! WritableStreamDefaultControllerErrorIfNeeded(controller, returnValue.[[Value]]).
                self.writable_stream_default_controller_error_if_needed(e);
                // Return 1.
                1.0
            },
        }
    }

    pub(crate) fn writable_stream_default_controller_write(&self, chunk: T, chunk_size: f64) {
        let Some(stream) = self.stream() else {
            return;
        };

        // Let enqueueResult be EnqueueValueWithSize(controller, chunk, chunkSize).
        let enqueue_result = self
            .inner
            .borrow_mut()
            .queue
            .enqueue_value_with_size(QueueEntry::Chunk(Some(chunk)), chunk_size);

        // If enqueueResult is an abrupt completion,
        if let Err(e) = enqueue_result {
            // Perform ! WritableStreamDefaultControllerErrorIfNeeded(controller, enqueueResult.[[Value]]).
            self.writable_stream_default_controller_error_if_needed(e);
            // Return.
            return;
        }

        // Let stream be controller.[[stream]].
        // If ! WritableStreamCloseQueuedOrInFlight(stream) is false and stream.[[state]] is "writable",
        if !stream.writable_stream_close_queued_or_in_flight()
            && stream.state() == WritableStreamState::Writable
        {
            // Let backpressure be ! WritableStreamDefaultControllerGetBackpressure(controller).
            let backpressure = self.writable_stream_default_controller_get_backpressure();
            // Perform ! WritableStreamUpdateBackpressure(stream, backpressure).
            stream.writable_stream_update_backpressure(backpressure);
        }

        // Perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
        self.writable_stream_default_controller_advance_queue_if_needed()
    }

    fn writable_stream_default_controller_advance_queue_if_needed(&self) {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // If controller.[[started]] is false, return.
        if !self.inner.borrow().started {
            return;
        }

        // If stream.[[inFlightWriteRequest]] is not undefined, return.
        if stream.writable_stream_has_in_flight_write() {
            return;
        }

        // Let state be stream.[[state]].
        // Assert: state is not "closed" or "errored".
        match stream.state() {
            // If state is "erroring",
            WritableStreamState::Erroring(_) => {
                // Perform ! WritableStreamFinishErroring(stream).
                stream.writable_stream_finish_erroring();
                // Return.
                return;
            },
            WritableStreamState::Writable => {},
            WritableStreamState::Closed | WritableStreamState::Errored(_) => return,
        }

        let chunk = {
            let mut inner = self.inner.borrow_mut();
            // Let value be ! PeekQueueValue(controller).
            match inner.queue.peek_queue_value_mut() {
                // If queue is empty, return.
                None => return,
                // If value is the close sentinel, perform ! WritableStreamDefaultControllerProcessClose(controller).
                Some(QueueEntry::Close) => None,
                // Otherwise, perform ! WritableStreamDefaultControllerProcessWrite(controller, value).
                Some(QueueEntry::Chunk(chunk)) => Some(chunk.take()),
            }
        };

        match chunk {
            None => self.writable_stream_default_controller_process_close(&stream),
            Some(Some(chunk)) => {
                self.writable_stream_default_controller_process_write(&stream, chunk)
            },
            // the head write is already in flight
            Some(None) => {},
        }
    }

    pub(crate) fn writable_stream_default_controller_error_if_needed(&self, error: Error) {
        // If controller.[[stream]].[[state]] is "writable", perform ! WritableStreamDefaultControllerError(controller, error).
        let Some(stream) = self.stream() else {
            return;
        };
        if stream.state() == WritableStreamState::Writable {
            self.writable_stream_default_controller_error(&stream, error)
        }
    }

    fn writable_stream_default_controller_process_close(&self, stream: &WritableStream<T>) {
        // Let stream be controller.[[stream]].
        // Perform ! WritableStreamMarkCloseRequestInFlight(stream).
        stream.writable_stream_mark_close_request_in_flight();

        let close_algorithm = {
            let mut inner = self.inner.borrow_mut();
            // Perform ! DequeueValue(controller).
            inner.queue.dequeue_value();
            // Assert: controller.[[queue]] is empty.
            inner.close_algorithm.take()
        };

        // Let sinkClosePromise be the result of performing controller.[[closeAlgorithm]].
        let sink_close_promise = match close_algorithm {
            Some(close_algorithm) => close_algorithm.call(),
            None => Promise::resolved(()),
        };

        // Perform ! WritableStreamDefaultControllerClearAlgorithms(controller).
        self.writable_stream_default_controller_clear_algorithms();

        let stream = stream.clone();
        let _ = upon_promise(sink_close_promise, move |result| {
            match result {
                // Upon fulfillment of sinkClosePromise,
                Ok(()) => {
                    // Perform ! WritableStreamFinishInFlightClose(stream).
                    stream.writable_stream_finish_in_flight_close();
                },
                // Upon rejection of sinkClosePromise with reason reason,
                Err(reason) => {
                    // Perform ! WritableStreamFinishInFlightCloseWithError(stream, reason).
                    stream.writable_stream_finish_in_flight_close_with_error(reason);
                },
            }
            Ok(())
        });
    }

    fn writable_stream_default_controller_process_write(
        &self,
        stream: &WritableStream<T>,
        chunk: T,
    ) {
        // Let stream be controller.[[stream]].
        // Perform ! WritableStreamMarkFirstWriteRequestInFlight(stream).
        stream.writable_stream_mark_first_write_request_in_flight();

        // Let sinkWritePromise be the result of performing controller.[[writeAlgorithm]], passing in chunk.
        let write_algorithm = self.inner.borrow().write_algorithm.clone();
        let sink_write_promise = match write_algorithm {
            Some(write_algorithm) => write_algorithm.call(chunk, self.clone()),
            None => Promise::resolved(()),
        };

        let controller = self.clone();
        let stream = stream.clone();
        let _ = upon_promise(sink_write_promise, move |result| {
            match result {
                // Upon fulfillment of sinkWritePromise,
                Ok(()) => {
                    // Perform ! WritableStreamFinishInFlightWrite(stream).
                    stream.writable_stream_finish_in_flight_write();

                    // Let state be stream.[[state]].
                    // Assert: state is "writable" or "erroring".
                    // Perform ! DequeueValue(controller).
                    controller.inner.borrow_mut().queue.dequeue_value();

                    // If ! WritableStreamCloseQueuedOrInFlight(stream) is false and state is "writable",
                    if !stream.writable_stream_close_queued_or_in_flight()
                        && stream.state() == WritableStreamState::Writable
                    {
                        // Let backpressure be ! WritableStreamDefaultControllerGetBackpressure(controller).
                        let backpressure =
                            controller.writable_stream_default_controller_get_backpressure();
                        // Perform ! WritableStreamUpdateBackpressure(stream, backpressure).
                        stream.writable_stream_update_backpressure(backpressure);
                    }

                    // Perform ! WritableStreamDefaultControllerAdvanceQueueIfNeeded(controller).
                    controller.writable_stream_default_controller_advance_queue_if_needed();
                },
                // Upon rejection of sinkWritePromise with reason,
                Err(reason) => {
                    // If stream.[[state]] is "writable", perform ! WritableStreamDefaultControllerClearAlgorithms(controller).
                    if stream.state() == WritableStreamState::Writable {
                        controller.writable_stream_default_controller_clear_algorithms();
                    }
                    // Perform ! WritableStreamFinishInFlightWriteWithError(stream, reason).
                    stream.writable_stream_finish_in_flight_write_with_error(reason);
                },
            }
            Ok(())
        });
    }

    fn writable_stream_default_controller_get_backpressure(&self) -> bool {
        // Let desiredSize be ! WritableStreamDefaultControllerGetDesiredSize(controller).
        // Return true if desiredSize ≤ 0, or false otherwise.
        self.writable_stream_default_controller_get_desired_size() <= 0.0
    }

    pub(crate) fn writable_stream_default_controller_get_desired_size(&self) -> f64 {
        let inner = self.inner.borrow();
        // Return controller.[[strategyHWM]] − controller.[[queueTotalSize]].
        inner.strategy_hwm - inner.queue.queue_total_size()
    }

    fn writable_stream_default_controller_clear_algorithms(&self) {
        let mut inner = self.inner.borrow_mut();
        // Set controller.[[writeAlgorithm]] to undefined.
        inner.write_algorithm = None;
        // Set controller.[[closeAlgorithm]] to undefined.
        inner.close_algorithm = None;
        // Set controller.[[abortAlgorithm]] to undefined.
        inner.abort_algorithm = None;
        // Set controller.[[strategySizeAlgorithm]] to undefined.
        inner.strategy_size_algorithm = None;
    }

    fn writable_stream_default_controller_error(&self, stream: &WritableStream<T>, error: Error) {
        // Let stream be controller.[[stream]].
        // Assert: stream.[[state]] is "writable".
        // Perform ! WritableStreamDefaultControllerClearAlgorithms(controller).
        self.writable_stream_default_controller_clear_algorithms();
        // Perform ! WritableStreamStartErroring(stream, error).
        stream.writable_stream_start_erroring(error)
    }
}

impl<T: 'static> WritableStreamDefaultController<T> {
    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.inner.borrow().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use async_trait::async_trait;
    use weir_test::{flush_jobs, test_async_with};
    use weir_utils::ResolveablePromise;

    use super::*;
    use crate::{queuing_strategy::QueuingStrategy, writable::UnderlyingSink};

    struct Gated {
        active: Rc<Cell<usize>>,
        max_active: Rc<Cell<usize>>,
        written: Rc<RefCell<Vec<u32>>>,
        gates: Rc<RefCell<Vec<ResolveablePromise<()>>>>,
    }

    #[async_trait(?Send)]
    impl UnderlyingSink<u32> for Gated {
        async fn write(
            &self,
            chunk: u32,
            _controller: WritableStreamDefaultController<u32>,
        ) -> Result<()> {
            self.active.set(self.active.get() + 1);
            self.max_active.set(self.max_active.get().max(self.active.get()));
            let gate = ResolveablePromise::new();
            self.gates.borrow_mut().push(gate.clone());
            gate.promise.await?;
            self.written.borrow_mut().push(chunk);
            self.active.set(self.active.get() - 1);
            Ok(())
        }
    }

    #[tokio::test]
    async fn one_write_in_flight_at_a_time() {
        test_async_with(|| {
            Box::pin(async move {
                let gates = Rc::new(RefCell::new(Vec::new()));
                let written = Rc::new(RefCell::new(Vec::new()));
                let max_active = Rc::new(Cell::new(0));
                let sink = Gated {
                    active: Rc::new(Cell::new(0)),
                    max_active: max_active.clone(),
                    written: written.clone(),
                    gates: gates.clone(),
                };
                let stream = WritableStream::new(sink, QueuingStrategy::new(10.0)).unwrap();
                let writer = stream.get_writer().unwrap();
                flush_jobs().await;

                let writes: Vec<_> = (1..=3).map(|n| writer.write(n)).collect();
                let close = writer.close();
                for _ in 0..3 {
                    flush_jobs().await;
                    let gate = gates.borrow_mut().pop();
                    assert!(gate.is_some());
                    gate.unwrap().resolve(());
                }

                for write in writes {
                    assert_eq!(write.await, Ok(()));
                }
                assert_eq!(close.await, Ok(()));
                assert_eq!(*written.borrow(), vec![1, 2, 3]);
                assert_eq!(max_active.get(), 1);
                assert_eq!(stream.controller().unwrap().queue_len(), 0);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn size_function_failure_errors_the_stream() {
        test_async_with(|| {
            Box::pin(async move {
                let strategy = QueuingStrategy::<u32>::new(4.0)
                    .with_fallible_size(|_| Err(Error::message("unsizable")));
                let stream = WritableStream::new(crate::writable::DiscardSink, strategy).unwrap();
                let writer = stream.get_writer().unwrap();
                flush_jobs().await;

                assert_eq!(writer.write(1).await, Err(Error::message("unsizable")));
                assert_eq!(writer.closed().await, Err(Error::message("unsizable")));
            })
        })
        .await;
    }

    struct FailingStart;

    #[async_trait(?Send)]
    impl UnderlyingSink<u32> for FailingStart {
        async fn start(&self, _controller: WritableStreamDefaultController<u32>) -> Result<()> {
            Err(Error::message("no start"))
        }
    }

    #[tokio::test]
    async fn start_failure_errors_the_stream() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = WritableStream::new(FailingStart, QueuingStrategy::default()).unwrap();
                let writer = stream.get_writer().unwrap();
                let write = writer.write(1);
                assert_eq!(write.await, Err(Error::message("no start")));
                assert_eq!(
                    stream.state(),
                    WritableStreamState::Errored(Error::message("no start"))
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn controller_error_only_applies_while_writable() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = WritableStream::new(
                    crate::writable::DiscardSink,
                    QueuingStrategy::<u32>::default(),
                )
                .unwrap();
                flush_jobs().await;
                let controller = stream.controller().unwrap();
                controller.error(Some(Error::message("first")));
                controller.error(Some(Error::message("second")));
                assert_eq!(
                    stream.state(),
                    WritableStreamState::Errored(Error::message("first"))
                );
            })
        })
        .await;
    }
}

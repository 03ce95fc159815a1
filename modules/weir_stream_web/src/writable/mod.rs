use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
};

use tracing::trace;
use weir_utils::{Error, Promise, ResolveablePromise, Result};

pub use default_controller::WritableStreamDefaultController;
pub use default_writer::WritableStreamDefaultWriter;
pub use sink::{DiscardSink, UnderlyingSink};

pub(crate) use sink::{AbortAlgorithm, CloseAlgorithm, WriteAlgorithm};

use default_writer::WritableStreamDefaultWriterInner;

use crate::{
    queuing_strategy::{QueuingStrategy, SizeAlgorithm},
    readable::StartAlgorithm,
    utils::promise::upon_promise,
};

mod default_controller;
mod default_writer;
mod sink;

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) enum WritableStreamState {
    #[default]
    Writable,
    Closed,
    // the stored error lives inside the erroring and errored states
    Erroring(Error),
    Errored(Error),
}

struct PendingAbortRequest {
    promise: ResolveablePromise<()>,
    reason: Error,
    was_already_erroring: bool,
}

pub(crate) struct WritableStreamInner<T: 'static> {
    backpressure: bool,
    close_request: Option<ResolveablePromise<()>>,
    controller: Option<WritableStreamDefaultController<T>>,
    in_flight_write_request: Option<ResolveablePromise<()>>,
    in_flight_close_request: Option<ResolveablePromise<()>>,
    pending_abort_request: Option<PendingAbortRequest>,
    pub(crate) state: WritableStreamState,
    pub(crate) writer: Option<Weak<RefCell<WritableStreamDefaultWriterInner<T>>>>,
    write_requests: VecDeque<ResolveablePromise<()>>,
}

/// A destination for chunks of type `T`, written through at most one writer at a time.
///
/// Writes are handed to the sink one at a time and in order. Like [`ReadableStream`], handles are
/// cheap clones of one shared stream and must be used on a `tokio::task::LocalSet`.
///
/// [`ReadableStream`]: crate::ReadableStream
pub struct WritableStream<T: 'static> {
    pub(crate) inner: Rc<RefCell<WritableStreamInner<T>>>,
}

impl<T: 'static> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for WritableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("WritableStream")
            .field("state", &inner.state)
            .field("backpressure", &inner.backpressure)
            .field("write_requests", &inner.write_requests.len())
            .finish()
    }
}

impl<T: 'static> WritableStream<T> {
    // constructor(optional object underlyingSink, optional QueuingStrategy strategy = {});
    pub fn new(
        underlying_sink: impl UnderlyingSink<T>,
        strategy: QueuingStrategy<T>,
    ) -> Result<Self> {
        // Let sizeAlgorithm be ! ExtractSizeAlgorithm(strategy).
        let size_algorithm = strategy.extract_size_algorithm();

        // Let highWaterMark be ? ExtractHighWaterMark(strategy, 1).
        let high_water_mark = strategy.extract_high_water_mark(1.0)?;

        // Perform ! InitializeWritableStream(this).
        let stream = Self::initialize_writable_stream();

        let (start_algorithm, write_algorithm, close_algorithm, abort_algorithm) =
            sink::from_underlying_sink(underlying_sink);

        // Perform ? SetUpWritableStreamDefaultControllerFromUnderlyingSink(this, underlyingSink, underlyingSinkDict, highWaterMark, sizeAlgorithm).
        WritableStreamDefaultController::set_up_writable_stream_default_controller(
            &stream,
            start_algorithm,
            write_algorithm,
            close_algorithm,
            abort_algorithm,
            high_water_mark,
            size_algorithm,
        );

        Ok(stream)
    }

    // readonly attribute boolean locked;
    pub fn locked(&self) -> bool {
        // Return ! IsWritableStreamLocked(this).
        self.is_writable_stream_locked()
    }

    // Promise<undefined> abort(optional any reason);
    pub fn abort(&self, reason: Option<Error>) -> Promise<()> {
        // If ! IsWritableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_writable_stream_locked() {
            return Promise::rejected(Error::invalid_state(
                "Cannot abort a stream that already has a writer",
            ));
        }

        // Return ! WritableStreamAbort(this, reason).
        self.writable_stream_abort(reason.unwrap_or(Error::Unspecified))
    }

    // Promise<undefined> close();
    pub fn close(&self) -> Promise<()> {
        // If ! IsWritableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_writable_stream_locked() {
            return Promise::rejected(Error::invalid_state(
                "Cannot close a stream that already has a writer",
            ));
        }

        // If ! WritableStreamCloseQueuedOrInFlight(this) is true, return a promise rejected with a TypeError exception.
        if self.writable_stream_close_queued_or_in_flight() {
            return Promise::rejected(Error::invalid_state(
                "Cannot close an already-closing stream",
            ));
        }

        // Return ! WritableStreamClose(this).
        self.writable_stream_close()
    }

    // WritableStreamDefaultWriter getWriter();
    pub fn get_writer(&self) -> Result<WritableStreamDefaultWriter<T>> {
        // Return ? AcquireWritableStreamDefaultWriter(this).
        WritableStreamDefaultWriter::set_up_writable_stream_default_writer(self)
    }

    fn initialize_writable_stream() -> Self {
        Self {
            inner: Rc::new(RefCell::new(WritableStreamInner {
                // Set stream.[[state]] to "writable".
                state: WritableStreamState::Writable,
                // Set stream.[[storedError]], stream.[[writer]], stream.[[controller]], stream.[[inFlightWriteRequest]], stream.[[closeRequest]], stream.[[inFlightCloseRequest]], and stream.[[pendingAbortRequest]] to undefined.
                writer: None,
                controller: None,
                in_flight_write_request: None,
                close_request: None,
                in_flight_close_request: None,
                pending_abort_request: None,
                // Set stream.[[writeRequests]] to a new empty list.
                write_requests: VecDeque::new(),
                // Set stream.[[backpressure]] to false.
                backpressure: false,
            })),
        }
    }

    // CreateWritableStream(startAlgorithm, writeAlgorithm, closeAlgorithm, abortAlgorithm, highWaterMark, sizeAlgorithm)
    pub(crate) fn create_writable_stream(
        start_algorithm: StartAlgorithm<WritableStreamDefaultController<T>>,
        write_algorithm: WriteAlgorithm<T>,
        close_algorithm: CloseAlgorithm,
        abort_algorithm: AbortAlgorithm,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm<T>,
    ) -> Self {
        // Let stream be a new WritableStream.
        // Perform ! InitializeWritableStream(stream).
        let stream = Self::initialize_writable_stream();

        // Perform ? SetUpWritableStreamDefaultController(stream, controller, startAlgorithm, writeAlgorithm, closeAlgorithm, abortAlgorithm, highWaterMark, sizeAlgorithm).
        WritableStreamDefaultController::set_up_writable_stream_default_controller(
            &stream,
            start_algorithm,
            write_algorithm,
            close_algorithm,
            abort_algorithm,
            high_water_mark,
            size_algorithm,
        );

        // Return stream.
        stream
    }

    pub(crate) fn state(&self) -> WritableStreamState {
        self.inner.borrow().state.clone()
    }

    pub(crate) fn controller(&self) -> Option<WritableStreamDefaultController<T>> {
        self.inner.borrow().controller.clone()
    }

    pub(crate) fn writer(&self) -> Option<WritableStreamDefaultWriter<T>> {
        self.inner
            .borrow()
            .writer
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| WritableStreamDefaultWriter { inner })
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn backpressure(&self) -> bool {
        self.inner.borrow().backpressure
    }

    pub(crate) fn is_writable_stream_locked(&self) -> bool {
        // If stream.[[writer]] is undefined, return false.
        // Return true.
        self.writer().is_some()
    }

    pub(crate) fn writable_stream_abort(&self, reason: Error) -> Promise<()> {
        // If stream.[[state]] is "closed" or "errored", return a promise resolved with undefined.
        if matches!(
            self.state(),
            WritableStreamState::Closed | WritableStreamState::Errored(_)
        ) {
            return Promise::resolved(());
        }

        // Signal abort on stream.[[controller]].[[abortController]] with reason.
        if let Some(controller) = self.controller() {
            controller.signal_abort(reason.clone());
        }

        let (promise, was_already_erroring) = {
            let mut inner = self.inner.borrow_mut();

            // Let state be stream.[[state]].
            // If state is "closed" or "errored", return a promise resolved with undefined.
            let was_already_erroring = match &inner.state {
                WritableStreamState::Closed | WritableStreamState::Errored(_) => {
                    return Promise::resolved(())
                },
                WritableStreamState::Erroring(_) => true,
                WritableStreamState::Writable => false,
            };

            // If stream.[[pendingAbortRequest]] is not undefined, return stream.[[pendingAbortRequest]]'s promise.
            if let Some(pending_abort_request) = &inner.pending_abort_request {
                return pending_abort_request.promise.promise.clone();
            }

            // Let wasAlreadyErroring be false.
            // If state is "erroring",
            // Set wasAlreadyErroring to true.
            // Set reason to undefined.
            let reason = if was_already_erroring {
                Error::Unspecified
            } else {
                reason.clone()
            };

            // Let promise be a new promise.
            let promise = ResolveablePromise::new();

            // Set stream.[[pendingAbortRequest]] to a new pending abort request whose promise is promise, reason is reason, and was already erroring is wasAlreadyErroring.
            inner.pending_abort_request = Some(PendingAbortRequest {
                promise: promise.clone(),
                reason,
                was_already_erroring,
            });
            (promise, was_already_erroring)
        };

        // If wasAlreadyErroring is false, perform ! WritableStreamStartErroring(stream, reason).
        if !was_already_erroring {
            self.writable_stream_start_erroring(reason);
        }

        // Return promise.
        promise.promise
    }

    pub(crate) fn writable_stream_close(&self) -> Promise<()> {
        // Let state be stream.[[state]].
        // If state is "closed" or "errored", return a promise rejected with a TypeError exception.
        let state = self.state();
        if matches!(
            state,
            WritableStreamState::Closed | WritableStreamState::Errored(_)
        ) {
            return Promise::rejected(Error::invalid_state(
                "The stream is not in the writable state and cannot be closed",
            ));
        }

        // Assert: state is "writable" or "erroring".
        // Assert: ! WritableStreamCloseQueuedOrInFlight(stream) is false.
        // Let promise be a new promise.
        let promise = ResolveablePromise::new();

        // Set stream.[[closeRequest]] to promise.
        self.inner.borrow_mut().close_request = Some(promise.clone());

        // Let writer be stream.[[writer]].
        // If writer is not undefined, and stream.[[backpressure]] is true, and state is "writable", resolve writer.[[readyPromise]] with undefined.
        if let Some(writer) = self.writer() {
            if self.backpressure() && state == WritableStreamState::Writable {
                writer.ready_promise().resolve(());
            }
        }

        // Perform ! WritableStreamDefaultControllerClose(stream.[[controller]]).
        if let Some(controller) = self.controller() {
            controller.writable_stream_default_controller_close();
        }

        // Return promise.
        promise.promise
    }

    pub(crate) fn writable_stream_add_write_request(&self) -> Promise<()> {
        // Assert: ! IsWritableStreamLocked(stream) is true.
        // Assert: stream.[[state]] is "writable".
        // Let promise be a new promise.
        let promise = ResolveablePromise::new();

        // Append promise to stream.[[writeRequests]].
        self.inner
            .borrow_mut()
            .write_requests
            .push_back(promise.clone());

        // Return promise.
        promise.promise
    }

    pub(crate) fn writable_stream_close_queued_or_in_flight(&self) -> bool {
        let inner = self.inner.borrow();
        // If stream.[[closeRequest]] is undefined and stream.[[inFlightCloseRequest]] is undefined, return false.
        // Return true.
        inner.close_request.is_some() || inner.in_flight_close_request.is_some()
    }

    pub(crate) fn writable_stream_deal_with_rejection(&self, error: Error) {
        // Let state be stream.[[state]].
        // If state is "writable",
        if self.state() == WritableStreamState::Writable {
            // Perform ! WritableStreamStartErroring(stream, error).
            self.writable_stream_start_erroring(error);
            // Return.
            return;
        }

        // Assert: state is "erroring".
        // Perform ! WritableStreamFinishErroring(stream).
        self.writable_stream_finish_erroring()
    }

    pub(crate) fn writable_stream_start_erroring(&self, reason: Error) {
        // Assert: stream.[[storedError]] is undefined.
        // Assert: stream.[[state]] is "writable".
        // Let controller be stream.[[controller]].
        // Assert: controller is not undefined.
        // Set stream.[[state]] to "erroring".
        // Set stream.[[storedError]] to reason.
        self.inner.borrow_mut().state = WritableStreamState::Erroring(reason.clone());
        trace!("Writable stream erroring: {}", reason);

        // Let writer be stream.[[writer]].
        // If writer is not undefined, perform ! WritableStreamDefaultWriterEnsureReadyPromiseRejected(writer, reason).
        if let Some(writer) = self.writer() {
            writer
                .inner
                .borrow_mut()
                .writable_stream_default_writer_ensure_ready_promise_rejected(reason);
        }

        // If ! WritableStreamHasOperationMarkedInFlight(stream) is false and controller.[[started]] is true, perform ! WritableStreamFinishErroring(stream).
        let started = self
            .controller()
            .is_some_and(|controller| controller.started());
        if !self.writable_stream_has_operation_marked_in_flight() && started {
            self.writable_stream_finish_erroring()
        }
    }

    pub(crate) fn writable_stream_finish_erroring(&self) {
        // Assert: stream.[[state]] is "erroring".
        // Assert: ! WritableStreamHasOperationMarkedInFlight(stream) is false.
        let (stored_error, write_requests) = {
            let mut inner = self.inner.borrow_mut();
            let stored_error = match &inner.state {
                WritableStreamState::Erroring(e) | WritableStreamState::Errored(e) => e.clone(),
                _ => return,
            };

            // Set stream.[[state]] to "errored".
            inner.state = WritableStreamState::Errored(stored_error.clone());

            // Let storedError be stream.[[storedError]].
            // Set stream.[[writeRequests]] to an empty list.
            (stored_error, std::mem::take(&mut inner.write_requests))
        };
        trace!("Writable stream errored: {}", stored_error);

        // Perform ! stream.[[controller]].[[ErrorSteps]]().
        let controller = self.controller();
        if let Some(controller) = &controller {
            controller.error_steps();
        }

        // For each writeRequest of stream.[[writeRequests]]:
        for write_request in write_requests {
            // Reject writeRequest with storedError.
            write_request.reject(stored_error.clone());
        }

        // If stream.[[pendingAbortRequest]] is undefined,
        let Some(abort_request) = self.inner.borrow_mut().pending_abort_request.take() else {
            // Perform ! WritableStreamRejectCloseAndClosedPromiseIfNeeded(stream).
            self.writable_stream_reject_close_and_closed_promise_if_needed();
            // Return.
            return;
        };

        // Let abortRequest be stream.[[pendingAbortRequest]].
        // Set stream.[[pendingAbortRequest]] to undefined.
        // If abortRequest’s was already erroring is true,
        if abort_request.was_already_erroring {
            // Reject abortRequest’s promise with storedError.
            abort_request.promise.reject(stored_error);

            // Perform ! WritableStreamRejectCloseAndClosedPromiseIfNeeded(stream).
            self.writable_stream_reject_close_and_closed_promise_if_needed();

            // Return.
            return;
        }

        // Let promise be ! stream.[[controller]].[[AbortSteps]](abortRequest’s reason).
        let promise = match controller {
            Some(controller) => controller.abort_steps(abort_request.reason),
            None => Promise::resolved(()),
        };

        let stream = self.clone();
        let _ = upon_promise(promise, move |result| {
            match result {
                // Upon fulfillment of promise,
                Ok(()) => {
                    // Resolve abortRequest’s promise with undefined.
                    abort_request.promise.resolve(());
                },
                // Upon rejection of promise with reason reason,
                Err(reason) => {
                    // Reject abortRequest’s promise with reason.
                    abort_request.promise.reject(reason);
                },
            }
            // Perform ! WritableStreamRejectCloseAndClosedPromiseIfNeeded(stream).
            stream.writable_stream_reject_close_and_closed_promise_if_needed();
            Ok(())
        });
    }

    pub(crate) fn writable_stream_finish_in_flight_write(&self) {
        // Assert: stream.[[inFlightWriteRequest]] is not undefined.
        // Resolve stream.[[inFlightWriteRequest]] with undefined.
        // Set stream.[[inFlightWriteRequest]] to undefined.
        let in_flight_write_request = self.inner.borrow_mut().in_flight_write_request.take();
        if let Some(request) = in_flight_write_request {
            request.resolve(());
        }
    }

    pub(crate) fn writable_stream_finish_in_flight_write_with_error(&self, error: Error) {
        // Assert: stream.[[inFlightWriteRequest]] is not undefined.
        // Reject stream.[[inFlightWriteRequest]] with error.
        // Set stream.[[inFlightWriteRequest]] to undefined.
        let in_flight_write_request = self.inner.borrow_mut().in_flight_write_request.take();
        if let Some(request) = in_flight_write_request {
            request.reject(error.clone());
        }

        // Assert: stream.[[state]] is "writable" or "erroring".
        // Perform ! WritableStreamDealWithRejection(stream, error).
        self.writable_stream_deal_with_rejection(error)
    }

    pub(crate) fn writable_stream_finish_in_flight_close(&self) {
        let (in_flight_close_request, pending_abort_request) = {
            let mut inner = self.inner.borrow_mut();
            // Assert: stream.[[inFlightCloseRequest]] is not undefined.
            // Resolve stream.[[inFlightCloseRequest]] with undefined.
            // Set stream.[[inFlightCloseRequest]] to undefined.
            let in_flight_close_request = inner.in_flight_close_request.take();

            // Let state be stream.[[state]].
            // Assert: stream.[[state]] is "writable" or "erroring".
            // If state is "erroring",
            // Set stream.[[storedError]] to undefined.
            // If stream.[[pendingAbortRequest]] is not undefined,
            // Resolve stream.[[pendingAbortRequest]]'s promise with undefined.
            // Set stream.[[pendingAbortRequest]] to undefined.
            let pending_abort_request = match inner.state {
                WritableStreamState::Erroring(_) => inner.pending_abort_request.take(),
                _ => None,
            };

            // Set stream.[[state]] to "closed".
            inner.state = WritableStreamState::Closed;
            (in_flight_close_request, pending_abort_request)
        };
        trace!("Writable stream closed");

        if let Some(request) = in_flight_close_request {
            request.resolve(());
        }
        if let Some(pending_abort_request) = pending_abort_request {
            pending_abort_request.promise.resolve(());
        }

        // Let writer be stream.[[writer]].
        // If writer is not undefined, resolve writer.[[closedPromise]] with undefined.
        if let Some(writer) = self.writer() {
            writer.closed_promise().resolve(());
        }

        // Assert: stream.[[pendingAbortRequest]] is undefined.
        // Assert: stream.[[storedError]] is undefined.
    }

    pub(crate) fn writable_stream_finish_in_flight_close_with_error(&self, error: Error) {
        let (in_flight_close_request, pending_abort_request) = {
            let mut inner = self.inner.borrow_mut();
            // Assert: stream.[[inFlightCloseRequest]] is not undefined.
            // Reject stream.[[inFlightCloseRequest]] with error.
            // Set stream.[[inFlightCloseRequest]] to undefined.
            // Assert: stream.[[state]] is "writable" or "erroring".
            // If stream.[[pendingAbortRequest]] is not undefined,
            // Reject stream.[[pendingAbortRequest]]'s promise with error.
            // Set stream.[[pendingAbortRequest]] to undefined.
            (
                inner.in_flight_close_request.take(),
                inner.pending_abort_request.take(),
            )
        };

        if let Some(request) = in_flight_close_request {
            request.reject(error.clone());
        }
        if let Some(pending_abort_request) = pending_abort_request {
            pending_abort_request.promise.reject(error.clone());
        }

        // Perform ! WritableStreamDealWithRejection(stream, error).
        self.writable_stream_deal_with_rejection(error)
    }

    pub(crate) fn writable_stream_has_operation_marked_in_flight(&self) -> bool {
        let inner = self.inner.borrow();
        // If stream.[[inFlightWriteRequest]] is undefined and stream.[[inFlightCloseRequest]] is undefined, return false.
        // Return true.
        inner.in_flight_write_request.is_some() || inner.in_flight_close_request.is_some()
    }

    pub(crate) fn writable_stream_has_in_flight_write(&self) -> bool {
        self.inner.borrow().in_flight_write_request.is_some()
    }

    pub(crate) fn writable_stream_mark_close_request_in_flight(&self) {
        let mut inner = self.inner.borrow_mut();
        // Assert: stream.[[inFlightCloseRequest]] is undefined.
        // Assert: stream.[[closeRequest]] is not undefined.
        // Set stream.[[inFlightCloseRequest]] to stream.[[closeRequest]].
        // Set stream.[[closeRequest]] to undefined.
        inner.in_flight_close_request = inner.close_request.take();
    }

    pub(crate) fn writable_stream_mark_first_write_request_in_flight(&self) {
        let mut inner = self.inner.borrow_mut();
        // Assert: stream.[[inFlightWriteRequest]] is undefined.
        // Assert: stream.[[writeRequests]] is not empty.
        // Let writeRequest be stream.[[writeRequests]][0].
        // Remove writeRequest from stream.[[writeRequests]].
        // Set stream.[[inFlightWriteRequest]] to writeRequest.
        inner.in_flight_write_request = inner.write_requests.pop_front();
    }

    fn writable_stream_reject_close_and_closed_promise_if_needed(&self) {
        // Assert: stream.[[state]] is "errored".
        let (stored_error, close_request) = {
            let mut inner = self.inner.borrow_mut();
            let WritableStreamState::Errored(stored_error) = &inner.state else {
                return;
            };
            let stored_error = stored_error.clone();
            // If stream.[[closeRequest]] is not undefined,
            // Assert: stream.[[inFlightCloseRequest]] is undefined.
            // Set stream.[[closeRequest]] to undefined.
            (stored_error, inner.close_request.take())
        };

        // Reject stream.[[closeRequest]] with stream.[[storedError]].
        if let Some(close_request) = close_request {
            close_request.reject(stored_error.clone());
        }

        // Let writer be stream.[[writer]].
        // If writer is not undefined,
        if let Some(writer) = self.writer() {
            // Reject writer.[[closedPromise]] with stream.[[storedError]].
            writer.closed_promise().reject(stored_error);
        }
    }

    pub(crate) fn writable_stream_update_backpressure(&self, backpressure: bool) {
        // Assert: stream.[[state]] is "writable".
        // Assert: ! WritableStreamCloseQueuedOrInFlight(stream) is false.
        // Let writer be stream.[[writer]].
        // If writer is not undefined and backpressure is not stream.[[backpressure]],
        if backpressure != self.backpressure() {
            if let Some(writer) = self.writer() {
                if backpressure {
                    // If backpressure is true, set writer.[[readyPromise]] to a new promise.
                    writer.inner.borrow_mut().ready_promise = ResolveablePromise::new();
                } else {
                    // Otherwise,
                    // Assert: backpressure is false.
                    // Resolve writer.[[readyPromise]] with undefined.
                    writer.ready_promise().resolve(());
                }
            }
        }

        // Set stream.[[backpressure]] to backpressure.
        self.inner.borrow_mut().backpressure = backpressure;
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, rc::Rc};

    use async_trait::async_trait;
    use weir_test::{flush_jobs, test_async_with};

    use super::*;

    #[derive(Default)]
    struct Recording {
        aborted: Rc<RefCell<Option<Error>>>,
        closed: Rc<Cell<bool>>,
    }

    #[async_trait(?Send)]
    impl UnderlyingSink<u8> for Recording {
        async fn close(&self) -> Result<()> {
            self.closed.set(true);
            Ok(())
        }

        async fn abort(&self, reason: Error) -> Result<()> {
            self.aborted.borrow_mut().replace(reason);
            Ok(())
        }
    }

    #[tokio::test]
    async fn close_runs_the_sink_close() {
        test_async_with(|| {
            Box::pin(async move {
                let sink = Recording::default();
                let closed = sink.closed.clone();
                let stream = WritableStream::new(sink, QueuingStrategy::default()).unwrap();
                assert_eq!(stream.close().await, Ok(()));
                assert!(closed.get());
                assert_eq!(stream.state(), WritableStreamState::Closed);

                assert!(stream.close().await.is_err());
                assert_eq!(stream.abort(None).await, Ok(()));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn abort_errors_the_stream_and_calls_the_sink() {
        test_async_with(|| {
            Box::pin(async move {
                let sink = Recording::default();
                let aborted = sink.aborted.clone();
                let stream = WritableStream::new(sink, QueuingStrategy::default()).unwrap();
                flush_jobs().await;

                let signal = stream.controller().unwrap().signal();
                assert_eq!(stream.abort(Some(Error::message("stop"))).await, Ok(()));
                assert_eq!(*aborted.borrow(), Some(Error::message("stop")));
                assert_eq!(signal.reason(), Some(Error::message("stop")));
                assert_eq!(
                    stream.state(),
                    WritableStreamState::Errored(Error::message("stop"))
                );
            })
        })
        .await;
    }

    #[tokio::test]
    async fn locked_stream_refuses_abort_and_close() {
        test_async_with(|| {
            Box::pin(async move {
                let stream =
                    WritableStream::new(DiscardSink, QueuingStrategy::<u8>::default()).unwrap();
                let writer = stream.get_writer().unwrap();
                assert!(stream.locked());
                assert!(matches!(stream.get_writer(), Err(Error::InvalidState(_))));
                assert!(matches!(stream.abort(None).await, Err(Error::InvalidState(_))));
                assert!(matches!(stream.close().await, Err(Error::InvalidState(_))));

                writer.release_lock();
                assert!(!stream.locked());
                assert!(stream.get_writer().is_ok());
            })
        })
        .await;
    }
}

use std::{cell::RefCell, fmt, rc::Rc};

use weir_utils::{Error, Promise, ResolveablePromise, Result};

use super::{WritableStream, WritableStreamState};

pub(crate) struct WritableStreamDefaultWriterInner<T: 'static> {
    pub(crate) closed_promise: ResolveablePromise<()>,
    pub(crate) ready_promise: ResolveablePromise<()>,
    stream: Option<WritableStream<T>>,
}

/// An exclusive writer. While it exists the stream is locked; dropping the last handle, or
/// calling [`release_lock`](Self::release_lock), unlocks it.
pub struct WritableStreamDefaultWriter<T: 'static> {
    pub(crate) inner: Rc<RefCell<WritableStreamDefaultWriterInner<T>>>,
}

impl<T: 'static> Clone for WritableStreamDefaultWriter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for WritableStreamDefaultWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("WritableStreamDefaultWriter")
            .field("released", &inner.stream.is_none())
            .field("ready", &inner.ready_promise.is_settled())
            .finish()
    }
}

impl<T: 'static> WritableStreamDefaultWriterInner<T> {
    pub(crate) fn writable_stream_default_writer_ensure_ready_promise_rejected(
        &mut self,
        error: Error,
    ) {
        if self.ready_promise.is_settled() {
            // Otherwise, set writer.[[readyPromise]] to a promise rejected with error.
            self.ready_promise = ResolveablePromise::rejected_with(error);
        } else {
            // If writer.[[readyPromise]].[[PromiseState]] is "pending", reject writer.[[readyPromise]] with error.
            self.ready_promise.reject(error);
        }
    }

    fn writable_stream_default_writer_ensure_closed_promise_rejected(&mut self, error: Error) {
        if self.closed_promise.is_settled() {
            // Otherwise, set writer.[[closedPromise]] to a promise rejected with error.
            self.closed_promise = ResolveablePromise::rejected_with(error);
        } else {
            // If writer.[[closedPromise]].[[PromiseState]] is "pending", reject writer.[[closedPromise]] with error.
            self.closed_promise.reject(error);
        }
    }

    fn stream_or_released(&self, action: &'static str) -> Result<WritableStream<T>> {
        self.stream.clone().ok_or_else(|| {
            Error::invalid_state(format!("Cannot {action} a stream using a released writer"))
        })
    }
}

impl<T: 'static> WritableStreamDefaultWriter<T> {
    /// Locks `stream` to a new writer. Fails with a `TypeError` if the stream is already locked.
    pub fn new(stream: &WritableStream<T>) -> Result<Self> {
        Self::set_up_writable_stream_default_writer(stream)
    }

    pub(crate) fn set_up_writable_stream_default_writer(
        stream: &WritableStream<T>,
    ) -> Result<Self> {
        // If ! IsWritableStreamLocked(stream) is true, throw a TypeError exception.
        if stream.is_writable_stream_locked() {
            return Err(Error::invalid_state(
                "This stream has already been locked for exclusive writing by another writer",
            ));
        }

        // Let state be stream.[[state]].
        let (ready_promise, closed_promise) = match stream.state() {
            // If state is "writable",
            WritableStreamState::Writable => {
                let ready_promise = if !stream.writable_stream_close_queued_or_in_flight()
                    && stream.backpressure()
                {
                    // If ! WritableStreamCloseQueuedOrInFlight(stream) is false and stream.[[backpressure]] is true, set writer.[[readyPromise]] to a new promise.
                    ResolveablePromise::new()
                } else {
                    // Otherwise, set writer.[[readyPromise]] to a promise resolved with undefined.
                    ResolveablePromise::resolved_with(())
                };
                // Set writer.[[closedPromise]] to a new promise.
                (ready_promise, ResolveablePromise::new())
            },
            // Otherwise, if state is "erroring",
            WritableStreamState::Erroring(stored_error) => (
                // Set writer.[[readyPromise]] to a promise rejected with stream.[[storedError]].
                ResolveablePromise::rejected_with(stored_error),
                // Set writer.[[closedPromise]] to a new promise.
                ResolveablePromise::new(),
            ),
            // Otherwise, if state is "closed",
            WritableStreamState::Closed => (
                // Set writer.[[readyPromise]] to a promise resolved with undefined.
                ResolveablePromise::resolved_with(()),
                // Set writer.[[closedPromise]] to a promise resolved with undefined.
                ResolveablePromise::resolved_with(()),
            ),
            // Otherwise,
            // Assert: state is "errored".
            // Let storedError be stream.[[storedError]].
            WritableStreamState::Errored(stored_error) => (
                // Set writer.[[readyPromise]] to a promise rejected with storedError.
                ResolveablePromise::rejected_with(stored_error.clone()),
                // Set writer.[[closedPromise]] to a promise rejected with storedError.
                ResolveablePromise::rejected_with(stored_error),
            ),
        };

        let writer = Self {
            inner: Rc::new(RefCell::new(WritableStreamDefaultWriterInner {
                ready_promise,
                closed_promise,
                // Set writer.[[stream]] to stream.
                stream: Some(stream.clone()),
            })),
        };

        // Set stream.[[writer]] to writer.
        stream.inner.borrow_mut().writer = Some(Rc::downgrade(&writer.inner));

        Ok(writer)
    }

    // readonly attribute Promise<undefined> closed;
    /// Fulfils when the stream closes, rejects when it errors or the writer is released.
    pub fn closed(&self) -> Promise<()> {
        // Return this.[[closedPromise]].
        self.closed_promise().promise
    }

    // readonly attribute Promise<undefined> ready;
    /// Fulfils whenever the stream has no backpressure.
    pub fn ready(&self) -> Promise<()> {
        // Return this.[[readyPromise]].
        self.ready_promise().promise
    }

    pub(crate) fn closed_promise(&self) -> ResolveablePromise<()> {
        self.inner.borrow().closed_promise.clone()
    }

    pub(crate) fn ready_promise(&self) -> ResolveablePromise<()> {
        self.inner.borrow().ready_promise.clone()
    }

    // readonly attribute unrestricted double? desiredSize;
    pub fn desired_size(&self) -> Result<Option<f64>> {
        // If this.[[stream]] is undefined, throw a TypeError exception.
        let stream = self.inner.borrow().stream_or_released("query the size of")?;

        // Return ! WritableStreamDefaultWriterGetDesiredSize(this).
        Ok(Self::writable_stream_default_writer_get_desired_size(&stream))
    }

    // Promise<undefined> abort(optional any reason);
    pub fn abort(&self, reason: Option<Error>) -> Promise<()> {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        let stream = match self.inner.borrow().stream_or_released("abort") {
            Ok(stream) => stream,
            Err(e) => return Promise::rejected(e),
        };

        // Return ! WritableStreamDefaultWriterAbort(this, reason).
        // Let stream be writer.[[stream]].
        // Assert: stream is not undefined.
        // Return ! WritableStreamAbort(stream, reason).
        stream.writable_stream_abort(reason.unwrap_or(Error::Unspecified))
    }

    // Promise<undefined> close();
    pub fn close(&self) -> Promise<()> {
        // Let stream be this.[[stream]].
        // If stream is undefined, return a promise rejected with a TypeError exception.
        let stream = match self.inner.borrow().stream_or_released("close") {
            Ok(stream) => stream,
            Err(e) => return Promise::rejected(e),
        };

        // If ! WritableStreamCloseQueuedOrInFlight(stream) is true, return a promise rejected with a TypeError exception.
        if stream.writable_stream_close_queued_or_in_flight() {
            return Promise::rejected(Error::invalid_state(
                "Cannot close an already-closing stream",
            ));
        }

        // Return ! WritableStreamDefaultWriterClose(this).
        // Let stream be writer.[[stream]].
        // Assert: stream is not undefined.
        // Return ! WritableStreamClose(stream).
        stream.writable_stream_close()
    }

    // undefined releaseLock();
    pub fn release_lock(&self) {
        // Let stream be this.[[stream]].
        // If stream is undefined, return.
        let Some(stream) = self.inner.borrow().stream.clone() else {
            return;
        };

        // Assert: stream.[[writer]] is not undefined.
        // Perform ! WritableStreamDefaultWriterRelease(this).
        self.writable_stream_default_writer_release(&stream)
    }

    // Promise<undefined> write(optional any chunk);
    pub fn write(&self, chunk: T) -> Promise<()> {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        let stream = match self.inner.borrow().stream_or_released("write to") {
            Ok(stream) => stream,
            Err(e) => return Promise::rejected(e),
        };

        // Return ! WritableStreamDefaultWriterWrite(this, chunk).
        self.writable_stream_default_writer_write(&stream, chunk)
    }

    /// Closes the stream, settling quietly if it is already closing or closed. Used when a pipe
    /// propagates a source closing forward.
    pub(crate) fn writable_stream_default_writer_close_with_error_propagation(
        &self,
    ) -> Promise<()> {
        // Let stream be writer.[[stream]].
        // Assert: stream is not undefined.
        let stream = match self.inner.borrow().stream_or_released("close") {
            Ok(stream) => stream,
            Err(e) => return Promise::rejected(e),
        };

        // Let state be stream.[[state]].
        let state = stream.state();

        // If ! WritableStreamCloseQueuedOrInFlight(stream) is true or state is "closed", return a promise resolved with undefined.
        if stream.writable_stream_close_queued_or_in_flight()
            || state == WritableStreamState::Closed
        {
            return Promise::resolved(());
        }

        // If state is "errored", return a promise rejected with stream.[[storedError]].
        if let WritableStreamState::Errored(stored_error) = state {
            return Promise::rejected(stored_error);
        }

        // Assert: state is "writable" or "erroring".
        // Return ! WritableStreamDefaultWriterClose(writer).
        stream.writable_stream_close()
    }

    fn writable_stream_default_writer_get_desired_size(stream: &WritableStream<T>) -> Option<f64> {
        // Let stream be writer.[[stream]].
        // Let state be stream.[[state]].
        match stream.state() {
            // If state is "errored" or "erroring", return null.
            WritableStreamState::Errored(_) | WritableStreamState::Erroring(_) => None,
            // If state is "closed", return 0.
            WritableStreamState::Closed => Some(0.0),
            // Return ! WritableStreamDefaultControllerGetDesiredSize(stream.[[controller]]).
            WritableStreamState::Writable => stream
                .controller()
                .map(|controller| controller.writable_stream_default_controller_get_desired_size()),
        }
    }

    fn writable_stream_default_writer_release(&self, stream: &WritableStream<T>) {
        let mut inner = self.inner.borrow_mut();

        // Let releasedError be a new TypeError.
        let released_error = Error::invalid_state(
            "Writer was released and can no longer be used to monitor the stream's closedness",
        );

        // Perform ! WritableStreamDefaultWriterEnsureReadyPromiseRejected(writer, releasedError).
        inner.writable_stream_default_writer_ensure_ready_promise_rejected(released_error.clone());

        // Perform ! WritableStreamDefaultWriterEnsureClosedPromiseRejected(writer, releasedError).
        inner.writable_stream_default_writer_ensure_closed_promise_rejected(released_error);

        // Set stream.[[writer]] to undefined.
        stream.inner.borrow_mut().writer = None;

        // Set writer.[[stream]] to undefined.
        inner.stream = None;
    }

    fn writable_stream_default_writer_write(
        &self,
        stream: &WritableStream<T>,
        chunk: T,
    ) -> Promise<()> {
        // Let controller be stream.[[controller]].
        let Some(controller) = stream.controller() else {
            return Promise::rejected(Error::invalid_state("The stream has no controller"));
        };

        // Let chunkSize be ! WritableStreamDefaultControllerGetChunkSize(controller, chunk).
        let chunk_size = controller.writable_stream_default_controller_get_chunk_size(&chunk);

        // If stream is not equal to writer.[[stream]], return a promise rejected with a TypeError exception.
        let still_locked = self
            .inner
            .borrow()
            .stream
            .as_ref()
            .is_some_and(|current| current.ptr_eq(stream));
        if !still_locked {
            return Promise::rejected(Error::invalid_state(
                "Cannot write to a stream using a released writer",
            ));
        }

        // Let state be stream.[[state]].
        match stream.state() {
            // If state is "errored", return a promise rejected with stream.[[storedError]].
            WritableStreamState::Errored(stored_error) => return Promise::rejected(stored_error),
            // If ! WritableStreamCloseQueuedOrInFlight(stream) is true or state is "closed", return a promise rejected with a TypeError exception indicating that the stream is closing or closed.
            WritableStreamState::Closed => {
                return Promise::rejected(Error::invalid_state(
                    "The stream is closing or closed and cannot be written to",
                ))
            },
            _ if stream.writable_stream_close_queued_or_in_flight() => {
                return Promise::rejected(Error::invalid_state(
                    "The stream is closing or closed and cannot be written to",
                ))
            },
            // If state is "erroring", return a promise rejected with stream.[[storedError]].
            WritableStreamState::Erroring(stored_error) => return Promise::rejected(stored_error),
            // Assert: state is "writable".
            WritableStreamState::Writable => {},
        }

        // Let promise be ! WritableStreamAddWriteRequest(stream).
        let promise = stream.writable_stream_add_write_request();

        // Perform ! WritableStreamDefaultControllerWrite(controller, chunk, chunkSize).
        controller.writable_stream_default_controller_write(chunk, chunk_size);

        // Return promise.
        promise
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use async_trait::async_trait;
    use weir_test::{flush_jobs, test_async_with};

    use super::*;
    use crate::{
        queuing_strategy::QueuingStrategy,
        writable::{UnderlyingSink, WritableStreamDefaultController},
    };

    struct Slow {
        gates: Rc<RefCell<Vec<ResolveablePromise<()>>>>,
    }

    #[async_trait(?Send)]
    impl UnderlyingSink<u8> for Slow {
        async fn write(
            &self,
            _chunk: u8,
            _controller: WritableStreamDefaultController<u8>,
        ) -> Result<()> {
            let gate = ResolveablePromise::new();
            self.gates.borrow_mut().push(gate.clone());
            gate.promise.await
        }
    }

    #[tokio::test]
    async fn ready_tracks_backpressure() {
        test_async_with(|| {
            Box::pin(async move {
                let gates = Rc::new(RefCell::new(Vec::new()));
                let stream = WritableStream::new(
                    Slow {
                        gates: gates.clone(),
                    },
                    QueuingStrategy::new(2.0),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                flush_jobs().await;
                assert_eq!(writer.desired_size(), Ok(Some(2.0)));
                assert_eq!(writer.ready().result(), Some(Ok(())));

                let first = writer.write(1);
                let second = writer.write(2);
                assert_eq!(writer.desired_size(), Ok(Some(0.0)));
                assert!(writer.ready().is_pending());

                let gate = gates.borrow_mut().remove(0);
                gate.resolve(());
                assert_eq!(first.await, Ok(()));
                flush_jobs().await;
                assert_eq!(writer.desired_size(), Ok(Some(1.0)));
                assert_eq!(writer.ready().result(), Some(Ok(())));

                let gate = gates.borrow_mut().remove(0);
                gate.resolve(());
                assert_eq!(second.await, Ok(()));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn writes_after_close_are_refused() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = WritableStream::new(
                    crate::writable::DiscardSink,
                    QueuingStrategy::<u8>::default(),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                let close = writer.close();
                assert!(matches!(writer.write(1).await, Err(Error::InvalidState(_))));
                assert!(matches!(writer.close().await, Err(Error::InvalidState(_))));
                assert_eq!(close.await, Ok(()));
                assert_eq!(writer.closed().await, Ok(()));
                assert_eq!(writer.desired_size(), Ok(Some(0.0)));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn release_rejects_closed_and_detaches() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = WritableStream::new(
                    crate::writable::DiscardSink,
                    QueuingStrategy::<u8>::default(),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                let closed = writer.closed();
                writer.release_lock();
                assert!(matches!(closed.await, Err(Error::InvalidState(_))));
                assert!(matches!(writer.closed().await, Err(Error::InvalidState(_))));
                assert!(matches!(writer.write(1).await, Err(Error::InvalidState(_))));
                assert!(matches!(writer.desired_size(), Err(Error::InvalidState(_))));
                assert!(!stream.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn dropping_the_writer_unlocks() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = WritableStream::new(
                    crate::writable::DiscardSink,
                    QueuingStrategy::<u8>::default(),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                assert!(stream.locked());
                drop(writer);
                assert!(!stream.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn abort_rejects_queued_writes() {
        test_async_with(|| {
            Box::pin(async move {
                let gates = Rc::new(RefCell::new(Vec::new()));
                let stream = WritableStream::new(
                    Slow {
                        gates: gates.clone(),
                    },
                    QueuingStrategy::new(4.0),
                )
                .unwrap();
                let writer = stream.get_writer().unwrap();
                flush_jobs().await;

                let in_flight = writer.write(1);
                let queued = writer.write(2);
                let abort = writer.abort(Some(Error::message("stop")));
                assert!(matches!(writer.ready().result(), Some(Err(_))));

                // the in-flight write finishes before the abort settles
                flush_jobs().await;
                assert!(abort.is_pending());
                let gate = gates.borrow_mut().remove(0);
                gate.resolve(());

                assert_eq!(in_flight.await, Ok(()));
                assert_eq!(queued.await, Err(Error::message("stop")));
                assert_eq!(abort.await, Ok(()));
                assert_eq!(writer.closed().await, Err(Error::message("stop")));
                assert!(gates.borrow().is_empty());
            })
        })
        .await;
    }
}

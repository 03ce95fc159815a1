use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
};

use tokio::sync::oneshot;
use tracing::{debug, trace};
use weir_abort::{AbortListenerId, AbortSignal};
use weir_utils::{Error, Promise, ResolveablePromise, Result};

use super::{
    ReadableStream, ReadableStreamDefaultReader, ReadableStreamReadRequest, ReadableStreamState,
};
use crate::{
    readable_writable_pair::ReadableWritablePair,
    utils::promise::{promise_all, upon_promise},
    writable::{WritableStream, WritableStreamDefaultWriter, WritableStreamState},
};

// dictionary StreamPipeOptions {
//   boolean preventClose = false;
//   boolean preventAbort = false;
//   boolean preventCancel = false;
//   AbortSignal signal;
// };
/// Options for [`ReadableStream::pipe_to`] and [`ReadableStream::pipe_through`].
#[derive(Clone, Default)]
pub struct StreamPipeOptions {
    /// Leave the destination open when the source closes.
    pub prevent_close: bool,
    /// Leave the destination alone when the source errors.
    pub prevent_abort: bool,
    /// Leave the source alone when the destination errors or closes.
    pub prevent_cancel: bool,
    pub signal: Option<AbortSignal>,
}

impl fmt::Debug for StreamPipeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPipeOptions")
            .field("prevent_close", &self.prevent_close)
            .field("prevent_abort", &self.prevent_abort)
            .field("prevent_cancel", &self.prevent_cancel)
            .field("signal", &self.signal)
            .finish()
    }
}

impl StreamPipeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prevent_close(mut self, prevent_close: bool) -> Self {
        self.prevent_close = prevent_close;
        self
    }

    pub fn prevent_abort(mut self, prevent_abort: bool) -> Self {
        self.prevent_abort = prevent_abort;
        self
    }

    pub fn prevent_cancel(mut self, prevent_cancel: bool) -> Self {
        self.prevent_cancel = prevent_cancel;
        self
    }

    pub fn signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

impl<T: 'static> ReadableStream<T> {
    // ReadableStream pipeThrough(ReadableWritablePair transform, optional StreamPipeOptions options = {});
    /// Pipes this stream into `transform`'s writable side and returns its readable side.
    pub fn pipe_through<O: 'static>(
        &self,
        transform: impl Into<ReadableWritablePair<T, O>>,
        options: StreamPipeOptions,
    ) -> Result<ReadableStream<O>> {
        let transform = transform.into();

        // If ! IsReadableStreamLocked(this) is true, throw a TypeError exception.
        if self.is_readable_stream_locked() {
            return Err(Error::invalid_state(
                "Cannot pipe a stream that already has a reader",
            ));
        }

        // If ! IsWritableStreamLocked(transform["writable"]) is true, throw a TypeError exception.
        if transform.writable.is_writable_stream_locked() {
            return Err(Error::invalid_state(
                "Cannot pipe to a stream that already has a writer",
            ));
        }

        // Let promise be ! ReadableStreamPipeTo(this, transform["writable"], options["preventClose"], options["preventAbort"], options["preventCancel"], signal).
        // Set promise.[[PromiseIsHandled]] to true.
        let _ = self.readable_stream_pipe_to(&transform.writable, options);

        // Return transform["readable"].
        Ok(transform.readable)
    }

    // Promise<undefined> pipeTo(WritableStream destination, optional StreamPipeOptions options = {});
    /// Moves every chunk of this stream into `destination`, honouring its backpressure.
    ///
    /// The returned promise settles once both streams have been released: fulfilled when the source
    /// closed and was propagated, otherwise rejected with the one error that ended the pipe.
    pub fn pipe_to(
        &self,
        destination: &WritableStream<T>,
        options: StreamPipeOptions,
    ) -> Promise<()> {
        // If ! IsReadableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_readable_stream_locked() {
            return Promise::rejected(Error::invalid_state(
                "Cannot pipe a stream that already has a reader",
            ));
        }

        // If ! IsWritableStreamLocked(destination) is true, return a promise rejected with a TypeError exception.
        if destination.is_writable_stream_locked() {
            return Promise::rejected(Error::invalid_state(
                "Cannot pipe to a stream that already has a writer",
            ));
        }

        // Return ! ReadableStreamPipeTo(this, destination, preventClose, preventAbort, preventCancel, signal).
        self.readable_stream_pipe_to(destination, options)
    }

    fn readable_stream_pipe_to(
        &self,
        dest: &WritableStream<T>,
        options: StreamPipeOptions,
    ) -> Promise<()> {
        // If source.[[controller]] implements ReadableByteStreamController, let reader be either ! AcquireReadableStreamBYOBReader(source) or ! AcquireReadableStreamDefaultReader(source), at the user agent’s discretion.
        // Otherwise, let reader be ! AcquireReadableStreamDefaultReader(source).
        let reader = match self.get_reader() {
            Ok(reader) => reader,
            Err(e) => return Promise::rejected(e),
        };

        // Let writer be ! AcquireWritableStreamDefaultWriter(dest).
        let writer = match dest.get_writer() {
            Ok(writer) => writer,
            Err(e) => return Promise::rejected(e),
        };

        // Set source.[[disturbed]] to true.
        self.inner.borrow_mut().disturbed = true;

        let StreamPipeOptions {
            prevent_close,
            prevent_abort,
            prevent_cancel,
            signal,
        } = options;

        let pipe_to = PipeTo {
            source: self.clone(),
            dest: dest.clone(),
            reader,
            writer,
            current_write: Rc::new(RefCell::new(Promise::resolved(()))),
            // Let shuttingDown be false.
            shutting_down: Rc::new(Cell::new(false)),
            signal: signal.clone(),
            abort_listener: Rc::new(Cell::new(None)),
            // Let promise be a new promise.
            promise: ResolveablePromise::new(),
        };
        trace!("Pipe started");

        // If signal is not undefined,
        if let Some(signal) = signal {
            // Let abortAlgorithm be the following steps:
            let abort_algorithm = {
                let pipe_to = pipe_to.clone();
                move |error: Error| {
                    // Let error be signal’s abort reason.
                    // Let actions be an empty ordered set.
                    let mut actions: Vec<Box<dyn FnOnce() -> Promise<()>>> = Vec::new();

                    // If preventAbort is false, append the following action to actions:
                    if !prevent_abort {
                        let dest = pipe_to.dest.clone();
                        let error = error.clone();
                        actions.push(Box::new(move || {
                            if dest.state() == WritableStreamState::Writable {
                                // If dest.[[state]] is "writable", return ! WritableStreamAbort(dest, error).
                                dest.writable_stream_abort(error)
                            } else {
                                // Otherwise, return a promise resolved with undefined.
                                Promise::resolved(())
                            }
                        }));
                    }

                    // If preventCancel is false, append the following action action to actions:
                    if !prevent_cancel {
                        let source = pipe_to.source.clone();
                        let error = error.clone();
                        actions.push(Box::new(move || {
                            if source.state() == ReadableStreamState::Readable {
                                // If source.[[state]] is "readable", return ! ReadableStreamCancel(source, error).
                                source.readable_stream_cancel(error)
                            } else {
                                // Otherwise, return a promise resolved with undefined.
                                Promise::resolved(())
                            }
                        }));
                    }

                    // Shutdown with an action consisting of getting a promise to wait for all of the actions in actions, and with error.
                    pipe_to.shutdown_with_action(
                        move || promise_all(actions.into_iter().map(|action| action()).collect()),
                        Some(error),
                    )
                }
            };

            // If signal is aborted, perform abortAlgorithm and return promise.
            if signal.aborted() {
                abort_algorithm(signal.reason().unwrap_or(Error::Unspecified));
                return pipe_to.promise.promise.clone();
            }

            // Add abortAlgorithm to signal.
            let id = signal.add_listener(move |reason| abort_algorithm(reason.clone()));
            pipe_to.abort_listener.set(Some(id));
        }

        // Errors must be propagated forward
        pipe_to.is_or_becomes_errored_source({
            let pipe_to = pipe_to.clone();
            move |stored_error| {
                // If preventAbort is false, shutdown with an action of ! WritableStreamAbort(dest, source.[[storedError]]) and with source.[[storedError]].
                if !prevent_abort {
                    let dest = pipe_to.dest.clone();
                    let error = stored_error.clone();
                    pipe_to.shutdown_with_action(
                        move || dest.writable_stream_abort(error),
                        Some(stored_error),
                    )
                } else {
                    // Otherwise, shutdown with source.[[storedError]].
                    pipe_to.shutdown(Some(stored_error))
                }
            }
        });

        // Errors must be propagated backward
        pipe_to.is_or_becomes_errored_dest({
            let pipe_to = pipe_to.clone();
            move |stored_error| {
                // If preventCancel is false, shutdown with an action of ! ReadableStreamCancel(source, dest.[[storedError]]) and with dest.[[storedError]].
                if !prevent_cancel {
                    let source = pipe_to.source.clone();
                    let error = stored_error.clone();
                    pipe_to.shutdown_with_action(
                        move || source.readable_stream_cancel(error),
                        Some(stored_error),
                    )
                } else {
                    // Otherwise, shutdown with dest.[[storedError]].
                    pipe_to.shutdown(Some(stored_error))
                }
            }
        });

        // Closing must be propagated forward
        pipe_to.is_or_becomes_closed_source({
            let pipe_to = pipe_to.clone();
            move || {
                // If preventClose is false, shutdown with an action of ! WritableStreamDefaultWriterCloseWithErrorPropagation(writer).
                if !prevent_close {
                    let writer = pipe_to.writer.clone();
                    pipe_to.shutdown_with_action(
                        move || {
                            writer.writable_stream_default_writer_close_with_error_propagation()
                        },
                        None,
                    )
                } else {
                    // Otherwise, shutdown.
                    pipe_to.shutdown(None)
                }
            }
        });

        // Closing must be propagated backward
        // If ! WritableStreamCloseQueuedOrInFlight(dest) is true or dest.[[state]] is "closed",
        if dest.writable_stream_close_queued_or_in_flight()
            || dest.state() == WritableStreamState::Closed
        {
            // Let destClosed be a new TypeError.
            let dest_closed = Error::invalid_state(
                "the destination writable stream closed before all data could be piped to it",
            );

            // If preventCancel is false, shutdown with an action of ! ReadableStreamCancel(source, destClosed) and with destClosed.
            if !prevent_cancel {
                let source = self.clone();
                let error = dest_closed.clone();
                pipe_to.shutdown_with_action(
                    move || source.readable_stream_cancel(error),
                    Some(dest_closed),
                )
            } else {
                // Otherwise, shutdown with destClosed.
                pipe_to.shutdown(Some(dest_closed))
            }
        }

        let result = pipe_to.promise.promise.clone();
        tokio::task::spawn_local(pipe_to.pipe_loop());
        result
    }
}

struct PipeTo<T: 'static> {
    source: ReadableStream<T>,
    dest: WritableStream<T>,
    reader: ReadableStreamDefaultReader<T>,
    writer: WritableStreamDefaultWriter<T>,
    current_write: Rc<RefCell<Promise<()>>>,
    shutting_down: Rc<Cell<bool>>,
    signal: Option<AbortSignal>,
    abort_listener: Rc<Cell<Option<AbortListenerId>>>,
    promise: ResolveablePromise<()>,
}

impl<T: 'static> Clone for PipeTo<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            dest: self.dest.clone(),
            reader: self.reader.clone(),
            writer: self.writer.clone(),
            current_write: self.current_write.clone(),
            shutting_down: self.shutting_down.clone(),
            signal: self.signal.clone(),
            abort_listener: self.abort_listener.clone(),
            promise: self.promise.clone(),
        }
    }
}

struct PipeReadRequest<T: 'static> {
    writer: WritableStreamDefaultWriter<T>,
    current_write: Rc<RefCell<Promise<()>>>,
    // true once the source is done
    sender: oneshot::Sender<Result<bool>>,
}

impl<T: 'static> ReadableStreamReadRequest<T> for PipeReadRequest<T> {
    fn chunk_steps(self: Box<Self>, chunk: T) {
        // the write is issued before anything else can observe the chunk
        let write = self.writer.write(chunk);
        let write = upon_promise(write, |_| Ok(()));
        self.current_write.replace(write);
        let _ = self.sender.send(Ok(false));
    }

    fn close_steps(self: Box<Self>) {
        let _ = self.sender.send(Ok(true));
    }

    fn error_steps(self: Box<Self>, reason: Error) {
        let _ = self.sender.send(Err(reason));
    }
}

impl<T: 'static> PipeTo<T> {
    // Using reader and writer, read all chunks from this and write them to dest
    // - Backpressure must be enforced
    // - Shutdown must stop all activity
    async fn pipe_loop(self) {
        loop {
            if self.shutting_down.get() {
                return;
            }

            // a rejected ready promise means dest is erroring; the closed promise handles that
            let ready = self.writer.ready();
            if ready.await.is_err() || self.shutting_down.get() {
                return;
            }

            let (sender, receiver) = oneshot::channel();
            self.reader
                .readable_stream_default_reader_read(Box::new(PipeReadRequest {
                    writer: self.writer.clone(),
                    current_write: self.current_write.clone(),
                    sender,
                }));

            match receiver.await {
                Ok(Ok(false)) => continue,
                // done, errored, or released: the shutdown triggers take it from here
                _ => return,
            }
        }
    }

    fn is_or_becomes_errored_source(&self, action: impl FnOnce(Error) + 'static) {
        // if source.[[state]] is or becomes "errored"
        if let ReadableStreamState::Errored(stored_error) = self.source.state() {
            return action(stored_error);
        }
        let _ = upon_promise(self.reader.closed(), move |result| {
            if let Err(stored_error) = result {
                action(stored_error);
            }
            Ok(())
        });
    }

    fn is_or_becomes_errored_dest(&self, action: impl FnOnce(Error) + 'static) {
        // if dest.[[state]] is or becomes "errored"
        if let WritableStreamState::Errored(stored_error) = self.dest.state() {
            return action(stored_error);
        }
        let _ = upon_promise(self.writer.closed(), move |result| {
            if let Err(stored_error) = result {
                action(stored_error);
            }
            Ok(())
        });
    }

    fn is_or_becomes_closed_source(&self, action: impl FnOnce() + 'static) {
        // if source.[[state]] is or becomes "closed"
        if self.source.state() == ReadableStreamState::Closed {
            return action();
        }
        let _ = upon_promise(self.reader.closed(), move |result| {
            if result.is_ok() {
                action();
            }
            Ok(())
        });
    }

    fn dest_still_writable(&self) -> bool {
        // If dest.[[state]] is "writable" and ! WritableStreamCloseQueuedOrInFlight(dest) is false,
        self.dest.state() == WritableStreamState::Writable
            && !self.dest.writable_stream_close_queued_or_in_flight()
    }

    fn shutdown_with_action(
        &self,
        action: impl FnOnce() -> Promise<()> + 'static,
        original_error: Option<Error>,
    ) {
        // If shuttingDown is true, abort these substeps.
        // Set shuttingDown to true.
        if self.shutting_down.replace(true) {
            return;
        }
        debug!(error = ?original_error, "Pipe shutting down with action");

        // Let p be the result of performing action.
        // Upon fulfillment of p, finalize, passing along originalError if it was given.
        // Upon rejection of p with reason newError, finalize with newError.
        let pipe_to = self.clone();
        let do_the_rest = move || {
            let p = action();
            let _ = upon_promise(p, move |result| {
                match result {
                    Ok(()) => pipe_to.finalize(original_error),
                    Err(new_error) => pipe_to.finalize(Some(new_error)),
                }
                Ok(())
            });
        };

        // If dest.[[state]] is "writable" and ! WritableStreamCloseQueuedOrInFlight(dest) is false,
        if self.dest_still_writable() {
            // If any chunks have been read but not yet written, write them to dest.
            // Wait until every chunk that has been read has been written (i.e. the corresponding promises have settled).
            let current_write = self.current_write.clone();
            tokio::task::spawn_local(async move {
                wait_for_writes_to_finish(current_write).await;
                do_the_rest();
            });
        } else {
            do_the_rest();
        }
    }

    fn shutdown(&self, error: Option<Error>) {
        // If shuttingDown is true, abort these substeps.
        // Set shuttingDown to true.
        if self.shutting_down.replace(true) {
            return;
        }
        debug!(error = ?error, "Pipe shutting down");

        // If dest.[[state]] is "writable" and ! WritableStreamCloseQueuedOrInFlight(dest) is false,
        if self.dest_still_writable() {
            // If any chunks have been read but not yet written, write them to dest.
            // Wait until every chunk that has been read has been written (i.e. the corresponding promises have settled).
            let pipe_to = self.clone();
            tokio::task::spawn_local(async move {
                wait_for_writes_to_finish(pipe_to.current_write.clone()).await;
                // Finalize, passing along error if it was given.
                pipe_to.finalize(error);
            });
        } else {
            // Finalize, passing along error if it was given.
            self.finalize(error);
        }
    }

    fn finalize(&self, error: Option<Error>) {
        // Perform ! WritableStreamDefaultWriterRelease(writer).
        self.writer.release_lock();

        // If reader implements ReadableStreamBYOBReader, perform ! ReadableStreamBYOBReaderRelease(reader).
        // Otherwise, perform ! ReadableStreamDefaultReaderRelease(reader).
        self.reader.release_lock();

        // If signal is not undefined, remove abortAlgorithm from signal.
        if let (Some(signal), Some(id)) = (&self.signal, self.abort_listener.take()) {
            signal.remove_listener(id);
        }

        debug!(error = ?error, "Pipe finalized");
        match error {
            // If error was given, reject promise with error.
            Some(error) => self.promise.reject(error),
            // Otherwise, resolve promise with undefined.
            None => self.promise.resolve(()),
        };
    }
}

// the in-flight write may be replaced while waiting, so wait until it is stable
async fn wait_for_writes_to_finish(current_write: Rc<RefCell<Promise<()>>>) {
    loop {
        let observed = current_write.borrow().clone();
        let _ = observed.clone().await;
        if current_write.borrow().ptr_eq(&observed) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::stream;
    use weir_abort::AbortController;
    use weir_test::{flush_jobs, test_async_with};

    use super::*;
    use crate::{
        queuing_strategy::QueuingStrategy,
        writable::{UnderlyingSink, WritableStreamDefaultController},
    };

    #[derive(Clone, Default)]
    struct Collect {
        chunks: Rc<RefCell<Vec<u32>>>,
        closed: Rc<Cell<bool>>,
        aborted: Rc<RefCell<Option<Error>>>,
    }

    #[async_trait(?Send)]
    impl UnderlyingSink<u32> for Collect {
        async fn write(
            &self,
            chunk: u32,
            _controller: WritableStreamDefaultController<u32>,
        ) -> Result<()> {
            self.chunks.borrow_mut().push(chunk);
            Ok(())
        }

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
    async fn pipes_everything_and_closes() {
        test_async_with(|| {
            Box::pin(async move {
                let source = ReadableStream::from_stream(stream::iter((1..=5).map(Ok)));
                let sink = Collect::default();
                let dest = WritableStream::new(sink.clone(), QueuingStrategy::default()).unwrap();

                assert_eq!(source.pipe_to(&dest, StreamPipeOptions::default()).await, Ok(()));
                assert_eq!(*sink.chunks.borrow(), vec![1, 2, 3, 4, 5]);
                assert!(sink.closed.get());
                assert!(!source.locked());
                assert!(!dest.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn prevent_close_leaves_destination_open() {
        test_async_with(|| {
            Box::pin(async move {
                let source = ReadableStream::from_stream(stream::iter([Ok(1u32)]));
                let sink = Collect::default();
                let dest = WritableStream::new(sink.clone(), QueuingStrategy::default()).unwrap();

                let options = StreamPipeOptions::new().prevent_close(true);
                assert_eq!(source.pipe_to(&dest, options).await, Ok(()));
                assert!(!sink.closed.get());
                assert_eq!(dest.state(), WritableStreamState::Writable);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn source_error_aborts_destination() {
        test_async_with(|| {
            Box::pin(async move {
                let source = ReadableStream::from_stream(stream::iter([
                    Ok(1u32),
                    Err(Error::message("source broke")),
                ]));
                let sink = Collect::default();
                let dest = WritableStream::new(sink.clone(), QueuingStrategy::default()).unwrap();

                assert_eq!(
                    source.pipe_to(&dest, StreamPipeOptions::default()).await,
                    Err(Error::message("source broke"))
                );
                assert_eq!(*sink.chunks.borrow(), vec![1]);
                assert_eq!(*sink.aborted.borrow(), Some(Error::message("source broke")));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn closed_destination_cancels_source() {
        test_async_with(|| {
            Box::pin(async move {
                let source = ReadableStream::from_stream(stream::iter([Ok(1u32)]));
                let dest =
                    WritableStream::new(Collect::default(), QueuingStrategy::default()).unwrap();
                assert_eq!(dest.close().await, Ok(()));

                let result = source.pipe_to(&dest, StreamPipeOptions::default()).await;
                assert!(matches!(result, Err(Error::InvalidState(_))));
                assert_eq!(source.state(), ReadableStreamState::Closed);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn abort_signal_stops_the_pipe() {
        test_async_with(|| {
            Box::pin(async move {
                let source = ReadableStream::from_stream(stream::pending::<Result<u32>>());
                let sink = Collect::default();
                let dest = WritableStream::new(sink.clone(), QueuingStrategy::default()).unwrap();
                let controller = AbortController::new();

                let pipe = source.pipe_to(
                    &dest,
                    StreamPipeOptions::new().signal(controller.signal()),
                );
                flush_jobs().await;
                assert!(pipe.is_pending());

                controller.abort(Some(Error::message("user stop")));
                assert_eq!(pipe.await, Err(Error::message("user stop")));
                assert_eq!(*sink.aborted.borrow(), Some(Error::message("user stop")));
                assert_eq!(source.state(), ReadableStreamState::Closed);
                assert!(!source.locked());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn refuses_locked_streams() {
        test_async_with(|| {
            Box::pin(async move {
                let source = ReadableStream::from_stream(stream::iter([Ok(1u32)]));
                let dest =
                    WritableStream::new(Collect::default(), QueuingStrategy::default()).unwrap();
                let writer = dest.get_writer().unwrap();
                assert!(matches!(
                    source.pipe_to(&dest, StreamPipeOptions::default()).await,
                    Err(Error::InvalidState(_))
                ));
                assert!(!source.is_disturbed());
                drop(writer);

                let _reader = source.get_reader().unwrap();
                assert!(matches!(
                    source.pipe_to(&dest, StreamPipeOptions::default()).await,
                    Err(Error::InvalidState(_))
                ));
            })
        })
        .await;
    }
}

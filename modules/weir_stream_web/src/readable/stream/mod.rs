use std::{
    cell::RefCell,
    fmt,
    pin::Pin,
    rc::{Rc, Weak},
};

use futures::{Stream, StreamExt};
use tracing::trace;
use weir_utils::{Error, Promise, Result};

use super::{
    controller::ReadableStreamController, reader::WeakReader, BoxedReadIntoRequest,
    BoxedReadRequest, ReadableByteStreamController, ReadableStreamBYOBReader,
    ReadableStreamDefaultController, ReadableStreamDefaultReader, ReadableStreamGetReaderOptions,
    ReadableStreamReader, ReaderMode,
};
use crate::{
    buffer::ArrayBufferView,
    queuing_strategy::{QueuingStrategy, SizeAlgorithm},
    utils::promise::{promise_from_future, upon_promise_fulfilment},
};

pub(crate) use algorithms::{CancelAlgorithm, PullAlgorithm, StartAlgorithm};
pub use source::{EmptySource, UnderlyingByteSource, UnderlyingSource};

mod algorithms;
mod source;

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) enum ReadableStreamState {
    #[default]
    Readable,
    Closed,
    Errored(Error),
}

pub(crate) struct ReadableStreamInner<T: 'static> {
    pub(crate) controller: Option<Rc<dyn ReadableStreamController<T>>>,
    pub(crate) disturbed: bool,
    pub(crate) reader: Option<WeakReader<T>>,
    // the stored error lives inside the errored state
    pub(crate) state: ReadableStreamState,
}

/// A source of chunks of type `T` that can be read by exactly one reader at a time.
///
/// Handles are cheap to clone and all refer to the same stream. Streams are single-threaded: every
/// operation must run on a `tokio::task::LocalSet`, which is where the engine schedules its
/// reactions.
pub struct ReadableStream<T: 'static> {
    pub(crate) inner: Rc<RefCell<ReadableStreamInner<T>>>,
}

impl<T: 'static> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for ReadableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStream")
            .field("state", &self.state())
            .field("locked", &self.is_readable_stream_locked())
            .field("disturbed", &self.is_disturbed())
            .finish()
    }
}

impl<T: 'static> ReadableStream<T> {
    // https://streams.spec.whatwg.org/#rs-prototype
    // constructor(optional object underlyingSource, optional QueuingStrategy strategy = {});
    pub fn new(
        underlying_source: impl UnderlyingSource<T>,
        strategy: QueuingStrategy<T>,
    ) -> Result<Self> {
        // Let sizeAlgorithm be ! ExtractSizeAlgorithm(strategy).
        let size_algorithm = strategy.extract_size_algorithm();

        // Let highWaterMark be ? ExtractHighWaterMark(strategy, 1).
        let high_water_mark = strategy.extract_high_water_mark(1.0)?;

        // Perform ! InitializeReadableStream(this).
        let stream = Self::initialize_readable_stream();

        let (start_algorithm, pull_algorithm, cancel_algorithm) =
            algorithms::from_underlying_source(underlying_source);

        // Perform ? SetUpReadableStreamDefaultControllerFromUnderlyingSource(this, underlyingSource, underlyingSourceDict, highWaterMark, sizeAlgorithm).
        ReadableStreamDefaultController::set_up_readable_stream_default_controller(
            &stream,
            start_algorithm,
            pull_algorithm,
            cancel_algorithm,
            high_water_mark,
            size_algorithm,
        );

        Ok(stream)
    }

    /// Wraps an async stream of results. Items are pulled only when the readable stream wants
    /// more, an `Err` item errors the stream, and cancelling the stream drops the source stream.
    pub fn from_stream(source: impl Stream<Item = Result<T>> + 'static) -> Self {
        Self::readable_stream_from_iterable(Box::pin(source))
    }

    fn readable_stream_from_iterable(source: Pin<Box<dyn Stream<Item = Result<T>>>>) -> Self {
        // Let iteratorRecord be ? GetIterator(asyncIterable, async).
        // The slot is emptied while a pull holds the iterator and for good once cancelled.
        let iterator_record = Rc::new(RefCell::new(IteratorRecord {
            iterator: Some(source),
            done: false,
        }));

        // Let pullAlgorithm be the following steps:
        let pull_algorithm = PullAlgorithm::new({
            let iterator_record = iterator_record.clone();
            move |controller: ReadableStreamDefaultController<T>| {
                let iterator_record = iterator_record.clone();
                promise_from_future(async move {
                    let Some(mut iterator) = iterator_record.borrow_mut().iterator.take() else {
                        return Ok(());
                    };

                    // Let nextResult be IteratorNext(iteratorRecord).
                    let next_result = iterator.next().await;

                    {
                        let mut record = iterator_record.borrow_mut();
                        if !record.done {
                            record.iterator = Some(iterator);
                        }
                    }

                    match next_result {
                        // If nextResult is an abrupt completion, return a promise rejected with nextResult.[[Value]].
                        Some(Err(e)) => Err(e),
                        // If done is true:
                        None => {
                            iterator_record.borrow_mut().iterator = None;
                            // Perform ! ReadableStreamDefaultControllerClose(stream.[[controller]]).
                            controller.readable_stream_default_controller_close();
                            Ok(())
                        },
                        // Let value be ? IteratorValue(iterResult).
                        Some(Ok(value)) => {
                            // Perform ! ReadableStreamDefaultControllerEnqueue(stream.[[controller]], value).
                            controller.readable_stream_default_controller_enqueue(value)
                        },
                    }
                })
            }
        });

        // Let cancelAlgorithm be the following steps, given reason:
        let cancel_algorithm = CancelAlgorithm::new(move |_reason| {
            // Dropping the iterator is how an async Rust stream is told to stop.
            let mut record = iterator_record.borrow_mut();
            record.done = true;
            record.iterator = None;
            Promise::resolved(())
        });

        // Set stream to ! CreateReadableStream(startAlgorithm, pullAlgorithm, cancelAlgorithm, 0).
        Self::create_readable_stream(
            StartAlgorithm::ReturnUndefined,
            pull_algorithm,
            cancel_algorithm,
            Some(0.0),
            None,
        )
    }

    // readonly attribute boolean locked;
    pub fn locked(&self) -> bool {
        // Return ! IsReadableStreamLocked(this).
        self.is_readable_stream_locked()
    }

    /// Whether anything has ever read from or cancelled this stream.
    pub fn is_disturbed(&self) -> bool {
        self.inner.borrow().disturbed
    }

    // Promise<undefined> cancel(optional any reason);
    pub fn cancel(&self, reason: Option<Error>) -> Promise<()> {
        // If ! IsReadableStreamLocked(this) is true, return a promise rejected with a TypeError exception.
        if self.is_readable_stream_locked() {
            return Promise::rejected(Error::invalid_state(
                "Cannot cancel a stream that already has a reader",
            ));
        }

        // Return ! ReadableStreamCancel(this, reason).
        self.readable_stream_cancel(reason.unwrap_or(Error::Unspecified))
    }

    /// Locks the stream to a new default reader.
    pub fn get_reader(&self) -> Result<ReadableStreamDefaultReader<T>> {
        // Return ? AcquireReadableStreamDefaultReader(this).
        ReadableStreamDefaultReader::set_up_readable_stream_default_reader(self)
    }

    // ReadableStreamReader getReader(optional ReadableStreamGetReaderOptions options = {});
    pub fn get_reader_with(
        &self,
        options: ReadableStreamGetReaderOptions,
    ) -> Result<ReadableStreamReader<T>> {
        match options.mode {
            // If options["mode"] does not exist, return ? AcquireReadableStreamDefaultReader(this).
            None => self.get_reader().map(ReadableStreamReader::Default),
            // Assert: options["mode"] is "byob".
            Some(ReaderMode::Byob) => {
                // Return ? AcquireReadableStreamBYOBReader(this).
                let stream = self
                    .controller()
                    .and_then(|controller| controller.as_byte_controller())
                    .and_then(|controller| controller.stream())
                    .ok_or_else(|| {
                        Error::invalid_argument(
                            "Cannot use a BYOB reader with a non-byte stream",
                        )
                    })?;
                ReadableStreamBYOBReader::set_up_readable_stream_byob_reader(&stream)
                    .map(ReadableStreamReader::Byob)
            },
        }
    }

    // InitializeReadableStream(stream)
    fn initialize_readable_stream() -> Self {
        Self {
            inner: Rc::new(RefCell::new(ReadableStreamInner {
                // Set stream.[[state]] to "readable".
                state: ReadableStreamState::Readable,
                // Set stream.[[reader]] and stream.[[storedError]] to undefined.
                reader: None,
                // Set stream.[[disturbed]] to false.
                disturbed: false,
                controller: None,
            })),
        }
    }

    // CreateReadableStream(startAlgorithm, pullAlgorithm, cancelAlgorithm[, highWaterMark, [, sizeAlgorithm]]) performs the following steps:
    pub(crate) fn create_readable_stream(
        start_algorithm: StartAlgorithm<ReadableStreamDefaultController<T>>,
        pull_algorithm: PullAlgorithm<ReadableStreamDefaultController<T>>,
        cancel_algorithm: CancelAlgorithm,
        high_water_mark: Option<f64>,
        size_algorithm: Option<SizeAlgorithm<T>>,
    ) -> Self {
        // If highWaterMark was not passed, set it to 1.
        let high_water_mark = high_water_mark.unwrap_or(1.0);

        // If sizeAlgorithm was not passed, set it to an algorithm that returns 1.
        let size_algorithm = size_algorithm.unwrap_or(SizeAlgorithm::AlwaysOne);

        // Let stream be a new ReadableStream.
        // Perform ! InitializeReadableStream(stream).
        let stream = Self::initialize_readable_stream();

        // Perform ? SetUpReadableStreamDefaultController(stream, controller, startAlgorithm, pullAlgorithm, cancelAlgorithm, highWaterMark, sizeAlgorithm).
        ReadableStreamDefaultController::set_up_readable_stream_default_controller(
            &stream,
            start_algorithm,
            pull_algorithm,
            cancel_algorithm,
            high_water_mark,
            size_algorithm,
        );

        // Return stream.
        stream
    }

    pub(crate) fn from_weak(weak: &Weak<RefCell<ReadableStreamInner<T>>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<ReadableStreamInner<T>>> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn state(&self) -> ReadableStreamState {
        self.inner.borrow().state.clone()
    }

    pub(crate) fn is_readable(&self) -> bool {
        matches!(self.inner.borrow().state, ReadableStreamState::Readable)
    }

    pub(crate) fn controller(&self) -> Option<Rc<dyn ReadableStreamController<T>>> {
        self.inner.borrow().controller.clone()
    }

    pub(crate) fn reader(&self) -> Option<ReadableStreamReader<T>> {
        self.inner
            .borrow()
            .reader
            .as_ref()
            .and_then(WeakReader::upgrade)
    }

    pub(crate) fn is_readable_stream_locked(&self) -> bool {
        // If stream.[[reader]] is undefined, return false.
        // Return true.
        self.inner.borrow().reader.is_some()
    }

    pub(crate) fn readable_stream_close(&self) {
        // Let reader be stream.[[reader]].
        let reader = {
            let mut inner = self.inner.borrow_mut();
            // Assert: stream.[[state]] is "readable".
            // Set stream.[[state]] to "closed".
            inner.state = ReadableStreamState::Closed;
            inner.reader.as_ref().and_then(WeakReader::upgrade)
        };
        trace!("Readable stream closed");

        // If reader is undefined, return.
        let Some(reader) = reader else {
            return;
        };

        // Resolve reader.[[closedPromise]] with undefined.
        reader.closed_promise().resolve(());

        // If reader implements ReadableStreamDefaultReader,
        if let ReadableStreamReader::Default(reader) = reader {
            // Let readRequests be reader.[[readRequests]].
            // Set reader.[[readRequests]] to an empty list.
            let read_requests = reader.take_read_requests();

            // For each readRequest of readRequests,
            for read_request in read_requests {
                // Perform readRequest’s close steps.
                read_request.close_steps();
            }
        }
    }

    pub(crate) fn readable_stream_error(&self, e: Error) {
        // Let reader be stream.[[reader]].
        let reader = {
            let mut inner = self.inner.borrow_mut();
            // Assert: stream.[[state]] is "readable".
            // Set stream.[[state]] to "errored".
            // Set stream.[[storedError]] to e.
            inner.state = ReadableStreamState::Errored(e.clone());
            inner.reader.as_ref().and_then(WeakReader::upgrade)
        };
        trace!("Readable stream errored: {}", e);

        // If reader is undefined, return.
        let Some(reader) = reader else {
            return;
        };

        // Reject reader.[[closedPromise]] with e.
        reader.closed_promise().reject(e.clone());

        match reader {
            // If reader implements ReadableStreamDefaultReader,
            ReadableStreamReader::Default(reader) => {
                // Perform ! ReadableStreamDefaultReaderErrorReadRequests(reader, e).
                reader.readable_stream_default_reader_error_read_requests(e)
            },
            // Otherwise,
            ReadableStreamReader::Byob(reader) => {
                // Perform ! ReadableStreamBYOBReaderErrorReadIntoRequests(reader, e).
                reader.readable_stream_byob_reader_error_read_into_requests(e)
            },
        }
    }

    pub(crate) fn readable_stream_cancel(&self, reason: Error) -> Promise<()> {
        {
            let mut inner = self.inner.borrow_mut();
            // Set stream.[[disturbed]] to true.
            inner.disturbed = true;

            match &inner.state {
                // If stream.[[state]] is "closed", return a promise resolved with undefined.
                ReadableStreamState::Closed => return Promise::resolved(()),
                // If stream.[[state]] is "errored", return a promise rejected with stream.[[storedError]].
                ReadableStreamState::Errored(stored_error) => {
                    return Promise::rejected(stored_error.clone())
                },
                ReadableStreamState::Readable => {},
            }
        }

        // Perform ! ReadableStreamClose(stream).
        self.readable_stream_close();

        // Let reader be stream.[[reader]].
        // If reader is not undefined and reader implements ReadableStreamBYOBReader,
        if let Some(ReadableStreamReader::Byob(reader)) = self.reader() {
            // Let readIntoRequests be reader.[[readIntoRequests]].
            // Set reader.[[readIntoRequests]] to an empty list.
            let read_into_requests = reader.take_read_into_requests();

            // For each readIntoRequest of readIntoRequests,
            for read_into_request in read_into_requests {
                // Perform readIntoRequest’s close steps, given undefined.
                read_into_request.close_steps(None);
            }
        }

        // Let sourceCancelPromise be ! stream.[[controller]].[[CancelSteps]](reason).
        let Some(controller) = self.controller() else {
            return Promise::resolved(());
        };
        let source_cancel_promise = controller.cancel_steps(reason);

        // Return the result of reacting to sourceCancelPromise with a fulfillment step that returns undefined.
        upon_promise_fulfilment(source_cancel_promise, |()| Ok(()))
    }

    pub(crate) fn readable_stream_add_read_request(&self, read_request: BoxedReadRequest<T>) {
        // Assert: stream.[[reader]] implements ReadableStreamDefaultReader.
        match self.reader() {
            // Append readRequest to stream.[[reader]].[[readRequests]].
            Some(ReadableStreamReader::Default(reader)) => reader.add_read_request(read_request),
            _ => read_request.error_steps(Error::invalid_state(
                "The stream is not locked to a default reader",
            )),
        }
    }

    pub(crate) fn readable_stream_add_read_into_request(
        &self,
        read_into_request: BoxedReadIntoRequest,
    ) {
        // Assert: stream.[[reader]] implements ReadableStreamBYOBReader.
        match self.reader() {
            // Append readRequest to stream.[[reader]].[[readIntoRequests]].
            Some(ReadableStreamReader::Byob(reader)) => {
                reader.add_read_into_request(read_into_request)
            },
            _ => read_into_request.error_steps(Error::invalid_state(
                "The stream is not locked to a BYOB reader",
            )),
        }
    }

    pub(crate) fn readable_stream_fulfill_read_request(&self, chunk: T, done: bool) {
        // Let reader be stream.[[reader]].
        // Assert: reader.[[readRequests]] is not empty.
        let Some(ReadableStreamReader::Default(reader)) = self.reader() else {
            return;
        };

        // Let readRequest be reader.[[readRequests]][0].
        // Remove readRequest from reader.[[readRequests]].
        let Some(read_request) = reader.pop_read_request() else {
            return;
        };

        if done {
            // If done is true, perform readRequest’s close steps.
            read_request.close_steps()
        } else {
            // Otherwise, perform readRequest’s chunk steps, given chunk.
            read_request.chunk_steps(chunk)
        }
    }

    pub(crate) fn readable_stream_fulfill_read_into_request(
        &self,
        chunk: ArrayBufferView,
        done: bool,
    ) {
        // Let reader be stream.[[reader]].
        // Assert: reader.[[readIntoRequests]] is not empty.
        let Some(ReadableStreamReader::Byob(reader)) = self.reader() else {
            return;
        };

        // Let readIntoRequest be reader.[[readIntoRequests]][0].
        // Remove readIntoRequest from reader.[[readIntoRequests]].
        let Some(read_into_request) = reader.pop_read_into_request() else {
            return;
        };

        if done {
            // If done is true, perform readIntoRequest’s close steps, given chunk.
            read_into_request.close_steps(Some(chunk))
        } else {
            // Otherwise, perform readIntoRequest’s chunk steps, given chunk.
            read_into_request.chunk_steps(chunk)
        }
    }

    pub(crate) fn readable_stream_get_num_read_requests(&self) -> usize {
        match self.reader() {
            Some(ReadableStreamReader::Default(reader)) => reader.num_read_requests(),
            _ => 0,
        }
    }

    pub(crate) fn readable_stream_get_num_read_into_requests(&self) -> usize {
        match self.reader() {
            Some(ReadableStreamReader::Byob(reader)) => reader.num_read_into_requests(),
            _ => 0,
        }
    }

    pub(crate) fn readable_stream_has_default_reader(&self) -> bool {
        // Let reader be stream.[[reader]].
        // If reader is undefined, return false.
        // If reader implements ReadableStreamDefaultReader, return true.
        // Return false.
        matches!(self.reader(), Some(ReadableStreamReader::Default(_)))
    }

    pub(crate) fn readable_stream_has_byob_reader(&self) -> bool {
        matches!(self.reader(), Some(ReadableStreamReader::Byob(_)))
    }
}

impl ReadableStream<ArrayBufferView> {
    /// A byte stream driven by `underlying_source`. The strategy may only carry a high-water mark,
    /// which defaults to 0; a size function is a `RangeError`.
    pub fn new_bytes(
        underlying_source: impl UnderlyingByteSource,
        strategy: QueuingStrategy<ArrayBufferView>,
    ) -> Result<Self> {
        // If strategy["size"] exists, throw a RangeError exception.
        if strategy.has_size() {
            return Err(Error::out_of_range(
                "The strategy for a byte stream cannot have a size function",
            ));
        }

        // Let highWaterMark be ? ExtractHighWaterMark(strategy, 0).
        let high_water_mark = strategy.extract_high_water_mark(0.0)?;

        let ((start_algorithm, pull_algorithm, cancel_algorithm), auto_allocate_chunk_size) =
            algorithms::from_underlying_byte_source(underlying_source);

        // If autoAllocateChunkSize is 0, then throw a TypeError exception.
        if auto_allocate_chunk_size == Some(0) {
            return Err(Error::invalid_argument(
                "autoAllocateChunkSize must be greater than 0",
            ));
        }

        let stream = Self::initialize_readable_stream();

        // Perform ? SetUpReadableByteStreamControllerFromUnderlyingSource(this, underlyingSource, underlyingSourceDict, highWaterMark).
        ReadableByteStreamController::set_up_readable_byte_stream_controller(
            &stream,
            start_algorithm,
            pull_algorithm,
            cancel_algorithm,
            high_water_mark,
            auto_allocate_chunk_size,
        );

        Ok(stream)
    }

    /// Locks the stream to a new BYOB reader.
    pub fn get_byob_reader(&self) -> Result<ReadableStreamBYOBReader> {
        ReadableStreamBYOBReader::set_up_readable_stream_byob_reader(self)
    }
}

struct IteratorRecord<T> {
    iterator: Option<Pin<Box<dyn Stream<Item = Result<T>>>>>,
    done: bool,
}

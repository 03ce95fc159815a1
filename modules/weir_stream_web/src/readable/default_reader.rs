use std::{cell::RefCell, collections::VecDeque, fmt, future::Future, rc::Rc};

use tokio::sync::oneshot;
use weir_utils::{Error, Promise, Result};

use super::{
    reader::ReadableStreamGenericReader, BoxedReadRequest, ReadableStream,
    ReadableStreamReadRequest, ReadableStreamReadResult, ReadableStreamState,
};

pub(crate) struct ReadableStreamDefaultReaderInner<T: 'static> {
    pub(crate) generic: ReadableStreamGenericReader<T>,
    read_requests: VecDeque<BoxedReadRequest<T>>,
}

impl<T: 'static> Drop for ReadableStreamDefaultReaderInner<T> {
    fn drop(&mut self) {
        let read_requests = std::mem::take(&mut self.read_requests);
        self.generic.release_on_drop(move |e| {
            // Perform ! ReadableStreamDefaultReaderErrorReadRequests(reader, e).
            for read_request in read_requests {
                read_request.error_steps(e.clone());
            }
        });
    }
}

/// An exclusive reader that receives whole chunks in FIFO order.
pub struct ReadableStreamDefaultReader<T: 'static> {
    pub(crate) inner: Rc<RefCell<ReadableStreamDefaultReaderInner<T>>>,
}

impl<T: 'static> Clone for ReadableStreamDefaultReader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for ReadableStreamDefaultReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ReadableStreamDefaultReader")
            .field("released", &inner.generic.stream.is_none())
            .field("read_requests", &inner.read_requests.len())
            .finish()
    }
}

struct DefaultReadRequest<T> {
    sender: oneshot::Sender<Result<ReadableStreamReadResult<T>>>,
}

impl<T> ReadableStreamReadRequest<T> for DefaultReadRequest<T> {
    // chunk steps, given chunk
    // Resolve promise with «[ "value" → chunk, "done" → false ]».
    fn chunk_steps(self: Box<Self>, chunk: T) {
        let _ = self.sender.send(Ok(ReadableStreamReadResult::chunk(chunk)));
    }

    // close steps
    // Resolve promise with «[ "value" → undefined, "done" → true ]».
    fn close_steps(self: Box<Self>) {
        let _ = self.sender.send(Ok(ReadableStreamReadResult::done(None)));
    }

    // error steps, given e
    // Reject promise with e.
    fn error_steps(self: Box<Self>, reason: Error) {
        let _ = self.sender.send(Err(reason));
    }
}

impl<T: 'static> ReadableStreamDefaultReader<T> {
    /// Locks `stream` to a new reader. Fails with a `TypeError` if the stream is already locked.
    pub fn new(stream: &ReadableStream<T>) -> Result<Self> {
        Self::set_up_readable_stream_default_reader(stream)
    }

    pub(crate) fn set_up_readable_stream_default_reader(
        stream: &ReadableStream<T>,
    ) -> Result<Self> {
        // If ! IsReadableStreamLocked(stream) is true, throw a TypeError exception.
        if stream.is_readable_stream_locked() {
            return Err(Error::invalid_state(
                "This stream has already been locked for exclusive reading by another reader",
            ));
        }

        // Perform ! ReadableStreamReaderGenericInitialize(reader, stream).
        let generic =
            ReadableStreamGenericReader::readable_stream_reader_generic_initialize(stream);

        let reader = Self {
            inner: Rc::new(RefCell::new(ReadableStreamDefaultReaderInner {
                generic,
                // Set reader.[[readRequests]] to a new empty list.
                read_requests: VecDeque::new(),
            })),
        };

        // Set stream.[[reader]] to reader.
        stream.inner.borrow_mut().reader =
            Some(super::ReadableStreamReader::Default(reader.clone()).downgrade());

        Ok(reader)
    }

    /// Requests the next chunk. The request is queued immediately; the returned future resolves
    /// once a chunk is available, the stream closes, or the stream errors.
    pub fn read(&self) -> impl Future<Output = Result<ReadableStreamReadResult<T>>> + 'static {
        let receiver = self.read_inner();
        async move {
            receiver?.await.unwrap_or_else(|_| {
                Err(Error::invalid_state(
                    "The reader was dropped before the read completed",
                ))
            })
        }
    }

    fn read_inner(&self) -> Result<oneshot::Receiver<Result<ReadableStreamReadResult<T>>>> {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        self.inner.borrow().generic.stream_or_released("read from")?;

        // Let promise be a new promise.
        let (sender, receiver) = oneshot::channel();

        // Perform ! ReadableStreamDefaultReaderRead(this, readRequest).
        self.readable_stream_default_reader_read(Box::new(DefaultReadRequest { sender }));

        // Return promise.
        Ok(receiver)
    }

    pub(crate) fn readable_stream_default_reader_read(&self, read_request: BoxedReadRequest<T>) {
        // Let stream be reader.[[stream]].
        // Assert: stream is not undefined.
        let stream = self.inner.borrow().generic.stream_or_released("read from");
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => return read_request.error_steps(e),
        };

        // Set stream.[[disturbed]] to true.
        stream.inner.borrow_mut().disturbed = true;

        match stream.state() {
            // If stream.[[state]] is "closed", perform readRequest’s close steps.
            ReadableStreamState::Closed => read_request.close_steps(),
            // Otherwise, if stream.[[state]] is "errored", perform readRequest’s error steps given stream.[[storedError]].
            ReadableStreamState::Errored(stored_error) => read_request.error_steps(stored_error),
            // Otherwise,
            ReadableStreamState::Readable => {
                // Perform ! stream.[[controller]].[[PullSteps]](readRequest).
                match stream.controller() {
                    Some(controller) => controller.pull_steps(read_request),
                    None => read_request.error_steps(Error::invalid_state(
                        "The stream has no controller",
                    )),
                }
            },
        }
    }

    /// Releases the lock. Pending reads are rejected with a `TypeError`.
    pub fn release_lock(&self) {
        // If this.[[stream]] is undefined, return.
        if self.inner.borrow().generic.stream.is_none() {
            return;
        }

        // Perform ! ReadableStreamDefaultReaderRelease(this).
        self.readable_stream_default_reader_release()
    }

    pub(crate) fn readable_stream_default_reader_release(&self) {
        // Perform ! ReadableStreamReaderGenericRelease(reader).
        self.inner
            .borrow_mut()
            .generic
            .readable_stream_reader_generic_release();

        // Let e be a new TypeError exception.
        let e = Error::invalid_state("Reader was released");

        // Perform ! ReadableStreamDefaultReaderErrorReadRequests(reader, e).
        self.readable_stream_default_reader_error_read_requests(e)
    }

    pub(crate) fn readable_stream_default_reader_error_read_requests(&self, e: Error) {
        // Let readRequests be reader.[[readRequests]].
        // Set reader.[[readRequests]] to a new empty list.
        let read_requests = self.take_read_requests();

        // For each readRequest of readRequests,
        for read_request in read_requests {
            // Perform readRequest’s error steps, given e.
            read_request.error_steps(e.clone());
        }
    }

    pub fn closed(&self) -> Promise<()> {
        self.inner.borrow().generic.closed_promise.promise.clone()
    }

    /// Cancels the stream this reader is locked to. `None` cancels without a reason.
    pub fn cancel(&self, reason: Option<Error>) -> Promise<()> {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        // Return ! ReadableStreamReaderGenericCancel(this, reason).
        let generic_stream = self.inner.borrow().generic.stream.clone();
        match generic_stream {
            Some(stream) => stream.readable_stream_cancel(reason.unwrap_or(Error::Unspecified)),
            None => Promise::rejected(Error::invalid_state(
                "Cannot cancel a stream using a released reader",
            )),
        }
    }

    pub(crate) fn add_read_request(&self, read_request: BoxedReadRequest<T>) {
        self.inner
            .borrow_mut()
            .read_requests
            .push_back(read_request);
    }

    pub(crate) fn pop_read_request(&self) -> Option<BoxedReadRequest<T>> {
        self.inner.borrow_mut().read_requests.pop_front()
    }

    pub(crate) fn take_read_requests(&self) -> VecDeque<BoxedReadRequest<T>> {
        std::mem::take(&mut self.inner.borrow_mut().read_requests)
    }

    pub(crate) fn num_read_requests(&self) -> usize {
        self.inner.borrow().read_requests.len()
    }
}

use std::{cell::RefCell, collections::VecDeque, fmt, future::Future, rc::Rc};

use tokio::sync::oneshot;
use weir_utils::{Error, Promise, Result};

use super::{
    reader::ReadableStreamGenericReader, BoxedReadIntoRequest, ReadableStream,
    ReadableStreamReadIntoRequest, ReadableStreamReadResult, ReadableStreamReader,
    ReadableStreamState,
};
use crate::buffer::ArrayBufferView;

// dictionary ReadableStreamBYOBReaderReadOptions {
//   [EnforceRange] unsigned long long min = 1;
// };
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadableStreamBYOBReaderReadOptions {
    /// Minimum number of elements the read must fill before it completes.
    pub min: usize,
}

impl Default for ReadableStreamBYOBReaderReadOptions {
    fn default() -> Self {
        Self { min: 1 }
    }
}

pub(crate) struct ReadableStreamBYOBReaderInner {
    pub(crate) generic: ReadableStreamGenericReader<ArrayBufferView>,
    read_into_requests: VecDeque<BoxedReadIntoRequest>,
}

impl Drop for ReadableStreamBYOBReaderInner {
    fn drop(&mut self) {
        let read_into_requests = std::mem::take(&mut self.read_into_requests);
        self.generic.release_on_drop(move |e| {
            // Perform ! ReadableStreamBYOBReaderErrorReadIntoRequests(reader, e).
            for read_into_request in read_into_requests {
                read_into_request.error_steps(e.clone());
            }
        });
    }
}

/// An exclusive reader of a byte stream that reads into buffers supplied by the caller.
///
/// Every read moves the caller's view into the stream and hands the same buffer back with the
/// filled window, so a loop can keep reusing one allocation.
pub struct ReadableStreamBYOBReader {
    pub(crate) inner: Rc<RefCell<ReadableStreamBYOBReaderInner>>,
}

impl Clone for ReadableStreamBYOBReader {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for ReadableStreamBYOBReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ReadableStreamBYOBReader")
            .field("released", &inner.generic.stream.is_none())
            .field("read_into_requests", &inner.read_into_requests.len())
            .finish()
    }
}

/// Outcome of a BYOB read.
pub type ByobReadResult =
    std::result::Result<ReadableStreamReadResult<ArrayBufferView>, ReadableStreamBYOBReadError>;

type ReadIntoReceiver = oneshot::Receiver<Result<ReadableStreamReadResult<ArrayBufferView>>>;

/// A rejected BYOB read.
///
/// `view` holds the caller's buffer whenever the read was refused before the stream took it over:
/// validation failures, a released reader and an already errored stream. A read rejected while it
/// was pending leaves `view` empty, since its buffer was handed to the stream.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{error}")]
pub struct ReadableStreamBYOBReadError {
    pub error: Error,
    pub view: Option<ArrayBufferView>,
}

impl ReadableStreamBYOBReadError {
    fn returning(error: Error, view: ArrayBufferView) -> Self {
        Self {
            error,
            view: Some(view),
        }
    }
}

impl From<Error> for ReadableStreamBYOBReadError {
    fn from(error: Error) -> Self {
        Self { error, view: None }
    }
}

impl From<ReadableStreamBYOBReadError> for Error {
    fn from(value: ReadableStreamBYOBReadError) -> Self {
        value.error
    }
}

struct ByobReadIntoRequest {
    sender: oneshot::Sender<Result<ReadableStreamReadResult<ArrayBufferView>>>,
}

impl ReadableStreamReadIntoRequest for ByobReadIntoRequest {
    // chunk steps, given chunk
    // Resolve promise with «[ "value" → chunk, "done" → false ]».
    fn chunk_steps(self: Box<Self>, chunk: ArrayBufferView) {
        let _ = self.sender.send(Ok(ReadableStreamReadResult::chunk(chunk)));
    }

    // close steps, given chunk
    // Resolve promise with «[ "value" → chunk, "done" → true ]».
    fn close_steps(self: Box<Self>, chunk: Option<ArrayBufferView>) {
        let _ = self.sender.send(Ok(ReadableStreamReadResult::done(chunk)));
    }

    // error steps, given e
    // Reject promise with e.
    fn error_steps(self: Box<Self>, reason: Error) {
        let _ = self.sender.send(Err(reason));
    }
}

impl ReadableStreamBYOBReader {
    /// Locks a byte stream to a new BYOB reader.
    pub fn new(stream: &ReadableStream<ArrayBufferView>) -> Result<Self> {
        Self::set_up_readable_stream_byob_reader(stream)
    }

    pub(crate) fn set_up_readable_stream_byob_reader(
        stream: &ReadableStream<ArrayBufferView>,
    ) -> Result<Self> {
        // If ! IsReadableStreamLocked(stream) is true, throw a TypeError exception.
        if stream.is_readable_stream_locked() {
            return Err(Error::invalid_state(
                "This stream has already been locked for exclusive reading by another reader",
            ));
        }

        // If stream.[[controller]] does not implement ReadableByteStreamController, throw a TypeError exception.
        if stream
            .controller()
            .and_then(|controller| controller.as_byte_controller())
            .is_none()
        {
            return Err(Error::invalid_argument(
                "Cannot construct a ReadableStreamBYOBReader for a stream not constructed with a byte source",
            ));
        }

        // Perform ! ReadableStreamReaderGenericInitialize(reader, stream).
        let generic =
            ReadableStreamGenericReader::readable_stream_reader_generic_initialize(stream);

        let reader = Self {
            inner: Rc::new(RefCell::new(ReadableStreamBYOBReaderInner {
                generic,
                // Set reader.[[readIntoRequests]] to a new empty list.
                read_into_requests: VecDeque::new(),
            })),
        };

        stream.inner.borrow_mut().reader =
            Some(ReadableStreamReader::Byob(reader.clone()).downgrade());

        Ok(reader)
    }

    /// Reads into `view`, completing as soon as at least one element has been filled.
    pub fn read(&self, view: ArrayBufferView) -> impl Future<Output = ByobReadResult> + 'static {
        self.read_with(view, ReadableStreamBYOBReaderReadOptions::default())
    }

    // Promise<ReadableStreamReadResult> read(ArrayBufferView view, optional ReadableStreamBYOBReaderReadOptions options = {});
    /// Reads into `view`, completing once at least `options.min` elements have been filled, or
    /// earlier if the stream closes. Validation failures are reported through the returned future
    /// and carry `view` back to the caller.
    pub fn read_with(
        &self,
        view: ArrayBufferView,
        options: ReadableStreamBYOBReaderReadOptions,
    ) -> impl Future<Output = ByobReadResult> + 'static {
        let receiver = self.read_inner(view, options);
        async move {
            match receiver?.await {
                Ok(result) => result.map_err(ReadableStreamBYOBReadError::from),
                Err(_) => Err(Error::invalid_state(
                    "The reader was dropped before the read completed",
                )
                .into()),
            }
        }
    }

    fn read_inner(
        &self,
        view: ArrayBufferView,
        options: ReadableStreamBYOBReaderReadOptions,
    ) -> std::result::Result<ReadIntoReceiver, ReadableStreamBYOBReadError> {
        if let Err(error) = Self::validate_read(&view, options) {
            return Err(ReadableStreamBYOBReadError::returning(error, view));
        }

        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        if let Err(error) = self.inner.borrow().generic.stream_or_released("read from") {
            return Err(ReadableStreamBYOBReadError::returning(error, view));
        }

        // Let promise be a new promise.
        let (sender, receiver) = oneshot::channel();

        // Perform ! ReadableStreamBYOBReaderRead(this, view, options["min"], readIntoRequest).
        self.readable_stream_byob_reader_read(
            view,
            options.min,
            Box::new(ByobReadIntoRequest { sender }),
        )?;

        // Return promise.
        Ok(receiver)
    }

    fn validate_read(
        view: &ArrayBufferView,
        options: ReadableStreamBYOBReaderReadOptions,
    ) -> Result<()> {
        // If view.[[ByteLength]] is 0, return a promise rejected with a TypeError exception.
        if view.byte_length() == 0 {
            return Err(Error::invalid_argument("view must have non-zero byteLength"));
        }

        // If view.[[ViewedArrayBuffer]].[[ArrayBufferByteLength]] is 0, return a promise rejected with a TypeError exception.
        if view.buffer_byte_length() == 0 {
            return Err(Error::invalid_argument(
                "view's buffer must have non-zero byteLength",
            ));
        }

        // If options["min"] is 0, return a promise rejected with a TypeError exception.
        if options.min == 0 {
            return Err(Error::invalid_argument("options.min must be greater than 0"));
        }

        // If view has a [[TypedArrayName]] internal slot,
        // If options["min"] > view.[[ArrayLength]], return a promise rejected with a RangeError exception.
        // Otherwise (i.e., it is a DataView),
        // If options["min"] > view.[[ByteLength]], return a promise rejected with a RangeError exception.
        if options.min > view.len() {
            return Err(Error::out_of_range(
                "options.min must be less than or equal to views length",
            ));
        }

        Ok(())
    }

    /// Hands `view` to the byte controller. When the read is refused before the controller takes
    /// the buffer, `view` comes back inside the error and `read_into_request` is dropped unsettled.
    pub(crate) fn readable_stream_byob_reader_read(
        &self,
        view: ArrayBufferView,
        min: usize,
        read_into_request: BoxedReadIntoRequest,
    ) -> std::result::Result<(), ReadableStreamBYOBReadError> {
        // Let stream be reader.[[stream]].
        // Assert: stream is not undefined.
        let stream = self.inner.borrow().generic.stream_or_released("read from");
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => return Err(ReadableStreamBYOBReadError::returning(e, view)),
        };

        let Some(controller) = stream
            .controller()
            .and_then(|controller| controller.as_byte_controller())
        else {
            return Err(ReadableStreamBYOBReadError::returning(
                Error::invalid_state("The stream has no byte controller"),
                view,
            ));
        };

        // Set stream.[[disturbed]] to true.
        stream.inner.borrow_mut().disturbed = true;

        // If stream.[[state]] is "errored", perform readIntoRequest’s error steps given stream.[[storedError]].
        if let ReadableStreamState::Errored(stored_error) = stream.state() {
            return Err(ReadableStreamBYOBReadError::returning(stored_error, view));
        }

        // Otherwise, perform ! ReadableByteStreamControllerPullInto(stream.[[controller]], view, min, readIntoRequest).
        controller.readable_byte_stream_controller_pull_into(
            &stream,
            view,
            min,
            read_into_request,
        );
        Ok(())
    }

    /// Releases the lock. Pending reads are rejected with a `TypeError`.
    pub fn release_lock(&self) {
        // If this.[[stream]] is undefined, return.
        if self.inner.borrow().generic.stream.is_none() {
            return;
        }

        // Perform ! ReadableStreamBYOBReaderRelease(this).
        self.readable_stream_byob_reader_release()
    }

    fn readable_stream_byob_reader_release(&self) {
        // Perform ! ReadableStreamReaderGenericRelease(reader).
        self.inner
            .borrow_mut()
            .generic
            .readable_stream_reader_generic_release();

        // Let e be a new TypeError exception.
        let e = Error::invalid_state("Reader was released");

        // Perform ! ReadableStreamBYOBReaderErrorReadIntoRequests(reader, e).
        self.readable_stream_byob_reader_error_read_into_requests(e)
    }

    pub(crate) fn readable_stream_byob_reader_error_read_into_requests(&self, e: Error) {
        // Let readIntoRequests be reader.[[readIntoRequests]].
        // Set reader.[[readIntoRequests]] to a new empty list.
        let read_into_requests = self.take_read_into_requests();

        // For each readIntoRequest of readIntoRequests,
        for read_into_request in read_into_requests {
            // Perform readIntoRequest’s error steps, given e.
            read_into_request.error_steps(e.clone());
        }
    }

    pub fn closed(&self) -> Promise<()> {
        self.inner.borrow().generic.closed_promise.promise.clone()
    }

    /// Cancels the stream this reader is locked to. `None` cancels without a reason.
    pub fn cancel(&self, reason: Option<Error>) -> Promise<()> {
        // If this.[[stream]] is undefined, return a promise rejected with a TypeError exception.
        let generic_stream = self.inner.borrow().generic.stream.clone();
        match generic_stream {
            // Return ! ReadableStreamReaderGenericCancel(this, reason).
            Some(stream) => stream.readable_stream_cancel(reason.unwrap_or(Error::Unspecified)),
            None => Promise::rejected(Error::invalid_state(
                "Cannot cancel a stream using a released reader",
            )),
        }
    }

    pub(crate) fn add_read_into_request(&self, read_into_request: BoxedReadIntoRequest) {
        self.inner
            .borrow_mut()
            .read_into_requests
            .push_back(read_into_request);
    }

    pub(crate) fn pop_read_into_request(&self) -> Option<BoxedReadIntoRequest> {
        self.inner.borrow_mut().read_into_requests.pop_front()
    }

    pub(crate) fn take_read_into_requests(&self) -> VecDeque<BoxedReadIntoRequest> {
        std::mem::take(&mut self.inner.borrow_mut().read_into_requests)
    }

    pub(crate) fn num_read_into_requests(&self) -> usize {
        self.inner.borrow().read_into_requests.len()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use async_trait::async_trait;
    use weir_test::{flush_jobs, test_async_with};

    use super::*;
    use crate::{
        buffer::ElementType,
        queuing_strategy::QueuingStrategy,
        readable::{ReadableByteStreamController, UnderlyingByteSource},
    };

    #[derive(Default, Clone)]
    struct Grab(Rc<RefCell<Option<ReadableByteStreamController>>>);

    #[async_trait(?Send)]
    impl UnderlyingByteSource for Grab {
        async fn start(&self, controller: ReadableByteStreamController) -> Result<()> {
            self.0.borrow_mut().replace(controller);
            Ok(())
        }
    }

    impl Grab {
        fn controller(&self) -> ReadableByteStreamController {
            self.0.borrow().clone().unwrap()
        }
    }

    #[tokio::test]
    async fn read_fills_whole_elements_only() {
        test_async_with(|| {
            Box::pin(async move {
                let source = Grab::default();
                let stream =
                    ReadableStream::new_bytes(source.clone(), QueuingStrategy::default()).unwrap();
                let reader = stream.get_byob_reader().unwrap();
                flush_jobs().await;

                let view = ArrayBufferView::with_element_type(
                    ElementType::Uint16,
                    vec![0; 8],
                    0,
                    4,
                )
                .unwrap();
                let read = tokio::task::spawn_local(reader.read(view));
                flush_jobs().await;

                let controller = source.controller();
                controller.enqueue(vec![1, 2, 3].into()).unwrap();
                let result = read.await.unwrap().unwrap();
                assert!(!result.done);
                let value = result.value.unwrap();
                assert_eq!(value.element_type(), ElementType::Uint16);
                assert_eq!(value.as_bytes(), &[1, 2]);
                assert_eq!(value.buffer_byte_length(), 8);

                // the odd byte stays queued for the next read
                let result = reader.read(ArrayBufferView::zeroed(4)).await.unwrap();
                assert_eq!(result.value.unwrap().as_bytes(), &[3]);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn min_waits_for_enough_elements() {
        test_async_with(|| {
            Box::pin(async move {
                let source = Grab::default();
                let stream =
                    ReadableStream::new_bytes(source.clone(), QueuingStrategy::default()).unwrap();
                let reader = stream.get_byob_reader().unwrap();
                flush_jobs().await;

                let read = tokio::task::spawn_local(reader.read_with(
                    ArrayBufferView::zeroed(6),
                    ReadableStreamBYOBReaderReadOptions { min: 4 },
                ));
                flush_jobs().await;

                let controller = source.controller();
                controller.enqueue(vec![1, 2].into()).unwrap();
                flush_jobs().await;
                assert!(!read.is_finished());

                controller.enqueue(vec![3, 4, 5].into()).unwrap();
                let result = read.await.unwrap().unwrap();
                assert_eq!(result.value.unwrap().as_bytes(), &[1, 2, 3, 4, 5]);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn validation_failures_do_not_disturb_the_stream() {
        test_async_with(|| {
            Box::pin(async move {
                let stream =
                    ReadableStream::new_bytes(Grab::default(), QueuingStrategy::default()).unwrap();
                let reader = stream.get_byob_reader().unwrap();

                let err = reader.read(ArrayBufferView::zeroed(0)).await.unwrap_err();
                assert!(matches!(err.error, Error::InvalidArgument(_)));

                let err = reader
                    .read_with(
                        ArrayBufferView::zeroed(4),
                        ReadableStreamBYOBReaderReadOptions { min: 0 },
                    )
                    .await
                    .unwrap_err();
                assert!(matches!(err.error, Error::InvalidArgument(_)));

                let err = reader
                    .read_with(
                        ArrayBufferView::zeroed(4),
                        ReadableStreamBYOBReaderReadOptions { min: 5 },
                    )
                    .await
                    .unwrap_err();
                assert!(matches!(err.error, Error::OutOfRange(_)));

                assert!(!stream.is_disturbed());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn rejected_read_hands_the_buffer_back() {
        test_async_with(|| {
            Box::pin(async move {
                let source = Grab::default();
                let stream =
                    ReadableStream::new_bytes(source.clone(), QueuingStrategy::default()).unwrap();
                let reader = stream.get_byob_reader().unwrap();
                flush_jobs().await;

                let view = ArrayBufferView::new(vec![1, 2, 3, 4]);
                let err = reader
                    .read_with(view.clone(), ReadableStreamBYOBReaderReadOptions { min: 5 })
                    .await
                    .unwrap_err();
                assert!(matches!(err.error, Error::OutOfRange(_)));
                assert_eq!(err.view.as_ref(), Some(&view));

                // the returned buffer is still good for a read that succeeds
                let read = tokio::task::spawn_local(reader.read(err.view.unwrap()));
                flush_jobs().await;
                source.controller().enqueue(vec![9].into()).unwrap();
                let value = read.await.unwrap().unwrap().value.unwrap();
                assert_eq!(value.as_bytes(), &[9]);
                assert_eq!(value.buffer_byte_length(), 4);

                let e = Error::message("broken");
                source.controller().error(Some(e.clone()));
                let err = reader.read(view.clone()).await.unwrap_err();
                assert_eq!(err.error, e);
                assert_eq!(err.view, Some(view.clone()));

                reader.release_lock();
                let err = reader.read(view.clone()).await.unwrap_err();
                assert!(matches!(err.error, Error::InvalidState(_)));
                assert_eq!(err.view, Some(view));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn respond_on_closed_stream_drains_reads_as_done() {
        test_async_with(|| {
            Box::pin(async move {
                let source = Grab::default();
                let stream =
                    ReadableStream::new_bytes(source.clone(), QueuingStrategy::default()).unwrap();
                let reader = stream.get_byob_reader().unwrap();
                flush_jobs().await;

                let first = tokio::task::spawn_local(reader.read(ArrayBufferView::zeroed(4)));
                let second = tokio::task::spawn_local(reader.read(ArrayBufferView::zeroed(2)));
                flush_jobs().await;

                let controller = source.controller();
                let request = controller.byob_request().unwrap();
                assert_eq!(request.view_byte_length(), Some(4));
                controller.close().unwrap();
                assert!(matches!(request.respond(1), Err(Error::InvalidArgument(_))));
                request.respond(0).unwrap();

                for (read, capacity) in [(first, 4), (second, 2)] {
                    let result = read.await.unwrap().unwrap();
                    assert!(result.done);
                    let value = result.value.unwrap();
                    assert!(value.is_empty());
                    assert_eq!(value.buffer_byte_length(), capacity);
                }
                assert_eq!(reader.closed().await, Ok(()));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn close_with_partial_element_errors() {
        test_async_with(|| {
            Box::pin(async move {
                let source = Grab::default();
                let stream =
                    ReadableStream::new_bytes(source.clone(), QueuingStrategy::default()).unwrap();
                let reader = stream.get_byob_reader().unwrap();
                flush_jobs().await;

                let view = ArrayBufferView::with_element_type(
                    ElementType::Uint16,
                    vec![0; 4],
                    0,
                    2,
                )
                .unwrap();
                let read = tokio::task::spawn_local(reader.read(view));
                flush_jobs().await;

                let controller = source.controller();
                controller.enqueue(vec![9].into()).unwrap();
                let err = controller.close().unwrap_err();
                assert_eq!(
                    err,
                    Error::invalid_state("Insufficient bytes to fill elements in the given buffer")
                );
                assert_eq!(read.await.unwrap(), Err(err.into()));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn release_rejects_pending_reads() {
        test_async_with(|| {
            Box::pin(async move {
                let stream =
                    ReadableStream::new_bytes(Grab::default(), QueuingStrategy::default()).unwrap();
                let reader = stream.get_byob_reader().unwrap();
                let read = tokio::task::spawn_local(reader.read(ArrayBufferView::zeroed(4)));
                flush_jobs().await;

                reader.release_lock();
                assert_eq!(
                    read.await.unwrap(),
                    Err(Error::invalid_state("Reader was released").into())
                );
                assert!(!stream.locked());
                assert!(stream.get_byob_reader().is_ok());
            })
        })
        .await;
    }

    #[tokio::test]
    async fn dropped_reader_hands_pending_bytes_to_the_next_reader() {
        test_async_with(|| {
            Box::pin(async move {
                let source = Grab::default();
                let stream =
                    ReadableStream::new_bytes(source.clone(), QueuingStrategy::default()).unwrap();
                let reader = stream.get_byob_reader().unwrap();
                flush_jobs().await;

                let read = tokio::task::spawn_local(reader.read(ArrayBufferView::zeroed(4)));
                flush_jobs().await;

                drop(reader);
                assert_eq!(
                    read.await.unwrap(),
                    Err(Error::invalid_state("Reader was released").into())
                );
                assert!(!stream.locked());

                // the released read's buffer is still the head of the BYOB request
                let controller = source.controller();
                let request = controller.byob_request().unwrap();
                assert_eq!(request.view_byte_length(), Some(4));
                request
                    .with_view(|view| view[..3].copy_from_slice(&[1, 2, 3]))
                    .unwrap();
                request.respond(3).unwrap();

                let reader = stream.get_reader().unwrap();
                let result = reader.read().await.unwrap();
                assert_eq!(result.value.unwrap().as_bytes(), &[1, 2, 3]);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn byob_reader_requires_byte_stream() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = ReadableStream::<ArrayBufferView>::new(
                    crate::readable::EmptySource,
                    QueuingStrategy::default(),
                )
                .unwrap();
                assert!(matches!(
                    stream.get_byob_reader(),
                    Err(Error::InvalidArgument(_))
                ));
            })
        })
        .await;
    }
}

use std::{
    cell::RefCell,
    collections::VecDeque,
    fmt,
    rc::{Rc, Weak},
};

use weir_utils::{Error, Promise, Result};

use super::{
    controller::ReadableStreamController,
    stream::{ReadableStreamInner, ReadableStreamState},
    BoxedReadIntoRequest, BoxedReadRequest, CancelAlgorithm, PullAlgorithm, ReadableStream,
    ReadableStreamBYOBRequest, ReadableStreamReader, StartAlgorithm,
};
use crate::{
    buffer::{ArrayBufferView, ElementType},
    utils::promise::upon_promise,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullIntoDescriptorReaderType {
    Default,
    Byob,
    None,
}

// https://streams.spec.whatwg.org/#pull-into-descriptor
pub(crate) struct PullIntoDescriptor {
    // None once the buffer has been handed out through the BYOB request.
    buffer: Option<Vec<u8>>,
    buffer_byte_length: usize,
    byte_offset: usize,
    byte_length: usize,
    bytes_filled: usize,
    minimum_fill: usize,
    element_size: usize,
    // stands in for the view constructor
    element_type: ElementType,
    reader_type: PullIntoDescriptorReaderType,
}

impl PullIntoDescriptor {
    fn readable_byte_stream_controller_convert_pull_into_descriptor(
        self,
    ) -> Result<ArrayBufferView> {
        // Let bytesFilled be pullIntoDescriptor’s bytes filled.
        // Let elementSize be pullIntoDescriptor’s element size.
        // Assert: bytesFilled ≤ pullIntoDescriptor’s byte length.
        // Assert: the remainder after dividing bytesFilled by elementSize is 0.
        let length = self.bytes_filled / self.element_size;

        // Let buffer be ! TransferArrayBuffer(pullIntoDescriptor’s buffer).
        // A descriptor is only converted once its buffer is back from any BYOB request.
        debug_assert!(self.buffer.is_some(), "converting a detached pull-into descriptor");
        let buffer = self
            .buffer
            .ok_or_else(|| Error::invalid_state("The pull-into buffer has been detached"))?;

        // Return ! Construct(pullIntoDescriptor’s view constructor, « buffer, pullIntoDescriptor’s byte offset, bytesFilled ÷ elementSize »).
        Ok(ArrayBufferView::from_parts(
            self.element_type,
            buffer,
            self.byte_offset,
            length * self.element_size,
        ))
    }
}

// https://streams.spec.whatwg.org/#readable-byte-stream-queue-entry
struct ReadableByteStreamQueueEntry {
    buffer: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
}

pub(crate) struct ReadableByteStreamControllerInner {
    auto_allocate_chunk_size: Option<usize>,
    byob_request: Option<ReadableStreamBYOBRequest>,
    cancel_algorithm: Option<CancelAlgorithm>,
    close_requested: bool,
    pull_again: bool,
    pull_algorithm: Option<PullAlgorithm<ReadableByteStreamController>>,
    pulling: bool,
    pending_pull_intos: VecDeque<PullIntoDescriptor>,
    queue: VecDeque<ReadableByteStreamQueueEntry>,
    queue_total_size: usize,
    started: bool,
    strategy_hwm: f64,
    stream: Weak<RefCell<ReadableStreamInner<ArrayBufferView>>>,
}

impl ReadableByteStreamControllerInner {
    fn reset_queue(&mut self) {
        // Set container.[[queue]] to a new empty list.
        self.queue.clear();
        // Set container.[[queueTotalSize]] to 0.
        self.queue_total_size = 0;
    }

    fn readable_byte_stream_controller_clear_algorithms(&mut self) {
        // Set controller.[[pullAlgorithm]] to undefined.
        self.pull_algorithm = None;
        // Set controller.[[cancelAlgorithm]] to undefined.
        self.cancel_algorithm = None;
    }

    fn readable_byte_stream_controller_enqueue_chunk_to_queue(
        &mut self,
        buffer: Vec<u8>,
        byte_offset: usize,
        byte_length: usize,
    ) {
        // Append a new readable byte stream queue entry with buffer buffer, byte offset byteOffset, and byte length byteLength to controller.[[queue]].
        self.queue.push_back(ReadableByteStreamQueueEntry {
            buffer,
            byte_offset,
            byte_length,
        });

        // Set controller.[[queueTotalSize]] to controller.[[queueTotalSize]] + byteLength.
        self.queue_total_size += byte_length;
    }

    fn readable_byte_stream_controller_enqueue_cloned_chunk_to_queue(
        &mut self,
        buffer: &[u8],
        byte_offset: usize,
        byte_length: usize,
    ) {
        // Let cloneResult be CloneArrayBuffer(buffer, byteOffset, byteLength, %ArrayBuffer%).
        let clone_result = buffer[byte_offset..byte_offset + byte_length].to_vec();

        // Perform ! ReadableByteStreamControllerEnqueueChunkToQueue(controller, cloneResult.[[Value]], 0, byteLength).
        self.readable_byte_stream_controller_enqueue_chunk_to_queue(clone_result, 0, byte_length)
    }

    fn readable_byte_stream_enqueue_detached_pull_into_to_queue(&mut self) {
        // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
        let Some(pull_into_descriptor) = self.pending_pull_intos.pop_front() else {
            return;
        };

        // If pullIntoDescriptor’s bytes filled > 0, perform ? ReadableByteStreamControllerEnqueueClonedChunkToQueue(controller, pullIntoDescriptor’s buffer, pullIntoDescriptor’s byte offset, pullIntoDescriptor’s bytes filled).
        if pull_into_descriptor.bytes_filled > 0 {
            if let Some(buffer) = &pull_into_descriptor.buffer {
                self.readable_byte_stream_controller_enqueue_cloned_chunk_to_queue(
                    buffer,
                    pull_into_descriptor.byte_offset,
                    pull_into_descriptor.bytes_filled,
                );
            }
        }
    }

    fn readable_byte_stream_controller_fill_pull_into_descriptor_from_queue(
        &mut self,
        pull_into_descriptor: &mut PullIntoDescriptor,
    ) -> bool {
        // Let maxBytesToCopy be min(controller.[[queueTotalSize]], pullIntoDescriptor’s byte length − pullIntoDescriptor’s bytes filled).
        let max_bytes_to_copy = std::cmp::min(
            self.queue_total_size,
            pull_into_descriptor.byte_length - pull_into_descriptor.bytes_filled,
        );

        // Let maxBytesFilled be pullIntoDescriptor’s bytes filled + maxBytesToCopy.
        let max_bytes_filled = pull_into_descriptor.bytes_filled + max_bytes_to_copy;

        // Let totalBytesToCopyRemaining be maxBytesToCopy.
        let mut total_bytes_to_copy_remaining = max_bytes_to_copy;

        // Let ready be false.
        let mut ready = false;

        // Let remainderBytes be the remainder after dividing maxBytesFilled by pullIntoDescriptor’s element size.
        let remainder_bytes = max_bytes_filled % pull_into_descriptor.element_size;

        // Let maxAlignedBytes be maxBytesFilled − remainderBytes.
        let max_aligned_bytes = max_bytes_filled - remainder_bytes;

        // If maxAlignedBytes ≥ pullIntoDescriptor’s minimum fill,
        if max_aligned_bytes >= pull_into_descriptor.minimum_fill {
            // Set totalBytesToCopyRemaining to maxAlignedBytes − pullIntoDescriptor’s bytes filled.
            total_bytes_to_copy_remaining = max_aligned_bytes - pull_into_descriptor.bytes_filled;
            // Set ready to true.
            ready = true;
        }

        // Let queue be controller.[[queue]].
        // While totalBytesToCopyRemaining > 0,
        while total_bytes_to_copy_remaining > 0 {
            // Let headOfQueue be queue[0].
            let Some(head_of_queue) = self.queue.front_mut() else {
                break;
            };

            // Let bytesToCopy be min(totalBytesToCopyRemaining, headOfQueue’s byte length).
            let bytes_to_copy =
                std::cmp::min(total_bytes_to_copy_remaining, head_of_queue.byte_length);

            // Let destStart be pullIntoDescriptor’s byte offset + pullIntoDescriptor’s bytes filled.
            let dest_start = pull_into_descriptor.byte_offset + pull_into_descriptor.bytes_filled;

            // Perform ! CopyDataBlockBytes(pullIntoDescriptor’s buffer.[[ArrayBufferData]], destStart, headOfQueue’s buffer.[[ArrayBufferData]], headOfQueue’s byte offset, bytesToCopy).
            if let Some(dest) = pull_into_descriptor.buffer.as_mut() {
                let src_start = head_of_queue.byte_offset;
                dest[dest_start..dest_start + bytes_to_copy]
                    .copy_from_slice(&head_of_queue.buffer[src_start..src_start + bytes_to_copy]);
            }

            // If headOfQueue’s byte length is bytesToCopy,
            let exhausted = head_of_queue.byte_length == bytes_to_copy;
            if !exhausted {
                // Otherwise,
                // Set headOfQueue’s byte offset to headOfQueue’s byte offset + bytesToCopy.
                head_of_queue.byte_offset += bytes_to_copy;
                // Set headOfQueue’s byte length to headOfQueue’s byte length − bytesToCopy.
                head_of_queue.byte_length -= bytes_to_copy;
            } else {
                // Remove queue[0].
                self.queue.pop_front();
            }

            // Set controller.[[queueTotalSize]] to controller.[[queueTotalSize]] − bytesToCopy.
            self.queue_total_size -= bytes_to_copy;

            // Perform ! ReadableByteStreamControllerFillHeadPullIntoDescriptor(controller, bytesToCopy, pullIntoDescriptor).
            pull_into_descriptor.bytes_filled += bytes_to_copy;

            // Set totalBytesToCopyRemaining to totalBytesToCopyRemaining − bytesToCopy.
            total_bytes_to_copy_remaining -= bytes_to_copy;
        }

        // If ready is false,
        // Assert: controller.[[queueTotalSize]] is 0.
        // Assert: pullIntoDescriptor’s bytes filled > 0.
        // Assert: pullIntoDescriptor’s bytes filled < pullIntoDescriptor’s minimum fill.
        // Return ready.
        ready
    }
}

/// The producer-side handle of a byte stream, passed to every
/// [`UnderlyingByteSource`](super::UnderlyingByteSource) callback.
pub struct ReadableByteStreamController {
    pub(crate) inner: Rc<RefCell<ReadableByteStreamControllerInner>>,
}

impl Clone for ReadableByteStreamController {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for ReadableByteStreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ReadableByteStreamController")
            .field("queue_total_size", &inner.queue_total_size)
            .field("pending_pull_intos", &inner.pending_pull_intos.len())
            .field("close_requested", &inner.close_requested)
            .finish()
    }
}

impl ReadableByteStreamController {
    pub(crate) fn set_up_readable_byte_stream_controller(
        stream: &ReadableStream<ArrayBufferView>,
        start_algorithm: StartAlgorithm<Self>,
        pull_algorithm: PullAlgorithm<Self>,
        cancel_algorithm: CancelAlgorithm,
        high_water_mark: f64,
        auto_allocate_chunk_size: Option<usize>,
    ) {
        let controller = Self {
            inner: Rc::new(RefCell::new(ReadableByteStreamControllerInner {
                // Set controller.[[stream]] to stream.
                stream: stream.downgrade(),

                // Set controller.[[pullAgain]] and controller.[[pulling]] to false.
                pull_again: false,
                pulling: false,

                // Set controller.[[byobRequest]] to null.
                byob_request: None,

                // Perform ! ResetQueue(controller).
                queue: VecDeque::new(),
                queue_total_size: 0,

                // Set controller.[[closeRequested]] and controller.[[started]] to false.
                close_requested: false,
                started: false,

                // Set controller.[[strategyHWM]] to highWaterMark.
                strategy_hwm: high_water_mark,

                // Set controller.[[pullAlgorithm]] to pullAlgorithm.
                pull_algorithm: Some(pull_algorithm),

                // Set controller.[[cancelAlgorithm]] to cancelAlgorithm.
                cancel_algorithm: Some(cancel_algorithm),

                // Set controller.[[autoAllocateChunkSize]] to autoAllocateChunkSize.
                auto_allocate_chunk_size,

                // Set controller.[[pendingPullIntos]] to a new empty list.
                pending_pull_intos: VecDeque::new(),
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
                    // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
                    controller.readable_byte_stream_controller_call_pull_if_needed();
                },
                // Upon rejection of startPromise with reason r,
                Err(r) => {
                    // Perform ! ReadableByteStreamControllerError(controller, r).
                    controller.readable_byte_stream_controller_error(r);
                },
            }
            Ok(())
        });
    }

    // readonly attribute ReadableStreamBYOBRequest? byobRequest;
    /// The outstanding request to fill a consumer buffer directly, if there is one.
    pub fn byob_request(&self) -> Option<ReadableStreamBYOBRequest> {
        // Return ! ReadableByteStreamControllerGetBYOBRequest(this).
        self.readable_byte_stream_controller_get_byob_request()
    }

    // readonly attribute unrestricted double? desiredSize;
    pub fn desired_size(&self) -> Option<f64> {
        // Return ! ReadableByteStreamControllerGetDesiredSize(this).
        self.readable_byte_stream_controller_get_desired_size()
    }

    // undefined close();
    pub fn close(&self) -> Result<()> {
        // If this.[[closeRequested]] is true, throw a TypeError exception.
        if self.inner.borrow().close_requested {
            return Err(Error::invalid_state("close() called more than once"));
        }

        // If this.[[stream]].[[state]] is not "readable", throw a TypeError exception.
        if !self.stream().is_some_and(|stream| stream.is_readable()) {
            return Err(Error::invalid_state(
                "close() called on a stream that is not readable",
            ));
        }

        // Perform ? ReadableByteStreamControllerClose(this).
        self.readable_byte_stream_controller_close()
    }

    // undefined enqueue(ArrayBufferView chunk);
    pub fn enqueue(&self, chunk: ArrayBufferView) -> Result<()> {
        // If chunk.[[ByteLength]] is 0, throw a TypeError exception.
        if chunk.byte_length() == 0 {
            return Err(Error::invalid_argument("chunk must have non-zero byteLength"));
        }

        // If chunk.[[ViewedArrayBuffer]].[[ArrayBufferByteLength]] is 0, throw a TypeError exception.
        if chunk.buffer_byte_length() == 0 {
            return Err(Error::invalid_argument(
                "chunk's buffer must have non-zero byteLength",
            ));
        }

        // If this.[[closeRequested]] is true, throw a TypeError exception.
        if self.inner.borrow().close_requested {
            return Err(Error::invalid_state("stream is closed or draining"));
        }

        // If this.[[stream]].[[state]] is not "readable", throw a TypeError exception.
        if !self.stream().is_some_and(|stream| stream.is_readable()) {
            return Err(Error::invalid_state(
                "The stream is not in the readable state and cannot be enqueued to",
            ));
        }

        // Return ? ReadableByteStreamControllerEnqueue(this, chunk).
        self.readable_byte_stream_controller_enqueue(chunk)
    }

    // undefined error(optional any e);
    pub fn error(&self, e: Option<Error>) {
        // Perform ! ReadableByteStreamControllerError(this, e).
        self.readable_byte_stream_controller_error(e.unwrap_or(Error::Unspecified));
    }

    pub(crate) fn stream(&self) -> Option<ReadableStream<ArrayBufferView>> {
        ReadableStream::from_weak(&self.inner.borrow().stream)
    }

    fn readable_byte_stream_controller_call_pull_if_needed(&self) {
        // Let shouldPull be ! ReadableByteStreamControllerShouldCallPull(controller).
        // If shouldPull is false, return.
        if !self.readable_byte_stream_controller_should_call_pull() {
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
                        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
                        controller.readable_byte_stream_controller_call_pull_if_needed();
                    }
                },
                // Upon rejection of pullPromise with reason e,
                Err(e) => {
                    // Perform ! ReadableByteStreamControllerError(controller, e).
                    controller.readable_byte_stream_controller_error(e);
                },
            }
            Ok(())
        });
    }

    fn readable_byte_stream_controller_should_call_pull(&self) -> bool {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return false;
        };

        // If stream.[[state]] is not "readable", return false.
        if !stream.is_readable() {
            return false;
        }

        {
            let inner = self.inner.borrow();
            // If controller.[[closeRequested]] is true, return false.
            if inner.close_requested {
                return false;
            }

            // If controller.[[started]] is false, return false.
            if !inner.started {
                return false;
            }
        }

        // If ! ReadableStreamHasDefaultReader(stream) is true and ! ReadableStreamGetNumReadRequests(stream) > 0, return true.
        if stream.readable_stream_has_default_reader()
            && stream.readable_stream_get_num_read_requests() > 0
        {
            return true;
        }

        // If ! ReadableStreamHasBYOBReader(stream) is true and ! ReadableStreamGetNumReadIntoRequests(stream) > 0, return true.
        if stream.readable_stream_has_byob_reader()
            && stream.readable_stream_get_num_read_into_requests() > 0
        {
            return true;
        }

        // Let desiredSize be ! ReadableByteStreamControllerGetDesiredSize(controller).
        let desired_size = self.readable_byte_stream_controller_get_desired_size();

        // Assert: desiredSize is not null.
        // If desiredSize > 0, return true.
        // Return false.
        desired_size.is_some_and(|desired_size| desired_size > 0.0)
    }

    pub(crate) fn readable_byte_stream_controller_error(&self, e: Error) {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // If stream.[[state]] is not "readable", return.
        if !stream.is_readable() {
            return;
        }

        // Perform ! ReadableByteStreamControllerClearPendingPullIntos(controller).
        self.readable_byte_stream_controller_clear_pending_pull_intos();

        {
            let mut inner = self.inner.borrow_mut();
            // Perform ! ResetQueue(controller).
            inner.reset_queue();

            // Perform ! ReadableByteStreamControllerClearAlgorithms(controller).
            inner.readable_byte_stream_controller_clear_algorithms();
        }

        // Perform ! ReadableStreamError(stream, e).
        stream.readable_stream_error(e);
    }

    fn readable_byte_stream_controller_clear_pending_pull_intos(&self) {
        // Perform ! ReadableByteStreamControllerInvalidateBYOBRequest(controller).
        self.readable_byte_stream_controller_invalidate_byob_request();

        // Set controller.[[pendingPullIntos]] to a new empty list.
        self.inner.borrow_mut().pending_pull_intos.clear();
    }

    fn readable_byte_stream_controller_invalidate_byob_request(&self) {
        // If controller.[[byobRequest]] is null, return.
        let Some(byob_request) = self.inner.borrow_mut().byob_request.take() else {
            return;
        };

        // Set controller.[[byobRequest]].[[controller]] to undefined.
        // Set controller.[[byobRequest]].[[view]] to null.
        byob_request.invalidate();

        // Set controller.[[byobRequest]] to null.
    }

    fn readable_byte_stream_controller_get_byob_request(
        &self,
    ) -> Option<ReadableStreamBYOBRequest> {
        let mut inner = self.inner.borrow_mut();
        // If controller.[[byobRequest]] is null and controller.[[pendingPullIntos]] is not empty,
        if inner.byob_request.is_none() && !inner.pending_pull_intos.is_empty() {
            // Let firstDescriptor be controller.[[pendingPullIntos]][0].
            // Let view be ! Construct(%Uint8Array%, « firstDescriptor’s buffer, firstDescriptor’s byte offset + firstDescriptor’s bytes filled, firstDescriptor’s byte length − firstDescriptor’s bytes filled »).
            // Let byobRequest be a new ReadableStreamBYOBRequest.
            // Set byobRequest.[[controller]] to controller.
            // Set byobRequest.[[view]] to view.
            // Set controller.[[byobRequest]] to byobRequest.
            inner.byob_request = Some(ReadableStreamBYOBRequest::new(Rc::downgrade(&self.inner)));
        }

        // Return controller.[[byobRequest]].
        inner.byob_request.clone()
    }

    fn readable_byte_stream_controller_get_desired_size(&self) -> Option<f64> {
        let inner = self.inner.borrow();
        // Let state be controller.[[stream]].[[state]].
        let stream = ReadableStream::from_weak(&inner.stream)?;

        match stream.state() {
            // If state is "errored", return null.
            ReadableStreamState::Errored(_) => None,
            // If state is "closed", return 0.
            ReadableStreamState::Closed => Some(0.0),
            // Return controller.[[strategyHWM]] − controller.[[queueTotalSize]].
            ReadableStreamState::Readable => {
                Some(inner.strategy_hwm - inner.queue_total_size as f64)
            },
        }
    }

    pub(crate) fn readable_byte_stream_controller_close(&self) -> Result<()> {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return Ok(());
        };

        {
            let mut inner = self.inner.borrow_mut();
            // If controller.[[closeRequested]] is true or stream.[[state]] is not "readable", return.
            if inner.close_requested || !stream.is_readable() {
                return Ok(());
            }

            // If controller.[[queueTotalSize]] > 0,
            if inner.queue_total_size > 0 {
                // Set controller.[[closeRequested]] to true.
                inner.close_requested = true;
                // Return.
                return Ok(());
            }
        }

        // If controller.[[pendingPullIntos]] is not empty,
        // Let firstPendingPullInto be controller.[[pendingPullIntos]][0].
        // If the remainder after dividing firstPendingPullInto’s bytes filled by firstPendingPullInto’s element size is not 0,
        let partial_element = self
            .inner
            .borrow()
            .pending_pull_intos
            .front()
            .is_some_and(|first| first.bytes_filled % first.element_size != 0);
        if partial_element {
            // Let e be a new TypeError exception.
            let e = Error::invalid_state("Insufficient bytes to fill elements in the given buffer");

            // Perform ! ReadableByteStreamControllerError(controller, e).
            self.readable_byte_stream_controller_error(e.clone());

            // Throw e.
            return Err(e);
        }

        // Perform ! ReadableByteStreamControllerClearAlgorithms(controller).
        self.inner
            .borrow_mut()
            .readable_byte_stream_controller_clear_algorithms();

        // Perform ! ReadableStreamClose(stream).
        stream.readable_stream_close();
        Ok(())
    }

    pub(crate) fn readable_byte_stream_controller_enqueue(
        &self,
        chunk: ArrayBufferView,
    ) -> Result<()> {
        // Let stream be controller.[[stream]].
        let Some(stream) = self.stream() else {
            return Ok(());
        };

        // If controller.[[closeRequested]] is true or stream.[[state]] is not "readable", return.
        if self.inner.borrow().close_requested || !stream.is_readable() {
            return Ok(());
        }

        // Let buffer be chunk.[[ViewedArrayBuffer]].
        // Let byteOffset be chunk.[[ByteOffset]].
        // Let byteLength be chunk.[[ByteLength]].
        // Let transferredBuffer be ? TransferArrayBuffer(buffer).
        let (transferred_buffer, byte_offset, byte_length, _) = chunk.into_parts();

        // If controller.[[pendingPullIntos]] is not empty,
        // Let firstPendingPullInto be controller.[[pendingPullIntos]][0].
        let first_reader_type = {
            let inner = self.inner.borrow();
            match inner.pending_pull_intos.front() {
                None => None,
                // If ! IsDetachedBuffer(firstPendingPullInto’s buffer) is true, throw a TypeError exception.
                Some(first) if first.buffer.is_none() => {
                    return Err(Error::invalid_state(
                        "The BYOB request's buffer has been detached and so cannot be filled with an enqueued chunk",
                    ))
                },
                Some(first) => Some(first.reader_type),
            }
        };

        if let Some(first_reader_type) = first_reader_type {
            // Perform ! ReadableByteStreamControllerInvalidateBYOBRequest(controller).
            self.readable_byte_stream_controller_invalidate_byob_request();

            // Set firstPendingPullInto’s buffer to ! TransferArrayBuffer(firstPendingPullInto’s buffer).
            // If firstPendingPullInto’s reader type is "none", perform ? ReadableByteStreamControllerEnqueueDetachedPullIntoToQueue(controller, firstPendingPullInto).
            if first_reader_type == PullIntoDescriptorReaderType::None {
                self.inner
                    .borrow_mut()
                    .readable_byte_stream_enqueue_detached_pull_into_to_queue();
            }
        }

        // If ! ReadableStreamHasDefaultReader(stream) is true,
        if stream.readable_stream_has_default_reader() {
            // Perform ! ReadableByteStreamControllerProcessReadRequestsUsingQueue(controller).
            self.readable_byte_stream_controller_process_read_requests_using_queue(&stream);

            // If ! ReadableStreamGetNumReadRequests(stream) is 0,
            if stream.readable_stream_get_num_read_requests() == 0 {
                // Assert: controller.[[pendingPullIntos]] is empty.
                // Perform ! ReadableByteStreamControllerEnqueueChunkToQueue(controller, transferredBuffer, byteOffset, byteLength).
                self.inner
                    .borrow_mut()
                    .readable_byte_stream_controller_enqueue_chunk_to_queue(
                        transferred_buffer,
                        byte_offset,
                        byte_length,
                    );
            } else {
                // Otherwise,
                // Assert: controller.[[queue]] is empty.
                // If controller.[[pendingPullIntos]] is not empty,
                // Assert: controller.[[pendingPullIntos]][0]’s reader type is "default".
                // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
                self.inner.borrow_mut().pending_pull_intos.pop_front();

                // Let transferredView be ! Construct(%Uint8Array%, « transferredBuffer, byteOffset, byteLength »).
                let transferred_view = ArrayBufferView::from_parts(
                    ElementType::Uint8,
                    transferred_buffer,
                    byte_offset,
                    byte_length,
                );

                // Perform ! ReadableStreamFulfillReadRequest(stream, transferredView, false).
                stream.readable_stream_fulfill_read_request(transferred_view, false);
            }
        } else if stream.readable_stream_has_byob_reader() {
            // Otherwise, if ! ReadableStreamHasBYOBReader(stream) is true,
            // Perform ! ReadableByteStreamControllerEnqueueChunkToQueue(controller, transferredBuffer, byteOffset, byteLength).
            self.inner
                .borrow_mut()
                .readable_byte_stream_controller_enqueue_chunk_to_queue(
                    transferred_buffer,
                    byte_offset,
                    byte_length,
                );

            // Perform ! ReadableByteStreamControllerProcessPullIntoDescriptorsUsingQueue(controller).
            self.readable_byte_stream_controller_process_pull_into_descriptors_using_queue(&stream);
        } else {
            // Otherwise,
            // Assert: ! IsReadableStreamLocked(stream) is false.
            // Perform ! ReadableByteStreamControllerEnqueueChunkToQueue(controller, transferredBuffer, byteOffset, byteLength).
            self.inner
                .borrow_mut()
                .readable_byte_stream_controller_enqueue_chunk_to_queue(
                    transferred_buffer,
                    byte_offset,
                    byte_length,
                );
        }

        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
        self.readable_byte_stream_controller_call_pull_if_needed();
        Ok(())
    }

    fn readable_byte_stream_controller_process_read_requests_using_queue(
        &self,
        stream: &ReadableStream<ArrayBufferView>,
    ) {
        // Let reader be controller.[[stream]].[[reader]].
        // Assert: reader implements ReadableStreamDefaultReader.
        let Some(ReadableStreamReader::Default(reader)) = stream.reader() else {
            return;
        };

        // While reader.[[readRequests]] is not empty,
        while reader.num_read_requests() > 0 {
            // If controller.[[queueTotalSize]] is 0, return.
            if self.inner.borrow().queue_total_size == 0 {
                return;
            }

            // Let readRequest be reader.[[readRequests]][0].
            // Remove readRequest from reader.[[readRequests]].
            let Some(read_request) = reader.pop_read_request() else {
                return;
            };

            // Perform ! ReadableByteStreamControllerFillReadRequestFromQueue(controller, readRequest).
            self.readable_byte_stream_controller_fill_read_request_from_queue(read_request);
        }
    }

    fn readable_byte_stream_controller_fill_read_request_from_queue(
        &self,
        read_request: BoxedReadRequest<ArrayBufferView>,
    ) {
        let entry = {
            let mut inner = self.inner.borrow_mut();
            // Assert: controller.[[queueTotalSize]] > 0.
            // Let entry be controller.[[queue]][0].
            // Remove entry from controller.[[queue]].
            let Some(entry) = inner.queue.pop_front() else {
                return;
            };

            // Set controller.[[queueTotalSize]] to controller.[[queueTotalSize]] − entry’s byte length.
            inner.queue_total_size -= entry.byte_length;
            entry
        };

        // Perform ! ReadableByteStreamControllerHandleQueueDrain(controller).
        self.readable_byte_stream_controller_handle_queue_drain();

        // Let view be ! Construct(%Uint8Array%, « entry’s buffer, entry’s byte offset, entry’s byte length »).
        let view = ArrayBufferView::from_parts(
            ElementType::Uint8,
            entry.buffer,
            entry.byte_offset,
            entry.byte_length,
        );

        // Perform readRequest’s chunk steps, given view.
        read_request.chunk_steps(view)
    }

    fn readable_byte_stream_controller_process_pull_into_descriptors_using_queue(
        &self,
        stream: &ReadableStream<ArrayBufferView>,
    ) {
        // Assert: controller.[[closeRequested]] is false.
        // While controller.[[pendingPullIntos]] is not empty,
        loop {
            let pull_into_descriptor = {
                let mut inner = self.inner.borrow_mut();
                // If controller.[[queueTotalSize]] is 0, return.
                if inner.queue_total_size == 0 {
                    return;
                }

                // Let pullIntoDescriptor be controller.[[pendingPullIntos]][0].
                let Some(mut pull_into_descriptor) = inner.pending_pull_intos.pop_front() else {
                    return;
                };

                // If ! ReadableByteStreamControllerFillPullIntoDescriptorFromQueue(controller, pullIntoDescriptor) is true,
                if !inner.readable_byte_stream_controller_fill_pull_into_descriptor_from_queue(
                    &mut pull_into_descriptor,
                ) {
                    inner.pending_pull_intos.push_front(pull_into_descriptor);
                    return;
                }

                // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
                pull_into_descriptor
            };

            // Perform ! ReadableByteStreamControllerCommitPullIntoDescriptor(controller.[[stream]], pullIntoDescriptor).
            Self::readable_byte_stream_controller_commit_pull_into_descriptor(
                stream,
                pull_into_descriptor,
            );
        }
    }

    fn readable_byte_stream_controller_commit_pull_into_descriptor(
        stream: &ReadableStream<ArrayBufferView>,
        pull_into_descriptor: PullIntoDescriptor,
    ) {
        // Assert: stream.[[state]] is not "errored".
        // Assert: pullIntoDescriptor.reader type is not "none".
        // Let done be false.
        // If stream.[[state]] is "closed",
        // Set done to true.
        let done = matches!(stream.state(), ReadableStreamState::Closed);

        let reader_type = pull_into_descriptor.reader_type;

        // Let filledView be ! ReadableByteStreamControllerConvertPullIntoDescriptor(pullIntoDescriptor).
        let filled_view = match pull_into_descriptor
            .readable_byte_stream_controller_convert_pull_into_descriptor()
        {
            Ok(filled_view) => filled_view,
            Err(e) => {
                if let Some(controller) = stream
                    .controller()
                    .and_then(|controller| controller.as_byte_controller())
                {
                    controller.readable_byte_stream_controller_error(e);
                }
                return;
            },
        };

        if reader_type == PullIntoDescriptorReaderType::Default {
            // If pullIntoDescriptor’s reader type is "default",
            // Perform ! ReadableStreamFulfillReadRequest(stream, filledView, done).
            stream.readable_stream_fulfill_read_request(filled_view, done)
        } else {
            // Otherwise,
            // Perform ! ReadableStreamFulfillReadIntoRequest(stream, filledView, done).
            stream.readable_stream_fulfill_read_into_request(filled_view, done)
        }
    }

    fn readable_byte_stream_controller_handle_queue_drain(&self) {
        // Assert: controller.[[stream]].[[state]] is "readable".
        let drained = {
            let inner = self.inner.borrow();
            inner.queue_total_size == 0 && inner.close_requested
        };

        // If controller.[[queueTotalSize]] is 0 and controller.[[closeRequested]] is true,
        if drained {
            // Perform ! ReadableByteStreamControllerClearAlgorithms(controller).
            self.inner
                .borrow_mut()
                .readable_byte_stream_controller_clear_algorithms();
            // Perform ! ReadableStreamClose(controller.[[stream]]).
            if let Some(stream) = self.stream() {
                stream.readable_stream_close();
            }
        } else {
            // Otherwise,
            // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
            self.readable_byte_stream_controller_call_pull_if_needed();
        }
    }

    pub(crate) fn readable_byte_stream_controller_pull_into(
        &self,
        stream: &ReadableStream<ArrayBufferView>,
        view: ArrayBufferView,
        min: usize,
        read_into_request: BoxedReadIntoRequest,
    ) {
        // Let stream be controller.[[stream]].

        // Set elementSize to the element size specified in the typed array constructors table for view.[[TypedArrayName]].
        // Set ctor to the constructor specified in the typed array constructors table for view.[[TypedArrayName]].
        let (element_size, element_type) = (view.element_size(), view.element_type());

        // Let minimumFill be min × elementSize.
        let minimum_fill = min * element_size;

        // Let byteOffset be view.[[ByteOffset]].
        // Let byteLength be view.[[ByteLength]].
        // Let bufferResult be TransferArrayBuffer(view.[[ViewedArrayBuffer]]).
        let (buffer, byte_offset, byte_length, _) = view.into_parts();

        // Let pullIntoDescriptor be a new pull-into descriptor with...
        let mut pull_into_descriptor = PullIntoDescriptor {
            buffer_byte_length: buffer.len(),
            buffer: Some(buffer),
            byte_offset,
            byte_length,
            bytes_filled: 0,
            minimum_fill,
            element_size,
            element_type,
            reader_type: PullIntoDescriptorReaderType::Byob,
        };

        // If controller.[[pendingPullIntos]] is not empty,
        if !self.inner.borrow().pending_pull_intos.is_empty() {
            // Append pullIntoDescriptor to controller.[[pendingPullIntos]].
            self.inner
                .borrow_mut()
                .pending_pull_intos
                .push_back(pull_into_descriptor);

            // Perform ! ReadableStreamAddReadIntoRequest(stream, readIntoRequest).
            stream.readable_stream_add_read_into_request(read_into_request);

            // Return.
            return;
        }

        // If stream.[[state]] is "closed",
        if matches!(stream.state(), ReadableStreamState::Closed) {
            // Let emptyView be ! Construct(ctor, « pullIntoDescriptor’s buffer, pullIntoDescriptor’s byte offset, 0 »).
            let empty_view = ArrayBufferView::from_parts(
                element_type,
                pull_into_descriptor.buffer.unwrap_or_default(),
                byte_offset,
                0,
            );

            // Perform readIntoRequest’s close steps, given emptyView.
            return read_into_request.close_steps(Some(empty_view));
        }

        // If controller.[[queueTotalSize]] > 0,
        if self.inner.borrow().queue_total_size > 0 {
            let ready = self
                .inner
                .borrow_mut()
                .readable_byte_stream_controller_fill_pull_into_descriptor_from_queue(
                    &mut pull_into_descriptor,
                );

            // If ! ReadableByteStreamControllerFillPullIntoDescriptorFromQueue(controller, pullIntoDescriptor) is true,
            if ready {
                // Let filledView be ! ReadableByteStreamControllerConvertPullIntoDescriptor(pullIntoDescriptor).
                let filled_view = pull_into_descriptor
                    .readable_byte_stream_controller_convert_pull_into_descriptor();

                // Perform ! ReadableByteStreamControllerHandleQueueDrain(controller).
                self.readable_byte_stream_controller_handle_queue_drain();

                // Perform readIntoRequest’s chunk steps, given filledView.
                return match filled_view {
                    Ok(filled_view) => read_into_request.chunk_steps(filled_view),
                    Err(e) => read_into_request.error_steps(e),
                };
            }

            // If controller.[[closeRequested]] is true,
            if self.inner.borrow().close_requested {
                // Let e be a new TypeError exception.
                let e = Error::invalid_state(
                    "Insufficient bytes to fill elements in the given buffer",
                );

                // Perform ! ReadableByteStreamControllerError(controller, e).
                self.readable_byte_stream_controller_error(e.clone());

                // Perform readIntoRequest’s error steps, given e.
                return read_into_request.error_steps(e);
            }
        }

        // Append pullIntoDescriptor to controller.[[pendingPullIntos]].
        self.inner
            .borrow_mut()
            .pending_pull_intos
            .push_back(pull_into_descriptor);

        // Perform ! ReadableStreamAddReadIntoRequest(stream, readIntoRequest).
        stream.readable_stream_add_read_into_request(read_into_request);

        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
        self.readable_byte_stream_controller_call_pull_if_needed();
    }

    pub(crate) fn readable_byte_stream_controller_respond(
        &self,
        bytes_written: usize,
    ) -> Result<()> {
        let Some(stream) = self.stream() else {
            return Err(Error::invalid_state("The stream is gone"));
        };

        // Let state be controller.[[stream]].[[state]].
        let closed = matches!(stream.state(), ReadableStreamState::Closed);

        {
            let inner = self.inner.borrow();
            // Assert: controller.[[pendingPullIntos]] is not empty.
            // Let firstDescriptor be controller.[[pendingPullIntos]][0].
            let Some(first_descriptor) = inner.pending_pull_intos.front() else {
                return Err(Error::invalid_state("There is no pending read to respond to"));
            };

            if closed {
                // If state is "closed",
                // If bytesWritten is not 0, throw a TypeError exception.
                if bytes_written != 0 {
                    return Err(Error::invalid_argument(
                        "bytesWritten must be 0 when calling respond() on a closed stream",
                    ));
                }
            } else {
                // Otherwise,
                // Assert: state is "readable".
                // If bytesWritten is 0, throw a TypeError exception.
                if bytes_written == 0 {
                    return Err(Error::invalid_argument(
                        "bytesWritten must be greater than 0 when calling respond() on a readable stream",
                    ));
                }

                // If firstDescriptor’s bytes filled + bytesWritten > firstDescriptor’s byte length, throw a RangeError exception.
                if first_descriptor.bytes_filled + bytes_written > first_descriptor.byte_length {
                    return Err(Error::out_of_range("bytesWritten out of range"));
                }
            }
        }

        // Set firstDescriptor’s buffer to ! TransferArrayBuffer(firstDescriptor’s buffer).
        // Perform ? ReadableByteStreamControllerRespondInternal(controller, bytesWritten).
        self.readable_byte_stream_controller_respond_internal(&stream, closed, bytes_written);
        Ok(())
    }

    pub(crate) fn readable_byte_stream_controller_respond_with_new_view(
        &self,
        view: ArrayBufferView,
    ) -> Result<()> {
        let Some(stream) = self.stream() else {
            return Err(Error::invalid_state("The stream is gone"));
        };

        // Let state be controller.[[stream]].[[state]].
        let closed = matches!(stream.state(), ReadableStreamState::Closed);

        let (buffer, byte_offset, byte_length, _) = view.into_parts();

        {
            let mut inner = self.inner.borrow_mut();
            // Assert: controller.[[pendingPullIntos]] is not empty.
            // Let firstDescriptor be controller.[[pendingPullIntos]][0].
            let Some(first_descriptor) = inner.pending_pull_intos.front_mut() else {
                return Err(Error::invalid_state("There is no pending read to respond to"));
            };

            if closed {
                // If state is "closed",
                // If view.[[ByteLength]] is not 0, throw a TypeError exception.
                if byte_length != 0 {
                    return Err(Error::invalid_argument(
                        "The view's length must be 0 when calling respondWithNewView() on a closed stream",
                    ));
                }
            } else {
                // Otherwise,
                // Assert: state is "readable".
                // If view.[[ByteLength]] is 0, throw a TypeError exception.
                if byte_length == 0 {
                    return Err(Error::invalid_argument(
                        "The view's length must be greater than 0 when calling respondWithNewView() on a readable stream",
                    ));
                }
            }

            // If firstDescriptor’s byte offset + firstDescriptor’ bytes filled is not view.[[ByteOffset]], throw a RangeError exception.
            if first_descriptor.byte_offset + first_descriptor.bytes_filled != byte_offset {
                return Err(Error::out_of_range(
                    "The region specified by view does not match byobRequest",
                ));
            }

            // If firstDescriptor’s buffer byte length is not view.[[ViewedArrayBuffer]].[[ByteLength]], throw a RangeError exception.
            if first_descriptor.buffer_byte_length != buffer.len() {
                return Err(Error::out_of_range(
                    "The buffer of view has different capacity than byobRequest",
                ));
            }

            // If firstDescriptor’s bytes filled + view.[[ByteLength]] > firstDescriptor’s byte length, throw a RangeError exception.
            if first_descriptor.bytes_filled + byte_length > first_descriptor.byte_length {
                return Err(Error::out_of_range(
                    "The region specified by view is larger than byobRequest",
                ));
            }

            // Let viewByteLength be view.[[ByteLength]].
            // Set firstDescriptor’s buffer to ? TransferArrayBuffer(view.[[ViewedArrayBuffer]]).
            first_descriptor.buffer = Some(buffer);
        }

        // Perform ? ReadableByteStreamControllerRespondInternal(controller, viewByteLength).
        self.readable_byte_stream_controller_respond_internal(&stream, closed, byte_length);
        Ok(())
    }

    fn readable_byte_stream_controller_respond_internal(
        &self,
        stream: &ReadableStream<ArrayBufferView>,
        closed: bool,
        bytes_written: usize,
    ) {
        // Let firstDescriptor be controller.[[pendingPullIntos]][0].
        // Assert: ! CanTransferArrayBuffer(firstDescriptor’s buffer) is true.
        // Perform ! ReadableByteStreamControllerInvalidateBYOBRequest(controller).
        self.readable_byte_stream_controller_invalidate_byob_request();

        if closed {
            // If state is "closed",
            // Assert: bytesWritten is 0.
            // Perform ! ReadableByteStreamControllerRespondInClosedState(controller, firstDescriptor).
            self.readable_byte_stream_controller_respond_in_closed_state(stream);
        } else {
            // Otherwise,
            // Assert: state is "readable".
            // Assert: bytesWritten > 0.
            // Perform ? ReadableByteStreamControllerRespondInReadableState(controller, bytesWritten, firstDescriptor).
            self.readable_byte_stream_controller_respond_in_readable_state(stream, bytes_written);
        }

        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(controller).
        self.readable_byte_stream_controller_call_pull_if_needed();
    }

    fn readable_byte_stream_controller_respond_in_closed_state(
        &self,
        stream: &ReadableStream<ArrayBufferView>,
    ) {
        {
            let mut inner = self.inner.borrow_mut();
            // Assert: the remainder after dividing firstDescriptor’s bytes filled by firstDescriptor’s element size is 0.
            // If firstDescriptor’s reader type is "none", perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
            if inner
                .pending_pull_intos
                .front()
                .is_some_and(|first| first.reader_type == PullIntoDescriptorReaderType::None)
            {
                inner.pending_pull_intos.pop_front();
            }
        }

        // If ! ReadableStreamHasBYOBReader(stream) is true,
        if stream.readable_stream_has_byob_reader() {
            // While ! ReadableStreamGetNumReadIntoRequests(stream) > 0,
            while stream.readable_stream_get_num_read_into_requests() > 0 {
                // Let pullIntoDescriptor be ! ReadableByteStreamControllerShiftPendingPullInto(controller).
                let Some(pull_into_descriptor) =
                    self.inner.borrow_mut().pending_pull_intos.pop_front()
                else {
                    break;
                };

                // Perform ! ReadableByteStreamControllerCommitPullIntoDescriptor(stream, pullIntoDescriptor).
                Self::readable_byte_stream_controller_commit_pull_into_descriptor(
                    stream,
                    pull_into_descriptor,
                );
            }
        }
    }

    fn readable_byte_stream_controller_respond_in_readable_state(
        &self,
        stream: &ReadableStream<ArrayBufferView>,
        bytes_written: usize,
    ) {
        let pull_into_descriptor = {
            let mut inner = self.inner.borrow_mut();
            let Some(pull_into_descriptor) = inner.pending_pull_intos.front_mut() else {
                return;
            };

            // Assert: pullIntoDescriptor’s bytes filled + bytesWritten ≤ pullIntoDescriptor’s byte length.
            // Perform ! ReadableByteStreamControllerFillHeadPullIntoDescriptor(controller, bytesWritten, pullIntoDescriptor).
            pull_into_descriptor.bytes_filled += bytes_written;

            // If pullIntoDescriptor’s reader type is "none",
            if pull_into_descriptor.reader_type == PullIntoDescriptorReaderType::None {
                // Perform ? ReadableByteStreamControllerEnqueueDetachedPullIntoToQueue(controller, pullIntoDescriptor).
                inner.readable_byte_stream_enqueue_detached_pull_into_to_queue();
                drop(inner);

                // Perform ! ReadableByteStreamControllerProcessPullIntoDescriptorsUsingQueue(controller).
                self.readable_byte_stream_controller_process_pull_into_descriptors_using_queue(
                    stream,
                );

                // Return.
                return;
            }

            // If pullIntoDescriptor’s bytes filled < pullIntoDescriptor’s minimum fill, return.
            if pull_into_descriptor.bytes_filled < pull_into_descriptor.minimum_fill {
                return;
            }

            // Perform ! ReadableByteStreamControllerShiftPendingPullInto(controller).
            let Some(mut pull_into_descriptor) = inner.pending_pull_intos.pop_front() else {
                return;
            };

            // Let remainderSize be the remainder after dividing pullIntoDescriptor’s bytes filled by pullIntoDescriptor’s element size.
            let remainder_size =
                pull_into_descriptor.bytes_filled % pull_into_descriptor.element_size;

            // If remainderSize > 0,
            if remainder_size > 0 {
                // Let end be pullIntoDescriptor’s byte offset + pullIntoDescriptor’s bytes filled.
                let end = pull_into_descriptor.byte_offset + pull_into_descriptor.bytes_filled;

                // Perform ? ReadableByteStreamControllerEnqueueClonedChunkToQueue(controller, pullIntoDescriptor’s buffer, end − remainderSize, remainderSize).
                if let Some(buffer) = &pull_into_descriptor.buffer {
                    inner.readable_byte_stream_controller_enqueue_cloned_chunk_to_queue(
                        buffer,
                        end - remainder_size,
                        remainder_size,
                    );
                }
            }

            // Set pullIntoDescriptor’s bytes filled to pullIntoDescriptor’s bytes filled − remainderSize.
            pull_into_descriptor.bytes_filled -= remainder_size;
            pull_into_descriptor
        };

        // Perform ! ReadableByteStreamControllerCommitPullIntoDescriptor(controller.[[stream]], pullIntoDescriptor).
        Self::readable_byte_stream_controller_commit_pull_into_descriptor(
            stream,
            pull_into_descriptor,
        );

        // Perform ! ReadableByteStreamControllerProcessPullIntoDescriptorsUsingQueue(controller).
        self.readable_byte_stream_controller_process_pull_into_descriptors_using_queue(stream);
    }

    /// Runs `f` over the unfilled region of the head pull-into buffer.
    pub(crate) fn with_head_view<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut inner = self.inner.borrow_mut();
        let first = inner
            .pending_pull_intos
            .front_mut()
            .ok_or_else(|| Error::invalid_state("There is no pending read to fill"))?;
        let start = first.byte_offset + first.bytes_filled;
        let end = first.byte_offset + first.byte_length;
        let buffer = first.buffer.as_mut().ok_or_else(|| {
            Error::invalid_state("The BYOB request's buffer has been detached")
        })?;
        Ok(f(&mut buffer[start..end]))
    }

    /// Detaches the head pull-into buffer and hands it out as a view of the unfilled region.
    pub(crate) fn take_head_view(&self) -> Result<ArrayBufferView> {
        let mut inner = self.inner.borrow_mut();
        let first = inner
            .pending_pull_intos
            .front_mut()
            .ok_or_else(|| Error::invalid_state("There is no pending read to fill"))?;
        let buffer = first.buffer.take().ok_or_else(|| {
            Error::invalid_state("The BYOB request's buffer has been detached")
        })?;
        Ok(ArrayBufferView::from_parts(
            ElementType::Uint8,
            buffer,
            first.byte_offset + first.bytes_filled,
            first.byte_length - first.bytes_filled,
        ))
    }

    /// Length of the unfilled head region, or `None` if its buffer has been taken.
    pub(crate) fn head_view_byte_length(&self) -> Option<usize> {
        let inner = self.inner.borrow();
        let first = inner.pending_pull_intos.front()?;
        first
            .buffer
            .as_ref()
            .map(|_| first.byte_length - first.bytes_filled)
    }
}

impl ReadableStreamController<ArrayBufferView> for ReadableByteStreamController {
    fn pull_steps(&self, read_request: BoxedReadRequest<ArrayBufferView>) {
        // Let stream be this.[[stream]].
        let Some(stream) = self.stream() else {
            return;
        };

        // Assert: ! ReadableStreamHasDefaultReader(stream) is true.
        // If this.[[queueTotalSize]] > 0,
        if self.inner.borrow().queue_total_size > 0 {
            // Assert: ! ReadableStreamGetNumReadRequests(stream) is 0.
            // Perform ! ReadableByteStreamControllerFillReadRequestFromQueue(this, readRequest).
            self.readable_byte_stream_controller_fill_read_request_from_queue(read_request);
            // Return.
            return;
        }

        {
            let mut inner = self.inner.borrow_mut();
            // Let autoAllocateChunkSize be this.[[autoAllocateChunkSize]].
            // If autoAllocateChunkSize is not undefined,
            if let Some(auto_allocate_chunk_size) = inner.auto_allocate_chunk_size {
                // Let buffer be Construct(%ArrayBuffer%, « autoAllocateChunkSize »).
                let buffer = vec![0; auto_allocate_chunk_size];

                // Let pullIntoDescriptor be a new pull-into descriptor with...
                // Append pullIntoDescriptor to this.[[pendingPullIntos]].
                inner.pending_pull_intos.push_back(PullIntoDescriptor {
                    buffer: Some(buffer),
                    buffer_byte_length: auto_allocate_chunk_size,
                    byte_offset: 0,
                    byte_length: auto_allocate_chunk_size,
                    bytes_filled: 0,
                    minimum_fill: 1,
                    element_size: 1,
                    element_type: ElementType::Uint8,
                    reader_type: PullIntoDescriptorReaderType::Default,
                });
            }
        }

        // Perform ! ReadableStreamAddReadRequest(stream, readRequest).
        stream.readable_stream_add_read_request(read_request);

        // Perform ! ReadableByteStreamControllerCallPullIfNeeded(this).
        self.readable_byte_stream_controller_call_pull_if_needed();
    }

    fn cancel_steps(&self, reason: Error) -> Promise<()> {
        // Perform ! ReadableByteStreamControllerClearPendingPullIntos(this).
        self.readable_byte_stream_controller_clear_pending_pull_intos();

        let cancel_algorithm = {
            let mut inner = self.inner.borrow_mut();
            // Perform ! ResetQueue(this).
            inner.reset_queue();
            inner.cancel_algorithm.take()
        };

        // Let result be the result of performing this.[[cancelAlgorithm]], passing in reason.
        let result = cancel_algorithm
            .map(|cancel_algorithm| cancel_algorithm.call(reason))
            .unwrap_or_else(|| Promise::resolved(()));

        // Perform ! ReadableByteStreamControllerClearAlgorithms(this).
        self.inner
            .borrow_mut()
            .readable_byte_stream_controller_clear_algorithms();

        // Return result.
        result
    }

    fn release_steps(&self) {
        let mut inner = self.inner.borrow_mut();
        // If this.[[pendingPullIntos]] is not empty,
        if let Some(mut first_pending_pull_into) = inner.pending_pull_intos.pop_front() {
            // Let firstPendingPullInto be this.[[pendingPullIntos]][0].
            // Set firstPendingPullInto’s reader type to "none".
            first_pending_pull_into.reader_type = PullIntoDescriptorReaderType::None;

            // Set this.[[pendingPullIntos]] to the list « firstPendingPullInto ».
            inner.pending_pull_intos.clear();
            inner.pending_pull_intos.push_back(first_pending_pull_into);
        }
    }

    fn is_borrowed(&self) -> bool {
        self.inner.try_borrow_mut().is_err()
    }

    fn as_byte_controller(&self) -> Option<ReadableByteStreamController> {
        Some(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(buffer: Option<Vec<u8>>) -> PullIntoDescriptor {
        PullIntoDescriptor {
            buffer,
            buffer_byte_length: 4,
            byte_offset: 1,
            byte_length: 3,
            bytes_filled: 2,
            minimum_fill: 1,
            element_size: 1,
            element_type: ElementType::Uint8,
            reader_type: PullIntoDescriptorReaderType::Byob,
        }
    }

    #[test]
    fn convert_hands_back_the_filled_window() {
        let view = descriptor(Some(vec![0, 7, 8, 0]))
            .readable_byte_stream_controller_convert_pull_into_descriptor()
            .unwrap();
        assert_eq!(view.as_bytes(), &[7, 8]);
        assert_eq!(view.buffer_byte_length(), 4);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "converting a detached pull-into descriptor")]
    fn convert_refuses_a_detached_buffer() {
        let _ = descriptor(None).readable_byte_stream_controller_convert_pull_into_descriptor();
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn convert_refuses_a_detached_buffer() {
        assert!(matches!(
            descriptor(None).readable_byte_stream_controller_convert_pull_into_descriptor(),
            Err(Error::InvalidState(_))
        ));
    }
}

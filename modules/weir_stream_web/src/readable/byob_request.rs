use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use weir_utils::{Error, Result};

use super::{byte_controller::ReadableByteStreamControllerInner, ReadableByteStreamController};
use crate::buffer::ArrayBufferView;

/// A pending read that the underlying byte source may fill in place.
///
/// The request is tied to the oldest pending read. It becomes invalid once it has been responded
/// to, or once the controller moves on without it (an enqueue, an error or a cancel).
pub struct ReadableStreamBYOBRequest {
    controller: Rc<RefCell<Option<Weak<RefCell<ReadableByteStreamControllerInner>>>>>,
}

impl Clone for ReadableStreamBYOBRequest {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
        }
    }
}

impl fmt::Debug for ReadableStreamBYOBRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableStreamBYOBRequest")
            .field("view_byte_length", &self.view_byte_length())
            .finish()
    }
}

impl ReadableStreamBYOBRequest {
    pub(crate) fn new(controller: Weak<RefCell<ReadableByteStreamControllerInner>>) -> Self {
        Self {
            controller: Rc::new(RefCell::new(Some(controller))),
        }
    }

    pub(crate) fn invalidate(&self) {
        *self.controller.borrow_mut() = None;
    }

    fn controller(&self) -> Option<ReadableByteStreamController> {
        self.controller
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| ReadableByteStreamController { inner })
    }

    fn controller_or_invalidated(&self) -> Result<ReadableByteStreamController> {
        self.controller()
            .ok_or_else(|| Error::invalid_state("This BYOB request has been invalidated"))
    }

    // readonly attribute ArrayBufferView? view;
    /// Length of the region still to be filled, or `None` once the request is invalid or its
    /// buffer has been taken with [`take_view`](Self::take_view).
    pub fn view_byte_length(&self) -> Option<usize> {
        self.controller()?.head_view_byte_length()
    }

    /// Gives `f` the unfilled region of the consumer's buffer. Report what was written with
    /// [`respond`](Self::respond).
    pub fn with_view<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.controller_or_invalidated()?.with_head_view(f)
    }

    /// Takes the consumer's buffer out of the request, as a view of its unfilled region. It must be
    /// handed back through [`respond_with_new_view`](Self::respond_with_new_view).
    pub fn take_view(&self) -> Result<ArrayBufferView> {
        self.controller_or_invalidated()?.take_head_view()
    }

    // undefined respond([EnforceRange] unsigned long long bytesWritten);
    pub fn respond(&self, bytes_written: usize) -> Result<()> {
        // If this.[[controller]] is undefined, throw a TypeError exception.
        let controller = self.controller_or_invalidated()?;

        // If ! IsDetachedBuffer(this.[[view]].[[ArrayBuffer]]) is true, throw a TypeError exception.
        if controller.head_view_byte_length().is_none() {
            return Err(Error::invalid_state(
                "The BYOB request's buffer has been detached and so cannot be used as a response",
            ));
        }

        // Assert: this.[[view]].[[ByteLength]] > 0.
        // Assert: this.[[view]].[[ViewedArrayBuffer]].[[ByteLength]] > 0.
        // Perform ? ReadableByteStreamControllerRespond(this.[[controller]], bytesWritten).
        controller.readable_byte_stream_controller_respond(bytes_written)
    }

    // undefined respondWithNewView(ArrayBufferView view);
    pub fn respond_with_new_view(&self, view: ArrayBufferView) -> Result<()> {
        // If this.[[controller]] is undefined, throw a TypeError exception.
        let controller = self.controller_or_invalidated()?;

        // If ! IsDetachedBuffer(view.[[ViewedArrayBuffer]]) is true, throw a TypeError exception.
        // Return ? ReadableByteStreamControllerRespondWithNewView(this.[[controller]], view).
        controller.readable_byte_stream_controller_respond_with_new_view(view)
    }
}

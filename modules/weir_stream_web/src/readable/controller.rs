use weir_utils::{Error, Promise};

use super::{BoxedReadRequest, ReadableByteStreamController};

// typedef (ReadableStreamDefaultController or ReadableByteStreamController) ReadableStreamController;
/// The internal methods a stream calls on whichever controller it was set up with.
pub(crate) trait ReadableStreamController<T: 'static> {
    // [[PullSteps]](readRequest)
    fn pull_steps(&self, read_request: BoxedReadRequest<T>);

    // [[CancelSteps]](reason)
    fn cancel_steps(&self, reason: Error) -> Promise<()>;

    // [[ReleaseSteps]]()
    fn release_steps(&self);

    /// True while the controller is mid-operation, so its release steps have to wait.
    fn is_borrowed(&self) -> bool {
        false
    }

    /// The byte controller behind this stream, if it is a byte stream.
    fn as_byte_controller(&self) -> Option<ReadableByteStreamController> {
        None
    }
}

use async_trait::async_trait;
use weir_utils::{Error, Result};

use crate::readable::{ReadableByteStreamController, ReadableStreamDefaultController};

/// The producer behind a value [`ReadableStream`](crate::ReadableStream).
///
/// Every method is optional. `start` runs once at construction; `pull` runs whenever the stream
/// wants more data, and never again until the previous pull has finished; `cancel` runs at most
/// once when the consumer gives up on the stream.
#[async_trait(?Send)]
pub trait UnderlyingSource<T: 'static>: 'static {
    // callback UnderlyingSourceStartCallback = any (ReadableStreamController controller);
    async fn start(&self, _controller: ReadableStreamDefaultController<T>) -> Result<()> {
        Ok(())
    }

    // callback UnderlyingSourcePullCallback = Promise<undefined> (ReadableStreamController controller);
    async fn pull(&self, _controller: ReadableStreamDefaultController<T>) -> Result<()> {
        Ok(())
    }

    // callback UnderlyingSourceCancelCallback = Promise<undefined> (optional any reason);
    async fn cancel(&self, _reason: Error) -> Result<()> {
        Ok(())
    }
}

/// The producer behind a byte stream. It may answer reads by enqueueing chunks or by writing
/// straight into the consumer's buffer through [`ReadableByteStreamController::byob_request`].
#[async_trait(?Send)]
pub trait UnderlyingByteSource: 'static {
    async fn start(&self, _controller: ReadableByteStreamController) -> Result<()> {
        Ok(())
    }

    async fn pull(&self, _controller: ReadableByteStreamController) -> Result<()> {
        Ok(())
    }

    async fn cancel(&self, _reason: Error) -> Result<()> {
        Ok(())
    }

    // [EnforceRange] unsigned long long autoAllocateChunkSize;
    /// When set, default-reader reads on an empty queue allocate a buffer of this size and expose
    /// it through the BYOB request, so the source can always fill a buffer in place.
    fn auto_allocate_chunk_size(&self) -> Option<usize> {
        None
    }
}

/// A source with nothing to say; the stream only ever gets data enqueued from outside.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptySource;

impl<T: 'static> UnderlyingSource<T> for EmptySource {}

impl UnderlyingByteSource for EmptySource {}

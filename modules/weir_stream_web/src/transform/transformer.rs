use async_trait::async_trait;
use weir_utils::{Error, Result};

use super::TransformStreamDefaultController;

// dictionary Transformer {
//   TransformerStartCallback start;
//   TransformerTransformCallback transform;
//   TransformerFlushCallback flush;
//   TransformerCancelCallback cancel;
// };
/// The logic inside a [`TransformStream`](super::TransformStream), turning `I` chunks written to
/// its writable side into `O` chunks read from its readable side.
#[async_trait(?Send)]
pub trait Transformer<I: 'static, O: 'static>: 'static {
    // callback TransformerStartCallback = any (TransformStreamDefaultController controller);
    async fn start(&self, _controller: TransformStreamDefaultController<I, O>) -> Result<()> {
        Ok(())
    }

    // callback TransformerTransformCallback = Promise<undefined> (any chunk, TransformStreamDefaultController controller);
    async fn transform(
        &self,
        chunk: I,
        controller: TransformStreamDefaultController<I, O>,
    ) -> Result<()>;

    // callback TransformerFlushCallback = Promise<undefined> (TransformStreamDefaultController controller);
    /// Runs once after the writable side closes and every transform has finished.
    async fn flush(&self, _controller: TransformStreamDefaultController<I, O>) -> Result<()> {
        Ok(())
    }

    // callback TransformerCancelCallback = Promise<undefined> (any reason);
    /// Runs when the readable side is cancelled or the writable side is aborted.
    async fn cancel(&self, _reason: Error) -> Result<()> {
        Ok(())
    }
}

/// Passes every chunk through unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransformer;

#[async_trait(?Send)]
impl<T: 'static> Transformer<T, T> for IdentityTransformer {
    async fn transform(
        &self,
        chunk: T,
        controller: TransformStreamDefaultController<T, T>,
    ) -> Result<()> {
        // Let transformAlgorithm be the following steps, taking a chunk argument:
        // Let result be TransformStreamDefaultControllerEnqueue(controller, chunk).
        controller.enqueue(chunk)
    }
}

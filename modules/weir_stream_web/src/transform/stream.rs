use std::{cell::RefCell, fmt, rc::Rc};

use tracing::trace;
use weir_utils::{Error, Promise, ResolveablePromise, Result};

use super::{IdentityTransformer, TransformStreamDefaultController, Transformer};
use crate::{
    queuing_strategy::{QueuingStrategy, SizeAlgorithm},
    readable::{
        CancelAlgorithm, PullAlgorithm, ReadableStream, ReadableStreamDefaultController,
        ReadableStreamState, StartAlgorithm,
    },
    utils::promise::{promise_from_future, upon_promise},
    writable::{AbortAlgorithm, CloseAlgorithm, WritableStream, WritableStreamState, WriteAlgorithm},
};

pub(super) struct TransformStreamInner<I: 'static, O: 'static> {
    backpressure: bool,
    backpressure_change_promise: Option<ResolveablePromise<()>>,
    pub(super) controller: Option<TransformStreamDefaultController<I, O>>,
    readable: Option<ReadableStream<O>>,
    readable_controller: Option<ReadableStreamDefaultController<O>>,
    writable: Option<WritableStream<I>>,
}

// The state shared by both sides and the controller. The algorithms of the inner readable and
// writable streams hold it too, so it outlives the public handle.
pub(super) struct TransformStreamCore<I: 'static, O: 'static> {
    pub(super) inner: Rc<RefCell<TransformStreamInner<I, O>>>,
}

impl<I: 'static, O: 'static> Clone for TransformStreamCore<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A writable side of `I` chunks and a readable side of `O` chunks joined by a [`Transformer`].
///
/// Writes are held back while the readable side has backpressure, so a slow reader slows the
/// writer down.
pub struct TransformStream<I: 'static, O: 'static> {
    core: TransformStreamCore<I, O>,
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
}

impl<I: 'static, O: 'static> Clone for TransformStream<I, O> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            readable: self.readable.clone(),
            writable: self.writable.clone(),
        }
    }
}

impl<I: 'static, O: 'static> fmt::Debug for TransformStream<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformStream")
            .field("backpressure", &self.core.inner.borrow().backpressure)
            .field("readable_locked", &self.readable.locked())
            .field("writable_locked", &self.writable.locked())
            .finish()
    }
}

impl<T: 'static> TransformStream<T, T> {
    /// A stream that passes every chunk through unchanged.
    pub fn identity(
        writable_strategy: QueuingStrategy<T>,
        readable_strategy: QueuingStrategy<T>,
    ) -> Result<Self> {
        Self::new(IdentityTransformer, writable_strategy, readable_strategy)
    }
}

impl<I: 'static, O: 'static> TransformStream<I, O> {
    // constructor(optional object transformer, optional QueuingStrategy writableStrategy = {}, optional QueuingStrategy readableStrategy = {});
    /// Creates a transform stream around `transformer`.
    ///
    /// The readable side's high water mark defaults to 0 and the writable side's to 1.
    pub fn new(
        transformer: impl Transformer<I, O>,
        writable_strategy: QueuingStrategy<I>,
        readable_strategy: QueuingStrategy<O>,
    ) -> Result<Self> {
        // Let readableHighWaterMark be ? ExtractHighWaterMark(readableStrategy, 0).
        let readable_high_water_mark = readable_strategy.extract_high_water_mark(0.0)?;
        // Let readableSizeAlgorithm be ! ExtractSizeAlgorithm(readableStrategy).
        let readable_size_algorithm = readable_strategy.extract_size_algorithm();
        // Let writableHighWaterMark be ? ExtractHighWaterMark(writableStrategy, 1).
        let writable_high_water_mark = writable_strategy.extract_high_water_mark(1.0)?;
        // Let writableSizeAlgorithm be ! ExtractSizeAlgorithm(writableStrategy).
        let writable_size_algorithm = writable_strategy.extract_size_algorithm();

        // Let startPromise be a new promise.
        let start_promise = ResolveablePromise::new();

        // Perform ! InitializeTransformStream(this, startPromise, writableHighWaterMark, writableSizeAlgorithm, readableHighWaterMark, readableSizeAlgorithm).
        let (core, readable, writable) = TransformStreamCore::initialize_transform_stream(
            start_promise.promise.clone(),
            writable_high_water_mark,
            writable_size_algorithm,
            readable_high_water_mark,
            readable_size_algorithm,
        );

        // Perform ? SetUpTransformStreamDefaultControllerFromTransformer(this, transformer, transformerDict).
        let transformer: Rc<dyn Transformer<I, O>> = Rc::new(transformer);
        let controller =
            TransformStreamDefaultController::set_up_transform_stream_default_controller(
                &core,
                transformer.clone(),
            );

        // If transformerDict["start"] exists, then resolve startPromise with the result of invoking transformerDict["start"]
        // with argument list « this.[[controller]] », exception behavior "rethrow", and callback this value transformer.
        let start_result = promise_from_future(async move { transformer.start(controller).await });
        match start_result.result() {
            Some(result) => {
                start_promise.settle(result);
            },
            None => {
                let _ = upon_promise(start_result, move |result| {
                    start_promise.settle(result);
                    Ok(())
                });
            },
        }

        Ok(Self {
            core,
            readable,
            writable,
        })
    }

    // readonly attribute ReadableStream readable;
    pub fn readable(&self) -> ReadableStream<O> {
        self.readable.clone()
    }

    // readonly attribute WritableStream writable;
    pub fn writable(&self) -> WritableStream<I> {
        self.writable.clone()
    }
}

impl<I: 'static, O: 'static> TransformStreamCore<I, O> {
    // InitializeTransformStream(stream, startPromise, writableHighWaterMark, writableSizeAlgorithm, readableHighWaterMark, readableSizeAlgorithm)
    fn initialize_transform_stream(
        start_promise: Promise<()>,
        writable_high_water_mark: f64,
        writable_size_algorithm: SizeAlgorithm<I>,
        readable_high_water_mark: f64,
        readable_size_algorithm: SizeAlgorithm<O>,
    ) -> (Self, ReadableStream<O>, WritableStream<I>) {
        let stream = Self {
            inner: Rc::new(RefCell::new(TransformStreamInner {
                backpressure: false,
                backpressure_change_promise: None,
                controller: None,
                readable: None,
                readable_controller: None,
                writable: None,
            })),
        };

        // Let startAlgorithm be an algorithm that returns startPromise.
        let writable_start = {
            let start_promise = start_promise.clone();
            StartAlgorithm::new(move |_| start_promise)
        };

        // Let writeAlgorithm be the following steps, taking a chunk argument:
        // Return ! TransformStreamDefaultSinkWriteAlgorithm(stream, chunk).
        let write_algorithm = {
            let stream = stream.clone();
            WriteAlgorithm::new(move |chunk, _| {
                stream.transform_stream_default_sink_write_algorithm(chunk)
            })
        };

        // Let abortAlgorithm be the following steps, taking a reason argument:
        // Return ! TransformStreamDefaultSinkAbortAlgorithm(stream, reason).
        let abort_algorithm = {
            let stream = stream.clone();
            AbortAlgorithm::new(move |reason| {
                stream.transform_stream_default_sink_abort_algorithm(reason)
            })
        };

        // Let closeAlgorithm be the following steps:
        // Return ! TransformStreamDefaultSinkCloseAlgorithm(stream).
        let close_algorithm = {
            let stream = stream.clone();
            CloseAlgorithm::new(move || stream.transform_stream_default_sink_close_algorithm())
        };

        // Set stream.[[writable]] to ! CreateWritableStream(startAlgorithm, writeAlgorithm, closeAlgorithm, abortAlgorithm, writableHighWaterMark, writableSizeAlgorithm).
        let writable = WritableStream::create_writable_stream(
            writable_start,
            write_algorithm,
            close_algorithm,
            abort_algorithm,
            writable_high_water_mark,
            writable_size_algorithm,
        );

        // The readable controller is only reachable through the start algorithm here.
        let readable_start = {
            let stream = stream.clone();
            StartAlgorithm::new(move |controller| {
                stream.inner.borrow_mut().readable_controller = Some(controller);
                start_promise
            })
        };

        // Let pullAlgorithm be the following steps:
        // Return ! TransformStreamDefaultSourcePullAlgorithm(stream).
        let pull_algorithm = {
            let stream = stream.clone();
            PullAlgorithm::new(move |_| stream.transform_stream_default_source_pull_algorithm())
        };

        // Let cancelAlgorithm be the following steps, taking a reason argument:
        // Return ! TransformStreamDefaultSourceCancelAlgorithm(stream, reason).
        let cancel_algorithm = {
            let stream = stream.clone();
            CancelAlgorithm::new(move |reason| {
                stream.transform_stream_default_source_cancel_algorithm(reason)
            })
        };

        // Set stream.[[readable]] to ! CreateReadableStream(startAlgorithm, pullAlgorithm, cancelAlgorithm, readableHighWaterMark, readableSizeAlgorithm).
        let readable = ReadableStream::create_readable_stream(
            readable_start,
            pull_algorithm,
            cancel_algorithm,
            Some(readable_high_water_mark),
            Some(readable_size_algorithm),
        );

        {
            let mut inner = stream.inner.borrow_mut();
            inner.readable = Some(readable.clone());
            inner.writable = Some(writable.clone());
        }

        // Set stream.[[backpressure]] and stream.[[backpressureChangePromise]] to undefined.
        // Perform ! TransformStreamSetBackpressure(stream, true).
        stream.transform_stream_set_backpressure(true);

        (stream, readable, writable)
    }

    fn controller(&self) -> Option<TransformStreamDefaultController<I, O>> {
        self.inner.borrow().controller.clone()
    }

    fn readable(&self) -> Option<ReadableStream<O>> {
        self.inner.borrow().readable.clone()
    }

    fn writable(&self) -> Option<WritableStream<I>> {
        self.inner.borrow().writable.clone()
    }

    pub(super) fn readable_controller(&self) -> Option<ReadableStreamDefaultController<O>> {
        self.inner.borrow().readable_controller.clone()
    }

    fn readable_stored_error(&self) -> Option<Error> {
        match self.readable()?.state() {
            ReadableStreamState::Errored(e) => Some(e),
            _ => None,
        }
    }

    // TransformStreamError(stream, e)
    pub(super) fn transform_stream_error(&self, e: Error) {
        trace!(error = %e, "transform stream errored");

        // Perform ! ReadableStreamDefaultControllerError(stream.[[readable]].[[controller]], e).
        if let Some(readable_controller) = self.readable_controller() {
            readable_controller.readable_stream_default_controller_error(e.clone());
        }

        // Perform ! TransformStreamErrorWritableAndUnblockWrite(stream, e).
        self.transform_stream_error_writable_and_unblock_write(e);
    }

    // TransformStreamErrorWritableAndUnblockWrite(stream, e)
    fn transform_stream_error_writable_and_unblock_write(&self, e: Error) {
        // Perform ! TransformStreamDefaultControllerClearAlgorithms(stream.[[controller]]).
        if let Some(controller) = self.controller() {
            controller.transform_stream_default_controller_clear_algorithms();
        }

        // Perform ! WritableStreamDefaultControllerErrorIfNeeded(stream.[[writable]].[[controller]], e).
        if let Some(writable_controller) = self.writable().and_then(|w| w.controller()) {
            writable_controller.writable_stream_default_controller_error_if_needed(e);
        }

        // Perform ! TransformStreamUnblockWrite(stream).
        self.transform_stream_unblock_write();
    }

    // TransformStreamSetBackpressure(stream, backpressure)
    fn transform_stream_set_backpressure(&self, backpressure: bool) {
        let previous = {
            let mut inner = self.inner.borrow_mut();
            // Assert: stream.[[backpressure]] is not backpressure.
            // If stream.[[backpressureChangePromise]] is not undefined, resolve stream.[[backpressureChangePromise]] with undefined.
            let previous = inner.backpressure_change_promise.take();
            // Set stream.[[backpressureChangePromise]] to a new promise.
            inner.backpressure_change_promise = Some(ResolveablePromise::new());
            // Set stream.[[backpressure]] to backpressure.
            inner.backpressure = backpressure;
            previous
        };

        if let Some(previous) = previous {
            previous.resolve(());
        }
    }

    // TransformStreamUnblockWrite(stream)
    fn transform_stream_unblock_write(&self) {
        // If stream.[[backpressure]] is true, perform ! TransformStreamSetBackpressure(stream, false).
        if self.inner.borrow().backpressure {
            self.transform_stream_set_backpressure(false);
        }
    }

    fn backpressure_change_promise(&self) -> Promise<()> {
        match &self.inner.borrow().backpressure_change_promise {
            Some(promise) => promise.promise.clone(),
            None => Promise::resolved(()),
        }
    }

    // TransformStreamDefaultControllerEnqueue(controller, chunk)
    pub(super) fn transform_stream_default_controller_enqueue(&self, chunk: O) -> Result<()> {
        // Let readableController be stream.[[readable]].[[controller]].
        let readable_controller = self
            .readable_controller()
            .ok_or_else(|| Error::invalid_state("The readable side has not started"))?;

        // If ! ReadableStreamDefaultControllerCanCloseOrEnqueue(readableController) is false, throw a TypeError exception.
        if !readable_controller.readable_stream_default_controller_can_close_or_enqueue() {
            return Err(Error::invalid_state(
                "Readable side is not in a state that permits enqueue",
            ));
        }

        // Let enqueueResult be ReadableStreamDefaultControllerEnqueue(readableController, chunk).
        // If enqueueResult is an abrupt completion,
        if let Err(e) = readable_controller.readable_stream_default_controller_enqueue(chunk) {
            // Perform ! TransformStreamErrorWritableAndUnblockWrite(stream, enqueueResult.[[Value]]).
            self.transform_stream_error_writable_and_unblock_write(e.clone());
            // Throw stream.[[readable]].[[storedError]].
            return Err(self.readable_stored_error().unwrap_or(e));
        }

        // Let backpressure be ! ReadableStreamDefaultControllerHasBackpressure(readableController).
        let backpressure =
            readable_controller.readable_stream_default_controller_has_backpressure();

        // If backpressure is not stream.[[backpressure]],
        if backpressure != self.inner.borrow().backpressure {
            // Assert: backpressure is true.
            // Perform ! TransformStreamSetBackpressure(stream, true).
            self.transform_stream_set_backpressure(true);
        }

        Ok(())
    }

    // TransformStreamDefaultControllerTerminate(controller)
    pub(super) fn transform_stream_default_controller_terminate(&self) {
        trace!("transform stream terminated");

        // Let readableController be stream.[[readable]].[[controller]].
        // Perform ! ReadableStreamDefaultControllerClose(readableController).
        if let Some(readable_controller) = self.readable_controller() {
            readable_controller.readable_stream_default_controller_close();
        }

        // Let error be a TypeError exception indicating that the stream has been terminated.
        let error = Error::invalid_state("TransformStream terminated");

        // Perform ! TransformStreamErrorWritableAndUnblockWrite(stream, error).
        self.transform_stream_error_writable_and_unblock_write(error);
    }

    // TransformStreamDefaultSinkWriteAlgorithm(stream, chunk)
    fn transform_stream_default_sink_write_algorithm(&self, chunk: I) -> Promise<()> {
        // Let controller be stream.[[controller]].
        let Some(controller) = self.controller() else {
            return Promise::resolved(());
        };

        // If stream.[[backpressure]] is true,
        if self.inner.borrow().backpressure {
            // Let backpressureChangePromise be stream.[[backpressureChangePromise]].
            let backpressure_change_promise = self.backpressure_change_promise();
            let stream = self.clone();

            // Return the result of reacting to backpressureChangePromise with the following fulfillment steps:
            return promise_from_future(async move {
                backpressure_change_promise.await?;

                // Let writable be stream.[[writable]].
                // Let state be writable.[[state]].
                // If state is "erroring", throw writable.[[storedError]].
                if let Some(WritableStreamState::Erroring(stored_error)) =
                    stream.writable().map(|w| w.state())
                {
                    return Err(stored_error);
                }

                // Return ! TransformStreamDefaultControllerPerformTransform(controller, chunk).
                controller
                    .transform_stream_default_controller_perform_transform(&stream, chunk)
                    .await
            });
        }

        // Return ! TransformStreamDefaultControllerPerformTransform(controller, chunk).
        controller.transform_stream_default_controller_perform_transform(self, chunk)
    }

    // TransformStreamDefaultSinkAbortAlgorithm(stream, reason)
    fn transform_stream_default_sink_abort_algorithm(&self, reason: Error) -> Promise<()> {
        // Let controller be stream.[[controller]].
        let Some(controller) = self.controller() else {
            return Promise::resolved(());
        };

        // If controller.[[finishPromise]] is not undefined, return controller.[[finishPromise]].
        if let Some(finish_promise) = controller.finish_promise() {
            return finish_promise;
        }

        // Let controller.[[finishPromise]] be a new promise.
        let finish_promise = ResolveablePromise::new();
        controller.inner.borrow_mut().finish_promise = Some(finish_promise.clone());

        // Let cancelPromise be the result of performing controller.[[cancelAlgorithm]], passing reason.
        let cancel_promise = Self::perform_cancel(&controller, reason.clone());

        // Perform ! TransformStreamDefaultControllerClearAlgorithms(controller).
        controller.transform_stream_default_controller_clear_algorithms();

        // React to cancelPromise:
        let stream = self.clone();
        let result = finish_promise.promise.clone();
        let _ = upon_promise(cancel_promise, move |result| {
            let readable_controller = stream.readable_controller();
            match result {
                // If cancelPromise was fulfilled, then:
                Ok(()) => match stream.readable_stored_error() {
                    // If readable.[[state]] is "errored", reject controller.[[finishPromise]] with readable.[[storedError]].
                    Some(stored_error) => {
                        finish_promise.reject(stored_error);
                    },
                    // Otherwise:
                    None => {
                        // Perform ! ReadableStreamDefaultControllerError(readable.[[controller]], reason).
                        if let Some(readable_controller) = readable_controller {
                            readable_controller.readable_stream_default_controller_error(reason);
                        }
                        // Resolve controller.[[finishPromise]] with undefined.
                        finish_promise.resolve(());
                    },
                },
                // If cancelPromise was rejected with reason r, then:
                Err(r) => {
                    // Perform ! ReadableStreamDefaultControllerError(readable.[[controller]], r).
                    if let Some(readable_controller) = readable_controller {
                        readable_controller.readable_stream_default_controller_error(r.clone());
                    }
                    // Reject controller.[[finishPromise]] with r.
                    finish_promise.reject(r);
                },
            }
            Ok(())
        });

        // Return controller.[[finishPromise]].
        result
    }

    // TransformStreamDefaultSinkCloseAlgorithm(stream)
    fn transform_stream_default_sink_close_algorithm(&self) -> Promise<()> {
        // Let controller be stream.[[controller]].
        let Some(controller) = self.controller() else {
            return Promise::resolved(());
        };

        // If controller.[[finishPromise]] is not undefined, return controller.[[finishPromise]].
        if let Some(finish_promise) = controller.finish_promise() {
            return finish_promise;
        }

        // Let controller.[[finishPromise]] be a new promise.
        let finish_promise = ResolveablePromise::new();
        controller.inner.borrow_mut().finish_promise = Some(finish_promise.clone());

        // Let flushPromise be the result of performing controller.[[flushAlgorithm]].
        let flush_promise = match controller.transformer() {
            Some(transformer) => {
                let controller = controller.clone();
                promise_from_future(async move { transformer.flush(controller).await })
            },
            None => Promise::resolved(()),
        };

        // Perform ! TransformStreamDefaultControllerClearAlgorithms(controller).
        controller.transform_stream_default_controller_clear_algorithms();

        // React to flushPromise:
        let stream = self.clone();
        let result = finish_promise.promise.clone();
        let _ = upon_promise(flush_promise, move |result| {
            let readable_controller = stream.readable_controller();
            match result {
                // If flushPromise was fulfilled, then:
                Ok(()) => match stream.readable_stored_error() {
                    // If readable.[[state]] is "errored", reject controller.[[finishPromise]] with readable.[[storedError]].
                    Some(stored_error) => {
                        finish_promise.reject(stored_error);
                    },
                    // Otherwise:
                    None => {
                        // Perform ! ReadableStreamDefaultControllerClose(readable.[[controller]]).
                        if let Some(readable_controller) = readable_controller {
                            readable_controller.readable_stream_default_controller_close();
                        }
                        // Resolve controller.[[finishPromise]] with undefined.
                        finish_promise.resolve(());
                    },
                },
                // If flushPromise was rejected with reason r, then:
                Err(r) => {
                    // Perform ! ReadableStreamDefaultControllerError(readable.[[controller]], r).
                    if let Some(readable_controller) = readable_controller {
                        readable_controller.readable_stream_default_controller_error(r.clone());
                    }
                    // Reject controller.[[finishPromise]] with r.
                    finish_promise.reject(r);
                },
            }
            Ok(())
        });

        // Return controller.[[finishPromise]].
        result
    }

    // TransformStreamDefaultSourcePullAlgorithm(stream)
    fn transform_stream_default_source_pull_algorithm(&self) -> Promise<()> {
        // Assert: stream.[[backpressure]] is true.
        // Assert: stream.[[backpressureChangePromise]] is not undefined.
        // Perform ! TransformStreamSetBackpressure(stream, false).
        self.transform_stream_set_backpressure(false);

        // Return stream.[[backpressureChangePromise]].
        self.backpressure_change_promise()
    }

    // TransformStreamDefaultSourceCancelAlgorithm(stream, reason)
    fn transform_stream_default_source_cancel_algorithm(&self, reason: Error) -> Promise<()> {
        // Let controller be stream.[[controller]].
        let Some(controller) = self.controller() else {
            return Promise::resolved(());
        };

        // If controller.[[finishPromise]] is not undefined, return controller.[[finishPromise]].
        if let Some(finish_promise) = controller.finish_promise() {
            return finish_promise;
        }

        // Let controller.[[finishPromise]] be a new promise.
        let finish_promise = ResolveablePromise::new();
        controller.inner.borrow_mut().finish_promise = Some(finish_promise.clone());

        // Let cancelPromise be the result of performing controller.[[cancelAlgorithm]], passing reason.
        let cancel_promise = Self::perform_cancel(&controller, reason.clone());

        // Perform ! TransformStreamDefaultControllerClearAlgorithms(controller).
        controller.transform_stream_default_controller_clear_algorithms();

        // React to cancelPromise:
        let stream = self.clone();
        let result = finish_promise.promise.clone();
        let _ = upon_promise(cancel_promise, move |result| {
            let writable = stream.writable();
            let writable_controller = writable.as_ref().and_then(|w| w.controller());
            match result {
                // If cancelPromise was fulfilled, then:
                Ok(()) => match writable.map(|w| w.state()) {
                    // If writable.[[state]] is "errored", reject controller.[[finishPromise]] with writable.[[storedError]].
                    Some(WritableStreamState::Errored(stored_error)) => {
                        finish_promise.reject(stored_error);
                    },
                    // Otherwise:
                    _ => {
                        // Perform ! WritableStreamDefaultControllerErrorIfNeeded(writable.[[controller]], reason).
                        if let Some(writable_controller) = writable_controller {
                            writable_controller
                                .writable_stream_default_controller_error_if_needed(reason);
                        }
                        // Perform ! TransformStreamUnblockWrite(stream).
                        stream.transform_stream_unblock_write();
                        // Resolve controller.[[finishPromise]] with undefined.
                        finish_promise.resolve(());
                    },
                },
                // If cancelPromise was rejected with reason r, then:
                Err(r) => {
                    // Perform ! WritableStreamDefaultControllerErrorIfNeeded(writable.[[controller]], r).
                    if let Some(writable_controller) = writable_controller {
                        writable_controller
                            .writable_stream_default_controller_error_if_needed(r.clone());
                    }
                    // Perform ! TransformStreamUnblockWrite(stream).
                    stream.transform_stream_unblock_write();
                    // Reject controller.[[finishPromise]] with r.
                    finish_promise.reject(r);
                },
            }
            Ok(())
        });

        // Return controller.[[finishPromise]].
        result
    }

    fn perform_cancel(
        controller: &TransformStreamDefaultController<I, O>,
        reason: Error,
    ) -> Promise<()> {
        match controller.transformer() {
            Some(transformer) => {
                promise_from_future(async move { transformer.cancel(reason).await })
            },
            None => Promise::resolved(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use async_trait::async_trait;
    use weir_test::{flush_jobs, test_async_with};

    use super::*;

    #[derive(Clone, Default)]
    struct Lengths {
        total: Rc<Cell<usize>>,
        cancelled: Rc<RefCell<Option<Error>>>,
    }

    #[async_trait(?Send)]
    impl Transformer<String, usize> for Lengths {
        async fn transform(
            &self,
            chunk: String,
            controller: TransformStreamDefaultController<String, usize>,
        ) -> Result<()> {
            if chunk == "boom" {
                return Err(Error::message("cannot measure boom"));
            }
            self.total.set(self.total.get() + chunk.len());
            controller.enqueue(chunk.len())
        }

        async fn flush(
            &self,
            controller: TransformStreamDefaultController<String, usize>,
        ) -> Result<()> {
            controller.enqueue(self.total.get())
        }

        async fn cancel(&self, reason: Error) -> Result<()> {
            self.cancelled.borrow_mut().replace(reason);
            Ok(())
        }
    }

    struct TakeOne;

    #[async_trait(?Send)]
    impl Transformer<u32, u32> for TakeOne {
        async fn transform(
            &self,
            chunk: u32,
            controller: TransformStreamDefaultController<u32, u32>,
        ) -> Result<()> {
            controller.enqueue(chunk)?;
            controller.terminate();
            Ok(())
        }
    }

    #[tokio::test]
    async fn identity_passes_chunks_through_in_order() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = TransformStream::identity(
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let writer = stream.writable().get_writer().unwrap();
                let reader = stream.readable().get_reader().unwrap();

                let first = writer.write(1u32);
                let second = writer.write(2);
                let closed = writer.close();

                assert_eq!(reader.read().await.unwrap().value, Some(1));
                assert_eq!(reader.read().await.unwrap().value, Some(2));
                assert!(reader.read().await.unwrap().done);
                assert_eq!(first.await, Ok(()));
                assert_eq!(second.await, Ok(()));
                assert_eq!(closed.await, Ok(()));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn writes_wait_for_a_reader() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = TransformStream::identity(
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let writer = stream.writable().get_writer().unwrap();

                let write = writer.write(7u32);
                flush_jobs().await;
                assert!(write.is_pending());

                let reader = stream.readable().get_reader().unwrap();
                assert_eq!(reader.read().await.unwrap().value, Some(7));
                assert_eq!(write.await, Ok(()));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn flush_runs_after_the_last_transform() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = TransformStream::new(
                    Lengths::default(),
                    QueuingStrategy::default(),
                    QueuingStrategy::new(4.0),
                )
                .unwrap();
                let writer = stream.writable().get_writer().unwrap();
                let reader = stream.readable().get_reader().unwrap();

                let _ = writer.write("ab".to_string());
                let _ = writer.write("cde".to_string());
                assert_eq!(writer.close().await, Ok(()));

                let mut seen = Vec::new();
                loop {
                    let result = reader.read().await.unwrap();
                    if result.done {
                        break;
                    }
                    seen.extend(result.value);
                }
                assert_eq!(seen, vec![2, 3, 5]);
            })
        })
        .await;
    }

    #[tokio::test]
    async fn transform_failure_errors_both_sides() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = TransformStream::new(
                    Lengths::default(),
                    QueuingStrategy::default(),
                    QueuingStrategy::new(1.0),
                )
                .unwrap();
                let writer = stream.writable().get_writer().unwrap();
                let reader = stream.readable().get_reader().unwrap();

                let expected = Error::message("cannot measure boom");
                assert_eq!(writer.write("boom".to_string()).await, Err(expected.clone()));
                assert_eq!(reader.read().await, Err(expected.clone()));
                assert_eq!(writer.closed().await, Err(expected));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn terminate_closes_readable_and_errors_writable() {
        test_async_with(|| {
            Box::pin(async move {
                let stream = TransformStream::new(
                    TakeOne,
                    QueuingStrategy::default(),
                    QueuingStrategy::new(1.0),
                )
                .unwrap();
                let writer = stream.writable().get_writer().unwrap();
                let reader = stream.readable().get_reader().unwrap();

                assert_eq!(writer.write(1).await, Ok(()));
                assert_eq!(reader.read().await.unwrap().value, Some(1));
                assert!(reader.read().await.unwrap().done);

                let terminated = Error::invalid_state("TransformStream terminated");
                assert_eq!(writer.write(2).await, Err(terminated.clone()));
                assert_eq!(writer.closed().await, Err(terminated));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn cancelling_the_readable_side_errors_the_writable_side() {
        test_async_with(|| {
            Box::pin(async move {
                let transformer = Lengths::default();
                let stream = TransformStream::new(
                    transformer.clone(),
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let writer = stream.writable().get_writer().unwrap();

                let reason = Error::message("no longer interested");
                assert_eq!(stream.readable().cancel(Some(reason.clone())).await, Ok(()));
                assert_eq!(*transformer.cancelled.borrow(), Some(reason.clone()));
                assert_eq!(writer.write("late".to_string()).await, Err(reason));
            })
        })
        .await;
    }

    #[tokio::test]
    async fn aborting_the_writable_side_errors_the_readable_side() {
        test_async_with(|| {
            Box::pin(async move {
                let transformer = Lengths::default();
                let stream = TransformStream::new(
                    transformer.clone(),
                    QueuingStrategy::default(),
                    QueuingStrategy::default(),
                )
                .unwrap();
                let reader = stream.readable().get_reader().unwrap();

                let reason = Error::message("upstream gave up");
                assert_eq!(stream.writable().abort(Some(reason.clone())).await, Ok(()));
                assert_eq!(*transformer.cancelled.borrow(), Some(reason.clone()));
                assert_eq!(reader.read().await, Err(reason));
            })
        })
        .await;
    }
}

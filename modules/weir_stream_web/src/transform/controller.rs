use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

use weir_utils::{Error, Promise, ResolveablePromise, Result};

use super::{
    stream::{TransformStreamCore, TransformStreamInner},
    Transformer,
};
use crate::utils::promise::{promise_from_future, upon_promise};

pub(super) struct TransformStreamDefaultControllerInner<I: 'static, O: 'static> {
    pub(super) finish_promise: Option<ResolveablePromise<()>>,
    stream: Weak<RefCell<TransformStreamInner<I, O>>>,
    // standing in for the transform, flush and cancel algorithms, which are cleared together
    transformer: Option<Rc<dyn Transformer<I, O>>>,
}

/// The handle a [`Transformer`] uses to produce output and to end the stream early.
pub struct TransformStreamDefaultController<I: 'static, O: 'static> {
    pub(super) inner: Rc<RefCell<TransformStreamDefaultControllerInner<I, O>>>,
}

impl<I: 'static, O: 'static> Clone for TransformStreamDefaultController<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: 'static, O: 'static> fmt::Debug for TransformStreamDefaultController<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("TransformStreamDefaultController")
            .field("finishing", &inner.finish_promise.is_some())
            .field("cleared", &inner.transformer.is_none())
            .finish()
    }
}

impl<I: 'static, O: 'static> TransformStreamDefaultController<I, O> {
    // SetUpTransformStreamDefaultController(stream, controller, transformAlgorithm, flushAlgorithm, cancelAlgorithm)
    pub(super) fn set_up_transform_stream_default_controller(
        stream: &TransformStreamCore<I, O>,
        transformer: Rc<dyn Transformer<I, O>>,
    ) -> Self {
        let controller = Self {
            inner: Rc::new(RefCell::new(TransformStreamDefaultControllerInner {
                // Set controller.[[stream]] to stream.
                stream: Rc::downgrade(&stream.inner),
                // Set controller.[[transformAlgorithm]] to transformAlgorithm.
                // Set controller.[[flushAlgorithm]] to flushAlgorithm.
                // Set controller.[[cancelAlgorithm]] to cancelAlgorithm.
                transformer: Some(transformer),
                finish_promise: None,
            })),
        };

        // Set stream.[[controller]] to controller.
        stream.inner.borrow_mut().controller = Some(controller.clone());

        controller
    }

    // readonly attribute unrestricted double? desiredSize;
    /// The desired size of the readable side's queue.
    pub fn desired_size(&self) -> Option<f64> {
        // Let readableController be this.[[stream]].[[readable]].[[controller]].
        // Return ! ReadableStreamDefaultControllerGetDesiredSize(readableController).
        self.stream()?
            .readable_controller()?
            .readable_stream_default_controller_get_desired_size()
    }

    // undefined enqueue(optional any chunk);
    /// Hands `chunk` to the readable side.
    pub fn enqueue(&self, chunk: O) -> Result<()> {
        let stream = self.stream_or_gone()?;
        // Perform ? TransformStreamDefaultControllerEnqueue(this, chunk).
        stream.transform_stream_default_controller_enqueue(chunk)
    }

    // undefined error(optional any reason);
    /// Errors both sides of the stream.
    pub fn error(&self, reason: Option<Error>) {
        // Perform ? TransformStreamDefaultControllerError(this, e).
        if let Some(stream) = self.stream() {
            stream.transform_stream_error(reason.unwrap_or(Error::Unspecified));
        }
    }

    // undefined terminate();
    /// Closes the readable side and errors the writable side.
    pub fn terminate(&self) {
        // Perform ? TransformStreamDefaultControllerTerminate(this).
        if let Some(stream) = self.stream() {
            stream.transform_stream_default_controller_terminate();
        }
    }

    fn stream(&self) -> Option<TransformStreamCore<I, O>> {
        self.inner
            .borrow()
            .stream
            .upgrade()
            .map(|inner| TransformStreamCore { inner })
    }

    fn stream_or_gone(&self) -> Result<TransformStreamCore<I, O>> {
        self.stream()
            .ok_or_else(|| Error::invalid_state("The transform stream no longer exists"))
    }

    pub(super) fn transformer(&self) -> Option<Rc<dyn Transformer<I, O>>> {
        self.inner.borrow().transformer.clone()
    }

    pub(super) fn finish_promise(&self) -> Option<Promise<()>> {
        self.inner
            .borrow()
            .finish_promise
            .as_ref()
            .map(|finish_promise| finish_promise.promise.clone())
    }

    pub(super) fn transform_stream_default_controller_clear_algorithms(&self) {
        // Set controller.[[transformAlgorithm]] to undefined.
        // Set controller.[[flushAlgorithm]] to undefined.
        // Set controller.[[cancelAlgorithm]] to undefined.
        self.inner.borrow_mut().transformer = None;
    }

    pub(super) fn transform_stream_default_controller_perform_transform(
        &self,
        stream: &TransformStreamCore<I, O>,
        chunk: I,
    ) -> Promise<()> {
        // Let transformPromise be the result of performing controller.[[transformAlgorithm]], passing chunk.
        let Some(transformer) = self.transformer() else {
            return Promise::resolved(());
        };
        let controller = self.clone();
        let transform_promise =
            promise_from_future(async move { transformer.transform(chunk, controller).await });

        // Return the result of reacting to transformPromise with the following rejection steps given the argument r:
        let stream = stream.clone();
        upon_promise(transform_promise, move |result| {
            if let Err(r) = &result {
                // Perform ! TransformStreamError(controller.[[stream]], r).
                stream.transform_stream_error(r.clone());
            }
            // Throw r.
            result
        })
    }
}

use std::rc::Rc;

use async_trait::async_trait;
use weir_utils::{Error, Promise, Result};

use super::WritableStreamDefaultController;
use crate::{
    readable::{CancelAlgorithm, StartAlgorithm},
    utils::promise::promise_from_future,
};

/// The consumer behind a [`WritableStream`](super::WritableStream).
///
/// Every method is optional. `write` is never called again until the previous write has finished,
/// and `close` only runs after every accepted write has completed.
#[async_trait(?Send)]
pub trait UnderlyingSink<T: 'static>: 'static {
    // callback UnderlyingSinkStartCallback = any (WritableStreamDefaultController controller);
    async fn start(&self, _controller: WritableStreamDefaultController<T>) -> Result<()> {
        Ok(())
    }

    // callback UnderlyingSinkWriteCallback = Promise<undefined> (any chunk, WritableStreamDefaultController controller);
    async fn write(
        &self,
        _chunk: T,
        _controller: WritableStreamDefaultController<T>,
    ) -> Result<()> {
        Ok(())
    }

    // callback UnderlyingSinkCloseCallback = Promise<undefined> ();
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    // callback UnderlyingSinkAbortCallback = Promise<undefined> (optional any reason);
    async fn abort(&self, _reason: Error) -> Result<()> {
        Ok(())
    }
}

/// A sink that accepts and discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl<T: 'static> UnderlyingSink<T> for DiscardSink {}

type WriteFn<T> = Rc<dyn Fn(T, WritableStreamDefaultController<T>) -> Promise<()>>;
type CloseFn = Box<dyn FnOnce() -> Promise<()>>;

pub(crate) enum WriteAlgorithm<T: 'static> {
    ReturnPromiseUndefined,
    Function(WriteFn<T>),
}

impl<T: 'static> Clone for WriteAlgorithm<T> {
    fn clone(&self) -> Self {
        match self {
            Self::ReturnPromiseUndefined => Self::ReturnPromiseUndefined,
            Self::Function(f) => Self::Function(f.clone()),
        }
    }
}

impl<T: 'static> WriteAlgorithm<T> {
    pub(crate) fn new(
        f: impl Fn(T, WritableStreamDefaultController<T>) -> Promise<()> + 'static,
    ) -> Self {
        Self::Function(Rc::new(f))
    }

    pub(crate) fn call(
        &self,
        chunk: T,
        controller: WritableStreamDefaultController<T>,
    ) -> Promise<()> {
        match self {
            Self::ReturnPromiseUndefined => Promise::resolved(()),
            Self::Function(f) => f(chunk, controller),
        }
    }
}

pub(crate) enum CloseAlgorithm {
    ReturnPromiseUndefined,
    Function(CloseFn),
}

impl CloseAlgorithm {
    pub(crate) fn new(f: impl FnOnce() -> Promise<()> + 'static) -> Self {
        Self::Function(Box::new(f))
    }

    pub(crate) fn call(self) -> Promise<()> {
        match self {
            Self::ReturnPromiseUndefined => Promise::resolved(()),
            Self::Function(f) => f(),
        }
    }
}

// abort takes a reason and settles once, just like cancel on the readable side
pub(crate) type AbortAlgorithm = CancelAlgorithm;

pub(crate) type SinkAlgorithms<T> = (
    StartAlgorithm<WritableStreamDefaultController<T>>,
    WriteAlgorithm<T>,
    CloseAlgorithm,
    AbortAlgorithm,
);

pub(crate) fn from_underlying_sink<T: 'static>(
    underlying_sink: impl UnderlyingSink<T>,
) -> SinkAlgorithms<T> {
    let sink = Rc::new(underlying_sink);
    let (write_sink, close_sink, abort_sink) = (sink.clone(), sink.clone(), sink.clone());
    (
        // Set startAlgorithm to an algorithm which returns the result of invoking underlyingSinkDict["start"] with argument list
        // « controller », exception behavior "rethrow", and callback this value underlyingSink.
        StartAlgorithm::new(move |controller| {
            promise_from_future(async move { sink.start(controller).await })
        }),
        // Set writeAlgorithm to an algorithm which takes an argument chunk and returns the result of invoking underlyingSinkDict["write"] with argument list
        // « chunk, controller » and callback this value underlyingSink.
        WriteAlgorithm::new(move |chunk, controller| {
            let sink = write_sink.clone();
            promise_from_future(async move { sink.write(chunk, controller).await })
        }),
        // Set closeAlgorithm to an algorithm which returns the result of invoking underlyingSinkDict["close"] with argument list
        // «» and callback this value underlyingSink.
        CloseAlgorithm::new(move || promise_from_future(async move { close_sink.close().await })),
        // Set abortAlgorithm to an algorithm which takes an argument reason and returns the result of invoking underlyingSinkDict["abort"] with argument list
        // « reason » and callback this value underlyingSink.
        AbortAlgorithm::new(move |reason| {
            promise_from_future(async move { abort_sink.abort(reason).await })
        }),
    )
}

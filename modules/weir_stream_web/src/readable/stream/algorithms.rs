use std::rc::Rc;

use weir_utils::{Error, Promise};

use crate::utils::promise::promise_from_future;

use super::source::{UnderlyingByteSource, UnderlyingSource};
use crate::readable::{ReadableByteStreamController, ReadableStreamDefaultController};

type StartFn<C> = Box<dyn FnOnce(C) -> Promise<()>>;
type PullFn<C> = Rc<dyn Fn(C) -> Promise<()>>;
type CancelFn = Box<dyn FnOnce(Error) -> Promise<()>>;

pub(crate) enum StartAlgorithm<C> {
    ReturnUndefined,
    Function(StartFn<C>),
}

impl<C> StartAlgorithm<C> {
    pub(crate) fn new(f: impl FnOnce(C) -> Promise<()> + 'static) -> Self {
        Self::Function(Box::new(f))
    }

    pub(crate) fn call(self, controller: C) -> Promise<()> {
        match self {
            Self::ReturnUndefined => Promise::resolved(()),
            Self::Function(f) => f(controller),
        }
    }
}

pub(crate) enum PullAlgorithm<C> {
    ReturnPromiseUndefined,
    Function(PullFn<C>),
}

impl<C> Clone for PullAlgorithm<C> {
    fn clone(&self) -> Self {
        match self {
            Self::ReturnPromiseUndefined => Self::ReturnPromiseUndefined,
            Self::Function(f) => Self::Function(f.clone()),
        }
    }
}

impl<C> PullAlgorithm<C> {
    pub(crate) fn new(f: impl Fn(C) -> Promise<()> + 'static) -> Self {
        Self::Function(Rc::new(f))
    }

    pub(crate) fn call(&self, controller: C) -> Promise<()> {
        match self {
            Self::ReturnPromiseUndefined => Promise::resolved(()),
            Self::Function(f) => f(controller),
        }
    }
}

pub(crate) enum CancelAlgorithm {
    ReturnPromiseUndefined,
    Function(CancelFn),
}

impl CancelAlgorithm {
    pub(crate) fn new(f: impl FnOnce(Error) -> Promise<()> + 'static) -> Self {
        Self::Function(Box::new(f))
    }

    pub(crate) fn call(self, reason: Error) -> Promise<()> {
        match self {
            Self::ReturnPromiseUndefined => Promise::resolved(()),
            Self::Function(f) => f(reason),
        }
    }
}

pub(crate) type SourceAlgorithms<C> = (StartAlgorithm<C>, PullAlgorithm<C>, CancelAlgorithm);

pub(crate) fn from_underlying_source<T: 'static>(
    underlying_source: impl UnderlyingSource<T>,
) -> SourceAlgorithms<ReadableStreamDefaultController<T>> {
    let source = Rc::new(underlying_source);
    let (pull_source, cancel_source) = (source.clone(), source.clone());
    (
        // Let startAlgorithm be an algorithm which returns the result of invoking underlyingSourceDict["start"] with argument list
        // « controller » and callback this value underlyingSource.
        StartAlgorithm::new(move |controller| {
            promise_from_future(async move { source.start(controller).await })
        }),
        PullAlgorithm::new(move |controller| {
            let source = pull_source.clone();
            promise_from_future(async move { source.pull(controller).await })
        }),
        CancelAlgorithm::new(move |reason| {
            promise_from_future(async move { cancel_source.cancel(reason).await })
        }),
    )
}

pub(crate) fn from_underlying_byte_source(
    underlying_source: impl UnderlyingByteSource,
) -> (
    SourceAlgorithms<ReadableByteStreamController>,
    Option<usize>,
) {
    // Let autoAllocateChunkSize be underlyingSourceDict["autoAllocateChunkSize"], if it exists, or undefined otherwise.
    let auto_allocate_chunk_size = underlying_source.auto_allocate_chunk_size();
    let source = Rc::new(underlying_source);
    let (pull_source, cancel_source) = (source.clone(), source.clone());
    (
        (
            StartAlgorithm::new(move |controller| {
                promise_from_future(async move { source.start(controller).await })
            }),
            PullAlgorithm::new(move |controller| {
                let source = pull_source.clone();
                promise_from_future(async move { source.pull(controller).await })
            }),
            CancelAlgorithm::new(move |reason| {
                promise_from_future(async move { cancel_source.cancel(reason).await })
            }),
        ),
        auto_allocate_chunk_size,
    )
}

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use weir_utils::{Error, Promise, ResolveablePromise, Result};

use super::{
    byob_reader::ReadableStreamBYOBReaderInner, default_reader::ReadableStreamDefaultReaderInner,
    ReadableStream, ReadableStreamBYOBReader, ReadableStreamDefaultReader, ReadableStreamState,
};

// enum ReadableStreamReaderMode { "byob" };
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderMode {
    Byob,
}

// dictionary ReadableStreamGetReaderOptions {
//   ReadableStreamReaderMode mode;
// };
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadableStreamGetReaderOptions {
    pub mode: Option<ReaderMode>,
}

impl ReadableStreamGetReaderOptions {
    pub fn byob() -> Self {
        Self {
            mode: Some(ReaderMode::Byob),
        }
    }
}

// typedef (ReadableStreamDefaultReader or ReadableStreamBYOBReader) ReadableStreamReader;
pub enum ReadableStreamReader<T: 'static> {
    Default(ReadableStreamDefaultReader<T>),
    Byob(ReadableStreamBYOBReader),
}

impl<T: 'static> Clone for ReadableStreamReader<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Default(r) => Self::Default(r.clone()),
            Self::Byob(r) => Self::Byob(r.clone()),
        }
    }
}

impl<T: 'static> ReadableStreamReader<T> {
    pub fn closed(&self) -> Promise<()> {
        self.closed_promise().promise
    }

    pub(crate) fn closed_promise(&self) -> ResolveablePromise<()> {
        match self {
            Self::Default(r) => r.inner.borrow().generic.closed_promise.clone(),
            Self::Byob(r) => r.inner.borrow().generic.closed_promise.clone(),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakReader<T> {
        match self {
            Self::Default(r) => WeakReader::Default(Rc::downgrade(&r.inner)),
            Self::Byob(r) => WeakReader::Byob(Rc::downgrade(&r.inner)),
        }
    }
}

/// What a stream keeps of its reader. Dropping the last handle to a reader releases the lock the
/// same way `release_lock` does.
pub(crate) enum WeakReader<T: 'static> {
    Default(Weak<RefCell<ReadableStreamDefaultReaderInner<T>>>),
    Byob(Weak<RefCell<ReadableStreamBYOBReaderInner>>),
}

impl<T: 'static> WeakReader<T> {
    pub(crate) fn upgrade(&self) -> Option<ReadableStreamReader<T>> {
        match self {
            Self::Default(r) => r
                .upgrade()
                .map(|inner| ReadableStreamReader::Default(ReadableStreamDefaultReader { inner })),
            Self::Byob(r) => r
                .upgrade()
                .map(|inner| ReadableStreamReader::Byob(ReadableStreamBYOBReader { inner })),
        }
    }
}

pub(crate) struct ReadableStreamGenericReader<T: 'static> {
    pub(crate) closed_promise: ResolveablePromise<()>,
    pub(crate) stream: Option<ReadableStream<T>>,
}

impl<T: 'static> ReadableStreamGenericReader<T> {
    pub(crate) fn readable_stream_reader_generic_initialize(stream: &ReadableStream<T>) -> Self {
        let closed_promise = match stream.state() {
            // If stream.[[state]] is "readable",
            ReadableStreamState::Readable => {
                // Set reader.[[closedPromise]] to a new promise.
                ResolveablePromise::new()
            },
            // Otherwise, if stream.[[state]] is "closed",
            ReadableStreamState::Closed => {
                // Set reader.[[closedPromise]] to a promise resolved with undefined.
                ResolveablePromise::resolved_with(())
            },
            // Otherwise,
            ReadableStreamState::Errored(stored_error) => {
                // Set reader.[[closedPromise]] to a promise rejected with stream.[[storedError]].
                ResolveablePromise::rejected_with(stored_error)
            },
        };

        Self {
            // Set reader.[[stream]] to stream.
            stream: Some(stream.clone()),
            closed_promise,
        }
    }

    /// The stream this reader is locked to, or a `TypeError` once it has been released.
    pub(crate) fn stream_or_released(&self, action: &'static str) -> Result<ReadableStream<T>> {
        self.stream.clone().ok_or_else(|| {
            Error::invalid_state(format!("Cannot {action} a stream using a released reader"))
        })
    }

    // https://streams.spec.whatwg.org/#readable-stream-reader-generic-release
    pub(crate) fn readable_stream_reader_generic_release(&mut self) {
        // Let stream be reader.[[stream]].
        // Assert: stream is not undefined.
        let Some(stream) = self.stream.take() else {
            return;
        };

        let e = Error::invalid_state(
            "Reader was released and can no longer be used to monitor the stream's closedness",
        );
        // If stream.[[state]] is "readable", reject reader.[[closedPromise]] with a TypeError exception.
        if stream.is_readable() {
            self.closed_promise.reject(e);
        } else {
            // Otherwise, set reader.[[closedPromise]] to a promise rejected with a TypeError exception.
            self.closed_promise = ResolveablePromise::rejected_with(e);
        }

        // Perform ! stream.[[controller]].[[ReleaseSteps]]().
        if let Some(controller) = stream.controller() {
            controller.release_steps();
        }

        // Set stream.[[reader]] to undefined.
        stream.inner.borrow_mut().reader = None;

        // Set reader.[[stream]] to undefined.
    }

    /// Release steps for a reader whose last handle is going away. The lock is released exactly
    /// as `release_lock` would, then `error_requests` rejects the reader's pending requests.
    ///
    /// If the stream or its controller is borrowed further up the stack, the release runs as the
    /// next local task instead and the stream stays locked until it does.
    pub(crate) fn release_on_drop(&mut self, error_requests: impl FnOnce(Error) + 'static) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };
        let borrowed = stream.inner.try_borrow_mut().is_err()
            || stream
                .controller()
                .is_some_and(|controller| controller.is_borrowed());

        let mut generic = Self {
            closed_promise: self.closed_promise.clone(),
            stream: self.stream.take(),
        };
        let release = move || {
            generic.readable_stream_reader_generic_release();
            // Let e be a new TypeError exception.
            error_requests(Error::invalid_state("Reader was released"));
        };

        if borrowed {
            tokio::task::spawn_local(async move { release() });
        } else {
            release();
        }
    }
}

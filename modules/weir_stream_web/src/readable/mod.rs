use weir_utils::Error;

use crate::buffer::ArrayBufferView;

mod byob_reader;
mod byob_request;
mod byte_controller;
mod controller;
mod default_controller;
mod default_reader;
mod iterator;
mod pipe;
mod reader;
mod stream;
mod tee;

pub use byob_reader::{
    ByobReadResult, ReadableStreamBYOBReadError, ReadableStreamBYOBReader,
    ReadableStreamBYOBReaderReadOptions,
};
pub use byob_request::ReadableStreamBYOBRequest;
pub use byte_controller::ReadableByteStreamController;
pub use default_controller::ReadableStreamDefaultController;
pub use default_reader::ReadableStreamDefaultReader;
pub use iterator::ReadableStreamValues;
pub use pipe::StreamPipeOptions;
pub use reader::{ReadableStreamGetReaderOptions, ReadableStreamReader, ReaderMode};
pub use stream::{EmptySource, ReadableStream, UnderlyingByteSource, UnderlyingSource};

pub(crate) use controller::ReadableStreamController;
pub(crate) use stream::{
    CancelAlgorithm, PullAlgorithm, ReadableStreamState, StartAlgorithm,
};

/// The outcome of a single read: a chunk, or `done` once the stream has closed.
///
/// A BYOB read on a closed stream still hands back its (empty) view in `value` so the caller gets
/// its buffer back.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadableStreamReadResult<T> {
    pub value: Option<T>,
    pub done: bool,
}

impl<T> ReadableStreamReadResult<T> {
    pub(crate) fn chunk(value: T) -> Self {
        Self {
            value: Some(value),
            done: false,
        }
    }

    pub(crate) fn done(value: Option<T>) -> Self {
        Self { value, done: true }
    }
}

// https://streams.spec.whatwg.org/#read-request
pub(crate) trait ReadableStreamReadRequest<T> {
    fn chunk_steps(self: Box<Self>, chunk: T);

    fn close_steps(self: Box<Self>);

    fn error_steps(self: Box<Self>, reason: Error);
}

// https://streams.spec.whatwg.org/#read-into-request
pub(crate) trait ReadableStreamReadIntoRequest {
    fn chunk_steps(self: Box<Self>, chunk: ArrayBufferView);

    fn close_steps(self: Box<Self>, chunk: Option<ArrayBufferView>);

    fn error_steps(self: Box<Self>, reason: Error);
}

pub(crate) type BoxedReadRequest<T> = Box<dyn ReadableStreamReadRequest<T>>;
pub(crate) type BoxedReadIntoRequest = Box<dyn ReadableStreamReadIntoRequest>;

//! WHATWG-style readable, writable and transform streams for single-threaded async Rust.
//!
//! Every stream handle is `!Send` and schedules its reactions with `tokio::task::spawn_local`, so
//! streams must be created and driven inside a `tokio::task::LocalSet`.
pub use buffer::{ArrayBufferView, ElementType};
pub use queuing_strategy::{
    ByteLength, ByteLengthQueuingStrategy, CountQueuingStrategy, QueuingStrategy,
};
pub use readable::{
    ByobReadResult, EmptySource, ReadableByteStreamController, ReadableStream,
    ReadableStreamBYOBReadError, ReadableStreamBYOBReader, ReadableStreamBYOBReaderReadOptions,
    ReadableStreamBYOBRequest,
    ReadableStreamDefaultController, ReadableStreamDefaultReader, ReadableStreamGetReaderOptions,
    ReadableStreamReadResult, ReadableStreamReader, ReadableStreamValues, ReaderMode,
    StreamPipeOptions, UnderlyingByteSource, UnderlyingSource,
};
pub use readable_writable_pair::ReadableWritablePair;
pub use transform::{
    IdentityTransformer, TransformStream, TransformStreamDefaultController, Transformer,
};
pub use writable::{
    DiscardSink, UnderlyingSink, WritableStream, WritableStreamDefaultController,
    WritableStreamDefaultWriter,
};
pub use weir_abort::{AbortController, AbortSignal};
pub use weir_utils::{Error, Promise, Result};

mod buffer;
mod queuing_strategy;
mod readable;
mod readable_writable_pair;
mod transform;
mod utils;
mod writable;

use crate::{readable::ReadableStream, transform::TransformStream, writable::WritableStream};

/// A pair of linked streams: chunks of `I` go into `writable` and chunks of `O` come out of
/// `readable`.
/// https://streams.spec.whatwg.org/#dictdef-readablewritablepair
pub struct ReadableWritablePair<I: 'static, O: 'static> {
    pub readable: ReadableStream<O>,
    pub writable: WritableStream<I>,
}

impl<I: 'static, O: 'static> ReadableWritablePair<I, O> {
    pub fn new(writable: WritableStream<I>, readable: ReadableStream<O>) -> Self {
        Self { readable, writable }
    }
}

impl<I: 'static, O: 'static> From<&TransformStream<I, O>> for ReadableWritablePair<I, O> {
    fn from(stream: &TransformStream<I, O>) -> Self {
        Self {
            readable: stream.readable(),
            writable: stream.writable(),
        }
    }
}

impl<I: 'static, O: 'static> From<TransformStream<I, O>> for ReadableWritablePair<I, O> {
    fn from(stream: TransformStream<I, O>) -> Self {
        Self::from(&stream)
    }
}

use bytes::{Bytes, BytesMut};

use super::QueuingStrategy;
use crate::buffer::ArrayBufferView;

/// Chunks that know how many bytes they carry.
pub trait ByteLength {
    fn byte_length(&self) -> usize;
}

impl ByteLength for ArrayBufferView {
    fn byte_length(&self) -> usize {
        ArrayBufferView::byte_length(self)
    }
}

impl ByteLength for Vec<u8> {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for Bytes {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for BytesMut {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

impl ByteLength for String {
    fn byte_length(&self) -> usize {
        self.len()
    }
}

/// Sizes every chunk by its byte length.
/// https://streams.spec.whatwg.org/#blqs-class
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        // Set this.[[highWaterMark]] to init["highWaterMark"].
        Self { high_water_mark }
    }

    // readonly attribute unrestricted double highWaterMark;
    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    pub fn size<T: ByteLength>(&self, chunk: &T) -> f64 {
        chunk.byte_length() as f64
    }
}

impl<T: ByteLength + 'static> From<ByteLengthQueuingStrategy> for QueuingStrategy<T> {
    fn from(value: ByteLengthQueuingStrategy) -> Self {
        QueuingStrategy::new(value.high_water_mark)
            .with_size(|chunk: &T| chunk.byte_length() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_chunks_by_byte_length() {
        let strategy: QueuingStrategy<Bytes> = ByteLengthQueuingStrategy::new(16.0).into();
        let size = strategy.extract_size_algorithm();
        assert_eq!(size.call(&Bytes::from_static(b"four")), Ok(4.0));
        assert_eq!(strategy.high_water_mark(), Some(16.0));
    }
}

use bytes::Bytes;
use weir_utils::{Error, Result};

/// The element type of a typed view, which fixes its element size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementType {
    Int8,
    #[default]
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
    DataView,
}

impl ElementType {
    pub fn element_size(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 | Self::Uint8Clamped | Self::DataView => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Float64 | Self::BigInt64 | Self::BigUint64 => 8,
        }
    }
}

/// An owned byte buffer together with the window `(byte_offset, byte_length)` a view exposes.
///
/// Handing a view to a byte stream moves the whole buffer into the stream, which is how buffer
/// transfer works here: the previous owner cannot touch the bytes afterwards. Reads hand the same
/// buffer back out with a new window.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArrayBufferView {
    buffer: Vec<u8>,
    byte_offset: usize,
    byte_length: usize,
    element_type: ElementType,
}

impl ArrayBufferView {
    /// A `Uint8` view over the whole of `buffer`.
    pub fn new(buffer: Vec<u8>) -> Self {
        let byte_length = buffer.len();
        Self {
            buffer,
            byte_offset: 0,
            byte_length,
            element_type: ElementType::Uint8,
        }
    }

    /// A zero-filled `Uint8` view of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    /// A typed view of `length` elements starting at `byte_offset`.
    pub fn with_element_type(
        element_type: ElementType,
        buffer: Vec<u8>,
        byte_offset: usize,
        length: usize,
    ) -> Result<Self> {
        let element_size = element_type.element_size();
        if byte_offset % element_size != 0 {
            return Err(Error::out_of_range(format!(
                "start offset of {element_type:?}Array should be a multiple of {element_size}"
            )));
        }
        let byte_length = length
            .checked_mul(element_size)
            .ok_or_else(|| Error::out_of_range("Invalid typed array length"))?;
        Self::checked(element_type, buffer, byte_offset, byte_length)
    }

    pub(crate) fn checked(
        element_type: ElementType,
        buffer: Vec<u8>,
        byte_offset: usize,
        byte_length: usize,
    ) -> Result<Self> {
        match byte_offset.checked_add(byte_length) {
            Some(end) if end <= buffer.len() => Ok(Self {
                buffer,
                byte_offset,
                byte_length,
                element_type,
            }),
            _ => Err(Error::out_of_range("Invalid typed array length")),
        }
    }

    /// Builds a view whose window the caller has already checked against `buffer`.
    pub(crate) fn from_parts(
        element_type: ElementType,
        buffer: Vec<u8>,
        byte_offset: usize,
        byte_length: usize,
    ) -> Self {
        debug_assert!(byte_offset + byte_length <= buffer.len());
        Self {
            buffer,
            byte_offset,
            byte_length,
            element_type,
        }
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// Number of elements in the view.
    pub fn len(&self) -> usize {
        self.byte_length / self.element_size()
    }

    pub fn is_empty(&self) -> bool {
        self.byte_length == 0
    }

    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    pub fn element_size(&self) -> usize {
        self.element_type.element_size()
    }

    /// Length of the whole underlying buffer, not just the viewed window.
    pub fn buffer_byte_length(&self) -> usize {
        self.buffer.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.byte_offset..self.byte_offset + self.byte_length]
    }

    /// Gives the whole underlying buffer back, discarding the window.
    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    /// The viewed bytes as [`Bytes`], without copying.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.buffer).slice(self.byte_offset..self.byte_offset + self.byte_length)
    }

    pub(crate) fn into_parts(self) -> (Vec<u8>, usize, usize, ElementType) {
        (
            self.buffer,
            self.byte_offset,
            self.byte_length,
            self.element_type,
        )
    }
}

impl From<Vec<u8>> for ArrayBufferView {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<&[u8]> for ArrayBufferView {
    fn from(value: &[u8]) -> Self {
        Self::new(value.to_vec())
    }
}

impl From<Bytes> for ArrayBufferView {
    fn from(value: Bytes) -> Self {
        Self::new(value.to_vec())
    }
}

impl AsRef<[u8]> for ArrayBufferView {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_views_validate_alignment_and_bounds() {
        let view =
            ArrayBufferView::with_element_type(ElementType::Uint16, vec![0; 8], 2, 3).unwrap();
        assert_eq!(view.byte_length(), 6);
        assert_eq!(view.len(), 3);
        assert_eq!(view.buffer_byte_length(), 8);

        assert!(ArrayBufferView::with_element_type(ElementType::Uint16, vec![0; 8], 1, 1).is_err());
        assert!(ArrayBufferView::with_element_type(ElementType::Uint32, vec![0; 8], 4, 2).is_err());
    }

    #[test]
    fn into_bytes_keeps_only_the_window() {
        let view =
            ArrayBufferView::checked(ElementType::Uint8, b"hello world".to_vec(), 6, 5).unwrap();
        assert_eq!(view.as_bytes(), b"world");
        assert_eq!(view.into_bytes(), Bytes::from_static(b"world"));
    }
}

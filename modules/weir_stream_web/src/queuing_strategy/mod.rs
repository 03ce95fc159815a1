use std::{fmt, rc::Rc};

use weir_utils::{Error, Result};

pub use byte_length::{ByteLength, ByteLengthQueuingStrategy};
pub use count::CountQueuingStrategy;

mod byte_length;
mod count;

pub(crate) type SizeFunction<T> = Rc<dyn Fn(&T) -> Result<f64>>;

/// QueuingStrategy describes how backpressure should be signalled: once the total size of queued
/// chunks reaches `high_water_mark`, the stream reports that it wants no more.
/// https://streams.spec.whatwg.org/#qs-api
pub struct QueuingStrategy<T> {
    // unrestricted double highWaterMark;
    high_water_mark: Option<f64>,
    // callback QueuingStrategySize = unrestricted double (any chunk);
    size: Option<SizeFunction<T>>,
}

impl<T> Clone for QueuingStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            high_water_mark: self.high_water_mark,
            size: self.size.clone(),
        }
    }
}

impl<T> Default for QueuingStrategy<T> {
    fn default() -> Self {
        Self {
            high_water_mark: None,
            size: None,
        }
    }
}

impl<T> fmt::Debug for QueuingStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .field("size", &self.size.as_ref().map(|_| "<function>"))
            .finish()
    }
}

impl<T> QueuingStrategy<T> {
    pub fn new(high_water_mark: f64) -> Self {
        Self {
            high_water_mark: Some(high_water_mark),
            size: None,
        }
    }

    pub fn with_high_water_mark(mut self, high_water_mark: f64) -> Self {
        self.high_water_mark = Some(high_water_mark);
        self
    }

    pub fn with_size(self, size: impl Fn(&T) -> f64 + 'static) -> Self {
        self.with_fallible_size(move |chunk| Ok(size(chunk)))
    }

    /// A size function that may fail; a failure errors the stream the chunk was enqueued on.
    pub fn with_fallible_size(mut self, size: impl Fn(&T) -> Result<f64> + 'static) -> Self {
        self.size = Some(Rc::new(size));
        self
    }

    pub fn high_water_mark(&self) -> Option<f64> {
        self.high_water_mark
    }

    pub(crate) fn has_size(&self) -> bool {
        self.size.is_some()
    }

    // https://streams.spec.whatwg.org/#validate-and-normalize-high-water-mark
    pub(crate) fn extract_high_water_mark(&self, default_hwm: f64) -> Result<f64> {
        match self.high_water_mark {
            // If strategy["highWaterMark"] does not exist, return defaultHWM.
            None => Ok(default_hwm),
            // Let highWaterMark be strategy["highWaterMark"].
            // If highWaterMark is NaN or highWaterMark < 0, throw a RangeError exception.
            Some(high_water_mark) if high_water_mark.is_nan() || high_water_mark < 0.0 => {
                Err(Error::out_of_range("Invalid highWaterMark"))
            },
            // Return highWaterMark.
            Some(high_water_mark) => Ok(high_water_mark),
        }
    }

    // https://streams.spec.whatwg.org/#make-size-algorithm-from-size-function
    pub(crate) fn extract_size_algorithm(&self) -> SizeAlgorithm<T> {
        // If strategy["size"] does not exist, return an algorithm that returns 1.
        match &self.size {
            None => SizeAlgorithm::AlwaysOne,
            Some(size) => SizeAlgorithm::SizeFunction(size.clone()),
        }
    }
}

/// SizeAlgorithm represents the two ways we might generate sizes - by calling a function or by simply returning 1.0 (the default)
pub(crate) enum SizeAlgorithm<T> {
    AlwaysOne,
    SizeFunction(SizeFunction<T>),
}

impl<T> Clone for SizeAlgorithm<T> {
    fn clone(&self) -> Self {
        match self {
            Self::AlwaysOne => Self::AlwaysOne,
            Self::SizeFunction(f) => Self::SizeFunction(f.clone()),
        }
    }
}

impl<T> SizeAlgorithm<T> {
    pub(crate) fn call(&self, chunk: &T) -> Result<f64> {
        match self {
            Self::AlwaysOne => Ok(1.0),
            Self::SizeFunction(f) => f(chunk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_water_mark_defaults_and_validation() {
        let strategy = QueuingStrategy::<u8>::default();
        assert_eq!(strategy.extract_high_water_mark(1.0), Ok(1.0));
        assert_eq!(strategy.extract_high_water_mark(0.0), Ok(0.0));

        assert_eq!(QueuingStrategy::<u8>::new(4.0).extract_high_water_mark(1.0), Ok(4.0));
        for hwm in [-1.0, f64::NAN] {
            let err = QueuingStrategy::<u8>::new(hwm)
                .extract_high_water_mark(1.0)
                .unwrap_err();
            assert!(matches!(err, Error::OutOfRange(_)));
        }
        assert_eq!(
            QueuingStrategy::<u8>::new(f64::INFINITY).extract_high_water_mark(1.0),
            Ok(f64::INFINITY)
        );
    }

    #[test]
    fn size_defaults_to_one() {
        let strategy = QueuingStrategy::<String>::new(10.0);
        assert_eq!(strategy.extract_size_algorithm().call(&"abc".into()), Ok(1.0));

        let strategy = strategy.with_size(|s: &String| s.len() as f64);
        assert_eq!(strategy.extract_size_algorithm().call(&"abc".into()), Ok(3.0));
    }
}

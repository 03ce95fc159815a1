use super::QueuingStrategy;

/// Counts every chunk as size 1.
/// https://streams.spec.whatwg.org/#cqs-class
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub fn new(high_water_mark: f64) -> Self {
        // Set this.[[highWaterMark]] to init["highWaterMark"].
        Self { high_water_mark }
    }

    // readonly attribute unrestricted double highWaterMark;
    pub fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }

    pub fn size<T>(&self, _chunk: &T) -> f64 {
        1.0
    }
}

impl<T> From<CountQueuingStrategy> for QueuingStrategy<T> {
    fn from(value: CountQueuingStrategy) -> Self {
        // no size function, so the stream falls back to SizeAlgorithm::AlwaysOne
        QueuingStrategy::new(value.high_water_mark)
    }
}

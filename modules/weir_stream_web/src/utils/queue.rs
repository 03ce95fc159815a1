use std::collections::VecDeque;

use weir_utils::{Error, Result};

/// QueueWithSizes is present in readable and writable streams and abstracts away certain queue operations
/// https://streams.spec.whatwg.org/#queue-with-sizes
#[derive(Debug)]
pub(crate) struct QueueWithSizes<T> {
    queue: VecDeque<ValueWithSize<T>>,
    queue_total_size: f64,
}

impl<T> Default for QueueWithSizes<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> QueueWithSizes<T> {
    pub(crate) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queue_total_size: 0.0,
        }
    }

    pub(crate) fn enqueue_value_with_size(&mut self, value: T, size: f64) -> Result<()> {
        // If ! IsNonNegativeNumber(size) is false, throw a RangeError exception.
        // If size is +∞, throw a RangeError exception.
        if !is_non_negative_number(size) || size.is_infinite() {
            return Err(Error::out_of_range(
                "Size must be a finite, non-NaN, non-negative number.",
            ));
        }

        // Append a new value-with-size with value value and size size to container.[[queue]].
        self.queue.push_back(ValueWithSize { value, size });

        // Set container.[[queueTotalSize]] to container.[[queueTotalSize]] + size.
        self.queue_total_size += size;

        Ok(())
    }

    pub(crate) fn dequeue_value(&mut self) -> Option<T> {
        // Let valueWithSize be container.[[queue]][0].
        // Remove valueWithSize from container.[[queue]].
        let value_with_size = self.queue.pop_front()?;
        // Set container.[[queueTotalSize]] to container.[[queueTotalSize]] − valueWithSize’s size.
        self.queue_total_size -= value_with_size.size;
        // If container.[[queueTotalSize]] < 0, set container.[[queueTotalSize]] to 0. (This can occur due to rounding errors.)
        if self.queue_total_size < 0.0 {
            self.queue_total_size = 0.0
        }
        Some(value_with_size.value)
    }

    pub(crate) fn peek_queue_value(&self) -> Option<&T> {
        // Let valueWithSize be container.[[queue]][0].
        // Return valueWithSize’s value.
        self.queue.front().map(|v| &v.value)
    }

    pub(crate) fn peek_queue_value_mut(&mut self) -> Option<&mut T> {
        self.queue.front_mut().map(|v| &mut v.value)
    }

    /// Empties the queue. Removed values are dropped, which runs whatever cleanup they own.
    pub(crate) fn reset_queue(&mut self) {
        // Set container.[[queue]] to a new empty list.
        self.queue.clear();
        // Set container.[[queueTotalSize]] to 0.
        self.queue_total_size = 0.0;
    }

    pub(crate) fn queue_total_size(&self) -> f64 {
        self.queue_total_size
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

#[derive(Debug)]
struct ValueWithSize<T> {
    value: T,
    size: f64,
}

fn is_non_negative_number(value: f64) -> bool {
    // If v is NaN, return false.
    // If v < 0, return false.
    !value.is_nan() && value >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_total_matches(queue: &QueueWithSizes<&str>, expected: f64) {
        assert!(queue.queue_total_size() >= 0.0);
        assert!((queue.queue_total_size() - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn total_size_tracks_remaining_entries() {
        let mut queue = QueueWithSizes::new();
        queue.enqueue_value_with_size("a", 1.5).unwrap();
        queue.enqueue_value_with_size("b", 2.0).unwrap();
        queue.enqueue_value_with_size("c", 0.0).unwrap();
        assert_total_matches(&queue, 3.5);
        assert_eq!(queue.peek_queue_value(), Some(&"a"));

        assert_eq!(queue.dequeue_value(), Some("a"));
        assert_total_matches(&queue, 2.0);
        assert_eq!(queue.dequeue_value(), Some("b"));
        assert_eq!(queue.dequeue_value(), Some("c"));
        assert_total_matches(&queue, 0.0);
        assert_eq!(queue.dequeue_value(), None);
    }

    #[test]
    fn rejects_invalid_sizes_without_mutating() {
        let mut queue = QueueWithSizes::new();
        queue.enqueue_value_with_size("a", 1.0).unwrap();

        for size in [-1.0, f64::NAN, f64::INFINITY] {
            let err = queue.enqueue_value_with_size("bad", size).unwrap_err();
            assert!(matches!(err, Error::OutOfRange(_)));
        }
        assert_eq!(queue.len(), 1);
        assert_total_matches(&queue, 1.0);
    }

    #[test]
    fn total_is_clamped_against_rounding() {
        let mut queue = QueueWithSizes::new();
        queue.enqueue_value_with_size("a", 0.1).unwrap();
        queue.enqueue_value_with_size("b", 0.2).unwrap();
        queue.dequeue_value();
        queue.dequeue_value();
        assert!(queue.queue_total_size() >= 0.0);

        queue.enqueue_value_with_size("c", 4.0).unwrap();
        queue.reset_queue();
        assert!(queue.is_empty());
        assert_total_matches(&queue, 0.0);
    }
}

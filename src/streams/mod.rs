pub mod cell;
pub mod error;
pub mod pipe;
pub mod queue;
pub mod readable;

pub use cell::CompletionCell;
pub use error::{StreamError, StreamResult};
pub use pipe::{Destination, DestinationState, PipeOptions, TransformPair};
pub use queue::SizedQueue;
pub use readable::{
    IteratorSource, ReadableStream, ReadableStreamBuilder, Source, StreamController,
    StreamReader, StreamState,
};

/// Backpressure policy for a stream's internal queue.
///
/// Both operations are fallible: a failure from either immediately errors the
/// stream with that failure and is re-raised to the caller that triggered it.
pub trait QueuingStrategy<T> {
    /// Weight assigned to a chunk. Defaults to counting every chunk as 1.
    fn size(&self, _chunk: &T) -> StreamResult<f64> {
        Ok(1.0)
    }

    /// Whether the producer should be throttled at the given total queued
    /// size. The default treats the queue as a single-slot high-water mark.
    fn should_apply_backpressure(&self, total_queue_size: f64) -> StreamResult<bool> {
        Ok(total_queue_size > 1.0)
    }
}

/// The policy used when no strategy is supplied: every chunk weighs 1 and
/// backpressure applies past a total of 1.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultQueuingStrategy;

impl<T> QueuingStrategy<T> for DefaultQueuingStrategy {}

/// Count-based strategy with a configurable high-water mark.
#[derive(Clone, Copy, Debug)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn should_apply_backpressure(&self, total_queue_size: f64) -> StreamResult<bool> {
        Ok(total_queue_size > self.high_water_mark)
    }
}

/// Byte-length strategy for chunks with a byte representation.
#[derive(Clone, Copy, Debug)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl<T: AsRef<[u8]>> QueuingStrategy<T> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &T) -> StreamResult<f64> {
        Ok(chunk.as_ref().len() as f64)
    }

    fn should_apply_backpressure(&self, total_queue_size: f64) -> StreamResult<bool> {
        Ok(total_queue_size > self.high_water_mark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategy_throttles_past_one() {
        let s = DefaultQueuingStrategy;
        assert_eq!(QueuingStrategy::<i32>::size(&s, &7).unwrap(), 1.0);
        assert!(!QueuingStrategy::<i32>::should_apply_backpressure(&s, 1.0).unwrap());
        assert!(QueuingStrategy::<i32>::should_apply_backpressure(&s, 1.5).unwrap());
    }

    #[test]
    fn count_strategy_uses_high_water_mark() {
        let s = CountQueuingStrategy::new(4.0);
        assert!(!QueuingStrategy::<i32>::should_apply_backpressure(&s, 4.0).unwrap());
        assert!(QueuingStrategy::<i32>::should_apply_backpressure(&s, 5.0).unwrap());
    }

    #[test]
    fn byte_length_strategy_weighs_chunks() {
        let s = ByteLengthQueuingStrategy::new(1024.0);
        assert_eq!(s.size(&vec![0u8; 100]).unwrap(), 100.0);
        assert_eq!(s.size(&b"hello".to_vec()).unwrap(), 5.0);
        assert!(QueuingStrategy::<Vec<u8>>::should_apply_backpressure(&s, 2048.0).unwrap());
    }
}

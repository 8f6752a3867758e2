use super::error::{StreamError, StreamResult};
use std::collections::VecDeque;

/// FIFO queue of `(chunk, size)` pairs with an eagerly maintained total size.
///
/// The total is updated on every enqueue/dequeue so `total_size()` is O(1);
/// it snaps back to exactly 0.0 whenever the queue empties so repeated float
/// arithmetic can never leave a residue.
#[derive(Debug)]
pub struct SizedQueue<T> {
    entries: VecDeque<(T, f64)>,
    total_size: f64,
}

impl<T> SizedQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            total_size: 0.0,
        }
    }

    /// Append a chunk with its strategy-assigned size.
    ///
    /// Rejects sizes that are NaN, infinite or negative with
    /// [`StreamError::InvalidSize`] without modifying the queue.
    pub fn enqueue(&mut self, chunk: T, size: f64) -> StreamResult<()> {
        if !size.is_finite() || size < 0.0 {
            return Err(StreamError::InvalidSize(size));
        }
        self.entries.push_back((chunk, size));
        self.total_size += size;
        Ok(())
    }

    /// Remove and return the oldest chunk.
    pub fn dequeue(&mut self) -> StreamResult<T> {
        let (chunk, size) = self.entries.pop_front().ok_or(StreamError::QueueEmpty)?;
        self.total_size -= size;
        if self.entries.is_empty() {
            self.total_size = 0.0;
        }
        Ok(chunk)
    }

    pub fn total_size(&self) -> f64 {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_size = 0.0;
    }
}

impl<T> Default for SizedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

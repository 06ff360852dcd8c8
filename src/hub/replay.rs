//! Bounded replay history for late joiners.

use std::collections::VecDeque;

/// Fixed-capacity FIFO. Pushing onto a full buffer evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct ReplayBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> ReplayBuffer<T> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, returning the evicted one when full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Copy of the contents, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

//! Bounded buffer of payloads that could not be sent yet.

use std::collections::VecDeque;

use serde_json::Value;

/// Default number of payloads kept while the connection is down.
pub const DEFAULT_HISTORY_CAPACITY: usize = 40;

/// A FIFO of unsent payloads. Pushing past capacity evicts the oldest.
#[derive(Debug, Clone)]
pub struct History {
    entries: VecDeque<Value>,
    capacity: usize,
}

impl History {
    /// Creates an empty buffer. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a payload, returning the evicted one if the buffer was full.
    pub fn push(&mut self, payload: Value) -> Option<Value> {
        let evicted = if self.entries.len() == self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(payload);
        evicted
    }

    /// Removes and returns the oldest payload.
    pub fn pop(&mut self) -> Option<Value> {
        self.entries.pop_front()
    }

    /// The oldest payload, left in place.
    pub fn front(&self) -> Option<&Value> {
        self.entries.front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

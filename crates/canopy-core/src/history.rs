//! Bounded FIFO log of relayed envelopes.

use std::collections::VecDeque;

use crate::envelope::Envelope;

/// Default number of retained entries.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Append-only envelope log that evicts its oldest entry when full.
///
/// Length never exceeds the capacity and iteration is insertion order.
#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    entries: VecDeque<Envelope>,
    capacity: usize,
}

impl HistoryBuffer {
    /// Create an empty buffer. A zero capacity is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full.
    pub fn push(&mut self, envelope: Envelope) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(envelope);
    }

    /// The newest `count` entries, oldest first.
    #[must_use]
    pub fn tail(&self, count: usize) -> Vec<Envelope> {
        let skip = self.entries.len().saturating_sub(count);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Every entry, oldest first.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Envelope> {
        self.entries.iter().cloned().collect()
    }

    /// Replace the contents, keeping only the newest `capacity` entries.
    pub fn restore(&mut self, entries: Vec<Envelope>) {
        self.entries.clear();
        for envelope in entries {
            self.push(envelope);
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for HistoryBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

//! Bounded buffer of the most recent events, kept for in-session inspection.

use std::collections::VecDeque;

use crate::event::Event;

/// Fixed-capacity FIFO that evicts the oldest event when full.
///
/// Independent of the upload queues: eviction here never loses data.
#[derive(Debug, Clone)]
pub struct EventRing {
    capacity: usize,
    events: VecDeque<Event>,
    evicted: u64,
}

impl EventRing {
    /// Create a ring holding at most `capacity` events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: VecDeque::with_capacity(capacity.min(4_096)),
            evicted: 0,
        }
    }

    pub fn push(&mut self, event: Event) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
            self.evicted += 1;
        }
        self.events.push_back(event);
    }

    /// Events oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Event> + ExactSizeIterator {
        self.events.iter()
    }

    /// The `n` most recent events, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<&Event> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).collect()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Event> {
        self.events.back()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total events dropped off the front since creation.
    #[must_use]
    pub const fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

//! Bounded keep-oldest FIFO.
//!
//! Backs the bridge's held-audio queue and the provider outage buffer.
//! When full, new items are refused and the queued ones are kept: early
//! audio wins over fresh audio during startup races.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue full; the item was dropped.
    Dropped,
}

#[derive(Debug)]
pub struct BoundedFifo<T> {
    items: VecDeque<T>,
    capacity: usize,
    dropped: u64,
}

impl<T> BoundedFifo<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, item: T) -> PushOutcome {
        if self.items.len() >= self.capacity {
            self.dropped += 1;
            return PushOutcome::Dropped;
        }
        self.items.push_back(item);
        PushOutcome::Queued
    }

    /// Put items back at the head, e.g. after a failed delivery. Order of
    /// `items` is kept and they go in front of anything already queued;
    /// whatever no longer fits is dropped from the tail.
    pub fn requeue_front(&mut self, items: Vec<T>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
        while self.items.len() > self.capacity {
            self.items.pop_back();
            self.dropped += 1;
        }
    }

    /// Take everything queued so far; the queue stays usable.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

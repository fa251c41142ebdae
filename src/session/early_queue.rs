//! Gated FIFO buffer for early arrivals.
//!
//! Negotiation has two windows where messages legitimately show up before
//! the state they depend on exists: locally gathered candidates before the
//! session identifier is assigned, and remote candidates before the remote
//! description is applied. Both are handled by the same small component:
//! items queue until the gate opens, then drain once in insertion order,
//! and everything afterwards passes straight through.

use std::collections::VecDeque;

/// A FIFO queue with an explicit "ready" gate.
#[derive(Debug)]
pub struct EarlyQueue<T> {
    ready: bool,
    items: VecDeque<T>,
}

impl<T> EarlyQueue<T> {
    pub fn new() -> Self {
        Self {
            ready: false,
            items: VecDeque::new(),
        }
    }

    /// Whether the gate has been opened.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Offer an item. Returns `Some(item)` when the gate is open (the
    /// caller processes it immediately), `None` when it was buffered.
    pub fn offer(&mut self, item: T) -> Option<T> {
        if self.ready {
            Some(item)
        } else {
            self.items.push_back(item);
            None
        }
    }

    /// Open the gate and return every buffered item in insertion order.
    /// The buffer is empty afterwards.
    pub fn open(&mut self) -> Vec<T> {
        self.ready = true;
        self.items.drain(..).collect()
    }

    /// Number of buffered items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Discard buffered items and close the gate (session teardown).
    pub fn reset(&mut self) {
        self.ready = false;
        self.items.clear();
    }
}

impl<T> Default for EarlyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_until_open_then_passes_through() {
        let mut q = EarlyQueue::new();
        assert!(q.offer(1).is_none());
        assert!(q.offer(2).is_none());
        assert!(q.offer(3).is_none());

        let drained = q.open();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(q.is_empty());

        // After the gate opens, items pass straight through.
        assert_eq!(q.offer(4), Some(4));
        assert!(q.is_empty());
    }

    #[test]
    fn open_on_empty_queue_is_harmless() {
        let mut q: EarlyQueue<u8> = EarlyQueue::new();
        assert!(q.open().is_empty());
        assert!(q.is_ready());
    }

    #[test]
    fn reset_discards_and_closes() {
        let mut q = EarlyQueue::new();
        q.offer("a");
        let _ = q.open();
        q.reset();
        assert!(!q.is_ready());
        assert!(q.offer("b").is_none());
    }
}

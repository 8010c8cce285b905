//! Pending-request FIFO shared between producers and the event loop.
//!
//! Producers push from any thread; the dispatcher pops from the event-loop
//! thread only. In bounded mode a push against a full queue is rejected
//! under the same lock that checks the size, so the capacity can never be
//! exceeded by racing producers.

use parking_lot::Mutex;
use std::collections::VecDeque;

/// Multi-producer FIFO with an optional capacity.
///
/// A capacity of zero means unbounded.
#[derive(Debug)]
pub(crate) struct PendingQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> PendingQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Enqueues an item; returns false when the queue is bounded and full.
    pub(crate) fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if self.capacity > 0 && inner.len() >= self.capacity {
            return false;
        }
        inner.push_back(item);
        true
    }

    /// Dequeues the oldest item.
    pub(crate) fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fifo_order() {
        let queue = PendingQueue::new(0);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(queue.push(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn bounded_rejects_when_full() {
        let queue = PendingQueue::new(2);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(1));
        assert!(queue.push(3));
    }

    #[test]
    fn zero_capacity_is_unbounded() {
        let queue = PendingQueue::new(0);
        for i in 0..10_000 {
            assert!(queue.push(i));
        }
        assert_eq!(queue.len(), 10_000);
    }

    #[test]
    fn concurrent_producers_never_exceed_capacity() {
        use std::sync::Arc;

        let queue = Arc::new(PendingQueue::new(64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                let mut accepted = 0usize;
                for i in 0..1000 {
                    if queue.push(i) {
                        accepted += 1;
                    }
                }
                accepted
            }));
        }
        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 64);
        assert_eq!(queue.len(), 64);
    }

    proptest! {
        /// Accepted pushes equal pops for every interleaving of a bounded
        /// queue: nothing is lost, nothing is duplicated.
        #[test]
        fn accepted_equals_drained(capacity in 1usize..16, pushes in 0usize..64) {
            let queue = PendingQueue::new(capacity);
            let mut accepted = 0usize;
            for i in 0..pushes {
                if queue.push(i) {
                    accepted += 1;
                }
                prop_assert!(queue.len() <= capacity);
            }
            let mut drained = 0usize;
            while queue.pop().is_some() {
                drained += 1;
            }
            prop_assert_eq!(accepted, drained);
        }
    }
}

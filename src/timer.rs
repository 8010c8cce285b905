//! One-shot deadline timers for the event loop.
//!
//! A [`TimerQueue`] holds pending deadlines in a binary heap and resolves
//! which driver to notify when one fires. Cancellation is lazy: cancelled
//! entries stay in the heap and are skipped when they surface.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Identifies one armed timer. Tokens are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Destination of a fired timer: the owning driver and its private tag.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerBinding {
    pub driver: usize,
    pub tag: u64,
}

/// Min-heap of one-shot deadlines with lazy cancellation.
#[derive(Debug, Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    live: HashMap<u64, TimerBinding>,
    next_id: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arms a timer firing `after` from now, owned by `driver`.
    pub(crate) fn arm(&mut self, after: Duration, driver: usize, tag: u64) -> TimerToken {
        let id = self.next_id;
        self.next_id += 1;
        let deadline = Instant::now() + after;
        self.heap.push(Reverse((deadline, id)));
        self.live.insert(id, TimerBinding { driver, tag });
        TimerToken(id)
    }

    /// Cancels a timer; firing a cancelled token is a no-op.
    pub(crate) fn cancel(&mut self, token: TimerToken) {
        self.live.remove(&token.0);
    }

    /// Removes every live timer owned by `driver`.
    pub(crate) fn cancel_driver(&mut self, driver: usize) {
        self.live.retain(|_, binding| binding.driver != driver);
    }

    /// Earliest live deadline, if any.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.live.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops the next timer whose deadline is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<TimerBinding> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();
            if let Some(binding) = self.live.remove(&id) {
                return Some(binding);
            }
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

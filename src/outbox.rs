//! Buffering of outbound membership events.
//!
//! Local joins and leaves are queued here and flushed to every connected
//! peer in batches on a short interval. The queue is lock-free so the hot
//! join/leave path never blocks on the flush loop.

use crossbeam_queue::SegQueue;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::message::MembershipEvent;

/// Queue of membership events awaiting a gossip flush.
///
/// Bounded by `max_size`; when full, new events are dropped and counted.
/// Peers that missed dropped events recover the state from the next full
/// snapshot exchange.
#[derive(Debug)]
pub struct EventOutbox {
    queue: SegQueue<MembershipEvent>,
    len: AtomicUsize,
    max_size: usize,
    accepting: AtomicBool,
    dropped: AtomicU64,
}

impl EventOutbox {
    /// Create an outbox holding at most `max_size` events.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            len: AtomicUsize::new(0),
            max_size,
            accepting: AtomicBool::new(true),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue an event for the next flush.
    ///
    /// Returns false if the outbox is stopped or full.
    pub fn push(&self, event: MembershipEvent) -> bool {
        if !self.accepting.load(Ordering::Acquire) {
            return false;
        }
        if self.len.load(Ordering::Relaxed) >= self.max_size {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.queue.push(event);
        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Drain up to `max` events in arrival order.
    pub fn pop_batch(&self, max: usize) -> SmallVec<[MembershipEvent; 16]> {
        let mut batch = SmallVec::new();
        while batch.len() < max {
            match self.queue.pop() {
                Some(event) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    batch.push(event);
                }
                None => break,
            }
        }
        batch
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the outbox is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped because the outbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting new events. Used during shutdown.
    pub fn stop(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Discard all queued events.
    pub fn clear(&self) {
        while self.queue.pop().is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

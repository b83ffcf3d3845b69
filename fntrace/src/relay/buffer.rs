use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

use crate::interface::EventRecord;

/// Fixed-capacity buffer between the producing threads and the relay worker.
///
/// Slots are allocated once up front; pushing never allocates and never waits for the consumer.
/// A push that finds the buffer full drops the record and counts it.
pub(crate) struct EventBuffer {
    queue: ArrayQueue<EventRecord>,
    dropped: AtomicU64,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        EventBuffer {
            queue: ArrayQueue::new(capacity),
            dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn push(&self, record: EventRecord) -> bool {
        match self.queue.push(record) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Consumer side. Only the relay worker pops.
    #[inline]
    pub fn pop(&self) -> Option<EventRecord> {
        self.queue.pop()
    }

    /// Records dropped since the buffer was created.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::detect::DetectionBatch;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// A batch waiting for delivery.
#[derive(Clone, Debug)]
pub struct QueuedBatch {
    pub batch: DetectionBatch,
    pub enqueued_at: Instant,
}

/// Bounded FIFO that evicts its oldest entry to admit a new one when full.
///
/// Critical sections cover push/pop only; callers serialize and send after
/// the entry has left the queue.
pub struct EventQueue {
    capacity: usize,
    entries: Mutex<VecDeque<QueuedBatch>>,
}

impl EventQueue {
    /// `capacity` of 0 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedBatch>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `batch`. Returns the entry evicted to make room, if any.
    pub fn push(&self, batch: DetectionBatch) -> Option<QueuedBatch> {
        let entry = QueuedBatch {
            batch,
            enqueued_at: Instant::now(),
        };
        let mut entries = self.lock();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        entries.push_back(entry);
        evicted
    }

    pub fn pop(&self) -> Option<QueuedBatch> {
        self.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything still queued. Returns how many entries were discarded.
    pub fn clear(&self) -> usize {
        let mut entries = self.lock();
        let discarded = entries.len();
        entries.clear();
        discarded
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

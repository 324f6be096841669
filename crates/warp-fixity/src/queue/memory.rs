//! In-memory work queue

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::{QueueItem, WorkQueue};
use crate::error::Result;

/// Work queue kept in process memory, optionally bounded
#[derive(Debug, Default)]
pub struct MemoryWorkQueue {
    items: Mutex<VecDeque<QueueItem>>,
    capacity: Option<usize>,
}

impl MemoryWorkQueue {
    /// Create an unbounded queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue refusing items beyond `capacity`
    pub fn bounded(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: Some(capacity),
        }
    }

    /// Snapshot of waiting items, oldest first
    pub fn items(&self) -> Vec<QueueItem> {
        self.items.lock().iter().copied().collect()
    }
}

impl WorkQueue for MemoryWorkQueue {
    fn enqueue(&self, item: QueueItem) -> Result<bool> {
        let mut items = self.items.lock();
        if self.capacity.is_some_and(|cap| items.len() >= cap) {
            return Ok(false);
        }
        items.push_back(item);
        Ok(true)
    }

    fn dequeue(&self) -> Result<Option<QueueItem>> {
        Ok(self.items.lock().pop_front())
    }

    fn depth(&self) -> Result<u64> {
        Ok(self.items.lock().len() as u64)
    }
}

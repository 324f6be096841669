//! Background work queue
//!
//! ```text
//! ┌──────────────┐ admit  ┌───────────┐ dequeue ┌─────────────┐
//! │ RecordStore  │───────▶│ WorkQueue │────────▶│ QueueWorker │
//! │ (due, not    │        └───────────┘         └──────┬──────┘
//! │  queued)     │◀──── queued_at cleared on completion ┘
//! └──────────────┘◀──── reclaim: stale markers cleared
//! ```
//!
//! A record's `queued_at` marker is set before its item is enqueued, which
//! keeps a record from being admitted twice. Markers of items lost with a dead
//! worker are recovered by [`QueueGate::reclaim`].

mod gate;
mod memory;
mod sled_queue;
mod worker;

pub use gate::{QueueGate, SATURATION_FACTOR};
pub use memory::MemoryWorkQueue;
pub use sled_queue::SledWorkQueue;
pub use worker::{DrainReport, QueueWorker, WorkOutcome};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::{ObjectId, RecordId, Timestamp};

/// One unit of queued work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Record to check
    pub record_id: RecordId,
    /// Object of the record
    pub object_id: ObjectId,
    /// Admission time, equal to the record's marker
    pub queued_at: Timestamp,
}

/// FIFO work queue shared by the admission gate and the workers
pub trait WorkQueue: Send + Sync + fmt::Debug {
    /// Add an item. Returns false if the queue refused it.
    fn enqueue(&self, item: QueueItem) -> Result<bool>;

    /// Take the oldest item
    fn dequeue(&self) -> Result<Option<QueueItem>>;

    /// Items currently waiting
    fn depth(&self) -> Result<u64>;
}

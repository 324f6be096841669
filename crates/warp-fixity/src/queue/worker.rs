//! Queue item processing

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{QueueItem, WorkQueue};
use crate::error::Result;
use crate::record::FixityRecord;
use crate::service::{CheckOutcome, FixityService};

/// What happened to a queue item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The object was checked
    Checked(FixityRecord),
    /// The last check is still current; the marker was cleared
    Skipped,
    /// The object is gone; its record was deleted
    Removed,
    /// The record no longer exists
    Discarded,
}

/// Counters for one drain of the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items checked
    pub checked: u64,
    /// Items skipped
    pub skipped: u64,
    /// Records removed with their objects
    pub removed: u64,
    /// Items whose record had gone
    pub discarded: u64,
    /// Items that failed; their markers await reclaim
    pub errors: u64,
}

impl DrainReport {
    /// Items taken off the queue
    pub fn processed(&self) -> u64 {
        self.checked + self.skipped + self.removed + self.discarded + self.errors
    }

    /// Add another report's counters
    pub fn merge(&mut self, other: &DrainReport) {
        self.checked += other.checked;
        self.skipped += other.skipped;
        self.removed += other.removed;
        self.discarded += other.discarded;
        self.errors += other.errors;
    }
}

/// Processes queue items through a [`FixityService`]
#[derive(Debug, Clone)]
pub struct QueueWorker {
    service: Arc<FixityService>,
}

impl QueueWorker {
    /// Create a worker
    pub fn new(service: Arc<FixityService>) -> Self {
        Self { service }
    }

    /// Process one item.
    ///
    /// On error the record keeps its queue marker until it is reclaimed.
    pub fn process(&self, item: &QueueItem) -> Result<WorkOutcome> {
        let store = self.service.store();
        let Some(record) = store.load(item.record_id)? else {
            debug!(record_id = item.record_id, "Queued record no longer exists");
            return Ok(WorkOutcome::Discarded);
        };

        if !self.service.objects().exists(record.object_id())? {
            store.delete(record.id())?;
            self.service.metrics().record_removed();
            info!(
                record_id = record.id(),
                object_id = %record.object_id(),
                "Object is gone, deleted its fixity record"
            );
            return Ok(WorkOutcome::Removed);
        }

        let pass = self.service.pass()?;
        match self.service.check_with(&pass, record.object_id(), false)? {
            CheckOutcome::Performed(record) => Ok(WorkOutcome::Checked(record)),
            CheckOutcome::Skipped(record) => {
                store.clear_queued(record.id())?;
                Ok(WorkOutcome::Skipped)
            }
        }
    }

    /// Process up to `max` items from `queue`.
    ///
    /// Item failures are counted and logged; only queue errors abort the drain.
    pub fn drain(&self, queue: &dyn WorkQueue, max: usize) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        while (report.processed() as usize) < max {
            let Some(item) = queue.dequeue()? else {
                break;
            };
            match self.process(&item) {
                Ok(WorkOutcome::Checked(_)) => report.checked += 1,
                Ok(WorkOutcome::Skipped) => report.skipped += 1,
                Ok(WorkOutcome::Removed) => report.removed += 1,
                Ok(WorkOutcome::Discarded) => report.discarded += 1,
                Err(e) => {
                    report.errors += 1;
                    self.service.metrics().record_error();
                    warn!(record_id = item.record_id, error = %e, "Queued fixity check failed");
                }
            }
        }
        Ok(report)
    }
}

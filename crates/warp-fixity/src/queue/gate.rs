//! Admission control over the work queue

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{QueueItem, WorkQueue};
use crate::error::{Error, Result};
use crate::record::{FixityRecord, Timestamp};
use crate::schedule::SchedulingPass;
use crate::store::{RecordFilter, RecordStore};

/// Admission stops while the queue holds this many multiples of the per-call limit
pub const SATURATION_FACTOR: u64 = 10;

/// Stamps records and feeds them to the work queue under a depth ceiling
#[derive(Debug, Clone)]
pub struct QueueGate {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn WorkQueue>,
}

impl QueueGate {
    /// Create a gate between `store` and `queue`
    pub fn new(store: Arc<dyn RecordStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    /// The gated queue
    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    /// Admit up to `limit` of `candidates`, stamping each with `now`.
    ///
    /// Returns 0 without touching anything while the queue depth is at or
    /// above [`SATURATION_FACTOR`] × `limit`. Candidates that are already
    /// queued are passed over.
    pub fn admit(&self, candidates: &[FixityRecord], limit: usize, now: Timestamp) -> Result<u64> {
        let ceiling = SATURATION_FACTOR.saturating_mul(limit as u64);
        let depth = self.queue.depth()?;
        if depth >= ceiling {
            debug!(depth, ceiling, "Work queue saturated, admitting nothing");
            return Ok(0);
        }

        let mut admitted = 0u64;
        for record in candidates {
            if admitted as usize >= limit {
                break;
            }
            if !self.store.mark_queued(record.id(), now)? {
                continue;
            }
            let item = QueueItem {
                record_id: record.id(),
                object_id: record.object_id(),
                queued_at: now,
            };
            match self.queue.enqueue(item) {
                Ok(true) => admitted += 1,
                Ok(false) => {
                    self.store.clear_queued(record.id())?;
                    warn!(record_id = record.id(), "Work queue refused item, stopping admission");
                    break;
                }
                Err(e) => {
                    self.store.clear_queued(record.id())?;
                    return Err(Error::Queue(format!(
                        "enqueue of record {} failed: {e}",
                        record.id()
                    )));
                }
            }
        }

        if admitted > 0 {
            info!(admitted, depth = depth + admitted, "Admitted fixity checks to work queue");
        }
        Ok(admitted)
    }

    /// Admit up to `limit` periodic records that are due in `pass` and not queued
    pub fn admit_due(&self, pass: &SchedulingPass, limit: usize) -> Result<u64> {
        let ceiling = SATURATION_FACTOR.saturating_mul(limit as u64);
        if self.queue.depth()? >= ceiling {
            return Ok(0);
        }
        let filter = RecordFilter::due(pass.threshold).queued(false);
        let candidates = self.store.list(&filter, 0, limit)?;
        self.admit(&candidates, limit, pass.now)
    }

    /// Clear queue markers set before `older_than` so the records can be
    /// admitted again
    pub fn reclaim(&self, older_than: Timestamp) -> Result<u64> {
        let reclaimed = self.store.clear_queued_before(older_than)?;
        if reclaimed > 0 {
            info!(reclaimed, older_than, "Reclaimed stale queue markers");
        }
        Ok(reclaimed)
    }
}

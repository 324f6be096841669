//! Fixity service
//!
//! [`FixityService`] ties a record store, an object source, the verifier and
//! the scheduling policy together. Batch runs and queue workers are thin
//! drivers over [`FixityService::check_with`].

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::candidates::{CandidateSource, SourceRegistry};
use crate::clock::{Clock, SystemClock};
use crate::config::FixityConfig;
use crate::error::{Error, Result};
use crate::hash::{HashVerifier, VerificationOutcome};
use crate::metrics::FixityMetrics;
use crate::record::{FixityRecord, FixityState, ObjectId, RecordDraft, RecordId, Revision, RevisionId, Timestamp};
use crate::schedule::{SchedulingPass, SchedulingPolicy};
use crate::source::ObjectSource;
use crate::stats::FixityStats;
use crate::store::RecordStore;

/// Result of a check request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The check ran; the record is at its new current revision
    Performed(FixityRecord),
    /// The last check is still current; nothing was written
    Skipped(FixityRecord),
}

impl CheckOutcome {
    /// The record in either case
    pub fn record(&self) -> &FixityRecord {
        match self {
            Self::Performed(record) | Self::Skipped(record) => record,
        }
    }

    /// Whether the check ran
    pub fn was_performed(&self) -> bool {
        matches!(self, Self::Performed(_))
    }
}

/// Entry point for checking objects and managing their records
#[derive(Debug)]
pub struct FixityService {
    config: FixityConfig,
    store: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectSource>,
    verifier: HashVerifier,
    policy: SchedulingPolicy,
    clock: Arc<dyn Clock>,
    sources: SourceRegistry,
    metrics: Arc<FixityMetrics>,
}

impl FixityService {
    /// Create a service from validated configuration
    pub fn new(
        config: FixityConfig,
        store: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectSource>,
    ) -> Result<Self> {
        config.validate()?;
        let verifier = HashVerifier::new(config.algorithm_set()?);
        let policy = SchedulingPolicy::new(config.interval()?);
        Ok(Self {
            config,
            store,
            objects,
            verifier,
            policy,
            clock: Arc::new(SystemClock),
            sources: SourceRegistry::new(),
            metrics: Arc::new(FixityMetrics::new()),
        })
    }

    /// Use a different time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a candidate source
    pub fn with_source(mut self, source: Arc<dyn CandidateSource>) -> Self {
        self.sources.register(source);
        self
    }

    /// Share a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<FixityMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Configuration
    pub fn config(&self) -> &FixityConfig {
        &self.config
    }

    /// Record store
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Object source
    pub fn objects(&self) -> &Arc<dyn ObjectSource> {
        &self.objects
    }

    /// Time source
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Arc<FixityMetrics> {
        &self.metrics
    }

    /// Registered candidate sources
    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Scheduling policy
    pub fn policy(&self) -> &SchedulingPolicy {
        &self.policy
    }

    /// Start a scheduling pass at the current time
    pub fn pass(&self) -> Result<SchedulingPass> {
        self.policy.pass(self.clock.now())
    }

    /// Load the record of `object`, creating it when missing
    pub fn get_or_create(&self, object: ObjectId) -> Result<FixityRecord> {
        if let Some(record) = self.store.load_by_object(object)? {
            return Ok(record);
        }
        match self.store.save(RecordDraft::create(object)) {
            Ok(record) => {
                debug!(object_id = %object, record_id = record.id(), "Tracking new object");
                Ok(record)
            }
            // lost a creation race: the other writer's record is the one
            Err(e) if e.is_invariant_violation() => self
                .store
                .load_by_object(object)?
                .ok_or(e),
            Err(e) => Err(e),
        }
    }

    /// Check an object at the current time
    pub fn check(&self, object: ObjectId, force: bool) -> Result<CheckOutcome> {
        let pass = self.pass()?;
        self.check_with(&pass, object, force)
    }

    /// Check an object within a scheduling pass.
    ///
    /// Records checked after the pass threshold are skipped unless `force`.
    /// A previously performed record gains a new revision; an unperformed
    /// one is completed in place.
    pub fn check_with(&self, pass: &SchedulingPass, object: ObjectId, force: bool) -> Result<CheckOutcome> {
        let record = self.get_or_create(object)?;
        if !pass.should_check(&record, force) {
            debug!(object_id = %object, record_id = record.id(), "Check skipped, last result is current");
            self.metrics.record_skip();
            return Ok(CheckOutcome::Skipped(record));
        }

        let started = Instant::now();
        let outcome = self.verify(object)?;
        let performed_at = self.clock.now();
        let record = match self.record_result(&record, outcome.state, performed_at) {
            Ok(record) => record,
            Err(Error::Conflict { .. }) => {
                // another writer recorded a check first; its result stands
                let current = self.get_or_create(object)?;
                if !pass.should_check(&current, force) {
                    debug!(object_id = %object, record_id = current.id(), "Concurrent check already recorded");
                    self.metrics.record_skip();
                    return Ok(CheckOutcome::Skipped(current));
                }
                self.record_result(&current, outcome.state, performed_at)?
            }
            Err(e) => return Err(e),
        };
        self.metrics.record_check(record.state(), started.elapsed());

        if record.passed() {
            info!(
                object_id = %object,
                record_id = record.id(),
                revision_id = record.revision_id(),
                "Fixity check passed"
            );
        } else {
            error!(
                object_id = %object,
                record_id = record.id(),
                revision_id = record.revision_id(),
                state = %record.state(),
                algorithm = ?outcome.algorithm,
                "Fixity check failed"
            );
        }
        Ok(CheckOutcome::Performed(record))
    }

    /// Classify an object without recording the result
    pub fn verify(&self, object: ObjectId) -> Result<VerificationOutcome> {
        let recorded = self.objects.recorded_checksums(object)?;
        let stream = self.objects.open(object)?;
        Ok(self.verifier.verify(stream, &recorded))
    }

    /// Record a check result on `record`, opening a new revision when the
    /// record was performed before
    pub fn record_result(
        &self,
        record: &FixityRecord,
        state: FixityState,
        performed_at: Timestamp,
    ) -> Result<FixityRecord> {
        let mut draft = record.edit();
        if record.was_performed() {
            draft.new_revision();
        }
        draft.set_state(state).set_performed_at(performed_at);
        self.store.save(draft)
    }

    /// Delete a historical revision
    pub fn delete_revision(&self, record_id: RecordId, revision_id: RevisionId) -> Result<()> {
        self.store.delete_revision(record_id, revision_id)?;
        info!(record_id, revision_id, "Deleted fixity check revision");
        Ok(())
    }

    /// Revision history of a record, newest first
    pub fn revisions(&self, record_id: RecordId) -> Result<Vec<Revision>> {
        self.store.revisions(record_id)
    }

    /// Enable or disable periodic checks for an object
    pub fn set_periodic(&self, object: ObjectId, periodic: bool) -> Result<FixityRecord> {
        let record = self.get_or_create(object)?;
        if record.periodic() == periodic {
            return Ok(record);
        }
        self.store.set_periodic(record.id(), periodic)?;
        self.store
            .load(record.id())?
            .ok_or_else(|| Error::Precondition(format!("record {} was deleted", record.id())))
    }

    /// Disable periodic checks on every record
    pub fn clear_periodic(&self) -> Result<u64> {
        let cleared = self.store.clear_periodic()?;
        info!(cleared, "Disabled periodic checks");
        Ok(cleared)
    }

    /// Enrol up to `limit` candidates of a source in periodic checks
    pub fn enable_source(&self, id: &str, limit: usize) -> Result<u64> {
        let source = self.sources.get(id)?;
        let mut enrolled = 0u64;
        while (enrolled as usize) < limit {
            let chunk = (limit - enrolled as usize).min(self.config.source_chunk);
            let candidates = source.candidates(self.store.as_ref(), chunk)?;
            if candidates.is_empty() {
                break;
            }
            let before = enrolled;
            for object in candidates {
                if self.set_periodic(object, true)?.periodic() {
                    enrolled += 1;
                }
            }
            if enrolled == before {
                break;
            }
        }
        if enrolled > 0 {
            self.metrics.record_enrolled(enrolled);
            info!(source = id, enrolled, "Enabled periodic checks from source");
        }
        Ok(enrolled)
    }

    /// Enrol candidates of every configured source, up to `limit` per source
    pub fn enable_sources(&self, limit: usize) -> Result<u64> {
        let mut enrolled = 0;
        for id in &self.config.sources {
            enrolled += self.enable_source(id, limit)?;
        }
        Ok(enrolled)
    }

    /// Statistics at the current time
    pub fn stats(&self) -> Result<FixityStats> {
        FixityStats::collect(self.store.as_ref(), self.pass()?.threshold)
    }

    /// When `record` is next due, `None` if it is not periodic
    pub fn scheduled(&self, record: &FixityRecord) -> Result<Option<Timestamp>> {
        Ok(self.pass()?.next_run_at(record))
    }
}

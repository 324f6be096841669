//! Chunked batch runs
//!
//! ```text
//!            ┌─────────┐  periodic only  ┌──────────┐
//!  start ───▶│ Sources │────────────────▶│  Chunks  │◀──┐
//!            └─────────┘  all enrolled   └────┬─────┘   │ advanced
//!                                             │ page ───┘
//!                                  empty /    ▼
//!                                  stalled ┌──────────┐
//!                                          │ Finished │
//!                                          └──────────┘
//! ```
//!
//! A run is driven one [`BatchRun::step`] at a time. After each step the
//! [`BatchCheckpoint`] can be persisted and later handed to
//! [`BatchOrchestrator::resume`]. Chunk counters are merged only once the
//! chunk's cursor commit succeeds, so an interrupted chunk is redone rather
//! than counted twice.

mod results;

pub use results::BatchResults;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cursor::{CursorKind, CursorState, PopulationCursor, Progress};
use crate::error::{Error, Result};
use crate::record::ObjectId;
use crate::schedule::SchedulingPass;
use crate::service::{CheckOutcome, FixityService};

/// What a batch run works on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BatchMode {
    /// Check a caller-supplied list of objects
    Fixed {
        /// Objects to check, in order
        ids: Vec<ObjectId>,
        /// Check even when the last result is current
        force: bool,
    },
    /// Enrol candidate sources, then check every due periodic record
    Periodic {
        /// Check even when the last result is current
        force: bool,
    },
    /// Create records for untracked objects
    Generate,
}

/// Why a run finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Nothing was left to process
    Exhausted,
    /// A processed chunk did not shrink the population
    Stalled,
}

/// Position of a run in its state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum BatchPhase {
    /// Enrolling candidate sources, `next` indexes the configured list
    Sources {
        /// Source to enrol next
        next: usize,
    },
    /// Processing chunks
    Chunks,
    /// Done
    Finished {
        /// Why the run stopped
        termination: Termination,
    },
}

/// Resumable state of a batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCheckpoint {
    /// What the run works on
    pub mode: BatchMode,
    /// Where the run is
    pub phase: BatchPhase,
    /// Scheduling pass fixed when the run started, absent for generate runs
    pub pass: Option<SchedulingPass>,
    /// Committed cursor position; an index into the id list for fixed runs
    pub cursor: CursorState,
    /// Counters so far
    pub results: BatchResults,
}

impl BatchCheckpoint {
    /// Whether the run has finished
    pub fn is_finished(&self) -> bool {
        matches!(self.phase, BatchPhase::Finished { .. })
    }

    /// How the run finished, if it has
    pub fn termination(&self) -> Option<Termination> {
        match self.phase {
            BatchPhase::Finished { termination } => Some(termination),
            _ => None,
        }
    }

    /// End-of-run lines for the mode of this run
    pub fn summary(&self) -> Vec<String> {
        match self.mode {
            BatchMode::Generate => self.results.generation_summary(),
            _ => self.results.summary(),
        }
    }
}

/// Creates and resumes batch runs
#[derive(Debug, Clone)]
pub struct BatchOrchestrator {
    service: Arc<FixityService>,
    batch_size: usize,
}

impl BatchOrchestrator {
    /// Create an orchestrator using the configured batch size
    pub fn new(service: Arc<FixityService>) -> Self {
        let batch_size = service.config().batch_size;
        Self {
            service,
            batch_size,
        }
    }

    /// Override the chunk size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Objects per chunk
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Check a fixed list of objects
    pub fn fixed(&self, ids: Vec<ObjectId>, force: bool) -> Result<BatchRun> {
        let pass = self.service.pass()?;
        let cursor = CursorState {
            offset: 0,
            remaining_estimate: ids.len() as u64,
        };
        info!(objects = ids.len(), force, "Starting fixity batch over object list");
        Ok(self.run(BatchCheckpoint {
            mode: BatchMode::Fixed { ids, force },
            phase: BatchPhase::Chunks,
            pass: Some(pass),
            cursor,
            results: BatchResults::new(),
        }))
    }

    /// Enrol the configured candidate sources and check every due periodic
    /// record
    pub fn periodic(&self, force: bool) -> Result<BatchRun> {
        let sources = &self.service.config().sources;
        if sources.is_empty() {
            return Err(Error::Config(
                "no candidate sources configured for periodic checks".into(),
            ));
        }
        self.service.sources().resolve(sources.as_slice())?;
        let pass = self.service.pass()?;
        info!(
            sources = sources.len(),
            threshold = pass.threshold,
            force,
            "Starting periodic fixity batch"
        );
        Ok(self.run(BatchCheckpoint {
            mode: BatchMode::Periodic { force },
            phase: BatchPhase::Sources { next: 0 },
            pass: Some(pass),
            cursor: CursorState::default(),
            results: BatchResults::new(),
        }))
    }

    /// Create records for every untracked object
    pub fn generate(&self) -> Result<BatchRun> {
        let cursor = self.cursor(CursorKind::Missing).start()?;
        info!(missing = cursor.remaining_estimate, "Starting fixity record generation");
        Ok(self.run(BatchCheckpoint {
            mode: BatchMode::Generate,
            phase: BatchPhase::Chunks,
            pass: None,
            cursor,
            results: BatchResults::new(),
        }))
    }

    /// Continue a run from a saved checkpoint
    pub fn resume(&self, checkpoint: BatchCheckpoint) -> Result<BatchRun> {
        if checkpoint.pass.is_none() && !matches!(checkpoint.mode, BatchMode::Generate) {
            return Err(Error::Precondition(
                "checkpoint of a check run has no scheduling pass".into(),
            ));
        }
        debug!(phase = ?checkpoint.phase, offset = checkpoint.cursor.offset, "Resuming fixity batch");
        Ok(self.run(checkpoint))
    }

    fn run(&self, checkpoint: BatchCheckpoint) -> BatchRun {
        BatchRun {
            service: self.service.clone(),
            batch_size: self.batch_size,
            checkpoint,
        }
    }

    fn cursor(&self, kind: CursorKind) -> PopulationCursor {
        PopulationCursor::new(kind, self.service.store().clone(), self.service.objects().clone())
    }
}

/// A batch run in progress
#[derive(Debug)]
pub struct BatchRun {
    service: Arc<FixityService>,
    batch_size: usize,
    checkpoint: BatchCheckpoint,
}

impl BatchRun {
    /// Current state
    pub fn checkpoint(&self) -> &BatchCheckpoint {
        &self.checkpoint
    }

    /// Take the final state
    pub fn into_checkpoint(self) -> BatchCheckpoint {
        self.checkpoint
    }

    /// Counters so far
    pub fn results(&self) -> &BatchResults {
        &self.checkpoint.results
    }

    /// Whether the run has finished
    pub fn is_finished(&self) -> bool {
        self.checkpoint.is_finished()
    }

    /// Run one step: enrol one chunk of a source, or process one chunk.
    ///
    /// Returns the termination once the run is finished. On error the
    /// checkpoint is unchanged and the step can be retried.
    pub fn step(&mut self) -> Result<Option<Termination>> {
        match self.checkpoint.phase {
            BatchPhase::Finished { termination } => Ok(Some(termination)),
            BatchPhase::Sources { next } => {
                self.enrol_source(next)?;
                Ok(None)
            }
            BatchPhase::Chunks => {
                let progress = match self.checkpoint.mode.clone() {
                    BatchMode::Fixed { ids, force } => self.fixed_chunk(&ids, force)?,
                    BatchMode::Periodic { force } => self.periodic_chunk(force)?,
                    BatchMode::Generate => self.generate_chunk()?,
                };
                let termination = match progress {
                    Progress::Advanced => return Ok(None),
                    Progress::Exhausted => Termination::Exhausted,
                    Progress::Stalled => Termination::Stalled,
                };
                self.finish(termination);
                Ok(Some(termination))
            }
        }
    }

    /// Step until finished
    pub fn run(&mut self) -> Result<Termination> {
        loop {
            if let Some(termination) = self.step()? {
                return Ok(termination);
            }
        }
    }

    fn finish(&mut self, termination: Termination) {
        self.checkpoint.phase = BatchPhase::Finished { termination };
        let results = &self.checkpoint.results;
        match termination {
            Termination::Exhausted => info!(
                successful = results.successful,
                failed = results.failed,
                skipped = results.skipped,
                ignored = results.ignored,
                errors = results.error_count(),
                "Fixity batch finished"
            ),
            Termination::Stalled => warn!(
                successful = results.successful,
                failed = results.failed,
                remaining = self.checkpoint.cursor.remaining_estimate,
                "Fixity batch stopped, last chunk made no progress"
            ),
        }
    }

    fn enrol_source(&mut self, next: usize) -> Result<()> {
        let sources = &self.service.config().sources;
        let Some(id) = sources.get(next) else {
            let cursor = self.pass_cursor()?;
            self.checkpoint.cursor = cursor.start()?;
            self.checkpoint.phase = BatchPhase::Chunks;
            debug!(due = self.checkpoint.cursor.remaining_estimate, "Sources enrolled");
            return Ok(());
        };

        let advance = match self.service.enable_source(id, self.batch_size) {
            Ok(enrolled) => enrolled == 0,
            Err(e) => {
                // a failing source is abandoned so the run cannot loop on it
                warn!(source = %id, error = %e, "Candidate source failed");
                let max = self.max_diagnostics();
                self.checkpoint
                    .results
                    .record_error(format!("Encountered an exception: {e}"), max);
                true
            }
        };
        if advance {
            self.checkpoint.phase = BatchPhase::Sources { next: next + 1 };
        }
        Ok(())
    }

    fn fixed_chunk(&mut self, ids: &[ObjectId], force: bool) -> Result<Progress> {
        let pass = self.pass()?;
        let start = (self.checkpoint.cursor.offset as usize).min(ids.len());
        let end = (start + self.batch_size).min(ids.len());
        if start == end {
            return Ok(Progress::Exhausted);
        }

        let mut chunk = BatchResults::new();
        for &object in &ids[start..end] {
            match self.service.objects().exists(object) {
                Ok(true) => self.check(&pass, object, force, &mut chunk),
                Ok(false) => {
                    debug!(object_id = %object, "Requested object does not exist");
                    chunk.ignored += 1;
                }
                Err(e) => self.object_failed(object, &e, &mut chunk),
            }
        }

        self.commit(
            chunk,
            CursorState {
                offset: end as u64,
                remaining_estimate: (ids.len() - end) as u64,
            },
        );
        debug!(start, end, total = ids.len(), "Processed fixity chunk");
        Ok(Progress::Advanced)
    }

    fn periodic_chunk(&mut self, force: bool) -> Result<Progress> {
        let pass = self.pass()?;
        let cursor = self.pass_cursor()?;
        let page = cursor.page(&self.checkpoint.cursor, self.batch_size)?;

        let mut chunk = BatchResults::new();
        for item in &page {
            self.check(&pass, item.object_id, force, &mut chunk);
        }

        let (state, progress) = cursor.commit(&self.checkpoint.cursor, &page)?;
        self.commit(chunk, state);
        Ok(progress)
    }

    fn generate_chunk(&mut self) -> Result<Progress> {
        let cursor = PopulationCursor::new(
            CursorKind::Missing,
            self.service.store().clone(),
            self.service.objects().clone(),
        );
        let page = cursor.page(&self.checkpoint.cursor, self.batch_size)?;

        let mut chunk = BatchResults::new();
        for item in &page {
            match self.service.get_or_create(item.object_id) {
                Ok(_) => chunk.successful += 1,
                Err(e) => self.object_failed(item.object_id, &e, &mut chunk),
            }
        }

        let (state, progress) = cursor.commit(&self.checkpoint.cursor, &page)?;
        self.commit(chunk, state);
        Ok(progress)
    }

    fn check(&self, pass: &SchedulingPass, object: ObjectId, force: bool, chunk: &mut BatchResults) {
        match self.service.check_with(pass, object, force) {
            Ok(CheckOutcome::Performed(record)) if record.passed() => chunk.successful += 1,
            Ok(CheckOutcome::Performed(_)) => chunk.failed += 1,
            Ok(CheckOutcome::Skipped(_)) => chunk.skipped += 1,
            Err(e) => self.object_failed(object, &e, chunk),
        }
    }

    fn object_failed(&self, object: ObjectId, error: &Error, chunk: &mut BatchResults) {
        warn!(object_id = %object, error = %error, "Fixity batch item failed");
        self.service.metrics().record_error();
        chunk.failed += 1;
        chunk.record_error(format!("Encountered an exception: {error}"), self.max_diagnostics());
    }

    fn commit(&mut self, chunk: BatchResults, cursor: CursorState) {
        let max = self.max_diagnostics();
        self.checkpoint.results.merge(chunk, max);
        self.checkpoint.cursor = cursor;
    }

    fn pass(&self) -> Result<SchedulingPass> {
        self.checkpoint
            .pass
            .ok_or_else(|| Error::Internal("check run without a scheduling pass".into()))
    }

    fn pass_cursor(&self) -> Result<PopulationCursor> {
        let pass = self.pass()?;
        Ok(PopulationCursor::new(
            CursorKind::PeriodicDue {
                threshold: pass.threshold,
            },
            self.service.store().clone(),
            self.service.objects().clone(),
        ))
    }

    fn max_diagnostics(&self) -> usize {
        self.service.config().max_diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::candidates::AllObjectsSource;
    use crate::clock::{Clock, ManualClock};
    use crate::config::FixityConfig;
    use crate::hash::{AlgorithmSet, Checksums};
    use crate::record::FixityState;
    use crate::source::{MemoryObjectSource, ObjectSource};
    use crate::store::{MemoryRecordStore, RecordFilter};

    const NOW: i64 = 1_700_000_000;

    /// Object source whose listing can be switched off
    #[derive(Debug)]
    struct UnreliableListing {
        inner: Arc<MemoryObjectSource>,
        failing: AtomicBool,
    }

    impl ObjectSource for UnreliableListing {
        fn list_after(&self, after: u64, limit: usize) -> Result<Vec<ObjectId>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Storage("catalogue unavailable".into()));
            }
            self.inner.list_after(after, limit)
        }

        fn count(&self) -> Result<u64> {
            self.inner.count()
        }

        fn exists(&self, id: ObjectId) -> Result<bool> {
            self.inner.exists(id)
        }

        fn open(&self, id: ObjectId) -> Result<Option<Box<dyn Read + Send>>> {
            self.inner.open(id)
        }

        fn recorded_checksums(&self, id: ObjectId) -> Result<Checksums> {
            self.inner.recorded_checksums(id)
        }
    }

    fn setup(objects: u64) -> (Arc<FixityService>, Arc<MemoryObjectSource>, Arc<ManualClock>) {
        let source = Arc::new(MemoryObjectSource::new());
        for id in 1..=objects {
            source.insert_with_digests(ObjectId(id), vec![id as u8; 32], &AlgorithmSet::default());
        }
        let clock = Arc::new(ManualClock::new(NOW));
        let config = FixityConfig {
            batch_size: 2,
            sources: vec!["all".into()],
            ..FixityConfig::default()
        };
        let service = FixityService::new(config, Arc::new(MemoryRecordStore::new()), source.clone())
            .unwrap()
            .with_clock(clock.clone())
            .with_source(Arc::new(AllObjectsSource::new("all", source.clone())));
        (Arc::new(service), source, clock)
    }

    #[test]
    fn test_fixed_run_counts_outcomes() {
        let (service, objects, _) = setup(4);
        objects.set_content(ObjectId(2), b"tampered".to_vec());
        service.check(ObjectId(3), false).unwrap();

        let orchestrator = BatchOrchestrator::new(service);
        let mut run = orchestrator
            .fixed(vec![ObjectId(1), ObjectId(2), ObjectId(3), ObjectId(99), ObjectId(4)], false)
            .unwrap();
        assert_eq!(run.run().unwrap(), Termination::Exhausted);

        let results = run.results();
        assert_eq!(results.successful, 2);
        assert_eq!(results.failed, 1);
        assert_eq!(results.skipped, 1);
        assert_eq!(results.ignored, 1);
        assert_eq!(run.checkpoint().cursor.offset, 5);
        assert_eq!(run.checkpoint().summary()[0], "Processed 5 items in total.");
    }

    #[test]
    fn test_fixed_run_steps_in_chunks() {
        let (service, _, _) = setup(5);
        let ids = (1..=5).map(ObjectId).collect();
        let mut run = BatchOrchestrator::new(service).fixed(ids, true).unwrap();

        assert_eq!(run.step().unwrap(), None);
        assert_eq!(run.checkpoint().cursor.offset, 2);
        assert_eq!(run.checkpoint().cursor.remaining_estimate, 3);
        assert_eq!(run.step().unwrap(), None);
        assert_eq!(run.step().unwrap(), None);
        assert_eq!(run.step().unwrap(), Some(Termination::Exhausted));
        assert_eq!(run.results().successful, 5);
        assert!(run.is_finished());
        assert_eq!(run.step().unwrap(), Some(Termination::Exhausted));
    }

    #[test]
    fn test_empty_fixed_list_finishes() {
        let (service, _, _) = setup(0);
        let mut run = BatchOrchestrator::new(service).fixed(Vec::new(), false).unwrap();
        assert_eq!(run.run().unwrap(), Termination::Exhausted);
        assert_eq!(run.results().processed(), 0);
    }

    #[test]
    fn test_periodic_run_enrols_then_checks() {
        let (service, _, clock) = setup(5);
        let orchestrator = BatchOrchestrator::new(service.clone());
        let mut run = orchestrator.periodic(false).unwrap();
        assert_eq!(run.run().unwrap(), Termination::Exhausted);
        assert_eq!(run.results().successful, 5);

        let store = service.store();
        assert_eq!(store.count(&RecordFilter::all().periodic(true)).unwrap(), 5);
        assert_eq!(
            store.count(&RecordFilter::all().state(FixityState::Match)).unwrap(),
            5
        );

        // nothing is due again until the threshold passes
        clock.advance(60);
        let mut run = orchestrator.periodic(false).unwrap();
        assert_eq!(run.run().unwrap(), Termination::Exhausted);
        assert_eq!(run.results().processed(), 0);

        clock.set(NOW + 40 * 86_400);
        let mut run = orchestrator.periodic(false).unwrap();
        run.run().unwrap();
        assert_eq!(run.results().successful, 5);
        assert!(store
            .list(&RecordFilter::all(), 0, 10)
            .unwrap()
            .iter()
            .all(|r| r.performed_at() == clock.now()));
    }

    #[test]
    fn test_periodic_requires_sources() {
        let objects = Arc::new(MemoryObjectSource::new());
        let service = FixityService::new(
            FixityConfig::default(),
            Arc::new(MemoryRecordStore::new()),
            objects,
        )
        .unwrap();
        let orchestrator = BatchOrchestrator::new(Arc::new(service));
        assert!(matches!(orchestrator.periodic(false), Err(Error::Config(_))));
    }

    #[test]
    fn test_generate_creates_missing_records() {
        let (service, _, _) = setup(5);
        service.get_or_create(ObjectId(3)).unwrap();

        let mut run = BatchOrchestrator::new(service.clone()).generate().unwrap();
        assert_eq!(run.checkpoint().cursor.remaining_estimate, 4);
        assert_eq!(run.run().unwrap(), Termination::Exhausted);
        assert_eq!(run.results().successful, 4);
        assert_eq!(service.store().count(&RecordFilter::all()).unwrap(), 5);
        assert_eq!(
            run.checkpoint().summary(),
            vec!["Processed 4 items in total.", "4 were successful.", "0 failed."]
        );
    }

    #[test]
    fn test_failed_page_leaves_checkpoint_unchanged() {
        let inner = Arc::new(MemoryObjectSource::new());
        for id in 1..=5 {
            inner.insert_with_digests(ObjectId(id), vec![id as u8], &AlgorithmSet::default());
        }
        let objects = Arc::new(UnreliableListing {
            inner,
            failing: AtomicBool::new(false),
        });
        let config = FixityConfig {
            batch_size: 2,
            ..FixityConfig::default()
        };
        let service = Arc::new(
            FixityService::new(config, Arc::new(MemoryRecordStore::new()), objects.clone())
                .unwrap(),
        );
        let orchestrator = BatchOrchestrator::new(service.clone());
        let mut run = orchestrator.generate().unwrap();
        assert_eq!(run.step().unwrap(), None);
        let before = run.checkpoint().clone();
        assert_eq!(before.results.successful, 2);

        objects.failing.store(true, Ordering::SeqCst);
        assert!(matches!(run.step(), Err(Error::Enumeration(_))));
        assert!(matches!(run.step(), Err(Error::Enumeration(_))));
        assert_eq!(run.checkpoint(), &before);
        assert_eq!(service.store().count(&RecordFilter::all()).unwrap(), 2);

        // the catalogue recovers: resume from the saved checkpoint
        objects.failing.store(false, Ordering::SeqCst);
        let mut resumed = orchestrator.resume(before).unwrap();
        assert_eq!(resumed.run().unwrap(), Termination::Exhausted);
        assert_eq!(resumed.results().successful, 5);
        assert_eq!(resumed.results().failed, 0);
        assert_eq!(resumed.checkpoint().cursor.offset, 5);
        assert_eq!(service.store().count(&RecordFilter::all()).unwrap(), 5);
    }

    #[test]
    fn test_checkpoint_resumes() {
        let (service, _, _) = setup(5);
        let orchestrator = BatchOrchestrator::new(service.clone());
        let mut run = orchestrator.generate().unwrap();
        run.step().unwrap();
        let json = serde_json::to_string(run.checkpoint()).unwrap();

        let checkpoint: BatchCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(checkpoint.results.successful, 2);
        let mut resumed = orchestrator.resume(checkpoint).unwrap();
        assert_eq!(resumed.run().unwrap(), Termination::Exhausted);
        assert_eq!(resumed.results().successful, 5);
    }

    #[test]
    fn test_resume_rejects_check_run_without_pass() {
        let (service, _, _) = setup(0);
        let checkpoint = BatchCheckpoint {
            mode: BatchMode::Periodic { force: false },
            phase: BatchPhase::Chunks,
            pass: None,
            cursor: CursorState::default(),
            results: BatchResults::new(),
        };
        assert!(matches!(
            BatchOrchestrator::new(service).resume(checkpoint),
            Err(Error::Precondition(_))
        ));
    }
}

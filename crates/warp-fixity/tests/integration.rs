//! End-to-end tests for warp-fixity
//!
//! These tests drive the engine through its public surface against both
//! record store backends, a filesystem object source and the daemon.

use std::io::Read;
use std::sync::Arc;

use tempfile::TempDir;

use warp_fixity::{
    AllObjectsSource, AlgorithmSet, BatchOrchestrator, Checksums, Clock, Error, FixityConfig,
    FixityDaemon, FixityService, FixityState, FsObjectSource, HashAlgorithm, ManualClock,
    MemoryObjectSource, MemoryRecordStore, MemoryWorkQueue, ObjectId, ObjectSource, QueueGate,
    QueueItem, RecordFilter, RecordStore, Result, SledRecordStore, SledWorkQueue, Termination,
    WorkQueue, SATURATION_FACTOR,
};

const NOW: i64 = 1_700_000_000;
const DAY: i64 = 86_400;

/// Engine wired to an in-memory object source and a manual clock
struct TestEngine {
    service: Arc<FixityService>,
    objects: Arc<MemoryObjectSource>,
    clock: Arc<ManualClock>,
    _temp_dir: Option<TempDir>,
}

impl TestEngine {
    fn new(store: Arc<dyn RecordStore>, config: FixityConfig) -> Self {
        Self::with_dir(store, config, None)
    }

    fn with_dir(store: Arc<dyn RecordStore>, config: FixityConfig, dir: Option<TempDir>) -> Self {
        let objects = Arc::new(MemoryObjectSource::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let service = FixityService::new(config, store, objects.clone())
            .unwrap()
            .with_clock(clock.clone())
            .with_source(Arc::new(AllObjectsSource::new("all", objects.clone())));
        Self {
            service: Arc::new(service),
            objects,
            clock,
            _temp_dir: dir,
        }
    }

    fn memory() -> Self {
        Self::new(Arc::new(MemoryRecordStore::new()), config())
    }

    fn sled() -> Self {
        let dir = TempDir::new().unwrap();
        let store = SledRecordStore::open(dir.path().join("records")).unwrap();
        Self::with_dir(Arc::new(store), config(), Some(dir))
    }

    fn add(&self, id: u64, content: &[u8]) {
        self.objects
            .insert_with_digests(ObjectId(id), content.to_vec(), &AlgorithmSet::default());
    }
}

fn config() -> FixityConfig {
    FixityConfig {
        threshold: "-30 days".into(),
        batch_size: 3,
        sources: vec!["all".into()],
        queue_limit: 5,
        ..FixityConfig::default()
    }
}

// =============================================================================
// Check lifecycle
// =============================================================================

fn check_lifecycle(engine: TestEngine) {
    let object = ObjectId(7);
    engine.add(7, b"the quick brown fox");
    let store = engine.service.store();
    assert!(store.load_by_object(object).unwrap().is_none());

    // first check completes the new record in place
    let first = engine.service.check(object, false).unwrap();
    assert!(first.was_performed());
    let record = first.record().clone();
    assert_eq!(record.state(), FixityState::Match);
    assert!(record.performed_at() > 0);
    assert_eq!(engine.service.revisions(record.id()).unwrap().len(), 1);

    // still current: skipped, nothing written
    engine.clock.advance(DAY);
    let skipped = engine.service.check(object, false).unwrap();
    assert!(!skipped.was_performed());
    assert_eq!(engine.service.revisions(record.id()).unwrap().len(), 1);

    // forced: new revision, state recomputed
    let forced = engine.service.check(object, true).unwrap();
    assert!(forced.was_performed());
    assert_eq!(forced.record().state(), FixityState::Match);
    assert!(forced.record().revision_id() > record.revision_id());
    assert_eq!(forced.record().performed_at(), NOW + DAY);

    // content changes, threshold passes
    engine.objects.set_content(object, b"the quick brown cat".to_vec());
    engine.clock.advance(31 * DAY);
    let changed = engine.service.check(object, false).unwrap();
    assert_eq!(changed.record().state(), FixityState::Mismatch);

    let history = engine.service.revisions(record.id()).unwrap();
    let states: Vec<_> = history.iter().map(|r| r.state).collect();
    assert_eq!(
        states,
        vec![FixityState::Mismatch, FixityState::Match, FixityState::Match]
    );

    // history can be pruned, the current revision cannot
    engine
        .service
        .delete_revision(record.id(), history[2].revision_id)
        .unwrap();
    assert!(matches!(
        engine.service.delete_revision(record.id(), history[0].revision_id),
        Err(Error::Precondition(_))
    ));
    assert_eq!(store.count_revisions().unwrap(), 2);
}

#[test]
fn test_check_lifecycle_memory() {
    check_lifecycle(TestEngine::memory());
}

#[test]
fn test_check_lifecycle_sled() {
    check_lifecycle(TestEngine::sled());
}

#[test]
fn test_sled_records_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("records");
    let record_id = {
        let store = Arc::new(SledRecordStore::open(&path).unwrap());
        let engine = TestEngine::new(store.clone(), config());
        engine.add(1, b"persist me");
        let outcome = engine.service.check(ObjectId(1), false).unwrap();
        engine.service.set_periodic(ObjectId(1), true).unwrap();
        store.flush().unwrap();
        outcome.record().id()
    };

    let store = SledRecordStore::open(&path).unwrap();
    let record = store.load(record_id).unwrap().unwrap();
    assert_eq!(record.object_id(), ObjectId(1));
    assert_eq!(record.state(), FixityState::Match);
    assert!(record.periodic());
}

// =============================================================================
// Filesystem source
// =============================================================================

#[test]
fn test_filesystem_source_end_to_end() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("objects");
    std::fs::create_dir_all(root.join("nested")).unwrap();
    std::fs::write(root.join("a.bin"), b"alpha").unwrap();
    std::fs::write(root.join("nested/b.bin"), b"beta").unwrap();

    let sha = |data: &[u8]| HashAlgorithm::Sha256.digest_hex(data);
    let manifest = serde_json::json!({
        "objects": {
            "1": { "path": "a.bin", "checksums": { "sha256": sha(b"alpha") } },
            "2": { "path": "nested/b.bin", "checksums": { "SHA256": sha(b"not beta").to_uppercase() } },
            "3": { "path": "gone.bin", "checksums": { "sha256": sha(b"gamma") } },
            "4": { "path": "a.bin" }
        }
    });
    let manifest_path = dir.path().join("manifest.json");
    std::fs::write(&manifest_path, manifest.to_string()).unwrap();

    let objects = Arc::new(FsObjectSource::from_manifest_file(&root, &manifest_path).unwrap());
    assert_eq!(objects.count().unwrap(), 4);
    let listed: Vec<_> = objects.list_all().collect::<Result<_>>().unwrap();
    assert_eq!(listed, (1..=4).map(ObjectId).collect::<Vec<_>>());
    let mut content = String::new();
    objects
        .open(ObjectId(2))
        .unwrap()
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content, "beta");

    let service = FixityService::new(config(), Arc::new(MemoryRecordStore::new()), objects).unwrap();
    let state = |id| service.check(ObjectId(id), false).unwrap().record().state();
    assert_eq!(state(1), FixityState::Match);
    assert_eq!(state(2), FixityState::Mismatch);
    assert_eq!(state(3), FixityState::ObjectMissing);
    assert_eq!(state(4), FixityState::ChecksumMissing);
}

#[test]
fn test_manifest_rejects_escaping_paths() {
    let json = r#"{ "objects": { "1": { "path": "../outside.bin" } } }"#;
    assert!(matches!(
        warp_fixity::Manifest::from_json(json),
        Err(Error::Config(_))
    ));
}

// =============================================================================
// Batch runs
// =============================================================================

/// Catalogue that lists objects but cannot report their checksums
#[derive(Debug)]
struct OfflineCatalogue {
    inner: MemoryObjectSource,
}

impl ObjectSource for OfflineCatalogue {
    fn list_after(&self, after: u64, limit: usize) -> Result<Vec<ObjectId>> {
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

    fn recorded_checksums(&self, _id: ObjectId) -> Result<Checksums> {
        Err(Error::Storage("checksum catalogue offline".into()))
    }
}

#[test]
fn test_periodic_batch_stops_when_stalled() {
    let inner = MemoryObjectSource::new();
    for id in 1..=10 {
        inner.insert(ObjectId(id), vec![id as u8], Checksums::new());
    }
    let objects = Arc::new(OfflineCatalogue { inner });
    let service = FixityService::new(config(), Arc::new(MemoryRecordStore::new()), objects.clone())
        .unwrap()
        .with_clock(Arc::new(ManualClock::new(NOW)))
        .with_source(Arc::new(AllObjectsSource::new("all", objects)));
    let service = Arc::new(service);

    let mut run = BatchOrchestrator::new(service.clone()).periodic(false).unwrap();
    assert_eq!(run.run().unwrap(), Termination::Stalled);

    // one chunk was attempted, every item failed, and the run gave up
    let results = run.results();
    assert_eq!(results.failed, 3);
    assert_eq!(results.successful, 0);
    assert_eq!(results.errors.len(), 3);
    assert!(results.errors[0].starts_with("Encountered an exception:"));
    assert_eq!(run.checkpoint().cursor.remaining_estimate, 10);
    assert_eq!(
        service
            .store()
            .count(&RecordFilter::all().periodic(true))
            .unwrap(),
        10
    );
}

#[test]
fn test_generate_then_periodic_batch() {
    let engine = TestEngine::memory();
    for id in 1..=8 {
        engine.add(id, format!("object {id}").as_bytes());
    }
    engine.objects.set_content(ObjectId(5), b"bitrot".to_vec());

    let orchestrator = BatchOrchestrator::new(engine.service.clone());
    let mut generate = orchestrator.generate().unwrap();
    assert_eq!(generate.run().unwrap(), Termination::Exhausted);
    assert_eq!(generate.results().successful, 8);
    assert_eq!(
        generate.checkpoint().summary(),
        vec!["Processed 8 items in total.", "8 were successful.", "0 failed."]
    );

    let mut periodic = orchestrator.periodic(false).unwrap();
    assert_eq!(periodic.run().unwrap(), Termination::Exhausted);
    let results = periodic.results();
    assert_eq!(results.successful, 7);
    assert_eq!(results.failed, 1);

    let stats = engine.service.stats().unwrap();
    assert_eq!(stats.periodic.total, 8);
    assert_eq!(stats.periodic.current, 8);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.states.get(&FixityState::Mismatch), Some(&1));
}

#[test]
fn test_fixed_batch_resumes_from_checkpoint() {
    let engine = TestEngine::sled();
    for id in 1..=7 {
        engine.add(id, &[id as u8; 64]);
    }
    let ids: Vec<_> = (1..=9).map(ObjectId).collect();
    let orchestrator = BatchOrchestrator::new(engine.service.clone());

    let mut run = orchestrator.fixed(ids, false).unwrap();
    run.step().unwrap();
    let saved = serde_json::to_string(run.checkpoint()).unwrap();
    drop(run);

    let mut resumed = orchestrator
        .resume(serde_json::from_str(&saved).unwrap())
        .unwrap();
    assert_eq!(resumed.run().unwrap(), Termination::Exhausted);
    let results = resumed.results();
    assert_eq!(results.successful, 7);
    assert_eq!(results.ignored, 2);
    assert_eq!(
        resumed.checkpoint().summary()[..3],
        ["Processed 9 items in total.", "7 were successful.", "2 were ignored."]
    );
}

// =============================================================================
// Work queue
// =============================================================================

#[test]
fn test_queue_admission_ceiling() {
    let engine = TestEngine::memory();
    for id in 1..=5 {
        engine.add(id, b"queued");
        engine.service.set_periodic(ObjectId(id), true).unwrap();
    }
    let queue = Arc::new(MemoryWorkQueue::new());
    let gate = QueueGate::new(engine.service.store().clone(), queue.clone());

    let limit = 2;
    for n in 0..SATURATION_FACTOR * limit as u64 {
        queue
            .enqueue(QueueItem {
                record_id: 1_000 + n,
                object_id: ObjectId(1_000 + n),
                queued_at: NOW,
            })
            .unwrap();
    }
    let pass = engine.service.pass().unwrap();
    assert_eq!(gate.admit_due(&pass, limit).unwrap(), 0);
    assert_eq!(gate.admit_due(&pass, limit).unwrap(), 0);

    queue.dequeue().unwrap();
    assert_eq!(gate.admit_due(&pass, limit).unwrap(), 2);
}

#[tokio::test]
async fn test_daemon_tick_over_sled() {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(sled::open(dir.path().join("fixity")).unwrap());
    let store = Arc::new(SledRecordStore::from_db(db.clone()).unwrap());
    let queue = Arc::new(SledWorkQueue::from_db(db).unwrap());
    let engine = TestEngine::new(store, config());
    for id in 1..=8 {
        engine.add(id, format!("payload {id}").as_bytes());
    }
    let daemon = FixityDaemon::new(engine.service.clone(), queue.clone());

    let first = daemon.tick().await.unwrap();
    assert_eq!(first.enrolled, 8);
    assert_eq!(first.admitted, 5);
    assert_eq!(first.drained.checked, 5);

    // an object vanishes before its turn
    engine.objects.remove(ObjectId(8));
    let second = daemon.tick().await.unwrap();
    assert_eq!(second.admitted, 3);
    assert_eq!(second.drained.checked, 2);
    assert_eq!(second.drained.removed, 1);
    assert_eq!(queue.depth().unwrap(), 0);

    let store = engine.service.store();
    assert!(store.load_by_object(ObjectId(8)).unwrap().is_none());
    assert_eq!(
        store.count(&RecordFilter::all().state(FixityState::Match)).unwrap(),
        7
    );

    // once the threshold passes everything is due again
    engine.clock.advance(31 * DAY);
    let third = daemon.tick().await.unwrap();
    assert_eq!(third.admitted, 5);
    let stats = daemon.metrics().stats();
    assert_eq!(stats.ticks, 3);
    assert_eq!(stats.records_removed, 1);
    assert!(engine.clock.now() > NOW);
}

#[tokio::test]
async fn test_daemon_reclaims_lost_items() {
    let engine = TestEngine::memory();
    for id in 1..=3 {
        engine.add(id, b"lost");
        engine.service.set_periodic(ObjectId(id), true).unwrap();
    }
    let queue = Arc::new(MemoryWorkQueue::new());
    let daemon = FixityDaemon::new(engine.service.clone(), queue.clone());

    // admitted, then the items are lost with their worker
    let pass = engine.service.pass().unwrap();
    assert_eq!(daemon.gate().admit_due(&pass, 5).unwrap(), 3);
    while queue.dequeue().unwrap().is_some() {}

    let report = daemon.tick().await.unwrap();
    assert_eq!(report.reclaimed, 0);
    assert_eq!(report.admitted, 0);

    engine.clock.advance(DAY + 1);
    let report = daemon.tick().await.unwrap();
    assert_eq!(report.reclaimed, 3);
    assert_eq!(report.admitted, 3);
    assert_eq!(report.drained.checked, 3);
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn test_service_from_toml() {
    let config = FixityConfig::from_toml_str(
        r#"
        threshold = "-2 weeks"
        batch_size = 50
        algorithms = ["sha512", "blake3"]
        sources = ["all"]

        [logging]
        level = "debug"
        format = "json"
        "#,
    )
    .unwrap();
    let objects = Arc::new(MemoryObjectSource::new());
    let set = config.algorithm_set().unwrap();
    objects.insert_with_digests(ObjectId(1), b"both".to_vec(), &set);

    let service = FixityService::new(config, Arc::new(MemoryRecordStore::new()), objects).unwrap();
    assert_eq!(service.verify(ObjectId(1)).unwrap().state, FixityState::Match);
    assert_eq!(service.config().batch_size, 50);

    let bad = FixityConfig {
        algorithms: vec!["crc32".into()],
        ..FixityConfig::default()
    };
    assert!(matches!(
        FixityService::new(bad, Arc::new(MemoryRecordStore::new()), Arc::new(MemoryObjectSource::new())),
        Err(Error::UnknownAlgorithm(_))
    ));
}

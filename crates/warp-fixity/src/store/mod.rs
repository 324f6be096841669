//! Record persistence
//!
//! A [`RecordStore`] holds every [`FixityRecord`] with its revision history.
//! Saves run [`RecordDraft`] validation against the stored row inside the
//! store's write critical section (a lock or a transaction), which makes a
//! save an atomic update-if-matched: writers that lost a race get
//! [`Error::Conflict`](crate::Error::Conflict).

mod memory;
mod sled_store;

pub use memory::MemoryRecordStore;
pub use sled_store::SledRecordStore;

use std::collections::BTreeMap;
use std::fmt;

use crate::error::Result;
use crate::record::{
    FixityRecord, FixityState, ObjectId, RecordDraft, RecordId, Revision, RevisionId, Timestamp,
    NEVER,
};

/// Predicate over records, evaluated against their current revision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Periodic flag must equal this
    pub periodic: Option<bool>,
    /// Current state must equal this
    pub state: Option<FixityState>,
    /// Whether the current revision has been performed
    pub performed: Option<bool>,
    /// Due against this threshold: never performed or performed at or before it
    pub due_at: Option<Timestamp>,
    /// Performed after this timestamp
    pub current_at: Option<Timestamp>,
    /// Whether a queue marker is set
    pub queued: Option<bool>,
    /// Queue marker set and older than this timestamp
    pub queued_before: Option<Timestamp>,
}

impl RecordFilter {
    /// Filter matching every record
    pub fn all() -> Self {
        Self::default()
    }

    /// Periodic records that are due against `threshold`
    pub fn due(threshold: Timestamp) -> Self {
        Self::all().periodic(true).due_at(threshold)
    }

    /// Require the periodic flag
    pub fn periodic(mut self, periodic: bool) -> Self {
        self.periodic = Some(periodic);
        self
    }

    /// Require a state
    pub fn state(mut self, state: FixityState) -> Self {
        self.state = Some(state);
        self
    }

    /// Require performed / unperformed
    pub fn performed(mut self, performed: bool) -> Self {
        self.performed = Some(performed);
        self
    }

    /// Require due against `threshold`
    pub fn due_at(mut self, threshold: Timestamp) -> Self {
        self.due_at = Some(threshold);
        self
    }

    /// Require performed after `threshold`
    pub fn current_at(mut self, threshold: Timestamp) -> Self {
        self.current_at = Some(threshold);
        self
    }

    /// Require queued / not queued
    pub fn queued(mut self, queued: bool) -> Self {
        self.queued = Some(queued);
        self
    }

    /// Require a queue marker older than `ts`
    pub fn queued_before(mut self, ts: Timestamp) -> Self {
        self.queued_before = Some(ts);
        self
    }

    /// Evaluate against a record view
    pub fn matches(&self, record: &FixityRecord) -> bool {
        let performed_at = record.performed_at();
        self.periodic.map_or(true, |p| record.periodic() == p)
            && self.state.map_or(true, |s| record.state() == s)
            && self.performed.map_or(true, |p| (performed_at != NEVER) == p)
            && self
                .due_at
                .map_or(true, |t| performed_at == NEVER || performed_at <= t)
            && self.current_at.map_or(true, |t| performed_at > t)
            && self.queued.map_or(true, |q| record.is_queued() == q)
            && self
                .queued_before
                .map_or(true, |t| record.is_queued() && record.queued_at() < t)
    }
}

/// Persistent store of fixity records and their revisions
pub trait RecordStore: Send + Sync + fmt::Debug {
    /// Load a record at its current revision
    fn load(&self, id: RecordId) -> Result<Option<FixityRecord>>;

    /// Load the record tracking `object`
    fn load_by_object(&self, object: ObjectId) -> Result<Option<FixityRecord>>;

    /// Load a record as it was at `revision_id`
    fn load_revision(&self, revision_id: RevisionId) -> Result<Option<FixityRecord>>;

    /// Revision history of a record, newest first
    fn revisions(&self, id: RecordId) -> Result<Vec<Revision>>;

    /// Validate and persist a draft, returning the record at its new current revision
    fn save(&self, draft: RecordDraft) -> Result<FixityRecord>;

    /// Delete a record with every revision. Returns false if it did not exist.
    fn delete(&self, id: RecordId) -> Result<bool>;

    /// Delete one historical revision. The current revision cannot be deleted.
    fn delete_revision(&self, id: RecordId, revision_id: RevisionId) -> Result<()>;

    /// Up to `limit` records matching `filter` with id greater than `after`, ascending
    fn list(&self, filter: &RecordFilter, after: RecordId, limit: usize)
        -> Result<Vec<FixityRecord>>;

    /// Number of records matching `filter`
    fn count(&self, filter: &RecordFilter) -> Result<u64>;

    /// Number of revisions across all records
    fn count_revisions(&self) -> Result<u64>;

    /// Set the queue marker if it is clear. Returns whether it was set.
    fn mark_queued(&self, id: RecordId, at: Timestamp) -> Result<bool>;

    /// Clear the queue marker. Returns whether one was set.
    fn clear_queued(&self, id: RecordId) -> Result<bool>;

    /// Clear queue markers older than `ts`, returning how many were cleared
    fn clear_queued_before(&self, ts: Timestamp) -> Result<u64>;

    /// Disable periodic checks on every record, returning how many changed
    fn clear_periodic(&self) -> Result<u64>;

    /// Enable or disable periodic checks. Returns whether the flag changed.
    fn set_periodic(&self, id: RecordId, periodic: bool) -> Result<bool>;

    /// Whether a record exists for `object`
    fn has_object(&self, object: ObjectId) -> Result<bool> {
        Ok(self.load_by_object(object)?.is_some())
    }

    /// Counts per state among records matching `filter`; zero counts are omitted
    fn count_by_state(&self, filter: &RecordFilter) -> Result<BTreeMap<FixityState, u64>> {
        let mut counts = BTreeMap::new();
        for state in FixityState::ALL {
            let n = self.count(&filter.state(state))?;
            if n > 0 {
                counts.insert(state, n);
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every [`RecordStore`] backend must share

    use super::*;
    use crate::error::Error;

    fn performed(store: &dyn RecordStore, object: u64, at: Timestamp) -> FixityRecord {
        let record = match store.load_by_object(ObjectId(object)).unwrap() {
            Some(record) => record,
            None => store.save(RecordDraft::create(ObjectId(object))).unwrap(),
        };
        let mut draft = record.edit();
        if record.was_performed() {
            draft.new_revision();
        }
        draft.set_state(FixityState::Match).set_performed_at(at);
        store.save(draft).unwrap()
    }

    pub fn create_and_load(store: &dyn RecordStore) {
        let created = store.save(RecordDraft::create(ObjectId(7))).unwrap();
        assert!(created.id() > 0);
        assert_eq!(created.state(), FixityState::Undefined);
        assert!(!created.was_performed());
        assert!(created.is_default_revision());

        assert_eq!(store.load(created.id()).unwrap(), Some(created.clone()));
        assert_eq!(store.load_by_object(ObjectId(7)).unwrap(), Some(created.clone()));
        assert!(store.has_object(ObjectId(7)).unwrap());
        assert!(!store.has_object(ObjectId(8)).unwrap());
        assert_eq!(store.revisions(created.id()).unwrap().len(), 1);
    }

    pub fn rejects_duplicate_object(store: &dyn RecordStore) {
        store.save(RecordDraft::create(ObjectId(1))).unwrap();
        let err = store.save(RecordDraft::create(ObjectId(1))).unwrap_err();
        assert!(err.is_invariant_violation());
        assert_eq!(store.count(&RecordFilter::all()).unwrap(), 1);
    }

    pub fn revision_history(store: &dyn RecordStore) {
        let first = performed(store, 1, 100);
        assert_eq!(store.revisions(first.id()).unwrap().len(), 1);
        let second = performed(store, 1, 200);
        assert_eq!(second.id(), first.id());
        assert!(second.revision_id() > first.revision_id());

        let history = store.revisions(first.id()).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].performed_at, 200);
        assert_eq!(history[1].performed_at, 100);
        assert_eq!(store.count_revisions().unwrap(), 2);

        let old = store.load_revision(first.revision_id()).unwrap().unwrap();
        assert!(!old.is_default_revision());
        assert_eq!(old.performed_at(), 100);

        // history is immutable
        let mut draft = old.edit();
        draft.set_state(FixityState::Mismatch);
        assert!(store.save(draft).unwrap_err().is_invariant_violation());
    }

    pub fn stale_writer_conflicts(store: &dyn RecordStore) {
        let record = performed(store, 1, 100);
        let mut a = record.edit();
        a.new_revision().set_state(FixityState::Match).set_performed_at(200);
        let mut b = record.edit();
        b.new_revision().set_state(FixityState::Mismatch).set_performed_at(201);

        store.save(a).unwrap();
        assert!(matches!(store.save(b), Err(Error::Conflict { .. })));
        assert_eq!(store.revisions(record.id()).unwrap().len(), 2);
    }

    pub fn concurrent_completion_conflicts(store: &dyn RecordStore) {
        let record = store.save(RecordDraft::create(ObjectId(1))).unwrap();
        let mut a = record.edit();
        a.set_state(FixityState::Match).set_performed_at(100);
        let mut b = record.edit();
        b.set_state(FixityState::Mismatch).set_performed_at(200);

        store.save(a).unwrap();
        assert!(matches!(store.save(b), Err(Error::Conflict { .. })));

        let current = store.load(record.id()).unwrap().unwrap();
        assert_eq!(current.revision_id(), record.revision_id());
        assert_eq!(current.state(), FixityState::Match);
        assert_eq!(current.performed_at(), 100);
        assert_eq!(store.revisions(record.id()).unwrap().len(), 1);

        // reloading and recording again adds history instead
        let mut retry = current.edit();
        retry
            .new_revision()
            .set_state(FixityState::Mismatch)
            .set_performed_at(200);
        store.save(retry).unwrap();
        assert_eq!(store.revisions(record.id()).unwrap().len(), 2);
    }

    pub fn delete_revision(store: &dyn RecordStore) {
        let first = performed(store, 1, 100);
        let second = performed(store, 1, 200);

        let err = store
            .delete_revision(second.id(), second.revision_id())
            .unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));

        store
            .delete_revision(first.id(), first.revision_id())
            .unwrap();
        assert!(store.load_revision(first.revision_id()).unwrap().is_none());
        assert_eq!(store.revisions(first.id()).unwrap().len(), 1);
        assert!(store
            .delete_revision(first.id(), first.revision_id())
            .is_err());

        assert!(store.delete(first.id()).unwrap());
        assert!(!store.delete(first.id()).unwrap());
        assert!(store.load_by_object(ObjectId(1)).unwrap().is_none());
        assert_eq!(store.count_revisions().unwrap(), 0);
        // the object can be tracked again
        store.save(RecordDraft::create(ObjectId(1))).unwrap();
    }

    pub fn queue_markers(store: &dyn RecordStore) {
        let record = store.save(RecordDraft::create(ObjectId(1))).unwrap();
        assert!(store.mark_queued(record.id(), 50).unwrap());
        assert!(!store.mark_queued(record.id(), 60).unwrap());
        assert_eq!(store.load(record.id()).unwrap().unwrap().queued_at(), 50);
        assert_eq!(
            store
                .count(&RecordFilter::all().queued_before(51))
                .unwrap(),
            1
        );

        assert_eq!(store.clear_queued_before(50).unwrap(), 0);
        assert_eq!(store.clear_queued_before(51).unwrap(), 1);
        assert!(!store.load(record.id()).unwrap().unwrap().is_queued());
        assert!(!store.clear_queued(record.id()).unwrap());

        // a completed check clears the marker
        assert!(store.mark_queued(record.id(), 70).unwrap());
        let loaded = store.load(record.id()).unwrap().unwrap();
        let mut draft = loaded.edit();
        draft.set_state(FixityState::Match).set_performed_at(80);
        assert_eq!(store.save(draft).unwrap().queued_at(), NEVER);
    }

    pub fn periodic_flags(store: &dyn RecordStore) {
        let a = store.save(RecordDraft::create(ObjectId(1))).unwrap();
        let b = store.save(RecordDraft::create(ObjectId(2))).unwrap();
        assert!(store.set_periodic(a.id(), true).unwrap());
        assert!(!store.set_periodic(a.id(), true).unwrap());
        assert!(store.set_periodic(b.id(), true).unwrap());
        assert_eq!(store.count(&RecordFilter::all().periodic(true)).unwrap(), 2);
        assert_eq!(store.clear_periodic().unwrap(), 2);
        assert_eq!(store.count(&RecordFilter::all().periodic(true)).unwrap(), 0);
    }

    pub fn filtered_listing(store: &dyn RecordStore) {
        for object in 1..=5 {
            let record = performed(store, object, object as Timestamp * 100);
            store.set_periodic(record.id(), true).unwrap();
        }
        store.save(RecordDraft::create(ObjectId(6))).unwrap();

        let due = RecordFilter::due(300);
        assert_eq!(store.count(&due).unwrap(), 3);
        let first = store.list(&due, 0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = store.list(&due, first[1].id(), 10).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].object_id(), ObjectId(3));

        assert_eq!(store.count(&RecordFilter::all().performed(true)).unwrap(), 5);
        let by_state = store.count_by_state(&RecordFilter::all()).unwrap();
        assert_eq!(by_state.get(&FixityState::Match), Some(&5));
        assert_eq!(by_state.get(&FixityState::Undefined), Some(&1));
        assert_eq!(by_state.get(&FixityState::Mismatch), None);
    }

    pub fn run_all(make: impl Fn() -> Box<dyn RecordStore>) {
        create_and_load(make().as_ref());
        rejects_duplicate_object(make().as_ref());
        revision_history(make().as_ref());
        stale_writer_conflicts(make().as_ref());
        concurrent_completion_conflicts(make().as_ref());
        delete_revision(make().as_ref());
        queue_markers(make().as_ref());
        periodic_flags(make().as_ref());
        filtered_listing(make().as_ref());
    }
}

//! In-memory record store

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;

use super::{RecordFilter, RecordStore};
use crate::error::{Error, Result};
use crate::record::{
    FixityRecord, ObjectId, PreparedWrite, RecordDraft, RecordId, Revision, RevisionId,
    RevisionWrite, StoredRecord, StoredRevision, Timestamp, NEVER,
};

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    records: BTreeMap<RecordId, StoredRecord>,
    by_object: HashMap<ObjectId, RecordId>,
    revisions: BTreeMap<RevisionId, StoredRevision>,
    history: BTreeSet<(RecordId, RevisionId)>,
}

impl Inner {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn view(&self, record: &StoredRecord) -> Result<FixityRecord> {
        let revision = self
            .revisions
            .get(&record.default_revision)
            .ok_or_else(|| {
                Error::Storage(format!(
                    "record {} points at missing revision {}",
                    record.id, record.default_revision
                ))
            })?;
        Ok(record.view(revision.revision(record.default_revision)))
    }

    fn apply(&mut self, write: PreparedWrite) -> Result<FixityRecord> {
        let record_id = match write.record_id {
            Some(id) => id,
            None => self.allocate(),
        };
        let mut default_revision = self
            .records
            .get(&record_id)
            .map(|r| r.default_revision)
            .unwrap_or_default();

        match write.revision {
            RevisionWrite::New {
                state,
                performed_at,
            } => {
                let revision_id = self.allocate();
                self.revisions.insert(
                    revision_id,
                    StoredRevision {
                        record_id,
                        state,
                        performed_at,
                    },
                );
                self.history.insert((record_id, revision_id));
                default_revision = revision_id;
            }
            RevisionWrite::InPlace {
                revision_id,
                state,
                performed_at,
            } => {
                let revision = self.revisions.get_mut(&revision_id).ok_or_else(|| {
                    Error::Storage(format!("revision {revision_id} is missing"))
                })?;
                revision.state = state;
                revision.performed_at = performed_at;
            }
            RevisionWrite::Unchanged => {}
        }

        let stored = StoredRecord {
            id: record_id,
            object_id: write.object_id,
            periodic: write.periodic,
            queued_at: write.queued_at,
            default_revision,
        };
        self.by_object.insert(stored.object_id, record_id);
        let view = self.view(&stored)?;
        self.records.insert(record_id, stored);
        Ok(view)
    }

    fn update_record(&mut self, id: RecordId, f: impl FnOnce(&mut StoredRecord) -> bool) -> bool {
        self.records.get_mut(&id).map(f).unwrap_or(false)
    }

    fn update_matching(
        &mut self,
        filter: &RecordFilter,
        f: impl Fn(&mut StoredRecord),
    ) -> Result<u64> {
        let ids: Vec<RecordId> = self
            .records
            .values()
            .map(|r| self.view(r).map(|view| (r.id, view)))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|(_, view)| filter.matches(view))
            .map(|(id, _)| id)
            .collect();
        for id in &ids {
            if let Some(record) = self.records.get_mut(id) {
                f(record);
            }
        }
        Ok(ids.len() as u64)
    }
}

/// Record store kept in process memory
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: RwLock<Inner>,
}

impl MemoryRecordStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn load(&self, id: RecordId) -> Result<Option<FixityRecord>> {
        let inner = self.inner.read();
        inner.records.get(&id).map(|r| inner.view(r)).transpose()
    }

    fn load_by_object(&self, object: ObjectId) -> Result<Option<FixityRecord>> {
        let inner = self.inner.read();
        inner
            .by_object
            .get(&object)
            .and_then(|id| inner.records.get(id))
            .map(|r| inner.view(r))
            .transpose()
    }

    fn load_revision(&self, revision_id: RevisionId) -> Result<Option<FixityRecord>> {
        let inner = self.inner.read();
        let Some(revision) = inner.revisions.get(&revision_id) else {
            return Ok(None);
        };
        Ok(inner
            .records
            .get(&revision.record_id)
            .map(|r| r.view(revision.revision(revision_id))))
    }

    fn revisions(&self, id: RecordId) -> Result<Vec<Revision>> {
        let inner = self.inner.read();
        Ok(inner
            .history
            .range((id, 0)..=(id, RevisionId::MAX))
            .rev()
            .filter_map(|(_, rev)| inner.revisions.get(rev).map(|r| r.revision(*rev)))
            .collect())
    }

    fn save(&self, draft: RecordDraft) -> Result<FixityRecord> {
        let mut inner = self.inner.write();
        let existing = inner.by_object.get(&draft.object_id()).copied();
        let stored = draft
            .original()
            .and_then(|original| inner.records.get(&original.id()))
            .cloned();
        let stored_default = stored
            .as_ref()
            .and_then(|record| inner.revisions.get(&record.default_revision))
            .copied();
        let write = draft.prepare(existing, stored.as_ref(), stored_default.as_ref())?;
        inner.apply(write)
    }

    fn delete(&self, id: RecordId) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(record) = inner.records.remove(&id) else {
            return Ok(false);
        };
        inner.by_object.remove(&record.object_id);
        let revisions: Vec<_> = inner
            .history
            .range((id, 0)..=(id, RevisionId::MAX))
            .copied()
            .collect();
        for key in revisions {
            inner.history.remove(&key);
            inner.revisions.remove(&key.1);
        }
        Ok(true)
    }

    fn delete_revision(&self, id: RecordId, revision_id: RevisionId) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .records
            .get(&id)
            .ok_or_else(|| Error::Precondition(format!("record {id} does not exist")))?;
        if record.default_revision == revision_id {
            return Err(Error::Precondition(format!(
                "revision {revision_id} is the current revision of record {id}"
            )));
        }
        if !inner.history.remove(&(id, revision_id)) {
            return Err(Error::Precondition(format!(
                "revision {revision_id} does not belong to record {id}"
            )));
        }
        inner.revisions.remove(&revision_id);
        Ok(())
    }

    fn list(
        &self,
        filter: &RecordFilter,
        after: RecordId,
        limit: usize,
    ) -> Result<Vec<FixityRecord>> {
        let inner = self.inner.read();
        let mut page = Vec::new();
        for record in inner.records.range(after.saturating_add(1)..).map(|(_, r)| r) {
            if page.len() >= limit {
                break;
            }
            let view = inner.view(record)?;
            if filter.matches(&view) {
                page.push(view);
            }
        }
        Ok(page)
    }

    fn count(&self, filter: &RecordFilter) -> Result<u64> {
        let inner = self.inner.read();
        let mut n = 0;
        for record in inner.records.values() {
            if filter.matches(&inner.view(record)?) {
                n += 1;
            }
        }
        Ok(n)
    }

    fn count_revisions(&self) -> Result<u64> {
        Ok(self.inner.read().revisions.len() as u64)
    }

    fn mark_queued(&self, id: RecordId, at: Timestamp) -> Result<bool> {
        Ok(self.inner.write().update_record(id, |r| {
            if r.queued_at != NEVER {
                return false;
            }
            r.queued_at = at;
            true
        }))
    }

    fn clear_queued(&self, id: RecordId) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .update_record(id, |r| std::mem::replace(&mut r.queued_at, NEVER) != NEVER))
    }

    fn clear_queued_before(&self, ts: Timestamp) -> Result<u64> {
        self.inner
            .write()
            .update_matching(&RecordFilter::all().queued_before(ts), |r| {
                r.queued_at = NEVER
            })
    }

    fn clear_periodic(&self) -> Result<u64> {
        self.inner
            .write()
            .update_matching(&RecordFilter::all().periodic(true), |r| r.periodic = false)
    }

    fn set_periodic(&self, id: RecordId, periodic: bool) -> Result<bool> {
        Ok(self.inner.write().update_record(id, |r| {
            std::mem::replace(&mut r.periodic, periodic) != periodic
        }))
    }
}

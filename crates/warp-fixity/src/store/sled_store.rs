//! Durable record store using sled
//!
//! Layout (all ids as big-endian `u64` so key order is numeric order):
//! - `fixity_records`: record id -> [`StoredRecord`]
//! - `fixity_revisions`: revision id -> [`StoredRevision`]
//! - `fixity_objects`: object id -> record id
//! - `fixity_history`: record id ++ revision id -> empty
//!
//! Values are MessagePack. A save touches all four trees inside one sled
//! transaction.

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::{Db, Transactional, Tree};
use tracing::{debug, info};

use super::{RecordFilter, RecordStore};
use crate::error::{Error, Result};
use crate::record::{
    FixityRecord, ObjectId, RecordDraft, RecordId, Revision, RevisionId, RevisionWrite,
    StoredRecord, StoredRevision, Timestamp, NEVER,
};

const TREE_RECORDS: &str = "fixity_records";
const TREE_REVISIONS: &str = "fixity_revisions";
const TREE_OBJECTS: &str = "fixity_objects";
const TREE_HISTORY: &str = "fixity_history";

/// Attempts at deleting a record while revisions are being added to it
const DELETE_ATTEMPTS: usize = 8;

/// Record store persisted in a sled database
#[derive(Debug, Clone)]
pub struct SledRecordStore {
    db: Arc<Db>,
    records: Tree,
    revisions: Tree,
    objects: Tree,
    history: Tree,
}

impl SledRecordStore {
    /// Open or create a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(Arc::new(db))
    }

    /// Open a store that is deleted when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(Arc::new(db))
    }

    /// Create from an existing sled database
    pub fn from_db(db: Arc<Db>) -> Result<Self> {
        let records = db.open_tree(TREE_RECORDS)?;
        let revisions = db.open_tree(TREE_REVISIONS)?;
        let objects = db.open_tree(TREE_OBJECTS)?;
        let history = db.open_tree(TREE_HISTORY)?;

        info!(
            records = records.len(),
            revisions = revisions.len(),
            "Opened fixity record store"
        );

        Ok(Self {
            db,
            records,
            revisions,
            objects,
            history,
        })
    }

    /// Underlying sled database
    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn next_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()? + 1)
    }

    fn record_row(&self, id: RecordId) -> Result<Option<StoredRecord>> {
        self.records
            .get(id_key(id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn revision_row(&self, revision_id: RevisionId) -> Result<Option<StoredRevision>> {
        self.revisions
            .get(id_key(revision_id))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn view(&self, record: &StoredRecord) -> Result<FixityRecord> {
        let revision = self.revision_row(record.default_revision)?.ok_or_else(|| {
            Error::Storage(format!(
                "record {} points at missing revision {}",
                record.id, record.default_revision
            ))
        })?;
        Ok(record.view(revision.revision(record.default_revision)))
    }

    fn history_of(&self, id: RecordId) -> Result<Vec<RevisionId>> {
        self.history
            .scan_prefix(id_key(id))
            .keys()
            .map(|key| read_id(&key?[8..]))
            .collect()
    }

    /// Apply `f` to one record row atomically. Returns what `f` returned, or
    /// false when the record does not exist.
    fn update_record(&self, id: RecordId, f: impl Fn(&mut StoredRecord) -> bool) -> Result<bool> {
        self.records
            .transaction(|tx| {
                let Some(bytes) = tx.get(id_key(id))? else {
                    return Ok(false);
                };
                let mut row: StoredRecord = decode(&bytes).map_err(abort)?;
                if !f(&mut row) {
                    return Ok(false);
                }
                tx.insert(&id_key(id)[..], encode(&row).map_err(abort)?)?;
                Ok(true)
            })
            .map_err(from_tx)
    }

    /// Apply `f` to every row matching `select`
    fn update_where(
        &self,
        select: impl Fn(&StoredRecord) -> bool,
        f: impl Fn(&mut StoredRecord) -> bool,
    ) -> Result<u64> {
        let mut ids = Vec::new();
        for item in self.records.iter().values() {
            let row: StoredRecord = decode(&item?)?;
            if select(&row) {
                ids.push(row.id);
            }
        }
        let mut changed = 0;
        for id in ids {
            if self.update_record(id, |row| select(row) && f(row))? {
                changed += 1;
            }
        }
        Ok(changed)
    }
}

impl RecordStore for SledRecordStore {
    fn load(&self, id: RecordId) -> Result<Option<FixityRecord>> {
        self.record_row(id)?.map(|row| self.view(&row)).transpose()
    }

    fn load_by_object(&self, object: ObjectId) -> Result<Option<FixityRecord>> {
        match self.objects.get(id_key(object.get()))? {
            Some(id) => self.load(read_id(&id)?),
            None => Ok(None),
        }
    }

    fn load_revision(&self, revision_id: RevisionId) -> Result<Option<FixityRecord>> {
        let Some(revision) = self.revision_row(revision_id)? else {
            return Ok(None);
        };
        Ok(self
            .record_row(revision.record_id)?
            .map(|row| row.view(revision.revision(revision_id))))
    }

    fn revisions(&self, id: RecordId) -> Result<Vec<Revision>> {
        let mut revisions = Vec::new();
        for revision_id in self.history_of(id)?.into_iter().rev() {
            if let Some(row) = self.revision_row(revision_id)? {
                revisions.push(row.revision(revision_id));
            }
        }
        Ok(revisions)
    }

    fn save(&self, draft: RecordDraft) -> Result<FixityRecord> {
        let fresh_record = self.next_id()?;
        let fresh_revision = self.next_id()?;

        let saved = (&self.records, &self.revisions, &self.objects, &self.history)
            .transaction(|(records, revisions, objects, history)| {
                let existing = objects
                    .get(id_key(draft.object_id().get()))?
                    .map(|bytes| read_id(&bytes))
                    .transpose()
                    .map_err(abort)?;
                let stored: Option<StoredRecord> = match draft.original() {
                    Some(original) => records
                        .get(id_key(original.id()))?
                        .map(|bytes| decode(&bytes))
                        .transpose()
                        .map_err(abort)?,
                    None => None,
                };

                let stored_default: Option<StoredRevision> = match &stored {
                    Some(record) => revisions
                        .get(id_key(record.default_revision))?
                        .map(|bytes| decode(&bytes))
                        .transpose()
                        .map_err(abort)?,
                    None => None,
                };

                let write = draft
                    .clone()
                    .prepare(existing, stored.as_ref(), stored_default.as_ref())
                    .map_err(abort)?;
                let record_id = write.record_id.unwrap_or(fresh_record);
                let mut default_revision = stored.map(|s| s.default_revision).unwrap_or_default();

                let revision = match write.revision {
                    RevisionWrite::New {
                        state,
                        performed_at,
                    } => {
                        let row = StoredRevision {
                            record_id,
                            state,
                            performed_at,
                        };
                        revisions.insert(&id_key(fresh_revision)[..], encode(&row).map_err(abort)?)?;
                        history.insert(&history_key(record_id, fresh_revision)[..], sled::IVec::default())?;
                        default_revision = fresh_revision;
                        row
                    }
                    RevisionWrite::InPlace {
                        revision_id,
                        state,
                        performed_at,
                    } => {
                        let mut row = tx_revision(revisions, revision_id)?;
                        row.state = state;
                        row.performed_at = performed_at;
                        revisions.insert(&id_key(revision_id)[..], encode(&row).map_err(abort)?)?;
                        row
                    }
                    RevisionWrite::Unchanged => tx_revision(revisions, default_revision)?,
                };

                let row = StoredRecord {
                    id: record_id,
                    object_id: write.object_id,
                    periodic: write.periodic,
                    queued_at: write.queued_at,
                    default_revision,
                };
                records.insert(&id_key(record_id)[..], encode(&row).map_err(abort)?)?;
                objects.insert(&id_key(row.object_id.get())[..], &id_key(record_id)[..])?;
                Ok(row.view(revision.revision(default_revision)))
            })
            .map_err(from_tx)?;

        debug!(
            record_id = saved.id(),
            revision_id = saved.revision_id(),
            "Saved fixity record"
        );
        Ok(saved)
    }

    fn delete(&self, id: RecordId) -> Result<bool> {
        for _ in 0..DELETE_ATTEMPTS {
            let Some(seen) = self.record_row(id)? else {
                return Ok(false);
            };
            let history = self.history_of(id)?;

            let outcome = (&self.records, &self.revisions, &self.objects, &self.history)
                .transaction(|(records, revisions, objects, history_tree)| {
                    let current: Option<StoredRecord> = records
                        .get(id_key(id))?
                        .map(|bytes| decode(&bytes))
                        .transpose()
                        .map_err(abort)?;
                    let Some(current) = current else {
                        return Ok(false);
                    };
                    if current.default_revision != seen.default_revision {
                        return Err(abort(Error::Conflict {
                            record_id: id,
                            expected: seen.default_revision,
                            actual: current.default_revision,
                        }));
                    }
                    records.remove(&id_key(id)[..])?;
                    objects.remove(&id_key(current.object_id.get())[..])?;
                    for revision_id in &history {
                        revisions.remove(&id_key(*revision_id)[..])?;
                        history_tree.remove(&history_key(id, *revision_id)[..])?;
                    }
                    Ok(true)
                })
                .map_err(from_tx);

            match outcome {
                Err(Error::Conflict { .. }) => continue,
                other => return other,
            }
        }
        Err(Error::Storage(format!(
            "record {id} kept changing while being deleted"
        )))
    }

    fn delete_revision(&self, id: RecordId, revision_id: RevisionId) -> Result<()> {
        (&self.records, &self.revisions, &self.history)
            .transaction(|(records, revisions, history)| {
                let record: StoredRecord = match records.get(id_key(id))? {
                    Some(bytes) => decode(&bytes).map_err(abort)?,
                    None => {
                        return Err(abort(Error::Precondition(format!(
                            "record {id} does not exist"
                        ))))
                    }
                };
                if record.default_revision == revision_id {
                    return Err(abort(Error::Precondition(format!(
                        "revision {revision_id} is the current revision of record {id}"
                    ))));
                }
                if history.remove(&history_key(id, revision_id)[..])?.is_none() {
                    return Err(abort(Error::Precondition(format!(
                        "revision {revision_id} does not belong to record {id}"
                    ))));
                }
                revisions.remove(&id_key(revision_id)[..])?;
                Ok(())
            })
            .map_err(from_tx)
    }

    fn list(
        &self,
        filter: &RecordFilter,
        after: RecordId,
        limit: usize,
    ) -> Result<Vec<FixityRecord>> {
        let mut page = Vec::new();
        if after == RecordId::MAX {
            return Ok(page);
        }
        for item in self.records.range(id_key(after + 1)..).values() {
            if page.len() >= limit {
                break;
            }
            let view = self.view(&decode(&item?)?)?;
            if filter.matches(&view) {
                page.push(view);
            }
        }
        Ok(page)
    }

    fn count(&self, filter: &RecordFilter) -> Result<u64> {
        let mut n = 0;
        for item in self.records.iter().values() {
            if filter.matches(&self.view(&decode(&item?)?)?) {
                n += 1;
            }
        }
        Ok(n)
    }

    fn count_revisions(&self) -> Result<u64> {
        Ok(self.revisions.len() as u64)
    }

    fn mark_queued(&self, id: RecordId, at: Timestamp) -> Result<bool> {
        self.update_record(id, |row| {
            if row.queued_at != NEVER {
                return false;
            }
            row.queued_at = at;
            true
        })
    }

    fn clear_queued(&self, id: RecordId) -> Result<bool> {
        self.update_record(id, |row| {
            std::mem::replace(&mut row.queued_at, NEVER) != NEVER
        })
    }

    fn clear_queued_before(&self, ts: Timestamp) -> Result<u64> {
        self.update_where(
            |row| row.queued_at != NEVER && row.queued_at < ts,
            |row| {
                row.queued_at = NEVER;
                true
            },
        )
    }

    fn clear_periodic(&self) -> Result<u64> {
        self.update_where(
            |row| row.periodic,
            |row| {
                row.periodic = false;
                true
            },
        )
    }

    fn set_periodic(&self, id: RecordId, periodic: bool) -> Result<bool> {
        self.update_record(id, |row| {
            std::mem::replace(&mut row.periodic, periodic) != periodic
        })
    }
}

fn tx_revision(
    revisions: &TransactionalTree,
    revision_id: RevisionId,
) -> ConflictableTransactionResult<StoredRevision, Error> {
    match revisions.get(id_key(revision_id))? {
        Some(bytes) => decode(&bytes).map_err(abort),
        None => Err(abort(Error::Storage(format!(
            "revision {revision_id} is missing"
        )))),
    }
}

/// Id to key bytes (big-endian for ordering)
fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn history_key(record_id: RecordId, revision_id: RevisionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&record_id.to_be_bytes());
    key[8..].copy_from_slice(&revision_id.to_be_bytes());
    key
}

fn read_id(bytes: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Storage(format!("malformed id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

fn abort(e: Error) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(e)
}

fn from_tx(e: TransactionError<Error>) -> Error {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => Error::Sled(e),
    }
}

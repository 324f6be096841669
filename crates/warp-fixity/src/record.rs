//! Fixity records and their revision history
//!
//! Every tracked object owns exactly one [`FixityRecord`]. The outcome of each
//! check lives on an immutable [`Revision`]; the record points at its newest
//! (default) revision. Record-level fields (`periodic`, `queued_at`) are not
//! revisioned.
//!
//! All writes go through [`RecordDraft`] and are validated by
//! [`RecordDraft::prepare`] against the stored state, which is where the
//! history invariants are enforced.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Seconds since the UNIX epoch
pub type Timestamp = i64;

/// Timestamp value meaning "never" / "unset"
pub const NEVER: Timestamp = 0;

/// Identifier of a fixity record
pub type RecordId = u64;

/// Identifier of a single revision. Allocated from one increasing sequence,
/// so revisions of a record are ordered by id.
pub type RevisionId = u64;

/// Identifier of a stored object (a file reference)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Raw numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ObjectId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Outcome of a fixity check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum FixityState {
    /// Not performed, or some other undefined state
    Undefined = 0,
    /// Generated checksums match the recorded values
    Match = 1,
    /// Generated checksums do not match the recorded values
    Mismatch = 2,
    /// The object could not be located or opened
    ObjectMissing = 3,
    /// A recorded checksum is missing for a configured algorithm
    ChecksumMissing = 4,
    /// A checksum could not be generated
    GenerationFailed = 5,
}

impl FixityState {
    /// Every state, in code order
    pub const ALL: [FixityState; 6] = [
        FixityState::Undefined,
        FixityState::Match,
        FixityState::Mismatch,
        FixityState::ObjectMissing,
        FixityState::ChecksumMissing,
        FixityState::GenerationFailed,
    ];

    /// Stable numeric code
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Parse a numeric code
    pub fn from_code(code: u8) -> Result<Self> {
        Self::ALL
            .get(code as usize)
            .copied()
            .ok_or_else(|| Error::InvariantViolation(format!("invalid state '{code}'")))
    }

    /// Label used when displaying a single check
    pub fn label(self) -> &'static str {
        match self {
            Self::Undefined => "Undefined",
            Self::Match => "Matched recorded values",
            Self::Mismatch => "Did not match recorded values",
            Self::ObjectMissing => "Could not be performed: File missing",
            Self::ChecksumMissing => "Could not be performed: Missing recorded checksum(s)",
            Self::GenerationFailed => "Could not be performed: Could not generate checksum(s)",
        }
    }

    /// Summary phrase for a count of checks in this state
    pub fn describe_count(self, count: u64) -> String {
        let phrase = match (self, count == 1) {
            (Self::Undefined, true) => "check is undefined",
            (Self::Undefined, false) => "checks are undefined",
            (Self::Match, true) => "check matched the recorded checksum(s)",
            (Self::Match, false) => "checks matched the recorded checksum(s)",
            (Self::Mismatch, true) => "check did not match the recorded checksum(s)",
            (Self::Mismatch, false) => "checks did not match the recorded checksum(s)",
            (Self::ObjectMissing, true) => "file is missing and could not be checked",
            (Self::ObjectMissing, false) => "files are missing and could not be checked",
            (Self::ChecksumMissing, true) => "file is missing a recorded checksum",
            (Self::ChecksumMissing, false) => "files are missing recorded checksums",
            (Self::GenerationFailed, true) => "check could not generate a checksum",
            (Self::GenerationFailed, false) => "checks could not generate checksums",
        };
        format!("{count} {phrase}")
    }

    /// Whether this state counts as a passed check
    pub fn passed(self) -> bool {
        self == Self::Match
    }
}

impl fmt::Display for FixityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One immutable snapshot of a check outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// Revision identifier
    pub revision_id: RevisionId,
    /// Outcome of the check
    pub state: FixityState,
    /// When the check completed, [`NEVER`] if it has not
    pub performed_at: Timestamp,
}

impl Revision {
    /// Whether the check captured by this revision has completed
    pub fn was_performed(&self) -> bool {
        self.performed_at != NEVER
    }
}

/// A fixity record as seen at one of its revisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixityRecord {
    id: RecordId,
    object_id: ObjectId,
    periodic: bool,
    queued_at: Timestamp,
    revision: Revision,
    default_revision: RevisionId,
}

impl FixityRecord {
    pub(crate) fn from_parts(
        id: RecordId,
        object_id: ObjectId,
        periodic: bool,
        queued_at: Timestamp,
        revision: Revision,
        default_revision: RevisionId,
    ) -> Self {
        Self {
            id,
            object_id,
            periodic,
            queued_at,
            revision,
            default_revision,
        }
    }

    /// Record identifier
    pub fn id(&self) -> RecordId {
        self.id
    }

    /// Tracked object
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Whether the object takes part in scheduled re-checks
    pub fn periodic(&self) -> bool {
        self.periodic
    }

    /// When the record was admitted to the work queue, [`NEVER`] if not queued
    pub fn queued_at(&self) -> Timestamp {
        self.queued_at
    }

    /// Whether a queue marker is set
    pub fn is_queued(&self) -> bool {
        self.queued_at != NEVER
    }

    /// The revision this view reflects
    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    /// Identifier of the revision this view reflects
    pub fn revision_id(&self) -> RevisionId {
        self.revision.revision_id
    }

    /// Identifier of the record's current revision
    pub fn default_revision_id(&self) -> RevisionId {
        self.default_revision
    }

    /// Whether this view is of the current revision
    pub fn is_default_revision(&self) -> bool {
        self.revision.revision_id == self.default_revision
    }

    /// Outcome at this revision
    pub fn state(&self) -> FixityState {
        self.revision.state
    }

    /// Completion time at this revision
    pub fn performed_at(&self) -> Timestamp {
        self.revision.performed_at
    }

    /// Whether the check at this revision has completed
    pub fn was_performed(&self) -> bool {
        self.revision.was_performed()
    }

    /// Whether the check at this revision passed
    pub fn passed(&self) -> bool {
        self.revision.state.passed()
    }

    /// Start editing this record
    pub fn edit(&self) -> RecordDraft {
        RecordDraft {
            original: Some(self.clone()),
            object_id: self.object_id,
            state: self.revision.state,
            performed_at: self.revision.performed_at,
            periodic: self.periodic,
            queued_at: self.queued_at,
            new_revision: false,
        }
    }
}

/// Pending changes to a record, validated when saved
#[derive(Debug, Clone)]
pub struct RecordDraft {
    original: Option<FixityRecord>,
    object_id: ObjectId,
    state: FixityState,
    performed_at: Timestamp,
    periodic: bool,
    queued_at: Timestamp,
    new_revision: bool,
}

impl RecordDraft {
    /// Draft a brand-new record for `object_id`
    pub fn create(object_id: ObjectId) -> Self {
        Self {
            original: None,
            object_id,
            state: FixityState::Undefined,
            performed_at: NEVER,
            periodic: false,
            queued_at: NEVER,
            new_revision: false,
        }
    }

    /// The record this draft was loaded from, `None` for new records
    pub fn original(&self) -> Option<&FixityRecord> {
        self.original.as_ref()
    }

    /// Whether saving creates a new record
    pub fn is_new(&self) -> bool {
        self.original.is_none()
    }

    /// Whether saving opens a new revision
    pub fn is_new_revision(&self) -> bool {
        self.new_revision
    }

    /// Open a new revision on save.
    ///
    /// On an existing record the new revision starts unperformed: `state` is
    /// reset to [`FixityState::Undefined`] and `performed_at` is cleared.
    pub fn new_revision(&mut self) -> &mut Self {
        if self.original.is_some() {
            self.new_revision = true;
            self.state = FixityState::Undefined;
            self.performed_at = NEVER;
        }
        self
    }

    /// Change the tracked object (only valid before the record exists)
    pub fn set_object_id(&mut self, object_id: ObjectId) -> &mut Self {
        self.object_id = object_id;
        self
    }

    /// Set the check outcome
    pub fn set_state(&mut self, state: FixityState) -> &mut Self {
        self.state = state;
        self
    }

    /// Set the completion time
    pub fn set_performed_at(&mut self, performed_at: Timestamp) -> &mut Self {
        self.performed_at = performed_at;
        self
    }

    /// Enable or disable periodic checks
    pub fn set_periodic(&mut self, periodic: bool) -> &mut Self {
        self.periodic = periodic;
        self
    }

    /// Set the queue marker
    pub fn set_queued_at(&mut self, queued_at: Timestamp) -> &mut Self {
        self.queued_at = queued_at;
        self
    }

    /// Tracked object
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Pending state
    pub fn state(&self) -> FixityState {
        self.state
    }

    /// Pending completion time
    pub fn performed_at(&self) -> Timestamp {
        self.performed_at
    }

    /// Validate the draft against what is currently stored.
    ///
    /// `existing_for_object` is the record currently stored for the draft's
    /// object (used to enforce uniqueness of new records), `stored` is the
    /// current state of the record being edited and `stored_default` the
    /// stored row of its default revision.
    pub(crate) fn prepare(
        self,
        existing_for_object: Option<RecordId>,
        stored: Option<&StoredRecord>,
        stored_default: Option<&StoredRevision>,
    ) -> Result<PreparedWrite> {
        let Some(original) = self.original else {
            if let Some(existing) = existing_for_object {
                return Err(Error::InvariantViolation(format!(
                    "object {} is already tracked by record {existing}",
                    self.object_id
                )));
            }
            return Ok(PreparedWrite {
                record_id: None,
                object_id: self.object_id,
                periodic: self.periodic,
                queued_at: self.queued_at,
                revision: RevisionWrite::New {
                    state: self.state,
                    performed_at: self.performed_at,
                },
            });
        };

        let Some(stored) = stored else {
            return Err(Error::Precondition(format!(
                "record {} no longer exists",
                original.id
            )));
        };

        if stored.default_revision != original.default_revision {
            return Err(Error::Conflict {
                record_id: original.id,
                expected: original.default_revision,
                actual: stored.default_revision,
            });
        }

        if self.object_id != original.object_id || stored.object_id != original.object_id {
            return Err(Error::InvariantViolation(format!(
                "the object of record {} cannot be changed after creation",
                original.id
            )));
        }

        let state_changed = self.state != original.revision.state;
        let performed_changed = self.performed_at != original.revision.performed_at;

        // Only the newest revision, and only while it is unperformed, may
        // have its outcome written in place.
        let editable_in_place =
            original.is_default_revision() && !original.revision.was_performed();
        if !self.new_revision && !editable_in_place && (state_changed || performed_changed) {
            let field = if state_changed { "state" } else { "performed" };
            return Err(Error::InvariantViolation(format!(
                "the '{field}' field of revision {} of record {} is immutable",
                original.revision.revision_id, original.id
            )));
        }

        if self.new_revision && self.performed_at == NEVER {
            return Err(Error::InvariantViolation(format!(
                "record {} cannot gain a revision without a performed time",
                original.id
            )));
        }

        // Record-level fields: keep concurrent changes the draft did not touch.
        let periodic = if self.periodic != original.periodic {
            self.periodic
        } else {
            stored.periodic
        };
        let mut queued_at = if self.queued_at != original.queued_at {
            self.queued_at
        } else {
            stored.queued_at
        };
        if performed_changed || self.new_revision {
            queued_at = NEVER;
        }

        let revision = if self.new_revision {
            RevisionWrite::New {
                state: self.state,
                performed_at: self.performed_at,
            }
        } else if state_changed || performed_changed {
            // another writer completed the revision after this draft loaded it
            if stored_default.is_some_and(|row| row.performed_at != NEVER) {
                return Err(Error::Conflict {
                    record_id: original.id,
                    expected: original.default_revision,
                    actual: stored.default_revision,
                });
            }
            RevisionWrite::InPlace {
                revision_id: original.revision.revision_id,
                state: self.state,
                performed_at: self.performed_at,
            }
        } else {
            RevisionWrite::Unchanged
        };

        Ok(PreparedWrite {
            record_id: Some(original.id),
            object_id: original.object_id,
            periodic,
            queued_at,
            revision,
        })
    }
}

/// Persisted record row, shared by the store backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    pub id: RecordId,
    pub object_id: ObjectId,
    pub periodic: bool,
    pub queued_at: Timestamp,
    pub default_revision: RevisionId,
}

impl StoredRecord {
    pub(crate) fn view(&self, revision: Revision) -> FixityRecord {
        FixityRecord::from_parts(
            self.id,
            self.object_id,
            self.periodic,
            self.queued_at,
            revision,
            self.default_revision,
        )
    }
}

/// Persisted revision row, shared by the store backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoredRevision {
    pub record_id: RecordId,
    pub state: FixityState,
    pub performed_at: Timestamp,
}

impl StoredRevision {
    pub(crate) fn revision(&self, revision_id: RevisionId) -> Revision {
        Revision {
            revision_id,
            state: self.state,
            performed_at: self.performed_at,
        }
    }
}

/// A validated write ready to be applied by a store
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PreparedWrite {
    /// `None` when a record id must be allocated
    pub record_id: Option<RecordId>,
    pub object_id: ObjectId,
    pub periodic: bool,
    pub queued_at: Timestamp,
    pub revision: RevisionWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RevisionWrite {
    /// Allocate a revision and make it the default
    New {
        state: FixityState,
        performed_at: Timestamp,
    },
    /// Overwrite the outcome of the default, unperformed revision
    InPlace {
        revision_id: RevisionId,
        state: FixityState,
        performed_at: Timestamp,
    },
    /// Only record-level fields change
    Unchanged,
}

//! Resumable enumeration of work populations
//!
//! Two populations drive batch and queue work:
//! - [`CursorKind::Missing`]: catalogued objects without a fixity record,
//!   keyed by object id
//! - [`CursorKind::PeriodicDue`]: periodic records due against a fixed
//!   threshold, keyed by record id
//!
//! Pages are keyset-paginated: [`CursorState::offset`] is the last key
//! handed out, so items that leave the population while it is being walked
//! never shift later pages. The offset only moves in [`PopulationCursor::commit`],
//! after the caller has finished a page.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::record::{ObjectId, RecordId, Timestamp};
use crate::source::ObjectSource;
use crate::store::{RecordFilter, RecordStore};

/// Population walked by a cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CursorKind {
    /// Objects with no fixity record
    Missing,
    /// Periodic records last performed at or before `threshold`
    PeriodicDue {
        /// Stale boundary fixed for the whole walk
        threshold: Timestamp,
    },
}

/// Persistable cursor position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// Last key handed out, 0 before the first page
    pub offset: u64,
    /// Size of the population when last counted
    pub remaining_estimate: u64,
}

/// One entry of a page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorItem {
    /// Pagination key
    pub key: u64,
    /// Object to work on
    pub object_id: ObjectId,
    /// Record of the object, when one exists
    pub record_id: Option<RecordId>,
}

/// Result of committing a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    /// The population shrank; keep going
    Advanced,
    /// A non-empty page left the population size unchanged
    Stalled,
    /// The page was empty
    Exhausted,
}

/// Walks one population page by page
#[derive(Debug, Clone)]
pub struct PopulationCursor {
    kind: CursorKind,
    store: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectSource>,
}

impl PopulationCursor {
    /// Create a cursor over `kind`
    pub fn new(
        kind: CursorKind,
        store: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectSource>,
    ) -> Self {
        Self {
            kind,
            store,
            objects,
        }
    }

    /// Population walked
    pub fn kind(&self) -> CursorKind {
        self.kind
    }

    /// Initial state, with a fresh population count
    pub fn start(&self) -> Result<CursorState> {
        Ok(CursorState {
            offset: 0,
            remaining_estimate: self.count()?,
        })
    }

    /// Count the population
    pub fn count(&self) -> Result<u64> {
        match self.kind {
            CursorKind::Missing => {
                let mut missing = 0;
                let mut after = 0;
                loop {
                    let page = self.objects.list_after(after, 1024).map_err(enumeration)?;
                    let Some(last) = page.last() else {
                        break;
                    };
                    after = last.get();
                    for object in page {
                        if !self.store.has_object(object).map_err(enumeration)? {
                            missing += 1;
                        }
                    }
                }
                Ok(missing)
            }
            CursorKind::PeriodicDue { threshold } => self
                .store
                .count(&RecordFilter::due(threshold))
                .map_err(enumeration),
        }
    }

    /// Up to `limit` items after the committed offset
    pub fn page(&self, state: &CursorState, limit: usize) -> Result<Vec<CursorItem>> {
        match self.kind {
            CursorKind::Missing => {
                let mut items = Vec::new();
                let mut after = state.offset;
                while items.len() < limit {
                    let page = self
                        .objects
                        .list_after(after, limit.max(64))
                        .map_err(enumeration)?;
                    let Some(last) = page.last() else {
                        break;
                    };
                    after = last.get();
                    for object in page {
                        if items.len() >= limit {
                            break;
                        }
                        if !self.store.has_object(object).map_err(enumeration)? {
                            items.push(CursorItem {
                                key: object.get(),
                                object_id: object,
                                record_id: None,
                            });
                        }
                    }
                }
                Ok(items)
            }
            CursorKind::PeriodicDue { threshold } => Ok(self
                .store
                .list(&RecordFilter::due(threshold), state.offset, limit)
                .map_err(enumeration)?
                .into_iter()
                .map(|record| CursorItem {
                    key: record.id(),
                    object_id: record.object_id(),
                    record_id: Some(record.id()),
                })
                .collect()),
        }
    }

    /// Advance past a processed page and recount the population.
    ///
    /// On error the passed state is left as it was, so the page can be
    /// retried.
    pub fn commit(&self, state: &CursorState, page: &[CursorItem]) -> Result<(CursorState, Progress)> {
        let Some(last) = page.iter().map(|item| item.key).max() else {
            return Ok((*state, Progress::Exhausted));
        };
        let remaining = self.count()?;
        let progress = if remaining == state.remaining_estimate {
            Progress::Stalled
        } else {
            Progress::Advanced
        };
        debug!(
            kind = ?self.kind,
            offset = last,
            remaining,
            ?progress,
            "Committed cursor page"
        );
        Ok((
            CursorState {
                offset: last.max(state.offset),
                remaining_estimate: remaining,
            },
            progress,
        ))
    }
}

fn enumeration(e: Error) -> Error {
    match e {
        Error::Enumeration(_) => e,
        other => Error::Enumeration(other.to_string()),
    }
}

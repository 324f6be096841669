//! Candidate sources for periodic checking
//!
//! A [`CandidateSource`] names objects that should take part in periodic
//! checks but do not yet. Enabling a source marks its candidates periodic,
//! creating records where needed, until the source runs dry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::record::ObjectId;
use crate::source::ObjectSource;
use crate::store::RecordStore;

/// Supplier of objects to enrol in periodic checks
pub trait CandidateSource: Send + Sync + fmt::Debug {
    /// Identifier used in configuration
    fn id(&self) -> &str;

    /// Up to `limit` existing objects that do not have periodic checks enabled
    fn candidates(&self, store: &dyn RecordStore, limit: usize) -> Result<Vec<ObjectId>>;
}

fn needs_enrolment(store: &dyn RecordStore, object: ObjectId) -> Result<bool> {
    Ok(!store
        .load_by_object(object)?
        .is_some_and(|record| record.periodic()))
}

/// Every object of an [`ObjectSource`]
#[derive(Debug)]
pub struct AllObjectsSource {
    id: String,
    objects: Arc<dyn ObjectSource>,
}

impl AllObjectsSource {
    /// Create a source named `id` over `objects`
    pub fn new(id: impl Into<String>, objects: Arc<dyn ObjectSource>) -> Self {
        Self {
            id: id.into(),
            objects,
        }
    }
}

impl CandidateSource for AllObjectsSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn candidates(&self, store: &dyn RecordStore, limit: usize) -> Result<Vec<ObjectId>> {
        let mut found = Vec::new();
        let mut after = 0;
        while found.len() < limit {
            let page = self
                .objects
                .list_after(after, limit.max(64))
                .map_err(|e| Error::Enumeration(format!("source '{}': {e}", self.id)))?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.get();
            for object in page {
                if found.len() >= limit {
                    break;
                }
                if needs_enrolment(store, object)? {
                    found.push(object);
                }
            }
        }
        Ok(found)
    }
}

/// A fixed list of object ids
#[derive(Debug)]
pub struct FixedListSource {
    id: String,
    ids: Vec<ObjectId>,
    objects: Arc<dyn ObjectSource>,
}

impl FixedListSource {
    /// Create a source named `id` over `ids`; ids missing from `objects` are skipped
    pub fn new(id: impl Into<String>, ids: Vec<ObjectId>, objects: Arc<dyn ObjectSource>) -> Self {
        Self {
            id: id.into(),
            ids,
            objects,
        }
    }
}

impl CandidateSource for FixedListSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn candidates(&self, store: &dyn RecordStore, limit: usize) -> Result<Vec<ObjectId>> {
        let mut found = Vec::new();
        for object in &self.ids {
            if found.len() >= limit {
                break;
            }
            let exists = self
                .objects
                .exists(*object)
                .map_err(|e| Error::Enumeration(format!("source '{}': {e}", self.id)))?;
            if exists && !found.contains(object) && needs_enrolment(store, *object)? {
                found.push(*object);
            }
        }
        Ok(found)
    }
}

/// Registered candidate sources by identifier
#[derive(Debug, Default, Clone)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn CandidateSource>>,
}

impl SourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, replacing any with the same identifier
    pub fn register(&mut self, source: Arc<dyn CandidateSource>) {
        self.sources.insert(source.id().to_string(), source);
    }

    /// Look up a source
    pub fn get(&self, id: &str) -> Result<Arc<dyn CandidateSource>> {
        self.sources
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownSource(id.to_string()))
    }

    /// Resolve configured identifiers in order
    pub fn resolve<S: AsRef<str>>(&self, ids: &[S]) -> Result<Vec<Arc<dyn CandidateSource>>> {
        ids.iter().map(|id| self.get(id.as_ref())).collect()
    }

    /// Whether a source is registered
    pub fn contains(&self, id: &str) -> bool {
        self.sources.contains_key(id)
    }

    /// Number of registered sources
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no source is registered
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

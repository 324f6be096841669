//! Object sources
//!
//! An [`ObjectSource`] is the catalogue of stored objects: it lists them in
//! ascending id order, opens their content and supplies the digests recorded
//! for them when they were ingested.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, ErrorKind, Read};
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hash::{AlgorithmSet, Checksums};
use crate::record::ObjectId;

/// Page size used by [`ObjectSource::list_all`]
const LIST_PAGE: usize = 1024;

/// Catalogue of stored objects
pub trait ObjectSource: Send + Sync + fmt::Debug {
    /// Up to `limit` objects with an id greater than `after`, ascending
    fn list_after(&self, after: u64, limit: usize) -> Result<Vec<ObjectId>>;

    /// Number of objects in the catalogue
    fn count(&self) -> Result<u64>;

    /// Whether the object is catalogued
    fn exists(&self, id: ObjectId) -> Result<bool>;

    /// Open the object's content, `None` if it cannot be located or opened
    fn open(&self, id: ObjectId) -> Result<Option<Box<dyn Read + Send>>>;

    /// Digests recorded for the object, empty when none were recorded
    fn recorded_checksums(&self, id: ObjectId) -> Result<Checksums>;

    /// Every object in ascending id order, fetched page by page
    fn list_all(&self) -> ListAll<'_, Self>
    where
        Self: Sized,
    {
        ListAll::new(self)
    }
}

/// Iterator returned by [`ObjectSource::list_all`]
pub struct ListAll<'a, S: ?Sized> {
    source: &'a S,
    after: u64,
    page: std::vec::IntoIter<ObjectId>,
    done: bool,
}

impl<'a, S: ObjectSource + ?Sized> ListAll<'a, S> {
    /// Start listing from the first object of `source`
    pub fn new(source: &'a S) -> Self {
        Self {
            source,
            after: 0,
            page: Vec::new().into_iter(),
            done: false,
        }
    }
}

impl<S: ObjectSource + ?Sized> Iterator for ListAll<'_, S> {
    type Item = Result<ObjectId>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(id) = self.page.next() {
                self.after = id.get();
                return Some(Ok(id));
            }
            if self.done {
                return None;
            }
            match self.source.list_after(self.after, LIST_PAGE) {
                Ok(page) => {
                    self.done = page.len() < LIST_PAGE;
                    self.page = page.into_iter();
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryObject {
    content: Option<Vec<u8>>,
    checksums: Checksums,
    fail_reads: bool,
}

/// In-memory object catalogue
#[derive(Debug, Default)]
pub struct MemoryObjectSource {
    objects: RwLock<BTreeMap<ObjectId, MemoryObject>>,
}

impl MemoryObjectSource {
    /// Create an empty catalogue
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalogue an object with explicit recorded digests
    pub fn insert(&self, id: ObjectId, content: impl Into<Vec<u8>>, checksums: Checksums) {
        self.objects.write().insert(
            id,
            MemoryObject {
                content: Some(content.into()),
                checksums,
                fail_reads: false,
            },
        );
    }

    /// Catalogue an object, recording digests of its content for `algorithms`
    pub fn insert_with_digests(
        &self,
        id: ObjectId,
        content: impl Into<Vec<u8>>,
        algorithms: &AlgorithmSet,
    ) {
        let content = content.into();
        let checksums = algorithms
            .iter()
            .map(|a| (a.name().to_string(), a.digest_hex(&content)))
            .collect();
        self.insert(id, content, checksums);
    }

    /// Replace an object's content, keeping its recorded digests
    pub fn set_content(&self, id: ObjectId, content: impl Into<Vec<u8>>) -> bool {
        match self.objects.write().get_mut(&id) {
            Some(object) => {
                object.content = Some(content.into());
                true
            }
            None => false,
        }
    }

    /// Lose an object's content while keeping it catalogued
    pub fn remove_content(&self, id: ObjectId) -> bool {
        match self.objects.write().get_mut(&id) {
            Some(object) => object.content = None,
            None => return false,
        }
        true
    }

    /// Make reads of an object fail after it is opened
    pub fn fail_reads(&self, id: ObjectId, fail: bool) -> bool {
        match self.objects.write().get_mut(&id) {
            Some(object) => object.fail_reads = fail,
            None => return false,
        }
        true
    }

    /// Replace the recorded digests of an object
    pub fn set_checksums(&self, id: ObjectId, checksums: Checksums) -> bool {
        match self.objects.write().get_mut(&id) {
            Some(object) => object.checksums = checksums,
            None => return false,
        }
        true
    }

    /// Remove an object from the catalogue
    pub fn remove(&self, id: ObjectId) -> bool {
        self.objects.write().remove(&id).is_some()
    }
}

impl ObjectSource for MemoryObjectSource {
    fn list_after(&self, after: u64, limit: usize) -> Result<Vec<ObjectId>> {
        Ok(self
            .objects
            .read()
            .range(ObjectId(after.saturating_add(1))..)
            .take(limit)
            .map(|(id, _)| *id)
            .collect())
    }

    fn count(&self) -> Result<u64> {
        Ok(self.objects.read().len() as u64)
    }

    fn exists(&self, id: ObjectId) -> Result<bool> {
        Ok(self.objects.read().contains_key(&id))
    }

    fn open(&self, id: ObjectId) -> Result<Option<Box<dyn Read + Send>>> {
        let objects = self.objects.read();
        let Some(object) = objects.get(&id) else {
            return Ok(None);
        };
        let Some(content) = object.content.clone() else {
            return Ok(None);
        };
        if object.fail_reads {
            return Ok(Some(Box::new(FailingRead)));
        }
        Ok(Some(Box::new(Cursor::new(content))))
    }

    fn recorded_checksums(&self, id: ObjectId) -> Result<Checksums> {
        Ok(self
            .objects
            .read()
            .get(&id)
            .map(|object| object.checksums.clone())
            .unwrap_or_default())
    }
}

struct FailingRead;

impl Read for FailingRead {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(ErrorKind::Other, "simulated read failure"))
    }
}

/// One entry of a filesystem manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the source root
    pub path: PathBuf,
    /// Recorded digests, hex encoded, keyed by algorithm name
    #[serde(default)]
    pub checksums: Checksums,
}

/// JSON manifest describing a directory of objects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Entries keyed by object id
    #[serde(default)]
    pub objects: BTreeMap<u64, ManifestEntry>,
}

impl Manifest {
    /// Parse a manifest from JSON
    pub fn from_json(json: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        for (id, entry) in &self.objects {
            if *id == 0 {
                return Err(Error::Config("object id 0 is reserved".into()));
            }
            let escapes = entry
                .path
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
            if escapes || entry.path.as_os_str().is_empty() {
                return Err(Error::Config(format!(
                    "object {id}: path '{}' must be relative to the source root",
                    entry.path.display()
                )));
            }
        }
        Ok(())
    }
}

/// Objects stored as files under a root directory, described by a manifest
#[derive(Debug)]
pub struct FsObjectSource {
    root: PathBuf,
    manifest: RwLock<Manifest>,
}

impl FsObjectSource {
    /// Create a source over `root` described by `manifest`
    pub fn new(root: impl Into<PathBuf>, manifest: Manifest) -> Result<Self> {
        manifest.validate()?;
        Ok(Self {
            root: root.into(),
            manifest: RwLock::new(manifest),
        })
    }

    /// Load the manifest from a JSON file
    pub fn from_manifest_file(root: impl Into<PathBuf>, manifest: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(manifest)?;
        Self::new(root, Manifest::from_json(&json)?)
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Replace the manifest
    pub fn reload(&self, manifest: Manifest) -> Result<()> {
        manifest.validate()?;
        *self.manifest.write() = manifest;
        Ok(())
    }
}

impl ObjectSource for FsObjectSource {
    fn list_after(&self, after: u64, limit: usize) -> Result<Vec<ObjectId>> {
        Ok(self
            .manifest
            .read()
            .objects
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(id, _)| ObjectId(*id))
            .collect())
    }

    fn count(&self) -> Result<u64> {
        Ok(self.manifest.read().objects.len() as u64)
    }

    fn exists(&self, id: ObjectId) -> Result<bool> {
        Ok(self.manifest.read().objects.contains_key(&id.get()))
    }

    fn open(&self, id: ObjectId) -> Result<Option<Box<dyn Read + Send>>> {
        let path = match self.manifest.read().objects.get(&id.get()) {
            Some(entry) => self.root.join(&entry.path),
            None => return Ok(None),
        };
        match File::open(&path) {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(object_id = %id, path = %path.display(), "object file not found");
                Ok(None)
            }
            Err(e) => {
                warn!(object_id = %id, path = %path.display(), error = %e, "object file could not be opened");
                Ok(None)
            }
        }
    }

    fn recorded_checksums(&self, id: ObjectId) -> Result<Checksums> {
        Ok(self
            .manifest
            .read()
            .objects
            .get(&id.get())
            .map(|entry| entry.checksums.clone())
            .unwrap_or_default())
    }
}

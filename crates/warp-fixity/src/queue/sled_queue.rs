//! Durable work queue using sled

use std::path::Path;
use std::sync::Arc;

use sled::{Db, Tree};
use tracing::info;

use super::{QueueItem, WorkQueue};
use crate::error::Result;

const TREE_QUEUE: &str = "fixity_queue";

/// Work queue persisted in a sled tree, keyed by a monotonically increasing
/// sequence number
#[derive(Debug, Clone)]
pub struct SledWorkQueue {
    db: Arc<Db>,
    items: Tree,
}

impl SledWorkQueue {
    /// Open or create a queue at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(Arc::new(db))
    }

    /// Create from an existing sled database
    pub fn from_db(db: Arc<Db>) -> Result<Self> {
        let items = db.open_tree(TREE_QUEUE)?;
        info!(depth = items.len(), "Opened fixity work queue");
        Ok(Self { db, items })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.items.flush()?;
        Ok(())
    }
}

impl WorkQueue for SledWorkQueue {
    fn enqueue(&self, item: QueueItem) -> Result<bool> {
        let seq = self.db.generate_id()?;
        self.items
            .insert(seq.to_be_bytes(), rmp_serde::to_vec(&item)?)?;
        Ok(true)
    }

    fn dequeue(&self) -> Result<Option<QueueItem>> {
        match self.items.pop_min()? {
            Some((_, value)) => Ok(Some(rmp_serde::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn depth(&self) -> Result<u64> {
        Ok(self.items.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ObjectId;
    use tempfile::TempDir;

    #[test]
    fn test_items_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let queue = SledWorkQueue::open(dir.path()).unwrap();
            for id in 1..=3 {
                queue
                    .enqueue(QueueItem {
                        record_id: id,
                        object_id: ObjectId(id * 10),
                        queued_at: 5,
                    })
                    .unwrap();
            }
            assert_eq!(queue.dequeue().unwrap().unwrap().record_id, 1);
            queue.flush().unwrap();
        }

        let queue = SledWorkQueue::open(dir.path()).unwrap();
        assert_eq!(queue.depth().unwrap(), 2);
        let next = queue.dequeue().unwrap().unwrap();
        assert_eq!(next.record_id, 2);
        assert_eq!(next.object_id, ObjectId(20));
    }
}

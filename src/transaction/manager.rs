//! Transaction Scope
//!
//! One [`TransactionMgr`] is opened per logical operation or loader pass.
//! It records every transactional object the operation touches and drives
//! the commit or rollback of all of them together.

use super::{TransactionObject, TxId};
use crate::error::{DbError, Error, Result};
use crate::persistence::{Database, DbBatch};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of a successful commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// Number of transactional objects that were touched
    pub objects: usize,
    /// Number of writes applied to the backing store
    pub writes: usize,
}

/// A transaction scope
pub struct TransactionMgr {
    id: TxId,
    db: Arc<dyn Database>,
    touched: Mutex<IndexMap<usize, Arc<dyn TransactionObject>>>,
    commits: AtomicU64,
}

impl TransactionMgr {
    /// Opens a new scope against `db`
    pub fn new(db: Arc<dyn Database>) -> Self {
        let id = TxId(NEXT_TX_ID.fetch_add(1, Ordering::Relaxed));
        debug!("Opened transaction scope {}", id);
        Self {
            id,
            db,
            touched: Mutex::new(IndexMap::new()),
            commits: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    /// Registers a touched object; later registrations of the same object keep
    /// its original position
    pub fn register(&self, object: Arc<dyn TransactionObject>) {
        let key = Arc::as_ptr(&object) as *const () as usize;
        self.touched.lock().entry(key).or_insert(object);
    }

    /// Number of objects touched since the last commit or rollback
    pub fn touched_count(&self) -> usize {
        self.touched.lock().len()
    }

    /// Whether any touched object still has staged changes
    pub fn is_dirty(&self) -> bool {
        let objects = self.snapshot();
        objects.iter().any(|object| object.is_dirty(self.id))
    }

    /// Number of successful commits performed by this scope
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Flushes every touched object in touch order and applies the resulting
    /// batch as one unit. On any failure the in-memory state is rolled back.
    pub fn commit(&self) -> Result<CommitStats> {
        let objects = self.snapshot();
        if objects.is_empty() {
            return Ok(CommitStats::default());
        }

        let mut batch = DbBatch::new();
        for object in &objects {
            if let Err(err) = object.flush(self.id, &mut batch) {
                debug!("Flush failed in {}: {}", self.id, err);
                self.rollback_objects(&objects);
                return Err(err);
            }
        }

        let writes = batch.len();
        if !batch.is_empty() {
            match self.db.apply(batch) {
                Ok(()) => {}
                Err(DbError::PartialApply { applied, total }) => {
                    error!(
                        "Transaction {} partially applied ({} of {} writes); backing store is inconsistent",
                        self.id, applied, total
                    );
                    self.rollback_objects(&objects);
                    return Err(Error::PartialCommit {
                        tx_id: self.id.value(),
                        reason: format!("{} of {} writes applied", applied, total),
                    });
                }
                Err(err) => {
                    debug!("Backing store rejected {}: {}", self.id, err);
                    self.rollback_objects(&objects);
                    return Err(Error::Persistence(err));
                }
            }
        }

        for object in &objects {
            object.commit(self.id);
        }
        self.touched.lock().clear();
        self.commits.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Committed {}: {} objects, {} writes",
            self.id,
            objects.len(),
            writes
        );
        Ok(CommitStats {
            objects: objects.len(),
            writes,
        })
    }

    /// Discards every staged change of this scope
    pub fn rollback(&self) {
        let objects = self.snapshot();
        if !objects.is_empty() {
            debug!("Rolling back {}: {} objects", self.id, objects.len());
        }
        self.rollback_objects(&objects);
    }

    fn rollback_objects(&self, objects: &[Arc<dyn TransactionObject>]) {
        for object in objects.iter().rev() {
            object.rollback(self.id);
        }
        self.touched.lock().clear();
    }

    fn snapshot(&self) -> Vec<Arc<dyn TransactionObject>> {
        self.touched.lock().values().cloned().collect()
    }
}

impl Drop for TransactionMgr {
    fn drop(&mut self) {
        if self.is_dirty() {
            warn!("Transaction {} dropped with uncommitted changes; rolling back", self.id);
        }
        // also releases the scope locks of a clean scope
        self.rollback();
    }
}

impl std::fmt::Debug for TransactionMgr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionMgr")
            .field("id", &self.id)
            .field("touched", &self.touched_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryDatabase;
    use crate::persistence::SingleColumnDatabaseDriver;
    use crate::error::DbResult;
    use crate::transaction::{TransactionMap, TransactionSimpleObject};
    use assert_matches::assert_matches;

    struct RecordingColumn {
        table: &'static str,
        key: String,
    }

    impl SingleColumnDatabaseDriver<u64> for RecordingColumn {
        fn update(&self, batch: &mut DbBatch, value: &u64) -> DbResult<()> {
            batch.put(self.table, self.key.clone(), serde_json::json!({ "value": value }));
            Ok(())
        }
    }

    fn cell(key: &str, value: u64) -> TransactionSimpleObject<u64> {
        TransactionSimpleObject::new(
            value,
            Some(Arc::new(RecordingColumn {
                table: "cells",
                key: key.to_string(),
            })),
        )
    }

    #[test]
    fn test_commit_flushes_in_touch_order() {
        let db = MemoryDatabase::in_memory();
        let tx = TransactionMgr::new(db.clone());
        let first = cell("b", 1);
        let second = cell("a", 1);

        first.set(&tx, 2).unwrap();
        second.set(&tx, 3).unwrap();
        first.set(&tx, 4).unwrap();
        assert_eq!(tx.touched_count(), 2);

        let stats = tx.commit().unwrap();
        assert_eq!(stats, CommitStats { objects: 2, writes: 2 });

        let journal = db.journal();
        assert_eq!(journal.len(), 1);
        let keys: Vec<_> = journal[0].writes.iter().map(|w| w.key().to_string()).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(first.get(), 4);
        assert!(!first.is_dirty());
    }

    #[test]
    fn test_rollback_restores_values() {
        let db = MemoryDatabase::in_memory();
        let tx = TransactionMgr::new(db.clone());
        let value = cell("x", 10);
        let map: TransactionMap<String, u64> = TransactionMap::new(None);

        value.set(&tx, 11).unwrap();
        map.insert(&tx, "k".into(), 1).unwrap();
        assert!(tx.is_dirty());

        tx.rollback();
        assert_eq!(value.get(), 10);
        assert!(map.get(&"k".to_string()).is_none());
        assert!(!tx.is_dirty());
        assert!(db.journal().is_empty());
    }

    #[test]
    fn test_unchanged_value_is_not_flushed() {
        let db = MemoryDatabase::in_memory();
        let tx = TransactionMgr::new(db.clone());
        let value = cell("x", 10);

        value.set(&tx, 12).unwrap();
        value.set(&tx, 10).unwrap();
        let stats = tx.commit().unwrap();
        assert_eq!(stats.writes, 0);
        assert!(db.journal().is_empty());
    }

    #[test]
    fn test_rejected_batch_rolls_back_everything() {
        let db = MemoryDatabase::in_memory();
        let tx = TransactionMgr::new(db.clone());
        let a = cell("a", 1);
        let b = cell("b", 1);
        a.set(&tx, 2).unwrap();
        b.set(&tx, 2).unwrap();

        db.reject_next(Some("cells"), None);
        assert_matches!(tx.commit(), Err(Error::Persistence(DbError::Rejected(_))));
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 1);
        assert!(db.journal().is_empty());
        assert!(db.select_all("cells").unwrap().is_empty());
    }

    #[test]
    fn test_partial_apply_is_fatal() {
        let db = MemoryDatabase::in_memory();
        let tx = TransactionMgr::new(db.clone());
        let a = cell("a", 1);
        let b = cell("b", 1);
        a.set(&tx, 2).unwrap();
        b.set(&tx, 2).unwrap();

        db.fail_partially_after(1);
        let err = tx.commit().unwrap_err();
        assert_matches!(err, Error::PartialCommit { .. });
        assert!(err.is_defect());
    }

    #[test]
    fn test_drop_rolls_back_dirty_scope() {
        let db = MemoryDatabase::in_memory();
        let value = cell("x", 1);
        {
            let tx = TransactionMgr::new(db.clone());
            value.set(&tx, 5).unwrap();
        }
        assert_eq!(value.get(), 1);
        assert!(!value.is_dirty());
    }
}

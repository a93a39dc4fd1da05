//! Scope Lock
//!
//! Per-entity lock that one transaction scope holds from its first use of
//! the entity until the scope commits or rolls back. Acquisition never
//! blocks: a scope asking for a lock held by another scope fails with
//! [`Error::TransactionConflict`], so two scopes can never wait on each
//! other.

use super::{TransactionMgr, TransactionObject, TxId};
use crate::error::{Error, Result};
use crate::persistence::DbBatch;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

struct LockCell {
    holder: Mutex<Option<TxId>>,
}

impl LockCell {
    fn release(&self, tx: TxId) {
        let mut holder = self.holder.lock();
        if *holder == Some(tx) {
            *holder = None;
        }
    }
}

/// Lock held by a transaction scope until it ends
#[derive(Clone)]
pub struct ScopeLock {
    inner: Arc<LockCell>,
}

impl ScopeLock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LockCell {
                holder: Mutex::new(None),
            }),
        }
    }

    /// Takes the lock for `tx`. Taking a lock the scope already holds is a
    /// no-op.
    pub fn acquire(&self, tx: &TransactionMgr) -> Result<()> {
        {
            let mut holder = self.inner.holder.lock();
            match *holder {
                Some(owner) if owner == tx.id() => return Ok(()),
                Some(owner) => {
                    return Err(Error::TransactionConflict {
                        owner: owner.value(),
                        requester: tx.id().value(),
                    })
                }
                None => *holder = Some(tx.id()),
            }
        }
        tx.register(self.inner.clone());
        Ok(())
    }

    /// Scope currently holding the lock
    pub fn holder(&self) -> Option<TxId> {
        *self.inner.holder.lock()
    }
}

impl Default for ScopeLock {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionObject for LockCell {
    fn flush(&self, _tx: TxId, _batch: &mut DbBatch) -> Result<()> {
        Ok(())
    }

    fn commit(&self, tx: TxId) {
        self.release(tx);
    }

    fn rollback(&self, tx: TxId) {
        self.release(tx);
    }

    fn is_dirty(&self, _tx: TxId) -> bool {
        false
    }
}

impl fmt::Debug for ScopeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeLock").field("holder", &self.holder()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryDatabase;
    use assert_matches::assert_matches;

    #[test]
    fn test_held_until_scope_ends() {
        let db = MemoryDatabase::in_memory();
        let first = TransactionMgr::new(db.clone());
        let second = TransactionMgr::new(db.clone());
        let lock = ScopeLock::new();

        lock.acquire(&first).unwrap();
        lock.acquire(&first).unwrap();
        assert_eq!(first.touched_count(), 1);
        assert_matches!(lock.acquire(&second), Err(Error::TransactionConflict { .. }));

        first.commit().unwrap();
        assert_eq!(lock.holder(), None);
        lock.acquire(&second).unwrap();
        second.rollback();
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn test_dropped_scope_releases_lock() {
        let db = MemoryDatabase::in_memory();
        let lock = ScopeLock::new();
        {
            let tx = TransactionMgr::new(db.clone());
            lock.acquire(&tx).unwrap();
            assert!(!tx.is_dirty());
        }
        assert_eq!(lock.holder(), None);
    }
}

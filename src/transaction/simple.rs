//! Transactional Simple Object
//!
//! A cell holding one value plus an optional column driver. The first
//! mutation by a scope keeps the original value as a backup; the driver is
//! only called at commit when the staged value differs from that backup.

use super::{TransactionMgr, TransactionObject, TxId, TxValue};
use crate::error::{Error, Result};
use crate::persistence::{DbBatch, SingleColumnDatabaseDriver};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

struct Staged<T> {
    owner: TxId,
    original: T,
}

struct CellState<T> {
    value: T,
    staged: Option<Staged<T>>,
}

struct SimpleCell<T> {
    state: Mutex<CellState<T>>,
    driver: Option<Arc<dyn SingleColumnDatabaseDriver<T>>>,
}

/// Transactional wrapper around a single value
pub struct TransactionSimpleObject<T> {
    inner: Arc<SimpleCell<T>>,
}

impl<T: TxValue> TransactionSimpleObject<T> {
    pub fn new(value: T, driver: Option<Arc<dyn SingleColumnDatabaseDriver<T>>>) -> Self {
        Self {
            inner: Arc::new(SimpleCell {
                state: Mutex::new(CellState {
                    value,
                    staged: None,
                }),
                driver,
            }),
        }
    }

    /// Current value, including uncommitted changes
    pub fn get(&self) -> T {
        self.inner.state.lock().value.clone()
    }

    /// Borrow the current value without cloning it
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.state.lock().value)
    }

    /// Stages `value` in `tx` and returns the previous value
    pub fn set(&self, tx: &TransactionMgr, value: T) -> Result<T> {
        self.update(tx, |_| value).map(|(old, _)| old)
    }

    /// Read-modify-write of the value under the cell lock; returns the old and
    /// the new value
    pub fn update(&self, tx: &TransactionMgr, f: impl FnOnce(&T) -> T) -> Result<(T, T)> {
        self.try_update(tx, |value| Some(f(value)))?
            .ok_or_else(|| Error::implementation("cell update produced no value"))
    }

    /// Like [`update`](Self::update), but `f` may decline the change by
    /// returning `None`. A declined change neither stages the cell nor
    /// registers it with `tx`. Values staged by another scope are never
    /// read; that case is a conflict.
    pub fn try_update(&self, tx: &TransactionMgr, f: impl FnOnce(&T) -> Option<T>) -> Result<Option<(T, T)>> {
        let (register, old, new_value) = {
            let mut state = self.inner.state.lock();
            let first_touch = match &state.staged {
                Some(staged) if staged.owner != tx.id() => {
                    return Err(Error::TransactionConflict {
                        owner: staged.owner.value(),
                        requester: tx.id().value(),
                    });
                }
                Some(_) => false,
                None => true,
            };
            let Some(new_value) = f(&state.value) else {
                return Ok(None);
            };
            if first_touch {
                let original = state.value.clone();
                state.staged = Some(Staged {
                    owner: tx.id(),
                    original,
                });
            }
            let old = std::mem::replace(&mut state.value, new_value.clone());
            (first_touch, old, new_value)
        };

        if register {
            tx.register(self.inner.clone());
        }
        Ok(Some((old, new_value)))
    }

    /// Whether some scope holds uncommitted changes on this cell
    pub fn is_dirty(&self) -> bool {
        self.inner.state.lock().staged.is_some()
    }
}

impl<T: TxValue> TransactionObject for SimpleCell<T> {
    fn flush(&self, tx: TxId, batch: &mut DbBatch) -> Result<()> {
        let changed = {
            let state = self.state.lock();
            match &state.staged {
                Some(staged) if staged.owner == tx && staged.original != state.value => {
                    Some(state.value.clone())
                }
                _ => None,
            }
        };
        if let (Some(value), Some(driver)) = (changed, &self.driver) {
            driver.update(batch, &value)?;
        }
        Ok(())
    }

    fn commit(&self, tx: TxId) {
        let mut state = self.state.lock();
        if matches!(&state.staged, Some(staged) if staged.owner == tx) {
            state.staged = None;
        }
    }

    fn rollback(&self, tx: TxId) {
        let mut state = self.state.lock();
        if matches!(&state.staged, Some(staged) if staged.owner == tx) {
            if let Some(staged) = state.staged.take() {
                state.value = staged.original;
            }
        }
    }

    fn is_dirty(&self, tx: TxId) -> bool {
        matches!(&self.state.lock().staged, Some(staged) if staged.owner == tx)
    }
}

impl<T: TxValue + fmt::Debug> fmt::Debug for TransactionSimpleObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("TransactionSimpleObject")
            .field("value", &state.value)
            .field("dirty", &state.staged.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryDatabase;
    use assert_matches::assert_matches;

    #[test]
    fn test_set_and_commit() {
        let db = MemoryDatabase::in_memory();
        let tx = TransactionMgr::new(db);
        let cell = TransactionSimpleObject::new(String::from("a"), None);

        assert_eq!(cell.set(&tx, "b".into()).unwrap(), "a");
        assert!(cell.is_dirty());
        tx.commit().unwrap();
        assert_eq!(cell.get(), "b");
        assert!(!cell.is_dirty());
    }

    #[test]
    fn test_conflicting_scopes() {
        let db = MemoryDatabase::in_memory();
        let first = TransactionMgr::new(db.clone());
        let second = TransactionMgr::new(db);
        let cell = TransactionSimpleObject::new(1u32, None);

        cell.set(&first, 2).unwrap();
        assert_matches!(
            cell.set(&second, 3),
            Err(Error::TransactionConflict { .. })
        );

        first.commit().unwrap();
        cell.set(&second, 3).unwrap();
        second.rollback();
        assert_eq!(cell.get(), 2);
    }

    #[test]
    fn test_declined_update_stages_nothing() {
        let db = MemoryDatabase::in_memory();
        let first = TransactionMgr::new(db.clone());
        let second = TransactionMgr::new(db);
        let cell = TransactionSimpleObject::new(0b0001u64, None);

        assert_eq!(cell.try_update(&first, |_| None).unwrap(), None);
        assert!(!cell.is_dirty());
        assert_eq!(first.touched_count(), 0);

        cell.try_update(&first, |bits| Some(bits | 0b0100)).unwrap();
        assert_matches!(
            cell.try_update(&second, |_| None),
            Err(Error::TransactionConflict { .. })
        );
    }

    #[test]
    fn test_update_reads_current_value() {
        let db = MemoryDatabase::in_memory();
        let tx = TransactionMgr::new(db);
        let cell = TransactionSimpleObject::new(0b0101u64, None);

        let (old, new) = cell.update(&tx, |bits| bits | 0b0010).unwrap();
        assert_eq!((old, new), (0b0101, 0b0111));
        tx.rollback();
        assert_eq!(cell.with(|bits| *bits), 0b0101);
    }
}

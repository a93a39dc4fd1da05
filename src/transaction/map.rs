//! Transactional Map
//!
//! An ordered map whose mutations are staged per key. Ownership of staged
//! changes is tracked per key, so two scopes may add disjoint entries to the
//! same shared map and commit them independently.

use super::{TransactionMgr, TransactionObject, TxId};
use crate::error::{DbResult, Error, Result};
use crate::persistence::DbBatch;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Driver invoked at commit for every key a scope changed
pub trait MapDatabaseDriver<K, V>: Send + Sync {
    /// `old` is the value before the scope, `new` the value being committed
    fn persist(&self, batch: &mut DbBatch, key: &K, old: Option<&V>, new: Option<&V>) -> DbResult<()>;
}

struct StagedEntry<V> {
    owner: TxId,
    original: Option<V>,
}

struct MapState<K, V> {
    entries: BTreeMap<K, V>,
    staged: BTreeMap<K, StagedEntry<V>>,
}

struct MapCell<K, V> {
    state: Mutex<MapState<K, V>>,
    driver: Option<Arc<dyn MapDatabaseDriver<K, V>>>,
}

/// Transactional wrapper around an ordered map
pub struct TransactionMap<K, V> {
    inner: Arc<MapCell<K, V>>,
}

impl<K, V> TransactionMap<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(driver: Option<Arc<dyn MapDatabaseDriver<K, V>>>) -> Self {
        Self {
            inner: Arc::new(MapCell {
                state: Mutex::new(MapState {
                    entries: BTreeMap::new(),
                    staged: BTreeMap::new(),
                }),
                driver,
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.state.lock().entries.get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.state.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().entries.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.inner.state.lock().entries.keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<V> {
        self.inner.state.lock().entries.values().cloned().collect()
    }

    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .state
            .lock()
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Copy of the current entries
    pub fn to_map(&self) -> BTreeMap<K, V> {
        self.inner.state.lock().entries.clone()
    }

    /// Stages an insert and returns the replaced value
    pub fn insert(&self, tx: &TransactionMgr, key: K, value: V) -> Result<Option<V>> {
        let (register, old) = {
            let mut state = self.inner.state.lock();
            let register = Self::stage(&mut state, tx.id(), &key)?;
            (register, state.entries.insert(key, value))
        };
        if register {
            tx.register(self.inner.clone());
        }
        Ok(old)
    }

    /// Stages a removal and returns the removed value
    pub fn remove(&self, tx: &TransactionMgr, key: &K) -> Result<Option<V>> {
        let (register, old) = {
            let mut state = self.inner.state.lock();
            if !state.entries.contains_key(key) {
                return Ok(None);
            }
            let register = Self::stage(&mut state, tx.id(), key)?;
            (register, state.entries.remove(key))
        };
        if register {
            tx.register(self.inner.clone());
        }
        Ok(old)
    }

    /// Stages the removal of every entry
    pub fn clear(&self, tx: &TransactionMgr) -> Result<()> {
        for key in self.keys() {
            self.remove(tx, &key)?;
        }
        Ok(())
    }

    /// Inserts an entry of a freshly restored object without staging it.
    /// Only valid while nothing else can observe the map.
    pub(crate) fn restore(&self, key: K, value: V) {
        self.inner.state.lock().entries.insert(key, value);
    }

    /// Whether some scope holds uncommitted changes on this map
    pub fn is_dirty(&self) -> bool {
        !self.inner.state.lock().staged.is_empty()
    }

    fn stage(state: &mut MapState<K, V>, tx: TxId, key: &K) -> Result<bool> {
        match state.staged.get(key) {
            Some(staged) if staged.owner != tx => Err(Error::TransactionConflict {
                owner: staged.owner.value(),
                requester: tx.value(),
            }),
            Some(_) => Ok(false),
            None => {
                let original = state.entries.get(key).cloned();
                state.staged.insert(
                    key.clone(),
                    StagedEntry {
                        owner: tx,
                        original,
                    },
                );
                Ok(true)
            }
        }
    }
}

impl<K, V> TransactionObject for MapCell<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn flush(&self, tx: TxId, batch: &mut DbBatch) -> Result<()> {
        let Some(driver) = &self.driver else {
            return Ok(());
        };
        let changes: Vec<(K, Option<V>, Option<V>)> = {
            let state = self.state.lock();
            state
                .staged
                .iter()
                .filter(|(_, staged)| staged.owner == tx)
                .map(|(key, staged)| {
                    (
                        key.clone(),
                        staged.original.clone(),
                        state.entries.get(key).cloned(),
                    )
                })
                .collect()
        };
        for (key, old, new) in &changes {
            driver.persist(batch, key, old.as_ref(), new.as_ref())?;
        }
        Ok(())
    }

    fn commit(&self, tx: TxId) {
        self.state.lock().staged.retain(|_, staged| staged.owner != tx);
    }

    fn rollback(&self, tx: TxId) {
        let mut state = self.state.lock();
        let owned: Vec<K> = state
            .staged
            .iter()
            .filter(|(_, staged)| staged.owner == tx)
            .map(|(key, _)| key.clone())
            .collect();
        for key in owned {
            if let Some(staged) = state.staged.remove(&key) {
                match staged.original {
                    Some(value) => {
                        state.entries.insert(key, value);
                    }
                    None => {
                        state.entries.remove(&key);
                    }
                }
            }
        }
    }

    fn is_dirty(&self, tx: TxId) -> bool {
        self.state
            .lock()
            .staged
            .values()
            .any(|staged| staged.owner == tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryDatabase;
    use crate::persistence::Database;
    use assert_matches::assert_matches;

    struct KeyValueDriver;

    impl MapDatabaseDriver<String, String> for KeyValueDriver {
        fn persist(
            &self,
            batch: &mut DbBatch,
            key: &String,
            old: Option<&String>,
            new: Option<&String>,
        ) -> DbResult<()> {
            if old == new {
                return Ok(());
            }
            match new {
                Some(value) => batch.put("kv", key.clone(), serde_json::json!({ "value": value })),
                None => batch.delete("kv", key.clone()),
            }
            Ok(())
        }
    }

    #[test]
    fn test_disjoint_keys_from_two_scopes() {
        let db = MemoryDatabase::in_memory();
        let first = TransactionMgr::new(db.clone());
        let second = TransactionMgr::new(db.clone());
        let map: TransactionMap<String, u32> = TransactionMap::new(None);

        map.insert(&first, "a".into(), 1).unwrap();
        map.insert(&second, "b".into(), 2).unwrap();
        assert_matches!(
            map.insert(&second, "a".into(), 3),
            Err(Error::TransactionConflict { .. })
        );

        first.commit().unwrap();
        second.rollback();
        assert_eq!(map.keys(), vec!["a".to_string()]);
        assert!(!map.is_dirty());
    }

    #[test]
    fn test_rollback_restores_replaced_and_removed_entries() {
        let db = MemoryDatabase::in_memory();
        let tx = TransactionMgr::new(db);
        let map: TransactionMap<u32, &'static str> = TransactionMap::new(None);
        map.restore(1, "one");
        map.restore(2, "two");

        map.insert(&tx, 1, "uno").unwrap();
        map.remove(&tx, &2).unwrap();
        map.insert(&tx, 3, "three").unwrap();
        tx.rollback();

        assert_eq!(map.to_map(), BTreeMap::from([(1, "one"), (2, "two")]));
    }

    #[test]
    fn test_driver_sees_net_change_only() {
        let db = MemoryDatabase::in_memory();
        let tx = TransactionMgr::new(db.clone());
        let map: TransactionMap<String, String> = TransactionMap::new(Some(Arc::new(KeyValueDriver)));

        map.insert(&tx, "kept".into(), "v1".into()).unwrap();
        map.insert(&tx, "transient".into(), "x".into()).unwrap();
        map.remove(&tx, &"transient".to_string()).unwrap();
        let stats = tx.commit().unwrap();

        assert_eq!(stats.writes, 1);
        let rows = db.select_all("kv").unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_remove_of_missing_key_touches_nothing() {
        let db = MemoryDatabase::in_memory();
        let tx = TransactionMgr::new(db);
        let map: TransactionMap<u32, u32> = TransactionMap::new(None);
        assert_eq!(map.remove(&tx, &7).unwrap(), None);
        assert_eq!(tx.touched_count(), 0);
    }
}

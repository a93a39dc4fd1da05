//! Properties Container
//!
//! Namespaced, ordered string map attached to every entity. Keys are paths
//! separated by `/`; a namespace is a key prefix. Every change is staged in
//! a transactional map and persisted as one row per key.
//!
//! Entities never hand out the container itself. Callers get a
//! [`SecureProps`] view that checks the protection object of the entity
//! first.

use crate::error::{DbResult, Error, Result};
use crate::persistence::{DbBatch, EntityDatabaseDriver, PersistedRow, PropsRow};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{MapDatabaseDriver, ScopeLock, TransactionMap, TransactionMgr};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

pub const PATH_SEPARATOR: char = '/';
pub const MAX_KEY_LENGTH: usize = 256;

/// Well-known property keys
pub mod keys {
    /// Storage pool used for new volumes
    pub const STOR_POOL_NAME: &str = "StorPoolName";
}

struct PropsMapDriver {
    instance: String,
    driver: Arc<dyn EntityDatabaseDriver<PropsRow>>,
}

impl MapDatabaseDriver<String, String> for PropsMapDriver {
    fn persist(&self, batch: &mut DbBatch, key: &String, old: Option<&String>, new: Option<&String>) -> DbResult<()> {
        if old == new {
            return Ok(());
        }
        match new {
            Some(value) => self.driver.put(
                batch,
                &PropsRow {
                    instance: self.instance.clone(),
                    key: key.clone(),
                    value: value.clone(),
                },
            ),
            None => self.driver.delete(batch, &PropsRow::key_of(&self.instance, key)),
        }
    }
}

/// Builds the normalized full key of `key` within `namespace`
pub fn full_key(key: &str, namespace: Option<&str>) -> Result<String> {
    let joined = match namespace {
        Some(namespace) => format!("{}{}{}", namespace, PATH_SEPARATOR, key),
        None => key.to_string(),
    };
    let invalid = |reason: &str| Error::InvalidKey {
        key: joined.clone(),
        reason: reason.to_string(),
    };

    let segments: Vec<&str> = joined
        .trim_matches(PATH_SEPARATOR)
        .split(PATH_SEPARATOR)
        .collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(invalid("empty path segment"));
    }
    let normalized = segments.join("/");
    if normalized.len() > MAX_KEY_LENGTH {
        return Err(invalid("key too long"));
    }
    Ok(normalized)
}

fn namespace_prefix(namespace: &str) -> Result<String> {
    Ok(format!("{}{}", full_key(namespace, None)?, PATH_SEPARATOR))
}

/// Property map of one entity instance
pub struct PropsContainer {
    instance: String,
    map: TransactionMap<String, String>,
    scope_lock: Option<ScopeLock>,
}

impl PropsContainer {
    /// `instance` is the object path of the owning entity
    pub fn new(instance: impl Into<String>, driver: Arc<dyn EntityDatabaseDriver<PropsRow>>) -> Self {
        let instance = instance.into();
        Self {
            map: TransactionMap::new(Some(Arc::new(PropsMapDriver {
                instance: instance.clone(),
                driver,
            }))),
            instance,
            scope_lock: None,
        }
    }

    /// Mutations take `lock` (the owning entity's scope lock) first
    pub(crate) fn with_scope_lock(mut self, lock: ScopeLock) -> Self {
        self.scope_lock = Some(lock);
        self
    }

    fn lock_for(&self, tx: &TransactionMgr) -> Result<()> {
        match &self.scope_lock {
            Some(lock) => lock.acquire(tx),
            None => Ok(()),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn get(&self, key: &str, namespace: Option<&str>) -> Result<Option<String>> {
        Ok(self.map.get(&full_key(key, namespace)?))
    }

    /// Sets a value and returns the replaced one
    pub fn set(&self, tx: &TransactionMgr, key: &str, value: &str, namespace: Option<&str>) -> Result<Option<String>> {
        let key = full_key(key, namespace)?;
        self.lock_for(tx)?;
        self.map.insert(tx, key, value.to_string())
    }

    pub fn set_all<'a>(
        &self,
        tx: &TransactionMgr,
        entries: impl IntoIterator<Item = (&'a str, &'a str)>,
        namespace: Option<&str>,
    ) -> Result<()> {
        for (key, value) in entries {
            self.set(tx, key, value, namespace)?;
        }
        Ok(())
    }

    pub fn remove(&self, tx: &TransactionMgr, key: &str, namespace: Option<&str>) -> Result<Option<String>> {
        let key = full_key(key, namespace)?;
        self.lock_for(tx)?;
        self.map.remove(tx, &key)
    }

    /// Copy of every entry keyed by full key
    pub fn map(&self) -> BTreeMap<String, String> {
        self.map.to_map()
    }

    /// Entries below `namespace`, keyed relative to it
    pub fn namespace(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        let prefix = namespace_prefix(namespace)?;
        Ok(self
            .map
            .entries()
            .into_iter()
            .filter_map(|(key, value)| key.strip_prefix(&prefix).map(|rel| (rel.to_string(), value)))
            .collect())
    }

    /// Names of the direct sub-namespaces of `namespace`, or of the top level
    pub fn iterate_namespaces(&self, namespace: Option<&str>) -> Result<Vec<String>> {
        let prefix = match namespace {
            Some(namespace) => namespace_prefix(namespace)?,
            None => String::new(),
        };
        let names: BTreeSet<String> = self
            .map
            .keys()
            .iter()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter_map(|rel| rel.split_once(PATH_SEPARATOR).map(|(head, _)| head.to_string()))
            .collect();
        Ok(names.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Removes every entry
    pub fn clear(&self, tx: &TransactionMgr) -> Result<()> {
        self.lock_for(tx)?;
        self.map.clear(tx)
    }

    /// Removes every entry as part of deleting the owning entity
    pub fn delete(&self, tx: &TransactionMgr) -> Result<()> {
        self.clear(tx)
    }

    /// Adds a stored entry while the owning entity is being restored
    pub(crate) fn restore_entry(&self, row: &PropsRow) -> Result<()> {
        let key = full_key(&row.key, None)
            .map_err(|err| Error::corrupt(PropsRow::TABLE, PropsRow::key_of(&row.instance, &row.key), err))?;
        self.map.restore(key, row.value.clone());
        Ok(())
    }
}

impl fmt::Debug for PropsContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropsContainer")
            .field("instance", &self.instance)
            .field("entries", &self.map.len())
            .finish()
    }
}

// =============================================================================
// Secure View
// =============================================================================

/// Access-checked view of the properties of one entity
#[derive(Debug)]
pub struct SecureProps<'a> {
    ctx: &'a AccessContext,
    obj_prot: &'a ObjectProtection,
    props: &'a PropsContainer,
}

impl<'a> SecureProps<'a> {
    /// Requires VIEW access to the owning entity
    pub fn new(ctx: &'a AccessContext, obj_prot: &'a ObjectProtection, props: &'a PropsContainer) -> Result<Self> {
        obj_prot.require_access(ctx, AccessType::View)?;
        Ok(Self { ctx, obj_prot, props })
    }

    pub fn get(&self, key: &str, namespace: Option<&str>) -> Result<Option<String>> {
        self.props.get(key, namespace)
    }

    pub fn map(&self) -> BTreeMap<String, String> {
        self.props.map()
    }

    pub fn namespace(&self, namespace: &str) -> Result<BTreeMap<String, String>> {
        self.props.namespace(namespace)
    }

    pub fn iterate_namespaces(&self, namespace: Option<&str>) -> Result<Vec<String>> {
        self.props.iterate_namespaces(namespace)
    }

    pub fn set(&self, tx: &TransactionMgr, key: &str, value: &str, namespace: Option<&str>) -> Result<Option<String>> {
        self.obj_prot.require_access(self.ctx, AccessType::Change)?;
        self.props.set(tx, key, value, namespace)
    }

    pub fn set_all<'e>(
        &self,
        tx: &TransactionMgr,
        entries: impl IntoIterator<Item = (&'e str, &'e str)>,
        namespace: Option<&str>,
    ) -> Result<()> {
        self.obj_prot.require_access(self.ctx, AccessType::Change)?;
        self.props.set_all(tx, entries, namespace)
    }

    pub fn remove(&self, tx: &TransactionMgr, key: &str, namespace: Option<&str>) -> Result<Option<String>> {
        self.obj_prot.require_access(self.ctx, AccessType::Change)?;
        self.props.remove(tx, key, namespace)
    }

    pub fn clear(&self, tx: &TransactionMgr) -> Result<()> {
        self.obj_prot.require_access(self.ctx, AccessType::Change)?;
        self.props.clear(tx)
    }
}

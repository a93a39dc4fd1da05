//! Persistence Layer
//!
//! The core never talks to a backing store directly. Transactional objects
//! stage [`DbWrite`]s into a [`DbBatch`] through per-entity-type drivers, and
//! the transaction scope hands the whole batch to a [`Database`] engine.
//!
//! ```text
//! entity cell ──► SingleColumnDatabaseDriver ──┐
//! entity map  ──► MapDatabaseDriver ───────────┼──► DbBatch ──► Database::apply
//! persisted   ──► EntityDatabaseDriver::create ┘
//! ```

pub mod loader;
pub mod memory;
pub mod rows;

pub use loader::{DatabaseLoader, LoadCache, LoadSummary};
pub use memory::{JournalEntry, MemoryDatabase, WriteKind};
pub use rows::*;

use crate::error::{DbError, DbResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tracing::trace;

// =============================================================================
// Writes and Batches
// =============================================================================

/// One staged write against a table
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DbWrite {
    /// Insert a new row, failing if the key exists
    Insert {
        table: &'static str,
        key: String,
        row: Value,
    },
    /// Insert or replace a row
    Put {
        table: &'static str,
        key: String,
        row: Value,
    },
    /// Replace one column of an existing row
    Update {
        table: &'static str,
        key: String,
        column: &'static str,
        value: Value,
    },
    /// Delete an existing row
    Delete { table: &'static str, key: String },
}

impl DbWrite {
    pub fn table(&self) -> &'static str {
        match self {
            DbWrite::Insert { table, .. }
            | DbWrite::Put { table, .. }
            | DbWrite::Update { table, .. }
            | DbWrite::Delete { table, .. } => table,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            DbWrite::Insert { key, .. }
            | DbWrite::Put { key, .. }
            | DbWrite::Update { key, .. }
            | DbWrite::Delete { key, .. } => key,
        }
    }

    pub fn kind(&self) -> WriteKind {
        match self {
            DbWrite::Insert { .. } => WriteKind::Insert,
            DbWrite::Put { .. } => WriteKind::Put,
            DbWrite::Update { .. } => WriteKind::Update,
            DbWrite::Delete { .. } => WriteKind::Delete,
        }
    }
}

/// Ordered writes produced by one commit
#[derive(Debug, Clone, Default)]
pub struct DbBatch {
    writes: Vec<DbWrite>,
}

impl DbBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: &'static str, key: String, row: Value) {
        self.writes.push(DbWrite::Insert { table, key, row });
    }

    pub fn put(&mut self, table: &'static str, key: String, row: Value) {
        self.writes.push(DbWrite::Put { table, key, row });
    }

    pub fn update(&mut self, table: &'static str, key: String, column: &'static str, value: Value) {
        self.writes.push(DbWrite::Update {
            table,
            key,
            column,
            value,
        });
    }

    pub fn delete(&mut self, table: &'static str, key: String) {
        self.writes.push(DbWrite::Delete { table, key });
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[DbWrite] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<DbWrite> {
        self.writes
    }
}

// =============================================================================
// Engine Trait
// =============================================================================

/// A backing store that applies batches atomically
pub trait Database: Send + Sync {
    /// Reads one row
    fn select(&self, table: &str, key: &str) -> DbResult<Option<Value>>;

    /// Reads every row of a table in key order
    fn select_all(&self, table: &str) -> DbResult<Vec<Value>>;

    /// Applies every write of the batch or none of them. An engine that
    /// cannot guarantee this reports [`DbError::PartialApply`].
    ///
    /// [`DbError::PartialApply`]: crate::error::DbError::PartialApply
    fn apply(&self, batch: DbBatch) -> DbResult<()>;
}

// =============================================================================
// Driver Interfaces
// =============================================================================

/// A stored row of one entity type
pub trait PersistedRow: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    const TABLE: &'static str;

    /// Primary key derived from the natural key of the row
    fn primary_key(&self) -> String;
}

/// Persistence driver of one entity type
pub trait EntityDatabaseDriver<R: PersistedRow>: Send + Sync {
    /// Stages the insert of a new row
    fn create(&self, batch: &mut DbBatch, row: &R) -> DbResult<()>;

    /// Stages an insert-or-replace
    fn put(&self, batch: &mut DbBatch, row: &R) -> DbResult<()>;

    /// Stages the update of one column
    fn update(&self, batch: &mut DbBatch, key: &str, column: &'static str, value: Value) -> DbResult<()>;

    /// Stages the deletion of a row
    fn delete(&self, batch: &mut DbBatch, key: &str) -> DbResult<()>;

    /// Loads one row by primary key
    fn load(&self, key: &str) -> DbResult<Option<R>>;

    /// Loads every row
    fn load_all(&self) -> DbResult<Vec<R>>;

    /// Loads every row matching `filter`
    fn load_matching(&self, filter: &dyn Fn(&R) -> bool) -> DbResult<Vec<R>> {
        Ok(self.load_all()?.into_iter().filter(|row| filter(row)).collect())
    }
}

/// Update callback of a single transactional cell
pub trait SingleColumnDatabaseDriver<T>: Send + Sync {
    fn update(&self, batch: &mut DbBatch, value: &T) -> DbResult<()>;
}

/// Driver implementation for any row type on any [`Database`]
pub struct GenericDbDriver<R> {
    db: Arc<dyn Database>,
    _row: PhantomData<fn() -> R>,
}

impl<R: PersistedRow> GenericDbDriver<R> {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            _row: PhantomData,
        }
    }
}

impl<R: PersistedRow> EntityDatabaseDriver<R> for GenericDbDriver<R> {
    fn create(&self, batch: &mut DbBatch, row: &R) -> DbResult<()> {
        let key = row.primary_key();
        trace!(table = R::TABLE, key = %key, "staging insert");
        batch.insert(R::TABLE, key, serde_json::to_value(row)?);
        Ok(())
    }

    fn put(&self, batch: &mut DbBatch, row: &R) -> DbResult<()> {
        let key = row.primary_key();
        trace!(table = R::TABLE, key = %key, "staging put");
        batch.put(R::TABLE, key, serde_json::to_value(row)?);
        Ok(())
    }

    fn update(&self, batch: &mut DbBatch, key: &str, column: &'static str, value: Value) -> DbResult<()> {
        trace!(table = R::TABLE, key, column, "staging update");
        batch.update(R::TABLE, key.to_string(), column, value);
        Ok(())
    }

    fn delete(&self, batch: &mut DbBatch, key: &str) -> DbResult<()> {
        trace!(table = R::TABLE, key, "staging delete");
        batch.delete(R::TABLE, key.to_string());
        Ok(())
    }

    fn load(&self, key: &str) -> DbResult<Option<R>> {
        match self.db.select(R::TABLE, key)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    fn load_all(&self) -> DbResult<Vec<R>> {
        self.db
            .select_all(R::TABLE)?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(Into::into))
            .collect()
    }
}

/// Column update callback bound to one row
pub struct ColumnDriver<R: PersistedRow> {
    driver: Arc<dyn EntityDatabaseDriver<R>>,
    key: String,
    column: &'static str,
}

impl<R: PersistedRow> ColumnDriver<R> {
    pub fn new(driver: Arc<dyn EntityDatabaseDriver<R>>, key: impl Into<String>, column: &'static str) -> Arc<Self> {
        Arc::new(Self {
            driver,
            key: key.into(),
            column,
        })
    }
}

impl<R: PersistedRow, T: Serialize> SingleColumnDatabaseDriver<T> for ColumnDriver<R> {
    fn update(&self, batch: &mut DbBatch, value: &T) -> DbResult<()> {
        self.driver
            .update(batch, &self.key, self.column, serde_json::to_value(value)?)
    }
}

/// Driver of the internal "persisted" cell of an object: the transition to
/// `true` inserts the row built from the live object, the transition to
/// `false` deletes it by key
pub struct ExistenceDriver<E, R: PersistedRow> {
    object: Weak<E>,
    driver: Arc<dyn EntityDatabaseDriver<R>>,
    key: String,
    to_row: fn(&E) -> R,
}

impl<E, R: PersistedRow> ExistenceDriver<E, R> {
    pub fn new(
        object: Weak<E>,
        driver: Arc<dyn EntityDatabaseDriver<R>>,
        key: impl Into<String>,
        to_row: fn(&E) -> R,
    ) -> Arc<Self> {
        Arc::new(Self {
            object,
            driver,
            key: key.into(),
            to_row,
        })
    }
}

impl<E: Send + Sync, R: PersistedRow> SingleColumnDatabaseDriver<bool> for ExistenceDriver<E, R> {
    fn update(&self, batch: &mut DbBatch, persisted: &bool) -> DbResult<()> {
        if *persisted {
            let object = self.object.upgrade().ok_or_else(|| DbError::Detached {
                table: R::TABLE.to_string(),
                key: self.key.clone(),
            })?;
            self.driver.create(batch, &(self.to_row)(&object))
        } else {
            self.driver.delete(batch, &self.key)
        }
    }
}

// =============================================================================
// Driver Set
// =============================================================================

/// One driver per persisted entity type, injected into every factory
pub struct DatabaseDrivers {
    pub object_protection: Arc<dyn EntityDatabaseDriver<ObjectProtectionRow>>,
    pub acl: Arc<dyn EntityDatabaseDriver<AclRow>>,
    pub props: Arc<dyn EntityDatabaseDriver<PropsRow>>,
    pub nodes: Arc<dyn EntityDatabaseDriver<NodeRow>>,
    pub net_interfaces: Arc<dyn EntityDatabaseDriver<NetInterfaceRow>>,
    pub stor_pool_definitions: Arc<dyn EntityDatabaseDriver<StorPoolDefinitionRow>>,
    pub stor_pools: Arc<dyn EntityDatabaseDriver<StorPoolRow>>,
    pub resource_definitions: Arc<dyn EntityDatabaseDriver<ResourceDefinitionRow>>,
    pub resources: Arc<dyn EntityDatabaseDriver<ResourceRow>>,
    pub volume_definitions: Arc<dyn EntityDatabaseDriver<VolumeDefinitionRow>>,
    pub volumes: Arc<dyn EntityDatabaseDriver<VolumeRow>>,
    pub node_connections: Arc<dyn EntityDatabaseDriver<NodeConnectionRow>>,
    pub resource_connections: Arc<dyn EntityDatabaseDriver<ResourceConnectionRow>>,
    pub volume_connections: Arc<dyn EntityDatabaseDriver<VolumeConnectionRow>>,
    pub snapshot_definitions: Arc<dyn EntityDatabaseDriver<SnapshotDefinitionRow>>,
    pub snapshot_volume_definitions: Arc<dyn EntityDatabaseDriver<SnapshotVolumeDefinitionRow>>,
    pub snapshots: Arc<dyn EntityDatabaseDriver<SnapshotRow>>,
    pub snapshot_volumes: Arc<dyn EntityDatabaseDriver<SnapshotVolumeRow>>,
}

impl DatabaseDrivers {
    /// Generic drivers for every entity type on `db`
    pub fn generic(db: Arc<dyn Database>) -> Arc<Self> {
        fn driver<R: PersistedRow>(db: &Arc<dyn Database>) -> Arc<dyn EntityDatabaseDriver<R>> {
            Arc::new(GenericDbDriver::new(db.clone()))
        }

        Arc::new(Self {
            object_protection: driver(&db),
            acl: driver(&db),
            props: driver(&db),
            nodes: driver(&db),
            net_interfaces: driver(&db),
            stor_pool_definitions: driver(&db),
            stor_pools: driver(&db),
            resource_definitions: driver(&db),
            resources: driver(&db),
            volume_definitions: driver(&db),
            volumes: driver(&db),
            node_connections: driver(&db),
            resource_connections: driver(&db),
            volume_connections: driver(&db),
            snapshot_definitions: driver(&db),
            snapshot_volume_definitions: driver(&db),
            snapshots: driver(&db),
            snapshot_volumes: driver(&db),
        })
    }
}

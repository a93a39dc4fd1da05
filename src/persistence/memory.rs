//! In-Memory Database
//!
//! Table store used by the controller binary and by tests. Batches are
//! applied to a staged copy of the tables and swapped in only when every
//! write succeeded. Optionally every applied batch is written to a JSON
//! file through a temp file and rename. Applied batches are journaled so
//! tests can observe exactly what reached the store, and failures can be
//! injected for the next batch.

use super::{Database, DbBatch, DbWrite};
use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

type Tables = BTreeMap<String, BTreeMap<String, Value>>;

/// Kind of a staged write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Insert,
    Put,
    Update,
    Delete,
}

/// One applied batch
#[derive(Debug, Clone, Serialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub applied_at: DateTime<Utc>,
    pub writes: Vec<DbWrite>,
}

impl JournalEntry {
    /// Writes of this entry against `table`
    pub fn writes_for<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a DbWrite> + 'a {
        self.writes.iter().filter(move |write| write.table() == table)
    }
}

#[derive(Debug)]
enum InjectedFailure {
    Reject {
        table: Option<String>,
        kind: Option<WriteKind>,
    },
    PartialAfter(usize),
}

/// Table store with atomic batch application
pub struct MemoryDatabase {
    tables: RwLock<Tables>,
    journal: Mutex<Vec<JournalEntry>>,
    failures: Mutex<VecDeque<InjectedFailure>>,
    file: Option<PathBuf>,
    sequence: AtomicU64,
}

impl MemoryDatabase {
    /// Creates an empty, purely in-memory store
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::with_tables(Tables::new(), None))
    }

    /// Opens a file-backed store, reading the file if it exists
    pub fn open(path: impl AsRef<Path>) -> DbResult<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let tables: Tables = serde_json::from_str(&content)?;
            info!(
                "Opened database file {} ({} tables)",
                path.display(),
                tables.len()
            );
            tables
        } else {
            info!("Creating new database file {}", path.display());
            Tables::new()
        };
        Ok(Arc::new(Self::with_tables(tables, Some(path))))
    }

    fn with_tables(tables: Tables, file: Option<PathBuf>) -> Self {
        Self {
            tables: RwLock::new(tables),
            journal: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            file,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    /// Every batch applied so far, oldest first
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, BTreeMap::len)
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Rejects the next batch that contains a write matching the filter
    pub fn reject_next(&self, table: Option<&str>, kind: Option<WriteKind>) {
        self.failures.lock().push_back(InjectedFailure::Reject {
            table: table.map(str::to_string),
            kind,
        });
    }

    /// Applies only the first `applied` writes of the next batch, then fails
    pub fn fail_partially_after(&self, applied: usize) {
        self.failures
            .lock()
            .push_back(InjectedFailure::PartialAfter(applied));
    }

    /// Stores a row directly, bypassing batches and the journal
    pub fn write_raw(&self, table: &str, key: &str, row: Value) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), row);
    }

    fn take_failure(&self, writes: &[DbWrite]) -> Option<InjectedFailure> {
        let mut failures = self.failures.lock();
        let index = failures.iter().position(|failure| match failure {
            InjectedFailure::Reject { table, kind } => writes.iter().any(|write| {
                table.as_deref().map_or(true, |t| t == write.table())
                    && kind.map_or(true, |k| k == write.kind())
            }),
            InjectedFailure::PartialAfter(_) => true,
        })?;
        failures.remove(index)
    }

    fn persist_file(&self, tables: &Tables) -> DbResult<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(tables)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn apply_write(tables: &mut Tables, write: &DbWrite) -> DbResult<()> {
    match write {
        DbWrite::Insert { table, key, row } => {
            let rows = tables.entry(table.to_string()).or_default();
            if rows.contains_key(key) {
                return Err(DbError::DuplicateKey {
                    table: table.to_string(),
                    key: key.clone(),
                });
            }
            rows.insert(key.clone(), row.clone());
        }
        DbWrite::Put { table, key, row } => {
            tables
                .entry(table.to_string())
                .or_default()
                .insert(key.clone(), row.clone());
        }
        DbWrite::Update {
            table,
            key,
            column,
            value,
        } => {
            let row = tables
                .get_mut(*table)
                .and_then(|rows| rows.get_mut(key))
                .ok_or_else(|| DbError::MissingRow {
                    table: table.to_string(),
                    key: key.clone(),
                })?;
            let record = row.as_object_mut().ok_or_else(|| DbError::MissingColumn {
                table: table.to_string(),
                key: key.clone(),
            })?;
            record.insert(column.to_string(), value.clone());
        }
        DbWrite::Delete { table, key } => {
            let removed = tables.get_mut(*table).and_then(|rows| rows.remove(key));
            if removed.is_none() {
                return Err(DbError::MissingRow {
                    table: table.to_string(),
                    key: key.clone(),
                });
            }
        }
    }
    Ok(())
}

impl Database for MemoryDatabase {
    fn select(&self, table: &str, key: &str) -> DbResult<Option<Value>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .and_then(|rows| rows.get(key))
            .cloned())
    }

    fn select_all(&self, table: &str) -> DbResult<Vec<Value>> {
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn apply(&self, batch: DbBatch) -> DbResult<()> {
        let writes = batch.into_writes();
        let mut tables = self.tables.write();

        match self.take_failure(&writes) {
            Some(InjectedFailure::Reject { table, kind }) => {
                debug!("Rejecting batch of {} writes (injected)", writes.len());
                return Err(DbError::Rejected(format!(
                    "injected failure for table {:?}, write {:?}",
                    table, kind
                )));
            }
            Some(InjectedFailure::PartialAfter(applied)) => {
                let applied = applied.min(writes.len());
                for write in &writes[..applied] {
                    apply_write(&mut tables, write)?;
                }
                return Err(DbError::PartialApply {
                    applied,
                    total: writes.len(),
                });
            }
            None => {}
        }

        let mut staged = tables.clone();
        for write in &writes {
            apply_write(&mut staged, write)?;
        }
        self.persist_file(&staged)?;
        *tables = staged;
        drop(tables);

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        self.journal.lock().push(JournalEntry {
            sequence,
            applied_at: Utc::now(),
            writes,
        });
        Ok(())
    }
}

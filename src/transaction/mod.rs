//! Transactional Object Protocol
//!
//! Mutable entity state lives in transactional cells and maps. A mutation
//! only stages the new value in memory and registers the wrapper with the
//! [`TransactionMgr`] of the calling operation. Committing the scope flushes
//! every touched wrapper, in first-touch order, into one [`DbBatch`] that the
//! backing store applies as a unit; rolling back restores the staged
//! wrappers to their pre-operation values without touching the store.
//!
//! Entities additionally carry a [`ScopeLock`] that the first scope using
//! them keeps until it ends, so a second scope never builds on state that
//! may still be rolled back.
//!
//! [`DbBatch`]: crate::persistence::DbBatch

pub mod lock;
pub mod manager;
pub mod map;
pub mod simple;

pub use lock::ScopeLock;
pub use manager::{CommitStats, TransactionMgr};
pub use map::{MapDatabaseDriver, TransactionMap};
pub use simple::TransactionSimpleObject;

use crate::error::Result;
use crate::persistence::DbBatch;
use std::fmt;

/// Identifier of one transaction scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub(crate) u64);

impl TxId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// A wrapper whose staged state is flushed, committed or rolled back by a scope
pub trait TransactionObject: Send + Sync {
    /// Stage the persistence writes for the changes made by `tx`
    fn flush(&self, tx: TxId, batch: &mut DbBatch) -> Result<()>;

    /// Accept the changes made by `tx` as the new baseline
    fn commit(&self, tx: TxId);

    /// Restore the values that were current before `tx` touched this object
    fn rollback(&self, tx: TxId);

    /// Whether `tx` has uncommitted changes on this object
    fn is_dirty(&self, tx: TxId) -> bool;
}

/// Values that can live in a transactional cell
pub trait TxValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> TxValue for T {}

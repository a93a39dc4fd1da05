//! State Flags
//!
//! A bitmask of named boolean attributes over a closed `bitflags` type.
//! The mask is a transactional cell: every mutator is one read-modify-write
//! of the whole mask under the cell lock, and a mutation that leaves the
//! mask unchanged neither stages the cell nor reaches its column driver.

use crate::error::Result;
use crate::persistence::SingleColumnDatabaseDriver;
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::transaction::{ScopeLock, TransactionMgr, TransactionSimpleObject};
use bitflags::Flags;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Flag set of one entity
pub struct StateFlags<F> {
    obj_prot: Arc<ObjectProtection>,
    bits: TransactionSimpleObject<u64>,
    scope_lock: Option<ScopeLock>,
    _flags: PhantomData<fn() -> F>,
}

impl<F: Flags<Bits = u64> + Copy> StateFlags<F> {
    pub fn new(
        obj_prot: Arc<ObjectProtection>,
        initial: F,
        driver: Option<Arc<dyn SingleColumnDatabaseDriver<u64>>>,
    ) -> Self {
        Self {
            obj_prot,
            bits: TransactionSimpleObject::new(initial.bits(), driver),
            scope_lock: None,
            _flags: PhantomData,
        }
    }

    /// Mutators take `lock` (the owning entity's scope lock) first
    pub(crate) fn with_scope_lock(mut self, lock: ScopeLock) -> Self {
        self.scope_lock = Some(lock);
        self
    }

    pub fn enable_flags(&self, ctx: &AccessContext, tx: &TransactionMgr, flags: F) -> Result<()> {
        self.modify(ctx, tx, |bits| bits | flags.bits())
    }

    pub fn disable_flags(&self, ctx: &AccessContext, tx: &TransactionMgr, flags: F) -> Result<()> {
        self.modify(ctx, tx, |bits| bits & !flags.bits())
    }

    pub fn enable_all_flags(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.modify(ctx, tx, |_| F::all().bits())
    }

    pub fn disable_all_flags(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.modify(ctx, tx, |_| 0)
    }

    /// Clears every flag that is not part of `keep`
    pub fn disable_flags_except(&self, ctx: &AccessContext, tx: &TransactionMgr, keep: F) -> Result<()> {
        self.modify(ctx, tx, |bits| bits & keep.bits())
    }

    fn modify(&self, ctx: &AccessContext, tx: &TransactionMgr, f: impl FnOnce(u64) -> u64) -> Result<()> {
        self.obj_prot.require_access(ctx, AccessType::Change)?;
        if let Some(lock) = &self.scope_lock {
            lock.acquire(tx)?;
        }
        self.bits.try_update(tx, |&current| {
            let next = f(current);
            (next != current).then_some(next)
        })?;
        Ok(())
    }

    /// Whether every flag of `flags` is set
    pub fn is_set(&self, ctx: &AccessContext, flags: F) -> Result<bool> {
        self.obj_prot.require_access(ctx, AccessType::View)?;
        Ok(self.raw_bits() & flags.bits() == flags.bits())
    }

    /// Whether no flag of `flags` is set
    pub fn is_unset(&self, ctx: &AccessContext, flags: F) -> Result<bool> {
        self.obj_prot.require_access(ctx, AccessType::View)?;
        Ok(self.raw_bits() & flags.bits() == 0)
    }

    /// Whether at least one flag of `flags` is set
    pub fn is_some_set(&self, ctx: &AccessContext, flags: F) -> Result<bool> {
        self.obj_prot.require_access(ctx, AccessType::View)?;
        Ok(self.raw_bits() & flags.bits() != 0)
    }

    pub fn flags_bits(&self, ctx: &AccessContext) -> Result<u64> {
        self.obj_prot.require_access(ctx, AccessType::View)?;
        Ok(self.raw_bits())
    }

    pub fn flags(&self, ctx: &AccessContext) -> Result<F> {
        self.obj_prot.require_access(ctx, AccessType::View)?;
        Ok(self.raw_flags())
    }

    pub(crate) fn raw_bits(&self) -> u64 {
        self.bits.get()
    }

    pub(crate) fn raw_flags(&self) -> F {
        F::from_bits_retain(self.raw_bits())
    }
}

impl<F> fmt::Debug for StateFlags<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateFlags")
            .field("bits", &format_args!("{:#x}", self.bits.get()))
            .finish()
    }
}

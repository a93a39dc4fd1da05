//! Volume definition of a resource definition

use super::api::VolumeDefinitionApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::{ResourceDefinition, Volume};
use crate::domain::{check_volume_size, MinorNumber, NodeName, ResourceName, VolumeNumber};
use crate::error::Result;
use crate::persistence::{columns, db_key, ColumnDriver, ExistenceDriver, VolumeDefinitionRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::stateflags::StateFlags;
use crate::transaction::{TransactionMap, TransactionMgr, TransactionSimpleObject};
use bitflags::bitflags;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VolumeDefinitionFlags: u64 {
        const DELETE = 1;
        const ENCRYPTED = 2;
        const RESIZE = 4;
    }
}

const KIND: &str = "volume definition";

pub struct VolumeDefinition {
    core: EntityCore,
    definition: Weak<ResourceDefinition>,
    resource_name: ResourceName,
    vlm_nr: VolumeNumber,
    minor: TransactionSimpleObject<MinorNumber>,
    size_kib: TransactionSimpleObject<u64>,
    flags: StateFlags<VolumeDefinitionFlags>,
    pub(crate) volumes: TransactionMap<NodeName, Arc<Volume>>,
}

entity_accessors!(VolumeDefinition);

impl VolumeDefinition {
    #[allow(clippy::too_many_arguments)]
    fn build(
        definition: &Arc<ResourceDefinition>,
        uuid: Uuid,
        vlm_nr: VolumeNumber,
        minor: MinorNumber,
        size_kib: u64,
        flags: VolumeDefinitionFlags,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = definition.core().drivers().clone();
        let resource_name = definition.resource_name().clone();
        let key = db_key(&[resource_name.value(), &vlm_nr.to_string()]);
        let table = drivers.volume_definitions.clone();
        Arc::new_cyclic(|weak| {
            let core = EntityCore::new(
                KIND,
                format!("{}/{}", resource_name, vlm_nr),
                uuid,
                obj_prot.clone(),
                &drivers,
                ExistenceDriver::new(weak.clone(), table.clone(), key.clone(), Self::row),
                persisted,
            );
            let scope_lock = core.scope_lock().clone();
            Self {
                core,
                definition: Arc::downgrade(definition),
                minor: TransactionSimpleObject::new(
                    minor,
                    Some(ColumnDriver::new(table.clone(), key.clone(), columns::MINOR_NUMBER)),
                ),
                size_kib: TransactionSimpleObject::new(
                    size_kib,
                    Some(ColumnDriver::new(table.clone(), key.clone(), columns::SIZE_KIB)),
                ),
                flags: StateFlags::new(obj_prot, flags, Some(ColumnDriver::new(table, key, columns::FLAGS)))
                    .with_scope_lock(scope_lock),
                resource_name,
                vlm_nr,
                volumes: TransactionMap::new(None),
            }
        })
    }

    /// Looks up or creates volume `vlm_nr` of `definition`. Creation
    /// requires CHANGE on the resource definition and a valid size.
    #[allow(clippy::too_many_arguments)]
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        definition: &Arc<ResourceDefinition>,
        vlm_nr: VolumeNumber,
        minor: MinorNumber,
        size_kib: u64,
        flags: VolumeDefinitionFlags,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        definition.core().require_in(ctx, tx, AccessType::View)?;
        let objects = definition.objects()?;
        let _objects_guard = objects.lock();
        let _guard = definition.core().lock();
        let existing = definition.volume_definitions.get(&vlm_nr);
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || format!("{}/{}", definition.resource_name(), vlm_nr),
            || {
                definition.core().require_in(ctx, tx, AccessType::Change)?;
                let size_kib = check_volume_size(size_kib)?;
                objects.check_minor_unused(minor, definition.resource_name(), vlm_nr)?;
                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::volume_definition(definition.resource_name(), vlm_nr),
                    definition.core().drivers(),
                )?;
                let vlm_dfn = Self::build(definition, Uuid::new_v4(), vlm_nr, minor, size_kib, flags, obj_prot, false);
                vlm_dfn.core.persist(tx)?;
                definition.volume_definitions.insert(tx, vlm_nr, vlm_dfn.clone())?;
                debug!(
                    "Created volume definition {}/{} ({} KiB, minor {})",
                    definition.resource_name(),
                    vlm_nr,
                    size_kib,
                    minor
                );
                Ok(vlm_dfn)
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        definition: &Arc<ResourceDefinition>,
        uuid: Uuid,
        vlm_nr: VolumeNumber,
        minor: MinorNumber,
        size_kib: u64,
        flags: VolumeDefinitionFlags,
        obj_prot: Arc<ObjectProtection>,
    ) -> Arc<Self> {
        let vlm_dfn = Self::build(definition, uuid, vlm_nr, minor, size_kib, flags, obj_prot, true);
        definition.volume_definitions.restore(vlm_nr, vlm_dfn.clone());
        vlm_dfn
    }

    fn row(&self) -> VolumeDefinitionRow {
        VolumeDefinitionRow {
            uuid: self.core.raw_uuid().to_string(),
            resource_name: self.resource_name.display_name().to_string(),
            volume_number: i64::from(self.vlm_nr.value()),
            minor_number: i64::from(self.minor.get().value()),
            size_kib: self.size_kib.get() as i64,
            flags: self.flags.raw_bits(),
        }
    }

    pub(crate) fn resource_name(&self) -> &ResourceName {
        &self.resource_name
    }

    pub(crate) fn raw_volume_number(&self) -> VolumeNumber {
        self.vlm_nr
    }

    pub(crate) fn raw_minor(&self) -> MinorNumber {
        self.minor.get()
    }

    pub fn definition(&self) -> Result<Arc<ResourceDefinition>> {
        self.core.check_deleted()?;
        upgrade(&self.definition, "resource definition", self.core.key())
    }

    pub fn volume_number(&self) -> Result<VolumeNumber> {
        self.core.check_deleted()?;
        Ok(self.vlm_nr)
    }

    pub fn minor_nr(&self, ctx: &AccessContext) -> Result<MinorNumber> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.minor.get())
    }

    /// Fails with [`Error::DataAlreadyExists`](crate::Error::DataAlreadyExists)
    /// when another volume definition uses `minor`
    pub fn set_minor_nr(&self, ctx: &AccessContext, tx: &TransactionMgr, minor: MinorNumber) -> Result<MinorNumber> {
        self.core.require_in(ctx, tx, AccessType::Change)?;
        let objects = self.definition()?.objects()?;
        let _guard = objects.lock();
        objects.check_minor_unused(minor, &self.resource_name, self.vlm_nr)?;
        self.minor.set(tx, minor)
    }

    pub fn volume_size(&self, ctx: &AccessContext) -> Result<u64> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.size_kib.get())
    }

    /// Sets the net size in KiB; the size is range-checked, never clamped
    pub fn set_volume_size(&self, ctx: &AccessContext, tx: &TransactionMgr, size_kib: u64) -> Result<u64> {
        self.core.require_in(ctx, tx, AccessType::Change)?;
        let size_kib = check_volume_size(size_kib)?;
        self.size_kib.set(tx, size_kib)
    }

    pub fn flags(&self) -> Result<&StateFlags<VolumeDefinitionFlags>> {
        self.core.check_deleted()?;
        Ok(&self.flags)
    }

    pub fn volume(&self, ctx: &AccessContext, node_name: &NodeName) -> Result<Option<Arc<Volume>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.volumes.get(node_name))
    }

    pub fn volumes(&self, ctx: &AccessContext) -> Result<Vec<Arc<Volume>>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.volumes.values())
    }

    pub fn mark_deleted(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        self.flags.enable_flags(ctx, tx, VolumeDefinitionFlags::DELETE)
    }

    /// Deletes the definition together with every volume deployed from it
    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        for volume in self.volumes.values() {
            volume.delete(ctx, tx)?;
        }

        let definition = upgrade(&self.definition, "resource definition", self.core.key())?;
        {
            let _guard = definition.core().lock();
            definition.volume_definitions.remove(tx, &self.vlm_nr)?;
        }
        self.core.destroy(tx)?;
        debug!("Deleted volume definition {}/{}", self.resource_name, self.vlm_nr);
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<VolumeDefinitionApi> {
        self.core.require(ctx, AccessType::View)?;
        Ok(VolumeDefinitionApi {
            uuid: self.core.raw_uuid(),
            volume_number: self.vlm_nr.value(),
            minor_number: self.minor.get().value(),
            size_kib: self.size_kib.get(),
            flags: self.flags.raw_bits(),
            props: self.core.raw_props().map(),
        })
    }
}

//! Network interface of a node

use super::api::NetInterfaceApi;
use super::common::{entity_accessors, upgrade, EntityCore, InstanceMode};
use super::Node;
use crate::domain::{NetInterfaceName, NetInterfaceType, NodeName, TcpPortNumber};
use crate::error::Result;
use crate::persistence::{columns, db_key, ColumnDriver, ExistenceDriver, NetInterfaceRow};
use crate::security::{paths, AccessContext, AccessType, ObjectProtection};
use crate::transaction::{TransactionMgr, TransactionSimpleObject};
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

const KIND: &str = "net interface";

pub struct NetInterface {
    core: EntityCore,
    node: Weak<Node>,
    node_name: NodeName,
    name: NetInterfaceName,
    address: TransactionSimpleObject<IpAddr>,
    port: TransactionSimpleObject<Option<TcpPortNumber>>,
    net_if_type: TransactionSimpleObject<NetInterfaceType>,
}

entity_accessors!(NetInterface);

impl NetInterface {
    #[allow(clippy::too_many_arguments)]
    fn build(
        node: &Arc<Node>,
        uuid: Uuid,
        name: NetInterfaceName,
        address: IpAddr,
        port: Option<TcpPortNumber>,
        net_if_type: NetInterfaceType,
        obj_prot: Arc<ObjectProtection>,
        persisted: bool,
    ) -> Arc<Self> {
        let drivers = node.core().drivers().clone();
        let node_name = node.node_name().clone();
        let key = db_key(&[node_name.value(), name.value()]);
        let table = drivers.net_interfaces.clone();
        Arc::new_cyclic(|weak| Self {
            core: EntityCore::new(
                KIND,
                format!("{}/{}", node_name, name),
                uuid,
                obj_prot,
                &drivers,
                ExistenceDriver::new(weak.clone(), table.clone(), key.clone(), Self::row),
                persisted,
            ),
            node: Arc::downgrade(node),
            address: TransactionSimpleObject::new(
                address,
                Some(ColumnDriver::new(table.clone(), key.clone(), columns::ADDRESS)),
            ),
            port: TransactionSimpleObject::new(
                port,
                Some(ColumnDriver::new(table.clone(), key.clone(), columns::PORT)),
            ),
            net_if_type: TransactionSimpleObject::new(
                net_if_type,
                Some(ColumnDriver::new(table, key, columns::NET_IF_TYPE)),
            ),
            node_name,
            name,
        })
    }

    /// Looks up or creates an interface of `node`. Creation requires CHANGE
    /// access to the node.
    #[allow(clippy::too_many_arguments)]
    pub fn get_instance(
        ctx: &AccessContext,
        tx: &TransactionMgr,
        node: &Arc<Node>,
        name: NetInterfaceName,
        address: IpAddr,
        port: Option<TcpPortNumber>,
        net_if_type: NetInterfaceType,
        mode: InstanceMode,
    ) -> Result<Option<Arc<Self>>> {
        node.core().require_in(ctx, tx, AccessType::View)?;
        let _guard = node.core().lock();
        let existing = node.net_interfaces.get(&name);
        mode.resolve_in(
            tx,
            existing,
            KIND,
            || format!("{}/{}", node.node_name(), name),
            || {
                node.core().require_in(ctx, tx, AccessType::Change)?;
                let obj_prot = ObjectProtection::create(
                    ctx,
                    tx,
                    paths::net_interface(node.node_name(), &name),
                    node.core().drivers(),
                )?;
                let net_if = Self::build(node, Uuid::new_v4(), name.clone(), address, port, net_if_type, obj_prot, false);
                net_if.core.persist(tx)?;
                node.net_interfaces.insert(tx, name.clone(), net_if.clone())?;
                debug!("Created net interface {}/{} ({})", node.node_name(), name, address);
                Ok(net_if)
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restore(
        node: &Arc<Node>,
        uuid: Uuid,
        name: NetInterfaceName,
        address: IpAddr,
        port: Option<TcpPortNumber>,
        net_if_type: NetInterfaceType,
        obj_prot: Arc<ObjectProtection>,
    ) -> Arc<Self> {
        let net_if = Self::build(node, uuid, name.clone(), address, port, net_if_type, obj_prot, true);
        node.net_interfaces.restore(name, net_if.clone());
        net_if
    }

    fn row(&self) -> NetInterfaceRow {
        NetInterfaceRow {
            uuid: self.core.raw_uuid().to_string(),
            node_name: self.node_name.display_name().to_string(),
            net_if_name: self.name.display_name().to_string(),
            address: self.address.get().to_string(),
            port: self.port.get().map(|port| i64::from(port.value())),
            net_if_type: self.net_if_type.get().as_str().to_string(),
        }
    }

    pub fn name(&self) -> Result<NetInterfaceName> {
        self.core.check_deleted()?;
        Ok(self.name.clone())
    }

    pub fn node(&self) -> Result<Arc<Node>> {
        self.core.check_deleted()?;
        upgrade(&self.node, "node", self.core.key())
    }

    pub fn address(&self, ctx: &AccessContext) -> Result<IpAddr> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.address.get())
    }

    pub fn set_address(&self, ctx: &AccessContext, tx: &TransactionMgr, address: IpAddr) -> Result<IpAddr> {
        self.core.require_in(ctx, tx, AccessType::Change)?;
        self.address.set(tx, address)
    }

    pub fn port(&self, ctx: &AccessContext) -> Result<Option<TcpPortNumber>> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.port.get())
    }

    pub fn set_port(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        port: Option<TcpPortNumber>,
    ) -> Result<Option<TcpPortNumber>> {
        self.core.require_in(ctx, tx, AccessType::Change)?;
        self.port.set(tx, port)
    }

    pub fn net_if_type(&self, ctx: &AccessContext) -> Result<NetInterfaceType> {
        self.core.require(ctx, AccessType::View)?;
        Ok(self.net_if_type.get())
    }

    pub fn set_net_if_type(
        &self,
        ctx: &AccessContext,
        tx: &TransactionMgr,
        net_if_type: NetInterfaceType,
    ) -> Result<NetInterfaceType> {
        self.core.require_in(ctx, tx, AccessType::Change)?;
        self.net_if_type.set(tx, net_if_type)
    }

    /// Removes the interface and releases the node's satellite connection
    /// if it used this interface
    pub fn delete(&self, ctx: &AccessContext, tx: &TransactionMgr) -> Result<()> {
        self.core.require_in(ctx, tx, AccessType::Control)?;
        let node = upgrade(&self.node, "node", self.core.key())?;
        {
            let _guard = node.core().lock();
            node.release_satellite_connection(tx, &self.name)?;
            node.net_interfaces.remove(tx, &self.name)?;
        }
        self.core.destroy(tx)?;
        debug!("Deleted net interface {}/{}", self.node_name, self.name);
        Ok(())
    }

    pub fn api_data(&self, ctx: &AccessContext) -> Result<NetInterfaceApi> {
        self.core.require(ctx, AccessType::View)?;
        Ok(NetInterfaceApi {
            uuid: self.core.raw_uuid(),
            name: self.name.display_name().to_string(),
            address: self.address.get().to_string(),
            port: self.port.get().map(|port| port.value()),
            net_if_type: self.net_if_type.get(),
        })
    }
}

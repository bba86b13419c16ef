//! Turns one candidate match into live host handles.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::ControllerError;
use crate::host::{Host, Hosts};
use crate::hypervisor::NetworkBridges;
use crate::machine::Machine;
use crate::macpool::MacPool;
use crate::mapper::{Match, Requirements};
use crate::pool::PoolManager;

pub struct MatchProvisioner<'a> {
    pub pools: &'a dyn PoolManager,
    pub mac_pool: &'a Arc<MacPool>,
    pub bridges: &'a Arc<NetworkBridges>,
    pub recipe: &'a str,
    pub device_wait: Duration,
}

impl MatchProvisioner<'_> {
    /// Lease every machine of `m` and bind its interfaces.
    ///
    /// Each leased machine is pushed onto `leased` as soon as it is held, so
    /// the caller can release everything acquired before a failure. Nothing
    /// is released here.
    pub async fn provision(
        &self,
        m: &Match,
        requirements: &Requirements,
        leased: &mut Vec<Arc<Machine>>,
    ) -> Result<Hosts, ControllerError> {
        let pools = self.pools.pools();
        let pool = pools
            .get(&m.pool_name)
            .ok_or_else(|| ControllerError::UnknownPool(m.pool_name.clone()))?;
        for mm in m.machines.values() {
            if !pool.contains_key(&mm.target) {
                return Err(ControllerError::UnknownTarget {
                    pool: m.pool_name.clone(),
                    target: mm.target.clone(),
                });
            }
        }

        let mut hosts = Hosts::default();
        for (m_id, mm) in &m.machines {
            let machine = self.pools.lease(&m.pool_name, &mm.target).await?;
            leased.push(machine.clone());

            machine.set_id(m_id);
            machine.set_mac_pool(self.mac_pool.clone());
            machine.set_network_bridges(self.bridges.clone());
            machine.set_recipe(self.recipe).await?;

            let mut host = Host::new(machine.clone());
            for (if_id, im) in &mm.interfaces {
                let iface = machine.entry().interfaces.get(&im.target).ok_or_else(|| {
                    ControllerError::Unbindable {
                        machine: m_id.clone(),
                        interface: if_id.clone(),
                        reason: format!("pool machine has no interface {}", im.target),
                    }
                })?;
                let dev = machine
                    .device_by_hwaddr(&iface.hwaddr)
                    .await
                    .map_err(|e| ControllerError::Unbindable {
                        machine: m_id.clone(),
                        interface: if_id.clone(),
                        reason: e.to_string(),
                    })?;
                info!(machine = %m_id, interface = %if_id, if_index = dev.if_index(), "interface bound");
                host.map_device(if_id, dev);
            }

            if m.is_virtual
                && let Some(req) = requirements.hosts.get(m_id)
            {
                for (if_id, ireq) in &req.interfaces {
                    let dev = machine
                        .add_virtual_interface(
                            &ireq.network,
                            ireq.driver.as_deref(),
                            ireq.hwaddr.clone(),
                            self.device_wait,
                        )
                        .await?;
                    host.map_device(if_id, dev);
                }
            }
            hosts.insert(m_id, host);
        }
        Ok(hosts)
    }
}

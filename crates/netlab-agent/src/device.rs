//! One kernel network interface as seen by the agent.
//!
//! A [`Device`] is identified by its kernel index for its whole life. The
//! kernel-derived fields live in one [`DeviceState`] behind an `ArcSwap`, so
//! a reader sees either the previous snapshot or the next one, never a mix.
//!
//! Two lifecycle flags gate access:
//! - `enabled`: while false, mutators succeed without touching the kernel.
//!   Reads are unaffected.
//! - `deleted`: set once when the interface vanishes. Every later call fails
//!   with [`DeviceError::Deleted`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwap;
use tracing::{debug, info};

use netlab_common::error::DeviceError;
use netlab_common::models::{
    DeviceInfo, DevlinkPort, HwAddr, IFF_UP, IpAddress, LinkStats, flag_names,
};

use crate::kernel::{Kernel, LinkSnapshot};

/// Kernel-derived state of a device, replaced as a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub link: LinkSnapshot,
    pub addrs: BTreeSet<IpAddress>,
    pub devlink: Option<DevlinkPort>,
}

pub struct Device {
    index: u32,
    kernel: Arc<dyn Kernel>,
    state: ArcSwap<DeviceState>,
    orig_mtu: u32,
    enabled: AtomicBool,
    deleted: AtomicBool,
    created: AtomicBool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.load();
        f.debug_struct("Device")
            .field("index", &self.index)
            .field("name", &state.link.name)
            .field("enabled", &self.enabled.load(Ordering::SeqCst))
            .field("deleted", &self.deleted.load(Ordering::SeqCst))
            .finish()
    }
}

impl Device {
    /// Build a device from its first observation. The observed MTU becomes
    /// the value `cleanup` restores.
    pub fn new(
        kernel: Arc<dyn Kernel>,
        link: LinkSnapshot,
        addrs: impl IntoIterator<Item = IpAddress>,
    ) -> Self {
        Self {
            index: link.index,
            kernel,
            orig_mtu: link.mtu,
            state: ArcSwap::from_pointee(DeviceState {
                link,
                addrs: addrs.into_iter().collect(),
                devlink: None,
            }),
            enabled: AtomicBool::new(true),
            deleted: AtomicBool::new(false),
            created: AtomicBool::new(false),
        }
    }

    /// Kernel interface index. Stable for the lifetime of the device.
    pub fn if_index(&self) -> u32 {
        self.index
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether the agent created this interface (as opposed to finding it).
    pub fn is_created(&self) -> bool {
        self.created.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Result<Arc<DeviceState>, DeviceError> {
        if self.is_deleted() {
            return Err(DeviceError::Deleted {
                if_index: self.index,
            });
        }
        Ok(self.state.load_full())
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn name(&self) -> Result<String, DeviceError> {
        Ok(self.snapshot()?.link.name.clone())
    }

    pub fn hwaddr(&self) -> Result<HwAddr, DeviceError> {
        Ok(self.snapshot()?.link.hwaddr.clone())
    }

    pub fn mtu(&self) -> Result<u32, DeviceError> {
        Ok(self.snapshot()?.link.mtu)
    }

    pub fn link_header_type(&self) -> Result<u16, DeviceError> {
        Ok(self.snapshot()?.link.link_type)
    }

    pub fn driver(&self) -> Result<Option<String>, DeviceError> {
        Ok(self.snapshot()?.link.driver.clone())
    }

    /// Lower-case names of the interface flags (`up`, `running`, ...).
    pub fn state(&self) -> Result<Vec<String>, DeviceError> {
        Ok(flag_names(self.snapshot()?.link.flags))
    }

    pub fn ips(&self) -> Result<Vec<IpAddress>, DeviceError> {
        Ok(self.snapshot()?.addrs.iter().copied().collect())
    }

    /// Index of the master interface, if enslaved.
    pub fn master(&self) -> Result<Option<u32>, DeviceError> {
        Ok(self.snapshot()?.link.master)
    }

    pub fn link_stats(&self) -> Result<LinkStats, DeviceError> {
        Ok(self.snapshot()?.link.stats)
    }

    pub fn devlink(&self) -> Result<Option<DevlinkPort>, DeviceError> {
        Ok(self.snapshot()?.devlink.clone())
    }

    /// Full kernel-derived state in one consistent read.
    pub fn state_snapshot(&self) -> Result<DeviceState, DeviceError> {
        Ok(DeviceState::clone(&*self.snapshot()?))
    }

    pub fn info(&self) -> Result<DeviceInfo, DeviceError> {
        let s = self.snapshot()?;
        Ok(DeviceInfo {
            if_index: self.index,
            name: s.link.name.clone(),
            hwaddr: s.link.hwaddr.clone(),
            ip_addrs: s.addrs.iter().copied().collect(),
            link_header_type: s.link.link_type,
            state: flag_names(s.link.flags),
            master: s.link.master,
            mtu: s.link.mtu,
            driver: s.link.driver.clone(),
            devlink: s.devlink.clone(),
        })
    }

    // ── Snapshot application (registry only) ─────────────────────────

    fn update(&self, f: impl Fn(&mut DeviceState)) {
        self.state.rcu(|cur| {
            let mut next = DeviceState::clone(cur);
            f(&mut next);
            next
        });
    }

    /// Replace every link-derived field with `link`. Addresses and devlink
    /// correlation are kept.
    pub(crate) fn apply_link(&self, link: LinkSnapshot) {
        if link.index != self.index {
            return;
        }
        self.update(|s| s.link = link.clone());
    }

    pub(crate) fn apply_addr_added(&self, addr: IpAddress) {
        self.update(|s| {
            s.addrs.insert(addr);
        });
    }

    pub(crate) fn apply_addr_removed(&self, addr: &IpAddress) {
        self.update(|s| {
            s.addrs.remove(addr);
        });
    }

    /// Apply one enumeration result: the link fields and a replayed address
    /// set are published in a single swap.
    pub(crate) fn apply_snapshot(&self, link: LinkSnapshot, addrs: &[IpAddress]) {
        if link.index != self.index {
            return;
        }
        self.update(|s| {
            s.link = link.clone();
            s.addrs = addrs.iter().copied().collect();
        });
    }

    pub(crate) fn set_devlink(&self, port: Option<DevlinkPort>) {
        if self.state.load().devlink == port {
            return;
        }
        self.update(|s| s.devlink = port.clone());
    }

    pub(crate) fn tombstone(&self) {
        if !self.deleted.swap(true, Ordering::SeqCst) {
            debug!(if_index = self.index, "device tombstoned");
        }
    }

    pub(crate) fn mark_created(&self) {
        self.created.store(true, Ordering::SeqCst);
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Returns `Ok(None)` when the device is disabled and the caller should
    /// skip the kernel call.
    fn begin_mutation(&self) -> Result<Option<Arc<DeviceState>>, DeviceError> {
        let state = self.snapshot()?;
        if !self.is_enabled() {
            debug!(if_index = self.index, "device disabled, skipping configuration");
            return Ok(None);
        }
        Ok(Some(state))
    }

    pub fn enable(&self) -> Result<(), DeviceError> {
        self.snapshot()?;
        self.enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn disable(&self) -> Result<(), DeviceError> {
        self.snapshot()?;
        self.enabled.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn set_mtu(&self, mtu: u32) -> Result<(), DeviceError> {
        if self.begin_mutation()?.is_none() {
            return Ok(());
        }
        self.kernel.set_mtu(self.index, mtu).await?;
        self.update(|s| s.link.mtu = mtu);
        Ok(())
    }

    /// Enslave to `master` (an interface index), or release when `None`.
    pub async fn set_master(&self, master: Option<u32>) -> Result<(), DeviceError> {
        if self.begin_mutation()?.is_none() {
            return Ok(());
        }
        self.kernel.set_master(self.index, master).await?;
        self.update(|s| s.link.master = master);
        Ok(())
    }

    pub async fn ip_add(&self, addr: IpAddress) -> Result<(), DeviceError> {
        let Some(state) = self.begin_mutation()? else {
            return Ok(());
        };
        if state.addrs.contains(&addr) {
            return Ok(());
        }
        self.kernel.add_address(self.index, &addr).await?;
        self.apply_addr_added(addr);
        Ok(())
    }

    pub async fn ip_del(&self, addr: IpAddress) -> Result<(), DeviceError> {
        let Some(state) = self.begin_mutation()? else {
            return Ok(());
        };
        if !state.addrs.contains(&addr) {
            return Ok(());
        }
        self.kernel.del_address(self.index, &addr).await?;
        self.apply_addr_removed(&addr);
        Ok(())
    }

    /// Remove every address. Keeps going after a failure and reports the
    /// first one.
    pub async fn ip_flush(&self) -> Result<(), DeviceError> {
        let Some(state) = self.begin_mutation()? else {
            return Ok(());
        };
        let mut first_err = None;
        for addr in &state.addrs {
            match self.kernel.del_address(self.index, addr).await {
                Ok(()) => self.apply_addr_removed(addr),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub async fn up(&self) -> Result<(), DeviceError> {
        self.set_up(true).await
    }

    pub async fn down(&self) -> Result<(), DeviceError> {
        self.set_up(false).await
    }

    async fn set_up(&self, up: bool) -> Result<(), DeviceError> {
        if self.begin_mutation()?.is_none() {
            return Ok(());
        }
        self.kernel.set_link_up(self.index, up).await?;
        self.update(|s| {
            if up {
                s.link.flags |= IFF_UP;
            } else {
                s.link.flags &= !IFF_UP;
            }
        });
        Ok(())
    }

    pub async fn speed_set(&self, speed: u32) -> Result<(), DeviceError> {
        let Some(state) = self.begin_mutation()? else {
            return Ok(());
        };
        Ok(self.kernel.set_speed(&state.link.name, speed).await?)
    }

    pub async fn autoneg_on(&self) -> Result<(), DeviceError> {
        self.autoneg(true).await
    }

    pub async fn autoneg_off(&self) -> Result<(), DeviceError> {
        self.autoneg(false).await
    }

    async fn autoneg(&self, enabled: bool) -> Result<(), DeviceError> {
        let Some(state) = self.begin_mutation()? else {
            return Ok(());
        };
        Ok(self.kernel.set_autoneg(&state.link.name, enabled).await?)
    }

    /// Put the interface back the way it was first observed: no master,
    /// original MTU, no addresses, link down.
    ///
    /// Every step is attempted; the first failure is returned.
    pub async fn cleanup(&self) -> Result<(), DeviceError> {
        let Some(state) = self.begin_mutation()? else {
            return Ok(());
        };
        let mut first_err: Option<DeviceError> = None;
        let mut note = |r: Result<(), DeviceError>| {
            if let Err(e) = r {
                first_err.get_or_insert(e);
            }
        };

        if state.link.master.is_some() {
            note(self.set_master(None).await);
        }
        if state.link.mtu != self.orig_mtu {
            note(self.set_mtu(self.orig_mtu).await);
        }
        note(self.ip_flush().await);
        note(self.down().await);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete the interface if the agent created it, otherwise clean it up.
    pub async fn destroy(&self) -> Result<(), DeviceError> {
        let Some(state) = self.begin_mutation()? else {
            return Ok(());
        };
        if self.is_created() {
            info!(if_index = self.index, name = %state.link.name, "deleting device");
            self.kernel.delete_link(self.index).await?;
            Ok(())
        } else {
            self.cleanup().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SimKernel;

    async fn eth0() -> (Arc<SimKernel>, Device) {
        let sim = Arc::new(SimKernel::new());
        let idx = sim.add_physical("eth0", "52:54:00:00:00:01".parse().unwrap(), "virtio_net");
        let link = sim.link(idx).unwrap();
        let dev = Device::new(sim.clone(), link, []);
        (sim, dev)
    }

    fn ip(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn tombstone_fails_every_operation() {
        let (_sim, dev) = eth0().await;
        dev.tombstone();

        let deleted = DeviceError::Deleted {
            if_index: dev.if_index(),
        };
        assert_eq!(dev.name().unwrap_err(), deleted);
        assert_eq!(dev.ips().unwrap_err(), deleted);
        assert_eq!(dev.info().unwrap_err(), deleted);
        assert_eq!(dev.set_mtu(9000).await.unwrap_err(), deleted);
        assert_eq!(dev.cleanup().await.unwrap_err(), deleted);
        assert_eq!(dev.enable().unwrap_err(), deleted);
        assert_eq!(dev.disable().unwrap_err(), deleted);
    }

    #[tokio::test]
    async fn disabled_device_ignores_mutations() {
        let (sim, dev) = eth0().await;
        dev.disable().unwrap();
        let before = dev.state_snapshot().unwrap();

        dev.set_mtu(9000).await.unwrap();
        dev.ip_add(ip("10.0.0.1/24")).await.unwrap();
        dev.up().await.unwrap();
        dev.set_mtu(1).await.unwrap();

        assert_eq!(dev.state_snapshot().unwrap(), before);
        assert_eq!(sim.link(dev.if_index()).unwrap().mtu, 1500);
        assert!(sim.addresses(dev.if_index()).is_empty());

        dev.enable().unwrap();
        dev.set_mtu(9000).await.unwrap();
        assert_eq!(dev.mtu().unwrap(), 9000);
    }

    #[tokio::test]
    async fn rejected_mtu_is_invalid_value() {
        let (_sim, dev) = eth0().await;
        let err = dev.set_mtu(20).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidValue(_)));
        assert_eq!(dev.mtu().unwrap(), 1500);
    }

    #[tokio::test]
    async fn address_ops_are_idempotent() {
        let (sim, dev) = eth0().await;
        let a = ip("192.168.1.1/24");
        dev.ip_add(a).await.unwrap();
        dev.ip_add(a).await.unwrap();
        assert_eq!(dev.ips().unwrap(), vec![a]);
        assert_eq!(sim.addresses(dev.if_index()), vec![a]);

        dev.ip_del(a).await.unwrap();
        dev.ip_del(a).await.unwrap();
        assert!(dev.ips().unwrap().is_empty());

        dev.apply_addr_added(a);
        dev.apply_addr_added(a);
        dev.apply_addr_removed(&ip("10.9.9.9/8"));
        assert_eq!(dev.ips().unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn cleanup_restores_first_observation() {
        let (sim, dev) = eth0().await;
        sim.create_link(&netlab_common::models::LinkSpec::Bond {
            name: Some("bond0".into()),
            mode: None,
        })
        .await
        .unwrap();
        let bond = sim.index_of("bond0").unwrap();

        dev.set_mtu(9000).await.unwrap();
        dev.set_master(Some(bond)).await.unwrap();
        dev.ip_add(ip("10.0.0.1/24")).await.unwrap();
        dev.ip_add(ip("fd00::1/64")).await.unwrap();
        dev.up().await.unwrap();

        dev.cleanup().await.unwrap();
        let k = sim.link(dev.if_index()).unwrap();
        assert_eq!(k.mtu, 1500);
        assert_eq!(k.master, None);
        assert_eq!(k.flags & IFF_UP, 0);
        assert!(sim.addresses(dev.if_index()).is_empty());
        assert!(dev.ips().unwrap().is_empty());

        // Second run has nothing left to do.
        dev.cleanup().await.unwrap();
    }

    #[tokio::test]
    async fn apply_link_ignores_foreign_snapshots() {
        let (sim, dev) = eth0().await;
        let mut other = sim.link(1).unwrap();
        other.mtu = 1234;
        dev.apply_link(other.clone());
        dev.apply_snapshot(other, &[ip("10.0.0.1/8")]);
        assert_eq!(dev.mtu().unwrap(), 1500);
        assert!(dev.ips().unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_replaces_link_and_addresses_together() {
        let (sim, dev) = eth0().await;
        dev.apply_addr_added(ip("10.0.0.1/24"));
        let mut link = sim.link(dev.if_index()).unwrap();
        link.mtu = 9000;
        dev.apply_snapshot(link, &[ip("10.0.0.2/24")]);

        let s = dev.state_snapshot().unwrap();
        assert_eq!(s.link.mtu, 9000);
        assert_eq!(s.addrs.into_iter().collect::<Vec<_>>(), vec![ip("10.0.0.2/24")]);
    }
}

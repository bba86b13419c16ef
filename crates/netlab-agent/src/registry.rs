//! Per-machine device registry.
//!
//! The registry owns every [`Device`] on the machine, keyed by kernel index,
//! and keeps the map convergent with the kernel along two paths:
//!
//! - [`DeviceRegistry::rescan`] enumerates the kernel and is authoritative:
//!   unknown indices become new devices, known ones are refreshed and have
//!   their address sets replayed from scratch, and indices missing from the
//!   enumeration are tombstoned and dropped.
//! - [`DeviceRegistry::apply_events`] applies incremental kernel events with
//!   the same create/update/tombstone rules. The feed is lossy, so this path
//!   only lowers latency; rescans keep it correct.
//!
//! Both paths run under one async mutex, so no two passes interleave.
//! Readers of a [`Device`] never take that lock.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use netlab_common::error::DeviceError;
use netlab_common::models::{ARPHRD_LOOPBACK, DeviceInfo, HwAddr, IpAddress, LinkSpec};

use crate::device::Device;
use crate::kernel::{EnumeratedLink, Kernel, KernelEvent, LinkSnapshot};
use crate::probe::HostProbe;

/// Capacity of the registry notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Device lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Created(DeviceInfo),
    Deleted { if_index: u32 },
}

#[derive(Default)]
struct Inner {
    devices: BTreeMap<u32, Arc<Device>>,
    /// First suffix not yet handed out, per name prefix.
    next_suffix: HashMap<String, u32>,
}

pub struct DeviceRegistry {
    kernel: Arc<dyn Kernel>,
    probe: Arc<dyn HostProbe>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    pub fn new(kernel: Arc<dyn Kernel>, probe: Arc<dyn HostProbe>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            kernel,
            probe,
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    pub fn kernel(&self) -> &Arc<dyn Kernel> {
        &self.kernel
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    // ── Reconciliation ───────────────────────────────────────────────

    /// Full reconciliation against a fresh kernel enumeration.
    pub async fn rescan(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        self.rescan_locked(&mut inner).await
    }

    async fn rescan_locked(&self, inner: &mut Inner) -> Result<(), DeviceError> {
        let links = self.kernel.enumerate().await?;
        let mut seen = BTreeSet::new();

        for EnumeratedLink { link, addrs } in links {
            seen.insert(link.index);
            match inner.devices.get(&link.index) {
                Some(dev) => dev.apply_snapshot(link, &addrs),
                None => {
                    let dev = self.create_entry(inner, link, &addrs);
                    self.notify_created(&dev);
                }
            }
        }

        let vanished: Vec<u32> = inner
            .devices
            .keys()
            .filter(|index| !seen.contains(index))
            .copied()
            .collect();
        for index in vanished {
            self.remove_entry(inner, index);
        }

        self.refresh_devlink(inner).await;
        Ok(())
    }

    /// Apply a batch of incremental kernel events in delivery order.
    pub async fn apply_events(&self, events: Vec<KernelEvent>) {
        if events.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().await;
        for event in events {
            match event {
                KernelEvent::NewLink(link) => match inner.devices.get(&link.index) {
                    Some(dev) => dev.apply_link(link),
                    None => {
                        let dev = self.create_entry(&mut inner, link, &[]);
                        self.notify_created(&dev);
                    }
                },
                KernelEvent::DelLink { index } => {
                    if inner.devices.contains_key(&index) {
                        self.remove_entry(&mut inner, index);
                    }
                }
                KernelEvent::NewAddr { index, addr } => {
                    if let Some(dev) = inner.devices.get(&index) {
                        dev.apply_addr_added(addr);
                    }
                }
                KernelEvent::DelAddr { index, addr } => {
                    if let Some(dev) = inner.devices.get(&index) {
                        dev.apply_addr_removed(&addr);
                    }
                }
            }
        }
        self.refresh_devlink(&inner).await;
    }

    fn create_entry(
        &self,
        inner: &mut Inner,
        link: LinkSnapshot,
        addrs: &[IpAddress],
    ) -> Arc<Device> {
        let index = link.index;
        let dev = Arc::new(Device::new(self.kernel.clone(), link, addrs.iter().copied()));
        inner.devices.insert(index, dev.clone());
        dev
    }

    fn notify_created(&self, dev: &Device) {
        if let Ok(info) = dev.info() {
            info!(if_index = info.if_index, name = %info.name, "device created");
            let _ = self.events.send(RegistryEvent::Created(info));
        }
    }

    fn remove_entry(&self, inner: &mut Inner, index: u32) {
        if let Some(dev) = inner.devices.remove(&index) {
            dev.tombstone();
            info!(if_index = index, "device deleted");
            let _ = self.events.send(RegistryEvent::Deleted { if_index: index });
        }
    }

    /// Re-correlate devlink ports by interface name. Devices without a match
    /// lose their port.
    async fn refresh_devlink(&self, inner: &Inner) {
        let ports = self.probe.devlink_ports().await;
        for dev in inner.devices.values() {
            let Ok(name) = dev.name() else { continue };
            let port = ports
                .iter()
                .find(|p| p.netdev.as_deref() == Some(name.as_str()))
                .cloned();
            dev.set_devlink(port);
        }
    }

    // ── Lookups ──────────────────────────────────────────────────────

    /// Current devices without reconciling first, ordered by index.
    pub async fn cached(&self) -> Vec<Arc<Device>> {
        self.inner.lock().await.devices.values().cloned().collect()
    }

    pub async fn devices(&self) -> Result<Vec<Arc<Device>>, DeviceError> {
        let mut inner = self.inner.lock().await;
        self.rescan_locked(&mut inner).await?;
        Ok(inner.devices.values().cloned().collect())
    }

    pub async fn get(&self, if_index: u32) -> Result<Arc<Device>, DeviceError> {
        let mut inner = self.inner.lock().await;
        self.rescan_locked(&mut inner).await?;
        inner
            .devices
            .get(&if_index)
            .cloned()
            .ok_or(DeviceError::NotFound)
    }

    pub async fn by_name(&self, name: &str) -> Result<Arc<Device>, DeviceError> {
        self.find(|info| info.name == name).await
    }

    pub async fn by_hwaddr(&self, hwaddr: &HwAddr) -> Result<Arc<Device>, DeviceError> {
        self.find(|info| &info.hwaddr == hwaddr).await
    }

    /// First device whose attributes equal every given key/value pair.
    pub async fn by_params(
        &self,
        params: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Arc<Device>, DeviceError> {
        self.find(|info| info.matches(params)).await
    }

    async fn find(&self, pred: impl Fn(&DeviceInfo) -> bool) -> Result<Arc<Device>, DeviceError> {
        let mut inner = self.inner.lock().await;
        self.rescan_locked(&mut inner).await?;
        inner
            .devices
            .values()
            .find(|dev| dev.info().is_ok_and(|info| pred(&info)))
            .cloned()
            .ok_or(DeviceError::NotFound)
    }

    /// The device `dev` is enslaved to, resolved by index.
    pub async fn master_of(&self, dev: &Device) -> Result<Option<Arc<Device>>, DeviceError> {
        match dev.master()? {
            Some(index) => self.get(index).await.map(Some),
            None => Ok(None),
        }
    }

    // ── Naming ───────────────────────────────────────────────────────

    /// Next free `<prefix><k>` not used by the kernel or the virtual switch.
    pub async fn assign_name(&self, prefix: &str) -> Result<String, DeviceError> {
        let mut inner = self.inner.lock().await;
        self.assign_name_locked(&mut inner, prefix).await
    }

    /// Two free names; the second suffix is strictly greater than the first.
    pub async fn assign_name_pair(&self, prefix: &str) -> Result<(String, String), DeviceError> {
        let mut inner = self.inner.lock().await;
        let first = self.assign_name_locked(&mut inner, prefix).await?;
        let second = self.assign_name_locked(&mut inner, prefix).await?;
        Ok((first, second))
    }

    async fn assign_name_locked(
        &self,
        inner: &mut Inner,
        prefix: &str,
    ) -> Result<String, DeviceError> {
        self.rescan_locked(inner).await?;
        let mut used: HashSet<String> = inner
            .devices
            .values()
            .filter_map(|dev| dev.name().ok())
            .collect();
        used.extend(self.probe.vswitch_interfaces().await);

        let mut suffix = inner.next_suffix.get(prefix).copied().unwrap_or(0);
        loop {
            let name = format!("{prefix}{suffix}");
            if !used.contains(&name) {
                inner.next_suffix.insert(prefix.to_string(), suffix + 1);
                return Ok(name);
            }
            suffix += 1;
        }
    }

    // ── Software devices ─────────────────────────────────────────────

    /// Create a software interface and return its device. Missing names are
    /// allocated from the kind's prefix.
    pub async fn create_device(&self, mut spec: LinkSpec) -> Result<Arc<Device>, DeviceError> {
        let mut inner = self.inner.lock().await;

        let prefix = spec.name_prefix();
        if let LinkSpec::Veth { name, peer } = &mut spec {
            match (name.is_some(), peer.is_some()) {
                (false, false) => {
                    let a = self.assign_name_locked(&mut inner, prefix).await?;
                    let b = self.assign_name_locked(&mut inner, prefix).await?;
                    *name = Some(a);
                    *peer = Some(b);
                }
                (false, true) => *name = Some(self.assign_name_locked(&mut inner, prefix).await?),
                (true, false) => *peer = Some(self.assign_name_locked(&mut inner, prefix).await?),
                (true, true) => {}
            }
        } else if spec.name().is_none() {
            let name = self.assign_name_locked(&mut inner, prefix).await?;
            spec.set_name(name);
        }

        let name = spec.name().unwrap_or_default().to_string();
        info!(kind = spec.kind(), name = %name, "creating device");
        self.kernel.create_link(&spec).await?;
        self.rescan_locked(&mut inner).await?;

        let mut created_names = vec![name.clone()];
        if let LinkSpec::Veth { peer: Some(peer), .. } = &spec {
            created_names.push(peer.clone());
        }
        let mut result = None;
        for dev in inner.devices.values() {
            let Ok(dev_name) = dev.name() else { continue };
            if created_names.contains(&dev_name) {
                dev.mark_created();
                if dev_name == name {
                    result = Some(dev.clone());
                }
            }
        }
        result.ok_or(DeviceError::NotFound)
    }

    /// Tear down everything the agent configured: delete created devices,
    /// clean up every other non-loopback device and reset name allocation.
    ///
    /// Devices that vanish mid-way are skipped. The first other failure is
    /// returned once every device has been attempted.
    pub async fn destroy_devices(&self) -> Result<(), DeviceError> {
        let mut inner = self.inner.lock().await;
        self.rescan_locked(&mut inner).await?;
        let mut first_err: Option<DeviceError> = None;

        let (created, found): (Vec<Arc<Device>>, Vec<Arc<Device>>) =
            inner.devices.values().cloned().partition(|d| d.is_created());

        for dev in created {
            note_teardown(&mut first_err, dev.if_index(), dev.destroy().await);
        }
        self.rescan_locked(&mut inner).await?;

        for dev in found {
            if dev.is_deleted() || dev.link_header_type().ok() == Some(ARPHRD_LOOPBACK) {
                continue;
            }
            note_teardown(&mut first_err, dev.if_index(), dev.cleanup().await);
        }

        inner.next_suffix.clear();
        self.rescan_locked(&mut inner).await?;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn note_teardown(first_err: &mut Option<DeviceError>, if_index: u32, result: Result<(), DeviceError>) {
    match result {
        Ok(()) => {}
        Err(DeviceError::NotFound | DeviceError::Deleted { .. }) => {
            debug!(if_index, "device vanished during teardown");
        }
        Err(e) => {
            warn!(if_index, error = %e, "device teardown failed");
            first_err.get_or_insert(e);
        }
    }
}

//! In-memory kernel used by tests and `--simulate`.
//!
//! Validates configuration the way the kernel does for the cases the agent
//! cares about (MTU range, controller kinds, duplicate names) and emits the
//! same event stream. Event delivery can be switched off to exercise the
//! registry's recovery through rescans.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use netlab_common::models::{
    ARPHRD_ETHER, ARPHRD_LOOPBACK, HwAddr, IFF_UP, IpAddress, LinkSpec, LinkStats,
};

use super::{EnumeratedLink, Kernel, KernelError, KernelEvent, LinkSnapshot};

const MIN_MTU: u32 = 68;
const MAX_MTU: u32 = 65535;

/// `IFF_RUNNING | IFF_LOWER_UP`, set together with `IFF_UP`.
const CARRIER_FLAGS: u32 = 0x40 | 0x10000;
const IFF_LOOPBACK: u32 = 0x8;
const IFF_BROADCAST_MULTICAST: u32 = 0x2 | 0x1000;

#[derive(Debug, Clone)]
struct SimLink {
    snap: LinkSnapshot,
    addrs: BTreeSet<IpAddress>,
    peer: Option<u32>,
    parent: Option<u32>,
    speed: Option<u32>,
    autoneg: bool,
}

#[derive(Debug)]
struct SimState {
    links: BTreeMap<u32, SimLink>,
    next_index: u32,
}

impl SimState {
    fn by_name(&self, name: &str) -> Option<&SimLink> {
        self.links.values().find(|l| l.snap.name == name)
    }

    fn by_name_mut(&mut self, name: &str) -> Option<&mut SimLink> {
        self.links.values_mut().find(|l| l.snap.name == name)
    }

    fn link_mut(&mut self, index: u32) -> Result<&mut SimLink, KernelError> {
        self.links
            .get_mut(&index)
            .ok_or_else(|| KernelError::NoSuchLink(index.to_string()))
    }

    fn alloc_index(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

pub struct SimKernel {
    state: Mutex<SimState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<KernelEvent>>>,
    drop_events: AtomicBool,
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl SimKernel {
    /// A namespace containing only `lo`.
    pub fn new() -> Self {
        let lo = SimLink {
            snap: LinkSnapshot {
                index: 1,
                name: "lo".into(),
                hwaddr: HwAddr::new(vec![0u8; 6]),
                mtu: 65536,
                link_type: ARPHRD_LOOPBACK,
                flags: IFF_UP | IFF_LOOPBACK | CARRIER_FLAGS,
                master: None,
                kind: None,
                driver: Some("loopback".into()),
                stats: LinkStats::default(),
            },
            addrs: ["127.0.0.1/8", "::1/128"]
                .iter()
                .filter_map(|a| a.parse().ok())
                .collect(),
            peer: None,
            parent: None,
            speed: None,
            autoneg: false,
        };
        let mut links = BTreeMap::new();
        links.insert(1, lo);
        Self {
            state: Mutex::new(SimState {
                links,
                next_index: 2,
            }),
            subscribers: Mutex::new(Vec::new()),
            drop_events: AtomicBool::new(false),
        }
    }

    /// Stop (or resume) delivering events to subscribers.
    pub fn set_drop_events(&self, drop: bool) {
        self.drop_events.store(drop, Ordering::SeqCst);
    }

    /// Plug in a physical Ethernet NIC. Returns its index.
    pub fn add_physical(&self, name: &str, hwaddr: HwAddr, driver: &str) -> u32 {
        let snap = {
            let mut state = self.lock();
            let index = state.alloc_index();
            let link = SimLink {
                snap: LinkSnapshot {
                    index,
                    name: name.to_string(),
                    hwaddr,
                    mtu: 1500,
                    link_type: ARPHRD_ETHER,
                    flags: IFF_BROADCAST_MULTICAST,
                    master: None,
                    kind: None,
                    driver: Some(driver.to_string()),
                    stats: LinkStats::default(),
                },
                addrs: BTreeSet::new(),
                peer: None,
                parent: None,
                speed: None,
                autoneg: true,
            };
            let snap = link.snap.clone();
            state.links.insert(index, link);
            snap
        };
        self.emit(KernelEvent::NewLink(snap.clone()));
        snap.index
    }

    /// Remove a link as if it was unplugged or deleted by someone else.
    pub fn remove_link(&self, index: u32) -> Result<(), KernelError> {
        let events = {
            let mut state = self.lock();
            Self::remove_locked(&mut state, index)?
        };
        self.emit_all(events);
        Ok(())
    }

    /// Add an address behind the agent's back.
    pub fn add_external_address(&self, index: u32, addr: IpAddress) -> Result<(), KernelError> {
        {
            let mut state = self.lock();
            state.link_mut(index)?.addrs.insert(addr);
        }
        self.emit(KernelEvent::NewAddr { index, addr });
        Ok(())
    }

    pub fn link(&self, index: u32) -> Option<LinkSnapshot> {
        self.lock().links.get(&index).map(|l| l.snap.clone())
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.lock().by_name(name).map(|l| l.snap.index)
    }

    pub fn addresses(&self, index: u32) -> Vec<IpAddress> {
        self.lock()
            .links
            .get(&index)
            .map(|l| l.addrs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Forced speed and autonegotiation state of `name`.
    pub fn link_speed(&self, name: &str) -> Option<(Option<u32>, bool)> {
        self.lock().by_name(name).map(|l| (l.speed, l.autoneg))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: KernelEvent) {
        self.emit_all(vec![event]);
    }

    fn emit_all(&self, events: Vec<KernelEvent>) {
        if self.drop_events.load(Ordering::SeqCst) {
            return;
        }
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| events.iter().all(|ev| tx.send(ev.clone()).is_ok()));
    }

    fn remove_locked(state: &mut SimState, index: u32) -> Result<Vec<KernelEvent>, KernelError> {
        let link = state
            .links
            .remove(&index)
            .ok_or_else(|| KernelError::NoSuchLink(index.to_string()))?;
        let mut events = vec![KernelEvent::DelLink { index }];

        if let Some(peer) = link.peer
            && state.links.remove(&peer).is_some()
        {
            events.push(KernelEvent::DelLink { index: peer });
        }

        // Deleting a controller releases its ports; deleting a parent takes
        // its stacked links with it.
        let stacked: Vec<u32> = state
            .links
            .values()
            .filter(|l| l.parent == Some(index))
            .map(|l| l.snap.index)
            .collect();
        for child in stacked {
            state.links.remove(&child);
            events.push(KernelEvent::DelLink { index: child });
        }
        for port in state.links.values_mut() {
            if port.snap.master == Some(index) {
                port.snap.master = None;
                events.push(KernelEvent::NewLink(port.snap.clone()));
            }
        }
        Ok(events)
    }

    fn software_link(index: u32, name: &str, kind: &str) -> SimLink {
        let hwaddr = HwAddr::from_u64(0x0a00_0000_0000 | u64::from(index));
        SimLink {
            snap: LinkSnapshot {
                index,
                name: name.to_string(),
                hwaddr,
                mtu: 1500,
                link_type: ARPHRD_ETHER,
                flags: IFF_BROADCAST_MULTICAST,
                master: None,
                kind: Some(kind.to_string()),
                driver: Some(kind.to_string()),
                stats: LinkStats::default(),
            },
            addrs: BTreeSet::new(),
            peer: None,
            parent: None,
            speed: None,
            autoneg: false,
        }
    }
}

#[async_trait]
impl Kernel for SimKernel {
    async fn enumerate(&self) -> Result<Vec<EnumeratedLink>, KernelError> {
        Ok(self
            .lock()
            .links
            .values()
            .map(|l| EnumeratedLink {
                link: l.snap.clone(),
                addrs: l.addrs.iter().copied().collect(),
            })
            .collect())
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<KernelEvent>, KernelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        Ok(rx)
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), KernelError> {
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(KernelError::InvalidValue("Invalid MTU value".into()));
        }
        let snap = {
            let mut state = self.lock();
            let link = state.link_mut(index)?;
            link.snap.mtu = mtu;
            link.snap.clone()
        };
        self.emit(KernelEvent::NewLink(snap));
        Ok(())
    }

    async fn set_master(&self, index: u32, master: Option<u32>) -> Result<(), KernelError> {
        let snap = {
            let mut state = self.lock();
            if let Some(m) = master {
                if m == index {
                    return Err(KernelError::InvalidValue(
                        "cannot enslave a link to itself".into(),
                    ));
                }
                let target = state
                    .links
                    .get(&m)
                    .ok_or_else(|| KernelError::InvalidValue(format!("no master link {m}")))?;
                let is_controller = target
                    .snap
                    .kind
                    .as_deref()
                    .is_some_and(LinkSpec::is_controller_kind);
                if !is_controller {
                    return Err(KernelError::InvalidValue(format!(
                        "{} cannot be a master",
                        target.snap.name
                    )));
                }
            }
            let link = state.link_mut(index)?;
            link.snap.master = master;
            link.snap.clone()
        };
        self.emit(KernelEvent::NewLink(snap));
        Ok(())
    }

    async fn add_address(&self, index: u32, addr: &IpAddress) -> Result<(), KernelError> {
        {
            let mut state = self.lock();
            if !state.link_mut(index)?.addrs.insert(*addr) {
                return Err(KernelError::Request(format!("{addr}: address already assigned")));
            }
        }
        self.emit(KernelEvent::NewAddr { index, addr: *addr });
        Ok(())
    }

    async fn del_address(&self, index: u32, addr: &IpAddress) -> Result<(), KernelError> {
        {
            let mut state = self.lock();
            if !state.link_mut(index)?.addrs.remove(addr) {
                return Err(KernelError::Request(format!(
                    "{addr}: cannot assign requested address"
                )));
            }
        }
        self.emit(KernelEvent::DelAddr { index, addr: *addr });
        Ok(())
    }

    async fn set_link_up(&self, index: u32, up: bool) -> Result<(), KernelError> {
        let snap = {
            let mut state = self.lock();
            let link = state.link_mut(index)?;
            if up {
                link.snap.flags |= IFF_UP | CARRIER_FLAGS;
            } else {
                link.snap.flags &= !(IFF_UP | CARRIER_FLAGS);
            }
            link.snap.clone()
        };
        self.emit(KernelEvent::NewLink(snap));
        Ok(())
    }

    async fn set_speed(&self, name: &str, speed: u32) -> Result<(), KernelError> {
        let mut state = self.lock();
        let link = state
            .by_name_mut(name)
            .ok_or_else(|| KernelError::NoSuchLink(name.to_string()))?;
        if link.snap.kind.is_some() {
            return Err(KernelError::Request(format!(
                "{name}: operation not supported"
            )));
        }
        link.speed = Some(speed);
        link.autoneg = false;
        Ok(())
    }

    async fn set_autoneg(&self, name: &str, enabled: bool) -> Result<(), KernelError> {
        let mut state = self.lock();
        let link = state
            .by_name_mut(name)
            .ok_or_else(|| KernelError::NoSuchLink(name.to_string()))?;
        if link.snap.kind.is_some() {
            return Err(KernelError::Request(format!(
                "{name}: operation not supported"
            )));
        }
        link.autoneg = enabled;
        if enabled {
            link.speed = None;
        }
        Ok(())
    }

    async fn create_link(&self, spec: &LinkSpec) -> Result<(), KernelError> {
        let name = spec
            .name()
            .ok_or_else(|| KernelError::InvalidValue("link name required".into()))?
            .to_string();

        let events = {
            let mut state = self.lock();
            if state.by_name(&name).is_some() {
                return Err(KernelError::Request(format!("{name}: file exists")));
            }

            let mut created = Vec::new();
            match spec {
                LinkSpec::Veth { peer, .. } => {
                    let peer_name = peer.clone().unwrap_or_else(|| format!("{name}p"));
                    if state.by_name(&peer_name).is_some() {
                        return Err(KernelError::Request(format!("{peer_name}: file exists")));
                    }
                    let a = state.alloc_index();
                    let b = state.alloc_index();
                    let mut first = Self::software_link(a, &name, "veth");
                    let mut second = Self::software_link(b, &peer_name, "veth");
                    first.peer = Some(b);
                    second.peer = Some(a);
                    created.push(first);
                    created.push(second);
                }
                LinkSpec::Vlan { parent, .. } => {
                    if !state.links.contains_key(parent) {
                        return Err(KernelError::InvalidValue(format!(
                            "no parent link {parent}"
                        )));
                    }
                    let index = state.alloc_index();
                    let mut link = Self::software_link(index, &name, "vlan");
                    link.parent = Some(*parent);
                    created.push(link);
                }
                LinkSpec::Vxlan { parent, .. } => {
                    if let Some(p) = parent
                        && !state.links.contains_key(p)
                    {
                        return Err(KernelError::InvalidValue(format!("no parent link {p}")));
                    }
                    let index = state.alloc_index();
                    created.push(Self::software_link(index, &name, "vxlan"));
                }
                LinkSpec::Bond { .. } | LinkSpec::Bridge { .. } | LinkSpec::Team { .. } => {
                    let index = state.alloc_index();
                    created.push(Self::software_link(index, &name, spec.kind()));
                }
            }

            created
                .into_iter()
                .map(|link| {
                    let event = KernelEvent::NewLink(link.snap.clone());
                    state.links.insert(link.snap.index, link);
                    event
                })
                .collect::<Vec<_>>()
        };
        self.emit_all(events);
        Ok(())
    }

    async fn delete_link(&self, index: u32) -> Result<(), KernelError> {
        self.remove_link(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(s: &str) -> HwAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn starts_with_loopback() {
        let k = SimKernel::new();
        let links = k.enumerate().await.unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].link.name, "lo");
        assert_eq!(links[0].link.link_type, ARPHRD_LOOPBACK);
        assert_eq!(links[0].addrs.len(), 2);
    }

    #[tokio::test]
    async fn mtu_out_of_range_is_invalid() {
        let k = SimKernel::new();
        let idx = k.add_physical("eth0", mac("52:54:00:00:00:01"), "virtio_net");
        assert!(matches!(
            k.set_mtu(idx, 10).await,
            Err(KernelError::InvalidValue(_))
        ));
        k.set_mtu(idx, 9000).await.unwrap();
        assert_eq!(k.link(idx).unwrap().mtu, 9000);
    }

    #[tokio::test]
    async fn only_controllers_accept_ports() {
        let k = SimKernel::new();
        let eth0 = k.add_physical("eth0", mac("52:54:00:00:00:01"), "virtio_net");
        let eth1 = k.add_physical("eth1", mac("52:54:00:00:00:02"), "virtio_net");
        assert!(matches!(
            k.set_master(eth0, Some(eth1)).await,
            Err(KernelError::InvalidValue(_))
        ));

        k.create_link(&LinkSpec::Bond {
            name: Some("bond0".into()),
            mode: None,
        })
        .await
        .unwrap();
        let bond = k.index_of("bond0").unwrap();
        k.set_master(eth0, Some(bond)).await.unwrap();
        assert_eq!(k.link(eth0).unwrap().master, Some(bond));

        k.delete_link(bond).await.unwrap();
        assert_eq!(k.link(eth0).unwrap().master, None);
    }

    #[tokio::test]
    async fn veth_pairs_die_together() {
        let k = SimKernel::new();
        let mut rx = k.subscribe().unwrap();
        k.create_link(&LinkSpec::Veth {
            name: Some("veth0".into()),
            peer: Some("veth1".into()),
        })
        .await
        .unwrap();
        let a = k.index_of("veth0").unwrap();
        let b = k.index_of("veth1").unwrap();
        k.delete_link(a).await.unwrap();
        assert!(k.link(b).is_none());

        let mut deleted = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let KernelEvent::DelLink { index } = ev {
                deleted.push(index);
            }
        }
        assert_eq!(deleted, vec![a, b]);
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let k = SimKernel::new();
        k.add_physical("eth0", mac("52:54:00:00:00:01"), "virtio_net");
        let err = k
            .create_link(&LinkSpec::Bridge {
                name: Some("eth0".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Request(_)));
    }

    #[tokio::test]
    async fn dropped_events_never_reach_subscribers() {
        let k = SimKernel::new();
        let mut rx = k.subscribe().unwrap();
        k.set_drop_events(true);
        k.add_physical("eth0", mac("52:54:00:00:00:01"), "virtio_net");
        assert!(rx.try_recv().is_err());
        k.set_drop_events(false);
        k.add_physical("eth1", mac("52:54:00:00:00:02"), "virtio_net");
        assert!(matches!(rx.try_recv(), Ok(KernelEvent::NewLink(_))));
    }
}

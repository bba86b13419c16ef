//! rtnetlink-backed [`Kernel`].
//!
//! Reads and link/address mutations go over rtnetlink. Software link
//! creation shells out to `ip link add` and speed settings to `ethtool`,
//! since each link kind carries its own attribute set.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use futures::stream::{StreamExt, TryStreamExt};
use rtnetlink::packet_core::NetlinkPayload;
use rtnetlink::packet_route::RouteNetlinkMessage;
use rtnetlink::packet_route::address::{AddressAttribute, AddressMessage};
use rtnetlink::packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use rtnetlink::sys::{AsyncSocket, SocketAddr};
use rtnetlink::{Handle, LinkUnspec};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use netlab_common::models::{ARPHRD_LOOPBACK, HwAddr, IpAddress, LinkSpec, LinkStats};

use super::{EnumeratedLink, Kernel, KernelError, KernelEvent, LinkSnapshot};

const SYSFS_NET: &str = "/sys/class/net";
const VXLAN_DEFAULT_PORT: u16 = 4789;

pub struct NetlinkKernel {
    handle: Handle,
}

impl NetlinkKernel {
    /// Open the request connection. Must be called inside a tokio runtime.
    pub fn new() -> Result<Self, KernelError> {
        let rt = tokio::runtime::Handle::try_current()
            .map_err(|_| KernelError::Request("tokio is not running".into()))?;
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| KernelError::Request(format!("unable to create netlink socket: {e}")))?;
        rt.spawn(connection);
        Ok(Self { handle })
    }

    async fn link_set(&self, message: LinkMessage) -> Result<(), KernelError> {
        self.handle
            .link()
            .set(message)
            .execute()
            .await
            .map_err(map_error)
    }

    async fn link_name(&self, index: u32) -> Result<String, KernelError> {
        let mut links = self.handle.link().get().match_index(index).execute();
        match links.try_next().await.map_err(map_error)? {
            Some(msg) => Ok(link_snapshot(&msg).name),
            None => Err(KernelError::NoSuchLink(index.to_string())),
        }
    }

    async fn link_add_args(&self, spec: &LinkSpec) -> Result<Vec<String>, KernelError> {
        let name = spec
            .name()
            .ok_or_else(|| KernelError::InvalidValue("link name required".into()))?
            .to_string();
        let mut args: Vec<String> = vec!["link".into(), "add".into()];

        if let LinkSpec::Vlan { parent, .. } = spec {
            args.extend(["link".into(), self.link_name(*parent).await?]);
        }
        args.extend(["name".into(), name.clone(), "type".into(), spec.kind().into()]);

        match spec {
            LinkSpec::Bond {
                mode: Some(mode), ..
            } => args.extend(["mode".into(), mode.clone()]),
            LinkSpec::Vlan { vlan_id, .. } => args.extend(["id".into(), vlan_id.to_string()]),
            LinkSpec::Vxlan {
                vni,
                parent,
                remote,
                group,
                dst_port,
                ..
            } => {
                args.extend(["id".into(), vni.to_string()]);
                if let Some(p) = parent {
                    args.extend(["dev".into(), self.link_name(*p).await?]);
                }
                if let Some(r) = remote {
                    args.extend(["remote".into(), r.to_string()]);
                }
                if let Some(g) = group {
                    args.extend(["group".into(), g.to_string()]);
                }
                let port = dst_port.unwrap_or(VXLAN_DEFAULT_PORT);
                args.extend(["dstport".into(), port.to_string()]);
            }
            LinkSpec::Veth { peer, .. } => {
                let peer = peer.clone().unwrap_or_else(|| format!("{name}p"));
                args.extend(["peer".into(), "name".into(), peer]);
            }
            _ => {}
        }
        Ok(args)
    }
}

#[async_trait]
impl Kernel for NetlinkKernel {
    async fn enumerate(&self) -> Result<Vec<EnumeratedLink>, KernelError> {
        let links: Vec<LinkMessage> = self
            .handle
            .link()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(map_error)?;

        let mut addrs: HashMap<u32, Vec<IpAddress>> = HashMap::new();
        let mut stream = self.handle.address().get().execute();
        while let Some(msg) = stream.try_next().await.map_err(map_error)? {
            if let Some(addr) = address_of(&msg) {
                addrs.entry(msg.header.index).or_default().push(addr);
            }
        }

        Ok(links
            .iter()
            .map(|msg| {
                let link = link_snapshot(msg);
                let addrs = addrs.remove(&link.index).unwrap_or_default();
                EnumeratedLink { link, addrs }
            })
            .collect())
    }

    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<KernelEvent>, KernelError> {
        use rtnetlink::constants::{RTMGRP_IPV4_IFADDR, RTMGRP_IPV6_IFADDR, RTMGRP_LINK};

        let rt = tokio::runtime::Handle::try_current()
            .map_err(|_| KernelError::Request("tokio is not running".into()))?;
        let (mut connection, _handle, mut messages) = rtnetlink::new_connection()
            .map_err(|e| KernelError::Request(format!("unable to create netlink socket: {e}")))?;

        let addr = SocketAddr::new(0, RTMGRP_LINK | RTMGRP_IPV4_IFADDR | RTMGRP_IPV6_IFADDR);
        connection
            .socket_mut()
            .socket_mut()
            .bind(&addr)
            .map_err(|e| KernelError::Request(format!("failed to bind netlink socket: {e}")))?;
        let conn_task = rt.spawn(connection);

        let (tx, rx) = mpsc::unbounded_channel();
        rt.spawn(async move {
            while let Some((message, _)) = messages.next().await {
                let NetlinkPayload::InnerMessage(msg) = message.payload else {
                    continue;
                };
                let event = match msg {
                    RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::SetLink(link) => {
                        KernelEvent::NewLink(link_snapshot(&link))
                    }
                    RouteNetlinkMessage::DelLink(link) => KernelEvent::DelLink {
                        index: link.header.index,
                    },
                    RouteNetlinkMessage::NewAddress(a) => match address_of(&a) {
                        Some(addr) => KernelEvent::NewAddr {
                            index: a.header.index,
                            addr,
                        },
                        None => continue,
                    },
                    RouteNetlinkMessage::DelAddress(a) => match address_of(&a) {
                        Some(addr) => KernelEvent::DelAddr {
                            index: a.header.index,
                            addr,
                        },
                        None => continue,
                    },
                    _ => continue,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
            debug!("netlink event subscription closed");
            conn_task.abort();
        });
        Ok(rx)
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), KernelError> {
        self.link_set(LinkUnspec::new_with_index(index).mtu(mtu).build())
            .await
    }

    async fn set_master(&self, index: u32, master: Option<u32>) -> Result<(), KernelError> {
        let builder = LinkUnspec::new_with_index(index);
        let msg = match master {
            Some(m) => builder.controller(m).build(),
            None => builder.nocontroller().build(),
        };
        self.link_set(msg).await
    }

    async fn add_address(&self, index: u32, addr: &IpAddress) -> Result<(), KernelError> {
        self.handle
            .address()
            .add(index, addr.addr, addr.prefix_len)
            .execute()
            .await
            .map_err(map_error)
    }

    async fn del_address(&self, index: u32, addr: &IpAddress) -> Result<(), KernelError> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(msg) = stream.try_next().await.map_err(map_error)? {
            if address_of(&msg).as_ref() == Some(addr) {
                return self
                    .handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(map_error);
            }
        }
        Err(KernelError::Request(format!(
            "{addr}: cannot assign requested address"
        )))
    }

    async fn set_link_up(&self, index: u32, up: bool) -> Result<(), KernelError> {
        let builder = LinkUnspec::new_with_index(index);
        let msg = if up {
            builder.up().build()
        } else {
            builder.down().build()
        };
        self.link_set(msg).await
    }

    async fn set_speed(&self, name: &str, speed: u32) -> Result<(), KernelError> {
        run_tool(
            "ethtool",
            &[
                "-s".into(),
                name.into(),
                "speed".into(),
                speed.to_string(),
                "autoneg".into(),
                "off".into(),
            ],
        )
        .await
    }

    async fn set_autoneg(&self, name: &str, enabled: bool) -> Result<(), KernelError> {
        let state = if enabled { "on" } else { "off" };
        run_tool(
            "ethtool",
            &["-s".into(), name.into(), "autoneg".into(), state.into()],
        )
        .await
    }

    async fn create_link(&self, spec: &LinkSpec) -> Result<(), KernelError> {
        let args = self.link_add_args(spec).await?;
        run_tool("ip", &args).await
    }

    async fn delete_link(&self, index: u32) -> Result<(), KernelError> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(map_error)
    }
}

fn map_error(err: rtnetlink::Error) -> KernelError {
    if let rtnetlink::Error::NetlinkError(ref msg) = err {
        let code = msg.raw_code();
        let rejected = [
            libc::EINVAL,
            libc::ERANGE,
            libc::EOPNOTSUPP,
            libc::EBUSY,
            libc::EEXIST,
            libc::EPERM,
        ];
        if rejected.iter().any(|errno| code == -errno) {
            return KernelError::InvalidValue(err.to_string());
        }
        if code == -libc::ENODEV {
            return KernelError::NoSuchLink(err.to_string());
        }
    }
    KernelError::Request(err.to_string())
}

async fn run_tool(program: &str, args: &[String]) -> Result<(), KernelError> {
    debug!(program, args = %args.join(" "), "running");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| KernelError::Request(format!("{program}: {e}")))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    warn!(program, args = %args.join(" "), %stderr, "command failed");
    if stderr.contains("Invalid argument") || stderr.contains("not supported") {
        Err(KernelError::InvalidValue(stderr))
    } else {
        Err(KernelError::Request(format!("{program}: {stderr}")))
    }
}

fn link_kind(kind: &InfoKind) -> String {
    match kind {
        InfoKind::Other(s) => s.clone(),
        k => format!("{k:?}").to_lowercase(),
    }
}

/// Driver bound to the link's device, falling back to its link kind.
fn link_driver(name: &str, kind: Option<&str>, link_type: u16) -> Option<String> {
    let path = Path::new(SYSFS_NET).join(name).join("device/driver");
    if let Ok(target) = std::fs::read_link(path)
        && let Some(driver) = target.file_name()
    {
        return Some(driver.to_string_lossy().into_owned());
    }
    if let Some(kind) = kind {
        return Some(kind.to_string());
    }
    (link_type == ARPHRD_LOOPBACK).then(|| "loopback".to_string())
}

fn link_snapshot(msg: &LinkMessage) -> LinkSnapshot {
    let mut snap = LinkSnapshot {
        index: msg.header.index,
        name: String::new(),
        hwaddr: HwAddr::default(),
        mtu: 0,
        link_type: u16::from(msg.header.link_layer_type),
        flags: msg.header.flags.bits(),
        master: None,
        kind: None,
        driver: None,
        stats: LinkStats::default(),
    };
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => snap.name = name.clone(),
            LinkAttribute::Address(bytes) => snap.hwaddr = HwAddr::new(bytes.clone()),
            LinkAttribute::Mtu(mtu) => snap.mtu = *mtu,
            LinkAttribute::Controller(m) => snap.master = Some(*m),
            LinkAttribute::Stats64(s) => {
                snap.stats = LinkStats {
                    rx_packets: s.rx_packets,
                    tx_packets: s.tx_packets,
                    rx_bytes: s.rx_bytes,
                    tx_bytes: s.tx_bytes,
                    rx_errors: s.rx_errors,
                    tx_errors: s.tx_errors,
                    rx_dropped: s.rx_dropped,
                    tx_dropped: s.tx_dropped,
                }
            }
            LinkAttribute::LinkInfo(infos) => {
                snap.kind = infos.iter().find_map(|info| match info {
                    LinkInfo::Kind(kind) => Some(link_kind(kind)),
                    _ => None,
                });
            }
            _ => {}
        }
    }
    snap.driver = link_driver(&snap.name, snap.kind.as_deref(), snap.link_type);
    snap
}

fn address_of(msg: &AddressMessage) -> Option<IpAddress> {
    let mut address: Option<IpAddr> = None;
    for attr in &msg.attributes {
        match attr {
            // IFA_LOCAL is the interface's own address on point-to-point links.
            AddressAttribute::Local(ip) => return Some(IpAddress::new(*ip, msg.header.prefix_len)),
            AddressAttribute::Address(ip) => address = Some(*ip),
            _ => {}
        }
    }
    address.map(|ip| IpAddress::new(ip, msg.header.prefix_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn other_kinds_keep_their_name() {
        assert_eq!(link_kind(&InfoKind::Other("team".into())), "team");
        assert_eq!(link_kind(&InfoKind::Bond), "bond");
        assert_eq!(link_kind(&InfoKind::Veth), "veth");
    }

    #[test]
    fn loopback_driver_without_sysfs_entry() {
        assert_eq!(
            link_driver("no-such-link-xyz", None, ARPHRD_LOOPBACK).as_deref(),
            Some("loopback")
        );
        assert_eq!(
            link_driver("no-such-link-xyz", Some("bridge"), 1).as_deref(),
            Some("bridge")
        );
        assert_eq!(link_driver("no-such-link-xyz", None, 1), None);
    }

    #[tokio::test]
    async fn enumerate_finds_loopback() {
        // Netlink reads need no privileges, only a network namespace.
        let Ok(kernel) = NetlinkKernel::new() else {
            eprintln!("Skipping: netlink unavailable");
            return;
        };
        let Ok(links) = kernel.enumerate().await else {
            eprintln!("Skipping: netlink dump failed");
            return;
        };
        assert!(links.iter().any(|l| l.link.link_type == ARPHRD_LOOPBACK));
    }
}

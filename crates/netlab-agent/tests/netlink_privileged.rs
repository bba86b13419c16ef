//! Registry round-trips against the real kernel.
//!
//! These tests create and delete software links, so they need root and the
//! `ip` tool. They skip themselves otherwise.

use std::process::Command;
use std::sync::Arc;

use netlab_agent::kernel::{Kernel, NetlinkKernel};
use netlab_agent::probe::StaticProbe;
use netlab_agent::registry::DeviceRegistry;
use netlab_common::error::DeviceError;
use netlab_common::models::{IFF_UP, IpAddress, LinkSpec};

fn check_privileges() -> bool {
    // SAFETY: geteuid has no preconditions.
    if unsafe { libc::geteuid() } != 0 {
        return false;
    }
    match Command::new("ip").arg("link").output() {
        Ok(o) => o.status.success(),
        Err(_) => false,
    }
}

fn unique_name(prefix: &str) -> String {
    let name = format!("{}{:x}", prefix, std::process::id() % 0xFFFF);
    name.chars().take(15).collect()
}

fn registry() -> Option<(Arc<NetlinkKernel>, DeviceRegistry)> {
    if !check_privileges() {
        eprintln!("Skipping: requires root and iproute2");
        return None;
    }
    let kernel = Arc::new(NetlinkKernel::new().ok()?);
    let reg = DeviceRegistry::new(kernel.clone(), Arc::new(StaticProbe::new()));
    Some((kernel, reg))
}

#[tokio::test]
async fn bridge_lifecycle_is_reflected_in_registry() {
    let Some((kernel, reg)) = registry() else { return };
    let name = unique_name("nlbr");

    let dev = reg
        .create_device(LinkSpec::Bridge {
            name: Some(name.clone()),
        })
        .await
        .expect("create bridge");
    assert!(dev.is_created());
    assert_eq!(dev.driver().unwrap().as_deref(), Some("bridge"));

    dev.set_mtu(1400).await.unwrap();
    let addr: IpAddress = "192.0.2.77/24".parse().unwrap();
    dev.ip_add(addr).await.unwrap();
    dev.up().await.unwrap();

    reg.rescan().await.unwrap();
    let seen = reg.by_name(&name).await.unwrap();
    assert_eq!(seen.if_index(), dev.if_index());
    assert_eq!(seen.mtu().unwrap(), 1400);
    assert!(seen.ips().unwrap().contains(&addr));
    let flags = kernel
        .enumerate()
        .await
        .unwrap()
        .into_iter()
        .find(|l| l.link.index == dev.if_index())
        .map(|l| l.link.flags)
        .unwrap();
    assert_ne!(flags & IFF_UP, 0);

    dev.destroy().await.unwrap();
    reg.rescan().await.unwrap();
    assert!(dev.is_deleted());
    assert!(matches!(
        reg.by_name(&name).await,
        Err(DeviceError::NotFound)
    ));
}

#[tokio::test]
async fn invalid_mtu_is_rejected_by_kernel() {
    let Some((_kernel, reg)) = registry() else { return };
    let name = unique_name("nlmt");

    let dev = reg
        .create_device(LinkSpec::Bridge {
            name: Some(name.clone()),
        })
        .await
        .expect("create bridge");
    let before = dev.mtu().unwrap();
    let res = dev.set_mtu(10).await;
    assert!(matches!(res, Err(DeviceError::InvalidValue(_))), "{res:?}");
    assert_eq!(dev.mtu().unwrap(), before);

    dev.destroy().await.unwrap();
}

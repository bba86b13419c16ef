//! Virtual machine plumbing for virtual matches: bridges on the controller
//! host and hot-plugged guest interfaces.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use netlab_common::models::HwAddr;

use crate::error::ControllerError;

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn create_bridge(&self, name: &str) -> Result<(), ControllerError>;

    async fn destroy_bridge(&self, name: &str) -> Result<(), ControllerError>;

    /// Hot-plug an interface with `hwaddr` into `domain`, attached to `bridge`.
    async fn attach_interface(
        &self,
        domain: &str,
        bridge: &str,
        hwaddr: &HwAddr,
        driver: Option<&str>,
    ) -> Result<(), ControllerError>;

    async fn detach_interface(&self, domain: &str, hwaddr: &HwAddr) -> Result<(), ControllerError>;
}

/// libvirt domains with Linux bridges, driven through `ip` and `virsh`.
#[derive(Debug, Default, Clone)]
pub struct LibvirtHypervisor;

#[async_trait]
impl Hypervisor for LibvirtHypervisor {
    async fn create_bridge(&self, name: &str) -> Result<(), ControllerError> {
        run("ip", &["link", "add", "name", name, "type", "bridge"]).await?;
        run("ip", &["link", "set", name, "up"]).await
    }

    async fn destroy_bridge(&self, name: &str) -> Result<(), ControllerError> {
        run("ip", &["link", "del", name]).await
    }

    async fn attach_interface(
        &self,
        domain: &str,
        bridge: &str,
        hwaddr: &HwAddr,
        driver: Option<&str>,
    ) -> Result<(), ControllerError> {
        let mac = hwaddr.to_string();
        let mut args = vec![
            "attach-interface",
            "--domain",
            domain,
            "--type",
            "bridge",
            "--source",
            bridge,
            "--mac",
            &mac,
            "--live",
        ];
        if let Some(model) = driver {
            args.extend(["--model", model]);
        }
        run("virsh", &args).await
    }

    async fn detach_interface(&self, domain: &str, hwaddr: &HwAddr) -> Result<(), ControllerError> {
        let mac = hwaddr.to_string();
        run(
            "virsh",
            &["detach-interface", "--domain", domain, "--type", "bridge", "--mac", &mac, "--live"],
        )
        .await
    }
}

async fn run(program: &str, args: &[&str]) -> Result<(), ControllerError> {
    debug!(program, args = %args.join(" "), "running");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| ControllerError::Hypervisor(format!("{program} not available: {e}")))?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(ControllerError::Hypervisor(format!(
        "{program} {}: {stderr}",
        args.first().copied().unwrap_or_default()
    )))
}

/// Network label to bridge table shared by every machine of one match.
///
/// Bridges are created on first use of a label and all destroyed together
/// during teardown.
pub struct NetworkBridges {
    hypervisor: Arc<dyn Hypervisor>,
    inner: Mutex<Bridges>,
}

#[derive(Default)]
struct Bridges {
    by_label: BTreeMap<String, String>,
    next: u32,
}

impl NetworkBridges {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self {
            hypervisor,
            inner: Mutex::new(Bridges::default()),
        }
    }

    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    /// Bridge carrying network `label`, created if this is its first use.
    pub async fn bridge_for(&self, label: &str) -> Result<String, ControllerError> {
        let mut inner = self.inner.lock().await;
        if let Some(name) = inner.by_label.get(label) {
            return Ok(name.clone());
        }
        let name = format!("nlbr{}", inner.next);
        self.hypervisor.create_bridge(&name).await?;
        inner.next += 1;
        info!(label, bridge = %name, "network bridge created");
        inner.by_label.insert(label.to_string(), name.clone());
        Ok(name)
    }

    pub async fn bridges(&self) -> BTreeMap<String, String> {
        self.inner.lock().await.by_label.clone()
    }

    /// Destroy every bridge, continuing past failures.
    pub async fn cleanup(&self) {
        let bridges = std::mem::take(&mut self.inner.lock().await.by_label);
        for (label, name) in bridges {
            match self.hypervisor.destroy_bridge(&name).await {
                Ok(()) => info!(label = %label, bridge = %name, "network bridge destroyed"),
                Err(e) => warn!(label = %label, bridge = %name, error = %e, "failed to destroy bridge"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        calls: StdMutex<Vec<String>>,
        fail_destroy: bool,
    }

    #[async_trait]
    impl Hypervisor for Recorder {
        async fn create_bridge(&self, name: &str) -> Result<(), ControllerError> {
            self.calls.lock().unwrap().push(format!("create {name}"));
            Ok(())
        }

        async fn destroy_bridge(&self, name: &str) -> Result<(), ControllerError> {
            self.calls.lock().unwrap().push(format!("destroy {name}"));
            if self.fail_destroy {
                return Err(ControllerError::Hypervisor("busy".into()));
            }
            Ok(())
        }

        async fn attach_interface(
            &self,
            _domain: &str,
            _bridge: &str,
            _hwaddr: &HwAddr,
            _driver: Option<&str>,
        ) -> Result<(), ControllerError> {
            Ok(())
        }

        async fn detach_interface(&self, _domain: &str, _hwaddr: &HwAddr) -> Result<(), ControllerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn one_bridge_per_label() {
        let hv = Arc::new(Recorder::default());
        let bridges = NetworkBridges::new(hv.clone());
        let a = bridges.bridge_for("net1").await.unwrap();
        let b = bridges.bridge_for("net2").await.unwrap();
        assert_eq!(bridges.bridge_for("net1").await.unwrap(), a);
        assert_ne!(a, b);
        assert_eq!(*hv.calls.lock().unwrap(), vec!["create nlbr0", "create nlbr1"]);
    }

    #[tokio::test]
    async fn cleanup_attempts_every_bridge() {
        let hv = Arc::new(Recorder {
            fail_destroy: true,
            ..Default::default()
        });
        let bridges = NetworkBridges::new(hv.clone());
        bridges.bridge_for("net1").await.unwrap();
        bridges.bridge_for("net2").await.unwrap();
        bridges.cleanup().await;

        let calls = hv.calls.lock().unwrap();
        assert!(calls.contains(&"destroy nlbr0".to_string()));
        assert!(calls.contains(&"destroy nlbr1".to_string()));
        drop(calls);
        assert!(bridges.bridges().await.is_empty());
    }
}

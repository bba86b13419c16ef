//! Best-effort host queries used to enrich the registry.
//!
//! Neither query is needed for correctness, so both return an empty list
//! when the tool is missing or its output cannot be parsed.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use netlab_common::models::DevlinkPort;

#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Hardware-switch ports known to devlink.
    async fn devlink_ports(&self) -> Vec<DevlinkPort>;

    /// Interface names registered with the virtual switch.
    async fn vswitch_interfaces(&self) -> Vec<String>;
}

/// Queries `devlink` and `ovs-vsctl` on the local host.
#[derive(Debug, Default)]
pub struct HostTools;

#[async_trait]
impl HostProbe for HostTools {
    async fn devlink_ports(&self) -> Vec<DevlinkPort> {
        match tool_output("devlink", &["-j", "port", "show"]).await {
            Some(out) => parse_devlink_ports(&out),
            None => Vec::new(),
        }
    }

    async fn vswitch_interfaces(&self) -> Vec<String> {
        match tool_output("ovs-vsctl", &["--bare", "--columns=name", "list", "Interface"]).await {
            Some(out) => parse_vswitch_names(&out),
            None => Vec::new(),
        }
    }
}

async fn tool_output(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output().await {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            debug!(program, status = ?out.status.code(), "probe returned failure");
            None
        }
        Err(e) => {
            debug!(program, error = %e, "probe unavailable");
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct DevlinkPortShow {
    #[serde(default)]
    port: std::collections::BTreeMap<String, DevlinkPortEntry>,
}

#[derive(Debug, Deserialize)]
struct DevlinkPortEntry {
    #[serde(default)]
    netdev: Option<String>,
    #[serde(default)]
    flavour: Option<String>,
    #[serde(default)]
    port: Option<u32>,
}

/// Parse `devlink -j port show`. Port handles look like `pci/0000:03:00.0/1`.
pub fn parse_devlink_ports(json: &str) -> Vec<DevlinkPort> {
    let Ok(show) = serde_json::from_str::<DevlinkPortShow>(json) else {
        return Vec::new();
    };
    show.port
        .into_iter()
        .filter_map(|(handle, entry)| {
            let (dev, index) = handle.rsplit_once('/')?;
            let (bus_name, dev_name) = dev.split_once('/')?;
            Some(DevlinkPort {
                bus_name: bus_name.to_string(),
                dev_name: dev_name.to_string(),
                port_index: index.parse().ok()?,
                flavour: entry.flavour,
                netdev: entry.netdev,
                port_number: entry.port,
            })
        })
        .collect()
}

/// Parse `ovs-vsctl --bare --columns=name list Interface`.
pub fn parse_vswitch_names(out: &str) -> Vec<String> {
    out.lines()
        .map(|l| l.trim().trim_matches('"'))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fixed answers, for tests and simulated hosts.
#[derive(Debug, Default)]
pub struct StaticProbe {
    devlink: Mutex<Vec<DevlinkPort>>,
    vswitch: Mutex<Vec<String>>,
}

impl StaticProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_devlink_ports(&self, ports: Vec<DevlinkPort>) {
        *self.devlink.lock().unwrap_or_else(|e| e.into_inner()) = ports;
    }

    pub fn set_vswitch_interfaces(&self, names: Vec<String>) {
        *self.vswitch.lock().unwrap_or_else(|e| e.into_inner()) = names;
    }
}

#[async_trait]
impl HostProbe for StaticProbe {
    async fn devlink_ports(&self) -> Vec<DevlinkPort> {
        self.devlink.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn vswitch_interfaces(&self) -> Vec<String> {
        self.vswitch.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devlink_json_is_parsed() {
        let json = r#"{
            "port": {
                "pci/0000:03:00.0/1": {
                    "type": "eth", "netdev": "ens1f0", "flavour": "physical", "port": 0
                },
                "pci/0000:03:00.0/65535": {
                    "type": "eth", "flavour": "pcipf"
                }
            }
        }"#;
        let ports = parse_devlink_ports(json);
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].bus_name, "pci");
        assert_eq!(ports[0].dev_name, "0000:03:00.0");
        assert_eq!(ports[0].port_index, 1);
        assert_eq!(ports[0].netdev.as_deref(), Some("ens1f0"));
        assert_eq!(ports[0].port_number, Some(0));
        assert_eq!(ports[1].netdev, None);
    }

    #[test]
    fn garbage_yields_nothing() {
        assert!(parse_devlink_ports("not json").is_empty());
        assert!(parse_devlink_ports(r#"{"port":{"weird":{}}}"#).is_empty());
    }

    #[test]
    fn vswitch_names() {
        let out = "br-int\n\n\"veth3\"\nvxlan_sys_4789\n";
        assert_eq!(parse_vswitch_names(out), vec!["br-int", "veth3", "vxlan_sys_4789"]);
    }
}

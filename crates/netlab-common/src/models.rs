//! Data models shared between the agent (which observes the kernel) and the
//! controller (which receives subsets of them over the command channel).

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// ARP hardware type reported for the loopback device.
pub const ARPHRD_LOOPBACK: u16 = 772;

/// ARP hardware type reported for Ethernet devices.
pub const ARPHRD_ETHER: u16 = 1;

// ── Hardware address ────────────────────────────────────────────────

/// A link-layer address, normalized to upper-case colon-separated hex.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HwAddr(Vec<u8>);

impl HwAddr {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Interpret a 6-byte address as a big-endian integer (used by MAC pools).
    pub fn to_u64(&self) -> Option<u64> {
        if self.0.len() != 6 {
            return None;
        }
        Some(self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Build a 6-byte address from the low 48 bits of `value`.
    pub fn from_u64(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        Self(bytes[2..].to_vec())
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for b in &self.0 {
            if !first {
                f.write_str(":")?;
            }
            write!(f, "{b:02X}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for HwAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(HwAddr::default());
        }
        s.split([':', '-'])
            .map(|part| {
                u8::from_str_radix(part, 16).map_err(|_| format!("invalid hardware address: {s}"))
            })
            .collect::<Result<Vec<u8>, _>>()
            .map(HwAddr)
    }
}

impl Serialize for HwAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HwAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── IP address ──────────────────────────────────────────────────────

/// An IP address together with its prefix length, e.g. `192.168.1.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IpAddress {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IpAddress {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Self {
        Self { addr, prefix_len }
    }

    fn max_prefix(addr: &IpAddr) -> u8 {
        match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IpAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (s, None),
        };
        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| format!("invalid IP address: {s}"))?;
        let max = Self::max_prefix(&addr);
        let prefix_len = match prefix {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(|| format!("invalid prefix length: {s}"))?,
            None => max,
        };
        Ok(IpAddress { addr, prefix_len })
    }
}

impl Serialize for IpAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Link statistics / devlink ───────────────────────────────────────

/// Interface counters as reported by the kernel (64-bit statistics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

/// Hardware-switch port correlated to a netdev by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevlinkPort {
    pub bus_name: String,
    pub dev_name: String,
    pub port_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavour: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netdev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_number: Option<u32>,
}

// ── Link flags ──────────────────────────────────────────────────────

const IFF_NAMES: &[(u32, &str)] = &[
    (0x1, "up"),
    (0x2, "broadcast"),
    (0x4, "debug"),
    (0x8, "loopback"),
    (0x10, "pointopoint"),
    (0x20, "notrailers"),
    (0x40, "running"),
    (0x80, "noarp"),
    (0x100, "promisc"),
    (0x200, "allmulti"),
    (0x400, "master"),
    (0x800, "slave"),
    (0x1000, "multicast"),
    (0x2000, "portsel"),
    (0x4000, "automedia"),
    (0x8000, "dynamic"),
    (0x10000, "lower_up"),
    (0x20000, "dormant"),
    (0x40000, "echo"),
];

/// `IFF_UP`
pub const IFF_UP: u32 = 0x1;

/// Lower-case names of every `IFF_*` flag set in `flags`.
pub fn flag_names(flags: u32) -> Vec<String> {
    IFF_NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| (*name).to_string())
        .collect()
}

// ── Device snapshot ─────────────────────────────────────────────────

/// Queryable attribute snapshot of one registered device.
///
/// Sent with `dev_created` notifications and used for predicate lookups,
/// where a device matches when every queried key equals the corresponding
/// field of this structure's JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub if_index: u32,
    pub name: String,
    pub hwaddr: HwAddr,
    pub ip_addrs: Vec<IpAddress>,
    pub link_header_type: u16,
    pub state: Vec<String>,
    pub master: Option<u32>,
    pub mtu: u32,
    pub driver: Option<String>,
    pub devlink: Option<DevlinkPort>,
}

impl DeviceInfo {
    /// True when every key/value pair in `params` equals this snapshot's field.
    pub fn matches(&self, params: &BTreeMap<String, serde_json::Value>) -> bool {
        let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(self) else {
            return false;
        };
        params
            .iter()
            .all(|(key, value)| fields.get(key).is_some_and(|v| v == value))
    }
}

// ── Software links ──────────────────────────────────────────────────

/// Description of a software interface to create on a test machine.
///
/// When `name` is absent the agent allocates one from the kind's prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkSpec {
    Bond {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        mode: Option<String>,
    },
    Bridge {
        #[serde(default)]
        name: Option<String>,
    },
    Vlan {
        #[serde(default)]
        name: Option<String>,
        parent: u32,
        vlan_id: u16,
    },
    Vxlan {
        #[serde(default)]
        name: Option<String>,
        vni: u32,
        #[serde(default)]
        parent: Option<u32>,
        #[serde(default)]
        remote: Option<IpAddr>,
        #[serde(default)]
        group: Option<IpAddr>,
        #[serde(default)]
        dst_port: Option<u16>,
    },
    Team {
        #[serde(default)]
        name: Option<String>,
    },
    Veth {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        peer: Option<String>,
    },
}

impl LinkSpec {
    /// Kernel link kind (`ip link add ... type <kind>`).
    pub fn kind(&self) -> &'static str {
        match self {
            LinkSpec::Bond { .. } => "bond",
            LinkSpec::Bridge { .. } => "bridge",
            LinkSpec::Vlan { .. } => "vlan",
            LinkSpec::Vxlan { .. } => "vxlan",
            LinkSpec::Team { .. } => "team",
            LinkSpec::Veth { .. } => "veth",
        }
    }

    /// Prefix used when the agent has to allocate a name.
    pub fn name_prefix(&self) -> &'static str {
        match self {
            LinkSpec::Bond { .. } => "bond",
            LinkSpec::Bridge { .. } => "br",
            LinkSpec::Vlan { .. } => "vlan",
            LinkSpec::Vxlan { .. } => "vxlan",
            LinkSpec::Team { .. } => "team",
            LinkSpec::Veth { .. } => "veth",
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            LinkSpec::Bond { name, .. }
            | LinkSpec::Bridge { name }
            | LinkSpec::Vlan { name, .. }
            | LinkSpec::Vxlan { name, .. }
            | LinkSpec::Team { name }
            | LinkSpec::Veth { name, .. } => name.as_deref(),
        }
    }

    pub fn set_name(&mut self, new_name: String) {
        match self {
            LinkSpec::Bond { name, .. }
            | LinkSpec::Bridge { name }
            | LinkSpec::Vlan { name, .. }
            | LinkSpec::Vxlan { name, .. }
            | LinkSpec::Team { name }
            | LinkSpec::Veth { name, .. } => *name = Some(new_name),
        }
    }

    /// Whether other links can be enslaved to a link of this kind.
    pub fn is_controller_kind(kind: &str) -> bool {
        matches!(kind, "bond" | "bridge" | "team")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hwaddr_is_normalized() {
        let hw: HwAddr = "52:54:00:ab:cd:ef".parse().unwrap();
        assert_eq!(hw.to_string(), "52:54:00:AB:CD:EF");
        let dashed: HwAddr = "52-54-00-AB-CD-EF".parse().unwrap();
        assert_eq!(hw, dashed);
        assert!("52:54:zz".parse::<HwAddr>().is_err());
    }

    #[test]
    fn hwaddr_integer_conversion() {
        let hw: HwAddr = "52:54:01:00:00:ff".parse().unwrap();
        let n = hw.to_u64().unwrap();
        assert_eq!(HwAddr::from_u64(n + 1).to_string(), "52:54:01:00:01:00");
        assert!(HwAddr::new(vec![0u8; 4]).to_u64().is_none());
    }

    #[test]
    fn ip_address_parsing() {
        let a: IpAddress = "192.168.1.1/24".parse().unwrap();
        assert_eq!(a.prefix_len, 24);
        assert_eq!(a.to_string(), "192.168.1.1/24");

        let host: IpAddress = "fe80::1".parse().unwrap();
        assert_eq!(host.prefix_len, 128);

        assert!("10.0.0.1/33".parse::<IpAddress>().is_err());
        assert!("not-an-ip/8".parse::<IpAddress>().is_err());
    }

    #[test]
    fn flags_decode_to_names() {
        let names = flag_names(0x1 | 0x40 | 0x1000 | 0x10000);
        assert_eq!(names, vec!["up", "running", "multicast", "lower_up"]);
        assert!(flag_names(0).is_empty());
    }

    #[test]
    fn device_info_predicate_matching() {
        let info = DeviceInfo {
            if_index: 3,
            name: "eth1".into(),
            hwaddr: "52:54:00:00:00:01".parse().unwrap(),
            ip_addrs: vec![],
            link_header_type: ARPHRD_ETHER,
            state: vec!["up".into()],
            master: None,
            mtu: 1500,
            driver: Some("virtio_net".into()),
            devlink: None,
        };

        let mut params = BTreeMap::new();
        params.insert("driver".to_string(), serde_json::json!("virtio_net"));
        params.insert("mtu".to_string(), serde_json::json!(1500));
        assert!(info.matches(&params));

        params.insert("name".to_string(), serde_json::json!("eth2"));
        assert!(!info.matches(&params));

        let mut unknown = BTreeMap::new();
        unknown.insert("no_such_field".to_string(), serde_json::json!(1));
        assert!(!info.matches(&unknown));
    }

    #[test]
    fn link_spec_tagged_serialization() {
        let spec = LinkSpec::Vlan {
            name: None,
            parent: 4,
            vlan_id: 10,
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"vlan\""));
        let back: LinkSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
        assert_eq!(back.name_prefix(), "vlan");
    }
}

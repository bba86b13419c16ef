//! Recipe requirements, candidate matches and the mapper seam.
//!
//! The matching algorithm itself lives outside this crate. A [`Mapper`]
//! turns pools plus requirements into an ordered sequence of [`Match`]es;
//! [`FixedMapper`] replays a list read from a match file:
//!
//! ```toml
//! [requirements.hosts.m1.interfaces.eth0]
//! network = "net1"
//!
//! [[matches]]
//! pool_name = "lab"
//! virtual = false
//! [matches.machines.m1]
//! target = "box-a"
//! [matches.machines.m1.interfaces.eth0]
//! target = "nic1"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use netlab_common::models::HwAddr;

use crate::pool::Pool;

// ── Requirements ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub hosts: BTreeMap<String, HostRequirement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostRequirement {
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceRequirement>,
}

/// What a recipe asks of one interface. `driver` and `hwaddr` are used
/// as-is when the interface is created on a virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceRequirement {
    pub network: String,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub hwaddr: Option<HwAddr>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

// ── Matches ─────────────────────────────────────────────────────────

/// One candidate binding of logical hosts to pool machines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
    pub pool_name: String,
    pub machines: BTreeMap<String, MachineMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineMatch {
    pub target: String,
    #[serde(default)]
    pub interfaces: BTreeMap<String, InterfaceMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceMatch {
    pub target: String,
}

impl Match {
    /// One line per machine and interface, for the run log.
    pub fn describe(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (m_id, m) in &self.machines {
            lines.push(format!("host \"{m_id}\" uses \"{}\"", m.target));
            for (if_id, i) in &m.interfaces {
                lines.push(format!("  interface \"{if_id}\" matched to \"{}\"", i.target));
            }
        }
        lines
    }
}

pub type Matches<'a> = Box<dyn Iterator<Item = Match> + Send + 'a>;

pub trait Mapper: Send + Sync {
    /// Candidate matches in preference order. Each call starts over.
    fn matches<'a>(
        &'a self,
        pools: &'a BTreeMap<String, Pool>,
        requirements: &'a Requirements,
    ) -> Matches<'a>;
}

/// Yields a fixed list of matches, skipping those that do not cover exactly
/// the required hosts.
#[derive(Debug, Clone, Default)]
pub struct FixedMapper {
    matches: Vec<Match>,
}

impl FixedMapper {
    pub fn new(matches: Vec<Match>) -> Self {
        Self { matches }
    }
}

impl Mapper for FixedMapper {
    fn matches<'a>(
        &'a self,
        _pools: &'a BTreeMap<String, Pool>,
        requirements: &'a Requirements,
    ) -> Matches<'a> {
        Box::new(self.matches.iter().enumerate().filter_map(move |(i, m)| {
            let covers = m.machines.len() == requirements.hosts.len()
                && requirements.hosts.keys().all(|h| m.machines.contains_key(h));
            if !covers {
                warn!(match_index = i, "match does not cover the required hosts, skipping");
                return None;
            }
            Some(m.clone())
        }))
    }
}

/// Contents of a match file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchFile {
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub matches: Vec<Match>,
}

impl MatchFile {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        toml::from_str(input).map_err(|e| format!("Invalid match file TOML: {}", e))
    }
}

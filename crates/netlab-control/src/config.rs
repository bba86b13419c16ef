use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use netlab_common::models::HwAddr;

use crate::controller::RunMode;

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// First and last address handed out to virtual interfaces.
    pub mac_pool_range: (String, String),
    /// Pool name to pool directory.
    pub pools: BTreeMap<String, PathBuf>,
    /// Drop machines whose agent port does not accept connections.
    pub pool_checks: bool,
    pub run_mode: RunMode,
    pub connect_timeout_s: u64,
    /// How long to wait for a hot-plugged interface to show up on its machine.
    pub device_wait_timeout_s: u64,
    /// Per-request reply timeout on agent channels.
    pub call_timeout_s: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mac_pool_range: ("52:54:01:00:00:01".into(), "52:54:01:FF:FF:FF".into()),
            pools: BTreeMap::new(),
            pool_checks: true,
            run_mode: RunMode::FirstMatch,
            connect_timeout_s: 10,
            device_wait_timeout_s: 30,
            call_timeout_s: 120,
        }
    }
}

impl ControllerConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ControllerConfig::default());
        }
        let cfg: ControllerConfig =
            toml::from_str(input).map_err(|e| format!("Invalid controller config TOML: {}", e))?;
        cfg.mac_range()?;
        if cfg.connect_timeout_s == 0 || cfg.call_timeout_s == 0 {
            return Err("timeouts must be at least 1 second".into());
        }
        Ok(cfg)
    }

    /// Parsed MAC pool bounds.
    pub fn mac_range(&self) -> Result<(HwAddr, HwAddr), String> {
        let (first, last) = &self.mac_pool_range;
        let first: HwAddr = first
            .parse()
            .map_err(|e| format!("mac_pool_range start: {e}"))?;
        let last: HwAddr = last
            .parse()
            .map_err(|e| format!("mac_pool_range end: {e}"))?;
        Ok((first, last))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_s)
    }

    pub fn device_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.device_wait_timeout_s)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_s)
    }
}

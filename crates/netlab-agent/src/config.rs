use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Agent daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address the command server listens on.
    pub listen: String,
    /// Seconds between full reconciliation sweeps.
    pub rescan_interval_s: u64,
    /// Use the in-memory kernel instead of netlink.
    pub simulate: bool,
    /// Root under which system options are resolved.
    pub sysconfig_root: PathBuf,
    /// Shell used to run jobs (`<shell> -c <command>`).
    pub job_shell: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9999".into(),
            rescan_interval_s: 5,
            simulate: false,
            sysconfig_root: PathBuf::from("/"),
            job_shell: "/bin/sh".into(),
        }
    }
}

impl AgentConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(AgentConfig::default());
        }
        let cfg: AgentConfig =
            toml::from_str(input).map_err(|e| format!("Invalid agent config TOML: {}", e))?;
        if cfg.rescan_interval_s == 0 {
            return Err("rescan_interval_s must be at least 1".into());
        }
        Ok(cfg)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_gives_defaults() {
        assert_eq!(AgentConfig::from_toml_str("  \n").unwrap(), AgentConfig::default());
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let cfg = AgentConfig::from_toml_str(
            r#"
            listen = "127.0.0.1:7000"
            simulate = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:7000");
        assert!(cfg.simulate);
        assert_eq!(cfg.rescan_interval(), Duration::from_secs(5));
        assert_eq!(cfg.job_shell, "/bin/sh");
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(AgentConfig::from_toml_str("rescan_interval_s = 0").is_err());
        assert!(AgentConfig::from_toml_str("listen = 5").is_err());
    }
}

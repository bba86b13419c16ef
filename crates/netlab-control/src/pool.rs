//! Pool inventory and machine leasing.
//!
//! A pool is a directory holding one `<target>.toml` per machine:
//!
//! ```toml
//! hostname = "192.168.122.10"
//! port = 9999
//! libvirt_domain = "guest1"      # only for virtual machines
//!
//! [interfaces.nic1]
//! hwaddr = "52:54:00:12:34:56"
//! network = "net1"
//! driver = "virtio_net"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{info, warn};

use netlab_common::channel::Channel;
use netlab_common::models::HwAddr;

use crate::error::ControllerError;
use crate::machine::Machine;

pub const DEFAULT_AGENT_PORT: u16 = 9999;

fn default_port() -> u16 {
    DEFAULT_AGENT_PORT
}

/// One machine as described in its pool file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolEntry {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub libvirt_domain: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub interfaces: BTreeMap<String, PoolInterface>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolInterface {
    pub hwaddr: HwAddr,
    pub network: String,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

/// Target id to machine description.
pub type Pool = BTreeMap<String, PoolEntry>;

/// Read every `*.toml` in `dir`; the file stem is the target id.
pub fn load_pool_dir(dir: &Path) -> Result<Pool, ControllerError> {
    let read_err = |e: std::io::Error| {
        ControllerError::Config(format!("pool directory {}: {e}", dir.display()))
    };
    let mut pool = Pool::new();
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let path = entry.map_err(read_err)?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        let Some(target) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let text = std::fs::read_to_string(&path).map_err(read_err)?;
        let machine: PoolEntry = toml::from_str(&text)
            .map_err(|e| ControllerError::Config(format!("{}: {e}", path.display())))?;
        pool.insert(target.to_string(), machine);
    }
    Ok(pool)
}

/// Opens a command channel to a pool machine's agent.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, entry: &PoolEntry) -> Result<Arc<dyn Channel>, ControllerError>;
}

#[async_trait]
pub trait PoolManager: Send + Sync {
    /// Snapshot of every pool, for the mapper.
    fn pools(&self) -> BTreeMap<String, Pool>;

    /// Connect to a machine and reserve it. Fails if it is already leased.
    async fn lease(&self, pool: &str, target: &str) -> Result<Arc<Machine>, ControllerError>;

    /// Disconnect and return the machine to its pool.
    async fn release(&self, machine: &Machine);
}

/// Pools loaded from directories at startup.
pub struct StaticPoolManager {
    pools: BTreeMap<String, Pool>,
    connector: Arc<dyn Connector>,
    leased: Arc<Mutex<HashSet<(String, String)>>>,
}

impl StaticPoolManager {
    pub fn new(pools: BTreeMap<String, Pool>, connector: Arc<dyn Connector>) -> Self {
        Self {
            pools,
            connector,
            leased: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Load every pool directory. With `checks` on, machines whose agent port
    /// does not accept a TCP connection within `timeout` are left out.
    pub async fn load(
        dirs: &BTreeMap<String, std::path::PathBuf>,
        checks: bool,
        timeout: Duration,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ControllerError> {
        let mut pools = BTreeMap::new();
        for (name, dir) in dirs {
            let mut pool = load_pool_dir(dir)?;
            if checks {
                let mut online = Pool::new();
                for (target, entry) in pool {
                    if is_online(&entry, timeout).await {
                        online.insert(target, entry);
                    } else {
                        warn!(pool = %name, machine = %target, host = %entry.hostname, "machine offline, skipping");
                    }
                }
                pool = online;
            }
            info!(pool = %name, machines = pool.len(), "pool loaded");
            pools.insert(name.clone(), pool);
        }
        Ok(Self::new(pools, connector))
    }

    pub fn is_leased(&self, pool: &str, target: &str) -> bool {
        self.leased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(pool.to_string(), target.to_string()))
    }
}

async fn is_online(entry: &PoolEntry, timeout: Duration) -> bool {
    let addr = format!("{}:{}", entry.hostname, entry.port);
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(&addr)).await,
        Ok(Ok(_))
    )
}

/// Holds a lease slot until defused; dropping it early frees the slot.
struct Reservation {
    leased: Arc<Mutex<HashSet<(String, String)>>>,
    key: Option<(String, String)>,
}

impl Reservation {
    fn keep(mut self) {
        self.key = None;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.leased
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&key);
        }
    }
}

#[async_trait]
impl PoolManager for StaticPoolManager {
    fn pools(&self) -> BTreeMap<String, Pool> {
        self.pools.clone()
    }

    async fn lease(&self, pool: &str, target: &str) -> Result<Arc<Machine>, ControllerError> {
        let entry = self
            .pools
            .get(pool)
            .ok_or_else(|| ControllerError::UnknownPool(pool.to_string()))?
            .get(target)
            .ok_or_else(|| ControllerError::UnknownTarget {
                pool: pool.to_string(),
                target: target.to_string(),
            })?;

        let key = (pool.to_string(), target.to_string());
        {
            let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
            if !leased.insert(key.clone()) {
                return Err(ControllerError::AlreadyLeased {
                    pool: pool.to_string(),
                    target: target.to_string(),
                });
            }
        }
        let reservation = Reservation {
            leased: self.leased.clone(),
            key: Some(key),
        };

        let channel = self.connector.connect(entry).await?;
        let machine = match Machine::connect(pool, target, entry.clone(), channel.clone()).await {
            Ok(machine) => machine,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };
        reservation.keep();
        info!(pool, machine = target, host = %entry.hostname, "machine leased");
        Ok(machine)
    }

    async fn release(&self, machine: &Machine) {
        machine.close().await;
        self.leased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(machine.pool().to_string(), machine.target().to_string()));
        info!(pool = machine.pool(), machine = machine.target(), "machine released");
    }
}

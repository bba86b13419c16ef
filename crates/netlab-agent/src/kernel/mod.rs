//! Kernel network-interface access.
//!
//! The [`Kernel`] trait is the only way the registry and devices touch the
//! kernel: full enumeration, the (lossy) event subscription, and the
//! configuration calls. [`NetlinkKernel`] talks to the real kernel;
//! [`SimKernel`] is an in-memory stand-in used by tests and `--simulate`.

pub mod netlink;
pub mod sim;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use netlab_common::error::DeviceError;
use netlab_common::models::{HwAddr, IpAddress, LinkSpec, LinkStats};

pub use netlink::NetlinkKernel;
pub use sim::SimKernel;

/// Everything the kernel reports about one link at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub index: u32,
    pub name: String,
    pub hwaddr: HwAddr,
    pub mtu: u32,
    /// ARP hardware type (`ARPHRD_*`).
    pub link_type: u16,
    /// `IFF_*` bits.
    pub flags: u32,
    pub master: Option<u32>,
    /// Link kind for software devices (`bond`, `veth`, ...).
    pub kind: Option<String>,
    pub driver: Option<String>,
    pub stats: LinkStats,
}

/// One link from a full enumeration, together with its current addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedLink {
    pub link: LinkSnapshot,
    pub addrs: Vec<IpAddress>,
}

/// A single notification from the kernel event feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    NewLink(LinkSnapshot),
    DelLink { index: u32 },
    NewAddr { index: u32, addr: IpAddress },
    DelAddr { index: u32, addr: IpAddress },
}

impl KernelEvent {
    pub fn index(&self) -> u32 {
        match self {
            KernelEvent::NewLink(link) => link.index,
            KernelEvent::DelLink { index }
            | KernelEvent::NewAddr { index, .. }
            | KernelEvent::DelAddr { index, .. } => *index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// The kernel refused the value (bad MTU, bad master, ...).
    #[error("{0}")]
    InvalidValue(String),
    #[error("no such link: {0}")]
    NoSuchLink(String),
    #[error("kernel request failed: {0}")]
    Request(String),
}

impl From<KernelError> for DeviceError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::InvalidValue(m) => DeviceError::InvalidValue(m),
            KernelError::NoSuchLink(_) => DeviceError::NotFound,
            KernelError::Request(m) => DeviceError::Config(m),
        }
    }
}

/// Kernel network configuration and observation.
#[async_trait]
pub trait Kernel: Send + Sync {
    /// Enumerate every link in the namespace with its addresses.
    async fn enumerate(&self) -> Result<Vec<EnumeratedLink>, KernelError>;

    /// Open a new subscription to link and address events.
    ///
    /// Delivery may be incomplete and is unordered relative to a concurrent
    /// [`Kernel::enumerate`].
    fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<KernelEvent>, KernelError>;

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<(), KernelError>;

    /// Enslave `index` to `master`, or release it when `master` is `None`.
    async fn set_master(&self, index: u32, master: Option<u32>) -> Result<(), KernelError>;

    async fn add_address(&self, index: u32, addr: &IpAddress) -> Result<(), KernelError>;

    async fn del_address(&self, index: u32, addr: &IpAddress) -> Result<(), KernelError>;

    async fn set_link_up(&self, index: u32, up: bool) -> Result<(), KernelError>;

    /// Force a link speed (Mb/s); disables autonegotiation.
    async fn set_speed(&self, name: &str, speed: u32) -> Result<(), KernelError>;

    async fn set_autoneg(&self, name: &str, enabled: bool) -> Result<(), KernelError>;

    /// Create a software link. `spec` must carry a name.
    async fn create_link(&self, spec: &LinkSpec) -> Result<(), KernelError>;

    async fn delete_link(&self, index: u32) -> Result<(), KernelError>;
}

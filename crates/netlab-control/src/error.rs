use thiserror::Error;

use netlab_common::error::{DeviceError, RemoteError};

/// Failures while talking to machines, pools or the hypervisor.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("pool {0} does not exist")]
    UnknownPool(String),

    #[error("machine {target} is not in pool {pool}")]
    UnknownTarget { pool: String, target: String },

    #[error("machine {target} in pool {pool} is already leased")]
    AlreadyLeased { pool: String, target: String },

    #[error("interface {interface} of machine {machine} cannot be bound: {reason}")]
    Unbindable {
        machine: String,
        interface: String,
        reason: String,
    },

    #[error("unable to connect to {addr}: {reason}")]
    Connect { addr: String, reason: String },

    #[error("machine {machine}: {source}")]
    Remote {
        machine: String,
        #[source]
        source: RemoteError,
    },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("MAC address pool exhausted")]
    MacPoolExhausted,

    #[error("hypervisor: {0}")]
    Hypervisor(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl ControllerError {
    pub fn remote(machine: &str, source: RemoteError) -> Self {
        ControllerError::Remote {
            machine: machine.to_string(),
            source,
        }
    }
}

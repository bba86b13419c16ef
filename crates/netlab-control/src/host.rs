//! The topology handed to a recipe: logical hosts and their interfaces.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::device::RemoteDevice;
use crate::machine::Machine;

/// A leased machine seen under its logical id, with its interfaces bound.
pub struct Host {
    machine: Arc<Machine>,
    interfaces: BTreeMap<String, Arc<RemoteDevice>>,
}

impl Host {
    pub fn new(machine: Arc<Machine>) -> Self {
        Self {
            machine,
            interfaces: BTreeMap::new(),
        }
    }

    pub fn machine(&self) -> &Arc<Machine> {
        &self.machine
    }

    /// Bind logical interface `if_id`, replacing any earlier binding.
    pub fn map_device(&mut self, if_id: &str, dev: Arc<RemoteDevice>) {
        self.interfaces.insert(if_id.to_string(), dev);
    }

    pub fn iface(&self, if_id: &str) -> Option<&Arc<RemoteDevice>> {
        self.interfaces.get(if_id)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = (&str, &Arc<RemoteDevice>)> {
        self.interfaces.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[derive(Default)]
pub struct Hosts {
    hosts: BTreeMap<String, Host>,
}

impl Hosts {
    pub fn insert(&mut self, id: &str, host: Host) {
        self.hosts.insert(id.to_string(), host);
    }

    pub fn get(&self, id: &str) -> Option<&Host> {
        self.hosts.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Host)> {
        self.hosts.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

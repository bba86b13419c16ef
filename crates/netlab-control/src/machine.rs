//! Controller handle to one leased machine.
//!
//! A [`Machine`] owns the command channel to the machine's agent and a local
//! device database kept in step with the agent's `dev_created` and
//! `dev_deleted` events. There is exactly one [`RemoteDevice`] per kernel
//! index; when the agent reports an index gone its proxy is tombstoned so
//! stale handles held by test code fail instead of hitting a reused index.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use netlab_common::channel::{Channel, call_as};
use netlab_common::error::{DeviceError, RemoteError, RemoteErrorKind};
use netlab_common::models::{DeviceInfo, HwAddr, LinkSpec};
use netlab_common::protocol::{AgentEvent, HelloPayload, JobResult, JobSignal, JobSpec, Request};

use crate::device::RemoteDevice;
use crate::error::ControllerError;
use crate::hypervisor::NetworkBridges;
use crate::macpool::MacPool;
use crate::pool::PoolEntry;

/// Index-keyed device proxies of one machine.
struct DeviceDb {
    channel: Arc<dyn Channel>,
    devices: Mutex<BTreeMap<u32, Arc<RemoteDevice>>>,
}

impl DeviceDb {
    fn entry(&self, if_index: u32) -> Arc<RemoteDevice> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(if_index)
            .or_insert_with(|| Arc::new(RemoteDevice::new(if_index, self.channel.clone())))
            .clone()
    }

    fn remove(&self, if_index: u32) {
        let removed = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&if_index);
        if let Some(dev) = removed {
            dev.tombstone();
        }
    }

    /// Make the database hold exactly `indices`.
    fn sync(&self, indices: &[u32]) -> Vec<Arc<RemoteDevice>> {
        let stale: Vec<u32> = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|i| !indices.contains(i))
            .copied()
            .collect();
        for index in stale {
            self.remove(index);
        }
        indices.iter().map(|i| self.entry(*i)).collect()
    }

    fn clear(&self) {
        let all = std::mem::take(&mut *self.devices.lock().unwrap_or_else(|e| e.into_inner()));
        for dev in all.values() {
            dev.tombstone();
        }
    }

    fn apply(&self, event: &AgentEvent) {
        match event {
            AgentEvent::DevCreated { info } => {
                debug!(if_index = info.if_index, name = %info.name, "remote device created");
                self.entry(info.if_index);
            }
            AgentEvent::DevDeleted { if_index } => {
                debug!(if_index, "remote device deleted");
                self.remove(*if_index);
            }
            AgentEvent::JobFinished { id, result } => {
                debug!(job = id, passed = result.passed, "job finished");
            }
        }
    }
}

/// Interface hot-plugged into this machine's domain for a virtual match.
#[derive(Debug, Clone)]
struct VirtualInterface {
    hwaddr: HwAddr,
    network: String,
}

#[derive(Default)]
struct Assignment {
    id: String,
    mac_pool: Option<Arc<MacPool>>,
    bridges: Option<Arc<NetworkBridges>>,
}

pub struct Machine {
    pool: String,
    target: String,
    entry: PoolEntry,
    hello: HelloPayload,
    channel: Arc<dyn Channel>,
    db: Arc<DeviceDb>,
    assignment: Mutex<Assignment>,
    virtual_ifaces: tokio::sync::Mutex<Vec<VirtualInterface>>,
    event_task: JoinHandle<()>,
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.event_task.abort();
    }
}

impl Machine {
    /// Greet the agent and start following its device events.
    pub async fn connect(
        pool: &str,
        target: &str,
        entry: PoolEntry,
        channel: Arc<dyn Channel>,
    ) -> Result<Arc<Self>, ControllerError> {
        let events = channel.subscribe();
        let hello: HelloPayload = call_as(channel.as_ref(), Request::Hello)
            .await
            .map_err(|e| ControllerError::remote(target, e))?;
        info!(
            machine = target,
            host = %entry.hostname,
            version = %hello.version,
            kernel = hello.kernel_release.as_deref().unwrap_or("unknown"),
            "agent handshake complete"
        );

        let db = Arc::new(DeviceDb {
            channel: channel.clone(),
            devices: Mutex::new(BTreeMap::new()),
        });
        let event_task = tokio::spawn(follow_events(events, db.clone(), target.to_string()));

        Ok(Arc::new(Self {
            pool: pool.to_string(),
            target: target.to_string(),
            entry,
            hello,
            channel,
            db,
            assignment: Mutex::new(Assignment {
                id: target.to_string(),
                ..Default::default()
            }),
            virtual_ifaces: tokio::sync::Mutex::new(Vec::new()),
            event_task,
        }))
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn hostname(&self) -> &str {
        &self.entry.hostname
    }

    pub fn entry(&self) -> &PoolEntry {
        &self.entry
    }

    pub fn hello(&self) -> &HelloPayload {
        &self.hello
    }

    pub fn libvirt_domain(&self) -> Option<&str> {
        self.entry.libvirt_domain.as_deref()
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Logical id of this machine within the current match.
    pub fn id(&self) -> String {
        self.assignment().id.clone()
    }

    pub fn set_id(&self, id: &str) {
        self.assignment().id = id.to_string();
    }

    pub fn set_mac_pool(&self, pool: Arc<MacPool>) {
        self.assignment().mac_pool = Some(pool);
    }

    pub fn set_network_bridges(&self, bridges: Arc<NetworkBridges>) {
        self.assignment().bridges = Some(bridges);
    }

    fn assignment(&self) -> std::sync::MutexGuard<'_, Assignment> {
        self.assignment.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn call(&self, request: Request) -> Result<serde_json::Value, ControllerError> {
        self.channel
            .call(request)
            .await
            .map_err(|e| ControllerError::remote(&self.id(), e))
    }

    async fn call_as<T: serde::de::DeserializeOwned>(
        &self,
        request: Request,
    ) -> Result<T, ControllerError> {
        call_as(self.channel.as_ref(), request)
            .await
            .map_err(|e| ControllerError::remote(&self.id(), e))
    }

    async fn device_from(&self, request: Request) -> Result<Arc<RemoteDevice>, ControllerError> {
        let info: DeviceInfo = self.call_as(request).await?;
        Ok(self.db.entry(info.if_index))
    }

    // ── Recipe lifecycle ─────────────────────────────────────────────

    /// Reserve the machine for `recipe` and load its device database.
    pub async fn set_recipe(&self, recipe: &str) -> Result<(), ControllerError> {
        self.call(Request::SetRecipe {
            name: recipe.to_string(),
        })
        .await?;
        let devices = self.devices().await?;
        info!(machine = %self.id(), recipe, devices = devices.len(), "machine prepared");
        Ok(())
    }

    pub async fn restore_system_config(&self) -> Result<(), ControllerError> {
        self.call(Request::RestoreSystemConfig).await?;
        Ok(())
    }

    pub async fn set_system_option(
        &self,
        path: &str,
        value: &str,
        persistent: bool,
    ) -> Result<(), ControllerError> {
        self.call(Request::SetSystemOption {
            path: path.to_string(),
            value: value.to_string(),
            persistent,
        })
        .await?;
        Ok(())
    }

    /// Return the machine to a clean state: stop jobs, restore system
    /// configuration, destroy created devices, unplug virtual interfaces and
    /// say goodbye. Every step runs; the first failure is returned.
    pub async fn cleanup(&self) -> Result<(), ControllerError> {
        let id = self.id();
        let mut first_err = None;
        let mut note = |step: &str, result: Result<(), ControllerError>| {
            if let Err(e) = result {
                warn!(machine = %id, step, error = %e, "cleanup step failed");
                first_err.get_or_insert(e);
            }
        };

        note("kill jobs", self.call(Request::KillJobs).await.map(drop));
        note("restore system config", self.restore_system_config().await);
        note("destroy devices", self.call(Request::DestroyDevices).await.map(drop));
        note("detach virtual interfaces", self.detach_virtual_interfaces().await);
        self.db.clear();
        note("bye", self.call(Request::Bye).await.map(drop));

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Every device on the machine; the local database is resynchronised.
    pub async fn devices(&self) -> Result<Vec<Arc<RemoteDevice>>, ControllerError> {
        let infos: Vec<DeviceInfo> = self.call_as(Request::GetDevices).await?;
        let indices: Vec<u32> = infos.iter().map(|i| i.if_index).collect();
        Ok(self.db.sync(&indices))
    }

    /// Device already known locally, without asking the agent.
    pub fn cached_device(&self, if_index: u32) -> Option<Arc<RemoteDevice>> {
        self.db
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&if_index)
            .cloned()
    }

    pub async fn device(&self, if_index: u32) -> Result<Arc<RemoteDevice>, ControllerError> {
        match self.device_from(Request::GetDevice { if_index }).await {
            Err(ControllerError::Remote { source, .. }) if is_not_found(&source) => {
                self.db.remove(if_index);
                Err(DeviceError::NotFound.into())
            }
            other => other,
        }
    }

    pub async fn device_by_name(&self, name: &str) -> Result<Arc<RemoteDevice>, ControllerError> {
        self.device_from(Request::GetDeviceByName {
            name: name.to_string(),
        })
        .await
    }

    pub async fn device_by_hwaddr(&self, hwaddr: &HwAddr) -> Result<Arc<RemoteDevice>, ControllerError> {
        self.device_from(Request::GetDeviceByHwaddr {
            hwaddr: hwaddr.clone(),
        })
        .await
    }

    /// First device whose snapshot matches every key/value in `params`.
    pub async fn device_by_params(
        &self,
        params: BTreeMap<String, serde_json::Value>,
    ) -> Result<Arc<RemoteDevice>, ControllerError> {
        self.device_from(Request::GetDevicesByParams { params }).await
    }

    pub async fn create_device(&self, spec: LinkSpec) -> Result<Arc<RemoteDevice>, ControllerError> {
        let kind = spec.kind();
        let dev = self.device_from(Request::CreateDevice { spec }).await?;
        info!(machine = %self.id(), kind, if_index = dev.if_index(), "device created");
        Ok(dev)
    }

    pub async fn assign_name(&self, prefix: &str) -> Result<String, ControllerError> {
        self.call_as(Request::AssignName {
            prefix: prefix.to_string(),
        })
        .await
    }

    // ── Virtual interfaces ───────────────────────────────────────────

    /// Hot-plug a new interface on network `label` into this machine's
    /// domain and wait for the agent to report it. Without `hwaddr` an
    /// address is taken from the shared MAC pool.
    pub async fn add_virtual_interface(
        &self,
        label: &str,
        driver: Option<&str>,
        hwaddr: Option<HwAddr>,
        wait: Duration,
    ) -> Result<Arc<RemoteDevice>, ControllerError> {
        let Some(domain) = self.libvirt_domain() else {
            return Err(ControllerError::Config(format!(
                "machine {} is not virtual",
                self.id()
            )));
        };
        let (mac_pool, bridges) = {
            let a = self.assignment();
            (a.mac_pool.clone(), a.bridges.clone())
        };
        let bridges = bridges.ok_or_else(|| {
            ControllerError::Config(format!("machine {} has no network bridges", self.id()))
        })?;
        let hwaddr = match hwaddr {
            Some(hwaddr) => hwaddr,
            None => mac_pool
                .ok_or_else(|| {
                    ControllerError::Config(format!("machine {} has no MAC pool", self.id()))
                })?
                .alloc()?,
        };

        let bridge = bridges.bridge_for(label).await?;
        // Subscribe before plugging so the creation event cannot be missed.
        let events = self.channel.subscribe();
        bridges
            .hypervisor()
            .attach_interface(domain, &bridge, &hwaddr, driver)
            .await?;
        self.virtual_ifaces.lock().await.push(VirtualInterface {
            hwaddr: hwaddr.clone(),
            network: label.to_string(),
        });
        info!(machine = %self.id(), network = label, hwaddr = %hwaddr, bridge = %bridge, "virtual interface attached");

        self.wait_for_hwaddr(&hwaddr, events, wait).await
    }

    async fn wait_for_hwaddr(
        &self,
        hwaddr: &HwAddr,
        mut events: broadcast::Receiver<AgentEvent>,
        wait: Duration,
    ) -> Result<Arc<RemoteDevice>, ControllerError> {
        let search = async {
            loop {
                match self.device_by_hwaddr(hwaddr).await {
                    Ok(dev) => return Ok(dev),
                    Err(ControllerError::Remote { ref source, .. }) if is_not_found(source) => {}
                    Err(e) => return Err(e),
                }
                loop {
                    match events.recv().await {
                        Ok(AgentEvent::DevCreated { info }) if info.hwaddr == *hwaddr => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(ControllerError::remote(
                                &self.id(),
                                RemoteError::transport("agent disconnected"),
                            ));
                        }
                    }
                }
            }
        };
        tokio::time::timeout(wait, search).await.map_err(|_| {
            ControllerError::Timeout(format!("device {hwaddr} on machine {}", self.id()))
        })?
    }

    async fn detach_virtual_interfaces(&self) -> Result<(), ControllerError> {
        let ifaces = std::mem::take(&mut *self.virtual_ifaces.lock().await);
        if ifaces.is_empty() {
            return Ok(());
        }
        let Some(domain) = self.libvirt_domain() else {
            return Ok(());
        };
        let Some(bridges) = self.assignment().bridges.clone() else {
            return Ok(());
        };
        let mut first_err = None;
        for iface in ifaces {
            match bridges
                .hypervisor()
                .detach_interface(domain, &iface.hwaddr)
                .await
            {
                Ok(()) => info!(machine = %self.id(), network = %iface.network, hwaddr = %iface.hwaddr, "virtual interface detached"),
                Err(e) => {
                    warn!(machine = %self.id(), hwaddr = %iface.hwaddr, error = %e, "failed to detach interface");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ── Jobs ─────────────────────────────────────────────────────────

    /// Run `command` to completion.
    pub async fn run(&self, command: &str) -> Result<JobResult, ControllerError> {
        info!(machine = %self.id(), command, "running job");
        self.call_as(Request::RunJob {
            job: JobSpec {
                command: command.to_string(),
                background: false,
            },
        })
        .await
    }

    /// Start `command` in the background and return its job id.
    pub async fn start_job(&self, command: &str) -> Result<u64, ControllerError> {
        info!(machine = %self.id(), command, "starting background job");
        self.call_as(Request::RunJob {
            job: JobSpec {
                command: command.to_string(),
                background: true,
            },
        })
        .await
    }

    pub async fn wait_job(&self, id: u64, timeout: Option<Duration>) -> Result<JobResult, ControllerError> {
        self.call_as(Request::WaitJob {
            id,
            timeout_ms: timeout.map(|t| t.as_millis() as u64),
        })
        .await
    }

    pub async fn kill_job(&self, id: u64, signal: JobSignal) -> Result<(), ControllerError> {
        self.call(Request::KillJob { id, signal }).await?;
        Ok(())
    }
}

fn is_not_found(err: &RemoteError) -> bool {
    err.kind == RemoteErrorKind::NotFound
}

async fn follow_events(mut events: broadcast::Receiver<AgentEvent>, db: Arc<DeviceDb>, target: String) {
    loop {
        match events.recv().await {
            Ok(event) => db.apply(&event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(machine = %target, skipped = n, "device events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

//! Command dispatch: turns each [`Request`] into registry, device, job and
//! system-config operations and packs the outcome into a [`Reply`].

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use netlab_common::error::{RemoteError, RemoteErrorKind};
use netlab_common::protocol::{AgentEvent, DeviceAttr, DeviceCall, HelloPayload, Reply, Request};

use crate::device::Device;
use crate::jobs::{JobError, JobManager};
use crate::registry::{DeviceRegistry, RegistryEvent};
use crate::sysconfig::{SysconfigError, SystemConfig};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything a controller can drive on this machine.
pub struct Agent {
    hostname: String,
    registry: Arc<DeviceRegistry>,
    jobs: Arc<JobManager>,
    sysconfig: SystemConfig,
    recipe: Mutex<Option<String>>,
    /// Device disabled because it carries the controller connection.
    control_device: Mutex<Option<Arc<Device>>>,
    events: broadcast::Sender<AgentEvent>,
}

impl Agent {
    /// Build the agent and start forwarding registry and job notifications
    /// as [`AgentEvent`]s. Must be called inside a tokio runtime.
    pub fn new(
        hostname: impl Into<String>,
        registry: Arc<DeviceRegistry>,
        jobs: Arc<JobManager>,
        sysconfig: SystemConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        spawn_forwarder(registry.subscribe(), jobs.subscribe(), events.clone());
        Arc::new(Self {
            hostname: hostname.into(),
            registry,
            jobs,
            sysconfig,
            recipe: Mutex::new(None),
            control_device: Mutex::new(None),
            events,
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    pub async fn recipe(&self) -> Option<String> {
        self.recipe.lock().await.clone()
    }

    /// Disable the device holding `local` (the agent's end of the controller
    /// connection) and re-enable whichever device was protected before.
    pub async fn set_control_address(&self, local: Option<IpAddr>) {
        let mut current = self.control_device.lock().await;
        let next = match local {
            Some(addr) => self.registry.devices().await.ok().and_then(|devs| {
                devs.into_iter().find(|d| {
                    d.ips()
                        .map(|ips| ips.iter().any(|ip| ip.addr == addr))
                        .unwrap_or(false)
                })
            }),
            None => None,
        };

        if let Some(prev) = current.take()
            && next.as_ref().is_none_or(|n| !Arc::ptr_eq(n, &prev))
        {
            let _ = prev.enable();
        }
        if let Some(dev) = &next
            && dev.disable().is_ok()
        {
            info!(if_index = dev.if_index(), "control device disabled");
        }
        *current = next;
    }

    pub async fn handle(&self, request: Request) -> Reply {
        let method = request.method();
        debug!(method = %method, kind = ?request.kind(), "handling request");
        match self.dispatch(request).await {
            Ok(result) => Reply {
                passed: true,
                result,
                error: None,
            },
            Err(e) => {
                debug!(method = %method, error = %e, "request failed");
                Reply::err(e)
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Result<Value, RemoteError> {
        let reg = &self.registry;
        match request {
            Request::Hello => to_value(HelloPayload {
                version: env!("CARGO_PKG_VERSION").to_string(),
                hostname: self.hostname.clone(),
                kernel_release: std::fs::read_to_string("/proc/sys/kernel/osrelease")
                    .ok()
                    .map(|s| s.trim().to_string()),
            }),
            Request::SetRecipe { name } => {
                info!(recipe = %name, "recipe started");
                *self.recipe.lock().await = Some(name);
                Ok(Value::Null)
            }
            Request::GetDevices => {
                let infos = reg
                    .devices()
                    .await?
                    .iter()
                    .filter_map(|d| d.info().ok())
                    .collect::<Vec<_>>();
                to_value(infos)
            }
            Request::GetDevice { if_index } => to_value(reg.get(if_index).await?.info()?),
            Request::GetDeviceByName { name } => to_value(reg.by_name(&name).await?.info()?),
            Request::GetDeviceByHwaddr { hwaddr } => {
                to_value(reg.by_hwaddr(&hwaddr).await?.info()?)
            }
            Request::GetDevicesByParams { params } => {
                to_value(reg.by_params(&params).await?.info()?)
            }
            Request::DevAttr { if_index, attr } => {
                let dev = reg
                    .get(if_index)
                    .await
                    .map_err(|e| RemoteError::from(e).for_device(if_index))?;
                device_attr(&dev, attr)
            }
            Request::DevMethod { if_index, call } => {
                let dev = reg
                    .get(if_index)
                    .await
                    .map_err(|e| RemoteError::from(e).for_device(if_index))?;
                device_call(&dev, call).await?;
                Ok(Value::Null)
            }
            Request::CreateDevice { spec } => to_value(reg.create_device(spec).await?.info()?),
            Request::DestroyDevices => {
                reg.destroy_devices().await?;
                Ok(Value::Null)
            }
            Request::AssignName { prefix } => to_value(reg.assign_name(&prefix).await?),
            Request::AssignNamePair { prefix } => to_value(reg.assign_name_pair(&prefix).await?),
            Request::SetSystemOption {
                path,
                value,
                persistent,
            } => {
                self.sysconfig
                    .set_option(&path, &value, persistent)
                    .await
                    .map_err(sysconfig_error)?;
                Ok(Value::Null)
            }
            Request::RestoreSystemConfig => {
                self.sysconfig.restore().await;
                Ok(Value::Null)
            }
            Request::RunJob { job } => {
                if job.background {
                    to_value(self.jobs.start(&job).await.map_err(job_error)?)
                } else {
                    to_value(self.jobs.run(&job).await.map_err(job_error)?)
                }
            }
            Request::WaitJob { id, timeout_ms } => {
                let timeout = timeout_ms.map(Duration::from_millis);
                to_value(self.jobs.wait(id, timeout).await.map_err(job_error)?)
            }
            Request::KillJob { id, signal } => {
                self.jobs.kill(id, signal).await.map_err(job_error)?;
                Ok(Value::Null)
            }
            Request::KillJobs => {
                self.jobs.kill_all().await;
                Ok(Value::Null)
            }
            Request::Bye => {
                self.jobs.kill_all().await;
                if let Some(recipe) = self.recipe.lock().await.take() {
                    info!(recipe = %recipe, "recipe finished");
                }
                Ok(Value::Null)
            }
        }
    }
}

fn to_value(v: impl serde::Serialize) -> Result<Value, RemoteError> {
    serde_json::to_value(v).map_err(|e| RemoteError::other(format!("result serialization: {e}")))
}

fn job_error(e: JobError) -> RemoteError {
    RemoteError::new(RemoteErrorKind::Job, e.to_string())
}

fn sysconfig_error(e: SysconfigError) -> RemoteError {
    RemoteError::new(RemoteErrorKind::Config, e.to_string())
}

fn device_attr(dev: &Device, attr: DeviceAttr) -> Result<Value, RemoteError> {
    match attr {
        DeviceAttr::Name => to_value(dev.name()?),
        DeviceAttr::Hwaddr => to_value(dev.hwaddr()?),
        DeviceAttr::Mtu => to_value(dev.mtu()?),
        DeviceAttr::State => to_value(dev.state()?),
        DeviceAttr::Ips => to_value(dev.ips()?),
        DeviceAttr::Master => to_value(dev.master()?),
        DeviceAttr::Driver => to_value(dev.driver()?),
        DeviceAttr::LinkHeaderType => to_value(dev.link_header_type()?),
        DeviceAttr::LinkStats => to_value(dev.link_stats()?),
        DeviceAttr::Devlink => to_value(dev.devlink()?),
        DeviceAttr::Info => to_value(dev.info()?),
    }
}

async fn device_call(dev: &Device, call: DeviceCall) -> Result<(), RemoteError> {
    let result = match call {
        DeviceCall::SetMtu { mtu } => dev.set_mtu(mtu).await,
        DeviceCall::SetMaster { master } => dev.set_master(master).await,
        DeviceCall::IpAdd { addr } => dev.ip_add(addr).await,
        DeviceCall::IpDel { addr } => dev.ip_del(addr).await,
        DeviceCall::IpFlush => dev.ip_flush().await,
        DeviceCall::Up => dev.up().await,
        DeviceCall::Down => dev.down().await,
        DeviceCall::SpeedSet { speed } => dev.speed_set(speed).await,
        DeviceCall::AutonegOn => dev.autoneg_on().await,
        DeviceCall::AutonegOff => dev.autoneg_off().await,
        DeviceCall::Cleanup => dev.cleanup().await,
        DeviceCall::Enable => dev.enable(),
        DeviceCall::Disable => dev.disable(),
    };
    Ok(result?)
}

fn spawn_forwarder(
    mut registry: broadcast::Receiver<RegistryEvent>,
    mut jobs: broadcast::Receiver<(u64, netlab_common::protocol::JobResult)>,
    events: broadcast::Sender<AgentEvent>,
) {
    use broadcast::error::RecvError;

    tokio::spawn(async move {
        let mut registry_open = true;
        let mut jobs_open = true;
        while registry_open || jobs_open {
            let event = tokio::select! {
                ev = registry.recv(), if registry_open => match ev {
                    Ok(RegistryEvent::Created(info)) => AgentEvent::DevCreated { info },
                    Ok(RegistryEvent::Deleted { if_index }) => AgentEvent::DevDeleted { if_index },
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "registry notifications lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        registry_open = false;
                        continue;
                    }
                },
                ev = jobs.recv(), if jobs_open => match ev {
                    Ok((id, result)) => AgentEvent::JobFinished { id, result },
                    Err(RecvError::Lagged(n)) => {
                        warn!(skipped = n, "job notifications lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        jobs_open = false;
                        continue;
                    }
                },
            };
            let _ = events.send(event);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::SimKernel;
    use crate::probe::StaticProbe;
    use netlab_common::models::{DeviceInfo, IpAddress, LinkSpec};
    use netlab_common::protocol::JobSpec;
    use serde_json::json;

    fn agent() -> (Arc<SimKernel>, Arc<Agent>) {
        let sim = Arc::new(SimKernel::new());
        let reg = Arc::new(DeviceRegistry::new(sim.clone(), Arc::new(StaticProbe::new())));
        let agent = Agent::new(
            "test-host",
            reg,
            Arc::new(JobManager::new("/bin/sh")),
            SystemConfig::new(std::env::temp_dir()),
        );
        (sim, agent)
    }

    #[tokio::test]
    async fn device_methods_over_requests() {
        let (sim, agent) = agent();
        let eth0 = sim.add_physical("eth0", "52:54:00:00:00:01".parse().unwrap(), "virtio_net");

        let reply = agent
            .handle(Request::DevMethod {
                if_index: eth0,
                call: DeviceCall::SetMtu { mtu: 9000 },
            })
            .await;
        assert!(reply.passed);

        let reply = agent
            .handle(Request::DevAttr {
                if_index: eth0,
                attr: DeviceAttr::Mtu,
            })
            .await;
        assert_eq!(reply.result, json!(9000));

        let reply = agent
            .handle(Request::DevMethod {
                if_index: eth0,
                call: DeviceCall::SetMtu { mtu: 1 },
            })
            .await;
        assert!(!reply.passed);
        assert_eq!(reply.error.unwrap().kind, RemoteErrorKind::InvalidValue);

        let reply = agent.handle(Request::GetDevice { if_index: 77 }).await;
        assert_eq!(reply.error.unwrap().kind, RemoteErrorKind::NotFound);
    }

    #[tokio::test]
    async fn vanished_device_is_named_in_the_error() {
        let (sim, agent) = agent();
        let eth0 = sim.add_physical("eth0", "52:54:00:00:00:01".parse().unwrap(), "virtio_net");
        agent.registry().rescan().await.unwrap();
        sim.remove_link(eth0).unwrap();

        let reply = agent
            .handle(Request::DevAttr {
                if_index: eth0,
                attr: DeviceAttr::Name,
            })
            .await;
        let err = reply.error.unwrap();
        assert_eq!(err.kind, RemoteErrorKind::NotFound);
        assert!(err.is_gone(eth0));
        assert!(!err.is_gone(eth0 + 1));
    }

    #[tokio::test]
    async fn create_device_pushes_event() {
        let (_sim, agent) = agent();
        agent.registry().rescan().await.unwrap();
        let mut events = agent.subscribe();

        let reply = agent
            .handle(Request::CreateDevice {
                spec: LinkSpec::Bridge { name: None },
            })
            .await;
        let info: DeviceInfo = serde_json::from_value(reply.into_result().unwrap()).unwrap();
        assert_eq!(info.name, "br0");

        let created = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(AgentEvent::DevCreated { info }) = events.recv().await
                    && info.name == "br0"
                {
                    return info;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(created.if_index, info.if_index);
    }

    #[tokio::test]
    async fn control_device_is_protected() {
        let (sim, agent) = agent();
        let eth0 = sim.add_physical("eth0", "52:54:00:00:00:01".parse().unwrap(), "virtio_net");
        let addr: IpAddress = "192.168.122.10/24".parse().unwrap();
        sim.add_external_address(eth0, addr).unwrap();

        agent.set_control_address(Some(addr.addr)).await;
        let reply = agent
            .handle(Request::DevMethod {
                if_index: eth0,
                call: DeviceCall::Down,
            })
            .await;
        assert!(reply.passed);
        assert_eq!(sim.addresses(eth0), vec![addr]);

        agent.handle(Request::DestroyDevices).await;
        assert_eq!(sim.addresses(eth0), vec![addr]);

        agent.set_control_address(None).await;
        agent.handle(Request::DestroyDevices).await;
        assert!(sim.addresses(eth0).is_empty());
    }

    #[tokio::test]
    async fn jobs_over_requests() {
        let (_sim, agent) = agent();
        let reply = agent
            .handle(Request::RunJob {
                job: JobSpec {
                    command: "echo ok".into(),
                    background: false,
                },
            })
            .await;
        assert!(reply.passed);
        assert_eq!(reply.result["stdout"], json!("ok\n"));

        let reply = agent
            .handle(Request::WaitJob {
                id: 999,
                timeout_ms: Some(10),
            })
            .await;
        assert_eq!(reply.error.unwrap().kind, RemoteErrorKind::Job);
    }
}

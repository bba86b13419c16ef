//! Controller-side proxy of a device living in a machine's registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;

use netlab_common::channel::{Channel, call_as};
use netlab_common::error::{DeviceError, RemoteError};
use netlab_common::models::{DeviceInfo, DevlinkPort, HwAddr, IpAddress, LinkStats};
use netlab_common::protocol::{DeviceAttr, DeviceCall, Request};

/// A device on a remote machine, addressed by its kernel index.
///
/// Every operation is a round trip to the agent, so reads always see the
/// registry's current state. Once the agent reports the device deleted the
/// proxy is tombstoned and fails locally without touching the channel.
pub struct RemoteDevice {
    if_index: u32,
    channel: Arc<dyn Channel>,
    deleted: AtomicBool,
}

impl std::fmt::Debug for RemoteDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDevice")
            .field("if_index", &self.if_index)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

impl RemoteDevice {
    pub fn new(if_index: u32, channel: Arc<dyn Channel>) -> Self {
        Self {
            if_index,
            channel,
            deleted: AtomicBool::new(false),
        }
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn tombstone(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.is_deleted() {
            return Err(DeviceError::Deleted {
                if_index: self.if_index,
            });
        }
        Ok(())
    }

    async fn attr<T: DeserializeOwned>(&self, attr: DeviceAttr) -> Result<T, DeviceError> {
        self.check()?;
        let request = Request::DevAttr {
            if_index: self.if_index,
            attr,
        };
        let result = call_as(self.channel.as_ref(), request).await;
        self.settle(result)
    }

    async fn call(&self, call: DeviceCall) -> Result<(), DeviceError> {
        self.check()?;
        let request = Request::DevMethod {
            if_index: self.if_index,
            call,
        };
        let result = self.channel.call(request).await;
        self.settle(result).map(drop)
    }

    /// Map a reply error. When the agent no longer knows this device the
    /// proxy is tombstoned on the spot.
    fn settle<T>(&self, result: Result<T, RemoteError>) -> Result<T, DeviceError> {
        match result {
            Err(e) if e.is_gone(self.if_index) => {
                self.tombstone();
                Err(DeviceError::Deleted {
                    if_index: self.if_index,
                })
            }
            other => other.map_err(DeviceError::from),
        }
    }

    // ── Attributes ───────────────────────────────────────────────────

    pub async fn name(&self) -> Result<String, DeviceError> {
        self.attr(DeviceAttr::Name).await
    }

    pub async fn hwaddr(&self) -> Result<HwAddr, DeviceError> {
        self.attr(DeviceAttr::Hwaddr).await
    }

    pub async fn mtu(&self) -> Result<u32, DeviceError> {
        self.attr(DeviceAttr::Mtu).await
    }

    pub async fn state(&self) -> Result<Vec<String>, DeviceError> {
        self.attr(DeviceAttr::State).await
    }

    pub async fn ips(&self) -> Result<Vec<IpAddress>, DeviceError> {
        self.attr(DeviceAttr::Ips).await
    }

    /// Index of the master device, if enslaved.
    pub async fn master(&self) -> Result<Option<u32>, DeviceError> {
        self.attr(DeviceAttr::Master).await
    }

    pub async fn driver(&self) -> Result<Option<String>, DeviceError> {
        self.attr(DeviceAttr::Driver).await
    }

    pub async fn link_header_type(&self) -> Result<u16, DeviceError> {
        self.attr(DeviceAttr::LinkHeaderType).await
    }

    pub async fn link_stats(&self) -> Result<LinkStats, DeviceError> {
        self.attr(DeviceAttr::LinkStats).await
    }

    pub async fn devlink(&self) -> Result<Option<DevlinkPort>, DeviceError> {
        self.attr(DeviceAttr::Devlink).await
    }

    pub async fn info(&self) -> Result<DeviceInfo, DeviceError> {
        self.attr(DeviceAttr::Info).await
    }

    // ── Configuration ────────────────────────────────────────────────

    pub async fn set_mtu(&self, mtu: u32) -> Result<(), DeviceError> {
        self.call(DeviceCall::SetMtu { mtu }).await
    }

    /// Enslave to `master`, or release with `None`.
    pub async fn set_master(&self, master: Option<&RemoteDevice>) -> Result<(), DeviceError> {
        if let Some(m) = master {
            m.check()?;
        }
        self.call(DeviceCall::SetMaster {
            master: master.map(|m| m.if_index),
        })
        .await
    }

    pub async fn ip_add(&self, addr: IpAddress) -> Result<(), DeviceError> {
        self.call(DeviceCall::IpAdd { addr }).await
    }

    pub async fn ip_del(&self, addr: IpAddress) -> Result<(), DeviceError> {
        self.call(DeviceCall::IpDel { addr }).await
    }

    pub async fn ip_flush(&self) -> Result<(), DeviceError> {
        self.call(DeviceCall::IpFlush).await
    }

    pub async fn up(&self) -> Result<(), DeviceError> {
        self.call(DeviceCall::Up).await
    }

    pub async fn down(&self) -> Result<(), DeviceError> {
        self.call(DeviceCall::Down).await
    }

    pub async fn speed_set(&self, speed: u32) -> Result<(), DeviceError> {
        self.call(DeviceCall::SpeedSet { speed }).await
    }

    pub async fn autoneg_on(&self) -> Result<(), DeviceError> {
        self.call(DeviceCall::AutonegOn).await
    }

    pub async fn autoneg_off(&self) -> Result<(), DeviceError> {
        self.call(DeviceCall::AutonegOff).await
    }

    pub async fn cleanup(&self) -> Result<(), DeviceError> {
        self.call(DeviceCall::Cleanup).await
    }

    pub async fn enable(&self) -> Result<(), DeviceError> {
        self.call(DeviceCall::Enable).await
    }

    pub async fn disable(&self) -> Result<(), DeviceError> {
        self.call(DeviceCall::Disable).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use netlab_common::error::RemoteErrorKind;
    use netlab_common::protocol::AgentEvent;
    use tokio::sync::broadcast;

    /// Answers every request with a canned value and records what it saw.
    struct Canned {
        seen: Mutex<Vec<Request>>,
        answer: Result<serde_json::Value, RemoteError>,
    }

    #[async_trait]
    impl Channel for Canned {
        async fn call(&self, request: Request) -> Result<serde_json::Value, RemoteError> {
            self.seen.lock().unwrap().push(request);
            self.answer.clone()
        }

        fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
            broadcast::channel(1).1
        }
    }

    fn canned(answer: Result<serde_json::Value, RemoteError>) -> Arc<Canned> {
        Arc::new(Canned {
            seen: Mutex::new(Vec::new()),
            answer,
        })
    }

    #[tokio::test]
    async fn reads_decode_the_reply() {
        let ch = canned(Ok(serde_json::json!(1500)));
        let dev = RemoteDevice::new(4, ch.clone());
        assert_eq!(dev.mtu().await.unwrap(), 1500);
        assert_eq!(
            ch.seen.lock().unwrap()[0],
            Request::DevAttr {
                if_index: 4,
                attr: DeviceAttr::Mtu
            }
        );
    }

    #[tokio::test]
    async fn invalid_value_reaches_the_caller() {
        let ch = canned(Err(RemoteError::new(
            RemoteErrorKind::InvalidValue,
            "Invalid MTU value",
        )));
        let dev = RemoteDevice::new(4, ch);
        assert_eq!(
            dev.set_mtu(1).await,
            Err(DeviceError::InvalidValue("Invalid MTU value".into()))
        );
    }

    #[tokio::test]
    async fn tombstoned_device_fails_without_a_round_trip() {
        let ch = canned(Ok(serde_json::Value::Null));
        let dev = RemoteDevice::new(9, ch.clone());
        dev.tombstone();
        assert_eq!(dev.up().await, Err(DeviceError::Deleted { if_index: 9 }));
        assert_eq!(dev.name().await, Err(DeviceError::Deleted { if_index: 9 }));

        let port = RemoteDevice::new(10, ch.clone());
        assert_eq!(
            port.set_master(Some(&dev)).await,
            Err(DeviceError::Deleted { if_index: 9 })
        );
        assert!(ch.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_index_tombstones_the_proxy() {
        let ch = canned(Err(
            RemoteError::new(RemoteErrorKind::NotFound, "device not found").for_device(5),
        ));
        let dev = RemoteDevice::new(5, ch.clone());
        assert_eq!(dev.name().await, Err(DeviceError::Deleted { if_index: 5 }));
        assert!(dev.is_deleted());
        assert_eq!(dev.up().await, Err(DeviceError::Deleted { if_index: 5 }));
        assert_eq!(ch.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn other_lookup_failures_keep_the_proxy() {
        let ch = canned(Err(RemoteError::new(RemoteErrorKind::NotFound, "device not found")));
        let dev = RemoteDevice::new(5, ch);
        assert_eq!(dev.set_master(None).await, Err(DeviceError::NotFound));
        assert!(!dev.is_deleted());
    }

    #[tokio::test]
    async fn set_master_sends_the_index() {
        let ch = canned(Ok(serde_json::Value::Null));
        let bond = RemoteDevice::new(7, ch.clone());
        let port = RemoteDevice::new(3, ch.clone());
        port.set_master(Some(&bond)).await.unwrap();
        port.set_master(None).await.unwrap();
        let seen = ch.seen.lock().unwrap();
        assert_eq!(
            seen[0],
            Request::DevMethod {
                if_index: 3,
                call: DeviceCall::SetMaster { master: Some(7) }
            }
        );
        assert_eq!(
            seen[1],
            Request::DevMethod {
                if_index: 3,
                call: DeviceCall::SetMaster { master: None }
            }
        );
    }
}

//! Background reconciliation task.
//!
//! Drains the kernel event feed in batches and applies each batch to the
//! registry, and runs a full rescan on a fixed interval to repair whatever
//! the feed dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::kernel::{KernelError, KernelEvent};
use crate::registry::DeviceRegistry;

/// Subscribe to the kernel feed, reconcile once, and keep the registry
/// current until `shutdown` flips to true.
pub fn spawn(
    registry: Arc<DeviceRegistry>,
    rescan_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>, KernelError> {
    // Subscribe before the first rescan so nothing falls in between.
    let events = registry.kernel().subscribe()?;
    Ok(tokio::spawn(async move {
        if let Err(e) = registry.rescan().await {
            warn!(error = %e, "initial rescan failed");
        }
        run(registry, events, rescan_interval, shutdown).await;
    }))
}

pub async fn run(
    registry: Arc<DeviceRegistry>,
    mut events: mpsc::UnboundedReceiver<KernelEvent>,
    rescan_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(rescan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut feed_open = true;

    loop {
        tokio::select! {
            ev = events.recv(), if feed_open => match ev {
                Some(ev) => {
                    let mut batch = vec![ev];
                    while let Ok(ev) = events.try_recv() {
                        batch.push(ev);
                    }
                    debug!(count = batch.len(), "applying kernel events");
                    registry.apply_events(batch).await;
                }
                None => {
                    warn!("kernel event feed closed, relying on periodic rescans");
                    feed_open = false;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = registry.rescan().await {
                    warn!(error = %e, "periodic rescan failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("reconciliation task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{Kernel, SimKernel};
    use crate::probe::StaticProbe;
    use netlab_common::models::HwAddr;

    #[tokio::test]
    async fn events_reach_the_registry() {
        let sim = Arc::new(SimKernel::new());
        let reg = Arc::new(DeviceRegistry::new(sim.clone(), Arc::new(StaticProbe::new())));
        let (tx, rx) = watch::channel(false);
        let task = spawn(reg.clone(), Duration::from_secs(3600), rx).unwrap();

        let eth0 = sim.add_physical("eth0", HwAddr::new(vec![2, 0, 0, 0, 0, 1]), "e1000");
        sim.set_mtu(eth0, 4000).await.unwrap();

        let mut mtu = None;
        for _ in 0..100 {
            if let Some(dev) = reg.cached().await.into_iter().find(|d| d.if_index() == eth0) {
                mtu = dev.mtu().ok();
                if mtu == Some(4000) {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mtu, Some(4000));

        tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn periodic_rescan_repairs_dropped_events() {
        let sim = Arc::new(SimKernel::new());
        let reg = Arc::new(DeviceRegistry::new(sim.clone(), Arc::new(StaticProbe::new())));
        let (tx, rx) = watch::channel(false);
        let task = spawn(reg.clone(), Duration::from_millis(20), rx).unwrap();

        sim.set_drop_events(true);
        let eth0 = sim.add_physical("eth0", HwAddr::new(vec![2, 0, 0, 0, 0, 1]), "e1000");

        let mut found = false;
        for _ in 0..100 {
            if reg.cached().await.iter().any(|d| d.if_index() == eth0) {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(found);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}

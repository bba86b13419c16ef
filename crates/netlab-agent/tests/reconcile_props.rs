//! Property tests for registry reconciliation.
//!
//! A random sequence of kernel changes is played against the simulated
//! kernel. However events and rescans interleave, and whichever events get
//! lost, the registry must end where a fresh full enumeration puts it.

use std::sync::Arc;

use proptest::prelude::*;
use tokio::sync::mpsc;

use netlab_agent::kernel::{Kernel, KernelEvent, SimKernel};
use netlab_agent::probe::StaticProbe;
use netlab_agent::registry::DeviceRegistry;
use netlab_common::models::{DeviceInfo, HwAddr, IpAddress};

#[derive(Debug, Clone)]
enum Op {
    AddNic,
    Remove(usize),
    SetMtu(usize, u32),
    AddAddr(usize, u8),
    DelAddr(usize, usize),
    SetUp(usize, bool),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        2 => Just(Op::AddNic),
        1 => any::<usize>().prop_map(Op::Remove),
        2 => (any::<usize>(), 68u32..9000).prop_map(|(t, m)| Op::SetMtu(t, m)),
        3 => (any::<usize>(), 1u8..8).prop_map(|(t, a)| Op::AddAddr(t, a)),
        2 => (any::<usize>(), any::<usize>()).prop_map(|(t, a)| Op::DelAddr(t, a)),
        1 => (any::<usize>(), any::<bool>()).prop_map(|(t, u)| Op::SetUp(t, u)),
    ]
}

/// Apply `op` to the kernel. Ops that do not fit the current state are
/// skipped.
async fn play(sim: &SimKernel, nics: &mut Vec<u32>, next_mac: &mut u8, op: &Op) {
    let pick = |n: usize| (!nics.is_empty()).then(|| nics[n % nics.len()]);
    match *op {
        Op::AddNic => {
            *next_mac = next_mac.wrapping_add(1);
            let name = format!("eth{next_mac}");
            let mac = HwAddr::new(vec![0x52, 0x54, 0, 0, 1, *next_mac]);
            nics.push(sim.add_physical(&name, mac, "virtio_net"));
        }
        Op::Remove(t) => {
            if let Some(idx) = pick(t) {
                sim.remove_link(idx).unwrap();
                nics.retain(|i| *i != idx);
            }
        }
        Op::SetMtu(t, mtu) => {
            if let Some(idx) = pick(t) {
                sim.set_mtu(idx, mtu).await.unwrap();
            }
        }
        Op::AddAddr(t, a) => {
            if let Some(idx) = pick(t) {
                let addr: IpAddress = format!("10.0.{idx}.{a}/24").parse().unwrap();
                let _ = sim.add_address(idx, &addr).await;
            }
        }
        Op::DelAddr(t, a) => {
            if let Some(idx) = pick(t) {
                let addrs = sim.addresses(idx);
                if !addrs.is_empty() {
                    let addr = addrs[a % addrs.len()];
                    sim.del_address(idx, &addr).await.unwrap();
                }
            }
        }
        Op::SetUp(t, up) => {
            if let Some(idx) = pick(t) {
                sim.set_link_up(idx, up).await.unwrap();
            }
        }
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<KernelEvent>) -> Vec<KernelEvent> {
    let mut batch = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        batch.push(ev);
    }
    batch
}

async fn snapshot(reg: &DeviceRegistry) -> Vec<DeviceInfo> {
    reg.cached()
        .await
        .iter()
        .map(|d| d.info().unwrap())
        .collect()
}

async fn fresh_view(sim: &Arc<SimKernel>) -> Vec<DeviceInfo> {
    let reg = DeviceRegistry::new(sim.clone(), Arc::new(StaticProbe::new()));
    reg.rescan().await.unwrap();
    snapshot(&reg).await
}

fn block_on<F: std::future::Future>(f: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(f)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn events_and_rescan_interleave_to_the_same_state(
        ops in prop::collection::vec(op(), 0..40),
        split in any::<prop::sample::Index>(),
    ) {
        let (got, want) = block_on(async {
            let sim = Arc::new(SimKernel::new());
            let reg = DeviceRegistry::new(sim.clone(), Arc::new(StaticProbe::new()));
            let mut rx = sim.subscribe().unwrap();
            let k = split.index(ops.len() + 1);
            let (mut nics, mut mac) = (Vec::new(), 0u8);

            for op in &ops[..k] {
                play(&sim, &mut nics, &mut mac, op).await;
                reg.apply_events(drain(&mut rx)).await;
            }
            reg.rescan().await.unwrap();
            for op in &ops[k..] {
                play(&sim, &mut nics, &mut mac, op).await;
                reg.apply_events(drain(&mut rx)).await;
            }
            (snapshot(&reg).await, fresh_view(&sim).await)
        });
        prop_assert_eq!(got, want);
    }

    #[test]
    fn rescan_repairs_lost_events(
        steps in prop::collection::vec((op(), any::<bool>()), 0..40),
    ) {
        let (got, want) = block_on(async {
            let sim = Arc::new(SimKernel::new());
            let reg = DeviceRegistry::new(sim.clone(), Arc::new(StaticProbe::new()));
            let mut rx = sim.subscribe().unwrap();
            reg.rescan().await.unwrap();
            let (mut nics, mut mac) = (Vec::new(), 0u8);

            for (op, lost) in &steps {
                sim.set_drop_events(*lost);
                play(&sim, &mut nics, &mut mac, op).await;
                reg.apply_events(drain(&mut rx)).await;
            }
            sim.set_drop_events(false);
            reg.rescan().await.unwrap();
            (snapshot(&reg).await, fresh_view(&sim).await)
        });
        prop_assert_eq!(got, want);
    }

    #[test]
    fn rescan_twice_changes_nothing(ops in prop::collection::vec(op(), 0..30)) {
        let (first, second) = block_on(async {
            let sim = Arc::new(SimKernel::new());
            let reg = DeviceRegistry::new(sim.clone(), Arc::new(StaticProbe::new()));
            let (mut nics, mut mac) = (Vec::new(), 0u8);
            for op in &ops {
                play(&sim, &mut nics, &mut mac, op).await;
            }
            reg.rescan().await.unwrap();
            let first = snapshot(&reg).await;
            reg.rescan().await.unwrap();
            (first, snapshot(&reg).await)
        });
        prop_assert_eq!(first, second);
    }

    #[test]
    fn assigned_names_strictly_increase(n in 1usize..20, taken in prop::collection::btree_set(0u32..30, 0..10)) {
        let names = block_on(async {
            let probe = Arc::new(StaticProbe::new());
            probe.set_vswitch_interfaces(taken.iter().map(|k| format!("veth{k}")).collect());
            let reg = DeviceRegistry::new(Arc::new(SimKernel::new()), probe);
            let mut names = Vec::new();
            for _ in 0..n {
                names.push(reg.assign_name("veth").await.unwrap());
            }
            let (a, b) = reg.assign_name_pair("veth").await.unwrap();
            names.push(a);
            names.push(b);
            names
        });

        let suffixes: Vec<u32> = names
            .iter()
            .map(|n| n.strip_prefix("veth").unwrap().parse().unwrap())
            .collect();
        prop_assert!(suffixes.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(suffixes.iter().all(|s| !taken.contains(s)));
    }
}

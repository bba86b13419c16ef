//! netlab agent daemon
//!
//! Runs on every test machine:
//!
//! - Mirrors kernel network interfaces in the device registry
//! - Applies netlink events and rescans periodically to repair drift
//! - Serves the controller's command channel over WebSocket
//! - In `--simulate` mode, runs against an in-memory kernel with fake NICs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use netlab_agent::config::AgentConfig;
use netlab_agent::handler::Agent;
use netlab_agent::jobs::JobManager;
use netlab_agent::kernel::{Kernel, NetlinkKernel, SimKernel};
use netlab_agent::probe::{HostProbe, HostTools, StaticProbe};
use netlab_agent::registry::DeviceRegistry;
use netlab_agent::sysconfig::SystemConfig;
use netlab_agent::{pump, server};

/// netlab test machine agent.
#[derive(Parser, Debug)]
#[command(name = "netlab-agent", about = "netlab test machine agent")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file).
    #[arg(long)]
    listen: Option<String>,

    /// Run against a simulated kernel.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Seconds between full rescans (overrides the config file).
    #[arg(long)]
    rescan_interval: Option<u64>,

    /// Hostname reported to the controller.
    #[arg(long)]
    hostname: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            AgentConfig::from_toml_str(&text).map_err(anyhow::Error::msg)?
        }
        None => AgentConfig::default(),
    };
    if let Some(listen) = cli.listen {
        cfg.listen = listen;
    }
    if let Some(secs) = cli.rescan_interval {
        cfg.rescan_interval_s = secs.max(1);
    }
    cfg.simulate |= cli.simulate;

    let hostname = cli
        .hostname
        .unwrap_or_else(|| gethostname().unwrap_or_else(|| "netlab-agent".into()));

    tracing::info!(
        hostname = %hostname,
        simulate = cfg.simulate,
        listen = %cfg.listen,
        "netlab-agent starting"
    );

    let (kernel, probe): (Arc<dyn Kernel>, Arc<dyn HostProbe>) = if cfg.simulate {
        (simulated_kernel(), Arc::new(StaticProbe::new()))
    } else {
        (Arc::new(NetlinkKernel::new()?), Arc::new(HostTools))
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = Arc::new(DeviceRegistry::new(kernel, probe));
    let pump_handle = pump::spawn(registry.clone(), cfg.rescan_interval(), shutdown_rx.clone())?;

    let agent = Agent::new(
        hostname,
        registry,
        Arc::new(JobManager::new(cfg.job_shell.clone())),
        SystemConfig::new(cfg.sysconfig_root.clone()),
    );

    let listener = tokio::net::TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;
    let server_handle = tokio::spawn(server::serve(agent, listener, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("command server failed: {e}"),
                Err(e) => tracing::error!("command server task failed: {e}"),
                Ok(Ok(())) => {}
            }
            let _ = shutdown_tx.send(true);
        }
    }

    let _ = pump_handle.await;
    tracing::info!("netlab-agent stopped");
    Ok(())
}

/// A simulated host with two virtio NICs next to `lo`.
fn simulated_kernel() -> Arc<dyn Kernel> {
    let sim = SimKernel::new();
    for (n, name) in ["eth0", "eth1"].iter().enumerate() {
        let mac = netlab_common::models::HwAddr::new(vec![0x52, 0x54, 0, 0, 0, n as u8 + 1]);
        sim.add_physical(name, mac, "virtio_net");
    }
    Arc::new(sim)
}

fn gethostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

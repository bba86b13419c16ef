//! netlab controller
//!
//! Runs one recipe against the configured pools:
//!
//! - Loads pool directories and health-checks their agents
//! - Replays candidate matches from a match file
//! - Runs a shell command on every matched host as the test body
//! - Tears each match down before trying the next; Ctrl-C interrupts the
//!   current attempt but still tears it down

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use netlab_control::config::ControllerConfig;
use netlab_control::controller::{Controller, RunError, RunMode};
use netlab_control::hypervisor::LibvirtHypervisor;
use netlab_control::macpool::MacPool;
use netlab_control::mapper::{FixedMapper, MatchFile};
use netlab_control::pool::StaticPoolManager;
use netlab_control::recipe::ShellRecipe;
use netlab_control::ws::WsConnector;

/// netlab test controller.
#[derive(Parser, Debug)]
#[command(name = "netlab-control", about = "netlab test controller")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Match file with requirements and candidate matches.
    #[arg(long)]
    matches: PathBuf,

    /// Restrict to these pools; a single directory path is used as an
    /// ad-hoc pool.
    #[arg(long = "pool")]
    pools: Vec<String>,

    /// Skip the agent reachability check when loading pools.
    #[arg(long, default_value_t = false)]
    no_pool_checks: bool,

    /// How many matches to explore (overrides the config file).
    #[arg(long, value_enum)]
    mode: Option<RunMode>,

    /// Recipe name reported to the agents.
    #[arg(long, default_value = "shell")]
    recipe: String,

    /// Command run on every host.
    #[arg(long)]
    command: String,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let mut cfg = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ControllerConfig::from_toml_str(&text).map_err(anyhow::Error::msg)?
        }
        None => ControllerConfig::default(),
    };
    if let Some(mode) = cli.mode {
        cfg.run_mode = mode;
    }
    cfg.pool_checks &= !cli.no_pool_checks;
    cfg.pools = select_pools(&cfg, &cli.pools)?;

    let text = std::fs::read_to_string(&cli.matches)
        .with_context(|| format!("reading {}", cli.matches.display()))?;
    let match_file = MatchFile::from_toml_str(&text).map_err(anyhow::Error::msg)?;

    tracing::info!(
        pools = cfg.pools.len(),
        matches = match_file.matches.len(),
        mode = ?cfg.run_mode,
        "netlab-control starting"
    );

    let connector = Arc::new(WsConnector {
        connect_timeout: cfg.connect_timeout(),
        call_timeout: cfg.call_timeout(),
    });
    let pools = StaticPoolManager::load(&cfg.pools, cfg.pool_checks, cfg.connect_timeout(), connector)
        .await?;
    let (first, last) = cfg.mac_range().map_err(anyhow::Error::msg)?;
    let mac_pool = Arc::new(MacPool::new(&first, &last)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, interrupting run");
            let _ = shutdown_tx.send(true);
        }
    });

    let controller = Controller::new(
        Arc::new(pools),
        Box::new(FixedMapper::new(match_file.matches)),
        mac_pool,
        Arc::new(LibvirtHypervisor),
    )
    .with_mode(cfg.run_mode)
    .with_device_wait(cfg.device_wait_timeout())
    .with_shutdown(shutdown_rx);

    let recipe = ShellRecipe::new(cli.recipe, match_file.requirements, cli.command);
    match controller.run(&recipe).await {
        Ok(summary) => {
            tracing::info!(
                run_id = %summary.run_id,
                attempts = summary.attempts.len(),
                passed = summary.passed(),
                "run finished"
            );
            tracing::info!(summary = %serde_json::to_string(&summary)?, "run summary");
            Ok(())
        }
        Err(RunError::Interrupted) => {
            tracing::warn!("run interrupted");
            std::process::exit(130);
        }
        Err(e) => Err(e.into()),
    }
}

/// Pools named on the command line, or all configured pools.
fn select_pools(
    cfg: &ControllerConfig,
    names: &[String],
) -> anyhow::Result<std::collections::BTreeMap<String, PathBuf>> {
    if names.is_empty() {
        return Ok(cfg.pools.clone());
    }
    let mut selected = std::collections::BTreeMap::new();
    for name in names {
        if let Some(dir) = cfg.pools.get(name) {
            selected.insert(name.clone(), dir.clone());
        } else if names.len() == 1 && std::path::Path::new(name).is_dir() {
            selected.insert("cmd_line_pool".to_string(), PathBuf::from(name));
        } else {
            anyhow::bail!("pool {name} does not exist");
        }
    }
    Ok(selected)
}

//! Recipe runs: try candidate matches in order, and tear every match down
//! completely whatever happened to it.
//!
//! Per attempt:
//!
//! 1. provision the match (lease machines, bind interfaces)
//! 2. run the recipe's test body
//! 3. always: restore system configuration on every leased machine, clean
//!    the machines up, destroy the match's bridges, release the machines
//!
//! Step 3 finishes before the attempt's outcome is looked at, so no machine
//! of one attempt is still leased when the next one starts provisioning.
//! An interrupt cancels steps 1 and 2 but never step 3.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use netlab_common::ids;

use crate::error::ControllerError;
use crate::hypervisor::{Hypervisor, NetworkBridges};
use crate::machine::Machine;
use crate::macpool::MacPool;
use crate::mapper::{Mapper, Match};
use crate::pool::PoolManager;
use crate::provision::MatchProvisioner;
use crate::recipe::Recipe;

/// How many candidate matches a run explores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Attempt the first match only, pass or fail.
    #[default]
    FirstMatch,
    /// Move on after a failure; stop at the first pass.
    UntilSuccess,
    /// Attempt every match; stop at the first failure.
    AllMatches,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no match satisfies the recipe requirements")]
    NoMatch,

    #[error("provisioning failed: {0}")]
    Provision(#[source] ControllerError),

    #[error("recipe failed: {0:#}")]
    Recipe(anyhow::Error),

    #[error("run interrupted")]
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub match_index: usize,
    pub passed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub recipe: String,
    pub attempts: Vec<Attempt>,
}

impl RunSummary {
    pub fn passed(&self) -> bool {
        self.attempts.last().is_some_and(|a| a.passed)
    }
}

pub struct Controller {
    pools: Arc<dyn PoolManager>,
    mapper: Box<dyn Mapper>,
    mac_pool: Arc<MacPool>,
    hypervisor: Arc<dyn Hypervisor>,
    mode: RunMode,
    device_wait: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Controller {
    pub fn new(
        pools: Arc<dyn PoolManager>,
        mapper: Box<dyn Mapper>,
        mac_pool: Arc<MacPool>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Self {
        // Without a sender the signal never fires.
        let (_, shutdown) = watch::channel(false);
        Self {
            pools,
            mapper,
            mac_pool,
            hypervisor,
            mode: RunMode::default(),
            device_wait: Duration::from_secs(30),
            shutdown,
        }
    }

    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_device_wait(mut self, wait: Duration) -> Self {
        self.device_wait = wait;
        self
    }

    /// Interrupt runs when `shutdown` becomes true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Run `recipe` against the mapper's matches according to the run mode.
    ///
    /// The failure of the deciding attempt is returned unchanged once its
    /// teardown is complete.
    pub async fn run(&self, recipe: &dyn Recipe) -> Result<RunSummary, RunError> {
        let mut summary = RunSummary {
            run_id: ids::run_id(),
            recipe: recipe.name().to_string(),
            attempts: Vec::new(),
        };
        let pools = self.pools.pools();
        let requirements = recipe.requirements();
        let mut last_err = None;

        for (index, m) in self.mapper.matches(&pools, requirements).enumerate() {
            if *self.shutdown.borrow() {
                return Err(RunError::Interrupted);
            }
            info!(
                run_id = %summary.run_id,
                match_index = index,
                pool = %m.pool_name,
                is_virtual = m.is_virtual,
                "attempting match"
            );
            for line in m.describe() {
                info!("  {line}");
            }

            let result = self.attempt(&m, recipe).await;
            summary.attempts.push(Attempt {
                match_index: index,
                passed: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            });

            match (result, self.mode) {
                (Err(RunError::Interrupted), _) => {
                    warn!(run_id = %summary.run_id, match_index = index, "run interrupted");
                    return Err(RunError::Interrupted);
                }
                (Ok(()), RunMode::AllMatches) => {
                    info!(run_id = %summary.run_id, match_index = index, "match passed");
                }
                (Ok(()), _) => {
                    info!(run_id = %summary.run_id, match_index = index, "match passed");
                    return Ok(summary);
                }
                (Err(e), RunMode::UntilSuccess) => {
                    warn!(run_id = %summary.run_id, match_index = index, error = %e, "match failed, trying next");
                    last_err = Some(e);
                }
                (Err(e), _) => {
                    error!(run_id = %summary.run_id, match_index = index, error = %e, "match failed");
                    return Err(e);
                }
            }
        }

        if summary.attempts.is_empty() {
            return Err(RunError::NoMatch);
        }
        match last_err {
            Some(e) => {
                error!(run_id = %summary.run_id, attempts = summary.attempts.len(), "no match passed");
                Err(e)
            }
            None => Ok(summary),
        }
    }

    async fn attempt(&self, m: &Match, recipe: &dyn Recipe) -> Result<(), RunError> {
        let bridges = Arc::new(NetworkBridges::new(self.hypervisor.clone()));
        let mut leased: Vec<Arc<Machine>> = Vec::new();
        let provisioner = MatchProvisioner {
            pools: self.pools.as_ref(),
            mac_pool: &self.mac_pool,
            bridges: &bridges,
            recipe: recipe.name(),
            device_wait: self.device_wait,
        };

        let body = async {
            let hosts = provisioner
                .provision(m, recipe.requirements(), &mut leased)
                .await
                .map_err(RunError::Provision)?;
            recipe.test(&hosts).await.map_err(RunError::Recipe)
        };
        let mut shutdown = self.shutdown.clone();
        let interrupted = async move {
            if shutdown.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        let outcome = tokio::select! {
            r = body => r,
            _ = interrupted => Err(RunError::Interrupted),
        };

        self.teardown(&leased, &bridges).await;
        outcome
    }

    async fn teardown(&self, leased: &[Arc<Machine>], bridges: &NetworkBridges) {
        join_all(leased.iter().map(|machine| async move {
            if let Err(e) = machine.restore_system_config().await {
                warn!(machine = %machine.id(), error = %e, "failed to restore system config");
            }
        }))
        .await;

        join_all(leased.iter().map(|machine| async move {
            if let Err(e) = machine.cleanup().await {
                warn!(machine = %machine.id(), error = %e, "machine cleanup incomplete");
            }
        }))
        .await;

        bridges.cleanup().await;

        join_all(leased.iter().map(|machine| self.pools.release(machine))).await;
        info!(machines = leased.len(), "match torn down");
    }
}

use async_trait::async_trait;

use crate::host::Hosts;
use crate::mapper::Requirements;

/// A test body run against a provisioned topology.
#[async_trait]
pub trait Recipe: Send + Sync {
    fn name(&self) -> &str;

    fn requirements(&self) -> &Requirements;

    /// Any error fails the attempt and is handed back to the caller once
    /// the topology has been torn down.
    async fn test(&self, hosts: &Hosts) -> anyhow::Result<()>;
}

/// Runs one shell command on every host; passes when all of them do.
pub struct ShellRecipe {
    name: String,
    requirements: Requirements,
    command: String,
}

impl ShellRecipe {
    pub fn new(name: impl Into<String>, requirements: Requirements, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requirements,
            command: command.into(),
        }
    }
}

#[async_trait]
impl Recipe for ShellRecipe {
    fn name(&self) -> &str {
        &self.name
    }

    fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    async fn test(&self, hosts: &Hosts) -> anyhow::Result<()> {
        for (id, host) in hosts.iter() {
            let result = host.machine().run(&self.command).await?;
            tracing::info!(
                host = id,
                passed = result.passed,
                exit_code = ?result.exit_code,
                "command finished"
            );
            if !result.passed {
                anyhow::bail!(
                    "`{}` failed on host {id} (exit {:?}): {}",
                    self.command,
                    result.exit_code,
                    result.stderr.trim()
                );
            }
        }
        Ok(())
    }
}

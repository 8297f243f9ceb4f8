//! Disruptive operations on the light node.
//!
//! A restart runs the configured command with the restart flag held, so
//! clients are told the node is restarting and nothing is forwarded until
//! the command returns.

use crate::restart::RestartCoordinator;
use lightrelay_core::{RelayError, RelayResult};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{info, warn};

/// `[node]` settings after resolution.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Program followed by its arguments.
    pub restart_command: Vec<String>,
    pub restart_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            restart_command: ["docker", "restart", "celestia-light-node"]
                .map(String::from)
                .to_vec(),
            restart_timeout: Duration::from_secs(120),
        }
    }
}

pub struct NodeAdmin {
    config: NodeConfig,
    restart: Arc<RestartCoordinator>,
}

impl NodeAdmin {
    pub fn new(config: NodeConfig, restart: Arc<RestartCoordinator>) -> Self {
        Self { config, restart }
    }

    /// Restart the light node. The restart flag is set for the whole run and
    /// cleared however it ends.
    pub async fn restart(&self) -> RelayResult<()> {
        let (program, args) = self
            .config
            .restart_command
            .split_first()
            .ok_or_else(|| RelayError::Config("restart command is empty".into()))?;

        let _guard = self.restart.begin();
        let started = Instant::now();
        info!(command = %self.config.restart_command.join(" "), "restarting light node");

        let mut child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RelayError::Admin(format!("failed to run {program}: {e}")))?;

        let status = match tokio::time::timeout(self.config.restart_timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(timeout = ?self.config.restart_timeout, "restart command timed out");
                return Err(RelayError::Admin(format!(
                    "restart did not finish within {:?}",
                    self.config.restart_timeout
                )));
            }
        };

        if !status.success() {
            return Err(RelayError::Admin(format!("restart command exited with {status}")));
        }
        info!(elapsed = ?started.elapsed(), "light node restart finished");
        Ok(())
    }

    /// Restart unless one is already in progress and does not settle.
    ///
    /// Returns `Ok(false)` when the trigger was skipped.
    pub async fn restart_if_idle(&self, grace: Duration) -> RelayResult<bool> {
        if self.restart.settled(grace).await {
            info!("restart already in progress, skipping");
            return Ok(false);
        }
        self.restart().await?;
        Ok(true)
    }
}

//! Node Lifecycle Controller.
//!
//! Sequences one node through `install → configure → wait turn → guarded start`
//! and back down through `stop → wipe`. The order is a hard contract: a node
//! must be configured before it starts, and on a cold cluster each node waits
//! `index * 60s` so members do not race to negotiate initial membership.
//!
//! Decommissioned nodes are special: they skip the stagger and are never
//! started here. Only the Bootstrapper brings them back.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use super::cluster::{ClusterContext, NodeId};
use super::error::{ChaosError, Result};
use super::timing::{STOP_POLL_INTERVAL, TURN_STAGGER};

/// Database settings applied when configuring a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseKnobs {
    pub commitlog_compression: bool,
    pub disable_coordinator_batchlog: bool,
    pub phi_convict_threshold: u32,
    pub hinted_handoff: bool,
}

impl Default for DatabaseKnobs {
    fn default() -> Self {
        DatabaseKnobs {
            commitlog_compression: false,
            disable_coordinator_batchlog: false,
            phi_convict_threshold: 8,
            hinted_handoff: true,
        }
    }
}

impl DatabaseKnobs {
    /// Knobs rendered as `NAME=value` environment assignments.
    pub fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("COMMITLOG_COMPRESSION", self.commitlog_compression.to_string()),
            (
                "DISABLE_COORDINATOR_BATCHLOG",
                self.disable_coordinator_batchlog.to_string(),
            ),
            ("PHI_LEVEL", self.phi_convict_threshold.to_string()),
            ("HINTED_HANDOFF_ENABLED", self.hinted_handoff.to_string()),
        ]
    }
}

/// Installs and configures the database on a node.
pub trait Provisioner: Send + Sync {
    fn install(&self, ctx: &ClusterContext, node: &NodeId) -> Result<()>;
    fn configure(&self, ctx: &ClusterContext, node: &NodeId, knobs: &DatabaseKnobs) -> Result<()>;
}

/// Runs operator-supplied shell scripts through the admin transport.
///
/// The configure script receives the knobs, the node's own address and the
/// seed list as environment assignments prefixed to the command.
#[derive(Debug, Clone, Default)]
pub struct ScriptProvisioner {
    pub install_script: Option<String>,
    pub configure_script: Option<String>,
}

impl ScriptProvisioner {
    fn configure_command(
        &self,
        ctx: &ClusterContext,
        node: &NodeId,
        knobs: &DatabaseKnobs,
        script: &str,
    ) -> Result<String> {
        let address = ctx
            .config
            .address(node)
            .ok_or_else(|| ChaosError::UnknownNode(node.clone()))?;
        let seeds = ctx
            .config
            .nodes()
            .iter()
            .filter_map(|n| ctx.config.address(n))
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let mut assignments = knobs
            .env()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        assignments.push(format!("NODE_ADDRESS={}", address));
        assignments.push(format!("SEEDS={}", seeds));
        assignments.push(format!("INSTALL_DIR={}", ctx.commands.install_dir()));
        Ok(format!("{} {}", assignments.join(" "), script))
    }
}

impl Provisioner for ScriptProvisioner {
    fn install(&self, ctx: &ClusterContext, node: &NodeId) -> Result<()> {
        if let Some(script) = &self.install_script {
            info!(node = %node, "installing");
            let command = format!("INSTALL_DIR={} {}", ctx.commands.install_dir(), script);
            ctx.admin.exec(node, &command)?;
        }
        Ok(())
    }

    fn configure(&self, ctx: &ClusterContext, node: &NodeId, knobs: &DatabaseKnobs) -> Result<()> {
        if let Some(script) = &self.configure_script {
            info!(node = %node, "configuring");
            let command = self.configure_command(ctx, node, knobs, script)?;
            ctx.admin.exec(node, &command)?;
        }
        Ok(())
    }
}

/// Start/stop sequencing for individual nodes.
pub struct NodeLifecycle<'a> {
    ctx: &'a ClusterContext,
}

impl<'a> NodeLifecycle<'a> {
    pub fn new(ctx: &'a ClusterContext) -> Self {
        NodeLifecycle { ctx }
    }

    /// How long `node` must wait before its first start.
    ///
    /// Zero for decommissioned nodes, otherwise the node's configured index
    /// times the stagger, scaled.
    pub fn turn_delay(&self, node: &NodeId) -> Result<Duration> {
        if self.ctx.decommissioned.contains(node) {
            return Ok(Duration::ZERO);
        }
        let index = self
            .ctx
            .config
            .index_of(node)
            .ok_or_else(|| ChaosError::UnknownNode(node.clone()))?;
        Ok(self.ctx.scale.apply(TURN_STAGGER * index as u32))
    }

    /// Block until it is `node`'s turn to start.
    pub fn wait_turn(&self, node: &NodeId) -> Result<()> {
        let delay = self.turn_delay(node)?;
        if !delay.is_zero() {
            info!(node = %node, ?delay, "waiting for startup turn");
            thread::sleep(delay);
        }
        Ok(())
    }

    /// Start the daemon unconditionally.
    pub fn start(&self, node: &NodeId) -> Result<()> {
        info!(node = %node, "starting");
        self.ctx.admin.exec(node, &self.ctx.commands.start())?;
        Ok(())
    }

    /// Start the daemon unless the node is decommissioned. Returns whether it
    /// was started.
    pub fn guarded_start(&self, node: &NodeId) -> Result<bool> {
        if self.ctx.decommissioned.contains(node) {
            info!(node = %node, "decommissioned; leaving stopped");
            return Ok(false);
        }
        self.start(node)?;
        Ok(true)
    }

    /// Signal termination and wait until the process is gone.
    ///
    /// Idempotent: stopping a node that is not running succeeds immediately.
    pub fn stop(&self, node: &NodeId) -> Result<()> {
        info!(node = %node, "stopping");
        match self.ctx.admin.exec(node, &self.ctx.commands.stop()) {
            Ok(_) | Err(ChaosError::Command { .. }) => {}
            Err(e) => return Err(e),
        }

        let timeout = self.ctx.scale.apply(self.ctx.timeouts.stop);
        let poll = self.ctx.scale.apply(STOP_POLL_INTERVAL);
        let started = Instant::now();
        loop {
            match self.ctx.admin.exec(node, &self.ctx.commands.is_running()) {
                Err(e) if e.exit_status() == Some(1) => {
                    debug!(node = %node, "process gone");
                    return Ok(());
                }
                Err(e) => return Err(e),
                Ok(_) => {}
            }
            if started.elapsed() >= timeout {
                return Err(ChaosError::Timeout {
                    what: "process exit",
                    node: node.clone(),
                    waited: started.elapsed(),
                });
            }
            thread::sleep(poll);
        }
    }

    /// Stop the node and delete all of its persisted state.
    pub fn wipe(&self, node: &NodeId) -> Result<()> {
        self.stop(node)?;
        info!(node = %node, "wiping state");
        self.ctx.admin.exec(node, &self.ctx.commands.wipe())?;
        Ok(())
    }

    /// Bring a node up: install, configure, wait for its turn, start.
    pub fn setup(
        &self,
        node: &NodeId,
        provisioner: &dyn Provisioner,
        knobs: &DatabaseKnobs,
    ) -> Result<()> {
        provisioner.install(self.ctx, node)?;
        provisioner.configure(self.ctx, node, knobs)?;
        self.wait_turn(node)?;
        self.guarded_start(node)?;
        Ok(())
    }

    /// Tear a node down. With `leave_running` the node is left untouched for
    /// inspection.
    pub fn teardown(&self, node: &NodeId, leave_running: bool) -> Result<()> {
        if leave_running {
            info!(node = %node, "leaving node running");
            return Ok(());
        }
        self.wipe(node)
    }
}

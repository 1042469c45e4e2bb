//! Clock perturbation.
//!
//! Handles the three clock actions the schedule emits:
//! - `clock-reset`: resynchronize every node against an NTP server.
//! - `clock-bump`: jump one random node's clock by `delta_ms`.
//! - `clock-strobe`: flip one random node's clock back and forth by `delta_ms`
//!   every `period_ms` for `duration_s` seconds.

use rand::seq::SliceRandom;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::cluster::{ClusterContext, NodeId};
use super::error::{ChaosError, Result};
use super::operation::{Action, Operation};

/// Default NTP server used by `clock-reset`.
pub const DEFAULT_NTP_SERVER: &str = "pool.ntp.org";

/// Shell command stepping the clock by `delta_ms` milliseconds.
pub fn bump_command(delta_ms: i64) -> String {
    format!(
        "date -u -s \"@$(echo \"$(date +%s.%N) + ({}) / 1000\" | bc -l)\"",
        delta_ms
    )
}

/// Shell command oscillating the clock for `duration_s` seconds.
pub fn strobe_command(delta_ms: i64, period_ms: u64, duration_s: u64) -> String {
    let period = format!("{}.{:03}", period_ms / 1000, period_ms % 1000);
    format!(
        "end=$(( $(date +%s) + {dur} )); \
         while [ $(date +%s) -lt $end ]; do \
         {up}; sleep {period}; {down}; sleep {period}; \
         done",
        dur = duration_s,
        up = bump_command(delta_ms),
        down = bump_command(-delta_ms),
        period = period,
    )
}

pub fn reset_command(ntp_server: &str) -> String {
    format!("ntpdate -b {}", ntp_server)
}

/// Applies clock operations to the cluster.
pub struct ClockNemesis {
    ctx: ClusterContext,
    ntp_server: String,
}

impl ClockNemesis {
    pub fn new(ctx: ClusterContext, ntp_server: impl Into<String>) -> Self {
        ClockNemesis {
            ctx,
            ntp_server: ntp_server.into(),
        }
    }

    fn random_node(&self) -> Result<NodeId> {
        self.ctx
            .config
            .nodes()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| ChaosError::Config("cluster has no nodes".into()))
    }

    fn payload_i64(op: &Operation, key: &str) -> i64 {
        op.payload[key].as_i64().unwrap_or(0)
    }

    fn payload_u64(op: &Operation, key: &str) -> u64 {
        op.payload[key].as_u64().unwrap_or(0)
    }

    pub fn invoke(&self, op: &Operation) -> Result<Value> {
        match op.action {
            Action::ClockReset => {
                let command = reset_command(&self.ntp_server);
                let mut reset = Vec::new();
                for node in self.ctx.config.nodes() {
                    match self.ctx.admin.exec(node, &command) {
                        Ok(_) => reset.push(node.clone()),
                        Err(e) => warn!(node = %node, error = %e, "clock reset failed"),
                    }
                }
                info!(nodes = ?reset, "clocks reset");
                Ok(json!({ "reset": reset }))
            }
            Action::ClockBump => {
                let node = self.random_node()?;
                let delta = Self::payload_i64(op, "delta_ms");
                info!(node = %node, delta_ms = delta, "bumping clock");
                self.ctx.admin.exec(&node, &bump_command(delta))?;
                Ok(json!({ "node": node, "delta_ms": delta }))
            }
            Action::ClockStrobe => {
                let node = self.random_node()?;
                let delta = Self::payload_i64(op, "delta_ms");
                let period = Self::payload_u64(op, "period_ms");
                let duration = Self::payload_u64(op, "duration_s");
                info!(node = %node, delta_ms = delta, period_ms = period, duration_s = duration, "strobing clock");
                self.ctx
                    .admin
                    .exec(&node, &strobe_command(delta, period, duration))?;
                Ok(json!({ "node": node, "delta_ms": delta, "period_ms": period, "duration_s": duration }))
            }
            other => Ok(json!({ "ignored": other })),
        }
    }
}

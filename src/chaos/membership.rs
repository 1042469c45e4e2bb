//! Membership Tracker.
//!
//! Answers "which nodes are live" and "which nodes are joining" by asking the
//! cluster itself. Nothing is cached: every call queries the management
//! interface of one or more non-decommissioned nodes, visited in random order.
//!
//! The two queries aggregate differently:
//! - [`MembershipTracker::live_nodes`] trusts the **first** node that answers.
//! - [`MembershipTracker::joining_nodes`] asks **every** node and returns the
//!   union, because a joining node is not yet visible from every peer.
//!
//! A node that fails to answer is logged and skipped. If nobody answers the
//! result is empty, which callers treat as "unknown".

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use super::admin::{Admin, Commands};
use super::cluster::{ClusterContext, NodeId};
use super::error::Result;

/// Raw membership view reported by one node's management interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterStatus {
    pub live: Vec<IpAddr>,
    pub joining: Vec<IpAddr>,
}

impl ClusterStatus {
    /// Parse `nodetool status` output.
    ///
    /// Member rows start with a two-letter code: status (`U`p/`D`own) then
    /// state (`N`ormal, `L`eaving, `J`oining, `M`oving), followed by the
    /// address. A node is live when it is up and not joining; it is joining
    /// when its state is `J` regardless of status. Other lines are ignored.
    pub fn parse_nodetool(output: &str) -> Self {
        let mut status = ClusterStatus::default();
        for line in output.lines() {
            let mut fields = line.split_whitespace();
            let (code, addr) = match (fields.next(), fields.next()) {
                (Some(code), Some(addr)) => (code.as_bytes(), addr),
                _ => continue,
            };
            if code.len() != 2
                || !matches!(code[0], b'U' | b'D')
                || !matches!(code[1], b'N' | b'L' | b'J' | b'M')
            {
                continue;
            }
            let addr = match addr.parse::<IpAddr>() {
                Ok(addr) => addr,
                Err(_) => continue,
            };
            match (code[0], code[1]) {
                (_, b'J') => status.joining.push(addr),
                (b'U', _) => status.live.push(addr),
                _ => {}
            }
        }
        status
    }
}

/// Per-node management-status query.
pub trait StatusProbe: Send + Sync {
    fn status(&self, node: &NodeId) -> Result<ClusterStatus>;
}

/// Runs `nodetool status` on the node through the admin transport.
pub struct NodetoolProbe {
    admin: Arc<dyn Admin>,
    commands: Commands,
}

impl NodetoolProbe {
    pub fn new(admin: Arc<dyn Admin>, commands: Commands) -> Self {
        NodetoolProbe { admin, commands }
    }
}

impl StatusProbe for NodetoolProbe {
    fn status(&self, node: &NodeId) -> Result<ClusterStatus> {
        let output = self.admin.exec(node, &self.commands.status())?;
        Ok(ClusterStatus::parse_nodetool(&output))
    }
}

/// Live/joining queries over a cluster context.
pub struct MembershipTracker<'a> {
    ctx: &'a ClusterContext,
}

impl<'a> MembershipTracker<'a> {
    pub fn new(ctx: &'a ClusterContext) -> Self {
        MembershipTracker { ctx }
    }

    /// Non-decommissioned nodes in random order.
    fn candidates(&self) -> Vec<NodeId> {
        let decommissioned = self.ctx.decommissioned.snapshot();
        let mut candidates: Vec<NodeId> = self
            .ctx
            .config
            .nodes()
            .iter()
            .filter(|n| !decommissioned.contains(*n))
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
    }

    /// Map raw addresses onto configured nodes, dropping strangers.
    fn translate(&self, addrs: &[IpAddr]) -> BTreeSet<NodeId> {
        addrs
            .iter()
            .filter_map(|addr| {
                let node = self.ctx.config.node_for_address(addr);
                if node.is_none() {
                    debug!(%addr, "ignoring address outside the configured cluster");
                }
                node.cloned()
            })
            .collect()
    }

    /// Live members as seen by the first candidate that answers.
    pub fn live_nodes(&self) -> BTreeSet<NodeId> {
        for node in self.candidates() {
            match self.ctx.probe.status(&node) {
                Ok(status) => return self.translate(&status.live),
                Err(e) => warn!(node = %node, error = %e, "status query failed; trying next node"),
            }
        }
        warn!("no node answered a status query; live set unknown");
        BTreeSet::new()
    }

    /// Union of the joining members reported by every candidate that answers.
    pub fn joining_nodes(&self) -> BTreeSet<NodeId> {
        let mut joining = BTreeSet::new();
        for node in self.candidates() {
            match self.ctx.probe.status(&node) {
                Ok(status) => joining.extend(self.translate(&status.joining)),
                Err(e) => warn!(node = %node, error = %e, "status query failed; skipping node"),
            }
        }
        joining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "\
Datacenter: datacenter1
=======================
Status=Up/Down
|/ State=Normal/Leaving/Joining/Moving
--  Address    Load       Tokens  Owns (effective)  Host ID                               Rack
UN  10.0.0.1   112.4 KiB  256     61.2%             2d6c1a8e-3c5f-4b7c-9d7e-1f0a2b3c4d5e  rack1
UL  10.0.0.2   98.1 KiB   256     58.0%             7a1b2c3d-4e5f-6a7b-8c9d-0e1f2a3b4c5d  rack1
UJ  10.0.0.3   12.0 KiB   256     ?                 0f1e2d3c-4b5a-6978-8a9b-0c1d2e3f4a5b  rack1
DN  10.0.0.4   101.7 KiB  256     60.1%             9a8b7c6d-5e4f-3a2b-1c0d-9e8f7a6b5c4d  rack1
UM  fe80::1    1 KiB      256     10.0%             1a2b3c4d-5e6f-7a8b-9c0d-1e2f3a4b5c6d  rack1
";

    #[test]
    fn test_parse_nodetool_status() {
        let status = ClusterStatus::parse_nodetool(STATUS);
        let ip = |s: &str| s.parse::<IpAddr>().unwrap();
        assert_eq!(status.live, vec![ip("10.0.0.1"), ip("10.0.0.2"), ip("fe80::1")]);
        assert_eq!(status.joining, vec![ip("10.0.0.3")]);
    }

    #[test]
    fn test_parse_ignores_garbage() {
        let status = ClusterStatus::parse_nodetool("error: connection refused\nUN\nXX 10.0.0.1\nUN nope\n");
        assert_eq!(status, ClusterStatus::default());
    }
}

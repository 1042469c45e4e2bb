//! Nemesis - the membership and maintenance fault actions.
//!
//! Four actions share one contract, `setup → invoke* → teardown`, and are
//! dispatched by matching on [`NemesisKind`]:
//! - **Bootstrapper**: restart one decommissioned node and wait for it to join.
//! - **Decommissioner**: remove one live node, never dropping below `rf` live.
//! - **Replayer**: replay the batch log on every live node.
//! - **FlushCompactor**: flush then compact every configured node on `start`.
//!
//! None of them hold state of their own. The only shared state is the
//! [`DecommissionedSet`](super::cluster::DecommissionedSet) in the context.
//!
//! # Invariants
//!
//! 1. **Replica floor**: the Decommissioner only acts when the shuffled
//!    eligible list has an element at index `rf`, i.e. more than `rf` nodes are
//!    live, and the insert itself re-checks the floor.
//! 2. **No double decommission**: already-decommissioned nodes are filtered out
//!    before selection and rejected by the insert.
//! 3. **Bootstrap source**: the Bootstrapper only starts a node it has just
//!    removed from the decommissioned set.

use std::thread;
use std::time::Instant;

use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::cluster::{ClusterContext, NodeId};
use super::error::{ChaosError, Result};
use super::lifecycle::NodeLifecycle;
use super::membership::MembershipTracker;
use super::operation::{Action, Operation};
use super::timing::JOIN_POLL_INTERVAL;

/// The closed set of fault actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NemesisKind {
    Bootstrapper,
    Decommissioner,
    Replayer,
    FlushCompactor,
}

impl NemesisKind {
    /// Prepare an action against the cluster in `ctx`.
    pub fn setup(self, ctx: &ClusterContext) -> Result<Nemesis> {
        debug!(kind = ?self, nodes = ctx.config.len(), rf = ctx.config.rf(), "nemesis set up");
        Ok(Nemesis {
            kind: self,
            ctx: ctx.clone(),
        })
    }
}

/// What an invocation did. Serialized into the operation's result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum NemesisOutcome {
    /// Precondition not met; nothing was touched.
    Noop { reason: String },
    Bootstrapped { node: NodeId },
    Decommissioned { node: NodeId },
    Replayed { nodes: Vec<NodeId> },
    FlushedCompacted { nodes: Vec<NodeId> },
}

fn noop(reason: impl Into<String>) -> NemesisOutcome {
    NemesisOutcome::Noop {
        reason: reason.into(),
    }
}

/// A set-up fault action.
pub struct Nemesis {
    kind: NemesisKind,
    ctx: ClusterContext,
}

impl Nemesis {
    pub fn invoke(&self, op: &Operation) -> Result<NemesisOutcome> {
        match self.kind {
            NemesisKind::Bootstrapper => self.bootstrap(),
            NemesisKind::Decommissioner => self.decommission(),
            NemesisKind::Replayer => self.replay(),
            NemesisKind::FlushCompactor => self.flush_compact(op),
        }
    }

    pub fn teardown(self) -> Result<()> {
        match self.kind {
            NemesisKind::Bootstrapper | NemesisKind::Decommissioner => {
                let remaining = self.ctx.decommissioned.snapshot();
                if !remaining.is_empty() {
                    info!(kind = ?self.kind, nodes = ?remaining, "nodes still decommissioned at teardown");
                }
            }
            NemesisKind::Replayer | NemesisKind::FlushCompactor => {}
        }
        Ok(())
    }

    fn bootstrap(&self) -> Result<NemesisOutcome> {
        let node = match self.ctx.decommissioned.pop_any(&mut rand::thread_rng()) {
            Some(node) => node,
            None => return Ok(noop("no decommissioned node to bootstrap")),
        };

        info!(node = %node, "bootstrapping");
        NodeLifecycle::new(&self.ctx).start(&node)?;
        self.await_join(&node)?;
        Ok(NemesisOutcome::Bootstrapped { node })
    }

    /// Poll until no reachable node reports `node` as joining.
    fn await_join(&self, node: &NodeId) -> Result<()> {
        let tracker = MembershipTracker::new(&self.ctx);
        let poll = self.ctx.scale.apply(JOIN_POLL_INTERVAL);
        let timeout = self.ctx.scale.apply(self.ctx.timeouts.join);
        let started = Instant::now();
        loop {
            if !tracker.joining_nodes().contains(node) {
                info!(node = %node, elapsed = ?started.elapsed(), "node joined");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(ChaosError::Timeout {
                    what: "bootstrap join",
                    node: node.clone(),
                    waited: started.elapsed(),
                });
            }
            debug!(node = %node, "still joining");
            thread::sleep(poll);
        }
    }

    fn decommission(&self) -> Result<NemesisOutcome> {
        let live = MembershipTracker::new(&self.ctx).live_nodes();
        let decommissioned = self.ctx.decommissioned.snapshot();
        let mut eligible: Vec<NodeId> = live
            .into_iter()
            .filter(|n| !decommissioned.contains(n))
            .collect();
        eligible.shuffle(&mut rand::thread_rng());

        let rf = self.ctx.config.rf();
        let node = match eligible.get(rf) {
            Some(node) => node.clone(),
            None => {
                return Ok(noop(format!(
                    "{} eligible live nodes cannot lose one with rf {}",
                    eligible.len(),
                    rf
                )))
            }
        };
        if !self.ctx.decommissioned.try_add(&node, &self.ctx.config) {
            return Ok(noop(format!("{} no longer eligible", node)));
        }

        info!(node = %node, "decommissioning");
        self.ctx.admin.exec(&node, &self.ctx.commands.decommission())?;
        Ok(NemesisOutcome::Decommissioned { node })
    }

    fn replay(&self) -> Result<NemesisOutcome> {
        let command = self.ctx.commands.replay_batchlog();
        let mut nodes = Vec::new();
        for node in MembershipTracker::new(&self.ctx).live_nodes() {
            match self.ctx.admin.exec(&node, &command) {
                Ok(_) => nodes.push(node),
                Err(e) => warn!(node = %node, error = %e, "batchlog replay failed"),
            }
        }
        info!(nodes = ?nodes, "batchlog replayed");
        Ok(NemesisOutcome::Replayed { nodes })
    }

    fn flush_compact(&self, op: &Operation) -> Result<NemesisOutcome> {
        match op.action {
            Action::Start | Action::FlushCompact => {}
            Action::Stop => return Ok(noop("flush and compaction leave nothing to undo")),
            other => return Ok(noop(format!("{:?} is not a flush/compact phase", other))),
        }

        let mut nodes = Vec::with_capacity(self.ctx.config.len());
        for node in self.ctx.config.nodes() {
            debug!(node = %node, "flushing");
            self.ctx.admin.exec(node, &self.ctx.commands.flush())?;
            debug!(node = %node, "compacting");
            self.ctx.admin.exec(node, &self.ctx.commands.compact())?;
            nodes.push(node.clone());
        }
        info!(nodes = ?nodes, "flushed and compacted");
        Ok(NemesisOutcome::FlushedCompacted { nodes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_json() {
        let outcome = NemesisOutcome::Decommissioned {
            node: NodeId::from("n4"),
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"outcome": "decommissioned", "node": "n4"})
        );
        assert_eq!(
            serde_json::to_value(noop("nothing")).unwrap(),
            json!({"outcome": "noop", "reason": "nothing"})
        );
    }
}

//! Routes scheduled nemesis operations to the action that handles them.

use serde_json::{json, Value};
use tracing::debug;

use super::clock::ClockNemesis;
use super::cluster::ClusterContext;
use super::error::Result;
use super::nemesis::{Nemesis, NemesisKind, NemesisOutcome};
use super::operation::{Action, Operation};

/// The sustained fault bracketed by each window's `start`/`stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WindowFault {
    /// Flush and compact every node on `start`.
    #[default]
    FlushCompact,
    /// Replay the batch log on every live node at both brackets.
    Replay,
    /// Brackets are recorded but do nothing.
    None,
}

/// Owns one instance of every fault action plus the clock collaborator.
pub struct Dispatcher {
    bootstrapper: Nemesis,
    decommissioner: Nemesis,
    replayer: Nemesis,
    flush_compactor: Nemesis,
    clock: ClockNemesis,
    window: WindowFault,
}

impl Dispatcher {
    pub fn setup(ctx: &ClusterContext, window: WindowFault, ntp_server: &str) -> Result<Self> {
        Ok(Dispatcher {
            bootstrapper: NemesisKind::Bootstrapper.setup(ctx)?,
            decommissioner: NemesisKind::Decommissioner.setup(ctx)?,
            replayer: NemesisKind::Replayer.setup(ctx)?,
            flush_compactor: NemesisKind::FlushCompactor.setup(ctx)?,
            clock: ClockNemesis::new(ctx.clone(), ntp_server),
            window,
        })
    }

    fn window_nemesis(&self) -> Option<&Nemesis> {
        match self.window {
            WindowFault::FlushCompact => Some(&self.flush_compactor),
            WindowFault::Replay => Some(&self.replayer),
            WindowFault::None => None,
        }
    }

    /// Execute one nemesis operation and return its result payload.
    pub fn invoke(&self, op: &Operation) -> Result<Value> {
        debug!(action = ?op.action, "dispatching");
        let outcome = match op.action {
            Action::Start | Action::Stop => match self.window_nemesis() {
                Some(nemesis) => nemesis.invoke(op)?,
                None => NemesisOutcome::Noop {
                    reason: "no window fault configured".into(),
                },
            },
            Action::Bootstrap => self.bootstrapper.invoke(op)?,
            Action::Decommission => self.decommissioner.invoke(op)?,
            Action::ReplayBatchlog => self.replayer.invoke(op)?,
            Action::FlushCompact => self.flush_compactor.invoke(op)?,
            Action::ClockReset | Action::ClockBump | Action::ClockStrobe => {
                return self.clock.invoke(op)
            }
            Action::Read | Action::Write | Action::Cas => {
                return Ok(json!({ "error": format!("{:?} is a client action", op.action) }))
            }
        };
        Ok(serde_json::to_value(outcome)?)
    }

    pub fn teardown(self) -> Result<()> {
        for nemesis in [
            self.bootstrapper,
            self.decommissioner,
            self.replayer,
            self.flush_compactor,
        ] {
            nemesis.teardown()?;
        }
        Ok(())
    }
}

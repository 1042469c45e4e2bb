//! Threaded schedule runner.
//!
//! Executes a [`Schedule`](super::schedule::Schedule) in wall-clock time. The
//! calling thread paces the steps; nemesis operations go to a single nemesis
//! thread that runs them one at a time, and client operations are shared out
//! over a bounded channel to one thread per client. The pacer never blocks on
//! that channel: a client step that finds every client busy and the queue full
//! is dropped, so slow clients cannot hold back fault injection.
//!
//! After the schedule the runner waits for every non-decommissioned node to be
//! reported live, then has each client read the register under the
//! [`AggressivePolicy`].
//!
//! # Invariants
//!
//! 1. **Sequential nemesis**: at most one nemesis operation runs at a time.
//! 2. **Bracketed history**: every operation handed to a worker is recorded as
//!    `invoke` before it runs and exactly once as `ok`, `fail` or `info` after.
//! 3. **Bounded main phase**: main-phase steps that come due after the time
//!    limit are skipped. Terminate steps always run.
//! 4. **Independent streams**: client back-pressure never delays a nemesis
//!    step.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, TrySendError};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::client::{completion_kind, final_read, Client, ClientOutcome};
use super::cluster::{ClusterContext, NodeId};
use super::dispatch::Dispatcher;
use super::error::{ChaosError, Result};
use super::history::{EntryKind, SharedHistory};
use super::membership::MembershipTracker;
use super::operation::Operation;
use super::retry::AggressivePolicy;
use super::schedule::{Phase, Process, Step};
use super::timing::CONVERGENCE_POLL_INTERVAL;

pub const NEMESIS_PROCESS: &str = "nemesis";

pub fn client_process(worker: usize) -> String {
    format!("client-{}", worker)
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Steps handed to a worker.
    pub dispatched: u64,
    /// Main-phase steps dropped because they came due after the time limit.
    pub skipped: u64,
    /// Client steps dropped because every client was busy.
    pub dropped: u64,
    /// Nodes that were live at the end of the run.
    pub converged: BTreeSet<NodeId>,
    /// One entry per client, in worker order.
    pub final_reads: Vec<(EntryKind, Value)>,
}

pub struct Runner {
    ctx: ClusterContext,
    dispatcher: Dispatcher,
    clients: Vec<Arc<dyn Client>>,
    history: SharedHistory,
    policy: AggressivePolicy,
    time_limit: Duration,
}

impl Runner {
    pub fn new(
        ctx: ClusterContext,
        dispatcher: Dispatcher,
        clients: Vec<Arc<dyn Client>>,
        history: SharedHistory,
        time_limit: Duration,
    ) -> Result<Self> {
        if clients.is_empty() {
            return Err(ChaosError::Config("at least one client is required".into()));
        }
        let policy = AggressivePolicy::new(ctx.scale);
        Ok(Runner {
            ctx,
            dispatcher,
            clients,
            history,
            policy,
            time_limit,
        })
    }

    /// Run `schedule` to completion, then verify.
    ///
    /// A fatal error from the final convergence wait is returned after the
    /// workers have stopped; everything recorded so far stays in the history.
    pub fn run(self, schedule: impl Iterator<Item = Step>) -> Result<RunReport> {
        let Runner {
            ctx,
            dispatcher,
            clients,
            history,
            policy,
            time_limit,
        } = self;

        let (nemesis_tx, nemesis_rx) = unbounded::<Operation>();
        let (client_tx, client_rx) = bounded::<Operation>(clients.len());

        let nemesis = spawn_nemesis(dispatcher, nemesis_rx, history.clone())?;
        let workers = clients
            .iter()
            .enumerate()
            .map(|(i, client)| spawn_client(i, client.clone(), client_rx.clone(), history.clone()))
            .collect::<Result<Vec<_>>>()?;
        drop(client_rx);

        let mut report = RunReport::default();
        let started = Instant::now();
        info!(?time_limit, clients = clients.len(), "running schedule");

        for step in schedule {
            let now = started.elapsed();
            if step.phase == Phase::Main && now > time_limit {
                report.skipped += 1;
                continue;
            }
            if step.at > now {
                thread::sleep(step.at - now);
            }

            let sent = match step.process {
                Process::Nemesis => nemesis_tx.send(step.op).is_ok(),
                Process::Client => match client_tx.try_send(step.op) {
                    Ok(()) => true,
                    Err(TrySendError::Full(op)) => {
                        debug!(action = ?op.action, "all clients busy; dropping step");
                        report.dropped += 1;
                        continue;
                    }
                    Err(TrySendError::Disconnected(_)) => false,
                },
            };
            if !sent {
                warn!(process = ?step.process, "worker gone; stopping schedule");
                break;
            }
            report.dispatched += 1;
        }
        drop(nemesis_tx);
        drop(client_tx);

        // Join everything before reporting a panic so the dispatcher is
        // always torn down.
        let mut panicked = None;
        for (i, worker) in workers.into_iter().enumerate() {
            if worker.join().is_err() {
                error!(process = %client_process(i), "client thread panicked");
                panicked.get_or_insert_with(|| ChaosError::Panicked(client_process(i)));
            }
        }
        let dispatcher = nemesis
            .join()
            .map_err(|_| ChaosError::Panicked(NEMESIS_PROCESS.into()))?;
        dispatcher.teardown()?;
        if let Some(e) = panicked {
            return Err(e);
        }

        info!(
            dispatched = report.dispatched,
            skipped = report.skipped,
            dropped = report.dropped,
            elapsed = ?started.elapsed(),
            "schedule finished"
        );

        report.converged = wait_for_convergence(&ctx)?;
        report.final_reads = clients
            .iter()
            .enumerate()
            .map(|(i, client)| final_read_for(i, client.as_ref(), &policy, &history))
            .collect();
        Ok(report)
    }
}

fn spawn_nemesis(
    dispatcher: Dispatcher,
    rx: Receiver<Operation>,
    history: SharedHistory,
) -> Result<JoinHandle<Dispatcher>> {
    let handle = thread::Builder::new()
        .name(NEMESIS_PROCESS.into())
        .spawn(move || {
            for op in rx.iter() {
                history.record(NEMESIS_PROCESS, EntryKind::Invoke, op.action, op.payload.clone());
                let result = match dispatcher.invoke(&op) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(action = ?op.action, error = %e, "nemesis operation failed");
                        json!({ "error": e.to_string() })
                    }
                };
                history.record(NEMESIS_PROCESS, EntryKind::Info, op.action, result);
            }
            dispatcher
        })?;
    Ok(handle)
}

fn spawn_client(
    worker: usize,
    client: Arc<dyn Client>,
    rx: Receiver<Operation>,
    history: SharedHistory,
) -> Result<JoinHandle<()>> {
    let process = client_process(worker);
    let handle = thread::Builder::new().name(process.clone()).spawn(move || {
        for op in rx.iter() {
            history.record(process.as_str(), EntryKind::Invoke, op.action, op.payload.clone());
            let (kind, payload) = complete(client.invoke(&op), &op);
            history.record(process.as_str(), kind, op.action, payload);
        }
    })?;
    Ok(handle)
}

/// History kind and payload for a client result.
fn complete(result: Result<ClientOutcome>, op: &Operation) -> (EntryKind, Value) {
    match result {
        Ok(ClientOutcome::Ok(value)) => (EntryKind::Ok, value),
        Ok(ClientOutcome::Fail(value)) => (EntryKind::Fail, value),
        Err(e) => {
            debug!(action = ?op.action, error = %e, "client operation failed");
            (
                completion_kind(op.action, &e),
                json!({ "value": op.payload, "error": e.to_string() }),
            )
        }
    }
}

fn final_read_for(
    worker: usize,
    client: &dyn Client,
    policy: &AggressivePolicy,
    history: &SharedHistory,
) -> (EntryKind, Value) {
    let process = client_process(worker);
    let op = final_read();
    history.record(process.as_str(), EntryKind::Invoke, op.action, op.payload.clone());
    let (kind, payload) = complete(policy.run(|| client.invoke(&op)), &op);
    history.record(process.as_str(), kind, op.action, payload.clone());
    (kind, payload)
}

/// Wait until every node outside the decommissioned set is reported live.
///
/// Fails with the fatal [`ChaosError::NotConverged`] once the scaled
/// convergence timeout has passed.
pub fn wait_for_convergence(ctx: &ClusterContext) -> Result<BTreeSet<NodeId>> {
    let tracker = MembershipTracker::new(ctx);
    let poll = ctx.scale.apply(CONVERGENCE_POLL_INTERVAL);
    let timeout = ctx.scale.apply(ctx.timeouts.convergence);
    let started = Instant::now();
    loop {
        let decommissioned = ctx.decommissioned.snapshot();
        let expected: BTreeSet<NodeId> = ctx
            .config
            .nodes()
            .iter()
            .filter(|n| !decommissioned.contains(*n))
            .cloned()
            .collect();
        let live = tracker.live_nodes();
        let missing: Vec<NodeId> = expected.difference(&live).cloned().collect();

        if missing.is_empty() {
            info!(nodes = ?expected, elapsed = ?started.elapsed(), "cluster converged");
            return Ok(expected);
        }
        if started.elapsed() >= timeout {
            error!(missing = ?missing, "cluster did not converge");
            return Err(ChaosError::NotConverged {
                missing,
                waited: started.elapsed(),
            });
        }
        debug!(missing = ?missing, "waiting for convergence");
        thread::sleep(poll);
    }
}

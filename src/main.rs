mod chaos;
mod settings;
mod trace;

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info, warn};

use chaos::{
    ChaosError, Client, ClusterContext, CqlshClient, DatabaseKnobs, Dispatcher, NodeLifecycle,
    Operation, Provisioner, RegisterWorkload, RunReport, Runner, Schedule, SharedHistory,
};
use settings::{Cli, Command, PlanArgs, RunArgs};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    trace::init(cli.log_format)?;

    match &cli.command {
        Command::Plan(args) => plan(args),
        Command::Run(args) => run(args),
    }
}

/// Print the merged schedule as JSON lines.
fn plan(args: &PlanArgs) -> anyhow::Result<()> {
    args.schedule.validate()?;
    let mut rng = args.schedule.rng();
    let clients: Box<dyn Iterator<Item = Operation>> = if args.faults_only {
        Box::new(std::iter::empty())
    } else {
        Box::new(RegisterWorkload::new(StdRng::seed_from_u64(rng.gen())))
    };
    let schedule = Schedule::new(&args.schedule.schedule_options(), clients, rng);

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for step in schedule {
        serde_json::to_writer(&mut out, &step)?;
        writeln!(out)?;
    }
    Ok(())
}

fn run(args: &RunArgs) -> anyhow::Result<()> {
    args.validate()?;
    let ctx = args.context()?;
    info!(nodes = ?ctx.config.nodes(), rf = ctx.config.rf(), scale = ctx.scale.factor(), "starting test");

    let report = with_teardown(&ctx, args.leave_running, || execute(args, &ctx))?;
    info!(
        dispatched = report.dispatched,
        skipped = report.skipped,
        dropped = report.dropped,
        converged = ?report.converged,
        final_reads = ?report.final_reads,
        "test complete"
    );
    Ok(())
}

/// Everything between resolving the cluster and tearing it down.
fn execute(args: &RunArgs, ctx: &ClusterContext) -> anyhow::Result<RunReport> {
    setup_nodes(ctx, &args.provisioner(), &args.knobs())?;

    let clients = (0..args.concurrency)
        .map(|i| CqlshClient::for_worker(ctx, i).map(|c| Arc::new(c) as Arc<dyn Client>))
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(client) = clients.first() {
        client.setup()?;
    }

    let mut rng = args.schedule.rng();
    let workload = RegisterWorkload::new(StdRng::seed_from_u64(rng.gen()));
    let opts = args.schedule.schedule_options();
    let schedule = Schedule::new(&opts, workload, rng);

    let history = SharedHistory::new();
    let dispatcher = Dispatcher::setup(ctx, args.window, &args.ntp_server)?;
    let runner = Runner::new(ctx.clone(), dispatcher, clients, history.clone(), opts.time_limit)?;
    let result = runner.run(schedule);

    if let Some(path) = &args.history {
        history.write_jsonl(path)?;
        info!(path = %path.display(), entries = history.len(), "history written");
    }
    Ok(result?)
}

/// Run `body`, then tear the cluster down. A fatal error leaves the cluster in
/// place for inspection.
fn with_teardown<T>(
    ctx: &ClusterContext,
    leave_running: bool,
    body: impl FnOnce() -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    match body() {
        Ok(value) => {
            teardown_nodes(ctx, leave_running)?;
            Ok(value)
        }
        Err(e) if is_fatal(&e) => {
            error!(error = %e, "fatal error; leaving cluster in place for inspection");
            Err(e)
        }
        Err(e) => {
            if let Err(teardown) = teardown_nodes(ctx, leave_running) {
                warn!(error = %teardown, "teardown after failed test also failed");
            }
            Err(e)
        }
    }
}

fn is_fatal(e: &anyhow::Error) -> bool {
    e.downcast_ref::<ChaosError>().map_or(false, ChaosError::is_fatal)
}

/// Bring every node up concurrently so the startup stagger applies.
fn setup_nodes(
    ctx: &ClusterContext,
    provisioner: &dyn Provisioner,
    knobs: &DatabaseKnobs,
) -> anyhow::Result<()> {
    thread::scope(|s| {
        let handles: Vec<_> = ctx
            .config
            .nodes()
            .iter()
            .map(|node| {
                let handle = s.spawn(move || NodeLifecycle::new(ctx).setup(node, provisioner, knobs));
                (node, handle)
            })
            .collect();
        for (node, handle) in handles {
            handle
                .join()
                .map_err(|_| ChaosError::Panicked(format!("setup {}", node)))??;
        }
        Ok(())
    })
}

fn teardown_nodes(ctx: &ClusterContext, leave_running: bool) -> anyhow::Result<()> {
    let lifecycle = NodeLifecycle::new(ctx);
    let mut first_error = None;
    for node in ctx.config.nodes() {
        if let Err(e) = lifecycle.teardown(node, leave_running) {
            warn!(node = %node, error = %e, "teardown failed");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Mutex;

    use crate::chaos::cluster::NodeId;
    use crate::chaos::{
        Admin, ClusterConfig, Commands, DecommissionedSet, NodetoolProbe, Scale,
        ScriptProvisioner, Timeouts,
    };

    /// Records every command. Configure scripts fail and no process is ever
    /// found running.
    #[derive(Default)]
    struct RecordingAdmin {
        log: Mutex<Vec<(NodeId, String)>>,
    }

    impl Admin for RecordingAdmin {
        fn exec(&self, node: &NodeId, command: &str) -> crate::chaos::error::Result<String> {
            self.log.lock().unwrap().push((node.clone(), command.to_string()));
            if command.contains("configure.sh") || command == Commands::default().is_running() {
                return Err(ChaosError::Command {
                    node: node.clone(),
                    command: command.to_string(),
                    status: 1,
                    stderr: String::new(),
                });
            }
            Ok(String::new())
        }
    }

    fn context(admin: &Arc<RecordingAdmin>) -> ClusterContext {
        let members = (1..=3)
            .map(|i| {
                let addr: IpAddr = format!("10.0.0.{}", i).parse().unwrap();
                (NodeId::new(format!("n{}", i)), addr)
            })
            .collect();
        let commands = Commands::default();
        ClusterContext {
            config: Arc::new(ClusterConfig::new(members, 3).unwrap()),
            decommissioned: DecommissionedSet::new(),
            admin: admin.clone(),
            probe: Arc::new(NodetoolProbe::new(admin.clone(), commands.clone())),
            commands,
            scale: Scale::new(0.001),
            timeouts: Timeouts::default(),
        }
    }

    fn wiped(admin: &RecordingAdmin) -> Vec<NodeId> {
        let wipe = Commands::default().wipe();
        admin
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| *c == wipe)
            .map(|(n, _)| n.clone())
            .collect()
    }

    #[test]
    fn test_failed_setup_still_tears_down() {
        let admin = Arc::new(RecordingAdmin::default());
        let ctx = context(&admin);
        let provisioner = ScriptProvisioner {
            install_script: None,
            configure_script: Some("./configure.sh".into()),
        };

        let err = with_teardown(&ctx, false, || {
            setup_nodes(&ctx, &provisioner, &DatabaseKnobs::default())
        })
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ChaosError>(),
            Some(ChaosError::Command { .. })
        ));

        let mut wiped = wiped(&admin);
        wiped.sort();
        assert_eq!(wiped, ctx.config.nodes().to_vec());
    }

    #[test]
    fn test_leave_running_skips_wipe() {
        let admin = Arc::new(RecordingAdmin::default());
        let ctx = context(&admin);
        with_teardown(&ctx, true, || Ok(())).unwrap();
        assert!(admin.log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_fatal_error_leaves_cluster_in_place() {
        let admin = Arc::new(RecordingAdmin::default());
        let ctx = context(&admin);
        let err = with_teardown::<()>(&ctx, false, || {
            Err(ChaosError::NotConverged {
                missing: vec![NodeId::from("n3")],
                waited: std::time::Duration::from_secs(1),
            }
            .into())
        })
        .unwrap_err();
        assert!(is_fatal(&err));
        assert!(wiped(&admin).is_empty());
    }
}

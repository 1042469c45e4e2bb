//! Command-line configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::chaos::{
    Admin, ClusterConfig, ClusterContext, Commands, DatabaseKnobs, DecommissionedSet, FaultOptions,
    LocalAdmin, NodetoolProbe, Scale, ScheduleOptions, ScriptProvisioner, SshAdmin, Timeouts,
    WindowFault, DEFAULT_MANAGEMENT_PORT, DEFAULT_NTP_SERVER,
};

/// Smallest accepted `--scale`. Below this, scaled window sleeps round to zero
/// and the fault stream stops advancing.
pub const MIN_SCALE: f64 = 1e-4;

/// Largest accepted `--scale`.
pub const MAX_SCALE: f64 = 1e6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "chr-nemesis")]
#[command(about = "Fault-injection harness for a replicated peer-to-peer database")]
#[command(version)]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the schedule as JSON lines without touching a cluster
    Plan(PlanArgs),
    /// Set up the cluster, run the schedule, verify and tear down
    Run(RunArgs),
}

/// Options shared by `plan` and `run`.
#[derive(Args, Debug, Clone)]
pub struct ScheduleArgs {
    /// Add decommission to the extra fault set
    #[arg(long)]
    pub decommission: bool,

    /// Add bootstrap to the extra fault set
    #[arg(long)]
    pub bootstrap: bool,

    /// Add clock resets and bumps to the extra fault set
    #[arg(long)]
    pub clock: bool,

    /// Add clock strobes to the extra fault set
    #[arg(long)]
    pub clock_strobe: bool,

    /// Wall-clock length of the main phase in seconds
    #[arg(long, default_value_t = 360)]
    pub time_limit: u64,

    /// Multiplier for every sleep, stagger, poll interval and timeout
    #[arg(long, default_value_t = 1.0)]
    pub scale: f64,

    /// Mean gap between client operations in milliseconds
    #[arg(long, default_value_t = 100)]
    pub stagger_ms: u64,

    /// Seed for the schedule; random when absent
    #[arg(long)]
    pub seed: Option<u64>,
}

impl ScheduleArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.scale.is_finite() || self.scale < MIN_SCALE || self.scale > MAX_SCALE {
            bail!("--scale must be between {} and {}", MIN_SCALE, MAX_SCALE);
        }
        if self.stagger_ms == 0 {
            bail!("--stagger-ms must be positive");
        }
        Ok(())
    }

    pub fn scale(&self) -> Scale {
        Scale::new(self.scale)
    }

    pub fn fault_options(&self) -> FaultOptions {
        FaultOptions {
            decommission: self.decommission,
            bootstrap: self.bootstrap,
            clock: self.clock,
            clock_strobe: self.clock_strobe,
            scale: self.scale(),
        }
    }

    pub fn schedule_options(&self) -> ScheduleOptions {
        ScheduleOptions {
            faults: self.fault_options(),
            time_limit: Duration::from_secs(self.time_limit),
            client_stagger: Duration::from_millis(self.stagger_ms),
        }
    }

    pub fn rng(&self) -> StdRng {
        match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    #[command(flatten)]
    pub schedule: ScheduleArgs,

    /// Leave client operations out of the plan
    #[arg(long)]
    pub faults_only: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub schedule: ScheduleArgs,

    /// Cluster members as `host` or `host=address`, in startup order
    #[arg(long = "node", required = true, value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Replication factor of the test keyspace
    #[arg(long, default_value_t = 3)]
    pub rf: usize,

    /// Number of concurrent clients
    #[arg(long, default_value_t = 5)]
    pub concurrency: usize,

    /// Fault bracketed by each window's start and stop
    #[arg(long, value_enum, default_value_t = WindowFault::FlushCompact)]
    pub window: WindowFault,

    /// Run every command through the local shell instead of ssh
    #[arg(long)]
    pub local: bool,

    #[arg(long, default_value = "root")]
    pub ssh_user: String,

    #[arg(long)]
    pub ssh_key: Option<PathBuf>,

    /// Database management port queried by nodetool
    #[arg(long, default_value_t = DEFAULT_MANAGEMENT_PORT)]
    pub management_port: u16,

    #[arg(long, default_value = "~/cassandra")]
    pub install_dir: String,

    /// Script run on each node to install the database
    #[arg(long)]
    pub install_script: Option<String>,

    /// Script run on each node to write its configuration
    #[arg(long)]
    pub configure_script: Option<String>,

    #[arg(long)]
    pub commitlog_compression: bool,

    #[arg(long)]
    pub disable_coordinator_batchlog: bool,

    /// Failure detector conviction threshold
    #[arg(long, default_value_t = 8)]
    pub phi_level: u32,

    #[arg(long)]
    pub disable_hinted_handoff: bool,

    /// Leave nodes running after the test instead of wiping them
    #[arg(long)]
    pub leave_running: bool,

    /// Write the operation history here as JSON lines
    #[arg(long)]
    pub history: Option<PathBuf>,

    #[arg(long, default_value = DEFAULT_NTP_SERVER)]
    pub ntp_server: String,
}

impl RunArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.schedule.validate()?;
        if self.concurrency == 0 {
            bail!("--concurrency must be positive");
        }
        if self.rf == 0 {
            bail!("--rf must be positive");
        }
        Ok(())
    }

    pub fn knobs(&self) -> DatabaseKnobs {
        DatabaseKnobs {
            commitlog_compression: self.commitlog_compression,
            disable_coordinator_batchlog: self.disable_coordinator_batchlog,
            phi_convict_threshold: self.phi_level,
            hinted_handoff: !self.disable_hinted_handoff,
        }
    }

    pub fn commands(&self) -> Commands {
        Commands::new(self.install_dir.as_str(), self.management_port)
    }

    pub fn admin(&self) -> Arc<dyn Admin> {
        if self.local {
            Arc::new(LocalAdmin)
        } else {
            Arc::new(SshAdmin::new(self.ssh_user.as_str(), self.ssh_key.clone()))
        }
    }

    pub fn provisioner(&self) -> ScriptProvisioner {
        ScriptProvisioner {
            install_script: self.install_script.clone(),
            configure_script: self.configure_script.clone(),
        }
    }

    /// Resolve the node list and assemble the shared cluster context.
    pub fn context(&self) -> anyhow::Result<ClusterContext> {
        let config = ClusterConfig::resolve(&self.nodes, self.rf)
            .context("resolving cluster members")?;
        let admin = self.admin();
        let commands = self.commands();
        Ok(ClusterContext {
            config: Arc::new(config),
            decommissioned: DecommissionedSet::new(),
            probe: Arc::new(NodetoolProbe::new(admin.clone(), commands.clone())),
            admin,
            commands,
            scale: self.schedule.scale(),
            timeouts: Timeouts::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("chr-nemesis").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_run_defaults() {
        let cli = parse(&["run", "--node", "n1=10.0.0.1,n2=10.0.0.2,n3=10.0.0.3"]);
        assert_eq!(cli.log_format, LogFormat::Text);
        let args = match cli.command {
            Command::Run(args) => args,
            other => panic!("unexpected command {:?}", other),
        };
        args.validate().unwrap();
        assert_eq!(args.nodes.len(), 3);
        assert_eq!(args.rf, 3);
        assert_eq!(args.concurrency, 5);
        assert_eq!(args.window, WindowFault::FlushCompact);
        assert_eq!(args.management_port, 7199);
        assert_eq!(args.knobs(), DatabaseKnobs::default());
        assert_eq!(args.commands().install_dir(), "~/cassandra");

        let opts = args.schedule.schedule_options();
        assert_eq!(opts.time_limit, Duration::from_secs(360));
        assert_eq!(opts.client_stagger, Duration::from_millis(100));
        assert!(!opts.faults.clock_enabled());

        let ctx = args.context().unwrap();
        assert_eq!(ctx.config.len(), 3);
        assert!(ctx.decommissioned.is_empty());
    }

    #[test]
    fn test_fault_flags_and_window() {
        let cli = parse(&[
            "--log-format",
            "json",
            "run",
            "--node",
            "a=10.0.0.1",
            "--node",
            "b=10.0.0.2",
            "--rf",
            "1",
            "--decommission",
            "--clock-strobe",
            "--window",
            "replay",
            "--disable-hinted-handoff",
            "--scale",
            "0.01",
        ]);
        assert_eq!(cli.log_format, LogFormat::Json);
        let args = match cli.command {
            Command::Run(args) => args,
            other => panic!("unexpected command {:?}", other),
        };
        assert_eq!(args.nodes, vec!["a=10.0.0.1", "b=10.0.0.2"]);
        assert_eq!(args.window, WindowFault::Replay);
        assert!(!args.knobs().hinted_handoff);

        let faults = args.schedule.fault_options();
        assert!(faults.decommission && faults.clock_strobe);
        assert!(!faults.bootstrap);
        assert_eq!(faults.scale.factor(), 0.01);
    }

    #[test]
    fn test_validate_rejects_degenerate_timing() {
        let cli = parse(&["plan", "--scale", "0"]);
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        assert!(args.schedule.validate().is_err());

        let cli = parse(&["plan", "--scale", "1e30"]);
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        assert!(args.schedule.validate().is_err());

        let cli = parse(&["plan", "--scale", "1000000"]);
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        args.schedule.validate().unwrap();

        let cli = parse(&["plan", "--stagger-ms", "0"]);
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        assert!(args.schedule.validate().is_err());
    }

    #[test]
    fn test_run_requires_nodes() {
        assert!(Cli::try_parse_from(["chr-nemesis", "run"]).is_err());
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        use rand::Rng;
        let cli = parse(&["plan", "--seed", "42"]);
        let Command::Plan(args) = cli.command else {
            panic!("expected plan");
        };
        let a: u64 = args.schedule.rng().gen();
        let b: u64 = args.schedule.rng().gen();
        assert_eq!(a, b);
    }
}

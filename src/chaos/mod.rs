pub mod admin;
pub mod client;
pub mod clock;
pub mod cluster;
pub mod dispatch;
pub mod error;
pub mod history;
pub mod lifecycle;
pub mod membership;
pub mod nemesis;
pub mod operation;
pub mod retry;
pub mod runner;
pub mod schedule;
pub mod timing;


pub use admin::{Admin, Commands, LocalAdmin, SshAdmin, DEFAULT_MANAGEMENT_PORT};
pub use client::{Client, CqlshClient, RegisterWorkload};
pub use clock::DEFAULT_NTP_SERVER;
pub use cluster::{ClusterConfig, ClusterContext, DecommissionedSet};
pub use dispatch::{Dispatcher, WindowFault};
pub use error::ChaosError;
pub use history::SharedHistory;
pub use lifecycle::{DatabaseKnobs, NodeLifecycle, Provisioner, ScriptProvisioner};
pub use membership::NodetoolProbe;
pub use operation::Operation;
pub use runner::{RunReport, Runner};
pub use schedule::{FaultOptions, Schedule, ScheduleOptions};
pub use timing::{Scale, Timeouts};

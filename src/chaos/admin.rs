//! Administrative command interface.
//!
//! The harness never talks to a node directly: every action is a shell command
//! executed on the target through an [`Admin`] transport. [`Commands`] is the
//! catalog of the commands the core issues, so transports and test doubles
//! agree on the exact text.

use std::path::PathBuf;
use std::process::{Command, Output};

use tracing::{debug, trace};

use super::cluster::NodeId;
use super::error::{ChaosError, Result};

/// Default management (JMX) port queried by `nodetool`.
pub const DEFAULT_MANAGEMENT_PORT: u16 = 7199;

/// Executes a command on a node and returns its standard output.
pub trait Admin: Send + Sync {
    fn exec(&self, node: &NodeId, command: &str) -> Result<String>;
}

fn collect(node: &NodeId, command: &str, output: std::io::Result<Output>) -> Result<String> {
    let output = output.map_err(|source| ChaosError::Transport {
        node: node.clone(),
        source,
    })?;
    if output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        trace!(node = %node, command, bytes = stdout.len(), "command succeeded");
        Ok(stdout)
    } else {
        Err(ChaosError::Command {
            node: node.clone(),
            command: command.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Runs commands over `ssh` as a fixed user. The node id is the ssh hostname.
#[derive(Debug, Clone)]
pub struct SshAdmin {
    user: String,
    identity: Option<PathBuf>,
}

impl SshAdmin {
    pub fn new(user: impl Into<String>, identity: Option<PathBuf>) -> Self {
        SshAdmin {
            user: user.into(),
            identity,
        }
    }
}

impl Admin for SshAdmin {
    fn exec(&self, node: &NodeId, command: &str) -> Result<String> {
        debug!(node = %node, command, "ssh");
        let mut ssh = Command::new("ssh");
        ssh.args(["-o", "BatchMode=yes", "-o", "StrictHostKeyChecking=no"]);
        if let Some(identity) = &self.identity {
            ssh.arg("-i").arg(identity);
        }
        ssh.arg(format!("{}@{}", self.user, node)).arg("--").arg(command);
        collect(node, command, ssh.output())
    }
}

/// Runs commands through the local shell regardless of target node.
///
/// Useful when every "node" lives on the machine running the harness.
#[derive(Debug, Clone, Default)]
pub struct LocalAdmin;

impl Admin for LocalAdmin {
    fn exec(&self, node: &NodeId, command: &str) -> Result<String> {
        debug!(node = %node, command, "sh");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("CHR_NODE", node.as_str())
            .output();
        collect(node, command, output)
    }
}

/// The command text for every remote operation the core performs.
#[derive(Debug, Clone)]
pub struct Commands {
    install_dir: String,
    management_port: u16,
}

impl Commands {
    pub fn new(install_dir: impl Into<String>, management_port: u16) -> Self {
        Commands {
            install_dir: install_dir.into().trim_end_matches('/').to_string(),
            management_port,
        }
    }

    pub fn install_dir(&self) -> &str {
        &self.install_dir
    }

    pub fn management_port(&self) -> u16 {
        self.management_port
    }

    fn nodetool(&self, args: &str) -> String {
        format!("{}/bin/nodetool -p {} {}", self.install_dir, self.management_port, args)
    }

    /// Start the database daemon in the background.
    pub fn start(&self) -> String {
        format!("{}/bin/cassandra -R", self.install_dir)
    }

    /// Ask the daemon to terminate. Exits non-zero when nothing matched.
    pub fn stop(&self) -> String {
        "pkill -f '[C]assandraDaemon'".to_string()
    }

    /// Exits 0 while the daemon is in the process table, 1 once it is gone.
    pub fn is_running(&self) -> String {
        "pgrep -f '[C]assandraDaemon'".to_string()
    }

    /// Every directory holding persisted node state.
    pub fn state_dirs(&self) -> Vec<String> {
        ["logs", "data", "hints", "commitlog", "saved_caches"]
            .iter()
            .map(|dir| format!("{}/{}", self.install_dir, dir))
            .collect()
    }

    /// Remove every state directory in one command.
    pub fn wipe(&self) -> String {
        format!("rm -rf {}", self.state_dirs().join(" "))
    }

    pub fn status(&self) -> String {
        self.nodetool("status")
    }

    pub fn decommission(&self) -> String {
        self.nodetool("decommission")
    }

    pub fn replay_batchlog(&self) -> String {
        self.nodetool("replaybatchlog")
    }

    pub fn flush(&self) -> String {
        self.nodetool("flush")
    }

    pub fn compact(&self) -> String {
        self.nodetool("compact")
    }
}

impl Default for Commands {
    fn default() -> Self {
        Commands::new("~/cassandra", DEFAULT_MANAGEMENT_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodetool_commands_use_management_port() {
        let commands = Commands::new("/opt/db/", 7299);
        assert_eq!(commands.install_dir(), "/opt/db");
        assert_eq!(commands.status(), "/opt/db/bin/nodetool -p 7299 status");
        assert_eq!(commands.decommission(), "/opt/db/bin/nodetool -p 7299 decommission");
        assert_eq!(commands.replay_batchlog(), "/opt/db/bin/nodetool -p 7299 replaybatchlog");
    }

    #[test]
    fn test_wipe_covers_every_state_dir() {
        let commands = Commands::default();
        let wipe = commands.wipe();
        for dir in ["logs", "data", "hints", "commitlog", "saved_caches"] {
            assert!(wipe.contains(&format!("~/cassandra/{}", dir)), "missing {}", dir);
        }
    }

    #[test]
    fn test_local_admin_reports_exit_status() {
        let admin = LocalAdmin;
        let node = NodeId::from("local");
        assert_eq!(admin.exec(&node, "echo hello").unwrap(), "hello\n");

        let err = admin.exec(&node, "echo oops >&2; exit 3").unwrap_err();
        assert_eq!(err.exit_status(), Some(3));
        match err {
            ChaosError::Command { stderr, .. } => assert_eq!(stderr, "oops"),
            other => panic!("unexpected error {:?}", other),
        }
    }
}

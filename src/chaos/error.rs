//! Error types for the chaos harness.

use std::io;
use std::time::Duration;

use thiserror::Error;

use super::cluster::NodeId;
use super::retry::QueryFailure;

/// Errors raised by the harness core and its collaborators.
#[derive(Debug, Error)]
pub enum ChaosError {
    /// A remote command ran but exited unsuccessfully.
    #[error("command `{command}` on {node} exited with status {status}: {stderr}")]
    Command {
        node: NodeId,
        command: String,
        status: i32,
        stderr: String,
    },

    /// A remote command could not be executed at all.
    #[error("could not run command on {node}: {source}")]
    Transport {
        node: NodeId,
        #[source]
        source: io::Error,
    },

    /// A bounded polling loop gave up.
    #[error("timed out after {waited:?} waiting for {what} on {node}")]
    Timeout {
        what: &'static str,
        node: NodeId,
        waited: Duration,
    },

    /// The cluster did not report every member up before the final reads.
    #[error("cluster did not converge within {waited:?}; not live: {missing:?}")]
    NotConverged {
        missing: Vec<NodeId>,
        waited: Duration,
    },

    /// A node that is not part of the configured cluster.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// A configured hostname could not be mapped to an address.
    #[error("could not resolve an address for {host}")]
    Resolve { host: String },

    /// The cluster configuration violates one of its invariants.
    #[error("invalid cluster configuration: {0}")]
    Config(String),

    /// A client query failed inside the database.
    #[error("query failed ({failure:?}): {message}")]
    Query {
        failure: QueryFailure,
        message: String,
    },

    /// The aggressive retry policy gave up on a query.
    #[error("escalated after {attempts} attempts: {failure:?}")]
    Escalated { attempts: u32, failure: QueryFailure },

    /// A worker thread panicked.
    #[error("{0} thread panicked")]
    Panicked(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl ChaosError {
    /// Fatal errors abort the run and leave the cluster as-is for inspection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChaosError::NotConverged { .. } | ChaosError::Config(_))
    }

    /// The exit status of a failed remote command, if this is one.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            ChaosError::Command { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChaosError>;

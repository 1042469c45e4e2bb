//! Client workload: a single compare-and-set register.
//!
//! The workload generator produces an endless mix of `read`, `write` and `cas`
//! operations over the values `0..5`. Clients execute them against the
//! database through `cqlsh` and classify server errors into [`QueryFailure`]
//! so the runner and the retry policy can tell them apart.

use std::net::IpAddr;
use std::sync::Arc;

use rand::Rng;
use serde_json::{json, Value};
use tracing::debug;

use super::admin::{Admin, Commands};
use super::cluster::{ClusterContext, NodeId};
use super::error::{ChaosError, Result};
use super::history::EntryKind;
use super::operation::{Action, Operation};
use super::retry::QueryFailure;

/// Register values are drawn from `0..REGISTER_VALUES`.
pub const REGISTER_VALUES: i64 = 5;

pub const KEYSPACE: &str = "jepsen_keyspace";
pub const TABLE: &str = "lwt";

/// Definite result of a client operation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOutcome {
    /// Applied; carries the observed value.
    Ok(Value),
    /// Definitely not applied, e.g. a cas whose expected value did not match.
    Fail(Value),
}

/// Executes client operations against one node.
pub trait Client: Send + Sync {
    /// One-time preparation before the workload starts, such as schema creation.
    fn setup(&self) -> Result<()> {
        Ok(())
    }

    fn invoke(&self, op: &Operation) -> Result<ClientOutcome>;
}

/// Endless uniform mix of register operations.
pub struct RegisterWorkload<R> {
    rng: R,
}

impl<R: Rng> RegisterWorkload<R> {
    pub fn new(rng: R) -> Self {
        RegisterWorkload { rng }
    }
}

impl<R: Rng> Iterator for RegisterWorkload<R> {
    type Item = Operation;

    fn next(&mut self) -> Option<Operation> {
        let op = match self.rng.gen_range(0..3) {
            0 => Operation::invoke(Action::Read),
            1 => Operation::invoke(Action::Write)
                .with_payload(json!(self.rng.gen_range(0..REGISTER_VALUES))),
            _ => Operation::invoke(Action::Cas).with_payload(json!([
                self.rng.gen_range(0..REGISTER_VALUES),
                self.rng.gen_range(0..REGISTER_VALUES)
            ])),
        };
        Some(op)
    }
}

/// The read each client performs once faults have ceased.
pub fn final_read() -> Operation {
    Operation::invoke(Action::Read)
}

/// History kind for a client operation that returned an error.
///
/// Reads never change state and unavailable errors are raised before any
/// replica is touched, so both are definite failures. Anything else may or may
/// not have been applied.
pub fn completion_kind(action: Action, err: &ChaosError) -> EntryKind {
    match err {
        ChaosError::Query {
            failure: QueryFailure::Unavailable,
            ..
        }
        | ChaosError::Escalated {
            failure: QueryFailure::Unavailable,
            ..
        } => EntryKind::Fail,
        _ if action == Action::Read => EntryKind::Fail,
        _ => EntryKind::Info,
    }
}

/// Map cqlsh error text to a failure class.
pub fn classify(message: &str) -> QueryFailure {
    if message.contains("ReadTimeout") || message.contains("Read timeout") {
        QueryFailure::ReadTimeout
    } else if message.contains("WriteTimeout") || message.contains("Write timeout") {
        QueryFailure::WriteTimeout
    } else if message.contains("Unavailable") {
        QueryFailure::Unavailable
    } else {
        QueryFailure::Other
    }
}

/// First data line of a cqlsh result table, if any.
fn first_row(output: &str) -> Option<&str> {
    let mut lines = output
        .lines()
        .map(str::trim)
        .skip_while(|l| !l.starts_with("---"));
    lines.next()?;
    lines
        .next()
        .filter(|l| !l.is_empty() && !l.starts_with('('))
}

fn malformed(output: &str) -> ChaosError {
    ChaosError::Query {
        failure: QueryFailure::Other,
        message: format!("unexpected cqlsh output: {}", output.trim()),
    }
}

/// Parse the output of `SELECT value ...` into a JSON integer or null.
pub fn parse_read(output: &str) -> Result<Value> {
    match first_row(output) {
        None => Ok(Value::Null),
        Some("null") => Ok(Value::Null),
        Some(cell) => cell
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| malformed(output)),
    }
}

/// Parse the `[applied]` column of a conditional update.
pub fn parse_applied(output: &str) -> Result<bool> {
    let row = first_row(output).ok_or_else(|| malformed(output))?;
    match row.split('|').next().map(str::trim) {
        Some("True") => Ok(true),
        Some("False") => Ok(false),
        _ => Err(malformed(output)),
    }
}

/// Runs register operations through `cqlsh` on a node.
pub struct CqlshClient {
    admin: Arc<dyn Admin>,
    commands: Commands,
    node: NodeId,
    address: IpAddr,
    rf: usize,
}

impl CqlshClient {
    /// Client for worker `worker`, bound to nodes round-robin.
    pub fn for_worker(ctx: &ClusterContext, worker: usize) -> Result<Self> {
        let nodes = ctx.config.nodes();
        if nodes.is_empty() {
            return Err(ChaosError::Config("cluster has no nodes".into()));
        }
        let node = nodes[worker % nodes.len()].clone();
        let address = ctx
            .config
            .address(&node)
            .ok_or_else(|| ChaosError::UnknownNode(node.clone()))?;
        Ok(CqlshClient {
            admin: ctx.admin.clone(),
            commands: ctx.commands.clone(),
            node,
            address,
            rf: ctx.config.rf(),
        })
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    fn command(&self, cql: &str) -> String {
        format!(
            "{}/bin/cqlsh {} -e \"{}\"",
            self.commands.install_dir(),
            self.address,
            cql
        )
    }

    fn query(&self, cql: &str) -> Result<String> {
        let statement = format!("CONSISTENCY QUORUM; SERIAL CONSISTENCY SERIAL; {}", cql);
        debug!(node = %self.node, cql, "cqlsh");
        self.admin
            .exec(&self.node, &self.command(&statement))
            .map_err(|e| match e {
                ChaosError::Command { stderr, .. } => ChaosError::Query {
                    failure: classify(&stderr),
                    message: stderr,
                },
                other => other,
            })
    }

    fn int_payload(op: &Operation, at: Option<usize>) -> Result<i64> {
        let value = match at {
            Some(i) => &op.payload[i],
            None => &op.payload,
        };
        value
            .as_i64()
            .ok_or_else(|| ChaosError::Config(format!("bad {:?} payload {}", op.action, op.payload)))
    }
}

impl Client for CqlshClient {
    fn setup(&self) -> Result<()> {
        let cql = format!(
            "CREATE KEYSPACE IF NOT EXISTS {ks} WITH replication = \
             {{'class': 'SimpleStrategy', 'replication_factor': {rf}}}; \
             CREATE TABLE IF NOT EXISTS {ks}.{table} (id int PRIMARY KEY, value int);",
            ks = KEYSPACE,
            table = TABLE,
            rf = self.rf,
        );
        self.admin.exec(&self.node, &self.command(&cql))?;
        Ok(())
    }

    fn invoke(&self, op: &Operation) -> Result<ClientOutcome> {
        match op.action {
            Action::Read => {
                let out = self.query(&format!("SELECT value FROM {}.{} WHERE id = 0;", KEYSPACE, TABLE))?;
                Ok(ClientOutcome::Ok(parse_read(&out)?))
            }
            Action::Write => {
                let value = Self::int_payload(op, None)?;
                self.query(&format!(
                    "UPDATE {}.{} SET value = {} WHERE id = 0;",
                    KEYSPACE, TABLE, value
                ))?;
                Ok(ClientOutcome::Ok(op.payload.clone()))
            }
            Action::Cas => {
                let old = Self::int_payload(op, Some(0))?;
                let new = Self::int_payload(op, Some(1))?;
                let out = self.query(&format!(
                    "UPDATE {}.{} SET value = {} WHERE id = 0 IF value = {};",
                    KEYSPACE, TABLE, new, old
                ))?;
                if parse_applied(&out)? {
                    Ok(ClientOutcome::Ok(op.payload.clone()))
                } else {
                    Ok(ClientOutcome::Fail(op.payload.clone()))
                }
            }
            other => Err(ChaosError::Config(format!("{:?} is not a client action", other))),
        }
    }
}

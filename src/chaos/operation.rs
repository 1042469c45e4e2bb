//! Operation records exchanged between the schedule, the dispatcher and the
//! clients.
//!
//! Wire shape: `{"kind": "invoke"|"info", "action": "<name>", "payload": <any>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether an operation expects a definite outcome.
///
/// Client operations are `invoke`s. Nemesis operations are `info`: they change
/// the environment and have no linearizable result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Invoke,
    Info,
}

/// Every action the harness understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    // Fault window brackets.
    Start,
    Stop,
    // Membership faults.
    Bootstrap,
    Decommission,
    // Maintenance faults.
    ReplayBatchlog,
    FlushCompact,
    // Clock faults.
    ClockReset,
    ClockBump,
    ClockStrobe,
    // Client register operations.
    Read,
    Write,
    Cas,
}

impl Action {
    pub fn is_clock(self) -> bool {
        matches!(self, Action::ClockReset | Action::ClockBump | Action::ClockStrobe)
    }

    pub fn is_client(self) -> bool {
        matches!(self, Action::Read | Action::Write | Action::Cas)
    }
}

/// A single scheduled operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub action: Action,
    #[serde(default)]
    pub payload: Value,
}

impl Operation {
    pub fn info(action: Action) -> Self {
        Operation {
            kind: OpKind::Info,
            action,
            payload: Value::Null,
        }
    }

    pub fn invoke(action: Action) -> Self {
        Operation {
            kind: OpKind::Invoke,
            action,
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

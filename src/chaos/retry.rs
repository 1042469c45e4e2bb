//! Aggressive retry policy for final verification reads.
//!
//! Once fault injection has ceased the harness reads every register back. The
//! cluster may still be recovering, so read timeouts are retried many times at
//! the same consistency level. Write timeouts are never retried: replaying a
//! write of unknown outcome can fabricate a history the database never
//! produced.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{ChaosError, Result};
use super::timing::Scale;

/// Retries allowed before a read is escalated.
pub const MAX_RETRIES: u32 = 100;

/// Back-off before retrying a query that hit too few replicas.
pub const UNAVAILABLE_BACKOFF: Duration = Duration::from_secs(2);

/// The ways a query can fail inside the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryFailure {
    /// Coordinator did not hear from enough replicas before the read deadline.
    ReadTimeout,
    /// Coordinator did not hear from enough replicas before the write deadline.
    WriteTimeout,
    /// Coordinator knew up front that too few replicas were alive.
    Unavailable,
    /// Anything else: syntax, connection refused, unexpected output.
    Other,
}

/// What to do with a failed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry immediately at the same consistency level.
    Retry,
    /// Retry at the same consistency level after sleeping.
    RetryAfter(Duration),
    /// Give up and fail the query.
    Escalate,
}

/// The aggressive policy. Only used after the fault window has closed.
#[derive(Debug, Clone, Copy)]
pub struct AggressivePolicy {
    backoff: Duration,
}

impl AggressivePolicy {
    pub fn new(scale: Scale) -> Self {
        AggressivePolicy {
            backoff: scale.apply(UNAVAILABLE_BACKOFF),
        }
    }

    /// Decide how to handle `failure` after `retries` previous retries.
    pub fn decide(&self, failure: QueryFailure, retries: u32) -> RetryDecision {
        match failure {
            QueryFailure::ReadTimeout if retries > MAX_RETRIES => RetryDecision::Escalate,
            QueryFailure::ReadTimeout => RetryDecision::Retry,
            QueryFailure::WriteTimeout => RetryDecision::Escalate,
            QueryFailure::Unavailable if retries > MAX_RETRIES => RetryDecision::Escalate,
            QueryFailure::Unavailable => RetryDecision::RetryAfter(self.backoff),
            QueryFailure::Other => RetryDecision::Escalate,
        }
    }

    /// Run `query` until it succeeds or the policy escalates.
    ///
    /// Only [`ChaosError::Query`] failures are subject to the policy; every other
    /// error is returned as-is on first occurrence.
    pub fn run<T>(&self, mut query: impl FnMut() -> Result<T>) -> Result<T> {
        let mut retries = 0u32;
        loop {
            let failure = match query() {
                Ok(value) => return Ok(value),
                Err(ChaosError::Query { failure, message }) => {
                    debug!(?failure, retries, %message, "verification query failed");
                    failure
                }
                Err(e) => return Err(e),
            };

            match self.decide(failure, retries) {
                RetryDecision::Retry => {}
                RetryDecision::RetryAfter(delay) => thread::sleep(delay),
                RetryDecision::Escalate => {
                    warn!(?failure, attempts = retries + 1, "escalating verification query");
                    return Err(ChaosError::Escalated {
                        attempts: retries + 1,
                        failure,
                    });
                }
            }
            retries += 1;
        }
    }
}

impl Default for AggressivePolicy {
    fn default() -> Self {
        AggressivePolicy::new(Scale::default())
    }
}

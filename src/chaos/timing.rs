//! Duration scaling and the bounded waits used by the harness.
//!
//! Every duration the core waits on (window sleeps, startup stagger, poll
//! intervals, timeouts) is multiplied by a single [`Scale`] so a whole test can
//! be run faster or slower without touching individual constants.

use std::time::Duration;

/// Delay between consecutive nodes during a cold-cluster start.
pub const TURN_STAGGER: Duration = Duration::from_secs(60);

/// Poll interval while waiting for a bootstrapping node to finish joining.
pub const JOIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval while waiting for a stopped process to disappear.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll interval while waiting for the cluster to report every member up.
pub const CONVERGENCE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Multiplier applied to every harness duration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scale(f64);

impl Scale {
    /// Create a scale factor. Negative or non-finite factors are clamped to zero.
    pub fn new(factor: f64) -> Self {
        if factor.is_finite() && factor > 0.0 {
            Scale(factor)
        } else {
            Scale(0.0)
        }
    }

    /// The raw multiplier.
    pub fn factor(&self) -> f64 {
        self.0
    }

    /// Scale a duration, saturating at `Duration::MAX`.
    pub fn apply(&self, d: Duration) -> Duration {
        Duration::try_from_secs_f64(d.as_secs_f64() * self.0).unwrap_or(Duration::MAX)
    }
}

impl Default for Scale {
    fn default() -> Self {
        Scale(1.0)
    }
}

/// Upper bounds for the polling loops. Values are unscaled.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// How long a bootstrapped node may stay in the joining set.
    pub join: Duration,
    /// How long a stopped process may linger in the process table.
    pub stop: Duration,
    /// How long the final verification phase waits for every member to be up.
    pub convergence: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            join: Duration::from_secs(30 * 60),
            stop: Duration::from_secs(5 * 60),
            convergence: Duration::from_secs(10 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_applies_multiplier() {
        let half = Scale::new(0.5);
        assert_eq!(half.apply(TURN_STAGGER), Duration::from_secs(30));
        assert_eq!(Scale::default().apply(TURN_STAGGER), TURN_STAGGER);
    }

    #[test]
    fn test_scale_clamps_invalid_factors() {
        assert_eq!(Scale::new(-3.0).factor(), 0.0);
        assert_eq!(Scale::new(f64::NAN).factor(), 0.0);
        assert_eq!(Scale::new(0.0).apply(TURN_STAGGER), Duration::ZERO);
    }

    #[test]
    fn test_scale_saturates_on_overflow() {
        assert_eq!(Scale::new(1e30).apply(TURN_STAGGER), Duration::MAX);
    }
}

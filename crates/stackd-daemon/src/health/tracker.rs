//! Health state machine for one running instance.
//!
//! ```text
//! Starting -> Probing -> Healthy
//!                |  ^        |
//!                v  |        v
//!              Unhealthy <---+
//!                |
//!                v
//!              Failed
//! ```
//!
//! A failing probe from `Healthy` always lands in `Unhealthy` first, so a
//! live service is never failed by a single probe. Otherwise consecutive
//! failures reaching the threshold reach `Failed`, which is terminal.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Starting,
    Probing,
    Healthy,
    Unhealthy,
    Failed,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Probing => "probing",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct HealthTracker {
    state: HealthState,
    success_threshold: u32,
    failure_threshold: u32,
    consecutive_successes: u32,
    consecutive_failures: u32,
}

impl HealthTracker {
    pub fn new(success_threshold: u32, failure_threshold: u32) -> Self {
        Self {
            state: HealthState::Starting,
            success_threshold: success_threshold.max(1),
            failure_threshold: failure_threshold.max(1),
            consecutive_successes: 0,
            consecutive_failures: 0,
        }
    }

    pub const fn state(&self) -> HealthState {
        self.state
    }

    pub const fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Grace delay elapsed: start probing.
    pub fn begin_probing(&mut self) -> HealthState {
        if self.state == HealthState::Starting {
            self.state = HealthState::Probing;
        }
        self.state
    }

    /// Feed one probe result and return the new state.
    pub fn record(&mut self, success: bool) -> HealthState {
        if self.state == HealthState::Failed {
            return self.state;
        }
        self.begin_probing();

        if success {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            if self.consecutive_successes >= self.success_threshold {
                self.state = HealthState::Healthy;
            } else if self.state == HealthState::Unhealthy {
                self.state = HealthState::Probing;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.state = match self.state {
                // A live service gets at least one more probe before it is given up on.
                HealthState::Healthy => HealthState::Unhealthy,
                _ if self.consecutive_failures >= self.failure_threshold => HealthState::Failed,
                _ => HealthState::Unhealthy,
            };
        }
        self.state
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn healthy_only_after_success_threshold() {
        let mut t = HealthTracker::new(3, 3);
        assert_eq!(t.state(), HealthState::Starting);
        assert_eq!(t.begin_probing(), HealthState::Probing);
        assert_eq!(t.record(true), HealthState::Probing);
        assert_eq!(t.record(true), HealthState::Probing);
        assert_eq!(t.record(true), HealthState::Healthy);
        // Idempotent.
        assert_eq!(t.record(true), HealthState::Healthy);
    }

    #[test]
    fn failure_resets_success_streak() {
        let mut t = HealthTracker::new(2, 5);
        t.record(true);
        assert_eq!(t.record(false), HealthState::Unhealthy);
        assert_eq!(t.record(true), HealthState::Probing);
        assert_eq!(t.record(true), HealthState::Healthy);
    }

    #[test]
    fn healthy_degrades_to_unhealthy_not_failed() {
        let mut t = HealthTracker::new(1, 1);
        assert_eq!(t.record(true), HealthState::Healthy);
        assert_eq!(t.record(false), HealthState::Unhealthy);
        assert_eq!(t.record(false), HealthState::Failed);
    }

    #[test]
    fn failed_after_threshold_consecutive_failures() {
        let mut t = HealthTracker::new(1, 3);
        t.begin_probing();
        assert_eq!(t.record(false), HealthState::Unhealthy);
        assert_eq!(t.record(false), HealthState::Unhealthy);
        assert_eq!(t.record(false), HealthState::Failed);
        // Terminal.
        assert_eq!(t.record(true), HealthState::Failed);
    }

    #[test]
    fn never_healthy_fails_at_threshold_one() {
        let mut t = HealthTracker::new(1, 1);
        t.begin_probing();
        assert_eq!(t.record(false), HealthState::Failed);
    }

    #[test]
    fn recovery_from_unhealthy_resumes_probing() {
        let mut t = HealthTracker::new(2, 3);
        t.record(false);
        t.record(false);
        assert_eq!(t.record(true), HealthState::Probing);
        assert_eq!(t.consecutive_failures(), 0);
        // Streak restarted: two more failures are not enough.
        t.record(false);
        assert_eq!(t.record(false), HealthState::Unhealthy);
    }

    #[test]
    fn first_probe_without_begin_leaves_starting() {
        let mut t = HealthTracker::new(1, 3);
        assert_eq!(t.record(true), HealthState::Healthy);
    }
}

//! Runtime instance state.

use std::collections::VecDeque;
use std::fmt;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::health::{HealthState, ProbeOutcome};
use crate::process::ProcessHandle;
use crate::resources::ClaimId;

/// Lifecycle state of a service as reported by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Waiting for dependencies or resources.
    Pending,
    Starting,
    Probing,
    Healthy,
    Unhealthy,
    /// Down, with a restart scheduled.
    Restarting,
    Failed,
    /// Exited cleanly and not restarted.
    Exited,
    Stopping,
    Stopped,
    DependencyFailed,
}

impl InstanceState {
    /// No further transition happens without operator action.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Exited | Self::Stopped | Self::DependencyFailed
        )
    }

    /// Startup outcome is known: healthy, or never going to be.
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Healthy) || self.is_terminal()
    }
}

impl From<HealthState> for InstanceState {
    fn from(state: HealthState) -> Self {
        match state {
            HealthState::Starting => Self::Starting,
            HealthState::Probing => Self::Probing,
            HealthState::Healthy => Self::Healthy,
            HealthState::Unhealthy => Self::Unhealthy,
            HealthState::Failed => Self::Failed,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Probing => "probing",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
            Self::Failed => "failed",
            Self::Exited => "exited",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::DependencyFailed => "dependency-failed",
        };
        f.write_str(s)
    }
}

/// A running process owned by the controller.
///
/// Claims are referenced by id; the ledger owns them.
#[derive(Debug)]
pub struct RuntimeInstance {
    pub service: String,
    pub generation: u64,
    pub handle: ProcessHandle,
    pub state: InstanceState,
    pub claims: Vec<ClaimId>,
    pub history: VecDeque<ProbeOutcome>,
    history_limit: usize,
    pub(crate) monitor: CancellationToken,
}

impl RuntimeInstance {
    pub(crate) fn new(
        service: String,
        generation: u64,
        handle: ProcessHandle,
        claims: Vec<ClaimId>,
        history_limit: usize,
        monitor: CancellationToken,
    ) -> Self {
        Self {
            service,
            generation,
            handle,
            state: InstanceState::Starting,
            claims,
            history: VecDeque::with_capacity(history_limit),
            history_limit,
            monitor,
        }
    }

    /// Claim owner key in the ledger.
    pub fn owner(&self) -> String {
        owner_key(&self.service, self.generation)
    }

    /// Append a probe outcome, keeping the last `history_limit`.
    pub fn record(&mut self, outcome: ProbeOutcome) {
        if self.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(outcome);
    }
}

pub(crate) fn owner_key(service: &str, generation: u64) -> String {
    format!("{service}#{generation}")
}

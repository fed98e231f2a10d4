//! Lifecycle errors.

use thiserror::Error;

use super::instance::InstanceState;
use crate::process::ProcessError;
use crate::resources::LedgerError;

#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    /// A dependency reached a terminal state without becoming healthy.
    #[error("Dependency '{dependency}' will not become healthy (state: {state})")]
    DependencyFailed {
        dependency: String,
        state: InstanceState,
    },

    #[error(transparent)]
    ResourceExhausted(#[from] LedgerError),

    #[error("Process start failed: {0}")]
    ProcessStart(#[from] ProcessError),

    #[error("Service '{service}' gave up after {restarts} restarts")]
    RestartsExhausted { service: String, restarts: u32 },

    #[error("Unknown service '{0}'")]
    UnknownService(String),

    #[error("Orchestrator is shutting down")]
    Shutdown,
}

//! Process lifecycle: dependency-ordered starts, restart policy and
//! reverse-order shutdown.

pub mod backoff;
pub mod board;
pub mod controller;
pub mod error;
pub mod instance;

pub use backoff::RestartBackoff;
pub use board::{ServiceStatus, StateBoard};
pub use controller::{
    Orchestrator, OrchestratorHandle, OrchestratorOptions, ReadinessListener, ShutdownReport,
};
pub use error::LifecycleError;
pub use instance::{InstanceState, RuntimeInstance};

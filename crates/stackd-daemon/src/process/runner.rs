//! The seam between the orchestrator and whatever actually runs services.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use stackd_core::ServiceDescriptor;

/// Everything needed to launch one service process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub service: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Added on top of the orchestrator's own environment.
    pub env: BTreeMap<String, String>,
    pub ports: Vec<u16>,
}

impl LaunchSpec {
    pub fn from_descriptor(desc: &ServiceDescriptor) -> Self {
        Self {
            service: desc.name.clone(),
            program: desc.image.clone(),
            args: desc.args.clone(),
            working_dir: desc.working_dir.clone(),
            env: desc.env.clone(),
            ports: desc.ports.clone(),
        }
    }

    /// Set `key` unless the descriptor already chose a value.
    pub fn env_default(&mut self, key: &str, value: impl Into<String>) {
        self.env
            .entry(key.to_string())
            .or_insert_with(|| value.into());
    }
}

/// Opaque handle to a started process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub id: String,
    pub service: String,
    pub pid: Option<u32>,
}

/// Result of a liveness query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    /// Exit code, `None` when killed by a signal.
    Exited(Option<i32>),
}

/// How a stopped process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// The grace period ran out and the process was killed.
    pub forced: bool,
}

/// Errors from process operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to start '{service}': {reason}")]
    SpawnFailed { service: String, reason: String },

    #[error("Process not found: {id}")]
    NotFound { id: String },

    #[error("Failed to signal process {id}: {reason}")]
    Signal { id: String, reason: String },
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Start a process for `spec`.
    async fn start(&self, spec: &LaunchSpec) -> Result<ProcessHandle, ProcessError>;

    /// Ask the process to terminate, killing it once `grace` has elapsed.
    ///
    /// Stopping a process that already exited reaps it and reports its code.
    async fn stop(&self, handle: &ProcessHandle, grace: Duration)
    -> Result<ExitReport, ProcessError>;

    async fn liveness(&self, handle: &ProcessHandle) -> Result<Liveness, ProcessError>;
}

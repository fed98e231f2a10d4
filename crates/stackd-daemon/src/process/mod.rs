//! Process collaborator: start, stop and query managed service processes.

pub mod local;
pub mod runner;

pub use local::LocalProcessRunner;
pub use runner::{ExitReport, LaunchSpec, Liveness, ProcessError, ProcessHandle, ProcessRunner};

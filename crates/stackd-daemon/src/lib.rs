//! stackd daemon library
//!
//! Orchestrates a stack of interdependent services:
//! - Process runner for managed service processes
//! - Resource ledger actor for CPU, memory and GPU admission
//! - Health supervision with per-instance monitor tasks
//! - Lifecycle controller driving dependency-ordered starts and restarts
//! - HTTP status endpoint

pub mod health;
pub mod lifecycle;
pub mod process;
pub mod resources;
pub mod status;
pub mod telemetry;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

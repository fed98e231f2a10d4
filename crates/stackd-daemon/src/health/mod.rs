//! Health supervision: per-instance state machine, probes and monitor tasks.

pub mod monitor;
pub mod probe;
pub mod tracker;

pub use monitor::{MonitorEvent, MonitorSpec, spawn_monitor};
pub use probe::{NetworkProber, ProbeFailure, ProbeOutcome, Prober, probe_with_timeout};
pub use tracker::{HealthState, HealthTracker};

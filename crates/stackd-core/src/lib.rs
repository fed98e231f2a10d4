//! stackd core library
//!
//! Shared functionality for the stackd components:
//! - Service descriptors and the validated descriptor store
//! - Stack file loading with environment placeholders
//! - Dependency graph resolution (cycle detection, start levels)
//! - Resource kinds and capacities
//! - Common error types and tracing setup

pub mod config;
pub mod descriptor;
pub mod error;
pub mod graph;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod resources;
pub mod tracing_init;

pub use config::{Stack, load_stack};
pub use descriptor::{
    DescriptorStore, HealthCheckSpec, ProbeKind, RestartPolicy, RouteSpec, ServiceDescriptor,
};
pub use error::{Error, Result};
pub use graph::DependencyGraph;
pub use resources::{Capacity, ResourceKind, ResourceRequest};

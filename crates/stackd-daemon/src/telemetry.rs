//! Counter hooks for the lifecycle controller.
//!
//! With the `metrics` feature the calls land on OTLP counters; without it
//! they compile to nothing.

#[cfg(feature = "metrics")]
use std::sync::Arc;

#[cfg(feature = "metrics")]
use stackd_core::metrics::OrchestratorMetrics;

#[derive(Clone, Default)]
pub struct Telemetry {
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<OrchestratorMetrics>>,
}

impl Telemetry {
    pub fn disabled() -> Self {
        Self::default()
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(metrics: OrchestratorMetrics) -> Self {
        Self {
            metrics: Some(Arc::new(metrics)),
        }
    }
}

#[cfg(feature = "metrics")]
impl Telemetry {
    pub fn restart(&self, service: &str) {
        if let Some(m) = &self.metrics {
            m.restart(service);
        }
    }

    pub fn probe_failure(&self, service: &str) {
        if let Some(m) = &self.metrics {
            m.probe_failure(service);
        }
    }

    pub fn resource_wait(&self, service: &str) {
        if let Some(m) = &self.metrics {
            m.resource_wait(service);
        }
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(clippy::unused_self)]
impl Telemetry {
    pub const fn restart(&self, _service: &str) {}

    pub const fn probe_failure(&self, _service: &str) {}

    pub const fn resource_wait(&self, _service: &str) {}
}

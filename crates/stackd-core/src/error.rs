//! Error types for the stackd core library.

use thiserror::Error;

/// Result type alias using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for descriptor loading and graph resolution.
#[derive(Debug, Error)]
pub enum Error {
    /// Stack file could not be read or interpreted.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A descriptor violates a structural rule.
    #[error("Invalid service '{service}': {message}")]
    Validation { service: String, message: String },

    /// A service depends on a name that is not declared.
    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    /// The dependency graph contains a cycle. Members are listed in cycle order.
    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<String> },

    /// Two routes claim the same external listener port.
    #[error("Listener port {port} is claimed by both '{first}' and '{second}'")]
    DuplicateListenPort {
        port: u16,
        first: String,
        second: String,
    },

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn validation(service: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

fn format_cycle(cycle: &[String]) -> String {
    let mut out = cycle.join(" -> ");
    if let Some(first) = cycle.first() {
        out.push_str(" -> ");
        out.push_str(first);
    }
    out
}

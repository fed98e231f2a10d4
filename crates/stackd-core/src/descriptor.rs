//! Service descriptors and the descriptor store.
//!
//! A [`ServiceDescriptor`] is the static declaration of one managed service.
//! The [`DescriptorStore`] validates a full set of descriptors once and then
//! hands out shared, immutable views of them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::resources::ResourceRequest;

/// How a health probe talks to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// `GET` the target URL, 2xx is healthy.
    Http,
    /// Open a TCP connection to the target address.
    Tcp,
    /// Run a command, zero exit status is healthy.
    Exec,
}

/// Health check declaration for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    pub kind: ProbeKind,
    /// Resolved target: an absolute URL for HTTP, `host:port` for TCP,
    /// a command line for exec.
    pub target: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Grace delay between process start and the first probe.
    pub start_delay: Duration,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

/// What to do when an instance fails or exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
}

impl RestartPolicy {
    /// Whether an exit with the given code should trigger a restart.
    ///
    /// `None` means the instance failed without a clean exit code (health
    /// failure, killed by signal, spawn error).
    pub const fn restarts_after(self, exit_code: Option<i32>) -> bool {
        match self {
            Self::Never => false,
            Self::Always => true,
            Self::OnFailure => !matches!(exit_code, Some(0)),
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("never"),
            Self::OnFailure => f.write_str("on-failure"),
            Self::Always => f.write_str("always"),
        }
    }
}

/// External route exposing a service through the reverse proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub listen_port: u16,
    pub tls: bool,
    /// Allow HTTP `Upgrade` (WebSocket) through this route.
    pub upgrade: bool,
    /// Internal port the proxy forwards to.
    pub target_port: u16,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
}

/// Static declaration of one managed service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Executable to launch.
    pub image: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub ports: Vec<u16>,
    pub env: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
    pub health_check: Option<HealthCheckSpec>,
    pub resources: ResourceRequest,
    pub restart_policy: RestartPolicy,
    pub route: Option<RouteSpec>,
}

impl ServiceDescriptor {
    /// Minimal descriptor with no ports, dependencies or health check.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            args: Vec::new(),
            working_dir: None,
            ports: Vec::new(),
            env: BTreeMap::new(),
            depends_on: Vec::new(),
            health_check: None,
            resources: ResourceRequest::default(),
            restart_policy: RestartPolicy::default(),
            route: None,
        }
    }

    #[must_use]
    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| (*d).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_ports(mut self, ports: &[u16]) -> Self {
        self.ports = ports.to_vec();
        self
    }

    #[must_use]
    pub const fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    #[must_use]
    pub const fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    #[must_use]
    pub fn with_health_check(mut self, check: HealthCheckSpec) -> Self {
        self.health_check = Some(check);
        self
    }

    #[must_use]
    pub fn with_route(mut self, route: RouteSpec) -> Self {
        self.route = Some(route);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::validation(&self.name, "name must not be empty"));
        }
        if self.image.trim().is_empty() {
            return Err(Error::validation(&self.name, "image must not be empty"));
        }
        if self.depends_on.iter().any(|d| d == &self.name) {
            return Err(Error::validation(&self.name, "depends on itself"));
        }
        if let Some(check) = &self.health_check {
            if check.success_threshold == 0 || check.failure_threshold == 0 {
                return Err(Error::validation(
                    &self.name,
                    "health check thresholds must be at least 1",
                ));
            }
            if check.interval.is_zero() || check.timeout.is_zero() {
                return Err(Error::validation(
                    &self.name,
                    "health check interval and timeout must be positive",
                ));
            }
            if check.target.trim().is_empty() {
                return Err(Error::validation(&self.name, "health check target is empty"));
            }
        }
        if let Some(route) = &self.route
            && !self.ports.contains(&route.target_port)
        {
            return Err(Error::validation(
                &self.name,
                format!(
                    "route targets port {} which the service does not declare",
                    route.target_port
                ),
            ));
        }
        Ok(())
    }
}

/// Immutable, validated set of service descriptors.
///
/// Descriptors are kept sorted by name so that indices are deterministic.
#[derive(Debug, Clone)]
pub struct DescriptorStore {
    descriptors: Vec<ServiceDescriptor>,
    index: HashMap<String, usize>,
}

impl DescriptorStore {
    /// Validate and freeze a descriptor set.
    pub fn new(mut descriptors: Vec<ServiceDescriptor>) -> Result<Self> {
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));

        let mut index = HashMap::with_capacity(descriptors.len());
        for (i, desc) in descriptors.iter().enumerate() {
            desc.validate()?;
            if index.insert(desc.name.clone(), i).is_some() {
                return Err(Error::validation(&desc.name, "declared more than once"));
            }
        }

        for desc in &descriptors {
            for dep in &desc.depends_on {
                if !index.contains_key(dep) {
                    return Err(Error::UnknownDependency {
                        service: desc.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut listeners: HashMap<u16, &str> = HashMap::new();
        for desc in &descriptors {
            if let Some(route) = &desc.route
                && let Some(first) = listeners.insert(route.listen_port, desc.name.as_str())
            {
                return Err(Error::DuplicateListenPort {
                    port: route.listen_port,
                    first: first.to_string(),
                    second: desc.name.clone(),
                });
            }
        }

        Ok(Self { descriptors, index })
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.index.get(name).map(|&i| &self.descriptors[i])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.descriptors.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().map(|d| d.name.as_str())
    }

    /// Descriptors that declare an external route.
    pub fn routed(&self) -> impl Iterator<Item = (&ServiceDescriptor, &RouteSpec)> {
        self.descriptors
            .iter()
            .filter_map(|d| d.route.as_ref().map(|r| (d, r)))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

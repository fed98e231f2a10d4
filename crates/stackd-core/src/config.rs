//! Stack file loading.
//!
//! A stack file declares orchestrator settings, resource capacity, restart
//! backoff, default TLS material and the managed services. Resolution order:
//! 1. Built-in defaults
//! 2. Stack file (TOML, or JSON when the extension is `.json`)
//! 3. Environment variables (`STACKD_*`)
//!
//! CLI flags are applied by the binary on top of the result.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::descriptor::{
    DescriptorStore, HealthCheckSpec, ProbeKind, RestartPolicy, RouteSpec, ServiceDescriptor,
};
use crate::error::{Error, Result};
use crate::graph::DependencyGraph;
use crate::resources::{Capacity, MemoryAmount, ResourceRequest, cores_to_millis};

/// Orchestrator-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Address of the HTTP status endpoint. Disabled when unset.
    pub status_addr: Option<SocketAddr>,
    /// Seconds between SIGTERM and SIGKILL when stopping a service.
    pub stop_grace_secs: u64,
    /// Address proxy listeners bind to.
    pub proxy_bind: IpAddr,
    /// Probe outcomes retained per instance.
    pub history: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            status_addr: None,
            stop_grace_secs: 10,
            proxy_bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            history: 10,
        }
    }
}

impl OrchestratorSettings {
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// Exponential restart backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Maximum restarts per service (None = unlimited).
    pub max_restarts: Option<u32>,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_restarts: Some(5),
        }
    }
}

/// Default certificate material for TLS routes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct CapacitySection {
    cpu: Option<f64>,
    memory: Option<MemoryAmount>,
    gpu: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ResourcesSection {
    cpu: Option<f64>,
    memory: Option<MemoryAmount>,
    gpu: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HealthCheckSection {
    kind: ProbeKind,
    target: String,
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default)]
    start_delay_ms: u64,
    #[serde(default = "default_threshold")]
    success_threshold: u32,
    #[serde(default = "default_failure_threshold")]
    failure_threshold: u32,
}

const fn default_interval_ms() -> u64 {
    1_000
}

const fn default_timeout_ms() -> u64 {
    1_000
}

const fn default_threshold() -> u32 {
    1
}

const fn default_failure_threshold() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RouteSection {
    listen_port: u16,
    #[serde(default)]
    tls: bool,
    #[serde(default)]
    upgrade: bool,
    target_port: Option<u16>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceSection {
    image: String,
    #[serde(default)]
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    #[serde(default)]
    ports: Vec<u16>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    depends_on: Vec<String>,
    health_check: Option<HealthCheckSection>,
    #[serde(default)]
    resources: ResourcesSection,
    #[serde(default)]
    restart_policy: RestartPolicy,
    route: Option<RouteSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StackFile {
    orchestrator: OrchestratorSettings,
    capacity: CapacitySection,
    restart: RestartSettings,
    tls: Option<TlsSettings>,
    services: BTreeMap<String, ServiceSection>,
}

/// A fully loaded and validated stack.
#[derive(Debug, Clone)]
pub struct Stack {
    pub settings: OrchestratorSettings,
    pub capacity: Capacity,
    pub restart: RestartSettings,
    pub tls: Option<TlsSettings>,
    pub store: DescriptorStore,
    pub graph: DependencyGraph,
}

impl Stack {
    /// Certificate material for a route: the route's own files, else `[tls]`.
    pub fn tls_material(&self, route: &RouteSpec) -> Option<TlsSettings> {
        match (&route.cert, &route.key) {
            (Some(cert), Some(key)) => Some(TlsSettings {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => self.tls.clone(),
        }
    }
}

/// Default stack file location: `./stack.toml`, else the user config dir.
pub fn default_stack_path() -> PathBuf {
    let local = PathBuf::from("stack.toml");
    if local.exists() {
        return local;
    }
    dirs::config_dir().map_or(local, |dir| dir.join("stackd").join("stack.toml"))
}

/// Load, expand and validate a stack file, then apply environment overrides.
pub fn load_stack(path: &Path) -> Result<Stack> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read stack file {}: {}", path.display(), e))
    })?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    let mut stack = if is_json {
        parse_json(&content, &|key: &str| std::env::var(key).ok())?
    } else {
        parse_toml(&content, &|key: &str| std::env::var(key).ok())?
    };
    apply_env_overrides(&mut stack.settings);
    Ok(stack)
}

/// Upper bound for `[capacity].gpu`; every device gets a ledger slot.
pub const MAX_GPU_DEVICES: u64 = 1024;

/// Parse a TOML stack, resolving `${VAR}` placeholders through `lookup`.
pub fn parse_toml(content: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Stack> {
    let file: StackFile = toml::from_str(content)?;
    build_stack(file, lookup)
}

/// Parse a JSON stack, resolving `${VAR}` placeholders through `lookup`.
pub fn parse_json(content: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Stack> {
    let file: StackFile = serde_json::from_str(content)?;
    build_stack(file, lookup)
}

fn build_stack(file: StackFile, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Stack> {
    let gpus = file.capacity.gpu.unwrap_or(0);
    if gpus > MAX_GPU_DEVICES {
        return Err(Error::Config(format!(
            "[capacity] gpu = {gpus} exceeds the maximum of {MAX_GPU_DEVICES} devices"
        )));
    }
    let capacity = Capacity {
        cpu_millis: file
            .capacity
            .cpu
            .map(cores_to_millis)
            .transpose()
            .map_err(|e| Error::Config(format!("[capacity] {e}")))?,
        memory_bytes: file.capacity.memory.map(|m| m.0),
        gpus,
    };

    let mut descriptors = Vec::with_capacity(file.services.len());
    for (name, section) in file.services {
        descriptors.push(build_descriptor(name, section, lookup)?);
    }

    let store = DescriptorStore::new(descriptors)?;
    let graph = DependencyGraph::build(&store)?;

    for (desc, route) in store.routed() {
        let has_own = route.cert.is_some() && route.key.is_some();
        if route.tls && !has_own && file.tls.is_none() {
            return Err(Error::validation(
                &desc.name,
                "TLS route needs cert and key (route or [tls] section)",
            ));
        }
    }

    Ok(Stack {
        settings: file.orchestrator,
        capacity,
        restart: file.restart,
        tls: file.tls,
        store,
        graph,
    })
}

fn build_descriptor(
    name: String,
    section: ServiceSection,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<ServiceDescriptor> {
    let mut env = BTreeMap::new();
    for (key, value) in section.env {
        let expanded = expand_placeholders(&value, lookup)
            .map_err(|e| Error::validation(&name, format!("env {key}: {e}")))?;
        env.insert(key, expanded);
    }

    let first_port = section.ports.first().copied();

    let health_check = section
        .health_check
        .map(|hc| {
            let target = resolve_probe_target(hc.kind, &hc.target, first_port)
                .map_err(|e| Error::validation(&name, e))?;
            Ok::<_, Error>(HealthCheckSpec {
                kind: hc.kind,
                target,
                interval: Duration::from_millis(hc.interval_ms),
                timeout: Duration::from_millis(hc.timeout_ms),
                start_delay: Duration::from_millis(hc.start_delay_ms),
                success_threshold: hc.success_threshold,
                failure_threshold: hc.failure_threshold,
            })
        })
        .transpose()?;

    let resources = ResourceRequest {
        cpu_millis: section
            .resources
            .cpu
            .map(cores_to_millis)
            .transpose()
            .map_err(|e| Error::validation(&name, e))?
            .unwrap_or(0),
        memory_bytes: section.resources.memory.map_or(0, |m| m.0),
        gpus: section.resources.gpu.unwrap_or(0),
    };

    let route = section
        .route
        .map(|r| {
            let target_port = r.target_port.or(first_port).ok_or_else(|| {
                Error::validation(&name, "route needs target_port or a declared port")
            })?;
            Ok::<_, Error>(RouteSpec {
                listen_port: r.listen_port,
                tls: r.tls,
                upgrade: r.upgrade,
                target_port,
                cert: r.cert,
                key: r.key,
            })
        })
        .transpose()?;

    Ok(ServiceDescriptor {
        name,
        image: section.image,
        args: section.args,
        working_dir: section.working_dir,
        ports: section.ports,
        env,
        depends_on: section.depends_on,
        health_check,
        resources,
        restart_policy: section.restart_policy,
        route,
    })
}

/// Expand a bare path (HTTP) or bare port (TCP) against the first declared port.
fn resolve_probe_target(
    kind: ProbeKind,
    target: &str,
    first_port: Option<u16>,
) -> std::result::Result<String, String> {
    let target = target.trim();
    match kind {
        ProbeKind::Http if target.starts_with('/') => first_port
            .map(|port| format!("http://127.0.0.1:{port}{target}"))
            .ok_or_else(|| format!("http probe path '{target}' needs a declared port")),
        ProbeKind::Tcp if target.parse::<u16>().is_ok() => Ok(format!("127.0.0.1:{target}")),
        _ => Ok(target.to_string()),
    }
}

/// Replace `${VAR}` and `${VAR:-default}` placeholders. `$$` is a literal `$`.
pub fn expand_placeholders(
    value: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body
                .find('}')
                .ok_or_else(|| format!("unterminated placeholder in '{value}'"))?;
            let inner = &body[..end];
            let (key, default) = match inner.split_once(":-") {
                Some((k, d)) => (k, Some(d)),
                None => (inner, None),
            };
            if key.is_empty() {
                return Err(format!("empty placeholder in '{value}'"));
            }
            let resolved = match (lookup(key), default) {
                (Some(v), Some(d)) if v.is_empty() => d.to_string(),
                (Some(v), _) => v,
                (None, Some(d)) => d.to_string(),
                (None, None) => return Err(format!("variable {key} is not set")),
            };
            out.push_str(&resolved);
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = after;
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn apply_env_overrides(settings: &mut OrchestratorSettings) {
    if let Ok(val) = std::env::var("STACKD_STATUS_ADDR")
        && let Ok(addr) = val.parse()
    {
        settings.status_addr = Some(addr);
    }
    if let Ok(val) = std::env::var("STACKD_STOP_GRACE_SECS")
        && let Ok(n) = val.parse()
    {
        settings.stop_grace_secs = n;
    }
    if let Ok(val) = std::env::var("STACKD_PROXY_BIND")
        && let Ok(ip) = val.parse()
    {
        settings.proxy_bind = ip;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::resources::ResourceKind;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    const SAMPLE: &str = r#"
[orchestrator]
status_addr = "127.0.0.1:7070"
stop_grace_secs = 3

[capacity]
cpu = 8
memory = "32g"
gpu = 1

[tls]
cert = "certs/server.pem"
key = "certs/server-key.pem"

[services.db]
image = "/usr/bin/postgres"
ports = [5432]
restart_policy = "on-failure"
env = { PGDATA = "/var/lib/pg" }

[services.db.health_check]
kind = "tcp"
target = "5432"

[services.llm]
image = "/opt/llm/serve"
ports = [11434]
depends_on = ["db"]

[services.llm.resources]
gpu = 1
memory = "16g"
cpu = 2.5

[services.llm.health_check]
kind = "http"
target = "/api/health"
success_threshold = 2

[services.ui]
image = "/opt/ui/server"
ports = [8080]
depends_on = ["db", "llm"]
restart_policy = "always"

[services.ui.route]
listen_port = 443
tls = true
upgrade = true
"#;

    #[test]
    fn rejects_absurd_gpu_capacity() {
        let err = parse_toml("[capacity]\ngpu = 4000000000\n", &no_env).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
        assert!(err.to_string().contains("gpu = 4000000000"), "{err}");

        let stack = parse_toml("[capacity]\ngpu = 8\n", &no_env).unwrap();
        assert_eq!(stack.capacity.gpus, 8);
    }

    #[test]
    fn parses_full_stack() {
        let stack = parse_toml(SAMPLE, &no_env).unwrap();
        assert_eq!(stack.store.len(), 3);
        assert_eq!(stack.settings.stop_grace_secs, 3);
        assert_eq!(stack.capacity.cpu_millis, Some(8000));
        assert_eq!(stack.capacity.gpus, 1);
        assert_eq!(stack.graph.levels(), vec![vec!["db"], vec!["llm"], vec!["ui"]]);

        let llm = stack.store.get("llm").unwrap();
        assert_eq!(llm.resources.quantity(ResourceKind::Gpu), 1);
        assert_eq!(llm.resources.cpu_millis, 2500);
        let hc = llm.health_check.as_ref().unwrap();
        assert_eq!(hc.target, "http://127.0.0.1:11434/api/health");
        assert_eq!(hc.success_threshold, 2);
        assert_eq!(hc.failure_threshold, 3);

        let db = stack.store.get("db").unwrap();
        assert_eq!(db.health_check.as_ref().unwrap().target, "127.0.0.1:5432");
        assert_eq!(db.restart_policy, RestartPolicy::OnFailure);

        let ui = stack.store.get("ui").unwrap();
        let route = ui.route.as_ref().unwrap();
        assert_eq!(route.target_port, 8080);
        assert!(route.upgrade);
        let tls = stack.tls_material(route).unwrap();
        assert_eq!(tls.cert, PathBuf::from("certs/server.pem"));
    }

    #[test]
    fn cyclic_stack_is_rejected() {
        let toml = r#"
[services.a]
image = "a"
depends_on = ["b"]

[services.b]
image = "b"
depends_on = ["a"]
"#;
        let err = parse_toml(toml, &no_env).unwrap_err();
        assert!(matches!(err, Error::CyclicDependency { .. }), "{err}");
    }

    #[test]
    fn tls_route_without_material_is_rejected() {
        let toml = r#"
[services.ui]
image = "ui"
ports = [8080]

[services.ui.route]
listen_port = 443
tls = true
"#;
        let err = parse_toml(toml, &no_env).unwrap_err();
        assert!(err.to_string().contains("TLS route"), "{err}");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let toml = r#"
[services.ui]
image = "ui"
replicas = 3
"#;
        assert!(parse_toml(toml, &no_env).is_err());
    }

    #[test]
    fn json_stack_parses() {
        let json = r#"{"services": {"api": {"image": "/bin/api", "ports": [9000]}}}"#;
        let stack = parse_json(json, &no_env).unwrap();
        assert_eq!(stack.store.get("api").unwrap().ports, vec![9000]);
    }

    #[test]
    fn env_placeholders_resolve_from_lookup() {
        let toml = r#"
[services.db]
image = "db"
env = { PASSWORD = "${DB_PASSWORD}", USER = "${DB_USER:-admin}", PRICE = "$$5" }
"#;
        let lookup = |key: &str| (key == "DB_PASSWORD").then(|| "hunter2".to_string());
        let stack = parse_toml(toml, &lookup).unwrap();
        let env = &stack.store.get("db").unwrap().env;
        assert_eq!(env["PASSWORD"], "hunter2");
        assert_eq!(env["USER"], "admin");
        assert_eq!(env["PRICE"], "$5");
    }

    #[test]
    fn missing_placeholder_names_service_and_key() {
        let toml = r#"
[services.db]
image = "db"
env = { PASSWORD = "${DB_PASSWORD}" }
"#;
        let err = parse_toml(toml, &no_env).unwrap_err().to_string();
        assert!(err.contains("db"), "{err}");
        assert!(err.contains("PASSWORD"), "{err}");
    }

    #[test]
    fn placeholder_edge_cases() {
        assert_eq!(expand_placeholders("plain", &no_env).unwrap(), "plain");
        assert_eq!(expand_placeholders("a$b", &no_env).unwrap(), "a$b");
        assert!(expand_placeholders("${OPEN", &no_env).is_err());
        assert!(expand_placeholders("${}", &no_env).is_err());
        assert_eq!(expand_placeholders("${X:-}", &no_env).unwrap(), "");
    }

    #[test]
    fn load_stack_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.toml");
        std::fs::write(&path, "[services.web]\nimage = \"/bin/web\"\n").unwrap();
        let stack = load_stack(&path).unwrap();
        assert_eq!(stack.graph.order(), vec!["web"]);
    }

    #[test]
    fn load_stack_missing_file_is_config_error() {
        let err = load_stack(Path::new("/nonexistent/stack.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[test]
    fn defaults_are_sane() {
        let settings = OrchestratorSettings::default();
        assert_eq!(settings.stop_grace(), Duration::from_secs(10));
        assert!(settings.status_addr.is_none());
        let restart = RestartSettings::default();
        assert_eq!(restart.max_restarts, Some(5));
    }
}

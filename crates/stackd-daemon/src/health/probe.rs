//! Health probes: HTTP GET, TCP connect and exec.

use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;
use stackd_core::{HealthCheckSpec, ProbeKind};
use tokio::net::TcpStream;
use tokio::process::Command;

/// Why a probe did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeFailure {
    /// The probe did not complete within its timeout.
    #[error("Health check timed out after {0:?}")]
    Timeout(Duration),

    #[error("Health check failed: {0}")]
    Failure(String),

    #[error("Process exited (code {0:?})")]
    ProcessExited(Option<i32>),
}

/// One recorded probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeOutcome {
    /// Milliseconds since the Unix epoch.
    pub at_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeOutcome {
    pub fn from_result(result: &Result<(), ProbeFailure>) -> Self {
        let at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self {
            at_ms,
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        }
    }
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Run one probe. Timeouts are applied by [`probe_with_timeout`].
    async fn probe(&self, service: &str, check: &HealthCheckSpec) -> Result<(), ProbeFailure>;
}

/// Run a probe under the check's timeout. A timeout counts as a failure.
pub async fn probe_with_timeout(
    prober: &dyn Prober,
    service: &str,
    check: &HealthCheckSpec,
) -> Result<(), ProbeFailure> {
    tokio::time::timeout(check.timeout, prober.probe(service, check))
        .await
        .unwrap_or(Err(ProbeFailure::Timeout(check.timeout)))
}

/// Probes real endpoints over the network or by running commands.
#[derive(Clone)]
pub struct NetworkProber {
    http: reqwest::Client,
}

impl NetworkProber {
    pub fn new() -> Result<Self, reqwest::Error> {
        // reqwest uses rustls-no-provider; Err only means it is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { http })
    }

    async fn http(&self, target: &str) -> Result<(), ProbeFailure> {
        let response = self
            .http
            .get(target)
            .send()
            .await
            .map_err(|e| ProbeFailure::Failure(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeFailure::Failure(format!("HTTP {status}")))
        }
    }

    async fn tcp(target: &str) -> Result<(), ProbeFailure> {
        TcpStream::connect(target)
            .await
            .map(drop)
            .map_err(|e| ProbeFailure::Failure(format!("connect {target}: {e}")))
    }

    async fn exec(target: &str) -> Result<(), ProbeFailure> {
        let mut parts = target.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ProbeFailure::Failure("empty exec command".into()))?;
        let status = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| ProbeFailure::Failure(format!("{program}: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(ProbeFailure::Failure(format!("{program} exited with {status}")))
        }
    }
}

#[async_trait]
impl Prober for NetworkProber {
    async fn probe(&self, _service: &str, check: &HealthCheckSpec) -> Result<(), ProbeFailure> {
        match check.kind {
            ProbeKind::Http => self.http(&check.target).await,
            ProbeKind::Tcp => Self::tcp(&check.target).await,
            ProbeKind::Exec => Self::exec(&check.target).await,
        }
    }
}

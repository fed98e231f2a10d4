//! Local subprocess runner.
//!
//! Spawns service executables as child processes, forwards their output into
//! tracing, and stops them with SIGTERM followed by SIGKILL after a grace
//! period.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::runner::{ExitReport, LaunchSpec, Liveness, ProcessError, ProcessHandle, ProcessRunner};

struct ProcessState {
    child: Child,
    service: String,
    /// Recorded once `try_wait` observes the exit.
    exited: Option<Option<i32>>,
}

/// Runs services as local child processes.
#[derive(Default)]
pub struct LocalProcessRunner {
    processes: Arc<RwLock<HashMap<String, ProcessState>>>,
}

impl LocalProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn active_count(&self) -> usize {
        self.processes.read().await.len()
    }
}

#[async_trait]
impl ProcessRunner for LocalProcessRunner {
    async fn start(&self, spec: &LaunchSpec) -> Result<ProcessHandle, ProcessError> {
        let mut cmd = Command::new(&spec.program);
        // Managed services must not talk to systemd on our behalf.
        cmd.args(&spec.args)
            .env_remove("NOTIFY_SOCKET")
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        info!(
            service = %spec.service,
            program = %spec.program,
            args = ?spec.args,
            ports = ?spec.ports,
            "Spawning service process"
        );
        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            service: spec.service.clone(),
            reason: e.to_string(),
        })?;

        let id = uuid::Uuid::new_v4().to_string();
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            let service = spec.service.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    info!(service = %service, "{line}");
                }
                debug!(service = %service, "stdout reader finished");
            });
        }
        if let Some(stderr) = child.stderr.take() {
            let service = spec.service.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(service = %service, "{line}");
                }
                debug!(service = %service, "stderr reader finished");
            });
        }

        self.processes.write().await.insert(
            id.clone(),
            ProcessState {
                child,
                service: spec.service.clone(),
                exited: None,
            },
        );

        Ok(ProcessHandle {
            id,
            service: spec.service.clone(),
            pid,
        })
    }

    async fn stop(
        &self,
        handle: &ProcessHandle,
        grace: Duration,
    ) -> Result<ExitReport, ProcessError> {
        let mut state = self
            .processes
            .write()
            .await
            .remove(&handle.id)
            .ok_or_else(|| ProcessError::NotFound {
                id: handle.id.clone(),
            })?;

        if let Some(code) = state.exited {
            return Ok(ExitReport {
                code,
                forced: false,
            });
        }

        debug!(service = %state.service, pid = ?handle.pid, "Terminating service process");

        #[cfg(unix)]
        if let Some(pid) = state.child.id() {
            terminate(pid, &handle.id)?;
        }
        #[cfg(not(unix))]
        state.child.start_kill().ok();

        match tokio::time::timeout(grace, state.child.wait()).await {
            Ok(Ok(status)) => {
                info!(service = %state.service, ?status, "Process exited");
                Ok(ExitReport {
                    code: status.code(),
                    forced: false,
                })
            }
            Ok(Err(e)) => {
                warn!(service = %state.service, error = %e, "Error waiting for process");
                state.child.kill().await.ok();
                Ok(ExitReport {
                    code: None,
                    forced: true,
                })
            }
            Err(_) => {
                warn!(service = %state.service, "Grace period expired, killing");
                state.child.kill().await.ok();
                Ok(ExitReport {
                    code: None,
                    forced: true,
                })
            }
        }
    }

    #[allow(clippy::significant_drop_tightening)]
    async fn liveness(&self, handle: &ProcessHandle) -> Result<Liveness, ProcessError> {
        let mut processes = self.processes.write().await;
        let state = processes
            .get_mut(&handle.id)
            .ok_or_else(|| ProcessError::NotFound {
                id: handle.id.clone(),
            })?;
        if let Some(code) = state.exited {
            return Ok(Liveness::Exited(code));
        }
        match state.child.try_wait() {
            Ok(Some(status)) => {
                state.exited = Some(status.code());
                Ok(Liveness::Exited(status.code()))
            }
            Ok(None) => Ok(Liveness::Running),
            Err(e) => {
                warn!(service = %state.service, error = %e, "Liveness query failed");
                Ok(Liveness::Running)
            }
        }
    }
}

#[cfg(unix)]
fn terminate(pid: u32, id: &str) -> Result<(), ProcessError> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|e| ProcessError::Signal {
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        // Already gone between try_wait and here.
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            id: id.to_string(),
            reason: e.to_string(),
        }),
    }
}

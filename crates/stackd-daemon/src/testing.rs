//! Scripted collaborators for orchestrator tests.
//!
//! [`ScriptedRunner`] pretends to run processes and records every call;
//! [`ScriptedProber`] answers probes from per-service scripts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use stackd_core::HealthCheckSpec;

use crate::health::{ProbeFailure, Prober};
use crate::process::{ExitReport, LaunchSpec, Liveness, ProcessError, ProcessHandle, ProcessRunner};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One recorded runner call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerCall {
    Start(String),
    Stop(String),
}

struct FakeProcess {
    service: String,
    exited: Option<Option<i32>>,
}

#[derive(Default)]
pub struct ScriptedRunner {
    processes: Mutex<HashMap<String, FakeProcess>>,
    calls: Mutex<Vec<RunnerCall>>,
    failing_starts: Mutex<HashMap<String, u32>>,
    start_delays: Mutex<HashMap<String, Duration>>,
    envs: Mutex<HashMap<String, BTreeMap<String, String>>>,
    next_pid: Mutex<u32>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` starts of `service` fail.
    pub fn fail_starts(&self, service: &str, count: u32) {
        lock(&self.failing_starts).insert(service.to_string(), count);
    }

    /// Delay every start of `service`, simulating a slow spawn.
    pub fn delay_starts(&self, service: &str, delay: Duration) {
        lock(&self.start_delays).insert(service.to_string(), delay);
    }

    /// Mark a specific process as exited.
    pub fn exit(&self, handle: &ProcessHandle, code: Option<i32>) {
        if let Some(process) = lock(&self.processes).get_mut(&handle.id) {
            process.exited = Some(code);
        }
    }

    /// Mark every live process of `service` as exited.
    pub fn exit_service(&self, service: &str, code: Option<i32>) {
        for process in lock(&self.processes).values_mut() {
            if process.service == service && process.exited.is_none() {
                process.exited = Some(code);
            }
        }
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        lock(&self.calls).clone()
    }

    pub fn starts(&self, service: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| **c == RunnerCall::Start(service.to_string()))
            .count()
    }

    /// Services in the order they were stopped.
    pub fn stop_order(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                RunnerCall::Stop(s) => Some(s.clone()),
                RunnerCall::Start(_) => None,
            })
            .collect()
    }

    pub fn running(&self, service: &str) -> bool {
        lock(&self.processes)
            .values()
            .any(|p| p.service == service && p.exited.is_none())
    }

    /// Environment passed to the most recent start of `service`.
    pub fn last_env(&self, service: &str) -> Option<BTreeMap<String, String>> {
        lock(&self.envs).get(service).cloned()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn start(&self, spec: &LaunchSpec) -> Result<ProcessHandle, ProcessError> {
        let delay = lock(&self.start_delays).get(&spec.service).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.calls).push(RunnerCall::Start(spec.service.clone()));
        lock(&self.envs).insert(spec.service.clone(), spec.env.clone());

        {
            let mut failing = lock(&self.failing_starts);
            if let Some(remaining) = failing.get_mut(&spec.service)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(ProcessError::SpawnFailed {
                    service: spec.service.clone(),
                    reason: "scripted failure".into(),
                });
            }
        }

        let pid = {
            let mut next = lock(&self.next_pid);
            *next += 1;
            1000 + *next
        };
        let id = format!("{}-{pid}", spec.service);
        lock(&self.processes).insert(
            id.clone(),
            FakeProcess {
                service: spec.service.clone(),
                exited: None,
            },
        );
        Ok(ProcessHandle {
            id,
            service: spec.service.clone(),
            pid: Some(pid),
        })
    }

    async fn stop(
        &self,
        handle: &ProcessHandle,
        _grace: Duration,
    ) -> Result<ExitReport, ProcessError> {
        let process = lock(&self.processes)
            .remove(&handle.id)
            .ok_or_else(|| ProcessError::NotFound {
                id: handle.id.clone(),
            })?;
        lock(&self.calls).push(RunnerCall::Stop(process.service));
        Ok(ExitReport {
            code: process.exited.unwrap_or(Some(0)),
            forced: false,
        })
    }

    async fn liveness(&self, handle: &ProcessHandle) -> Result<Liveness, ProcessError> {
        lock(&self.processes)
            .get(&handle.id)
            .map(|p| p.exited.map_or(Liveness::Running, Liveness::Exited))
            .ok_or_else(|| ProcessError::NotFound {
                id: handle.id.clone(),
            })
    }
}

#[derive(Default)]
struct ProbeScript {
    queue: VecDeque<bool>,
    default: Option<bool>,
    count: usize,
}

/// Answers probes from scripts; unscripted services are healthy.
#[derive(Default)]
pub struct ScriptedProber {
    scripts: Mutex<HashMap<String, ProbeScript>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue results for the next probes of `service`.
    pub fn script(&self, service: &str, results: impl IntoIterator<Item = bool>) {
        lock(&self.scripts)
            .entry(service.to_string())
            .or_default()
            .queue
            .extend(results);
    }

    /// Result once the queue for `service` is empty.
    pub fn set_default(&self, service: &str, healthy: bool) {
        lock(&self.scripts)
            .entry(service.to_string())
            .or_default()
            .default = Some(healthy);
    }

    pub fn probes(&self, service: &str) -> usize {
        lock(&self.scripts).get(service).map_or(0, |s| s.count)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, service: &str, _check: &HealthCheckSpec) -> Result<(), ProbeFailure> {
        let healthy = {
            let mut scripts = lock(&self.scripts);
            let script = scripts.entry(service.to_string()).or_default();
            script.count += 1;
            script
                .queue
                .pop_front()
                .or(script.default)
                .unwrap_or(true)
        };
        if healthy {
            Ok(())
        } else {
            Err(ProbeFailure::Failure("scripted failure".into()))
        }
    }
}

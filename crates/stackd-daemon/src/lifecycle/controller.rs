//! The lifecycle controller.
//!
//! A single control loop owns every [`RuntimeInstance`]. Start tasks (one per
//! dependency level, plus one per scheduled restart), monitor tasks and stop
//! tasks report back over one mpsc channel; the loop applies restart policy,
//! publishes state on the [`StateBoard`] and flips readiness on every
//! [`ReadinessListener`].
//!
//! Shutdown cancels dependency waits, resource waits, restart backoffs and
//! monitors, lets in-flight spawns finish, then stops the remaining
//! instances one at a time in reverse dependency order.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stackd_core::{Capacity, DependencyGraph, DescriptorStore, ResourceKind, ResourceRequest, Stack};
use stackd_proxy::RouteTable;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::RestartBackoff;
use super::board::StateBoard;
use super::error::LifecycleError;
use super::instance::{InstanceState, RuntimeInstance, owner_key};
use crate::health::{HealthState, MonitorEvent, MonitorSpec, ProbeOutcome, Prober, spawn_monitor};
use crate::process::{LaunchSpec, ProcessHandle, ProcessRunner};
use crate::resources::{LedgerError, LedgerHandle, ResourceClaim};
use crate::telemetry::Telemetry;

const EVENT_BUFFER: usize = 256;

/// Callback for readiness changes: `ready` is true exactly while the
/// service is healthy.
pub trait ReadinessListener: Send + Sync {
    fn readiness_changed(&self, service: &str, ready: bool);
}

impl ReadinessListener for RouteTable {
    fn readiness_changed(&self, service: &str, ready: bool) {
        if self.set_ready(service, ready) {
            debug!(service, ready, "Route readiness changed");
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Probe outcomes kept per instance.
    pub history: usize,
    /// Liveness poll period for services without a health check.
    pub liveness_interval: Duration,
    pub backoff: RestartBackoff,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            history: 10,
            liveness_interval: Duration::from_secs(1),
            backoff: RestartBackoff::default(),
        }
    }
}

impl OrchestratorOptions {
    pub fn from_stack(stack: &Stack) -> Self {
        Self {
            stop_grace: stack.settings.stop_grace(),
            history: stack.settings.history,
            backoff: RestartBackoff::from_settings(&stack.restart),
            ..Self::default()
        }
    }
}

/// Services stopped during shutdown, in stop order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub stopped: Vec<String>,
}

struct Shared {
    store: DescriptorStore,
    graph: DependencyGraph,
    options: OrchestratorOptions,
    runner: Arc<dyn ProcessRunner>,
    prober: Arc<dyn Prober>,
    ledger: LedgerHandle,
    board: StateBoard,
    telemetry: Telemetry,
    generations: AtomicU64,
}

/// Orchestrator under construction. Call [`start`](Self::start) to run it.
pub struct Orchestrator {
    store: DescriptorStore,
    graph: DependencyGraph,
    options: OrchestratorOptions,
    runner: Arc<dyn ProcessRunner>,
    prober: Arc<dyn Prober>,
    ledger: LedgerHandle,
    board: StateBoard,
    telemetry: Telemetry,
    listeners: Vec<Arc<dyn ReadinessListener>>,
}

impl Orchestrator {
    /// Must be called from within a Tokio runtime: the ledger actor is
    /// spawned here.
    pub fn new(
        store: DescriptorStore,
        graph: DependencyGraph,
        capacity: Capacity,
        options: OrchestratorOptions,
        runner: Arc<dyn ProcessRunner>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let board = StateBoard::new(store.names());
        Self {
            store,
            graph,
            options,
            runner,
            prober,
            ledger: LedgerHandle::spawn(capacity),
            board,
            telemetry: Telemetry::disabled(),
            listeners: Vec::new(),
        }
    }

    pub fn from_stack(
        stack: &Stack,
        runner: Arc<dyn ProcessRunner>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self::new(
            stack.store.clone(),
            stack.graph.clone(),
            stack.capacity,
            OrchestratorOptions::from_stack(stack),
            runner,
            prober,
        )
    }

    #[must_use]
    pub fn with_readiness_listener(mut self, listener: Arc<dyn ReadinessListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub const fn board(&self) -> &StateBoard {
        &self.board
    }

    pub const fn ledger(&self) -> &LedgerHandle {
        &self.ledger
    }

    /// Spawn the control loop and dispatch every dependency level.
    pub fn start(self) -> OrchestratorHandle {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let shutdown = CancellationToken::new();
        let board = self.board.clone();
        let ledger = self.ledger.clone();

        let shared = Arc::new(Shared {
            store: self.store,
            graph: self.graph,
            options: self.options,
            runner: self.runner,
            prober: self.prober,
            ledger: self.ledger,
            board: self.board,
            telemetry: self.telemetry,
            generations: AtomicU64::new(0),
        });

        let levels: Vec<Vec<String>> = shared
            .graph
            .levels()
            .into_iter()
            .map(|level| level.into_iter().map(str::to_string).collect())
            .collect();
        info!(
            services = shared.store.len(),
            levels = levels.len(),
            "Starting orchestrator"
        );

        let mut controller = Controller {
            shared,
            listeners: self.listeners,
            instances: HashMap::new(),
            attempts: HashMap::new(),
            events,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            shutting_down: false,
        };
        for level in levels {
            controller.spawn_level(level);
        }

        let task = tokio::spawn(controller.run(rx, shutdown.clone()));
        OrchestratorHandle {
            board,
            ledger,
            shutdown,
            task,
        }
    }
}

/// Handle to a running orchestrator.
pub struct OrchestratorHandle {
    board: StateBoard,
    ledger: LedgerHandle,
    shutdown: CancellationToken,
    task: JoinHandle<ShutdownReport>,
}

impl OrchestratorHandle {
    pub const fn board(&self) -> &StateBoard {
        &self.board
    }

    pub const fn ledger(&self) -> &LedgerHandle {
        &self.ledger
    }

    /// Stop every instance in reverse dependency order and wait for it.
    pub async fn shutdown(self) -> ShutdownReport {
        self.shutdown.cancel();
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Control loop terminated abnormally");
                ShutdownReport::default()
            }
        }
    }
}

enum ControlEvent {
    /// Transient resource exhaustion; the start task keeps waiting.
    Waiting {
        service: String,
        error: String,
    },
    /// Claims granted, spawn under way.
    Spawning {
        service: String,
        claims: Vec<ResourceClaim>,
    },
    Started {
        service: String,
        generation: u64,
        handle: ProcessHandle,
        claims: Vec<ResourceClaim>,
    },
    StartFailed {
        service: String,
        error: LifecycleError,
    },
    DependencyFailed {
        service: String,
        error: LifecycleError,
    },
    Monitor(MonitorEvent),
    Reaped {
        service: String,
        generation: u64,
        next: AfterReap,
    },
}

impl From<MonitorEvent> for ControlEvent {
    fn from(event: MonitorEvent) -> Self {
        Self::Monitor(event)
    }
}

/// What to do once a downed instance has been stopped and its claims released.
#[derive(Debug, Clone, Copy)]
enum AfterReap {
    Restart(Duration),
    Settle,
}

enum Down {
    Unhealthy { failures: u32 },
    Exited(Option<i32>),
}

struct Controller {
    shared: Arc<Shared>,
    listeners: Vec<Arc<dyn ReadinessListener>>,
    instances: HashMap<String, RuntimeInstance>,
    /// Consecutive restarts per service, reset on Healthy.
    attempts: HashMap<String, u32>,
    events: mpsc::Sender<ControlEvent>,
    tasks: JoinSet<()>,
    /// Parent of every wait, backoff and monitor token.
    cancel: CancellationToken,
    shutting_down: bool,
}

impl Controller {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ControlEvent>,
        shutdown: CancellationToken,
    ) -> ShutdownReport {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(event) = rx.recv() => self.handle(event),
                Some(joined) = self.tasks.join_next() => Self::joined(joined),
            }
        }
        self.shutdown(rx).await
    }

    fn joined(result: Result<(), JoinError>) {
        if let Err(e) = result
            && e.is_panic()
        {
            error!(error = %e, "Lifecycle task panicked");
        }
    }

    fn board(&self) -> &StateBoard {
        &self.shared.board
    }

    fn notify(&self, service: &str, ready: bool) {
        for listener in &self.listeners {
            listener.readiness_changed(service, ready);
        }
    }

    fn spawn_level(&mut self, members: Vec<String>) {
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            let mut starts = JoinSet::new();
            for service in members {
                starts.spawn(start_service(
                    Arc::clone(&shared),
                    service,
                    Duration::ZERO,
                    events.clone(),
                    cancel.clone(),
                ));
            }
            while starts.join_next().await.is_some() {}
        });
    }

    fn spawn_restart(&mut self, service: String, delay: Duration) {
        self.tasks.spawn(start_service(
            Arc::clone(&self.shared),
            service,
            delay,
            self.events.clone(),
            self.cancel.clone(),
        ));
    }

    fn spawn_stop(&mut self, instance: RuntimeInstance, next: AfterReap) {
        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        self.tasks.spawn(async move {
            let owner = instance.owner();
            match shared
                .runner
                .stop(&instance.handle, shared.options.stop_grace)
                .await
            {
                Ok(report) => debug!(
                    service = %instance.service,
                    code = ?report.code,
                    forced = report.forced,
                    "Instance reaped"
                ),
                Err(e) => debug!(service = %instance.service, error = %e, "Instance already gone"),
            }
            release(&shared, &owner).await;
            let _ = events
                .send(ControlEvent::Reaped {
                    service: instance.service,
                    generation: instance.generation,
                    next,
                })
                .await;
        });
    }

    fn handle(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Waiting { service, error } => {
                self.board().update(&service, |s| {
                    s.state = InstanceState::Pending;
                    s.error = Some(error);
                });
            }
            ControlEvent::Spawning { service, claims } => {
                self.board().update(&service, |s| {
                    s.state = InstanceState::Starting;
                    s.claims = claims;
                    s.error = None;
                });
            }
            ControlEvent::Started {
                service,
                generation,
                handle,
                claims,
            } => self.on_started(service, generation, handle, claims),
            ControlEvent::StartFailed { service, error } => self.on_start_failed(&service, &error),
            ControlEvent::DependencyFailed { service, error } => {
                warn!(service = %service, error = %error, "Service blocked by failed dependency");
                self.board().update(&service, |s| {
                    s.state = InstanceState::DependencyFailed;
                    s.error = Some(error.to_string());
                });
            }
            ControlEvent::Monitor(_) if self.shutting_down => {}
            ControlEvent::Monitor(MonitorEvent::Health {
                service,
                generation,
                state,
                outcome,
                failures,
            }) => self.on_health(&service, generation, state, outcome, failures),
            ControlEvent::Monitor(MonitorEvent::Exited {
                service,
                generation,
                code,
            }) => {
                if self.is_current(&service, generation) {
                    self.instance_down(&service, Down::Exited(code));
                }
            }
            ControlEvent::Reaped {
                service,
                generation,
                next,
            } => {
                self.board().update(&service, |s| {
                    if s.generation == generation {
                        s.pid = None;
                        s.claims.clear();
                    }
                });
                if let AfterReap::Restart(delay) = next
                    && !self.shutting_down
                {
                    self.spawn_restart(service, delay);
                }
            }
        }
    }

    fn is_current(&self, service: &str, generation: u64) -> bool {
        self.instances
            .get(service)
            .is_some_and(|i| i.generation == generation)
    }

    fn on_started(
        &mut self,
        service: String,
        generation: u64,
        handle: ProcessHandle,
        claims: Vec<ResourceClaim>,
    ) {
        let monitor = self.cancel.child_token();
        let pid = handle.pid;
        let instance = RuntimeInstance::new(
            service.clone(),
            generation,
            handle.clone(),
            claims.iter().map(|c| c.id).collect(),
            self.shared.options.history,
            monitor.clone(),
        );

        if !self.shutting_down {
            let check = self
                .shared
                .store
                .get(&service)
                .and_then(|d| d.health_check.clone());
            spawn_monitor(
                MonitorSpec {
                    service: service.clone(),
                    generation,
                    handle,
                    check,
                    liveness_interval: self.shared.options.liveness_interval,
                },
                Arc::clone(&self.shared.runner),
                Arc::clone(&self.shared.prober),
                self.events.clone(),
                monitor,
            );
        }

        self.board().update(&service, |s| {
            s.state = InstanceState::Starting;
            s.generation = generation;
            s.pid = pid;
            s.claims = claims;
            s.last_probe = None;
            s.history.clear();
            s.error = None;
        });
        info!(service = %service, generation, pid = ?pid, "Service process started");
        self.instances.insert(service, instance);
    }

    fn on_health(
        &mut self,
        service: &str,
        generation: u64,
        state: HealthState,
        outcome: Option<ProbeOutcome>,
        failures: u32,
    ) {
        let Some(instance) = self
            .instances
            .get_mut(service)
            .filter(|i| i.generation == generation)
        else {
            debug!(service, generation, "Ignoring stale health report");
            return;
        };

        if let Some(outcome) = &outcome {
            instance.record(outcome.clone());
            if !outcome.success {
                self.shared.telemetry.probe_failure(service);
            }
        }
        let previous = instance.state;
        let next = InstanceState::from(state);
        instance.state = next;
        let history = instance.history.iter().cloned().collect();

        self.shared.board.update(service, |s| {
            s.history = history;
            if outcome.is_some() {
                s.last_probe = outcome;
            }
            if next != InstanceState::Failed {
                s.state = next;
            }
        });

        if next == InstanceState::Failed {
            self.instance_down(service, Down::Unhealthy { failures });
            return;
        }
        if previous == next {
            return;
        }
        match next {
            InstanceState::Healthy => {
                info!(service, generation, "Service healthy");
                self.attempts.remove(service);
                self.notify(service, true);
            }
            InstanceState::Unhealthy => {
                warn!(service, generation, "Service unhealthy");
                self.notify(service, false);
            }
            _ => {}
        }
    }

    fn instance_down(&mut self, service: &str, cause: Down) {
        let Some(instance) = self.instances.remove(service) else {
            return;
        };
        instance.monitor.cancel();
        self.notify(service, false);

        let (exit_code, reason) = match cause {
            Down::Unhealthy { failures } => (
                None,
                format!("health check failed {failures} consecutive times"),
            ),
            Down::Exited(Some(code)) => (Some(code), format!("process exited with code {code}")),
            Down::Exited(None) => (None, "process terminated abnormally".to_string()),
        };
        let next = self.decide(service, exit_code, reason);
        self.spawn_stop(instance, next);
    }

    fn on_start_failed(&mut self, service: &str, error: &LifecycleError) {
        if self.shutting_down || matches!(error, LifecycleError::ResourceExhausted(_)) {
            // Never satisfiable (or too late to retry).
            error!(service, error = %error, "Service failed to start");
            self.board().update(service, |s| {
                s.state = InstanceState::Failed;
                s.error = Some(error.to_string());
            });
            if !self.shutting_down {
                self.log_blocked(service);
            }
            return;
        }
        if let AfterReap::Restart(delay) = self.decide(service, None, error.to_string()) {
            self.spawn_restart(service.to_string(), delay);
        }
    }

    /// Apply the restart policy to an instance that went down.
    fn decide(&mut self, service: &str, exit_code: Option<i32>, reason: String) -> AfterReap {
        let policy = self
            .shared
            .store
            .get(service)
            .map(|d| d.restart_policy)
            .unwrap_or_default();

        if policy.restarts_after(exit_code) {
            let attempt = self.attempts.get(service).copied().unwrap_or(0);
            let backoff = &self.shared.options.backoff;
            if backoff.should_retry(attempt) {
                let delay = backoff.delay_for_attempt(attempt);
                self.attempts.insert(service.to_string(), attempt + 1);
                self.shared.telemetry.restart(service);
                warn!(
                    service,
                    attempt = attempt + 1,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    reason = %reason,
                    "Restarting service"
                );
                self.board().update(service, |s| {
                    s.state = InstanceState::Restarting;
                    s.restarts += 1;
                    s.error = Some(reason);
                });
                return AfterReap::Restart(delay);
            }

            let exhausted = LifecycleError::RestartsExhausted {
                service: service.to_string(),
                restarts: attempt,
            };
            error!(service, error = %exhausted, reason = %reason, "Giving up on service");
            self.board().update(service, |s| {
                s.state = InstanceState::Failed;
                s.error = Some(format!("{reason}; {exhausted}"));
            });
            self.log_blocked(service);
            return AfterReap::Settle;
        }

        if exit_code == Some(0) {
            info!(service, "Service exited");
            self.board().update(service, |s| {
                s.state = InstanceState::Exited;
                s.error = None;
            });
        } else {
            error!(service, reason = %reason, "Service failed");
            self.board().update(service, |s| {
                s.state = InstanceState::Failed;
                s.error = Some(reason);
            });
            self.log_blocked(service);
        }
        AfterReap::Settle
    }

    /// Dependents that can no longer start because `service` is terminal.
    fn log_blocked(&self, service: &str) {
        let blocked = self.shared.graph.transitive_dependents(service);
        if !blocked.is_empty() {
            warn!(service, blocked = ?blocked, "Dependents will report DependencyFailed");
        }
    }

    async fn shutdown(mut self, mut rx: mpsc::Receiver<ControlEvent>) -> ShutdownReport {
        info!(running = self.instances.len(), "Shutting down services");
        self.shutting_down = true;
        self.cancel.cancel();
        for name in self.shared.store.names() {
            self.notify(name, false);
        }

        // In-flight spawns and stops finish first; their events are applied
        // so nothing they started is orphaned.
        while !self.tasks.is_empty() {
            tokio::select! {
                Some(event) = rx.recv() => self.handle(event),
                Some(joined) = self.tasks.join_next() => Self::joined(joined),
            }
        }
        while let Ok(event) = rx.try_recv() {
            self.handle(event);
        }

        let shared = Arc::clone(&self.shared);
        let mut stopped = Vec::new();
        for name in shared.graph.shutdown_order() {
            let Some(instance) = self.instances.remove(name) else {
                shared.board.update(name, |s| {
                    if !s.state.is_terminal() {
                        s.state = InstanceState::Stopped;
                    }
                });
                continue;
            };
            shared
                .board
                .update(name, |s| s.state = InstanceState::Stopping);
            instance.monitor.cancel();
            info!(service = name, "Stopping service");
            match shared
                .runner
                .stop(&instance.handle, shared.options.stop_grace)
                .await
            {
                Ok(report) => info!(
                    service = name,
                    code = ?report.code,
                    forced = report.forced,
                    "Service stopped"
                ),
                Err(e) => warn!(service = name, error = %e, "Service was already gone"),
            }
            release(&shared, &instance.owner()).await;
            shared.board.update(name, |s| {
                s.state = InstanceState::Stopped;
                s.pid = None;
                s.claims.clear();
            });
            stopped.push(name.to_string());
        }
        info!(stopped = stopped.len(), "All services stopped");
        ShutdownReport { stopped }
    }
}

/// Wait, reserve and spawn one service, then report to the control loop.
async fn start_service(
    shared: Arc<Shared>,
    service: String,
    delay: Duration,
    events: mpsc::Sender<ControlEvent>,
    cancel: CancellationToken,
) {
    if !delay.is_zero() {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
    let generation = shared.generations.fetch_add(1, Ordering::Relaxed) + 1;
    let event = match launch(&shared, &service, generation, &events, &cancel).await {
        Ok((handle, claims)) => ControlEvent::Started {
            service,
            generation,
            handle,
            claims,
        },
        Err(LifecycleError::Shutdown) => {
            debug!(service = %service, "Start abandoned for shutdown");
            return;
        }
        Err(error @ LifecycleError::DependencyFailed { .. }) => {
            ControlEvent::DependencyFailed { service, error }
        }
        Err(error) => ControlEvent::StartFailed { service, error },
    };
    let _ = events.send(event).await;
}

async fn launch(
    shared: &Shared,
    service: &str,
    generation: u64,
    events: &mpsc::Sender<ControlEvent>,
    cancel: &CancellationToken,
) -> Result<(ProcessHandle, Vec<ResourceClaim>), LifecycleError> {
    let desc = shared
        .store
        .get(service)
        .ok_or_else(|| LifecycleError::UnknownService(service.to_string()))?;

    for dependency in shared.graph.dependencies_of(service) {
        debug!(service, dependency, "Waiting for dependency");
        tokio::select! {
            () = cancel.cancelled() => return Err(LifecycleError::Shutdown),
            result = shared.board.wait_healthy(dependency) => result?,
        }
    }

    let owner = owner_key(service, generation);
    let claims = reserve(shared, service, &owner, desc.resources, events, cancel).await?;
    if cancel.is_cancelled() {
        release(shared, &owner).await;
        return Err(LifecycleError::Shutdown);
    }

    let mut spec = LaunchSpec::from_descriptor(desc);
    let devices: Vec<String> = claims
        .iter()
        .filter(|c| c.kind == ResourceKind::Gpu)
        .flat_map(|c| c.devices.iter().map(ToString::to_string))
        .collect();
    if !devices.is_empty() {
        let list = devices.join(",");
        spec.env_default("CUDA_VISIBLE_DEVICES", list.clone());
        spec.env_default("NVIDIA_VISIBLE_DEVICES", list);
    }

    let _ = events
        .send(ControlEvent::Spawning {
            service: service.to_string(),
            claims: claims.clone(),
        })
        .await;
    info!(service, generation, program = %spec.program, "Starting service");

    // Not cancellable: a spawn that began always completes.
    match shared.runner.start(&spec).await {
        Ok(handle) => Ok((handle, claims)),
        Err(e) => {
            release(shared, &owner).await;
            Err(e.into())
        }
    }
}

/// Reserve everything `request` needs, waiting out transient exhaustion.
async fn reserve(
    shared: &Shared,
    service: &str,
    owner: &str,
    request: ResourceRequest,
    events: &mpsc::Sender<ControlEvent>,
    cancel: &CancellationToken,
) -> Result<Vec<ResourceClaim>, LifecycleError> {
    if request.is_empty() {
        return Ok(Vec::new());
    }
    let mut releases = shared.ledger.releases();
    let mut attempt: u32 = 0;
    loop {
        releases.mark_unchanged();
        match shared.ledger.reserve_all(request, owner).await {
            Ok(claims) => {
                if attempt > 0 {
                    info!(service, attempt, "Resources became available");
                }
                return Ok(claims);
            }
            Err(e) if e.is_permanent() => return Err(e.into()),
            Err(e @ LedgerError::ResourceExhausted { .. }) => {
                if attempt == 0 {
                    shared.telemetry.resource_wait(service);
                }
                let delay = shared.options.backoff.delay_for_attempt(attempt);
                info!(service, error = %e, attempt, "Waiting for resources");
                let _ = events
                    .send(ControlEvent::Waiting {
                        service: service.to_string(),
                        error: e.to_string(),
                    })
                    .await;
                tokio::select! {
                    () = cancel.cancelled() => return Err(LifecycleError::Shutdown),
                    _ = releases.changed() => {}
                    () = tokio::time::sleep(delay) => {}
                }
                attempt = attempt.saturating_add(1);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn release(shared: &Shared, owner: &str) {
    match shared.ledger.release_owner(owner).await {
        Ok(claims) if !claims.is_empty() => {
            debug!(owner, released = claims.len(), "Released resource claims");
        }
        Ok(_) => {}
        Err(e) => warn!(owner, error = %e, "Failed to release resource claims"),
    }
}

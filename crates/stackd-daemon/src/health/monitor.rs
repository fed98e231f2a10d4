//! One monitor task per running instance.
//!
//! After the grace delay the task polls liveness and runs the health probe
//! on every interval, feeding results through a [`HealthTracker`] and
//! reporting each step to the controller. It never mutates shared state.

use std::sync::Arc;
use std::time::Duration;

use stackd_core::HealthCheckSpec;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::probe::{ProbeFailure, ProbeOutcome, Prober, probe_with_timeout};
use super::tracker::{HealthState, HealthTracker};
use crate::process::{Liveness, ProcessHandle, ProcessRunner};

/// Report from a monitor task, tagged with the instance generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Health {
        service: String,
        generation: u64,
        state: HealthState,
        outcome: Option<ProbeOutcome>,
        /// Consecutive failures when `state` is `Failed`.
        failures: u32,
    },
    Exited {
        service: String,
        generation: u64,
        code: Option<i32>,
    },
}

pub struct MonitorSpec {
    pub service: String,
    pub generation: u64,
    pub handle: ProcessHandle,
    pub check: Option<HealthCheckSpec>,
    /// Poll period for services without a health check.
    pub liveness_interval: Duration,
}

pub fn spawn_monitor<E>(
    spec: MonitorSpec,
    runner: Arc<dyn ProcessRunner>,
    prober: Arc<dyn Prober>,
    events: mpsc::Sender<E>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    E: From<MonitorEvent> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(service = %spec.service, generation = spec.generation, "Monitor cancelled");
            }
            () = run(&spec, runner.as_ref(), prober.as_ref(), &events) => {}
        }
    })
}

async fn emit<E: From<MonitorEvent>>(events: &mpsc::Sender<E>, event: MonitorEvent) -> bool {
    events.send(E::from(event)).await.is_ok()
}

async fn run<E: From<MonitorEvent>>(
    spec: &MonitorSpec,
    runner: &dyn ProcessRunner,
    prober: &dyn Prober,
    events: &mpsc::Sender<E>,
) {
    let health = |state: HealthState, outcome: Option<ProbeOutcome>, failures: u32| {
        MonitorEvent::Health {
            service: spec.service.clone(),
            generation: spec.generation,
            state,
            outcome,
            failures,
        }
    };

    let mut tracker = spec.check.as_ref().map(|check| {
        HealthTracker::new(check.success_threshold, check.failure_threshold)
    });
    let period = spec
        .check
        .as_ref()
        .map_or(spec.liveness_interval, |check| check.interval);

    if let Some(check) = &spec.check
        && !check.start_delay.is_zero()
    {
        tokio::time::sleep(check.start_delay).await;
    }
    if let Some(tracker) = tracker.as_mut() {
        let state = tracker.begin_probing();
        if !emit(events, health(state, None, 0)).await {
            return;
        }
    }

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut announced = false;

    loop {
        ticker.tick().await;

        match runner.liveness(&spec.handle).await {
            Ok(Liveness::Running) => {}
            Ok(Liveness::Exited(code)) => {
                emit(
                    events,
                    MonitorEvent::Exited {
                        service: spec.service.clone(),
                        generation: spec.generation,
                        code,
                    },
                )
                .await;
                return;
            }
            Err(e) => {
                warn!(service = %spec.service, error = %e, "Lost track of process");
                emit(
                    events,
                    MonitorEvent::Exited {
                        service: spec.service.clone(),
                        generation: spec.generation,
                        code: None,
                    },
                )
                .await;
                return;
            }
        }

        let (Some(check), Some(tracker)) = (spec.check.as_ref(), tracker.as_mut()) else {
            // No health check: alive means healthy.
            if !announced {
                announced = true;
                if !emit(events, health(HealthState::Healthy, None, 0)).await {
                    return;
                }
            }
            continue;
        };

        let result: Result<(), ProbeFailure> =
            probe_with_timeout(prober, &spec.service, check).await;
        if let Err(e) = &result {
            debug!(service = %spec.service, error = %e, "Probe failed");
        }
        let outcome = ProbeOutcome::from_result(&result);
        let state = tracker.record(result.is_ok());
        let failures = tracker.consecutive_failures();
        if !emit(events, health(state, Some(outcome), failures)).await {
            return;
        }
        if state == HealthState::Failed {
            return;
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use stackd_core::ProbeKind;

    use super::*;
    use crate::process::LaunchSpec;
    use crate::testing::{ScriptedProber, ScriptedRunner};

    fn check(success: u32, failure: u32) -> HealthCheckSpec {
        HealthCheckSpec {
            kind: ProbeKind::Tcp,
            target: "127.0.0.1:1".into(),
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
            start_delay: Duration::ZERO,
            success_threshold: success,
            failure_threshold: failure,
        }
    }

    async fn start(runner: &ScriptedRunner, service: &str) -> ProcessHandle {
        let desc = stackd_core::ServiceDescriptor::new(service, "/bin/x");
        runner.start(&LaunchSpec::from_descriptor(&desc)).await.unwrap()
    }

    async fn next(rx: &mut mpsc::Receiver<MonitorEvent>) -> MonitorEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    fn state_of(event: &MonitorEvent) -> HealthState {
        match event {
            MonitorEvent::Health { state, .. } => *state,
            other => panic!("expected health event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reaches_healthy_after_threshold() {
        let runner = Arc::new(ScriptedRunner::new());
        let prober = Arc::new(ScriptedProber::new());
        prober.script("db", [true, true]);
        let handle = start(&runner, "db").await;
        let (tx, mut rx) = mpsc::channel(16);
        let spec = MonitorSpec {
            service: "db".into(),
            generation: 1,
            handle,
            check: Some(check(2, 3)),
            liveness_interval: Duration::from_millis(10),
        };
        let cancel = CancellationToken::new();
        spawn_monitor(spec, runner, prober, tx, cancel.clone());

        assert_eq!(state_of(&next(&mut rx).await), HealthState::Probing);
        assert_eq!(state_of(&next(&mut rx).await), HealthState::Probing);
        assert_eq!(state_of(&next(&mut rx).await), HealthState::Healthy);
        cancel.cancel();
    }

    #[tokio::test]
    async fn reports_failed_then_stops() {
        let runner = Arc::new(ScriptedRunner::new());
        let prober = Arc::new(ScriptedProber::new());
        prober.set_default("db", false);
        let handle = start(&runner, "db").await;
        let (tx, mut rx) = mpsc::channel(16);
        let spec = MonitorSpec {
            service: "db".into(),
            generation: 4,
            handle,
            check: Some(check(1, 2)),
            liveness_interval: Duration::from_millis(10),
        };
        let task = spawn_monitor(spec, runner, prober, tx, CancellationToken::new());

        assert_eq!(state_of(&next(&mut rx).await), HealthState::Probing);
        assert_eq!(state_of(&next(&mut rx).await), HealthState::Unhealthy);
        match next(&mut rx).await {
            MonitorEvent::Health {
                state,
                generation,
                failures,
                ..
            } => {
                assert_eq!(state, HealthState::Failed);
                assert_eq!(generation, 4);
                assert_eq!(failures, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn unchecked_service_is_healthy_while_alive() {
        let runner = Arc::new(ScriptedRunner::new());
        let prober = Arc::new(ScriptedProber::new());
        let handle = start(&runner, "cache").await;
        let (tx, mut rx) = mpsc::channel(16);
        let spec = MonitorSpec {
            service: "cache".into(),
            generation: 1,
            handle: handle.clone(),
            check: None,
            liveness_interval: Duration::from_millis(10),
        };
        spawn_monitor(spec, runner.clone(), prober, tx, CancellationToken::new());

        assert_eq!(state_of(&next(&mut rx).await), HealthState::Healthy);
        runner.exit(&handle, Some(1));
        assert_eq!(
            next(&mut rx).await,
            MonitorEvent::Exited {
                service: "cache".into(),
                generation: 1,
                code: Some(1)
            }
        );
    }
}

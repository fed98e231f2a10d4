//! Per-service status board.
//!
//! One `watch` channel per service. The controller is the only writer;
//! start tasks, the status endpoint and the binary read or wait on it.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use super::error::LifecycleError;
use super::instance::InstanceState;
use crate::health::ProbeOutcome;
use crate::resources::ResourceClaim;

/// Externally visible status of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub state: InstanceState,
    pub generation: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe: Option<ProbeOutcome>,
    pub history: Vec<ProbeOutcome>,
    pub claims: Vec<ResourceClaim>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ServiceStatus {
    fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: InstanceState::Pending,
            generation: 0,
            pid: None,
            restarts: 0,
            last_probe: None,
            history: Vec::new(),
            claims: Vec::new(),
            error: None,
        }
    }
}

#[derive(Clone)]
pub struct StateBoard {
    channels: Arc<BTreeMap<String, watch::Sender<ServiceStatus>>>,
}

impl StateBoard {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let channels = names
            .into_iter()
            .map(|name| {
                let (tx, _) = watch::channel(ServiceStatus::pending(name));
                (name.to_string(), tx)
            })
            .collect();
        Self {
            channels: Arc::new(channels),
        }
    }

    pub fn get(&self, name: &str) -> Option<ServiceStatus> {
        self.channels.get(name).map(|tx| tx.borrow().clone())
    }

    /// Every service, sorted by name.
    pub fn all(&self) -> Vec<ServiceStatus> {
        self.channels.values().map(|tx| tx.borrow().clone()).collect()
    }

    pub fn state(&self, name: &str) -> Option<InstanceState> {
        self.channels.get(name).map(|tx| tx.borrow().state)
    }

    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<ServiceStatus>> {
        self.channels.get(name).map(watch::Sender::subscribe)
    }

    pub(crate) fn update(&self, name: &str, apply: impl FnOnce(&mut ServiceStatus)) {
        if let Some(tx) = self.channels.get(name) {
            tx.send_modify(apply);
        }
    }

    /// Resolve once `name` is healthy. A terminal state yields
    /// [`LifecycleError::DependencyFailed`].
    pub async fn wait_healthy(&self, name: &str) -> Result<(), LifecycleError> {
        let mut rx = self
            .subscribe(name)
            .ok_or_else(|| LifecycleError::UnknownService(name.to_string()))?;
        let state = rx
            .wait_for(|s| s.state.is_settled())
            .await
            .map_err(|_| LifecycleError::Shutdown)?
            .state;
        if state == InstanceState::Healthy {
            Ok(())
        } else {
            Err(LifecycleError::DependencyFailed {
                dependency: name.to_string(),
                state,
            })
        }
    }

    /// Resolve once every service has settled, healthy or terminal.
    pub async fn wait_settled(&self) {
        for tx in self.channels.values() {
            let mut rx = tx.subscribe();
            if rx.wait_for(|s| s.state.is_settled()).await.is_err() {
                return;
            }
        }
    }
}

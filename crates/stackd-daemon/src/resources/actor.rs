//! Single-owner actor serialising every ledger call.
//!
//! Parallel starts within a dependency level all reserve through the same
//! [`LedgerHandle`]; the actor task applies requests one at a time, so two
//! reservations can never jointly overcommit a kind.

use stackd_core::{Capacity, ResourceKind, ResourceRequest};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use super::ledger::{ClaimId, Ledger, LedgerError, LedgerSnapshot, ResourceClaim};

type Reply<T> = oneshot::Sender<Result<T, LedgerError>>;

enum Command {
    Reserve {
        kind: ResourceKind,
        quantity: u64,
        owner: String,
        reply: Reply<ResourceClaim>,
    },
    ReserveAll {
        request: ResourceRequest,
        owner: String,
        reply: Reply<Vec<ResourceClaim>>,
    },
    Release {
        id: ClaimId,
        reply: Reply<ResourceClaim>,
    },
    ReleaseOwner {
        owner: String,
        reply: Reply<Vec<ResourceClaim>>,
    },
    Snapshot {
        reply: Reply<LedgerSnapshot>,
    },
}

/// Cloneable handle to the ledger actor.
#[derive(Clone)]
pub struct LedgerHandle {
    tx: mpsc::Sender<Command>,
    releases: watch::Receiver<u64>,
}

impl LedgerHandle {
    /// Spawn the actor. It stops once every handle is dropped.
    pub fn spawn(capacity: Capacity) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (release_tx, releases) = watch::channel(0);
        tokio::spawn(run(Ledger::new(capacity), rx, release_tx));
        Self { tx, releases }
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, LedgerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| LedgerError::Closed)?;
        rx.await.map_err(|_| LedgerError::Closed)?
    }

    pub async fn reserve(
        &self,
        kind: ResourceKind,
        quantity: u64,
        owner: &str,
    ) -> Result<ResourceClaim, LedgerError> {
        let owner = owner.to_string();
        self.call(|reply| Command::Reserve {
            kind,
            quantity,
            owner,
            reply,
        })
        .await
    }

    pub async fn reserve_all(
        &self,
        request: ResourceRequest,
        owner: &str,
    ) -> Result<Vec<ResourceClaim>, LedgerError> {
        let owner = owner.to_string();
        self.call(|reply| Command::ReserveAll {
            request,
            owner,
            reply,
        })
        .await
    }

    pub async fn release(&self, id: ClaimId) -> Result<ResourceClaim, LedgerError> {
        self.call(|reply| Command::Release { id, reply }).await
    }

    pub async fn release_owner(&self, owner: &str) -> Result<Vec<ResourceClaim>, LedgerError> {
        let owner = owner.to_string();
        self.call(|reply| Command::ReleaseOwner { owner, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<LedgerSnapshot, LedgerError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    /// Counter bumped after every release. Waiters for transient exhaustion
    /// mark it seen before reserving, then wait for a change.
    pub fn releases(&self) -> watch::Receiver<u64> {
        self.releases.clone()
    }
}

async fn run(mut ledger: Ledger, mut rx: mpsc::Receiver<Command>, releases: watch::Sender<u64>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Reserve {
                kind,
                quantity,
                owner,
                reply,
            } => {
                let _ = reply.send(ledger.reserve(kind, quantity, &owner));
            }
            Command::ReserveAll {
                request,
                owner,
                reply,
            } => {
                let result = ledger.reserve_all(&request, &owner);
                if let Ok(claims) = &result {
                    debug!(owner, claims = claims.len(), "Resources reserved");
                }
                let _ = reply.send(result);
            }
            Command::Release { id, reply } => {
                let result = ledger.release(id);
                if result.is_ok() {
                    releases.send_modify(|n| *n += 1);
                }
                let _ = reply.send(result);
            }
            Command::ReleaseOwner { owner, reply } => {
                let released = ledger.release_owner(&owner);
                if !released.is_empty() {
                    debug!(owner, claims = released.len(), "Resources released");
                    releases.send_modify(|n| *n += 1);
                }
                let _ = reply.send(Ok(released));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(ledger.snapshot()));
            }
        }
    }
    debug!("Resource ledger stopped");
}

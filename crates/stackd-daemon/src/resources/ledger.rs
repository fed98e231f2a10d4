//! Pure resource ledger.
//!
//! Tracks capacity per [`ResourceKind`] and every active claim. The sum of
//! active claims per kind never exceeds that kind's capacity; all mutation
//! goes through `&mut self`, serialisation is the caller's job (see
//! [`LedgerHandle`](super::LedgerHandle)).

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use stackd_core::{Capacity, ResourceKind, ResourceRequest};

pub type ClaimId = u64;

/// A quantity of one resource kind held by one owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceClaim {
    pub id: ClaimId,
    pub kind: ResourceKind,
    pub quantity: u64,
    pub owner: String,
    /// Concrete GPU device indices; empty for other kinds.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error(
        "Resource exhausted: {kind} requested {requested}, available {available} of {capacity}"
    )]
    ResourceExhausted {
        kind: ResourceKind,
        requested: u64,
        available: u64,
        capacity: u64,
    },

    #[error("Unknown claim {0}")]
    UnknownClaim(ClaimId),

    #[error("Resource ledger is closed")]
    Closed,
}

impl LedgerError {
    /// The request can never be satisfied, whatever gets released.
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::ResourceExhausted { requested, capacity, .. } if *requested > *capacity)
    }
}

/// Per-kind usage for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindUsage {
    pub kind: ResourceKind,
    pub unit: &'static str,
    /// `None` means unlimited.
    pub capacity: Option<u64>,
    pub in_use: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSnapshot {
    pub usage: Vec<KindUsage>,
    pub claims: Vec<ResourceClaim>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    capacity: Capacity,
    in_use: BTreeMap<ResourceKind, u64>,
    free_devices: BTreeSet<u32>,
    claims: BTreeMap<ClaimId, ResourceClaim>,
    next_id: ClaimId,
}

impl Ledger {
    pub fn new(capacity: Capacity) -> Self {
        let devices = u32::try_from(capacity.gpus).unwrap_or(u32::MAX);
        Self {
            capacity,
            in_use: BTreeMap::new(),
            free_devices: (0..devices).collect(),
            claims: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn in_use(&self, kind: ResourceKind) -> u64 {
        self.in_use.get(&kind).copied().unwrap_or(0)
    }

    /// Remaining quantity for `kind`, `None` when unlimited.
    pub fn available(&self, kind: ResourceKind) -> Option<u64> {
        self.capacity
            .limit(kind)
            .map(|cap| cap.saturating_sub(self.in_use(kind)))
    }

    fn check(&self, kind: ResourceKind, quantity: u64) -> Result<(), LedgerError> {
        match (self.capacity.limit(kind), self.available(kind)) {
            (Some(capacity), Some(available)) if quantity > available => {
                Err(LedgerError::ResourceExhausted {
                    kind,
                    requested: quantity,
                    available,
                    capacity,
                })
            }
            _ => Ok(()),
        }
    }

    fn grant(&mut self, kind: ResourceKind, quantity: u64, owner: &str) -> ResourceClaim {
        let devices: Vec<u32> = if kind == ResourceKind::Gpu {
            let take = usize::try_from(quantity).unwrap_or(usize::MAX);
            self.free_devices.iter().copied().take(take).collect()
        } else {
            Vec::new()
        };
        for device in &devices {
            self.free_devices.remove(device);
        }
        *self.in_use.entry(kind).or_insert(0) += quantity;

        let claim = ResourceClaim {
            id: self.next_id,
            kind,
            quantity,
            owner: owner.to_string(),
            devices,
        };
        self.next_id += 1;
        self.claims.insert(claim.id, claim.clone());
        claim
    }

    /// Reserve `quantity` of one kind.
    pub fn reserve(
        &mut self,
        kind: ResourceKind,
        quantity: u64,
        owner: &str,
    ) -> Result<ResourceClaim, LedgerError> {
        self.check(kind, quantity)?;
        Ok(self.grant(kind, quantity, owner))
    }

    /// Reserve every non-zero demand of `request`, or nothing at all.
    pub fn reserve_all(
        &mut self,
        request: &ResourceRequest,
        owner: &str,
    ) -> Result<Vec<ResourceClaim>, LedgerError> {
        let demands = request.demands();
        for (kind, quantity) in &demands {
            self.check(*kind, *quantity)?;
        }
        Ok(demands
            .into_iter()
            .map(|(kind, quantity)| self.grant(kind, quantity, owner))
            .collect())
    }

    pub fn release(&mut self, id: ClaimId) -> Result<ResourceClaim, LedgerError> {
        let claim = self.claims.remove(&id).ok_or(LedgerError::UnknownClaim(id))?;
        if let Some(used) = self.in_use.get_mut(&claim.kind) {
            *used = used.saturating_sub(claim.quantity);
        }
        self.free_devices.extend(claim.devices.iter().copied());
        Ok(claim)
    }

    /// Release every claim held by `owner`.
    pub fn release_owner(&mut self, owner: &str) -> Vec<ResourceClaim> {
        let ids: Vec<ClaimId> = self
            .claims
            .values()
            .filter(|c| c.owner == owner)
            .map(|c| c.id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.release(id).ok())
            .collect()
    }

    pub fn claims(&self) -> impl Iterator<Item = &ResourceClaim> {
        self.claims.values()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            usage: ResourceKind::ALL
                .iter()
                .map(|&kind| KindUsage {
                    kind,
                    unit: kind.unit(),
                    capacity: self.capacity.limit(kind),
                    in_use: self.in_use(kind),
                })
                .collect(),
            claims: self.claims.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn capacity(cpu: Option<u64>, gpus: u64) -> Capacity {
        Capacity {
            cpu_millis: cpu,
            memory_bytes: Some(1024),
            gpus,
        }
    }

    #[test]
    fn single_gpu_is_exclusive() {
        let mut ledger = Ledger::new(capacity(None, 1));
        let first = ledger.reserve(ResourceKind::Gpu, 1, "a#1").unwrap();
        assert_eq!(first.devices, vec![0]);

        let err = ledger.reserve(ResourceKind::Gpu, 1, "b#1").unwrap_err();
        assert!(!err.is_permanent());
        match err {
            LedgerError::ResourceExhausted {
                available,
                capacity,
                ..
            } => {
                assert_eq!(available, 0);
                assert_eq!(capacity, 1);
            }
            other => panic!("unexpected: {other}"),
        }

        ledger.release(first.id).unwrap();
        let second = ledger.reserve(ResourceKind::Gpu, 1, "b#1").unwrap();
        assert_eq!(second.devices, vec![0]);
    }

    #[test]
    fn devices_are_distinct_across_claims() {
        let mut ledger = Ledger::new(capacity(None, 3));
        let a = ledger.reserve(ResourceKind::Gpu, 2, "a#1").unwrap();
        let b = ledger.reserve(ResourceKind::Gpu, 1, "b#1").unwrap();
        assert_eq!(a.devices, vec![0, 1]);
        assert_eq!(b.devices, vec![2]);
    }

    #[test]
    fn request_beyond_capacity_is_permanent() {
        let mut ledger = Ledger::new(capacity(Some(2000), 1));
        let err = ledger.reserve(ResourceKind::Gpu, 2, "a#1").unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn unlimited_kinds_never_exhaust() {
        let mut ledger = Ledger::new(capacity(None, 0));
        for i in 0..100 {
            ledger
                .reserve(ResourceKind::Cpu, 64_000, &format!("s{i}"))
                .unwrap();
        }
        assert_eq!(ledger.available(ResourceKind::Cpu), None);
        assert_eq!(ledger.in_use(ResourceKind::Cpu), 6_400_000);
    }

    #[test]
    fn reserve_all_is_atomic() {
        let mut ledger = Ledger::new(capacity(Some(4000), 0));
        let request = ResourceRequest {
            cpu_millis: 1000,
            memory_bytes: 0,
            gpus: 1,
        };
        assert!(ledger.reserve_all(&request, "llm#1").is_err());
        // The CPU part must not have been granted.
        assert_eq!(ledger.in_use(ResourceKind::Cpu), 0);
        assert_eq!(ledger.claims().count(), 0);
    }

    #[test]
    fn release_owner_frees_everything_it_holds() {
        let mut ledger = Ledger::new(capacity(Some(4000), 2));
        let request = ResourceRequest {
            cpu_millis: 1500,
            memory_bytes: 512,
            gpus: 1,
        };
        let claims = ledger.reserve_all(&request, "llm#1").unwrap();
        assert_eq!(claims.len(), 3);
        ledger.reserve(ResourceKind::Cpu, 500, "db#1").unwrap();

        let released = ledger.release_owner("llm#1");
        assert_eq!(released.len(), 3);
        assert_eq!(ledger.in_use(ResourceKind::Cpu), 500);
        assert_eq!(ledger.in_use(ResourceKind::Memory), 0);
        assert_eq!(ledger.available(ResourceKind::Gpu), Some(2));
    }

    #[test]
    fn double_release_is_rejected() {
        let mut ledger = Ledger::new(capacity(Some(1000), 0));
        let claim = ledger.reserve(ResourceKind::Cpu, 100, "a#1").unwrap();
        ledger.release(claim.id).unwrap();
        assert_eq!(
            ledger.release(claim.id).unwrap_err(),
            LedgerError::UnknownClaim(claim.id)
        );
    }

    #[test]
    fn snapshot_reports_usage_per_kind() {
        let mut ledger = Ledger::new(capacity(Some(1000), 1));
        ledger.reserve(ResourceKind::Cpu, 250, "a#1").unwrap();
        let snap = ledger.snapshot();
        let cpu = snap
            .usage
            .iter()
            .find(|u| u.kind == ResourceKind::Cpu)
            .unwrap();
        assert_eq!(cpu.in_use, 250);
        assert_eq!(cpu.capacity, Some(1000));
        assert_eq!(snap.claims.len(), 1);
    }
}

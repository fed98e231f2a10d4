//! Resource reservation: a capacity ledger behind a single-owner actor.

pub mod actor;
pub mod ledger;

pub use actor::LedgerHandle;
pub use ledger::{ClaimId, KindUsage, Ledger, LedgerError, LedgerSnapshot, ResourceClaim};

//! Connection-slot leasing and reclamation.

mod pool;
mod reaper;

pub use pool::{ReapPolicy, SlotPool, SlotPoolError};
pub use reaper::{LeaseObservation, ReapReport, ReclaimedLease};

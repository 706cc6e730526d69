//! Leader/Worker fleets of execution-engine processes.
//!
//! The [`FleetManager`] keeps one Leader and N Workers per mode on top of the
//! slot pool; the [`HealthMonitor`] sweeps them on a fixed interval.

mod manager;
mod monitor;
pub mod output;
mod types;

pub use manager::{FleetManager, FleetSettings};
pub use monitor::{HealthMonitor, SweepReport};
pub use types::{
    FleetError, FleetInstance, FleetSnapshot, FleetState, Health, InstanceSnapshot, ModeSweep,
    Role, owner_ref, parse_owner_ref,
};

//! slotwarden daemon library
//!
//! Core functionality for the supervisor:
//! - SQLite storage for connection slots and leader history
//! - Slot pool with atomic leasing and stale-lease reclamation
//! - Execution-engine process handles and launcher
//! - Leader/Worker fleets with failover and a periodic health monitor
//! - Operator control surface

pub mod control;
pub mod fleet;
pub mod process;
pub mod slots;
pub mod storage;

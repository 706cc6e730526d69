//! `SQLite` storage for the slotwarden daemon.
//!
//! Provides persistence for slot records, per-mode slot ranges and the
//! leader promotion audit trail.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::*;

//! Database connection and initialization.

pub use slotwarden_core::db::DatabaseError;

slotwarden_core::define_database!(Database, "Database migrations complete");

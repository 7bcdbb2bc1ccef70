//! `SQLite` storage for the Keyward maintenance orchestrator.
//!
//! Provides persistence for users, hosts, keys, probe results, telemetry
//! and live settings, plus the [`HostRegistry`], [`KeyStore`] and
//! [`LiveSettings`] seams the engines consume.

mod db;
mod models;
mod queries;
mod queries_jobs;
mod store;

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries::NewHost;
pub use queries_jobs::SNAPSHOT_INTERVAL_SETTING;
pub use store::{HostRegistry, KeyStore, LiveSettings};

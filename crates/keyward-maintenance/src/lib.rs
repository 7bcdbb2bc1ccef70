//! Keyward maintenance orchestrator.
//!
//! Keeps the local key registry converged with the remote provisioning
//! panels of every host, warns users before their keys expire, and runs
//! interval-gated host jobs (capacity probes, telemetry, snapshots):
//! - [`reconcile`] diffs local keys against each host and applies the plan
//! - [`expiry`] sends at most one warning per key per threshold
//! - [`jobs`] holds the gated probe, telemetry and snapshot jobs
//! - [`scheduler`] drives all of the above in a perpetual loop
//! - [`lifecycle`] issues, renews and migrates keys on operator request

pub mod correlation;
pub mod expiry;
pub mod jobs;
pub mod lifecycle;
pub mod notify;
pub mod panel;
pub mod reconcile;
pub mod scheduler;
pub mod storage;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

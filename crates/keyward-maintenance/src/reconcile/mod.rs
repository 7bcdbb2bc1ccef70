//! Key reconciliation.
//!
//! Each pass runs in three steps per host: fetch both sides, diff them into
//! a [`HostPlan`] with the pure [`plan_host`], then apply every action as an
//! independent unit of work. One host failing never affects another.

mod engine;
pub mod plan;

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests;

pub use engine::{
    FailureClass, HostReport, HostStage, HostStatus, KeyOutcome, OrphanMiss, ReconcileReport,
    Reconciler,
};
pub use plan::{Adoption, HostPlan, KeyAction, ReconcilePolicy, plan_host};

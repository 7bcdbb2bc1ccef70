//! Auxiliary maintenance jobs and the gate that spaces their runs.
//!
//! Each job has a target trait (the production implementation talks to
//! hosts, `/proc` or the database) and a `run_*_job` driver that isolates
//! per-host and per-recipient failures.

pub mod gate;
pub mod probe;
pub mod snapshot;
pub mod ssh;
pub mod telemetry;

pub use gate::{GateOutcome, JobGate, JobState};
pub use probe::{
    NetworkProber, ProbeError, ProbeJobReport, ProbeMeasurement, ProbeTarget, run_probe_job,
};
pub use snapshot::{
    DeliveryReport, Snapshot, SnapshotError, SnapshotJobReport, SnapshotTarget, SqliteSnapshotter,
    run_snapshot_job,
};
pub use ssh::{SshError, SshRunner};
pub use telemetry::{
    SystemTelemetry, TelemetryError, TelemetryJobReport, TelemetrySample, TelemetryTarget,
    run_telemetry_job,
};

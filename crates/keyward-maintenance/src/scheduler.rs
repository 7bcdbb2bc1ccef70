//! The perpetual maintenance loop.
//!
//! One cycle runs, in order: reconciliation, the probe, telemetry and
//! snapshot gates, and the expiry check. Every stage is isolated, so a
//! stage that fails or panics is logged and the next one still runs.
//! Cycles never overlap: the cycle period is slept after a cycle completes.

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use keyward_core::Config;
use keyward_core::db::unix_timestamp_ms;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::expiry::{ExpiryNotifier, ExpiryReport};
use crate::jobs::{
    GateOutcome, JobGate, ProbeJobReport, ProbeTarget, SnapshotJobReport, SnapshotTarget,
    TelemetryJobReport, TelemetryTarget, run_probe_job, run_snapshot_job, run_telemetry_job,
};
use crate::notify::Notifier;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::storage::{DatabaseError, HostRegistry, LiveSettings};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Timing knobs of the loop and its gated jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerTimings {
    pub initial_delay: Duration,
    pub cycle_period: Duration,
    pub probe_interval: Duration,
    pub telemetry_interval: Duration,
    /// Used when the live setting is unset or unreadable.
    pub default_snapshot_interval_days: u32,
    /// Ceiling for one gated job run.
    pub job_timeout: Duration,
}

impl SchedulerTimings {
    pub fn from_config(config: &Config) -> Self {
        let m = &config.maintenance;
        Self {
            initial_delay: m.initial_delay(),
            cycle_period: m.cycle_period(),
            probe_interval: m.probe_interval(),
            telemetry_interval: m.telemetry_interval(),
            default_snapshot_interval_days: config.snapshot.default_interval_days,
            job_timeout: m.job_timeout(),
        }
    }
}

/// Where snapshots go and how many are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotPolicy {
    pub recipients: Vec<i64>,
    pub retention: usize,
}

/// Everything a [`Scheduler`] is assembled from.
pub struct SchedulerParts {
    pub reconciler: Reconciler,
    pub expiry: ExpiryNotifier,
    pub notifier: Arc<dyn Notifier>,
    pub hosts: Arc<dyn HostRegistry>,
    pub settings: Arc<dyn LiveSettings>,
    pub probe: Arc<dyn ProbeTarget>,
    pub telemetry: Arc<dyn TelemetryTarget>,
    pub snapshot: Arc<dyn SnapshotTarget>,
    pub snapshot_policy: SnapshotPolicy,
    pub timings: SchedulerTimings,
}

/// Outcome of one gated job within a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRun<R> {
    pub outcome: GateOutcome,
    /// Present when the job ran to completion.
    pub report: Option<R>,
}

impl<R> JobRun<R> {
    pub const fn ran(&self) -> bool {
        self.outcome.ran()
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    /// `None` when the host list could not be read.
    pub reconcile: Option<ReconcileReport>,
    pub probe: JobRun<ProbeJobReport>,
    pub telemetry: JobRun<TelemetryJobReport>,
    pub snapshot: JobRun<SnapshotJobReport>,
    /// `None` when the notifier is inactive or the key list failed.
    pub expiry: Option<ExpiryReport>,
}

pub struct Scheduler {
    reconciler: Reconciler,
    expiry: ExpiryNotifier,
    notifier: Arc<dyn Notifier>,
    hosts: Arc<dyn HostRegistry>,
    settings: Arc<dyn LiveSettings>,
    probe: Arc<dyn ProbeTarget>,
    telemetry: Arc<dyn TelemetryTarget>,
    snapshot: Arc<dyn SnapshotTarget>,
    snapshot_policy: SnapshotPolicy,
    timings: SchedulerTimings,
    probe_gate: JobGate,
    telemetry_gate: JobGate,
    snapshot_gate: JobGate,
}

impl Scheduler {
    pub fn new(parts: SchedulerParts) -> Self {
        Self {
            reconciler: parts.reconciler,
            expiry: parts.expiry,
            notifier: parts.notifier,
            hosts: parts.hosts,
            settings: parts.settings,
            probe: parts.probe,
            telemetry: parts.telemetry,
            snapshot: parts.snapshot,
            snapshot_policy: parts.snapshot_policy,
            timings: parts.timings,
            probe_gate: JobGate::new("probe"),
            telemetry_gate: JobGate::new("telemetry"),
            snapshot_gate: JobGate::new("snapshot"),
        }
    }

    pub const fn probe_gate(&self) -> &JobGate {
        &self.probe_gate
    }

    pub const fn telemetry_gate(&self) -> &JobGate {
        &self.telemetry_gate
    }

    pub const fn snapshot_gate(&self) -> &JobGate {
        &self.snapshot_gate
    }

    /// Run the loop until `shutdown` flips to `true` or its sender is dropped.
    /// Shutdown is honoured at every sleep and between reconciled hosts.
    pub async fn start(mut self, mut shutdown: watch::Receiver<bool>) {
        self.reconciler.set_shutdown(shutdown.clone());
        info!(
            initial_delay_secs = self.timings.initial_delay.as_secs(),
            cycle_period_secs = self.timings.cycle_period.as_secs(),
            "Maintenance scheduler started"
        );

        if sleep_or_shutdown(self.timings.initial_delay, &mut shutdown).await {
            loop {
                self.run_cycle(unix_timestamp_ms()).await;
                if !sleep_or_shutdown(self.timings.cycle_period, &mut shutdown).await {
                    break;
                }
            }
        }
        info!("Maintenance scheduler stopped");
    }

    /// Exactly one cycle at `now_ms`.
    pub async fn run_cycle(&mut self, now_ms: i64) -> CycleReport {
        let reconcile = match guarded("reconcile", self.reconciler.reconcile(now_ms)).await {
            Some(Ok(report)) => Some(report),
            Some(Err(e)) => {
                error!(error = %e, "Reconciliation pass failed");
                None
            }
            None => None,
        };

        let probe = self.run_probe(now_ms).await;
        let telemetry = self.run_telemetry(now_ms).await;
        let snapshot = self.run_snapshot(now_ms).await;
        let expiry = guarded("expiry", self.run_expiry(now_ms)).await.flatten();

        debug!(
            probe_ran = probe.ran(),
            telemetry_ran = telemetry.ran(),
            snapshot_ran = snapshot.ran(),
            "Maintenance cycle complete"
        );
        CycleReport {
            reconcile,
            probe,
            telemetry,
            snapshot,
            expiry,
        }
    }

    async fn run_probe(&mut self, now_ms: i64) -> JobRun<ProbeJobReport> {
        let hosts = Arc::clone(&self.hosts);
        let target = Arc::clone(&self.probe);
        gated(
            &mut self.probe_gate,
            now_ms,
            self.timings.probe_interval,
            self.timings.job_timeout,
            || async move {
                let hosts = hosts.list_hosts().await?;
                Ok::<_, DatabaseError>(run_probe_job(target.as_ref(), &hosts, now_ms).await)
            },
        )
        .await
    }

    async fn run_telemetry(&mut self, now_ms: i64) -> JobRun<TelemetryJobReport> {
        let hosts = Arc::clone(&self.hosts);
        let target = Arc::clone(&self.telemetry);
        gated(
            &mut self.telemetry_gate,
            now_ms,
            self.timings.telemetry_interval,
            self.timings.job_timeout,
            || async move {
                let hosts = hosts.list_hosts().await?;
                Ok::<_, DatabaseError>(run_telemetry_job(target.as_ref(), &hosts, now_ms).await)
            },
        )
        .await
    }

    async fn run_snapshot(&mut self, now_ms: i64) -> JobRun<SnapshotJobReport> {
        let interval = self.snapshot_interval().await;
        let target = Arc::clone(&self.snapshot);
        let policy = self.snapshot_policy.clone();
        gated(
            &mut self.snapshot_gate,
            now_ms,
            interval,
            self.timings.job_timeout,
            || async move {
                run_snapshot_job(
                    target.as_ref(),
                    &policy.recipients,
                    policy.retention,
                    now_ms,
                )
                .await
            },
        )
        .await
    }

    /// Re-read on every check so a changed setting applies to the next
    /// due-check.
    async fn snapshot_interval(&self) -> Duration {
        let fallback = self.timings.default_snapshot_interval_days;
        let days = match self.settings.snapshot_interval_days().await {
            Ok(days) => days.unwrap_or(fallback),
            Err(e) => {
                warn!(error = %e, "Reading snapshot interval failed, using default");
                fallback
            }
        };
        Duration::from_secs(u64::from(days) * SECS_PER_DAY)
    }

    async fn run_expiry(&mut self, now_ms: i64) -> Option<ExpiryReport> {
        if !self.notifier.is_active() && !self.notifier.reactivate().await {
            debug!("Notifier inactive, skipping expiry check");
            return None;
        }
        match self.expiry.check_expiring(now_ms).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "Expiry check failed");
                None
            }
        }
    }
}

/// Await `stage`, turning a panic into a logged `None`.
async fn guarded<T>(name: &'static str, stage: impl Future<Output = T>) -> Option<T> {
    match AssertUnwindSafe(stage).catch_unwind().await {
        Ok(value) => Some(value),
        Err(payload) => {
            error!(
                stage = name,
                panic = panic_message(payload.as_ref()),
                "Maintenance stage panicked"
            );
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Run `body` through `gate`, keeping its report when it completes. A
/// panicking body counts as a failed attempt.
async fn gated<R, F, Fut, E>(
    gate: &mut JobGate,
    now_ms: i64,
    interval: Duration,
    ceiling: Duration,
    body: F,
) -> JobRun<R>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
    E: Display,
{
    let mut report = None;
    let slot = &mut report;
    let outcome = gate
        .run_if_due(now_ms, interval, ceiling, || async move {
            match AssertUnwindSafe(body()).catch_unwind().await {
                Ok(Ok(value)) => {
                    *slot = Some(value);
                    Ok(())
                }
                Ok(Err(e)) => Err(e.to_string()),
                Err(payload) => Err(format!("panicked: {}", panic_message(payload.as_ref()))),
            }
        })
        .await;
    JobRun { outcome, report }
}

/// Sleep for `duration`. Returns `false` as soon as shutdown is requested.
async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);
    loop {
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            () = &mut sleep => return !*shutdown.borrow(),
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::jobs::JobState;

    #[tokio::test]
    async fn sleep_completes_without_shutdown() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(sleep_or_shutdown(Duration::from_millis(5), &mut rx).await);
    }

    #[tokio::test]
    async fn shutdown_interrupts_sleep() {
        let (tx, mut rx) = watch::channel(false);
        let sleeper = tokio::spawn(async move {
            sleep_or_shutdown(Duration::from_secs(3600), &mut rx).await
        });
        tx.send(true).unwrap();
        let continued = tokio::time::timeout(Duration::from_secs(5), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!continued);
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        assert!(!sleep_or_shutdown(Duration::from_secs(3600), &mut rx).await);
    }

    #[tokio::test]
    async fn gated_keeps_report_of_completed_run() {
        let mut gate = JobGate::new("probe");
        let run = gated(&mut gate, 0, Duration::from_secs(60), Duration::from_secs(5), || async {
            Ok::<_, String>(7)
        })
        .await;
        assert_eq!(run.outcome, GateOutcome::Succeeded);
        assert_eq!(run.report, Some(7));

        let again = gated(&mut gate, 1, Duration::from_secs(60), Duration::from_secs(5), || async {
            Ok::<_, String>(8)
        })
        .await;
        assert_eq!(again.outcome, GateOutcome::NotDue);
        assert_eq!(again.report, None);
    }

    #[tokio::test]
    async fn panicking_job_counts_as_failed_attempt() {
        let mut gate = JobGate::new("probe");
        let run = gated(&mut gate, 0, Duration::from_secs(60), Duration::from_secs(5), || async {
            if gate_should_panic() {
                panic!("probe exploded");
            }
            Ok::<u32, String>(1)
        })
        .await;

        assert_eq!(run.outcome, GateOutcome::Failed("panicked: probe exploded".into()));
        assert_eq!(run.report, None);
        assert_eq!(gate.last_run_ms(), Some(0));
        assert_eq!(gate.state(), JobState::Idle);
    }

    fn gate_should_panic() -> bool {
        true
    }

    #[tokio::test]
    async fn guarded_stage_survives_panic() {
        let caught = guarded("expiry", async {
            if gate_should_panic() {
                panic!("{} went wrong", "expiry");
            }
            5
        })
        .await;
        assert_eq!(caught, None);
        assert_eq!(guarded("expiry", async { 5 }).await, Some(5));
    }

    #[test]
    fn timings_follow_config() {
        let mut config = Config::default();
        config.snapshot.default_interval_days = 3;
        let timings = SchedulerTimings::from_config(&config);
        assert_eq!(timings.cycle_period, Duration::from_secs(60));
        assert_eq!(timings.probe_interval, Duration::from_secs(6 * 3600));
        assert_eq!(timings.default_snapshot_interval_days, 3);
    }
}

//! Run-at-most-every-interval gate shared by the auxiliary jobs.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Lifecycle of one gated job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// What a due-check did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    NotDue,
    Succeeded,
    Failed(String),
    TimedOut,
}

impl GateOutcome {
    pub const fn ran(&self) -> bool {
        !matches!(self, Self::NotDue)
    }
}

/// Due-state of one job: when it last ran and how that attempt ended.
#[derive(Debug, Clone)]
pub struct JobGate {
    name: &'static str,
    last_run_ms: Option<i64>,
    state: JobState,
    last_result: Option<JobState>,
}

impl JobGate {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            last_run_ms: None,
            state: JobState::Idle,
            last_result: None,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn last_run_ms(&self) -> Option<i64> {
        self.last_run_ms
    }

    pub const fn state(&self) -> JobState {
        self.state
    }

    /// `Succeeded` or `Failed` for the most recent attempt.
    pub const fn last_result(&self) -> Option<JobState> {
        self.last_result
    }

    /// Whether `interval` has elapsed since the last attempt. A job that
    /// never ran is due.
    pub fn is_due(&self, now_ms: i64, interval: Duration) -> bool {
        self.last_run_ms
            .is_none_or(|last| now_ms.saturating_sub(last) >= duration_ms(interval))
    }

    /// Run `body` if due, bounded by `ceiling`. `last_run` is set to `now_ms`
    /// after every attempt, whatever its result.
    pub async fn run_if_due<F, Fut, E>(
        &mut self,
        now_ms: i64,
        interval: Duration,
        ceiling: Duration,
        body: F,
    ) -> GateOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        if !self.is_due(now_ms, interval) {
            return GateOutcome::NotDue;
        }

        self.state = JobState::Running;
        debug!(job = self.name, "Job started");
        let outcome = match tokio::time::timeout(ceiling, body()).await {
            Ok(Ok(())) => GateOutcome::Succeeded,
            Ok(Err(e)) => {
                warn!(job = self.name, error = %e, "Job failed");
                GateOutcome::Failed(e.to_string())
            }
            Err(_) => {
                warn!(job = self.name, ceiling_secs = ceiling.as_secs(), "Job timed out");
                GateOutcome::TimedOut
            }
        };

        self.last_result = Some(if outcome == GateOutcome::Succeeded {
            JobState::Succeeded
        } else {
            JobState::Failed
        });
        self.last_run_ms = Some(now_ms);
        self.state = JobState::Idle;
        outcome
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::cell::Cell;

    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);
    const CEILING: Duration = Duration::from_secs(5);

    async fn ok() -> Result<(), String> {
        Ok(())
    }

    #[tokio::test]
    async fn first_check_is_due() {
        let mut gate = JobGate::new("probe");
        assert!(gate.is_due(0, HOUR));
        assert_eq!(gate.run_if_due(0, HOUR, CEILING, ok).await, GateOutcome::Succeeded);
        assert_eq!(gate.last_run_ms(), Some(0));
        assert_eq!(gate.state(), JobState::Idle);
        assert_eq!(gate.last_result(), Some(JobState::Succeeded));
    }

    #[tokio::test]
    async fn not_due_until_interval_elapsed() {
        let mut gate = JobGate::new("probe");
        gate.run_if_due(1_000, HOUR, CEILING, ok).await;

        let counter = Cell::new(0);
        let runs = &counter;
        let body = move || async move {
            runs.set(runs.get() + 1);
            Ok::<(), String>(())
        };
        assert_eq!(
            gate.run_if_due(1_000 + 3_599_999, HOUR, CEILING, body).await,
            GateOutcome::NotDue
        );
        assert_eq!(counter.get(), 0);
        assert!(gate.run_if_due(1_000 + 3_600_000, HOUR, CEILING, body).await.ran());
        assert_eq!(counter.get(), 1);
    }

    #[tokio::test]
    async fn failure_still_advances_last_run() {
        let mut gate = JobGate::new("telemetry");
        let outcome = gate
            .run_if_due(500, HOUR, CEILING, || async { Err::<(), _>("boom") })
            .await;
        assert_eq!(outcome, GateOutcome::Failed("boom".into()));
        assert_eq!(gate.last_run_ms(), Some(500));
        assert_eq!(gate.last_result(), Some(JobState::Failed));
        assert!(!gate.is_due(600, HOUR));
    }

    #[tokio::test]
    async fn body_exceeding_ceiling_times_out() {
        let mut gate = JobGate::new("snapshot");
        let outcome = gate
            .run_if_due(0, HOUR, Duration::from_millis(20), || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), String>(())
            })
            .await;
        assert_eq!(outcome, GateOutcome::TimedOut);
        assert_eq!(gate.last_run_ms(), Some(0));
        assert_eq!(gate.last_result(), Some(JobState::Failed));
    }

    #[test]
    fn interval_change_applies_on_next_check() {
        let mut gate = JobGate::new("snapshot");
        gate.last_run_ms = Some(0);
        assert!(!gate.is_due(2 * 3_600_000, 3 * HOUR));
        assert!(gate.is_due(2 * 3_600_000, HOUR));
    }
}

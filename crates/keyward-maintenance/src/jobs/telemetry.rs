//! Resource telemetry from `/proc`, locally and over SSH.

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::ssh::{SshError, SshRunner};
use crate::storage::{Database, DatabaseError, Host, LOCAL_SOURCE, TelemetryPoint};

const REMOTE_COMMAND: &str = "cat /proc/loadavg; echo ---; cat /proc/meminfo";
const SECTION_DELIMITER: &str = "\n---\n";

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Telemetry not configured: {0}")]
    NotConfigured(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("Unreadable telemetry: {0}")]
    Parse(String),
}

/// One reading before it is stamped with a source and time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub mem_total_kb: i64,
    pub mem_available_kb: i64,
}

impl TelemetrySample {
    pub fn into_point(self, source: &str, recorded_at_ms: i64) -> TelemetryPoint {
        TelemetryPoint {
            source: source.to_string(),
            load1: self.load1,
            load5: self.load5,
            load15: self.load15,
            mem_total_kb: self.mem_total_kb,
            mem_available_kb: self.mem_available_kb,
            recorded_at_ms,
        }
    }
}

#[async_trait]
pub trait TelemetryTarget: Send + Sync {
    async fn collect_local(&self) -> Result<TelemetrySample, TelemetryError>;

    async fn collect_remote(&self, host: &Host) -> Result<TelemetrySample, TelemetryError>;

    async fn persist(&self, point: &TelemetryPoint) -> Result<(), DatabaseError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryJobReport {
    pub recorded: usize,
    pub failed: usize,
}

/// Collect local telemetry, then remote telemetry for every host with SSH
/// credentials. Each source is isolated from the others.
#[instrument(skip_all)]
pub async fn run_telemetry_job(
    target: &dyn TelemetryTarget,
    hosts: &[Host],
    now_ms: i64,
) -> TelemetryJobReport {
    let mut report = TelemetryJobReport::default();

    let local = target.collect_local().await;
    record(target, LOCAL_SOURCE, local, now_ms, &mut report).await;

    for host in hosts.iter().filter(|h| h.ssh_target().is_some()) {
        let remote = target.collect_remote(host).await;
        record(target, &host.name, remote, now_ms, &mut report).await;
    }

    info!(
        recorded = report.recorded,
        failed = report.failed,
        "Telemetry job complete"
    );
    report
}

async fn record(
    target: &dyn TelemetryTarget,
    source: &str,
    sample: Result<TelemetrySample, TelemetryError>,
    now_ms: i64,
    report: &mut TelemetryJobReport,
) {
    let sample = match sample {
        Ok(s) => s,
        Err(e) => {
            warn!(source, error = %e, "Telemetry collection failed");
            report.failed += 1;
            return;
        }
    };
    match target.persist(&sample.into_point(source, now_ms)).await {
        Ok(()) => report.recorded += 1,
        Err(e) => {
            warn!(source, error = %e, "Persisting telemetry failed");
            report.failed += 1;
        }
    }
}

/// Production [`TelemetryTarget`].
#[derive(Clone)]
pub struct SystemTelemetry {
    db: Database,
    ssh: SshRunner,
}

impl SystemTelemetry {
    pub const fn new(db: Database, ssh: SshRunner) -> Self {
        Self { db, ssh }
    }
}

async fn read_proc(path: &'static str) -> Result<String, TelemetryError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| TelemetryError::Read { path, source })
}

#[async_trait]
impl TelemetryTarget for SystemTelemetry {
    async fn collect_local(&self) -> Result<TelemetrySample, TelemetryError> {
        let loadavg = read_proc("/proc/loadavg").await?;
        let meminfo = read_proc("/proc/meminfo").await?;
        parse_sample(&loadavg, &meminfo)
    }

    async fn collect_remote(&self, host: &Host) -> Result<TelemetrySample, TelemetryError> {
        let target = host.ssh_target().ok_or_else(|| {
            TelemetryError::NotConfigured(format!("{} has no SSH credentials", host.name))
        })?;
        let output = self.ssh.run(&target, REMOTE_COMMAND).await?;
        parse_remote_output(&output)
    }

    async fn persist(&self, point: &TelemetryPoint) -> Result<(), DatabaseError> {
        self.db.insert_telemetry_point(point).await.map(|_| ())
    }
}

pub(crate) fn parse_remote_output(output: &str) -> Result<TelemetrySample, TelemetryError> {
    let mut sections = output.splitn(2, SECTION_DELIMITER);
    let loadavg = sections.next().unwrap_or_default();
    let meminfo = sections
        .next()
        .ok_or_else(|| TelemetryError::Parse("missing meminfo section".into()))?;
    parse_sample(loadavg, meminfo)
}

pub(crate) fn parse_sample(
    loadavg: &str,
    meminfo: &str,
) -> Result<TelemetrySample, TelemetryError> {
    let mut loads = loadavg.split_whitespace().map(str::parse::<f64>);
    let mut next_load = |name: &str| {
        loads
            .next()
            .and_then(Result::ok)
            .ok_or_else(|| TelemetryError::Parse(format!("loadavg: missing {name}")))
    };
    let load1 = next_load("1m")?;
    let load5 = next_load("5m")?;
    let load15 = next_load("15m")?;

    let mem_total_kb = meminfo_kb(meminfo, "MemTotal")?;
    let mem_available_kb = meminfo_kb(meminfo, "MemAvailable")?;

    Ok(TelemetrySample {
        load1,
        load5,
        load15,
        mem_total_kb,
        mem_available_kb,
    })
}

fn meminfo_kb(meminfo: &str, field: &str) -> Result<i64, TelemetryError> {
    meminfo
        .lines()
        .find_map(|line| {
            let (name, rest) = line.split_once(':')?;
            if name.trim() != field {
                return None;
            }
            rest.split_whitespace().next()?.parse::<i64>().ok()
        })
        .ok_or_else(|| TelemetryError::Parse(format!("meminfo: missing {field}")))
}

//! Capacity probing: a thorough bandwidth probe run on each host and a light
//! reachability probe against its panel endpoint.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::{info, instrument, warn};

use super::ssh::{SshError, SshRunner};
use crate::storage::{Database, DatabaseError, Host, ProbeKind, ProbeRecord};

const SPEEDTEST_COMMAND: &str = "speedtest --accept-license --accept-gdpr --format=json";

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Probe not configured: {0}")]
    NotConfigured(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("Connect failed: {0}")]
    Connect(String),

    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unreadable probe output: {0}")]
    Parse(String),
}

/// Numbers produced by a successful probe.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProbeMeasurement {
    pub latency_ms: Option<f64>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
}

#[async_trait]
pub trait ProbeTarget: Send + Sync {
    async fn run_thorough_probe(&self, host: &Host) -> Result<ProbeMeasurement, ProbeError>;

    async fn run_light_probe(&self, host: &Host) -> Result<ProbeMeasurement, ProbeError>;

    async fn persist(&self, record: &ProbeRecord) -> Result<(), DatabaseError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeJobReport {
    pub hosts: usize,
    pub failed_probes: usize,
    pub persist_failures: usize,
}

/// Probe every host. A failing host or probe never stops the others.
#[instrument(skip_all, fields(hosts = hosts.len()))]
pub async fn run_probe_job(
    target: &dyn ProbeTarget,
    hosts: &[Host],
    now_ms: i64,
) -> ProbeJobReport {
    let mut report = ProbeJobReport::default();

    for host in hosts {
        report.hosts += 1;
        let thorough = target.run_thorough_probe(host).await;
        let light = target.run_light_probe(host).await;

        for (kind, result) in [(ProbeKind::Thorough, thorough), (ProbeKind::Light, light)] {
            if let Err(e) = &result {
                warn!(host = %host.name, %kind, error = %e, "Probe failed");
                report.failed_probes += 1;
            }
            let record = to_record(&host.name, kind, result, now_ms);
            if let Err(e) = target.persist(&record).await {
                warn!(host = %host.name, %kind, error = %e, "Persisting probe result failed");
                report.persist_failures += 1;
            }
        }
    }

    info!(
        hosts = report.hosts,
        failed = report.failed_probes,
        "Probe job complete"
    );
    report
}

fn to_record(
    host_name: &str,
    kind: ProbeKind,
    result: Result<ProbeMeasurement, ProbeError>,
    now_ms: i64,
) -> ProbeRecord {
    let (ok, m, error) = match result {
        Ok(m) => (true, m, None),
        Err(e) => (false, ProbeMeasurement::default(), Some(e.to_string())),
    };
    ProbeRecord {
        host_name: host_name.to_string(),
        kind,
        ok,
        latency_ms: m.latency_ms,
        download_mbps: m.download_mbps,
        upload_mbps: m.upload_mbps,
        error,
        measured_at_ms: now_ms,
    }
}

/// Production [`ProbeTarget`]: `speedtest` over SSH, TCP connect to the panel,
/// results stored in the database.
#[derive(Clone)]
pub struct NetworkProber {
    db: Database,
    ssh: SshRunner,
    connect_timeout: Duration,
}

impl NetworkProber {
    pub const fn new(db: Database, ssh: SshRunner, connect_timeout: Duration) -> Self {
        Self {
            db,
            ssh,
            connect_timeout,
        }
    }
}

#[async_trait]
impl ProbeTarget for NetworkProber {
    async fn run_thorough_probe(&self, host: &Host) -> Result<ProbeMeasurement, ProbeError> {
        let target = host
            .ssh_target()
            .ok_or_else(|| {
                ProbeError::NotConfigured(format!("{} has no SSH credentials", host.name))
            })?;
        let output = self.ssh.run(&target, SPEEDTEST_COMMAND).await?;
        parse_speedtest(&output)
    }

    async fn run_light_probe(&self, host: &Host) -> Result<ProbeMeasurement, ProbeError> {
        let (address, port) = panel_endpoint(&host.panel_url)?;
        let started = Instant::now();
        let connect = TcpStream::connect((address.as_str(), port));
        let _stream = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| ProbeError::Timeout(self.connect_timeout))?
            .map_err(|e| ProbeError::Connect(e.to_string()))?;
        Ok(ProbeMeasurement {
            latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
            ..ProbeMeasurement::default()
        })
    }

    async fn persist(&self, record: &ProbeRecord) -> Result<(), DatabaseError> {
        self.db.insert_probe_result(record).await.map(|_| ())
    }
}

/// Host and port of a panel URL, defaulting the port from the scheme.
pub(crate) fn panel_endpoint(panel_url: &str) -> Result<(String, u16), ProbeError> {
    let url = reqwest::Url::parse(panel_url)
        .map_err(|e| ProbeError::NotConfigured(format!("Invalid panel_url {panel_url:?}: {e}")))?;
    let address = url
        .host_str()
        .ok_or_else(|| ProbeError::NotConfigured(format!("panel_url {panel_url:?} has no host")))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| ProbeError::NotConfigured(format!("panel_url {panel_url:?} has no port")))?;
    Ok((address, port))
}

#[derive(Debug, Deserialize)]
struct SpeedtestOutput {
    ping: Option<SpeedtestPing>,
    download: Option<SpeedtestTransfer>,
    upload: Option<SpeedtestTransfer>,
}

#[derive(Debug, Deserialize)]
struct SpeedtestPing {
    latency: f64,
}

#[derive(Debug, Deserialize)]
struct SpeedtestTransfer {
    /// Bytes per second.
    bandwidth: f64,
}

pub(crate) fn parse_speedtest(output: &str) -> Result<ProbeMeasurement, ProbeError> {
    let parsed: SpeedtestOutput = serde_json::from_str(output.trim())
        .map_err(|e| ProbeError::Parse(e.to_string()))?;
    let to_mbps = |t: SpeedtestTransfer| t.bandwidth * 8.0 / 1_000_000.0;
    Ok(ProbeMeasurement {
        latency_ms: parsed.ping.map(|p| p.latency),
        download_mbps: parsed.download.map(to_mbps),
        upload_mbps: parsed.upload.map(to_mbps),
    })
}

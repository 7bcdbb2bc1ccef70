//! Data models for Keyward storage.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub created_at: i64,
}

/// A remote provisioning endpoint.
#[derive(Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Host {
    pub name: String,
    pub panel_url: String,
    pub panel_username: String,
    pub panel_password: String,
    /// Traffic profile (panel inbound) that keys on this host belong to.
    pub inbound_id: i64,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<i64>,
    pub ssh_user: Option<String>,
    pub ssh_identity_file: Option<String>,
    pub created_at: i64,
}

impl Host {
    /// Secondary-channel target, present only when an SSH user is configured.
    pub fn ssh_target(&self) -> Option<SshTarget> {
        let user = self.ssh_user.clone()?;
        let address = self
            .ssh_host
            .clone()
            .or_else(|| panel_hostname(&self.panel_url))?;
        let port = self
            .ssh_port
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(22);
        Some(SshTarget {
            address,
            port,
            user,
            identity_file: self.ssh_identity_file.as_ref().map(PathBuf::from),
        })
    }
}

fn panel_hostname(panel_url: &str) -> Option<String> {
    reqwest::Url::parse(panel_url)
        .ok()?
        .host_str()
        .map(ToString::to_string)
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("panel_url", &self.panel_url)
            .field("panel_username", &self.panel_username)
            .field("panel_password", &"<redacted>")
            .field("inbound_id", &self.inbound_id)
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .finish_non_exhaustive()
    }
}

/// SSH connection parameters for a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub address: String,
    pub port: u16,
    pub user: String,
    pub identity_file: Option<PathBuf>,
}

/// A locally issued access credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Key {
    pub id: i64,
    pub user_id: i64,
    pub host_name: String,
    /// Matches this record against the panel's own record. Unique.
    pub correlation_id: String,
    /// Panel-side identifier, null until first linked.
    pub remote_id: Option<String>,
    pub expiry_ms: i64,
    pub created_at_ms: i64,
    pub comment: String,
    pub is_gift: bool,
}

impl Key {
    pub const fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_ms <= now_ms
    }
}

/// Parameters for inserting a key.
#[derive(Debug, Clone)]
pub struct NewKey<'a> {
    pub user_id: i64,
    pub host_name: &'a str,
    pub correlation_id: &'a str,
    pub remote_id: Option<&'a str>,
    pub expiry_ms: i64,
    pub comment: &'a str,
    pub is_gift: bool,
}

/// Which probe produced a [`ProbeRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeKind {
    /// Bandwidth and latency measurement run on the host.
    Thorough,
    /// Timed TCP connect to the panel endpoint.
    Light,
}

impl ProbeKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Thorough => "thorough",
            Self::Light => "light",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one probe against one host.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRecord {
    pub host_name: String,
    pub kind: ProbeKind,
    pub ok: bool,
    pub latency_ms: Option<f64>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub error: Option<String>,
    pub measured_at_ms: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProbeRow {
    pub id: i64,
    pub host_name: String,
    pub kind: String,
    pub ok: bool,
    pub latency_ms: Option<f64>,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub error: Option<String>,
    pub measured_at_ms: i64,
}

/// One resource telemetry sample.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TelemetryPoint {
    /// `local` or a host name.
    pub source: String,
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
    pub mem_total_kb: i64,
    pub mem_available_kb: i64,
    pub recorded_at_ms: i64,
}

/// Source label for telemetry collected on the orchestrator's own machine.
pub const LOCAL_SOURCE: &str = "local";

//! Remote provisioning panel integration.
//!
//! [`RemotePanel`] authenticates against one host and hands back a
//! [`PanelSession`] bound to it. The reconciliation engine opens exactly one
//! session per host per pass. [`XuiPanel`] talks to the 3x-ui HTTP API.

mod client;
pub mod types;


use async_trait::async_trait;
use thiserror::Error;

use crate::storage::Host;

pub use client::XuiPanel;
pub use types::RemoteCredential;

/// Remote panel errors.
#[derive(Debug, Error)]
pub enum PanelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Panel API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Panel refused request: {0}")]
    Rejected(String),

    #[error("Malformed panel response: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PanelError {
    /// Whether retrying on a later pass may succeed without operator action.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::AuthRejected(_) | Self::Rejected(_) | Self::Decode(_) | Self::Config(_) => false,
        }
    }
}

/// Opens authenticated sessions against hosts.
#[async_trait]
pub trait RemotePanel: Send + Sync {
    /// Authenticate against `host`.
    async fn connect(&self, host: &Host) -> Result<Box<dyn PanelSession>, PanelError>;
}

/// An authenticated session against one host.
#[async_trait]
pub trait PanelSession: Send + Sync {
    /// All credentials issued for a traffic profile.
    async fn list_credentials(&self, inbound_id: i64) -> Result<Vec<RemoteCredential>, PanelError>;

    /// Set the expiry of the credential carrying `correlation_id`, creating it
    /// if absent. Returns its remote identifier.
    async fn create_or_update(
        &self,
        inbound_id: i64,
        correlation_id: &str,
        expiry_ms: i64,
    ) -> Result<String, PanelError>;

    async fn delete(&self, inbound_id: i64, remote_id: &str) -> Result<(), PanelError>;
}

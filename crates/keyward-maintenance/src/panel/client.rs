//! 3x-ui panel HTTP client.
//!
//! Authenticates with `POST /login` (session cookie) and drives the
//! `/panel/api/inbounds` endpoints.

use async_trait::async_trait;
use keyward_core::config::PanelConfig;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::types::{ApiResponse, ClientPayload, Inbound, InboundSettings, LoginRequest, XuiClient};
use super::{PanelError, PanelSession, RemoteCredential, RemotePanel};
use crate::storage::Host;

/// [`RemotePanel`] backed by the 3x-ui REST API.
#[derive(Debug, Clone)]
pub struct XuiPanel {
    config: PanelConfig,
}

impl XuiPanel {
    pub const fn new(config: PanelConfig) -> Self {
        Self { config }
    }

    fn build_http(&self) -> Result<reqwest::Client, PanelError> {
        // reqwest is built with rustls-no-provider; an `Err` here only means
        // a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .cookie_store(true)
            .connect_timeout(self.config.connect_timeout())
            .timeout(self.config.request_timeout())
            .danger_accept_invalid_certs(self.config.accept_invalid_certs)
            .build()?;
        Ok(http)
    }
}

#[async_trait]
impl RemotePanel for XuiPanel {
    async fn connect(&self, host: &Host) -> Result<Box<dyn PanelSession>, PanelError> {
        let base_url = normalize_base_url(&host.panel_url)?;
        let session = XuiSession {
            http: self.build_http()?,
            base_url,
        };
        session
            .login(&host.panel_username, &host.panel_password)
            .await?;
        debug!(host = %host.name, "Panel session established");
        Ok(Box::new(session))
    }
}

pub(crate) fn normalize_base_url(panel_url: &str) -> Result<String, PanelError> {
    let trimmed = panel_url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(PanelError::Config("panel_url is empty".into()));
    }
    reqwest::Url::parse(trimmed)
        .map_err(|e| PanelError::Config(format!("Invalid panel_url {trimmed:?}: {e}")))?;
    Ok(trimmed.to_string())
}

/// Authenticated session holding the panel's session cookie.
#[derive(Debug)]
struct XuiSession {
    http: reqwest::Client,
    base_url: String,
}

impl XuiSession {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn check_status(resp: &reqwest::Response) -> Result<(), PanelError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(PanelError::Api {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").into(),
            });
        }
        Ok(())
    }

    async fn read_envelope<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<ApiResponse<T>, PanelError> {
        Self::check_status(&resp)?;
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| PanelError::Decode(e.to_string()))
    }

    async fn login(&self, username: &str, password: &str) -> Result<(), PanelError> {
        let resp = self
            .http
            .post(self.url("/login"))
            .json(&LoginRequest { username, password })
            .send()
            .await?;
        let envelope: ApiResponse<serde_json::Value> = Self::read_envelope(resp).await?;
        if !envelope.success {
            return Err(PanelError::AuthRejected(envelope.msg));
        }
        Ok(())
    }

    async fn fetch_clients(&self, inbound_id: i64) -> Result<Vec<XuiClient>, PanelError> {
        let resp = self
            .http
            .get(self.url(&format!("/panel/api/inbounds/get/{inbound_id}")))
            .send()
            .await?;
        let envelope: ApiResponse<Inbound> = Self::read_envelope(resp).await?;
        if !envelope.success {
            return Err(PanelError::Rejected(envelope.msg));
        }
        let inbound = envelope
            .obj
            .ok_or_else(|| {
                PanelError::Decode(format!("Inbound {inbound_id} missing from response"))
            })?;
        parse_clients(&inbound)
    }

    async fn post_client(&self, path: &str, payload: &ClientPayload) -> Result<(), PanelError> {
        let resp = self.http.post(self.url(path)).json(payload).send().await?;
        let envelope: ApiResponse<serde_json::Value> = Self::read_envelope(resp).await?;
        if !envelope.success {
            return Err(PanelError::Rejected(envelope.msg));
        }
        Ok(())
    }
}

pub(crate) fn parse_clients(inbound: &Inbound) -> Result<Vec<XuiClient>, PanelError> {
    if inbound.settings.trim().is_empty() {
        return Ok(Vec::new());
    }
    let settings: InboundSettings = serde_json::from_str(&inbound.settings).map_err(|e| {
        PanelError::Decode(format!("Inbound {} settings: {e}", inbound.id))
    })?;
    Ok(settings.clients)
}

#[async_trait]
impl PanelSession for XuiSession {
    async fn list_credentials(&self, inbound_id: i64) -> Result<Vec<RemoteCredential>, PanelError> {
        let clients = self.fetch_clients(inbound_id).await?;
        Ok(clients.iter().map(XuiClient::to_credential).collect())
    }

    async fn create_or_update(
        &self,
        inbound_id: i64,
        correlation_id: &str,
        expiry_ms: i64,
    ) -> Result<String, PanelError> {
        let existing = self
            .fetch_clients(inbound_id)
            .await?
            .into_iter()
            .find(|c| c.email == correlation_id);

        let (path, client) = match existing {
            Some(mut client) => {
                // The written expiry is the effective one, so the reset
                // allowance is folded into it.
                client.expiry_time = expiry_ms;
                client.reset = 0;
                client.enable = true;
                (
                    format!("/panel/api/inbounds/updateClient/{}", client.id),
                    client,
                )
            }
            None => (
                "/panel/api/inbounds/addClient".to_string(),
                XuiClient::issue(correlation_id, expiry_ms),
            ),
        };

        let payload = ClientPayload::new(inbound_id, &client)
            .map_err(|e| PanelError::Decode(e.to_string()))?;
        self.post_client(&path, &payload).await?;
        Ok(client.id)
    }

    async fn delete(&self, inbound_id: i64, remote_id: &str) -> Result<(), PanelError> {
        let resp = self
            .http
            .post(self.url(&format!(
                "/panel/api/inbounds/{inbound_id}/delClient/{remote_id}"
            )))
            .send()
            .await?;
        let envelope: ApiResponse<serde_json::Value> = Self::read_envelope(resp).await?;
        if !envelope.success {
            return Err(PanelError::Rejected(envelope.msg));
        }
        Ok(())
    }
}

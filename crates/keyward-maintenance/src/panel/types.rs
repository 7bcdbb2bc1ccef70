//! Panel credential model and 3x-ui wire types.

use keyward_core::db::MS_PER_DAY;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A credential as the panel reports it. Fetched fresh every pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCredential {
    pub remote_id: String,
    pub correlation_id: String,
    /// Raw expiry in milliseconds. Zero or negative means no fixed expiry.
    pub expiry_ms: i64,
    /// Extra validity granted by the panel's own reset policy.
    pub reset_days: i64,
    pub enabled: bool,
}

impl RemoteCredential {
    /// Raw expiry plus the reset-days allowance.
    pub const fn effective_expiry_ms(&self) -> i64 {
        self.expiry_ms
            .saturating_add(self.reset_days.saturating_mul(MS_PER_DAY))
    }

    pub const fn has_fixed_expiry(&self) -> bool {
        self.expiry_ms > 0
    }
}

/// Envelope every 3x-ui endpoint answers with.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse<T> {
    pub success: bool,
    #[serde(default)]
    pub msg: String,
    pub obj: Option<T>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Inbound {
    pub id: i64,
    /// JSON document encoded as a string.
    #[serde(default)]
    pub settings: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct InboundSettings {
    #[serde(default)]
    pub clients: Vec<XuiClient>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One client entry inside an inbound's settings.
///
/// Fields this crate does not manage round-trip through `extra` so an update
/// never clobbers traffic limits or flow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct XuiClient {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub expiry_time: i64,
    #[serde(default)]
    pub reset: i64,
    #[serde(default = "enabled_by_default")]
    pub enable: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn enabled_by_default() -> bool {
    true
}

impl XuiClient {
    /// Fresh client entry for a newly issued credential.
    pub fn issue(correlation_id: &str, expiry_ms: i64) -> Self {
        let mut extra = Map::new();
        extra.insert("flow".into(), Value::String(String::new()));
        extra.insert("limitIp".into(), Value::from(0));
        extra.insert("totalGB".into(), Value::from(0));
        extra.insert("tgId".into(), Value::String(String::new()));
        extra.insert(
            "subId".into(),
            Value::String(uuid::Uuid::new_v4().simple().to_string()),
        );
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email: correlation_id.to_string(),
            expiry_time: expiry_ms,
            reset: 0,
            enable: true,
            extra,
        }
    }

    pub fn to_credential(&self) -> RemoteCredential {
        RemoteCredential {
            remote_id: self.id.clone(),
            correlation_id: self.email.clone(),
            expiry_ms: self.expiry_time,
            reset_days: self.reset,
            enabled: self.enable,
        }
    }
}

/// Body of `addClient` / `updateClient`: the inbound id plus a settings
/// string carrying the clients to write.
#[derive(Debug, Serialize)]
pub(crate) struct ClientPayload {
    pub id: i64,
    pub settings: String,
}

impl ClientPayload {
    pub fn new(inbound_id: i64, client: &XuiClient) -> Result<Self, serde_json::Error> {
        let settings = serde_json::json!({ "clients": [client] });
        Ok(Self {
            id: inbound_id,
            settings: serde_json::to_string(&settings)?,
        })
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

//! Telegram Bot API client.
//!
//! Sends plain text messages with `sendMessage` and files with
//! `sendDocument`. Activity is established by a `getMe` round-trip.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use keyward_core::config::TelegramConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DocumentSender, Notifier, NotifyError};

/// Response envelope of every Bot API method.
#[derive(Debug, Deserialize)]
struct BotResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

/// Client for the Telegram Bot API.
#[derive(Debug)]
pub struct TelegramNotifier {
    http: reqwest::Client,
    /// `<api_base>/bot<token>`, without a trailing slash.
    bot_url: String,
    active: AtomicBool,
}

impl TelegramNotifier {
    /// Build a notifier from configuration. Starts inactive until
    /// [`verify`](Self::verify) succeeds.
    pub fn new(config: &TelegramConfig) -> Result<Self, NotifyError> {
        let token = config
            .bot_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| NotifyError::Config("bot_token is not set".into()))?;
        let base = config.api_base.trim_end_matches('/');
        if base.is_empty() {
            return Err(NotifyError::Config("api_base is empty".into()));
        }

        // Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider).
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            bot_url: format!("{base}/bot{token}"),
            active: AtomicBool::new(false),
        })
    }

    pub(crate) fn method_url(&self, method: &str) -> String {
        format!("{}/{method}", self.bot_url)
    }

    /// Check the token with `getMe` and record whether the bot is usable.
    pub async fn verify(&self) -> Result<(), NotifyError> {
        let result = self.call_get("getMe").await;
        self.active.store(result.is_ok(), Ordering::Relaxed);
        match &result {
            Ok(()) => debug!("Telegram bot verified"),
            Err(e) => warn!(error = %e, "Telegram bot verification failed"),
        }
        result
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&SendMessage { chat_id, text })
            .send()
            .await?;
        Self::check_response(response).await
    }

    /// Upload `bytes` as a document named `file_name`.
    pub async fn upload_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<(), NotifyError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);

        let response = self
            .http
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await?;
        Self::check_response(response).await
    }

    async fn call_get(&self, method: &str) -> Result<(), NotifyError> {
        let response = self.http.get(self.method_url(method)).send().await?;
        Self::check_response(response).await
    }

    async fn check_response(response: reqwest::Response) -> Result<(), NotifyError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());
        if !status.is_success() {
            return Err(NotifyError::Api {
                status: status.as_u16(),
                body,
            });
        }
        let parsed: BotResponse = serde_json::from_str(&body)
            .map_err(|e| NotifyError::Rejected(format!("Unreadable response: {e}")))?;
        if !parsed.ok {
            return Err(NotifyError::Rejected(
                parsed.description.unwrap_or_else(|| "no description".into()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), NotifyError> {
        if !self.is_active() {
            return Err(NotifyError::Inactive);
        }
        self.send_message(user_id, text).await
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    async fn reactivate(&self) -> bool {
        self.verify().await.is_ok()
    }
}

#[async_trait]
impl DocumentSender for TelegramNotifier {
    async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<(), NotifyError> {
        self.upload_document(chat_id, file_name, bytes, caption).await
    }
}

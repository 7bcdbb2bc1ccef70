//! User notification delivery.
//!
//! [`Notifier`] is the narrow seam the expiry engine sends through.
//! [`TelegramNotifier`] delivers via the Telegram Bot API and also carries
//! snapshot documents to admins.

pub mod telegram;

use async_trait::async_trait;

pub use telegram::TelegramNotifier;

/// Errors that can occur while delivering a notification.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Bot API answered with a non-success status code.
    #[error("Bot API error (status {status}): {body}")]
    Api { status: u16, body: String },

    /// Bot API answered `ok: false`.
    #[error("Bot API refused request: {0}")]
    Rejected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The serving bot is not running.
    #[error("Notifier is inactive")]
    Inactive,
}

/// Best-effort delivery of a text message to a user.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, user_id: i64, text: &str) -> Result<(), NotifyError>;

    /// Whether the serving bot is currently active.
    fn is_active(&self) -> bool;

    /// Try to bring an inactive notifier back. Returns the resulting
    /// activity. The default only reports the current state.
    async fn reactivate(&self) -> bool {
        self.is_active()
    }
}

/// Stand-in used when no bot is configured. Never active.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn send(&self, _user_id: i64, _text: &str) -> Result<(), NotifyError> {
        Err(NotifyError::Inactive)
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// Delivery of a file to a chat.
#[async_trait]
pub trait DocumentSender: Send + Sync {
    async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: &str,
    ) -> Result<(), NotifyError>;
}

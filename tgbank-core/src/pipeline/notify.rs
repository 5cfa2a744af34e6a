//! User notifications sent after a deposit is applied.

use crate::config::NotifierConfig;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Delivers a short text message to a user.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, user_handle: &str, text: &str) -> Result<(), NotifyError>;
}

/// Text sent to a user whose account was credited.
pub fn deposit_notification_text(amount: Decimal, balance: Decimal) -> String {
    format!(
        "Your account has been credited with ₦{:.2}.\nNew balance: ₦{:.2}",
        amount.round_dp(2),
        balance.round_dp(2)
    )
}

/// Sends messages through the Telegram Bot API.
pub struct TelegramNotifier {
    http_client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

impl TelegramNotifier {
    pub fn new(token: &str, config: &NotifierConfig) -> Self {
        Self {
            http_client: reqwest::Client::builder()
                .timeout(config.timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: format!(
                "{}/bot{}/sendMessage",
                config.api_base.trim_end_matches('/'),
                token
            ),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, user_handle: &str, text: &str) -> Result<(), NotifyError> {
        let response = self
            .http_client
            .post(&self.endpoint)
            .json(&SendMessage {
                chat_id: user_handle,
                text,
            })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// Writes notifications to the log instead of sending them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_handle: &str, text: &str) -> Result<(), NotifyError> {
        info!(user_handle, text, "Notification (no delivery channel configured)");
        Ok(())
    }
}

/// Pick the notifier the configuration asks for.
pub fn notifier_from_config(config: &NotifierConfig) -> std::sync::Arc<dyn Notifier> {
    match config.telegram_bot_token.as_deref() {
        Some(token) if !token.is_empty() => std::sync::Arc::new(TelegramNotifier::new(token, config)),
        _ => std::sync::Arc::new(LogNotifier),
    }
}

#[async_trait]
impl<N: Notifier + ?Sized> Notifier for std::sync::Arc<N> {
    async fn notify(&self, user_handle: &str, text: &str) -> Result<(), NotifyError> {
        (**self).notify(user_handle, text).await
    }
}

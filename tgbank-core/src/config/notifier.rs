use std::time::Duration;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Settings for user notifications.
#[derive(Clone)]
pub struct NotifierConfig {
    /// Bot token; notifications are only logged when absent.
    pub telegram_bot_token: Option<String>,
    pub api_base: String,
    pub timeout: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            api_base: TELEGRAM_API_BASE.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for NotifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierConfig")
            .field(
                "telegram_bot_token",
                &self.telegram_bot_token.as_ref().map(|_| "<redacted>"),
            )
            .field("api_base", &self.api_base)
            .field("timeout", &self.timeout)
            .finish()
    }
}

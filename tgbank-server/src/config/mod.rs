//! Configuration module for tgbank-server.
//!
//! Handles loading configuration from the TOML file, CLI arguments and
//! environment variables, then validates it into the runtime types of
//! `tgbank-core`.

pub mod file;

use crate::config::file::FileConfig;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tgbank_core::config::{GatewayConfig, NotifierConfig, SharedConfig};
use tgbank_core::session::{RetryPolicy, SessionManagerConfig};
use thiserror::Error;
use url::Url;

pub const DATABASE_URL_ENV: &str = "DATABASE_URL";
pub const RABBITMQ_URL_ENV: &str = "RABBITMQ_URL";
pub const PAYSTACK_SECRET_KEY_ENV: &str = "PAYSTACK_SECRET_KEY";
pub const TELEGRAM_BOT_TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Broker connection settings.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub url: String,
    pub prefetch: u16,
}

/// Loaded configuration result containing all parts.
#[derive(Debug)]
pub struct LoadedConfig {
    pub listen: SocketAddr,
    pub database: SessionManagerConfig,
    pub retry: RetryPolicy,
    pub broker: BrokerSettings,
    pub gateway: GatewayConfig,
    pub notifier: NotifierConfig,
}

impl LoadedConfig {
    /// The sections that SIGHUP may replace.
    pub fn shared(&self) -> SharedConfig {
        SharedConfig::new(self.gateway.clone())
    }
}

/// Configuration loader that handles the complete loading process.
pub struct ConfigLoader {
    config_path: std::path::PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    /// Load the file and apply overrides from the process environment.
    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        self.load_with_env(|key| std::env::var(key).ok())
    }

    /// Reload the configuration (used during SIGHUP).
    pub fn reload(&self) -> Result<LoadedConfig, ConfigError> {
        self.load()
    }

    /// Load the file, resolving environment overrides through `env`.
    ///
    /// This will:
    /// 1. Read the TOML file
    /// 2. Apply environment and CLI overrides
    /// 3. Validate and build the runtime configuration
    pub fn load_with_env<F>(&self, env: F) -> Result<LoadedConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        let file_config: FileConfig = toml::from_str(&config_content)?;
        self.build(file_config, env)
    }

    fn build<F>(&self, mut file_config: FileConfig, env: F) -> Result<LoadedConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = env(RABBITMQ_URL_ENV) {
            file_config.broker.url = url;
        }
        if let Some(secret) = env(PAYSTACK_SECRET_KEY_ENV) {
            file_config.gateway.secret = secret;
        }
        if let Some(token) = env(TELEGRAM_BOT_TOKEN_ENV) {
            file_config.notifier.telegram_bot_token = Some(token);
        }
        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }

        let database_url = env(DATABASE_URL_ENV)
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::MissingDatabaseUrl)?;
        let database_url = normalize_database_url(&database_url)?;

        validate(&file_config)?;
        Ok(into_loaded(file_config, database_url))
    }
}

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    if config.gateway.secret.trim().is_empty() {
        return Err(ConfigError::ValidationError(
            "gateway secret is empty; set [gateway].secret or PAYSTACK_SECRET_KEY".to_string(),
        ));
    }
    if config.retry.max_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "retry.max_attempts must be at least 1".to_string(),
        ));
    }
    if config.database.max_connections == 0 {
        return Err(ConfigError::ValidationError(
            "database.max_connections must be at least 1".to_string(),
        ));
    }
    let broker_url = Url::parse(&config.broker.url)
        .map_err(|e| ConfigError::ValidationError(format!("invalid broker url: {e}")))?;
    if !matches!(broker_url.scheme(), "amqp" | "amqps") {
        return Err(ConfigError::ValidationError(format!(
            "broker url must use amqp or amqps, got '{}'",
            broker_url.scheme()
        )));
    }
    Ok(())
}

fn into_loaded(file_config: FileConfig, database_url: String) -> LoadedConfig {
    let acquire_timeout = Duration::from_secs(file_config.database.acquire_timeout_secs);
    let database = SessionManagerConfig {
        max_connections: file_config.database.max_connections,
        acquire_timeout,
        health_check_interval: Duration::from_secs(file_config.database.health_check_interval_secs),
        ..SessionManagerConfig::new(database_url)
    };
    let retry = RetryPolicy {
        max_attempts: file_config.retry.max_attempts,
        base_delay: Duration::from_millis(file_config.retry.base_delay_ms),
        failure_threshold: file_config.retry.failure_threshold,
        acquire_timeout,
    };

    let mut notifier = NotifierConfig {
        telegram_bot_token: file_config
            .notifier
            .telegram_bot_token
            .filter(|token| !token.trim().is_empty()),
        ..NotifierConfig::default()
    };
    if let Some(api_base) = file_config.notifier.api_base {
        notifier.api_base = api_base;
    }
    if let Some(secs) = file_config.notifier.timeout_secs {
        notifier.timeout = Duration::from_secs(secs);
    }

    LoadedConfig {
        listen: file_config.server.listen,
        database,
        retry,
        broker: BrokerSettings {
            url: file_config.broker.url,
            prefetch: file_config.broker.prefetch.max(1),
        },
        gateway: GatewayConfig::new(file_config.gateway.secret.into_bytes()),
        notifier,
    }
}

/// Rewrite driver-qualified Postgres URLs (`postgresql+asyncpg://…`) and the
/// `postgresql` scheme to the plain `postgres://` form.
pub fn normalize_database_url(raw: &str) -> Result<String, ConfigError> {
    let raw = raw.trim();
    let (scheme, rest) = raw
        .split_once("://")
        .ok_or_else(|| ConfigError::ValidationError("DATABASE_URL has no scheme".to_string()))?;
    let base_scheme = scheme.split('+').next().unwrap_or(scheme);
    if !matches!(base_scheme, "postgres" | "postgresql") {
        return Err(ConfigError::ValidationError(format!(
            "DATABASE_URL must point to Postgres, got scheme '{scheme}'"
        )));
    }
    let normalized = format!("postgres://{rest}");
    Url::parse(&normalized)
        .map_err(|e| ConfigError::ValidationError(format!("invalid DATABASE_URL: {e}")))?;
    Ok(normalized)
}

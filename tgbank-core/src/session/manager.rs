use super::{Session, SessionError, SessionSource};
use crate::framework::{DatabaseProcessor, PingDatabase};
use async_trait::async_trait;
use kanau::processor::Processor;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub database_url: String,
    pub max_connections: u32,
    /// Bound on waiting for a pooled connection.
    pub acquire_timeout: Duration,
    /// Period of the background health check.
    pub health_check_interval: Duration,
}

impl SessionManagerConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(10),
            health_check_interval: Duration::from_secs(300),
        }
    }
}

/// Owner of the Postgres pool.
///
/// The pool sits behind a lock so [`SessionManager::recover`] can swap in a
/// freshly built one; sessions already handed out keep their old pool handle
/// until they are released.
pub struct SessionManager {
    config: SessionManagerConfig,
    pool: RwLock<PgPool>,
}

impl SessionManager {
    fn pool_options(config: &SessionManagerConfig) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .test_before_acquire(false)
    }

    /// Build the pool and open its first connection.
    pub async fn connect(config: SessionManagerConfig) -> Result<Self, SessionError> {
        let pool = Self::pool_options(&config)
            .connect(&config.database_url)
            .await?;
        info!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self {
            config,
            pool: RwLock::new(pool),
        })
    }

    /// Build the pool without connecting; connections open on first use.
    pub fn connect_lazy(config: SessionManagerConfig) -> Result<Self, SessionError> {
        let pool = Self::pool_options(&config).connect_lazy(&config.database_url)?;
        Ok(Self {
            config,
            pool: RwLock::new(pool),
        })
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    /// Handle to the current pool.
    pub async fn pool(&self) -> PgPool {
        self.pool.read().await.clone()
    }

    /// Lease a connection and open a transaction on it.
    pub async fn acquire_session(&self) -> Result<Session, SessionError> {
        let pool = self.pool().await;
        let timeout = self.config.acquire_timeout;
        let tx = match tokio::time::timeout(timeout, pool.begin()).await {
            Ok(tx) => tx?,
            Err(_) => return Err(SessionError::Timeout(timeout)),
        };
        let mut session = Session::new(pool, tx);
        session.ensure_connection().await?;
        Ok(session)
    }

    /// `SELECT 1` against the pool.
    pub async fn health_check(&self) -> bool {
        let processor = DatabaseProcessor {
            pool: self.pool().await,
        };
        match processor.process(PingDatabase).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Database health check failed");
                false
            }
        }
    }

    /// Replace the pool with a freshly connected one and close the old one.
    ///
    /// The old pool is kept if the new one cannot connect.
    pub async fn recover(&self) -> Result<(), SessionError> {
        let fresh = Self::pool_options(&self.config)
            .connect(&self.config.database_url)
            .await?;
        let stale = {
            let mut pool = self.pool.write().await;
            std::mem::replace(&mut *pool, fresh)
        };
        stale.close().await;
        info!("Database pool recreated");
        Ok(())
    }

    /// Periodically check health and recreate the pool when it fails.
    pub async fn run_maintenance(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.health_check_interval.as_secs(),
            "Database maintenance started"
        );
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        // the first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Database maintenance received shutdown signal");
                        break;
                    }
                }

                _ = interval.tick() => {
                    if self.health_check().await {
                        continue;
                    }
                    warn!("Database unhealthy, recreating pool");
                    if let Err(err) = self.recover().await {
                        error!(error = %err, "Failed to recreate database pool");
                    }
                }
            }
        }
    }

    pub async fn close(&self) {
        let pool = self.pool().await;
        pool.close().await;
        info!("Database pool closed");
    }
}

#[async_trait]
impl SessionSource for SessionManager {
    type Session = Session;

    async fn acquire(&self) -> Result<Session, SessionError> {
        self.acquire_session().await
    }

    async fn recover(&self) -> Result<(), SessionError> {
        SessionManager::recover(self).await
    }
}

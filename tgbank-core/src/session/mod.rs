//! Transactional sessions over the account store.
//!
//! [`SessionManager`] owns the Postgres pool and hands out [`Session`]s,
//! one transaction each. [`SessionMiddleware`] wraps a unit of work with
//! acquisition retry, commit-or-rollback and guaranteed release.

pub mod manager;
pub mod memory;
pub mod middleware;
mod pg;

pub use manager::{SessionManager, SessionManagerConfig};
pub use memory::{MemorySession, MemorySessionSource, MemoryStore};
pub use middleware::{MiddlewareError, RetryPolicy, SessionHandler, SessionMiddleware};
pub use pg::{Session, SessionState};

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("database connection error: {0}")]
    Connection(String),
    #[error("connection pool exhausted")]
    PoolExhausted,
    #[error("timed out after {0:?} waiting for a session")]
    Timeout(Duration),
    #[error("session is closed")]
    Closed,
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl SessionError {
    /// Failures that a fresh connection attempt might fix.
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            SessionError::Connection(_) | SessionError::PoolExhausted | SessionError::Timeout(_)
        )
    }
}

impl From<sqlx::Error> for SessionError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => SessionError::PoolExhausted,
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Protocol(_) => SessionError::Connection(err.to_string()),
            other => SessionError::Database(other),
        }
    }
}

/// One transaction's worth of work against a store.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn commit(&mut self) -> Result<(), SessionError>;
    async fn rollback(&mut self) -> Result<(), SessionError>;
    /// Release the session, rolling back anything uncommitted.
    async fn close(self) -> Result<(), SessionError>;
}

/// Something that hands out sessions and can rebuild its connections.
#[async_trait]
pub trait SessionSource: Send + Sync + 'static {
    type Session: UnitOfWork + 'static;

    async fn acquire(&self) -> Result<Self::Session, SessionError>;
    /// Discard and recreate underlying connections.
    async fn recover(&self) -> Result<(), SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_class_errors() {
        assert!(SessionError::from(sqlx::Error::PoolTimedOut).is_connection_class());
        assert!(SessionError::from(sqlx::Error::PoolClosed).is_connection_class());
        assert!(
            SessionError::from(sqlx::Error::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionReset
            )))
            .is_connection_class()
        );
        assert!(SessionError::Timeout(Duration::from_secs(1)).is_connection_class());

        assert!(!SessionError::from(sqlx::Error::RowNotFound).is_connection_class());
        assert!(!SessionError::Closed.is_connection_class());
    }
}

use super::{SessionError, UnitOfWork};
use crate::framework::{Lookup, Persist};
use async_trait::async_trait;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Transaction};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// A transaction is open but nothing ran yet.
    Idle,
    Active,
    Committed,
    RolledBack,
    Closed,
}

/// A unit of work on a leased Postgres connection.
///
/// The connection stays leased while a transaction is open. After a commit
/// or rollback the next statement opens a new transaction. Dropping the
/// session rolls back whatever is uncommitted and returns the connection.
#[derive(Debug)]
pub struct Session {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
    state: SessionState,
}

impl Session {
    pub(crate) fn new(pool: PgPool, tx: Transaction<'static, Postgres>) -> Self {
        Self {
            pool,
            tx: Some(tx),
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The connection of the open transaction, opening one if needed.
    pub(crate) async fn connection(&mut self) -> Result<&mut PgConnection, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.tx.is_none() {
            let tx = self.pool.begin().await?;
            self.tx = Some(tx);
        }
        self.state = SessionState::Active;
        self.tx.as_deref_mut().ok_or(SessionError::Closed)
    }

    /// Probe the leased connection and swap it for a fresh one if it is dead.
    ///
    /// Only the broken connection is discarded; the rest of the pool is left
    /// alone. Anything staged on the old connection is lost, so call this
    /// before doing work.
    pub async fn ensure_connection(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let Some(conn) = self.tx.as_deref_mut() else {
            return Ok(());
        };
        let probe = conn.ping().await;
        if let Err(err) = probe {
            warn!(error = %err, "Leased connection failed its probe, replacing it");
            // the pool tests connections on release and closes broken ones
            drop(self.tx.take());
            self.tx = Some(self.pool.begin().await?);
            self.state = SessionState::Idle;
        }
        Ok(())
    }

    /// Stage an insert or update and return the stored row.
    ///
    /// Commits immediately unless `deferred` is set.
    pub async fn save<E: Persist>(&mut self, entity: E, deferred: bool) -> Result<E::Saved, SessionError> {
        let saved = entity.persist(self.connection().await?).await?;
        if !deferred {
            self.commit().await?;
        }
        Ok(saved)
    }

    /// Point lookup with the given relations loaded eagerly.
    pub async fn find_by_id<E: Lookup>(
        &mut self,
        id: E::Id,
        eager: &[E::Relation],
    ) -> Result<Option<E>, SessionError> {
        Ok(E::find_by_id(self.connection().await?, id, eager).await?)
    }
}

#[async_trait]
impl UnitOfWork for Session {
    async fn commit(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        self.state = SessionState::Committed;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        self.state = SessionState::RolledBack;
        Ok(())
    }

    async fn close(mut self) -> Result<(), SessionError> {
        self.state = SessionState::Closed;
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

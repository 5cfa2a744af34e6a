use async_trait::async_trait;
use kanau::processor::Processor;
use sqlx::{PgConnection, PgPool};

/// Pool-level queries that do not need a unit of work.
pub struct DatabaseProcessor {
    pub pool: PgPool,
}

/// An entity that can be written through a session.
///
/// `persist` runs inside the session's open transaction and returns the
/// stored row, so generated columns are populated on the returned value.
#[async_trait]
pub trait Persist: Send {
    type Saved: Send;

    async fn persist(self, conn: &mut PgConnection) -> Result<Self::Saved, sqlx::Error>;
}

/// An entity that can be loaded by primary key, optionally with related
/// records eagerly attached.
#[async_trait]
pub trait Lookup: Sized + Send {
    type Id: Send + 'static;
    type Relation: Sync;

    async fn find_by_id(
        conn: &mut PgConnection,
        id: Self::Id,
        eager: &[Self::Relation],
    ) -> Result<Option<Self>, sqlx::Error>;
}

#[derive(Debug, Clone, Copy)]
/// Round-trip `SELECT 1` against the pool.
pub struct PingDatabase;

impl Processor<PingDatabase> for DatabaseProcessor {
    type Output = ();
    type Error = sqlx::Error;
    #[tracing::instrument(skip_all, err, name = "SQL:PingDatabase")]
    async fn process(&self, _query: PingDatabase) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

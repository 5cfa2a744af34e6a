use crate::framework::Persist;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgConnection;
use uuid::Uuid;

/// A gateway transaction that has already been credited.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct AppliedDeposit {
    pub reference: String,
    pub user_id: Uuid,
    pub amount: Decimal,
    pub applied_at: time::OffsetDateTime,
}

/// Data for recording a deposit.
///
/// Persisting yields `None` when the reference was recorded before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppliedDeposit {
    pub reference: String,
    pub user_id: Uuid,
    pub amount: Decimal,
}

#[async_trait]
impl Persist for NewAppliedDeposit {
    type Saved = Option<AppliedDeposit>;

    #[tracing::instrument(skip_all, err, name = "SQL:InsertAppliedDeposit")]
    async fn persist(self, conn: &mut PgConnection) -> Result<Option<AppliedDeposit>, sqlx::Error> {
        sqlx::query_as::<_, AppliedDeposit>(
            r#"
            INSERT INTO applied_deposits (reference, user_id, amount)
            VALUES ($1, $2, $3)
            ON CONFLICT (reference) DO NOTHING
            RETURNING reference, user_id, amount, applied_at
            "#,
        )
        .bind(self.reference)
        .bind(self.user_id)
        .bind(self.amount)
        .fetch_optional(conn)
        .await
    }
}

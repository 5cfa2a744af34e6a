use sqlx::PgConnection;
use uuid::Uuid;

/// Dedicated bank account the gateway opened for a user.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct VirtualAccount {
    pub id: Uuid,
    pub user_id: Uuid,
    pub account_name: String,
    pub account_number: String,
    pub bank_name: String,
    pub currency: String,
    pub created_at: time::OffsetDateTime,
}

impl VirtualAccount {
    #[tracing::instrument(skip_all, err, name = "SQL:FindVirtualAccountByUser")]
    pub async fn find_by_user(
        conn: &mut PgConnection,
        user_id: Uuid,
    ) -> Result<Option<VirtualAccount>, sqlx::Error> {
        sqlx::query_as::<_, VirtualAccount>(
            r#"
            SELECT id, user_id, account_name, account_number, bank_name, currency, created_at
            FROM virtual_accounts
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(conn)
        .await
    }
}

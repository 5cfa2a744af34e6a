use crate::entities::virtual_account::VirtualAccount;
use crate::framework::{Lookup, Persist};
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgConnection;
use uuid::Uuid;

/// A registered customer and their wallet balance.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub phone_number: String,
    pub telegram_id: i64,
    /// Chat handle used for notifications.
    pub chat_id: String,
    /// Stable identifier assigned by the payment gateway.
    pub customer_code: Option<String>,
    pub balance: Decimal,
    pub is_active: bool,
    pub created_at: time::OffsetDateTime,
    pub updated_at: time::OffsetDateTime,
    #[sqlx(skip)]
    pub virtual_account: Option<VirtualAccount>,
}

/// Data for registering a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: String,
    pub phone_number: String,
    pub telegram_id: i64,
    pub chat_id: String,
    pub customer_code: Option<String>,
}

/// Relations of [`User`] that can be eagerly loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserRelation {
    VirtualAccount,
}

impl User {
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first.clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => self.email.clone(),
        }
    }

    /// Load the account with a row lock held until the transaction ends.
    #[tracing::instrument(skip_all, err, name = "SQL:LockUserByCustomerCode")]
    pub async fn lock_by_customer_code(
        conn: &mut PgConnection,
        customer_code: &str,
    ) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, first_name, last_name, email, phone_number, telegram_id, chat_id,
                   customer_code, balance, is_active, created_at, updated_at
            FROM users
            WHERE customer_code = $1
            FOR UPDATE
            "#,
        )
        .bind(customer_code)
        .fetch_optional(conn)
        .await
    }
}

#[async_trait]
impl Persist for User {
    type Saved = User;

    #[tracing::instrument(skip_all, err, name = "SQL:SaveUser")]
    async fn persist(self, conn: &mut PgConnection) -> Result<User, sqlx::Error> {
        let virtual_account = self.virtual_account;
        let mut saved = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET first_name = $2,
                last_name = $3,
                email = $4,
                phone_number = $5,
                chat_id = $6,
                customer_code = $7,
                balance = $8,
                is_active = $9,
                updated_at = now()
            WHERE id = $1
            RETURNING id, first_name, last_name, email, phone_number, telegram_id, chat_id,
                      customer_code, balance, is_active, created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(self.first_name)
        .bind(self.last_name)
        .bind(self.email)
        .bind(self.phone_number)
        .bind(self.chat_id)
        .bind(self.customer_code)
        .bind(self.balance)
        .bind(self.is_active)
        .fetch_one(conn)
        .await?;
        saved.virtual_account = virtual_account;
        Ok(saved)
    }
}

#[async_trait]
impl Lookup for User {
    type Id = Uuid;
    type Relation = UserRelation;

    #[tracing::instrument(skip_all, err, name = "SQL:FindUserById")]
    async fn find_by_id(
        conn: &mut PgConnection,
        id: Uuid,
        eager: &[UserRelation],
    ) -> Result<Option<User>, sqlx::Error> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, first_name, last_name, email, phone_number, telegram_id, chat_id,
                   customer_code, balance, is_active, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

        let Some(mut user) = user else {
            return Ok(None);
        };
        if eager.contains(&UserRelation::VirtualAccount) {
            user.virtual_account = VirtualAccount::find_by_user(conn, user.id).await?;
        }
        Ok(Some(user))
    }
}

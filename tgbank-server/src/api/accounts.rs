//! Account balance lookup.
//!
//! `GET /accounts/{user_id}` returns the balance and the dedicated virtual
//! account of one user. The read goes through the session middleware, so
//! it gets the same acquisition retry as the deposit consumer.

use async_trait::async_trait;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tgbank_core::entities::{User, UserRelation, VirtualAccount};
use tgbank_core::session::{MiddlewareError, Session, SessionError, SessionHandler};
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub user_id: Uuid,
    pub name: String,
    pub balance: String,
    pub is_active: bool,
    pub virtual_account: Option<VirtualAccountResponse>,
}

#[derive(Debug, Serialize)]
pub struct VirtualAccountResponse {
    pub account_name: String,
    pub account_number: String,
    pub bank_name: String,
    pub currency: String,
}

impl From<VirtualAccount> for VirtualAccountResponse {
    fn from(account: VirtualAccount) -> Self {
        Self {
            account_name: account.account_name,
            account_number: account.account_number,
            bank_name: account.bank_name,
            currency: account.currency,
        }
    }
}

fn to_response(user: User) -> AccountResponse {
    AccountResponse {
        user_id: user.id,
        name: user.display_name(),
        balance: format!("{:.2}", user.balance),
        is_active: user.is_active,
        virtual_account: user.virtual_account.map(Into::into),
    }
}

/// Loads one user with the virtual account relation.
struct FindAccount {
    user_id: Uuid,
}

#[async_trait]
impl SessionHandler<Session> for FindAccount {
    type Output = Option<User>;
    type Error = SessionError;

    async fn handle(self, session: &mut Session) -> Result<Option<User>, SessionError> {
        session
            .find_by_id::<User>(self.user_id, &[UserRelation::VirtualAccount])
            .await
    }
}

/// Errors that can occur in account handlers.
#[derive(Debug)]
pub enum AccountApiError {
    /// No session could be obtained.
    Unavailable(String),
    /// A query failed.
    Database(String),
    /// The requested account was not found.
    NotFound,
}

impl From<MiddlewareError<SessionError>> for AccountApiError {
    fn from(err: MiddlewareError<SessionError>) -> Self {
        let unavailable = match &err {
            MiddlewareError::Unavailable { .. } => true,
            MiddlewareError::Acquire(e) | MiddlewareError::Handler(e) | MiddlewareError::Commit(e) => {
                e.is_connection_class()
            }
        };
        if unavailable {
            Self::Unavailable(err.to_string())
        } else {
            Self::Database(err.to_string())
        }
    }
}

impl IntoResponse for AccountApiError {
    fn into_response(self) -> Response {
        match self {
            AccountApiError::Unavailable(e) => {
                tracing::error!(error = %e, "Account lookup could not reach the database");
                (StatusCode::SERVICE_UNAVAILABLE, "database unavailable").into_response()
            }
            AccountApiError::Database(e) => {
                tracing::error!(error = %e, "Account lookup database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
            AccountApiError::NotFound => (StatusCode::NOT_FOUND, "account not found").into_response(),
        }
    }
}

/// `GET /accounts/{user_id}`
pub async fn get_account(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<AccountResponse>, AccountApiError> {
    let user = state
        .middleware
        .run(FindAccount { user_id })
        .await?
        .ok_or(AccountApiError::NotFound)?;
    Ok(Json(to_response(user)))
}

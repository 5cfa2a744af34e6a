//! Applying a deposit to an account inside one session.

use crate::entities::{NewAppliedDeposit, User};
use crate::session::middleware::SessionHandler;
use crate::session::{MemorySession, Session, SessionError, UnitOfWork};
use async_trait::async_trait;
use compact_str::CompactString;
use rust_decimal::Decimal;
use tgbank_sdk::objects::DepositMessage;
use thiserror::Error;

/// Account operations the deposit pipeline needs from a session.
#[async_trait]
pub trait LedgerSession: UnitOfWork {
    /// Load the account for `customer_code`, locked until the session ends.
    async fn lock_account(&mut self, customer_code: &str) -> Result<Option<User>, SessionError>;

    /// Record a deposit reference. Returns `false` if it was recorded before.
    async fn record_deposit(&mut self, deposit: NewAppliedDeposit) -> Result<bool, SessionError>;

    /// Stage the updated account and return the stored version.
    async fn save_account(&mut self, user: User) -> Result<User, SessionError>;
}

#[async_trait]
impl LedgerSession for Session {
    async fn lock_account(&mut self, customer_code: &str) -> Result<Option<User>, SessionError> {
        Ok(User::lock_by_customer_code(self.connection().await?, customer_code).await?)
    }

    async fn record_deposit(&mut self, deposit: NewAppliedDeposit) -> Result<bool, SessionError> {
        Ok(self.save(deposit, true).await?.is_some())
    }

    async fn save_account(&mut self, user: User) -> Result<User, SessionError> {
        self.save(user, true).await
    }
}

#[async_trait]
impl LedgerSession for MemorySession {
    async fn lock_account(&mut self, customer_code: &str) -> Result<Option<User>, SessionError> {
        self.lock_user_by_customer_code(customer_code).await
    }

    async fn record_deposit(&mut self, deposit: NewAppliedDeposit) -> Result<bool, SessionError> {
        Ok(self.stage_deposit(deposit)?.is_some())
    }

    async fn save_account(&mut self, user: User) -> Result<User, SessionError> {
        self.stage_user(user)
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("no account with customer code {0}")]
    AccountNotFound(CompactString),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Credited { user: User, amount: Decimal },
    /// The reference was applied by an earlier delivery.
    Duplicate { reference: CompactString },
}

/// Credit `message.amount` to the account it names.
#[derive(Debug, Clone)]
pub struct ApplyDeposit {
    pub message: DepositMessage,
}

#[async_trait]
impl<S: LedgerSession + 'static> SessionHandler<S> for ApplyDeposit {
    type Output = ApplyOutcome;
    type Error = ApplyError;

    async fn handle(self, session: &mut S) -> Result<ApplyOutcome, ApplyError> {
        let DepositMessage {
            customer_code,
            amount,
            reference,
        } = self.message;

        let Some(mut user) = session.lock_account(&customer_code).await? else {
            return Err(ApplyError::AccountNotFound(customer_code));
        };

        if let Some(reference) = reference {
            let fresh = session
                .record_deposit(NewAppliedDeposit {
                    reference: reference.to_string(),
                    user_id: user.id,
                    amount,
                })
                .await?;
            if !fresh {
                return Ok(ApplyOutcome::Duplicate { reference });
            }
        }

        user.balance += amount;
        let user = session.save_account(user).await?;
        Ok(ApplyOutcome::Credited { user, amount })
    }
}

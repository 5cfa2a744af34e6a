//! In-process account store with transactional sessions.
//!
//! Writes are staged per session and applied on commit. Sessions that lock
//! an account hold a store-wide write lock until they commit, roll back or
//! are dropped, which stands in for Postgres row locks.

use super::{SessionError, SessionSource, UnitOfWork};
use crate::entities::{AppliedDeposit, NewAppliedDeposit, NewUser, User};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<StoreData>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

#[derive(Debug, Default)]
struct StoreData {
    users: HashMap<Uuid, User>,
    applied: HashMap<String, AppliedDeposit>,
}

impl MemoryStore {
    fn data(&self) -> MutexGuard<'_, StoreData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a user with the given opening balance.
    pub fn register(&self, new_user: NewUser, opening_balance: Decimal) -> User {
        let now = time::OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            first_name: new_user.first_name,
            last_name: new_user.last_name,
            email: new_user.email,
            phone_number: new_user.phone_number,
            telegram_id: new_user.telegram_id,
            chat_id: new_user.chat_id,
            customer_code: new_user.customer_code,
            balance: opening_balance.round_dp(2),
            is_active: true,
            created_at: now,
            updated_at: now,
            virtual_account: None,
        };
        self.data().users.insert(user.id, user.clone());
        user
    }

    pub fn user(&self, id: Uuid) -> Option<User> {
        self.data().users.get(&id).cloned()
    }

    pub fn user_by_customer_code(&self, customer_code: &str) -> Option<User> {
        self.data()
            .users
            .values()
            .find(|u| u.customer_code.as_deref() == Some(customer_code))
            .cloned()
    }

    pub fn applied_deposits(&self) -> Vec<AppliedDeposit> {
        self.data().applied.values().cloned().collect()
    }
}

#[derive(Debug)]
pub struct MemorySession {
    store: MemoryStore,
    staged_users: HashMap<Uuid, User>,
    staged_deposits: HashMap<String, AppliedDeposit>,
    write_guard: Option<OwnedMutexGuard<()>>,
    closed: bool,
}

impl MemorySession {
    fn new(store: MemoryStore) -> Self {
        Self {
            store,
            staged_users: HashMap::new(),
            staged_deposits: HashMap::new(),
            write_guard: None,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }

    fn discard(&mut self) {
        self.staged_users.clear();
        self.staged_deposits.clear();
        self.write_guard = None;
    }

    /// Find a user by customer code and hold the write lock until the
    /// session ends.
    pub async fn lock_user_by_customer_code(
        &mut self,
        customer_code: &str,
    ) -> Result<Option<User>, SessionError> {
        self.ensure_open()?;
        if self.write_guard.is_none() {
            self.write_guard = Some(self.store.write_lock.clone().lock_owned().await);
        }
        if let Some(user) = self
            .staged_users
            .values()
            .find(|u| u.customer_code.as_deref() == Some(customer_code))
        {
            return Ok(Some(user.clone()));
        }
        Ok(self.store.user_by_customer_code(customer_code))
    }

    pub fn find_user(&self, id: Uuid) -> Result<Option<User>, SessionError> {
        self.ensure_open()?;
        Ok(self
            .staged_users
            .get(&id)
            .cloned()
            .or_else(|| self.store.user(id)))
    }

    /// Stage an update of an existing user.
    pub fn stage_user(&mut self, mut user: User) -> Result<User, SessionError> {
        self.ensure_open()?;
        if self.find_user(user.id)?.is_none() {
            return Err(SessionError::Database(sqlx::Error::RowNotFound));
        }
        user.balance = user.balance.round_dp(2);
        user.updated_at = time::OffsetDateTime::now_utc();
        self.staged_users.insert(user.id, user.clone());
        Ok(user)
    }

    /// Stage a deposit record; `None` if the reference is already recorded.
    pub fn stage_deposit(
        &mut self,
        deposit: NewAppliedDeposit,
    ) -> Result<Option<AppliedDeposit>, SessionError> {
        self.ensure_open()?;
        let known = self.staged_deposits.contains_key(&deposit.reference)
            || self.store.data().applied.contains_key(&deposit.reference);
        if known {
            return Ok(None);
        }
        let applied = AppliedDeposit {
            reference: deposit.reference,
            user_id: deposit.user_id,
            amount: deposit.amount.round_dp(2),
            applied_at: time::OffsetDateTime::now_utc(),
        };
        self.staged_deposits
            .insert(applied.reference.clone(), applied.clone());
        Ok(Some(applied))
    }
}

#[async_trait]
impl UnitOfWork for MemorySession {
    async fn commit(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        {
            let mut data = self.store.data();
            for (id, user) in self.staged_users.drain() {
                data.users.insert(id, user);
            }
            for (reference, deposit) in self.staged_deposits.drain() {
                data.applied.insert(reference, deposit);
            }
        }
        self.write_guard = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.discard();
        Ok(())
    }

    async fn close(mut self) -> Result<(), SessionError> {
        self.discard();
        self.closed = true;
        Ok(())
    }
}

/// Hands out [`MemorySession`]s; failures can be injected for tests.
pub struct MemorySessionSource {
    store: MemoryStore,
    pending_failures: AtomicU32,
    acquisitions: AtomicU32,
    recoveries: AtomicU32,
}

impl MemorySessionSource {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            pending_failures: AtomicU32::new(0),
            acquisitions: AtomicU32::new(0),
            recoveries: AtomicU32::new(0),
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Make the next `count` acquisitions fail with a connection error.
    pub fn fail_next(&self, count: u32) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Acquisition attempts so far, failed ones included.
    pub fn acquisitions(&self) -> u32 {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn recoveries(&self) -> u32 {
        self.recoveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionSource for MemorySessionSource {
    type Session = MemorySession;

    async fn acquire(&self) -> Result<MemorySession, SessionError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SessionError::Connection(
                "simulated connection failure".to_string(),
            ));
        }
        Ok(MemorySession::new(self.store.clone()))
    }

    async fn recover(&self) -> Result<(), SessionError> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn new_user(code: &str) -> NewUser {
        NewUser {
            first_name: Some("Ada".to_string()),
            last_name: None,
            email: format!("{}@example.com", code.to_lowercase()),
            phone_number: "+2348000000000".to_string(),
            telegram_id: 42,
            chat_id: "42".to_string(),
            customer_code: Some(code.to_string()),
        }
    }

    #[tokio::test]
    async fn test_rollback_discards_staged_writes() {
        let store = MemoryStore::default();
        let user = store.register(new_user("CUS_1"), Decimal::from(100));
        let source = MemorySessionSource::new(store.clone());

        let mut session = source.acquire().await.unwrap();
        let mut locked = session
            .lock_user_by_customer_code("CUS_1")
            .await
            .unwrap()
            .unwrap();
        locked.balance += Decimal::from(50);
        session.stage_user(locked).unwrap();
        assert_eq!(
            session.find_user(user.id).unwrap().unwrap().balance,
            Decimal::from(150)
        );
        session.rollback().await.unwrap();
        session.close().await.unwrap();

        assert_eq!(store.user(user.id).unwrap().balance, Decimal::from(100));
    }

    #[tokio::test]
    async fn test_commit_applies_and_releases_lock() {
        let store = MemoryStore::default();
        let user = store.register(new_user("CUS_1"), Decimal::from_str("10.00").unwrap());
        let source = MemorySessionSource::new(store.clone());

        let mut first = source.acquire().await.unwrap();
        let mut locked = first.lock_user_by_customer_code("CUS_1").await.unwrap().unwrap();
        locked.balance += Decimal::from_str("0.25").unwrap();
        first.stage_user(locked).unwrap();
        first.commit().await.unwrap();

        // the lock is free again
        let mut second = source.acquire().await.unwrap();
        let seen = second.lock_user_by_customer_code("CUS_1").await.unwrap().unwrap();
        assert_eq!(seen.balance, Decimal::from_str("10.25").unwrap());
        second.close().await.unwrap();
        first.close().await.unwrap();
        assert_eq!(store.user(user.id).unwrap().balance, Decimal::from_str("10.25").unwrap());
    }

    #[tokio::test]
    async fn test_deposit_reference_is_recorded_once() {
        let store = MemoryStore::default();
        let user = store.register(new_user("CUS_1"), Decimal::ZERO);
        let source = MemorySessionSource::new(store.clone());
        let deposit = NewAppliedDeposit {
            reference: "T1".to_string(),
            user_id: user.id,
            amount: Decimal::from(5),
        };

        let mut session = source.acquire().await.unwrap();
        assert!(session.stage_deposit(deposit.clone()).unwrap().is_some());
        assert!(session.stage_deposit(deposit.clone()).unwrap().is_none());
        session.commit().await.unwrap();
        session.close().await.unwrap();

        let mut session = source.acquire().await.unwrap();
        assert!(session.stage_deposit(deposit).unwrap().is_none());
        assert_eq!(store.applied_deposits().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_connection_class() {
        let source = MemorySessionSource::new(MemoryStore::default());
        source.fail_next(1);
        assert!(source.acquire().await.unwrap_err().is_connection_class());

        let session = source.acquire().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(source.acquisitions(), 2);
    }
}
